//! 统一错误类型定义.
//!
//! 所有 Tao crate 共用的错误类型, 支持跨模块传播.
//!
//! 与 DPB 调度相关的分类:
//! - `InvalidData`: 码流违反一致性约束, 丢弃当前 slice 后可继续解码
//! - `Unsupported`: 语法合法但刻意不支持的特性, 当前码流应停止解码
//! - `OutOfMemory`: 图像缓冲无法分配, 需调用 `reset()` 恢复
//! - `Internal`: 状态机被错误使用 (例如归还过期的图像句柄)
//!
//! 资源暂时耗尽 (任务槽/图像槽) 不是错误, 以可重试状态返回.

use thiserror::Error;

/// Tao 框架统一错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaoError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    OutOfMemory(String),

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl TaoError {
    /// 错误是否只影响当前 slice (丢弃后可继续解码)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaoError::InvalidData(_))
    }
}

/// Tao 框架统一 Result 类型
pub type TaoResult<T> = Result<T, TaoError>;

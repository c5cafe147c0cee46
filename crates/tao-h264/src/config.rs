//! 解码调度配置.
//!
//! 默认值可被环境变量覆盖:
//! - `TAO_H264_THREADS`: 工作线程数, 0 表示在提交线程内同步执行
//! - `TAO_H264_TASK_SLOTS`: 同时在途的 slice 任务数上限 (1..=32)
//! - `TAO_H264_NON_BLOCKING`: 为 `1`/`true` 时准入点不阻塞, 直接返回可重试状态

use serde::{Deserialize, Serialize};
use tao_core::{TaoError, TaoResult};

/// 任务池容量上限 (任务依赖以 32 位掩码表示)
pub const MAX_TASK_SLOTS: usize = 32;

/// 默认任务池容量
pub const DEFAULT_TASK_SLOTS: usize = 16;

/// 解码调度配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// 工作线程数, 0 = 同步执行
    pub worker_threads: usize,
    /// 任务池容量
    pub task_slots: usize,
    /// 准入点是否以非阻塞方式运行
    pub non_blocking: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            task_slots: DEFAULT_TASK_SLOTS,
            non_blocking: false,
        }
    }
}

impl DecoderConfig {
    /// 以默认值为基础, 应用环境变量覆盖
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 应用环境变量覆盖, 无法解析的值被忽略
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(threads) = std::env::var("TAO_H264_THREADS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.worker_threads = threads;
        }
        if let Some(slots) = std::env::var("TAO_H264_TASK_SLOTS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.task_slots = slots;
        }
        if let Ok(v) = std::env::var("TAO_H264_NON_BLOCKING") {
            self.non_blocking = v == "1" || v.eq_ignore_ascii_case("true");
        }
        self
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> TaoResult<()> {
        if self.task_slots == 0 || self.task_slots > MAX_TASK_SLOTS {
            return Err(TaoError::InvalidArgument(format!(
                "H264: task_slots={} 超出范围 1..={}",
                self.task_slots, MAX_TASK_SLOTS
            )));
        }
        if self.worker_threads > 64 {
            return Err(TaoError::InvalidArgument(format!(
                "H264: worker_threads={} 过大",
                self.worker_threads
            )));
        }
        Ok(())
    }

    /// 按调用方请求与配置得出本次调用的等待方式
    pub(crate) fn effective_mode(&self, requested: WaitMode) -> WaitMode {
        if self.non_blocking {
            WaitMode::NonBlocking
        } else {
            requested
        }
    }
}

/// 准入点等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    /// 资源不足时阻塞等待
    Blocking,
    /// 资源不足时立即返回可重试状态
    NonBlocking,
}

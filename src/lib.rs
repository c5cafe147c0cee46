//! # Tao (道)
//!
//! 纯 Rust 实现的 H.264 解码图像缓冲管理与 slice 任务调度.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use tao::h264::{StreamParams, DecoderState};
//!
//! let dpb = DecoderState::new(StreamParams::new(120, 68, 4)).unwrap();
//! println!("图像槽数量: {}", dpb.slot_count());
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `tao-core` | 统一错误类型 |
//! | `tao-h264` | DPB 管理, 参考标记与列表, 任务调度, 输出排序, 错误恢复 |

/// 统一错误类型
pub use tao_core as core;

/// H.264 DPB 管理与 slice 任务调度
pub use tao_h264 as h264;

/// 获取 Tao 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

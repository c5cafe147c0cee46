//! # tao-h264
//!
//! H.264 解码图像缓冲 (DPB) 管理与并发 slice 任务调度.
//!
//! 本 crate 不解析比特流, 也不做像素计算: 调用方提供已解析的 slice header,
//! 宏块级解码通过 [`MacroblockPipeline`] 接入. 这里负责:
//!
//! - **图像槽**: 固定数量的图像存储与参考/长期参考/待输出/借出位掩码
//! - **参考标记**: IDR, 滑动窗口, MMCO 1..=6, frame_num 间隔补帧
//! - **参考列表**: P/B 初始列表与列表修改
//! - **任务调度**: 有界任务池, 依赖计数, 工作线程
//! - **输出排序**: 按 POC 与水位线输出
//! - **错误恢复**: slice 中途失败时按概率混合回退重建
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tao_h264::{
//!     Decoder, DecoderConfig, MacroblockPipeline, SliceContext, SliceOutcome, StreamParams,
//!     WaitMode,
//! };
//!
//! struct Gray;
//!
//! impl MacroblockPipeline for Gray {
//!     fn decode_slice(&self, ctx: &mut SliceContext<'_>) -> SliceOutcome {
//!         SliceOutcome::complete(ctx.picture.mb_count())
//!     }
//! }
//!
//! let mut decoder = Decoder::new(DecoderConfig::from_env(), Arc::new(Gray)).unwrap();
//! decoder
//!     .configure(StreamParams::new(20, 15, 4), WaitMode::Blocking)
//!     .unwrap();
//! while let Some(frame) = decoder.get_output_frame(true) {
//!     decoder.return_frame(frame).unwrap();
//! }
//! ```

pub mod config;
pub mod dpb;
pub mod header;
pub mod pipeline;
pub mod recovery;
pub mod scheduler;

// 重导出常用类型
pub use config::{DecoderConfig, WaitMode};
pub use dpb::{DecoderState, DpbSnapshot, DpbStats, PictureBuffer, PictureHandle, SlotMask, SlotRef};
pub use header::{
    DeblockParams, DecRefPicMarking, EntropyCoding, MmcoOp, RefPicListMod, SliceHeader, SliceType,
    StreamParams,
};
pub use pipeline::{MacroblockPipeline, MbSamples, ReferencePicture, SliceContext, SliceOutcome};
pub use scheduler::{Decoder, RetryCause, SliceReport, SubmitStatus};

//! 以合成宏块流水线回放脚本, 记录 DPB 状态与输出顺序.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tao_h264::dpb::SlotSnapshot;
use tao_h264::{
    DeblockParams, Decoder, DecoderConfig, DpbStats, MacroblockPipeline, PictureBuffer,
    PictureHandle, RetryCause, SliceContext, SliceOutcome, SubmitStatus, WaitMode,
};
use tracing::{debug, info, warn};

use crate::script::{Script, SliceControl};

/// 同一 slice 的最大重试次数
const MAX_RETRIES: usize = 1000;

/// 任务槽耗尽时的重试间隔
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

// ============================================================
// 合成流水线
// ============================================================

/// 以 FrameNum 填充常量像素的流水线, 按载荷控制项模拟失败
#[derive(Debug, Default)]
pub struct SyntheticPipeline {
    deblocked_mbs: AtomicU64,
}

impl SyntheticPipeline {
    pub fn deblocked_mbs(&self) -> u64 {
        self.deblocked_mbs.load(Ordering::Relaxed)
    }
}

impl MacroblockPipeline for SyntheticPipeline {
    fn decode_slice(&self, ctx: &mut SliceContext<'_>) -> SliceOutcome {
        let control = SliceControl::decode(&ctx.header.payload);
        let total = ctx.picture.mb_count();
        let first = ctx.header.first_mb_in_slice;
        let end = match control.mb_count {
            Some(count) => first.saturating_add(count).min(total),
            None => total,
        };
        let (end, failed) = match control.fail_after {
            Some(n) if first.saturating_add(n) < end => (first + n, true),
            _ => (end, false),
        };
        let luma = (ctx.header.frame_num as u8).wrapping_mul(16).wrapping_add(16);
        for mb in first..end {
            ctx.picture.fill_mb(mb, luma, 128, 128);
        }
        if failed {
            SliceOutcome::failed(end, "合成流水线模拟解码失败")
        } else {
            SliceOutcome::complete(end)
        }
    }

    fn deblock(&self, _picture: &mut PictureBuffer, mbs: std::ops::Range<u32>, _params: &DeblockParams) {
        self.deblocked_mbs
            .fetch_add((mbs.end - mbs.start) as u64, Ordering::Relaxed);
    }
}

// ============================================================
// 回放报告
// ============================================================

/// 一帧输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    pub slot: usize,
    pub frame_num: i32,
    pub pic_order_cnt: i32,
    pub degraded: bool,
}

/// 一个 slice 的处理结果
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub status: String,
    pub retries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotSnapshot>,
}

/// 回放报告
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub config: DecoderConfig,
    pub steps: Vec<StepRecord>,
    pub outputs: Vec<OutputRecord>,
    pub stats: DpbStats,
    pub deblocked_mbs: u64,
}

/// 回放选项
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// 覆盖脚本中的配置
    pub config: Option<DecoderConfig>,
    /// 每个 slice 后记录完整槽位快照
    pub trace: bool,
}

fn record_output(outputs: &mut Vec<OutputRecord>, handle: &PictureHandle) {
    outputs.push(OutputRecord {
        slot: handle.slot.index,
        frame_num: handle.frame_num,
        pic_order_cnt: handle.pic_order_cnt,
        degraded: handle.degraded,
    });
}

/// 取走全部可输出图像并立即归还
fn drain_output(decoder: &mut Decoder, drain: bool, outputs: &mut Vec<OutputRecord>) -> Result<usize> {
    let mut count = 0;
    while let Some(handle) = decoder.get_output_frame(drain) {
        record_output(outputs, &handle);
        decoder.return_frame(handle)?;
        count += 1;
    }
    Ok(count)
}

/// 回放脚本
pub fn run(script: &Script, options: &ReplayOptions) -> Result<Report> {
    let config = options
        .config
        .clone()
        .or_else(|| script.config.clone())
        .unwrap_or_else(DecoderConfig::from_env);
    let pipeline = Arc::new(SyntheticPipeline::default());
    let mut decoder = Decoder::new(config.clone(), pipeline.clone())?;
    info!(
        "回放开始: {} 个 slice, 工作线程 {}",
        script.slices.len(),
        config.worker_threads
    );

    let mut outputs = Vec::new();
    let mut steps = Vec::with_capacity(script.slices.len());
    let mut retries = 0;
    loop {
        match decoder.configure(script.stream.clone(), WaitMode::Blocking)? {
            SubmitStatus::Accepted => break,
            SubmitStatus::Retry(cause) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    bail!("激活码流参数重试次数过多: {:?}", cause);
                }
                drain_output(&mut decoder, true, &mut outputs)?;
            }
        }
    }

    for (index, slice) in script.slices.iter().enumerate() {
        let header = slice.to_header();
        let mut retries = 0;
        let status = loop {
            match decoder.submit_slice(header.clone(), WaitMode::Blocking) {
                Ok(SubmitStatus::Accepted) => break "accepted".to_string(),
                Ok(SubmitStatus::Retry(cause)) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        bail!("slice {} 重试次数过多: {:?}", index, cause);
                    }
                    debug!("slice {} 需要重试: {:?}", index, cause);
                    match cause {
                        RetryCause::OutputPending => {
                            if drain_output(&mut decoder, false, &mut outputs)? == 0 {
                                decoder.flush(WaitMode::Blocking)?;
                                drain_output(&mut decoder, false, &mut outputs)?;
                            }
                        }
                        // 当前图像已结束, 等待在途任务释放槽位
                        RetryCause::PictureSlotBusy => {
                            decoder.flush(WaitMode::Blocking)?;
                        }
                        RetryCause::NoTaskSlot => thread::sleep(RETRY_BACKOFF),
                    }
                }
                Err(err) if err.is_recoverable() => {
                    warn!("slice {} 被丢弃: {}", index, err);
                    break format!("dropped: {}", err);
                }
                Err(err) => return Err(err.into()),
            }
        };
        drain_output(&mut decoder, false, &mut outputs)?;

        let snapshot = decoder.snapshot();
        steps.push(StepRecord {
            index,
            status,
            retries,
            summary: snapshot.as_ref().map(|s| s.summary()),
            slots: match (&snapshot, options.trace) {
                (Some(s), true) => s.slots.clone(),
                _ => Vec::new(),
            },
        });
    }

    drain_output(&mut decoder, true, &mut outputs)?;
    let stats = decoder.stats();
    drop(decoder);
    info!("回放结束: 输出 {} 帧", outputs.len());
    Ok(Report {
        config,
        steps,
        outputs,
        stats,
        deblocked_mbs: pipeline.deblocked_mbs(),
    })
}

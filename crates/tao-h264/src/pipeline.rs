//! 外部宏块解码流水线接口.
//!
//! 熵解码, 像素预测, 残差与去块滤波都在调度器之外实现;
//! 调度器在不持有全局锁的情况下通过 [`MacroblockPipeline`] 调用它们.

use std::ops::Range;

use crate::dpb::{NEUTRAL_SAMPLE, PictureBuffer, SlotRef};
use crate::header::{DeblockParams, SliceHeader};

// ============================================================
// 任务上下文
// ============================================================

/// 参考列表中的一项
#[derive(Debug, Clone, Copy)]
pub struct ReferencePicture<'a> {
    pub slot: SlotRef,
    pub frame_num: i32,
    pub pic_order_cnt: i32,
    pub long_term: bool,
    /// 像素数据; 自引用或 non-existing 帧为 `None`
    pub pixels: Option<&'a PictureBuffer>,
}

/// 一次 slice 解码的上下文
pub struct SliceContext<'a> {
    pub header: &'a SliceHeader,
    pub target: SlotRef,
    /// 目标图像, 本任务独占写入
    pub picture: &'a mut PictureBuffer,
    pub ref_lists: [Vec<ReferencePicture<'a>>; 2],
}

/// slice 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceOutcome {
    /// 已写入宏块的结束地址 (不含)
    pub end_mb: u32,
    /// 解码中途失败的原因
    pub error: Option<String>,
}

impl SliceOutcome {
    pub fn complete(end_mb: u32) -> Self {
        Self {
            end_mb,
            error: None,
        }
    }

    pub fn failed(end_mb: u32, reason: impl Into<String>) -> Self {
        Self {
            end_mb,
            error: Some(reason.into()),
        }
    }
}

// ============================================================
// 宏块采样
// ============================================================

/// 一个宏块的 4:2:0 采样
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbSamples {
    pub y: [u8; 256],
    pub cb: [u8; 64],
    pub cr: [u8; 64],
}

impl MbSamples {
    pub fn uniform(y: u8, cb: u8, cr: u8) -> Self {
        Self {
            y: [y; 256],
            cb: [cb; 64],
            cr: [cr; 64],
        }
    }

    /// 读取图像中的一个宏块
    pub fn read(picture: &PictureBuffer, mb_addr: u32) -> Self {
        let (mbx, mby) = picture.mb_position(mb_addr);
        let stride_y = picture.stride_y();
        let stride_c = picture.stride_c();
        let mut samples = Self::uniform(0, 0, 0);
        for row in 0..16 {
            let src = (mby * 16 + row) * stride_y + mbx * 16;
            samples.y[row * 16..row * 16 + 16].copy_from_slice(&picture.luma[src..src + 16]);
        }
        for row in 0..8 {
            let src = (mby * 8 + row) * stride_c + mbx * 8;
            samples.cb[row * 8..row * 8 + 8].copy_from_slice(&picture.cb[src..src + 8]);
            samples.cr[row * 8..row * 8 + 8].copy_from_slice(&picture.cr[src..src + 8]);
        }
        samples
    }

    /// 写回图像
    pub fn write(&self, picture: &mut PictureBuffer, mb_addr: u32) {
        let (mbx, mby) = picture.mb_position(mb_addr);
        let stride_y = picture.stride_y();
        let stride_c = picture.stride_c();
        for row in 0..16 {
            let dst = (mby * 16 + row) * stride_y + mbx * 16;
            picture.luma[dst..dst + 16].copy_from_slice(&self.y[row * 16..row * 16 + 16]);
        }
        for row in 0..8 {
            let dst = (mby * 8 + row) * stride_c + mbx * 8;
            picture.cb[dst..dst + 8].copy_from_slice(&self.cb[row * 8..row * 8 + 8]);
            picture.cr[dst..dst + 8].copy_from_slice(&self.cr[row * 8..row * 8 + 8]);
        }
    }

    /// DC 帧内预测: 上方一行与左侧一列的均值, 都不可用时为 128
    pub fn dc_predict(picture: &PictureBuffer, mb_addr: u32) -> Self {
        let (mbx, mby) = picture.mb_position(mb_addr);
        let y = dc_value(&picture.luma, picture.stride_y(), mbx, mby, 16);
        let cb = dc_value(&picture.cb, picture.stride_c(), mbx, mby, 8);
        let cr = dc_value(&picture.cr, picture.stride_c(), mbx, mby, 8);
        Self::uniform(y, cb, cr)
    }
}

fn dc_value(plane: &[u8], stride: usize, mbx: usize, mby: usize, size: usize) -> u8 {
    let x0 = mbx * size;
    let y0 = mby * size;
    let mut sum = 0u32;
    let mut count = 0u32;
    if y0 > 0 {
        let row = (y0 - 1) * stride + x0;
        sum += plane[row..row + size].iter().map(|&v| v as u32).sum::<u32>();
        count += size as u32;
    }
    if x0 > 0 {
        for dy in 0..size {
            sum += plane[(y0 + dy) * stride + x0 - 1] as u32;
        }
        count += size as u32;
    }
    if count == 0 {
        NEUTRAL_SAMPLE
    } else {
        ((sum + count / 2) / count) as u8
    }
}

// ============================================================
// 流水线接口
// ============================================================

/// 外部宏块解码流水线
///
/// `decode_slice` 与 `predict_skip` 在工作线程上调用, 调用期间不持有调度器锁.
/// 图像带缺口完成时, 缺口之后区间的 `deblock` 在调度器锁内执行, 实现中不得回调 `Decoder`.
pub trait MacroblockPipeline: Send + Sync {
    /// 从 `first_mb_in_slice` 起解码一个 slice, 返回写入的宏块区间结束位置
    fn decode_slice(&self, ctx: &mut SliceContext<'_>) -> SliceOutcome;

    /// 对一段已连续解码的宏块执行去块滤波
    fn deblock(&self, _picture: &mut PictureBuffer, _mbs: Range<u32>, _params: &DeblockParams) {}

    /// 帧间跳过预测, 用于错误恢复; 默认复制 list0[0] 的同位宏块
    fn predict_skip(&self, refs: &[ReferencePicture<'_>], mb_addr: u32) -> Option<MbSamples> {
        let pixels = refs.first()?.pixels?;
        if mb_addr >= pixels.mb_count() {
            return None;
        }
        Some(MbSamples::read(pixels, mb_addr))
    }
}

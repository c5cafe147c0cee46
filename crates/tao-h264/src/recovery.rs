//! slice 解码失败后的概率错误恢复.
//!
//! 已解码的宏块按距失败点的远近赋予出错概率, 再按该概率向回退重建混合:
//! I slice 回退到 DC 帧内预测, P/B slice 回退到流水线提供的跳过预测.

use std::ops::Range;

use log::debug;

use crate::dpb::PictureBuffer;
use crate::header::EntropyCoding;
use crate::pipeline::{MacroblockPipeline, MbSamples, SliceContext};

/// 16 位定点的 1.0
const FIXED_ONE: u64 = 65536;

/// CABAC 每个宏块的存活概率 (1 - 2/383)
const CABAC_SURVIVAL: u32 = 65194;

/// 概率满量程 (100% = 12800)
const FULL_SCALE: u64 = 12800;

/// 16 位定点幂
fn ppow(base: u32, mut exp: u32) -> u32 {
    let mut result = FIXED_ONE;
    let mut base = base as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result * base) >> 16;
        }
        base = (base * base) >> 16;
        exp >>= 1;
    }
    result as u32
}

/// 计算 `num` 个已解码宏块的出错概率 (满量程 12800), 下标越大越靠近失败点
pub fn error_probabilities(coding: EntropyCoding, num: u32) -> Vec<u32> {
    let n = num as u64;
    match coding {
        EntropyCoding::Cavlc => (0..n)
            .map(|i| (((i + 1) * FULL_SCALE + n - 1) / n) as u32)
            .collect(),
        EntropyCoding::Cabac => {
            let floor = ppow(CABAC_SURVIVAL, num) as u64;
            let div = FIXED_ONE - floor;
            if div == 0 {
                return vec![FULL_SCALE as u32; num as usize];
            }
            (0..num)
                .map(|i| {
                    let above = (ppow(CABAC_SURVIVAL, num - 1 - i) as u64).saturating_sub(floor);
                    ((above * FULL_SCALE + div - 1) / div).min(FULL_SCALE) as u32
                })
                .collect()
        }
    }
}

fn blend(pixels: &mut [u8], fallback: &[u8], weight: u32) {
    for (pix, &fb) in pixels.iter_mut().zip(fallback) {
        *pix = ((*pix as u32 * (128 - weight) + fb as u32 * weight + 64) >> 7) as u8;
    }
}

fn blend_mb(picture: &mut PictureBuffer, mb_addr: u32, fallback: &MbSamples, p12800: u32) {
    let weight = (p12800 / 100).min(128);
    let mut samples = MbSamples::read(picture, mb_addr);
    blend(&mut samples.y, &fallback.y, weight);
    blend(&mut samples.cb, &fallback.cb, weight);
    blend(&mut samples.cr, &fallback.cr, weight);
    samples.write(picture, mb_addr);
    let meta = &mut picture.mb_meta[mb_addr as usize];
    meta.error_probability = meta.error_probability.max((p12800 >> 7).min(100) as u8);
}

/// 对失败 slice 已解码的区间执行错误恢复
pub fn recover_slice(
    pipeline: &dyn MacroblockPipeline,
    ctx: &mut SliceContext<'_>,
    decoded: Range<u32>,
) {
    let total = ctx.picture.mb_count();
    let end = decoded.end.min(total);
    if decoded.start >= end {
        return;
    }
    let num = end - decoded.start;
    let probabilities = error_probabilities(ctx.header.entropy_coding, num);
    let intra = ctx.header.slice_type.is_intra();
    for (offset, &p) in probabilities.iter().enumerate() {
        let mb_addr = decoded.start + offset as u32;
        let fallback = if intra {
            None
        } else {
            pipeline.predict_skip(&ctx.ref_lists[0], mb_addr)
        };
        let fallback = fallback.unwrap_or_else(|| MbSamples::dc_predict(&*ctx.picture, mb_addr));
        blend_mb(&mut *ctx.picture, mb_addr, &fallback, p);
    }
    debug!(
        "H264: slice 错误恢复, 宏块 {}..{}, {:?}",
        decoded.start, end, ctx.header.entropy_coding
    );
}

/// 以 DC 预测完全替换一段未解码宏块 (出错概率 100%)
pub fn conceal_range(picture: &mut PictureBuffer, range: Range<u32>) {
    let end = range.end.min(picture.mb_count());
    for mb_addr in range.start..end {
        let fallback = MbSamples::dc_predict(picture, mb_addr);
        fallback.write(picture, mb_addr);
        picture.mb_meta[mb_addr as usize].error_probability = 100;
    }
}

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tao_core::{TaoError, TaoResult};

use crate::header::DeblockParams;

/// 中性灰, 未解码像素的初始值
pub const NEUTRAL_SAMPLE: u8 = 128;

// ============================================================
// 像素平面与宏块元数据
// ============================================================

/// 单个宏块的解码元数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbMeta {
    /// 出错概率 (0..=100), 0 表示正常解码
    pub error_probability: u8,
    /// 是否已被某个 slice 写入
    pub decoded: bool,
}

/// 一帧 4:2:0 8bit 图像的像素存储
#[derive(Debug, Clone)]
pub struct PictureBuffer {
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub luma: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
    pub mb_meta: Vec<MbMeta>,
}

fn try_alloc_plane(len: usize, what: &str) -> TaoResult<Vec<u8>> {
    let mut plane = Vec::new();
    plane.try_reserve_exact(len).map_err(|e| {
        TaoError::OutOfMemory(format!("H264: 分配{}平面失败, len={}, {}", what, len, e))
    })?;
    plane.resize(len, NEUTRAL_SAMPLE);
    Ok(plane)
}

impl PictureBuffer {
    /// 分配指定尺寸的图像, 内存不足时返回 `OutOfMemory`
    pub fn allocate(width_in_mbs: u32, height_in_mbs: u32) -> TaoResult<Self> {
        let mbs = (width_in_mbs * height_in_mbs) as usize;
        let luma = try_alloc_plane(mbs * 256, "亮度")?;
        let cb = try_alloc_plane(mbs * 64, "Cb")?;
        let cr = try_alloc_plane(mbs * 64, "Cr")?;
        let mut mb_meta = Vec::new();
        mb_meta.try_reserve_exact(mbs).map_err(|e| {
            TaoError::OutOfMemory(format!("H264: 分配宏块元数据失败, mbs={}, {}", mbs, e))
        })?;
        mb_meta.resize(mbs, MbMeta::default());
        Ok(Self {
            width_in_mbs,
            height_in_mbs,
            luma,
            cb,
            cr,
            mb_meta,
        })
    }

    pub fn stride_y(&self) -> usize {
        self.width_in_mbs as usize * 16
    }

    pub fn stride_c(&self) -> usize {
        self.width_in_mbs as usize * 8
    }

    pub fn mb_count(&self) -> u32 {
        self.width_in_mbs * self.height_in_mbs
    }

    /// 宏块地址转换为 (mbx, mby)
    pub fn mb_position(&self, mb_addr: u32) -> (usize, usize) {
        (
            (mb_addr % self.width_in_mbs) as usize,
            (mb_addr / self.width_in_mbs) as usize,
        )
    }

    /// 图像槽复用前清空宏块元数据
    pub fn reset_metadata(&mut self) {
        self.mb_meta.fill(MbMeta::default());
    }

    /// 以常量填充一个宏块 (测试与回退重建使用)
    pub fn fill_mb(&mut self, mb_addr: u32, y: u8, cb: u8, cr: u8) {
        let (mbx, mby) = self.mb_position(mb_addr);
        let stride_y = self.stride_y();
        let stride_c = self.stride_c();
        for row in 0..16 {
            let start = (mby * 16 + row) * stride_y + mbx * 16;
            self.luma[start..start + 16].fill(y);
        }
        for row in 0..8 {
            let start = (mby * 8 + row) * stride_c + mbx * 8;
            self.cb[start..start + 8].fill(cb);
            self.cr[start..start + 8].fill(cr);
        }
    }

    /// 读取宏块左上角亮度采样
    pub fn mb_luma_sample(&self, mb_addr: u32, x: usize, y: usize) -> u8 {
        let (mbx, mby) = self.mb_position(mb_addr);
        self.luma[(mby * 16 + y) * self.stride_y() + mbx * 16 + x]
    }

    /// 标记一段宏块已被写入
    pub fn mark_decoded(&mut self, range: Range<u32>) {
        let end = (range.end as usize).min(self.mb_meta.len());
        for meta in &mut self.mb_meta[(range.start as usize).min(end)..end] {
            meta.decoded = true;
        }
    }
}

// ============================================================
// 槽位引用与句柄
// ============================================================

/// 携带代数的槽位引用, 槽位复用后旧引用失效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotRef {
    pub index: usize,
    pub generation: u32,
}

/// 共享的图像存储
pub type SharedPicture = Arc<RwLock<PictureBuffer>>;

pub(crate) fn read_picture(picture: &SharedPicture) -> RwLockReadGuard<'_, PictureBuffer> {
    match picture.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_picture(picture: &SharedPicture) -> RwLockWriteGuard<'_, PictureBuffer> {
    match picture.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 交给调用方的输出图像, 使用完毕后须通过 `return_frame` 归还
#[derive(Debug)]
pub struct PictureHandle {
    pub slot: SlotRef,
    pub pic_order_cnt: i32,
    pub frame_num: i32,
    /// 图像包含经错误恢复重建的宏块
    pub degraded: bool,
    picture: SharedPicture,
}

impl PictureHandle {
    pub(crate) fn new(
        slot: SlotRef,
        pic_order_cnt: i32,
        frame_num: i32,
        degraded: bool,
        picture: SharedPicture,
    ) -> Self {
        Self {
            slot,
            pic_order_cnt,
            frame_num,
            degraded,
            picture,
        }
    }

    /// 读取像素数据
    pub fn pixels(&self) -> RwLockReadGuard<'_, PictureBuffer> {
        read_picture(&self.picture)
    }
}

// ============================================================
// 图像槽
// ============================================================

/// 已解码的宏块区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedSpan {
    pub end: u32,
    pub deblock: DeblockParams,
}

/// DPB 中的一个图像槽
#[derive(Debug, Default)]
pub(crate) struct PictureSlot {
    pub generation: u32,
    pub storage: Option<SharedPicture>,
    /// 展开后的 FrameNum (两个 IDR 之间单调)
    pub frame_num: i32,
    pub field_order_cnt: [i32; 2],
    pub remaining_mbs: u32,
    pub next_deblock_addr: u32,
    /// 起始地址 -> 已解码区间
    pub decoded: BTreeMap<u32, DecodedSpan>,
    pub complete: bool,
    pub degraded: bool,
    pub non_existing: bool,
    /// 已不再是当前图像 (不会再接收新的 slice)
    pub finished: bool,
    pub tasks_in_flight: u32,
    /// 本槽位是否自上次复位后被使用过
    pub touched: bool,
}

impl PictureSlot {
    pub fn pic_order_cnt(&self) -> i32 {
        self.field_order_cnt[0].min(self.field_order_cnt[1])
    }

    pub fn slot_ref(&self, index: usize) -> SlotRef {
        SlotRef {
            index,
            generation: self.generation,
        }
    }

    /// 复用槽位: 代数加一并清空进度
    pub fn recycle(&mut self, frame_num: i32, field_order_cnt: [i32; 2]) {
        self.generation = self.generation.wrapping_add(1);
        self.frame_num = frame_num;
        self.field_order_cnt = field_order_cnt;
        self.remaining_mbs = 0;
        self.next_deblock_addr = 0;
        self.decoded.clear();
        self.complete = false;
        self.degraded = false;
        self.non_existing = false;
        self.finished = false;
        self.tasks_in_flight = 0;
        self.touched = true;
    }

    /// 记录一段已解码区间, 返回新增的连续可去块区间
    ///
    /// 连续前缀从地址 0 开始, `next_deblock_addr` 只增不减.
    pub fn record_decoded(
        &mut self,
        range: Range<u32>,
        deblock: DeblockParams,
    ) -> Vec<(Range<u32>, DeblockParams)> {
        if range.end > range.start {
            self.decoded.insert(
                range.start,
                DecodedSpan {
                    end: range.end,
                    deblock,
                },
            );
        }
        let mut claimed = Vec::new();
        while let Some(span) = self.covering_span(self.next_deblock_addr) {
            claimed.push((self.next_deblock_addr..span.end, span.deblock));
            self.next_deblock_addr = span.end;
        }
        claimed
    }

    fn covering_span(&self, addr: u32) -> Option<DecodedSpan> {
        self.decoded
            .range(..=addr)
            .rev()
            .map(|(_, span)| *span)
            .find(|span| span.end > addr)
    }

    /// 图像完成时跳过未解码的缺口, 领取其后全部已解码区间
    ///
    /// 返回后 `next_deblock_addr` 等于 `total_mbs`.
    pub fn claim_after_gaps(&mut self, total_mbs: u32) -> Vec<(Range<u32>, DeblockParams)> {
        let mut claimed = Vec::new();
        let mut cursor = self.next_deblock_addr;
        for (&start, span) in &self.decoded {
            let begin = start.max(cursor);
            let end = span.end.min(total_mbs);
            if end > begin {
                claimed.push((begin..end, span.deblock));
                cursor = end;
            }
        }
        self.next_deblock_addr = total_mbs;
        claimed
    }

    /// 未被任何 slice 覆盖的宏块区间
    pub fn missing_ranges(&self, total_mbs: u32) -> Vec<Range<u32>> {
        let mut missing = Vec::new();
        let mut cursor = 0u32;
        for (&start, span) in &self.decoded {
            if start > cursor {
                missing.push(cursor..start.min(total_mbs));
            }
            cursor = cursor.max(span.end);
        }
        if cursor < total_mbs {
            missing.push(cursor..total_mbs);
        }
        missing
    }
}

//! 解码图像缓冲 (DPB) 状态.
//!
//! 固定数量的图像槽, 以及参考/长期参考/待输出/借出四组槽位掩码.
//! 本模块只维护状态与 8.2 节的推导规则, 不涉及线程同步;
//! 调用方 (调度器) 持有唯一的互斥锁后再调用这里的方法.

mod flags;
mod marking;
mod output;
mod picture;
mod poc;
mod pool;
mod ref_list;

pub use flags::{MAX_SLOTS, RefFlags, SlotIter, SlotMask, SlotStatus};
pub use picture::{MbMeta, NEUTRAL_SAMPLE, PictureBuffer, PictureHandle, SharedPicture, SlotRef};
pub(crate) use picture::{DecodedSpan, PictureSlot, read_picture, write_picture};
pub use pool::GapFill;
pub use ref_list::RefListPlan;

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use tao_core::{TaoError, TaoResult};

use crate::header::{
    MAX_ABS_PIC_ORDER_CNT, MmcoOp, RefPicListMod, SliceHeader, SliceType, StreamParams,
};
use crate::pipeline::MacroblockPipeline;

/// 输出水位线的初始值 (也是 IDR 之后的值)
pub const DISP_POC_RESET: i32 = -(1 << 25);

/// IDR 之前尚未输出的图像整体下移的 POC 偏移
const PENDING_OUTPUT_POC_SHIFT: i32 = 1 << 26;

// ============================================================
// 准入结果
// ============================================================

/// 准入操作的结果: 完成, 或需要等待某种资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    Ready(T),
    /// 候选槽位仍被在途任务依赖, 需等待任务完成
    WaitForTasks,
    /// 需调用方先取走/归还输出图像
    NeedOutput,
}

// ============================================================
// 当前图像
// ============================================================

/// 正在接收 slice 的图像
#[derive(Debug, Clone)]
pub(crate) struct CurrentPicture {
    pub slot: usize,
    pub frame_num: u32,
    pub unwrapped_frame_num: i32,
    pub idr_pic_id: u32,
    pub is_idr: bool,
    pub is_reference: bool,
    /// MMCO5 之前的 Top/Bottom POC, 用于新图像判定
    pub field_order_cnt: [i32; 2],
    /// 本图像标记过程产生的参考集合, 图像结束时提交
    pub marking: Option<RefFlags>,
    pub mmco5: bool,
}

// ============================================================
// 统计与快照
// ============================================================

/// DPB 运行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DpbStats {
    pub pictures: u64,
    pub non_existing_frames: u64,
    pub dropped_slices: u64,
    pub recovered_slices: u64,
    pub concealed_pictures: u64,
    pub output_frames: u64,
}

/// 单个槽位的解码进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotProgress {
    pub remaining_mbs: u32,
    pub next_deblock_addr: u32,
    pub tasks_in_flight: u32,
    pub complete: bool,
}

/// 单个槽位的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub generation: u32,
    pub frame_num: i32,
    pub long_term_frame_idx: Option<u32>,
    pub pic_order_cnt: i32,
    pub status: SlotStatus,
    pub remaining_mbs: u32,
    pub next_deblock_addr: u32,
}

/// DPB 整体快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DpbSnapshot {
    pub slots: Vec<SlotSnapshot>,
    pub disp_pic_order_cnt: i32,
    pub current: Option<usize>,
    pub prev_ref_frame_num: i32,
    pub stats: DpbStats,
}

impl DpbSnapshot {
    /// 参考帧的槽位集合
    pub fn reference_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.status.contains(SlotStatus::REFERENCE))
            .map(|s| s.index)
            .collect()
    }

    /// 待输出的槽位集合
    pub fn output_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.status.contains(SlotStatus::OUTPUT))
            .map(|s| s.index)
            .collect()
    }

    /// 按槽位顺序给出 `FrameNum/POC` 概要, 空槽位为 `_`
    pub fn summary(&self) -> String {
        self.slots
            .iter()
            .map(|s| {
                if s.status.intersects(SlotStatus::REFERENCE | SlotStatus::OUTPUT | SlotStatus::CURRENT) {
                    let mark = if s.status.contains(SlotStatus::LONG_TERM) {
                        "L"
                    } else {
                        ""
                    };
                    format!("{}{}/{}", mark, s.frame_num, s.pic_order_cnt)
                } else {
                    "_".to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============================================================
// DPB 状态
// ============================================================

/// DPB 状态, 生命周期为一个码流
pub struct DecoderState {
    pub(crate) params: StreamParams,
    pub(crate) slots: Vec<PictureSlot>,
    /// 已提交的参考标记
    pub(crate) refs: RefFlags,
    pub(crate) output: SlotMask,
    pub(crate) borrowed: SlotMask,
    /// 输出水位线, 不大于该值的待输出图像可以安全输出
    pub(crate) disp_pic_order_cnt: i32,
    pub(crate) current: Option<CurrentPicture>,
    pub(crate) prev_ref_frame_num: i32,
    pub(crate) prev_pic_order_cnt: i32,
    pub(crate) stats: DpbStats,
    dropped_slice_warnings: u32,
    /// 图像完成时为缺口之后的区间补做去块
    deblocker: Option<Arc<dyn MacroblockPipeline>>,
}

impl DecoderState {
    /// 按码流参数创建 DPB (图像存储延迟分配)
    pub fn new(params: StreamParams) -> TaoResult<Self> {
        params.validate()?;
        let params = params.normalized();
        let count = params.num_frame_buffers();
        if count > MAX_SLOTS {
            return Err(TaoError::InvalidData(format!(
                "H264: 图像槽数量 {} 超过上限 {}",
                count, MAX_SLOTS
            )));
        }
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, PictureSlot::default);
        debug!(
            "H264: DPB 已创建, {}x{} 宏块, {} 个图像槽, max_num_ref_frames={}, max_num_reorder_frames={}",
            params.width_in_mbs,
            params.height_in_mbs,
            count,
            params.max_num_ref_frames,
            params.max_num_reorder_frames
        );
        Ok(Self {
            params,
            slots,
            refs: RefFlags::default(),
            output: SlotMask::EMPTY,
            borrowed: SlotMask::EMPTY,
            disp_pic_order_cnt: DISP_POC_RESET,
            current: None,
            prev_ref_frame_num: 0,
            prev_pic_order_cnt: 0,
            stats: DpbStats::default(),
            dropped_slice_warnings: 0,
            deblocker: None,
        })
    }

    /// 设置完成图像时补做去块所用的宏块流水线
    pub fn with_deblocker(mut self, deblocker: Arc<dyn MacroblockPipeline>) -> Self {
        self.deblocker = Some(deblocker);
        self
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn all_slots(&self) -> SlotMask {
        SlotMask::full(self.slots.len())
    }

    pub fn reference_mask(&self) -> SlotMask {
        self.refs.reference()
    }

    pub fn long_term_mask(&self) -> SlotMask {
        self.refs.long_term()
    }

    pub fn output_mask(&self) -> SlotMask {
        self.output
    }

    pub fn borrowed_mask(&self) -> SlotMask {
        self.borrowed
    }

    pub fn disp_pic_order_cnt(&self) -> i32 {
        self.disp_pic_order_cnt
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current.as_ref().map(|c| c.slot)
    }

    pub(crate) fn current_picture(&self) -> Option<&CurrentPicture> {
        self.current.as_ref()
    }

    /// 槽位的解码进度
    pub fn progress_of(&self, index: usize) -> SlotProgress {
        let slot = &self.slots[index];
        SlotProgress {
            remaining_mbs: slot.remaining_mbs,
            next_deblock_addr: slot.next_deblock_addr,
            tasks_in_flight: slot.tasks_in_flight,
            complete: slot.touched && slot.complete,
        }
    }

    pub fn stats(&self) -> &DpbStats {
        &self.stats
    }

    pub fn frame_num_of(&self, index: usize) -> i32 {
        self.slots[index].frame_num
    }

    pub fn pic_order_cnt_of(&self, index: usize) -> i32 {
        self.slots[index].pic_order_cnt()
    }

    pub(crate) fn storage_of(&self, index: usize) -> Option<SharedPicture> {
        self.slots[index].storage.clone()
    }

    pub fn is_non_existing(&self, index: usize) -> bool {
        self.slots[index].non_existing
    }

    /// 尚未完成解码的槽位
    pub fn incomplete_mask(&self) -> SlotMask {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.touched && !s.complete)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn slot_ref(&self, index: usize) -> SlotRef {
        self.slots[index].slot_ref(index)
    }

    /// 校验槽位引用的代数, 过期引用属于编程错误
    pub fn check_slot_ref(&self, slot: SlotRef) -> TaoResult<()> {
        match self.slots.get(slot.index) {
            Some(s) if s.generation == slot.generation => Ok(()),
            Some(s) => Err(TaoError::Internal(format!(
                "H264: 槽位 {} 引用已过期, 持有代数 {}, 当前代数 {}",
                slot.index, slot.generation, s.generation
            ))),
            None => Err(TaoError::Internal(format!(
                "H264: 槽位索引 {} 越界",
                slot.index
            ))),
        }
    }

    pub(crate) fn note_dropped_slice(&mut self, err: &TaoError) {
        self.stats.dropped_slices += 1;
        self.dropped_slice_warnings = self.dropped_slice_warnings.saturating_add(1);
        if self.dropped_slice_warnings <= 8 {
            warn!("H264: 丢弃 slice, {}", err);
        } else if self.dropped_slice_warnings == 9 {
            warn!("H264: 丢弃 slice 日志过多, 后续同类日志省略");
        }
    }

    /// 生成当前状态的快照
    pub fn snapshot(&self) -> DpbSnapshot {
        let current = self.current_slot();
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut status = SlotStatus::empty();
                status.set(SlotStatus::REFERENCE, self.refs.is_reference(i));
                status.set(SlotStatus::LONG_TERM, self.refs.is_long_term(i));
                status.set(SlotStatus::OUTPUT, self.output.contains(i));
                status.set(SlotStatus::BORROWED, self.borrowed.contains(i));
                status.set(SlotStatus::CURRENT, current == Some(i));
                status.set(SlotStatus::COMPLETE, s.touched && s.complete);
                status.set(SlotStatus::NON_EXISTING, s.non_existing);
                status.set(SlotStatus::DEGRADED, s.degraded);
                SlotSnapshot {
                    index: i,
                    generation: s.generation,
                    frame_num: s.frame_num,
                    long_term_frame_idx: self.refs.long_term_frame_idx(i),
                    pic_order_cnt: s.pic_order_cnt(),
                    status,
                    remaining_mbs: s.remaining_mbs,
                    next_deblock_addr: s.next_deblock_addr,
                }
            })
            .collect();
        DpbSnapshot {
            slots,
            disp_pic_order_cnt: self.disp_pic_order_cnt,
            current,
            prev_ref_frame_num: self.prev_ref_frame_num,
            stats: self.stats.clone(),
        }
    }
}

use std::ops::Range;
use std::sync::{Arc, RwLock};

use super::*;
use crate::header::DeblockParams;
use crate::recovery;

// ============================================================
// 图像槽分配与生命周期
// ============================================================

/// 帧号间隔补帧的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapFill {
    /// 第一个缺失帧的 FrameNum
    pub first_frame_num: i32,
    /// 缺失帧数量 (gap - 1)
    pub count: u32,
    /// 实际占用槽位的补帧 (FrameNum 递增)
    pub inserted: Vec<SlotRef>,
}

impl DecoderState {
    /// 空闲槽位: 非参考, 非待输出, 非借出, 非当前图像
    pub fn free_mask(&self) -> SlotMask {
        let mut free = self.all_slots() - self.refs.reference() - self.output - self.borrowed;
        if let Some(cur) = self.current_slot() {
            free.remove(cur);
        }
        free
    }

    /// 为新图像选择槽位
    ///
    /// `depended` 为在途任务仍在读写的槽位. 有空闲且无依赖的槽位时返回索引最小者;
    /// 空闲槽位都被依赖时需等待任务完成; 没有空闲槽位时提升输出水位线,
    /// 由调用方先取走输出图像.
    pub(crate) fn acquire_slot(&mut self, depended: SlotMask) -> Admission<usize> {
        let free = self.free_mask();
        if let Some(index) = (free - depended).first() {
            return Admission::Ready(index);
        }
        if !free.is_empty() {
            return Admission::WaitForTasks;
        }
        if let Some(poc) = self.nth_releasable_output_poc(self.output, 1) {
            if poc > self.disp_pic_order_cnt {
                debug!(
                    "H264: 无空闲图像槽, 水位线 {} -> {}",
                    self.disp_pic_order_cnt, poc
                );
                self.disp_pic_order_cnt = poc;
            }
        }
        Admission::NeedOutput
    }

    /// 在选中的槽位上开始新图像
    ///
    /// 存储按需分配, 分配失败返回 `OutOfMemory`.
    pub(crate) fn begin_picture(
        &mut self,
        index: usize,
        header: &SliceHeader,
        frame_num: i32,
        field_order_cnt: [i32; 2],
    ) -> TaoResult<()> {
        let width = self.params.width_in_mbs;
        let height = self.params.height_in_mbs;
        let reuse = match &self.slots[index].storage {
            Some(picture) => {
                let buffer = read_picture(picture);
                buffer.width_in_mbs == width && buffer.height_in_mbs == height
            }
            None => false,
        };
        if reuse {
            if let Some(picture) = &self.slots[index].storage {
                write_picture(picture).reset_metadata();
            }
        } else {
            let buffer = PictureBuffer::allocate(width, height)?;
            self.slots[index].storage = Some(Arc::new(RwLock::new(buffer)));
        }

        let mbs = self.params.mbs_per_picture();
        let slot = &mut self.slots[index];
        slot.recycle(frame_num, field_order_cnt);
        slot.remaining_mbs = mbs;
        self.current = Some(CurrentPicture {
            slot: index,
            frame_num: header.frame_num,
            unwrapped_frame_num: frame_num,
            idr_pic_id: header.idr_pic_id,
            is_idr: header.is_idr(),
            is_reference: header.is_reference(),
            field_order_cnt,
            marking: None,
            mmco5: false,
        });
        self.stats.pictures += 1;
        debug!(
            "H264: 新图像 slot={}, frame_num={}, poc={}, idr={}, ref={}",
            index,
            frame_num,
            self.slots[index].pic_order_cnt(),
            header.is_idr(),
            header.is_reference()
        );
        Ok(())
    }

    // ============================================================
    // 帧号间隔
    // ============================================================

    /// 相对上一参考帧的 FrameNum 间隔
    pub fn frame_num_gap(&self, frame_num: i32) -> i32 {
        frame_num - self.prev_ref_frame_num
    }

    /// 为缺失的 FrameNum 合成 non-existing 帧
    ///
    /// 只保留滑动窗口之后仍能存活的补帧, 其余只计数不占槽位.
    pub(crate) fn fill_frame_num_gap(
        &mut self,
        frame_num: i32,
        depended: SlotMask,
    ) -> Admission<GapFill> {
        let gap = self.frame_num_gap(frame_num);
        if gap <= 1 {
            return Admission::Ready(GapFill::default());
        }
        let missing = (gap - 1) as u32;
        let max_refs = self.params.max_num_ref_frames as usize;
        let capacity = max_refs.saturating_sub(self.refs.long_term().count());
        let retained = (missing as usize).min(capacity);

        // 先在副本上腾出参考位
        let mut refs = self.refs.clone();
        let short = refs.short_term();
        let evict = (short.count() + retained).saturating_sub(capacity);
        let mut oldest: Vec<usize> = short.iter().collect();
        oldest.sort_by_key(|&i| (self.slots[i].frame_num, i));
        for &i in oldest.iter().take(evict) {
            refs.unmark(i);
        }

        let mut free = self.all_slots() - refs.reference() - self.output - self.borrowed;
        if let Some(cur) = self.current_slot() {
            free.remove(cur);
        }
        let ready = free - depended;
        if ready.count() < retained {
            if free.count() >= retained {
                return Admission::WaitForTasks;
            }
            let shortage = retained - free.count();
            if let Some(poc) = self.nth_releasable_output_poc(self.output, shortage) {
                if poc > self.disp_pic_order_cnt {
                    debug!(
                        "H264: 补帧缺少 {} 个槽位, 水位线 {} -> {}",
                        shortage, self.disp_pic_order_cnt, poc
                    );
                    self.disp_pic_order_cnt = poc;
                }
            }
            return Admission::NeedOutput;
        }

        let first = frame_num - retained as i32;
        let mut inserted = Vec::with_capacity(retained);
        for (k, index) in ready.iter().take(retained).enumerate() {
            let fnum = first + k as i32;
            let poc = self.non_existing_pic_order_cnt(fnum);
            let slot = &mut self.slots[index];
            slot.recycle(fnum, [poc, poc]);
            slot.non_existing = true;
            slot.finished = true;
            slot.complete = true;
            refs.mark_short(index);
            inserted.push(slot.slot_ref(index));
        }
        debug_assert!(refs.count() <= max_refs);
        self.refs = refs;
        self.prev_ref_frame_num = frame_num - 1;
        self.stats.non_existing_frames += missing as u64;
        warn!(
            "H264: frame_num 间隔 {}, 合成 {} 个 non-existing 帧 (占用槽位 {})",
            gap,
            missing,
            inserted.len()
        );
        Admission::Ready(GapFill {
            first_frame_num: frame_num - missing as i32,
            count: missing,
            inserted,
        })
    }

    // ============================================================
    // 解码进度与图像完成
    // ============================================================

    /// 新任务指向目标槽位
    pub(crate) fn task_started(&mut self, index: usize) {
        self.slots[index].tasks_in_flight += 1;
    }

    /// 记录一个 slice 的解码区间, 返回新增的可去块区间
    pub(crate) fn record_slice_progress(
        &mut self,
        target: SlotRef,
        range: Range<u32>,
        deblock: DeblockParams,
    ) -> TaoResult<Vec<(Range<u32>, DeblockParams)>> {
        self.check_slot_ref(target)?;
        let slot = &mut self.slots[target.index];
        slot.remaining_mbs = slot
            .remaining_mbs
            .saturating_sub(range.end.saturating_sub(range.start));
        Ok(slot.record_decoded(range, deblock))
    }

    /// 任务结束, 目标图像满足条件时完成该图像
    ///
    /// 返回本次完成的槽位.
    pub(crate) fn task_finished(&mut self, target: SlotRef) -> TaoResult<Option<usize>> {
        self.check_slot_ref(target)?;
        let index = target.index;
        let slot = &mut self.slots[index];
        slot.tasks_in_flight = slot.tasks_in_flight.saturating_sub(1);
        let done = slot.tasks_in_flight == 0 && (slot.remaining_mbs == 0 || slot.finished);
        if done && self.complete_picture(index) {
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// 结束当前图像并提交其参考标记
    ///
    /// 若该图像已无在途任务, 立即完成并返回其槽位.
    pub(crate) fn finish_picture(&mut self) -> Option<usize> {
        let cur = self.current.take()?;
        let index = cur.slot;
        self.slots[index].finished = true;
        if cur.mmco5 {
            self.restart_output_order(index);
        }
        if cur.is_reference {
            if let Some(marking) = cur.marking {
                self.refs = marking;
            }
            let slot = &self.slots[index];
            self.prev_pic_order_cnt = slot.field_order_cnt[0];
            self.prev_ref_frame_num = slot.frame_num;
        }
        debug!(
            "H264: 图像结束 slot={}, 参考帧 {:?}, 待输出 {:?}",
            index,
            self.refs.reference(),
            self.output
        );
        let slot = &self.slots[index];
        if slot.tasks_in_flight == 0 && !slot.complete && self.complete_picture(index) {
            return Some(index);
        }
        None
    }

    /// 标记图像完成, 未被任何 slice 覆盖的宏块以错误概率 100% 隐藏
    ///
    /// 缺口之后已解码的区间在隐藏完成后去块.
    pub(crate) fn complete_picture(&mut self, index: usize) -> bool {
        let mbs = self.params.mbs_per_picture();
        let slot = &mut self.slots[index];
        if slot.complete {
            return false;
        }
        let missing = slot.missing_ranges(mbs);
        let claimed = slot.claim_after_gaps(mbs);
        if !missing.is_empty() || !claimed.is_empty() {
            if let Some(picture) = &slot.storage {
                let mut buffer = write_picture(picture);
                for range in &missing {
                    recovery::conceal_range(&mut buffer, range.clone());
                }
                if let Some(deblocker) = &self.deblocker {
                    for (range, params) in &claimed {
                        if params.enabled() {
                            deblocker.deblock(&mut buffer, range.clone(), params);
                        }
                    }
                }
            }
        }
        if !missing.is_empty() {
            slot.degraded = true;
            self.stats.concealed_pictures += 1;
            warn!(
                "H264: 图像 slot={} 有 {} 段宏块未解码, 已隐藏, 缺口后 {} 段补做去块",
                index,
                missing.len(),
                claimed.len()
            );
        }
        let slot = &mut self.slots[index];
        slot.remaining_mbs = 0;
        slot.complete = true;
        true
    }

    /// 错误恢复后标记图像降质
    pub(crate) fn note_recovered_slice(&mut self, target: SlotRef) {
        if self.check_slot_ref(target).is_ok() {
            self.slots[target.index].degraded = true;
        }
        self.stats.recovered_slices += 1;
    }

    // ============================================================
    // 复位
    // ============================================================

    /// 释放全部槽位与存储, 码流参数保留
    ///
    /// 连续调用两次时第二次不改变任何状态.
    pub fn release_on_reset(&mut self) {
        for slot in &mut self.slots {
            if !slot.touched && slot.storage.is_none() {
                continue;
            }
            let generation = slot.generation.wrapping_add(1);
            *slot = PictureSlot {
                generation,
                ..PictureSlot::default()
            };
        }
        self.refs.clear();
        self.output = SlotMask::EMPTY;
        self.borrowed = SlotMask::EMPTY;
        self.current = None;
        self.disp_pic_order_cnt = DISP_POC_RESET;
        self.prev_ref_frame_num = 0;
        self.prev_pic_order_cnt = 0;
        self.dropped_slice_warnings = 0;
    }
}

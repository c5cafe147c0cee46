use super::*;

// ============================================================
// 参考帧标记 (8.2.5)
// ============================================================

/// 在参考集合上执行滑动窗口, 为 `keep` 以外的图像腾出位置
///
/// 参考帧数 (不含 `keep`) 达到上限时移除 FrameNum 最小的短期参考帧;
/// 没有短期参考帧可移除时, 移除长期索引最大的长期参考帧.
pub(crate) fn sliding_window(
    refs: &mut RefFlags,
    slots: &[PictureSlot],
    max_num_ref_frames: usize,
    keep: usize,
) {
    loop {
        let mut others = refs.reference();
        others.remove(keep);
        if others.count() < max_num_ref_frames {
            return;
        }
        let mut short = refs.short_term();
        short.remove(keep);
        let victim = short
            .iter()
            .min_by_key(|&i| (slots[i].frame_num, i))
            .or_else(|| {
                let mut long = refs.long_term();
                long.remove(keep);
                long.iter()
                    .max_by_key(|&i| (refs.long_term_frame_idx(i).unwrap_or(0), i))
            });
        let Some(victim) = victim else {
            return;
        };
        if refs.is_long_term(victim) {
            warn!(
                "H264: 参考帧已满且无短期参考帧, 移除长期参考帧 slot={}, long_term_frame_idx={:?}",
                victim,
                refs.long_term_frame_idx(victim)
            );
        }
        refs.unmark(victim);
    }
}

impl DecoderState {
    /// 对当前图像执行参考标记, 结果存入当前图像的工作副本
    ///
    /// 每个参考 slice 都以已提交的参考集合为起点重新计算,
    /// 图像结束时 (`finish_picture`) 才提交, 因此同一图像的各 slice 看到同一参考集合.
    pub(crate) fn mark_current_picture(&mut self, header: &SliceHeader) {
        let Some(cur) = self.current.as_ref() else {
            return;
        };
        let curr = cur.slot;
        let original_poc = cur.field_order_cnt;
        let mut curr_frame_num = cur.unwrapped_frame_num;
        let max_refs = self.params.max_num_ref_frames as usize;
        let marking = &header.dec_ref_pic_marking;
        let mut refs = self.refs.clone();
        let mut mmco5 = false;

        if header.is_idr() {
            refs.clear();
            if marking.long_term_reference_flag {
                refs.mark_long(curr, 0);
            } else {
                refs.mark_short(curr);
            }
            if marking.no_output_of_prior_pics {
                debug!("H264: IDR no_output_of_prior_pics_flag=1, 先前图像仍按序输出");
            }
        } else {
            if marking.adaptive {
                for op in &marking.ops {
                    match *op {
                        MmcoOp::ForgetShort {
                            difference_of_pic_nums_minus1,
                        } => {
                            let pic_num = curr_frame_num - 1 - difference_of_pic_nums_minus1 as i32;
                            match self.find_short_term(&refs, pic_num, curr) {
                                Some(i) => refs.unmark(i),
                                None => warn!("H264: MMCO1 未找到短期参考帧, pic_num={}", pic_num),
                            }
                        }
                        MmcoOp::ForgetLong { long_term_pic_num } => {
                            match refs.find_long_term(long_term_pic_num) {
                                Some(i) if i != curr => refs.unmark(i),
                                _ => warn!(
                                    "H264: MMCO2 未找到长期参考帧, long_term_pic_num={}",
                                    long_term_pic_num
                                ),
                            }
                        }
                        MmcoOp::ConvertShortToLong {
                            difference_of_pic_nums_minus1,
                            long_term_frame_idx,
                        } => {
                            let pic_num = curr_frame_num - 1 - difference_of_pic_nums_minus1 as i32;
                            let Some(target) = self.find_short_term(&refs, pic_num, curr) else {
                                warn!("H264: MMCO3 未找到短期参考帧, pic_num={}", pic_num);
                                continue;
                            };
                            match refs.find_long_term(long_term_frame_idx) {
                                Some(old) if old != target => refs.unmark(old),
                                _ => {}
                            }
                            refs.mark_long(target, long_term_frame_idx);
                        }
                        MmcoOp::TrimLong {
                            max_long_term_frame_idx_plus1,
                        } => {
                            for i in refs.long_term().iter() {
                                if i != curr
                                    && refs.long_term_frame_idx(i).unwrap_or(0)
                                        >= max_long_term_frame_idx_plus1
                                {
                                    refs.unmark(i);
                                }
                            }
                        }
                        MmcoOp::ClearAll => {
                            refs.clear();
                            mmco5 = true;
                            curr_frame_num = 0;
                        }
                        MmcoOp::MarkCurrentLong {
                            long_term_frame_idx,
                        } => {
                            match refs.find_long_term(long_term_frame_idx) {
                                Some(old) if old != curr => refs.unmark(old),
                                _ => {}
                            }
                            refs.mark_long(curr, long_term_frame_idx);
                        }
                    }
                }
            }
            sliding_window(&mut refs, &self.slots, max_refs, curr);
            if !refs.is_long_term(curr) {
                refs.mark_short(curr);
            }
        }

        if mmco5 {
            // 当前图像视为 IDR: FrameNum 归零, POC 以 min(top, bottom) 为新零点
            let temp = original_poc[0].min(original_poc[1]);
            let slot = &mut self.slots[curr];
            slot.frame_num = 0;
            slot.field_order_cnt = [original_poc[0] - temp, original_poc[1] - temp];
        }
        debug_assert!(refs.count() <= max_refs);
        if let Some(cur) = self.current.as_mut() {
            cur.marking = Some(refs);
            cur.mmco5 = mmco5;
        }
    }

    fn find_short_term(&self, refs: &RefFlags, frame_num: i32, curr: usize) -> Option<usize> {
        refs.short_term()
            .iter()
            .find(|&i| i != curr && self.slots[i].frame_num == frame_num)
    }
}

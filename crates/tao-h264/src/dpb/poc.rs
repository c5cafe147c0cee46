use super::*;

// ============================================================
// FrameNum 展开与 POC 推导 (8.2.1)
// ============================================================

impl DecoderState {
    /// 以上一参考帧的 FrameNum 为基准展开 frame_num
    pub(crate) fn unwrap_frame_num(&self, header: &SliceHeader) -> i32 {
        let prev = if header.is_idr() {
            0
        } else {
            self.prev_ref_frame_num
        };
        let mask = self.params.max_frame_num() - 1;
        prev + ((header.frame_num as i32 - prev) & mask)
    }

    /// 计算 Top/Bottom POC
    ///
    /// 绝对值不小于 2^25 的 POC 返回 `Unsupported`.
    pub(crate) fn compute_field_order_cnt(
        &self,
        header: &SliceHeader,
        frame_num: i32,
    ) -> TaoResult<[i32; 2]> {
        let params = &self.params;
        let is_ref = header.is_reference();
        let (top, bottom) = match params.pic_order_cnt_type {
            0 => {
                let prev = if header.is_idr() {
                    0
                } else {
                    self.prev_pic_order_cnt
                };
                let shift = 32 - params.log2_max_pic_order_cnt_lsb as u32;
                let inc = ((header.pic_order_cnt_lsb as i32).wrapping_sub(prev) << shift) >> shift;
                let top = prev as i64 + inc as i64;
                (top, top + header.delta_pic_order_cnt_bottom as i64)
            }
            1 => {
                let mut expected = if header.is_idr() {
                    0
                } else {
                    self.expected_pic_order_cnt(frame_num, is_ref)
                };
                if !is_ref {
                    expected += params.offset_for_non_ref_pic as i64;
                }
                let top = expected + header.delta_pic_order_cnt[0] as i64;
                let bottom = top
                    + params.offset_for_top_to_bottom_field as i64
                    + header.delta_pic_order_cnt[1] as i64;
                (top, bottom)
            }
            _ => {
                let poc = if header.is_idr() {
                    0
                } else if is_ref {
                    2 * frame_num as i64
                } else {
                    2 * frame_num as i64 - 1
                };
                (poc, poc)
            }
        };
        let limit = MAX_ABS_PIC_ORDER_CNT as i64;
        if top.abs() >= limit || bottom.abs() >= limit {
            return Err(TaoError::Unsupported(format!(
                "H264: POC 超出可表示范围, top={}, bottom={}",
                top, bottom
            )));
        }
        Ok([top as i32, bottom as i32])
    }

    /// POC type 1 的 expectedPicOrderCnt
    pub(crate) fn expected_pic_order_cnt(&self, frame_num: i32, is_ref: bool) -> i64 {
        let cycle = &self.params.offset_for_ref_frame;
        if cycle.is_empty() {
            return 0;
        }
        let mut abs_frame_num = frame_num as i64;
        if !is_ref && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }
        if abs_frame_num <= 0 {
            return 0;
        }
        let per_cycle: i64 = cycle.iter().map(|&v| v as i64).sum();
        let len = cycle.len() as i64;
        let cycle_cnt = (abs_frame_num - 1) / len;
        let in_cycle = ((abs_frame_num - 1) % len) as usize;
        let partial: i64 = cycle[..=in_cycle].iter().map(|&v| v as i64).sum();
        cycle_cnt * per_cycle + partial
    }

    /// 补帧 (non-existing frame) 的 POC
    pub(crate) fn non_existing_pic_order_cnt(&self, frame_num: i32) -> i32 {
        let poc = match self.params.pic_order_cnt_type {
            2 => 2 * frame_num as i64,
            1 => self.expected_pic_order_cnt(frame_num, true),
            _ => 0,
        };
        poc.clamp(
            -(MAX_ABS_PIC_ORDER_CNT as i64) + 1,
            MAX_ABS_PIC_ORDER_CNT as i64 - 1,
        ) as i32
    }

    /// 判断 slice 是否开始新图像 (7.4.1.2.4)
    pub(crate) fn starts_new_picture(
        &self,
        header: &SliceHeader,
        field_order_cnt: [i32; 2],
    ) -> bool {
        let Some(cur) = &self.current else {
            return true;
        };
        header.first_mb_in_slice == 0
            || cur.frame_num != header.frame_num
            || cur.is_idr != header.is_idr()
            || cur.is_reference != header.is_reference()
            || (cur.is_idr && cur.idr_pic_id != header.idr_pic_id)
            || cur.field_order_cnt != field_order_cnt
    }
}

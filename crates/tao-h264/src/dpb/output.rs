use super::*;

// ============================================================
// 输出排序 (C.4.5)
// ============================================================

impl DecoderState {
    /// 图像第一个 slice 被接受后更新输出状态
    ///
    /// IDR 图像: 水位线复位, 尚未输出的旧图像 POC 整体下移, 保证先于新序列输出.
    /// MMCO5 图像的同样处理推迟到 `finish_picture`, 其后续 slice 仍按原 POC 构建参考列表.
    /// 非参考图像: 水位线提升到其 POC.
    pub(crate) fn begin_picture_output(&mut self, index: usize, is_idr: bool, is_reference: bool) {
        if is_idr {
            self.restart_output_order(index);
        }
        self.output.insert(index);
        if !is_reference {
            let poc = self.slots[index].pic_order_cnt();
            self.disp_pic_order_cnt = self.disp_pic_order_cnt.max(poc);
        }
    }

    /// 新序列开始: `current` 以外的待输出图像 POC 下移, 水位线复位
    pub(crate) fn restart_output_order(&mut self, current: usize) {
        let pending = self.output - SlotMask::single(current);
        for i in pending.iter() {
            let foc = &mut self.slots[i].field_order_cnt;
            foc[0] = foc[0].saturating_sub(PENDING_OUTPUT_POC_SHIFT);
            foc[1] = foc[1].saturating_sub(PENDING_OUTPUT_POC_SHIFT);
        }
        if !pending.is_empty() {
            debug!(
                "H264: IDR/MMCO5, {} 个待输出图像 POC 下移 {}",
                pending.count(),
                PENDING_OUTPUT_POC_SHIFT
            );
        }
        self.disp_pic_order_cnt = DISP_POC_RESET;
    }

    /// 把水位线提升到最大值, 使全部待输出图像都可以输出 (码流参数切换前)
    pub(crate) fn release_all_output(&mut self) {
        self.disp_pic_order_cnt = i32::MAX;
    }

    /// 选择下一个可输出的槽位
    ///
    /// 取 POC 最小的待输出图像; 该图像 POC 不超过水位线, 或 `drain`,
    /// 或待输出数量超过 `max_num_reorder_frames` 时才输出, 且必须已解码完成.
    pub fn select_output(&self, drain: bool) -> Option<usize> {
        let index = self
            .output
            .iter()
            .min_by_key(|&i| (self.slots[i].pic_order_cnt(), i))?;
        let forced = drain || self.output.count() > self.params.max_num_reorder_frames as usize;
        let slot = &self.slots[index];
        if !forced && slot.pic_order_cnt() > self.disp_pic_order_cnt {
            return None;
        }
        if !slot.complete {
            return None;
        }
        Some(index)
    }

    /// 取出下一帧输出图像, 槽位转为借出状态
    pub fn take_output(&mut self, drain: bool) -> Option<PictureHandle> {
        let index = self.select_output(drain)?;
        let slot = &self.slots[index];
        let Some(picture) = slot.storage.clone() else {
            warn!("H264: 待输出槽位 {} 没有图像存储, 丢弃", index);
            self.output.remove(index);
            return None;
        };
        let handle = PictureHandle::new(
            slot.slot_ref(index),
            slot.pic_order_cnt(),
            slot.frame_num,
            slot.degraded,
            picture,
        );
        self.output.remove(index);
        self.borrowed.insert(index);
        self.stats.output_frames += 1;
        debug!(
            "H264: 输出 slot={}, frame_num={}, poc={}, 水位线={}",
            index, handle.frame_num, handle.pic_order_cnt, self.disp_pic_order_cnt
        );
        Some(handle)
    }

    /// 归还输出图像
    pub fn return_frame(&mut self, handle: PictureHandle) -> TaoResult<()> {
        self.check_slot_ref(handle.slot)?;
        let index = handle.slot.index;
        if !self.borrowed.contains(index) {
            return Err(TaoError::Internal(format!(
                "H264: 槽位 {} 未处于借出状态, 不能归还",
                index
            )));
        }
        self.borrowed.remove(index);
        Ok(())
    }

    /// 待输出图像中 POC 第 `n` 小 (从 1 计) 的非参考且未借出槽位的 POC
    pub(crate) fn nth_releasable_output_poc(&self, output: SlotMask, n: usize) -> Option<i32> {
        if n == 0 {
            return None;
        }
        let mut pocs: Vec<i32> = (output - self.refs.reference() - self.borrowed)
            .iter()
            .map(|i| self.slots[i].pic_order_cnt())
            .collect();
        pocs.sort_unstable();
        pocs.get(n - 1).copied()
    }
}

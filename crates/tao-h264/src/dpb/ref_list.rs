use super::*;

// ============================================================
// 参考图像列表构建 (8.2.4)
// ============================================================

/// 一个 slice 的参考列表构建结果
///
/// 参考集合为空时不含任何条目, 由 `resolve` 以当前槽位自引用填满.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefListPlan {
    pub lists: [Vec<usize>; 2],
    pub self_reference: bool,
}

impl RefListPlan {
    /// 以实际的当前槽位补全自引用条目
    pub fn resolve(mut self, current_slot: usize, num_ref_idx_active: [u32; 2]) -> [Vec<usize>; 2] {
        if self.self_reference {
            for (list, &count) in self.lists.iter_mut().zip(num_ref_idx_active.iter()) {
                if !list.is_empty() || count == 0 {
                    continue;
                }
                *list = vec![current_slot; count as usize];
            }
        }
        self.lists
    }
}

/// 初始列表中的分组: 0=短期(之前), 1=短期(之后), 2=长期
type SortKey = (u8, i64, usize);

impl DecoderState {
    /// 为 P/B slice 构建参考列表
    ///
    /// 结果长度恰为 `num_ref_idx_active[l]` 且两两不同, 否则返回 `InvalidData`.
    pub fn build_ref_lists(
        &self,
        header: &SliceHeader,
        frame_num: i32,
        pic_order_cnt: i32,
    ) -> TaoResult<RefListPlan> {
        let num_lists = header.slice_type.num_ref_lists();
        let mut plan = RefListPlan {
            lists: [Vec::new(), Vec::new()],
            self_reference: false,
        };
        if num_lists == 0 {
            return Ok(plan);
        }
        let refs = &self.refs;
        if refs.reference().is_empty() {
            plan.self_reference = true;
            return Ok(plan);
        }

        let by_pic_order = header.slice_type == SliceType::B;
        let mut keys: Vec<SortKey> = refs
            .reference()
            .iter()
            .map(|i| {
                if let Some(idx) = refs.long_term_frame_idx(i) {
                    return (2, idx as i64, i);
                }
                let slot = &self.slots[i];
                let diff = if by_pic_order {
                    slot.pic_order_cnt() as i64 - pic_order_cnt as i64
                } else {
                    slot.frame_num as i64 - frame_num as i64
                };
                if diff <= 0 { (0, -diff, i) } else { (1, diff, i) }
            })
            .collect();
        keys.sort_unstable();

        let initial_l0: Vec<usize> = keys.iter().map(|&(_, _, i)| i).collect();
        plan.lists[0] = initial_l0.clone();
        if num_lists == 2 {
            let before: Vec<usize> = keys.iter().filter(|k| k.0 == 0).map(|k| k.2).collect();
            let after: Vec<usize> = keys.iter().filter(|k| k.0 == 1).map(|k| k.2).collect();
            let long: Vec<usize> = keys.iter().filter(|k| k.0 == 2).map(|k| k.2).collect();
            let mut l1 = after;
            l1.extend(before);
            l1.extend(long);
            if l1.len() > 1 && l1 == initial_l0 {
                l1.swap(0, 1);
            }
            plan.lists[1] = l1;
        }

        for list in 0..num_lists {
            let count = header.num_ref_idx_active[list] as usize;
            if refs.count() < count {
                return Err(TaoError::InvalidData(format!(
                    "H264: num_ref_idx_l{}_active={} 超过可用参考帧数 {}",
                    list,
                    count,
                    refs.count()
                )));
            }
            plan.lists[list].truncate(count);
            self.apply_ref_pic_list_modifications(
                &mut plan.lists[list],
                &header.ref_pic_list_mods[list],
                header.frame_num,
                list,
            )?;
            let distinct: SlotMask = plan.lists[list].iter().copied().collect();
            if distinct.count() != plan.lists[list].len() {
                return Err(TaoError::InvalidData(format!(
                    "H264: 参考列表 l{} 含重复条目 {:?}",
                    list, plan.lists[list]
                )));
            }
        }
        Ok(plan)
    }

    /// 按语法顺序执行列表修改: 在当前位置稳定插入, 并移除其后的重复条目
    fn apply_ref_pic_list_modifications(
        &self,
        list: &mut Vec<usize>,
        mods: &[RefPicListMod],
        curr_frame_num: u32,
        list_idx: usize,
    ) -> TaoResult<()> {
        let count = list.len();
        let max_frame_num = self.params.max_frame_num() as i64;
        let mut pic_num_pred = curr_frame_num as i64;
        for (ref_idx, m) in mods.iter().enumerate() {
            if ref_idx >= count {
                return Err(TaoError::InvalidData(format!(
                    "H264: 参考列表 l{} 修改操作数 {} 超过列表长度 {}",
                    list_idx,
                    mods.len(),
                    count
                )));
            }
            let pic = match *m {
                RefPicListMod::ShortTermSub {
                    abs_diff_pic_num_minus1,
                }
                | RefPicListMod::ShortTermAdd {
                    abs_diff_pic_num_minus1,
                } => {
                    let abs_diff = abs_diff_pic_num_minus1 as i64 + 1;
                    if abs_diff > max_frame_num {
                        return Err(TaoError::InvalidData(format!(
                            "H264: abs_diff_pic_num_minus1={} 超出范围",
                            abs_diff_pic_num_minus1
                        )));
                    }
                    pic_num_pred = if matches!(m, RefPicListMod::ShortTermSub { .. }) {
                        (pic_num_pred - abs_diff).rem_euclid(max_frame_num)
                    } else {
                        (pic_num_pred + abs_diff).rem_euclid(max_frame_num)
                    };
                    self.refs.short_term().iter().find(|&i| {
                        (self.slots[i].frame_num as i64).rem_euclid(max_frame_num) == pic_num_pred
                    })
                }
                RefPicListMod::LongTerm { long_term_pic_num } => {
                    self.refs.find_long_term(long_term_pic_num)
                }
            };
            let Some(pic) = pic else {
                return Err(TaoError::InvalidData(format!(
                    "H264: 参考列表 l{} 修改指向不存在的图像, {:?}",
                    list_idx, m
                )));
            };
            list.insert(ref_idx, pic);
            if let Some(dup) = (ref_idx + 1..list.len()).find(|&j| list[j] == pic) {
                list.remove(dup);
            }
            list.truncate(count);
        }
        Ok(())
    }

    /// 参考列表中需要等待的槽位 (排除当前图像自身)
    pub fn dependency_mask(&self, lists: &[Vec<usize>; 2], current_slot: usize) -> SlotMask {
        let mut mask: SlotMask = lists.iter().flatten().copied().collect();
        mask.remove(current_slot);
        mask
    }
}

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub, SubAssign};

use bitflags::bitflags;
use serde::Serialize;

/// 槽位掩码可表示的最大槽位数
pub const MAX_SLOTS: usize = 32;

// ============================================================
// 槽位掩码
// ============================================================

/// 以槽位索引为位号的紧凑位集合
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct SlotMask(u32);

impl SlotMask {
    pub const EMPTY: SlotMask = SlotMask(0);

    /// 前 `count` 个槽位全部置位
    pub fn full(count: usize) -> Self {
        if count >= MAX_SLOTS {
            SlotMask(u32::MAX)
        } else {
            SlotMask((1u32 << count) - 1)
        }
    }

    pub fn single(index: usize) -> Self {
        debug_assert!(index < MAX_SLOTS);
        SlotMask(1u32 << index)
    }

    pub fn from_bits(bits: u32) -> Self {
        SlotMask(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, index: usize) -> bool {
        index < MAX_SLOTS && self.0 & (1u32 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        self.0 |= 1u32 << index;
    }

    pub fn remove(&mut self, index: usize) {
        self.0 &= !(1u32 << index);
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: SlotMask) -> bool {
        self.0 & other.0 != 0
    }

    /// 最低位槽位
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn iter(self) -> SlotIter {
        SlotIter(self.0)
    }
}

impl fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl BitOr for SlotMask {
    type Output = SlotMask;
    fn bitor(self, rhs: SlotMask) -> SlotMask {
        SlotMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for SlotMask {
    fn bitor_assign(&mut self, rhs: SlotMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SlotMask {
    type Output = SlotMask;
    fn bitand(self, rhs: SlotMask) -> SlotMask {
        SlotMask(self.0 & rhs.0)
    }
}

/// 差集
impl Sub for SlotMask {
    type Output = SlotMask;
    fn sub(self, rhs: SlotMask) -> SlotMask {
        SlotMask(self.0 & !rhs.0)
    }
}

impl SubAssign for SlotMask {
    fn sub_assign(&mut self, rhs: SlotMask) {
        self.0 &= !rhs.0;
    }
}

impl FromIterator<usize> for SlotMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = SlotMask::EMPTY;
        for index in iter {
            mask.insert(index);
        }
        mask
    }
}

/// 按槽位索引升序遍历
pub struct SlotIter(u32);

impl Iterator for SlotIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}

// ============================================================
// 参考标记
// ============================================================

/// 参考/长期参考标记与长期索引
///
/// 只能通过方法修改, 保证长期参考必为参考帧.
#[derive(Clone, PartialEq, Eq)]
pub struct RefFlags {
    reference: SlotMask,
    long_term: SlotMask,
    long_term_frame_idx: [u8; MAX_SLOTS],
}

impl Default for RefFlags {
    fn default() -> Self {
        Self {
            reference: SlotMask::EMPTY,
            long_term: SlotMask::EMPTY,
            long_term_frame_idx: [0; MAX_SLOTS],
        }
    }
}

impl fmt::Debug for RefFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefFlags")
            .field("reference", &self.reference)
            .field("long_term", &self.long_term)
            .finish()
    }
}

impl RefFlags {
    pub fn reference(&self) -> SlotMask {
        self.reference
    }

    pub fn long_term(&self) -> SlotMask {
        self.long_term
    }

    pub fn short_term(&self) -> SlotMask {
        self.reference - self.long_term
    }

    pub fn count(&self) -> usize {
        self.reference.count()
    }

    pub fn is_reference(&self, index: usize) -> bool {
        self.reference.contains(index)
    }

    pub fn is_long_term(&self, index: usize) -> bool {
        self.long_term.contains(index)
    }

    pub fn long_term_frame_idx(&self, index: usize) -> Option<u32> {
        if self.long_term.contains(index) {
            Some(self.long_term_frame_idx[index] as u32)
        } else {
            None
        }
    }

    /// 查找持有指定长期索引的槽位
    pub fn find_long_term(&self, long_term_frame_idx: u32) -> Option<usize> {
        self.long_term
            .iter()
            .find(|&i| self.long_term_frame_idx[i] as u32 == long_term_frame_idx)
    }

    /// 标记为短期参考 (若原为长期参考则降级)
    pub fn mark_short(&mut self, index: usize) {
        self.reference.insert(index);
        self.long_term.remove(index);
    }

    /// 标记为长期参考, 同时保证参考位被置位
    pub fn mark_long(&mut self, index: usize, long_term_frame_idx: u32) {
        self.reference.insert(index);
        self.long_term.insert(index);
        self.long_term_frame_idx[index] = long_term_frame_idx.min(u8::MAX as u32) as u8;
    }

    /// 取消参考, 长期位一并清除
    pub fn unmark(&mut self, index: usize) {
        self.reference.remove(index);
        self.long_term.remove(index);
    }

    pub fn clear(&mut self) {
        self.reference = SlotMask::EMPTY;
        self.long_term = SlotMask::EMPTY;
    }
}

// ============================================================
// 槽位状态 (快照用)
// ============================================================

bitflags! {
    /// 槽位状态位, 用于快照与追踪输出
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct SlotStatus: u16 {
        const REFERENCE = 1 << 0;
        const LONG_TERM = 1 << 1;
        const OUTPUT = 1 << 2;
        const BORROWED = 1 << 3;
        const CURRENT = 1 << 4;
        const COMPLETE = 1 << 5;
        const NON_EXISTING = 1 << 6;
        const DEGRADED = 1 << 7;
    }
}

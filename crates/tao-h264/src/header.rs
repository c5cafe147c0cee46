//! 外部头部解析器交给调度核心的语法元素.
//!
//! 本 crate 不负责比特流解析, 只消费已解析好的 SPS 尺寸字段与 slice header.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tao_core::{TaoError, TaoResult};

/// 单帧宏块数上限 (Level 6.2 MaxFS)
pub const MAX_MBS_PER_PICTURE: u32 = 139_264;

/// 图像顺序号绝对值上限, 超出时按不支持处理
pub const MAX_ABS_PIC_ORDER_CNT: i32 = 1 << 25;

// ============================================================
// 码流参数 (来自 SPS)
// ============================================================

/// 决定缓冲池规模与 FrameNum/POC 推导的码流参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub frame_mbs_only: bool,
    pub max_num_ref_frames: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
    pub log2_max_frame_num: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    /// POC type 1 的参考帧偏移循环
    pub offset_for_ref_frame: Vec<i32>,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width_in_mbs: 1,
            height_in_mbs: 1,
            chroma_format_idc: 1,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            frame_mbs_only: true,
            max_num_ref_frames: 1,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 1,
            log2_max_frame_num: 4,
            pic_order_cnt_type: 2,
            log2_max_pic_order_cnt_lsb: 8,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: Vec::new(),
        }
    }
}

impl StreamParams {
    /// 按尺寸与参考帧数构造, 其余字段取常见默认值
    pub fn new(width_in_mbs: u32, height_in_mbs: u32, max_num_ref_frames: u32) -> Self {
        Self {
            width_in_mbs,
            height_in_mbs,
            max_num_ref_frames,
            max_dec_frame_buffering: max_num_ref_frames,
            ..Self::default()
        }
    }

    /// 校验取值范围, 拒绝刻意不支持的格式
    pub fn validate(&self) -> TaoResult<()> {
        if self.chroma_format_idc != 1 {
            return Err(TaoError::Unsupported(format!(
                "H264: 仅支持 4:2:0, chroma_format_idc={}",
                self.chroma_format_idc
            )));
        }
        if self.bit_depth_luma != 8 || self.bit_depth_chroma != 8 {
            return Err(TaoError::Unsupported(format!(
                "H264: 仅支持 8bit, bit_depth_luma={}, bit_depth_chroma={}",
                self.bit_depth_luma, self.bit_depth_chroma
            )));
        }
        if !self.frame_mbs_only {
            return Err(TaoError::Unsupported(
                "H264: 不支持场编码 (frame_mbs_only_flag=0)".into(),
            ));
        }
        if self.width_in_mbs == 0
            || self.height_in_mbs == 0
            || self.width_in_mbs.saturating_mul(self.height_in_mbs) > MAX_MBS_PER_PICTURE
        {
            return Err(TaoError::InvalidData(format!(
                "H264: 图像尺寸非法, {}x{} 宏块",
                self.width_in_mbs, self.height_in_mbs
            )));
        }
        if self.max_num_ref_frames > 16
            || self.max_num_reorder_frames > 16
            || self.max_dec_frame_buffering > 16
        {
            return Err(TaoError::InvalidData(format!(
                "H264: DPB 参数越界, max_num_ref_frames={}, max_num_reorder_frames={}, max_dec_frame_buffering={}",
                self.max_num_ref_frames, self.max_num_reorder_frames, self.max_dec_frame_buffering
            )));
        }
        if !(4..=16).contains(&self.log2_max_frame_num) {
            return Err(TaoError::InvalidData(format!(
                "H264: log2_max_frame_num={} 超出范围",
                self.log2_max_frame_num
            )));
        }
        if self.pic_order_cnt_type > 2 {
            return Err(TaoError::InvalidData(format!(
                "H264: pic_order_cnt_type={} 超出范围",
                self.pic_order_cnt_type
            )));
        }
        if self.pic_order_cnt_type == 0 && !(4..=16).contains(&self.log2_max_pic_order_cnt_lsb) {
            return Err(TaoError::InvalidData(format!(
                "H264: log2_max_pic_order_cnt_lsb={} 超出范围",
                self.log2_max_pic_order_cnt_lsb
            )));
        }
        if self.offset_for_ref_frame.len() > 255 {
            return Err(TaoError::InvalidData(format!(
                "H264: num_ref_frames_in_pic_order_cnt_cycle={} 超出范围",
                self.offset_for_ref_frame.len()
            )));
        }
        Ok(())
    }

    /// 规整派生约束: 参考帧数至少为 1, 缓冲深度不小于参考帧数, 重排深度不超过缓冲深度
    pub fn normalized(mut self) -> Self {
        self.max_num_ref_frames = self.max_num_ref_frames.max(1);
        self.max_dec_frame_buffering = self.max_dec_frame_buffering.max(self.max_num_ref_frames);
        self.max_num_reorder_frames = self
            .max_num_reorder_frames
            .min(self.max_dec_frame_buffering);
        self
    }

    /// 图像槽数量 (额外 1 个供正在解码的图像使用)
    pub fn num_frame_buffers(&self) -> usize {
        let depth = self
            .max_dec_frame_buffering
            .max(self.max_num_ref_frames)
            .max(self.max_num_reorder_frames) as usize;
        depth + 1
    }

    pub fn mbs_per_picture(&self) -> u32 {
        self.width_in_mbs * self.height_in_mbs
    }

    pub fn max_frame_num(&self) -> i32 {
        1 << self.log2_max_frame_num
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }
}

// ============================================================
// Slice Header
// ============================================================

/// slice 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SliceType {
    P,
    B,
    #[default]
    I,
    Sp,
    Si,
}

impl SliceType {
    /// 本类型使用的参考列表数量
    pub fn num_ref_lists(self) -> usize {
        match self {
            Self::P | Self::Sp => 1,
            Self::B => 2,
            Self::I | Self::Si => 0,
        }
    }

    pub fn is_intra(self) -> bool {
        matches!(self, Self::I | Self::Si)
    }
}

/// 熵编码方式, 按 slice 在运行时选择解码策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntropyCoding {
    #[default]
    Cavlc,
    Cabac,
}

/// slice 级去块参数, 对调度核心不透明, 原样交给宏块管线
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeblockParams {
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
}

impl DeblockParams {
    pub fn enabled(&self) -> bool {
        self.disable_deblocking_filter_idc != 1
    }
}

/// 参考列表重排序操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefPicListMod {
    ShortTermSub { abs_diff_pic_num_minus1: u32 },
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    LongTerm { long_term_pic_num: u32 },
}

/// 自适应内存控制操作 (MMCO)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MmcoOp {
    /// MMCO1: 移除短期参考帧
    ForgetShort { difference_of_pic_nums_minus1: u32 },
    /// MMCO2: 移除长期参考帧
    ForgetLong { long_term_pic_num: u32 },
    /// MMCO3: 短期参考帧转为长期
    ConvertShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// MMCO4: 移除索引不小于上限的长期参考帧
    TrimLong { max_long_term_frame_idx_plus1: u32 },
    /// MMCO5: 清空全部参考并将当前图像视为 IDR
    ClearAll,
    /// MMCO6: 当前图像标记为长期参考
    MarkCurrentLong { long_term_frame_idx: u32 },
}

/// dec_ref_pic_marking 语法
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecRefPicMarking {
    pub no_output_of_prior_pics: bool,
    pub long_term_reference_flag: bool,
    pub adaptive: bool,
    pub ops: Vec<MmcoOp>,
}

/// 已解析的 slice header 及其 NAL 元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    pub slice_type: SliceType,
    pub first_mb_in_slice: u32,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub num_ref_idx_active: [u32; 2],
    pub ref_pic_list_mods: [Vec<RefPicListMod>; 2],
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub num_slice_groups: u32,
    pub entropy_coding: EntropyCoding,
    pub slice_qp: i32,
    pub deblock: DeblockParams,
    /// slice_data() 载荷, 由宏块管线消费
    #[serde(skip)]
    pub payload: Bytes,
}

impl SliceHeader {
    pub fn is_idr(&self) -> bool {
        self.nal_unit_type == 5
    }

    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }

    /// 校验与码流参数的一致性
    ///
    /// 不支持的特性返回 `Unsupported`, 违反约束的取值返回 `InvalidData`.
    pub fn validate(&self, params: &StreamParams) -> TaoResult<()> {
        match self.nal_unit_type {
            1 | 5 => {}
            2..=4 => {
                return Err(TaoError::Unsupported(
                    "H264: 不支持数据分割 slice".into(),
                ));
            }
            20 => {
                return Err(TaoError::Unsupported(
                    "H264: 仅支持基础视图, 忽略 MVC 非基础视图 slice".into(),
                ));
            }
            other => {
                return Err(TaoError::InvalidData(format!(
                    "H264: nal_unit_type={} 不是 slice",
                    other
                )));
            }
        }
        if self.field_pic_flag {
            return Err(TaoError::Unsupported("H264: 不支持场图像 slice".into()));
        }
        if self.num_slice_groups > 1 {
            return Err(TaoError::Unsupported(format!(
                "H264: 不支持多 slice group, num_slice_groups={}",
                self.num_slice_groups
            )));
        }
        if matches!(self.slice_type, SliceType::Sp | SliceType::Si) {
            return Err(TaoError::Unsupported(format!(
                "H264: 不支持 {:?} slice",
                self.slice_type
            )));
        }
        if self.is_idr() {
            if self.nal_ref_idc == 0 {
                return Err(TaoError::InvalidData(
                    "H264: IDR slice 的 nal_ref_idc 不能为 0".into(),
                ));
            }
            if self.slice_type != SliceType::I {
                return Err(TaoError::InvalidData(format!(
                    "H264: IDR 图像只能包含 I slice, 实际 {:?}",
                    self.slice_type
                )));
            }
            if self.dec_ref_pic_marking.adaptive {
                return Err(TaoError::InvalidData(
                    "H264: IDR 图像不允许自适应标记".into(),
                ));
            }
        }
        if self.frame_num as i64 >= params.max_frame_num() as i64 {
            return Err(TaoError::InvalidData(format!(
                "H264: frame_num={} 超出范围 (max_frame_num={})",
                self.frame_num,
                params.max_frame_num()
            )));
        }
        if self.first_mb_in_slice >= params.mbs_per_picture() {
            return Err(TaoError::InvalidData(format!(
                "H264: first_mb_in_slice={} 超出图像宏块数 {}",
                self.first_mb_in_slice,
                params.mbs_per_picture()
            )));
        }
        if params.pic_order_cnt_type == 0
            && self.pic_order_cnt_lsb as i64 >= params.max_pic_order_cnt_lsb() as i64
        {
            return Err(TaoError::InvalidData(format!(
                "H264: pic_order_cnt_lsb={} 超出范围",
                self.pic_order_cnt_lsb
            )));
        }
        for list in 0..self.slice_type.num_ref_lists() {
            let count = self.num_ref_idx_active[list];
            if count == 0 || count > 32 {
                return Err(TaoError::InvalidData(format!(
                    "H264: num_ref_idx_l{}_active={} 超出范围 1..=32",
                    list, count
                )));
            }
        }
        if self.deblock.disable_deblocking_filter_idc > 2
            || !(-6..=6).contains(&self.deblock.slice_alpha_c0_offset_div2)
            || !(-6..=6).contains(&self.deblock.slice_beta_offset_div2)
        {
            return Err(TaoError::InvalidData(format!(
                "H264: 去块参数非法, idc={}, alpha={}, beta={}",
                self.deblock.disable_deblocking_filter_idc,
                self.deblock.slice_alpha_c0_offset_div2,
                self.deblock.slice_beta_offset_div2
            )));
        }
        self.validate_marking(params)
    }

    fn validate_marking(&self, params: &StreamParams) -> TaoResult<()> {
        let marking = &self.dec_ref_pic_marking;
        if !marking.adaptive {
            return Ok(());
        }
        let max_idx = params.max_num_ref_frames;
        for op in &marking.ops {
            let idx = match *op {
                MmcoOp::ConvertShortToLong {
                    long_term_frame_idx,
                    ..
                }
                | MmcoOp::MarkCurrentLong {
                    long_term_frame_idx,
                } => long_term_frame_idx,
                MmcoOp::TrimLong {
                    max_long_term_frame_idx_plus1,
                } => {
                    if max_long_term_frame_idx_plus1 > max_idx {
                        return Err(TaoError::InvalidData(format!(
                            "H264: MMCO4 max_long_term_frame_idx_plus1={} 超出范围",
                            max_long_term_frame_idx_plus1
                        )));
                    }
                    continue;
                }
                _ => continue,
            };
            if idx >= max_idx {
                return Err(TaoError::InvalidData(format!(
                    "H264: long_term_frame_idx={} 超出范围 (max_num_ref_frames={})",
                    idx, max_idx
                )));
            }
        }
        Ok(())
    }
}

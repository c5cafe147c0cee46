use tao_core::{TaoError, TaoResult};

use super::super::{Admission, DecoderState, SlotMask};
use crate::header::{
    DecRefPicMarking, MmcoOp, RefPicListMod, SliceHeader, SliceType, StreamParams,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 2x1 宏块, POC type 2, log2_max_frame_num=4
pub fn stream(max_num_ref_frames: u32, max_num_reorder_frames: u32) -> StreamParams {
    StreamParams {
        width_in_mbs: 2,
        height_in_mbs: 1,
        max_num_ref_frames,
        max_num_reorder_frames,
        max_dec_frame_buffering: max_num_ref_frames.max(max_num_reorder_frames),
        log2_max_frame_num: 4,
        pic_order_cnt_type: 2,
        ..StreamParams::default()
    }
}

/// POC type 0 的码流, log2_max_pic_order_cnt_lsb=8
pub fn stream_poc0(max_num_ref_frames: u32, max_num_reorder_frames: u32) -> StreamParams {
    StreamParams {
        pic_order_cnt_type: 0,
        log2_max_pic_order_cnt_lsb: 8,
        ..stream(max_num_ref_frames, max_num_reorder_frames)
    }
}

pub fn idr(idr_pic_id: u32) -> SliceHeader {
    SliceHeader {
        nal_ref_idc: 3,
        nal_unit_type: 5,
        slice_type: SliceType::I,
        idr_pic_id,
        ..SliceHeader::default()
    }
}

/// 参考 P slice, list0 长度为 `num_ref_idx_l0`
pub fn p_slice(frame_num: u32, num_ref_idx_l0: u32) -> SliceHeader {
    SliceHeader {
        nal_ref_idc: 2,
        nal_unit_type: 1,
        slice_type: SliceType::P,
        frame_num,
        num_ref_idx_active: [num_ref_idx_l0, 0],
        ..SliceHeader::default()
    }
}

pub fn b_slice(frame_num: u32, pic_order_cnt_lsb: u32, num_ref_idx_active: [u32; 2]) -> SliceHeader {
    SliceHeader {
        nal_ref_idc: 0,
        nal_unit_type: 1,
        slice_type: SliceType::B,
        frame_num,
        pic_order_cnt_lsb,
        num_ref_idx_active,
        ..SliceHeader::default()
    }
}

pub fn with_lsb(mut header: SliceHeader, pic_order_cnt_lsb: u32) -> SliceHeader {
    header.pic_order_cnt_lsb = pic_order_cnt_lsb;
    header
}

pub fn non_reference(mut header: SliceHeader) -> SliceHeader {
    header.nal_ref_idc = 0;
    header
}

pub fn with_mmco(mut header: SliceHeader, ops: &[MmcoOp]) -> SliceHeader {
    header.dec_ref_pic_marking = DecRefPicMarking {
        adaptive: true,
        ops: ops.to_vec(),
        ..DecRefPicMarking::default()
    };
    header
}

pub fn with_mods(mut header: SliceHeader, list: usize, mods: &[RefPicListMod]) -> SliceHeader {
    header.ref_pic_list_mods[list] = mods.to_vec();
    header
}

/// 按准入顺序开始一幅图像 (没有在途任务)
pub fn begin(dpb: &mut DecoderState, header: &SliceHeader) -> TaoResult<usize> {
    header.validate(dpb.params())?;
    if dpb.current_picture().is_some() {
        dpb.finish_picture();
    }
    let mut frame_num = dpb.unwrap_frame_num(header);
    if !header.is_idr() {
        match dpb.fill_frame_num_gap(frame_num, SlotMask::EMPTY) {
            Admission::Ready(_) => {}
            other => {
                return Err(TaoError::Internal(format!("补帧需要等待: {:?}", other)));
            }
        }
        frame_num = dpb.unwrap_frame_num(header);
    }
    let field_order_cnt = dpb.compute_field_order_cnt(header, frame_num)?;
    let pic_order_cnt = field_order_cnt[0].min(field_order_cnt[1]);
    dpb.build_ref_lists(header, frame_num, pic_order_cnt)?;
    let index = match dpb.acquire_slot(SlotMask::EMPTY) {
        Admission::Ready(index) => index,
        other => {
            return Err(TaoError::Internal(format!("没有可用图像槽: {:?}", other)));
        }
    };
    dpb.begin_picture(index, header, frame_num, field_order_cnt)?;
    if header.is_reference() {
        dpb.mark_current_picture(header);
    }
    dpb.begin_picture_output(index, header.is_idr(), header.is_reference());
    Ok(index)
}

/// 开始一幅图像, 整帧解码完成后结束它
pub fn decode(dpb: &mut DecoderState, header: &SliceHeader) -> TaoResult<usize> {
    let index = begin(dpb, header)?;
    let target = dpb.slot_ref(index);
    let mbs = dpb.params().mbs_per_picture();
    dpb.task_started(index);
    dpb.record_slice_progress(target, 0..mbs, header.deblock)?;
    dpb.task_finished(target)?;
    dpb.finish_picture();
    Ok(index)
}

/// 依次解码, 每幅图像之后取走并归还全部输出
pub fn decode_all(dpb: &mut DecoderState, headers: &[SliceHeader]) -> Vec<usize> {
    headers
        .iter()
        .map(|header| {
            let index = decode(dpb, header).unwrap();
            drain_outputs(dpb, true);
            index
        })
        .collect()
}

/// 取走并归还输出图像, 返回 (槽位, FrameNum, POC)
pub fn drain_outputs(dpb: &mut DecoderState, drain: bool) -> Vec<(usize, i32, i32)> {
    let mut outputs = Vec::new();
    while let Some(handle) = dpb.take_output(drain) {
        outputs.push((handle.slot.index, handle.frame_num, handle.pic_order_cnt));
        dpb.return_frame(handle).unwrap();
    }
    outputs
}

/// 参考帧的 FrameNum (升序)
pub fn ref_frame_nums(dpb: &DecoderState) -> Vec<i32> {
    let mut nums: Vec<i32> = dpb
        .reference_mask()
        .iter()
        .map(|i| dpb.frame_num_of(i))
        .collect();
    nums.sort_unstable();
    nums
}

/// 为下一 slice 构建参考列表 (不开始新图像)
pub fn lists_for(dpb: &DecoderState, header: &SliceHeader) -> TaoResult<[Vec<usize>; 2]> {
    let frame_num = dpb.unwrap_frame_num(header);
    let field_order_cnt = dpb.compute_field_order_cnt(header, frame_num)?;
    let plan = dpb.build_ref_lists(
        header,
        frame_num,
        field_order_cnt[0].min(field_order_cnt[1]),
    )?;
    Ok(plan.lists)
}

pub fn frame_nums_of(dpb: &DecoderState, list: &[usize]) -> Vec<i32> {
    list.iter().map(|&i| dpb.frame_num_of(i)).collect()
}

pub fn pocs_of(dpb: &DecoderState, list: &[usize]) -> Vec<i32> {
    list.iter().map(|&i| dpb.pic_order_cnt_of(i)).collect()
}

use super::super::DecoderState;
use super::helpers::*;
use crate::header::MmcoOp;

#[test]
fn test_sliding_window_keeps_most_recent_frames() {
    init_logger();
    let mut dpb = DecoderState::new(stream(2, 0)).unwrap();
    decode_all(&mut dpb, &[idr(0), p_slice(1, 1), p_slice(2, 1), p_slice(3, 1)]);
    assert_eq!(ref_frame_nums(&dpb), vec![2, 3], "应移除 FrameNum 最小的短期参考帧");
}

#[test]
fn test_reference_count_never_exceeds_limit() {
    let mut dpb = DecoderState::new(stream(3, 1)).unwrap();
    decode_all(&mut dpb, &[idr(0)]);
    for n in 1..30u32 {
        let header = match n % 5 {
            0 => with_mmco(
                p_slice(n % 16, 1),
                &[MmcoOp::MarkCurrentLong {
                    long_term_frame_idx: n % 3,
                }],
            ),
            3 => with_mmco(
                p_slice(n % 16, 1),
                &[MmcoOp::ConvertShortToLong {
                    difference_of_pic_nums_minus1: 0,
                    long_term_frame_idx: 2,
                }],
            ),
            _ => p_slice(n % 16, 1),
        };
        decode_all(&mut dpb, &[header]);
        let refs = dpb.reference_mask();
        assert!(refs.count() <= 3, "参考帧数超过上限, n={}", n);
        assert!(
            (dpb.long_term_mask() - refs).is_empty(),
            "长期参考帧必须是参考帧, n={}",
            n
        );
    }
}

#[test]
fn test_idr_clears_references_and_may_be_long_term() {
    let mut dpb = DecoderState::new(stream(3, 0)).unwrap();
    decode_all(&mut dpb, &[idr(0), p_slice(1, 1), p_slice(2, 1)]);
    let mut header = idr(1);
    header.dec_ref_pic_marking.long_term_reference_flag = true;
    let slot = decode_all(&mut dpb, &[header])[0];
    assert_eq!(dpb.reference_mask().iter().collect::<Vec<_>>(), vec![slot]);
    assert!(dpb.long_term_mask().contains(slot));
    assert_eq!(dpb.snapshot().slots[slot].long_term_frame_idx, Some(0));
}

#[test]
fn test_mmco_forget_short_term() {
    let mut dpb = DecoderState::new(stream(3, 0)).unwrap();
    decode_all(&mut dpb, &[idr(0), p_slice(1, 1), p_slice(2, 1)]);
    let header = with_mmco(
        p_slice(3, 1),
        &[MmcoOp::ForgetShort {
            difference_of_pic_nums_minus1: 1,
        }],
    );
    decode_all(&mut dpb, &[header]);
    assert_eq!(ref_frame_nums(&dpb), vec![0, 2, 3], "MMCO1 应移除 picNum=1");
}

#[test]
fn test_mmco_long_term_lifecycle() {
    init_logger();
    let mut dpb = DecoderState::new(stream(3, 0)).unwrap();
    let slots = decode_all(&mut dpb, &[idr(0), p_slice(1, 1), p_slice(2, 1)]);
    let idr_slot = slots[0];

    // MMCO3: picNum 0 转为长期索引 0, 滑动窗口随后移除 FrameNum 1
    let header = with_mmco(
        p_slice(3, 1),
        &[MmcoOp::ConvertShortToLong {
            difference_of_pic_nums_minus1: 2,
            long_term_frame_idx: 0,
        }],
    );
    decode_all(&mut dpb, &[header]);
    assert_eq!(ref_frame_nums(&dpb), vec![0, 2, 3]);
    assert_eq!(dpb.long_term_mask().iter().collect::<Vec<_>>(), vec![idr_slot]);

    // MMCO2: 移除长期索引 0
    let header = with_mmco(p_slice(4, 1), &[MmcoOp::ForgetLong { long_term_pic_num: 0 }]);
    decode_all(&mut dpb, &[header]);
    assert_eq!(ref_frame_nums(&dpb), vec![2, 3, 4]);
    assert!(dpb.long_term_mask().is_empty());

    // MMCO6: 当前图像标记为长期索引 1
    let header = with_mmco(
        p_slice(5, 1),
        &[MmcoOp::MarkCurrentLong {
            long_term_frame_idx: 1,
        }],
    );
    let current = decode_all(&mut dpb, &[header])[0];
    assert_eq!(ref_frame_nums(&dpb), vec![3, 4, 5]);
    assert_eq!(dpb.snapshot().slots[current].long_term_frame_idx, Some(1));

    // MMCO4: 移除长期索引不小于 1 的参考帧
    let header = with_mmco(
        p_slice(6, 1),
        &[MmcoOp::TrimLong {
            max_long_term_frame_idx_plus1: 1,
        }],
    );
    decode_all(&mut dpb, &[header]);
    assert_eq!(ref_frame_nums(&dpb), vec![3, 4, 6]);
    assert!(dpb.long_term_mask().is_empty());
}

#[test]
fn test_mmco_missing_target_is_ignored() {
    let mut dpb = DecoderState::new(stream(2, 0)).unwrap();
    decode_all(&mut dpb, &[idr(0)]);
    let header = with_mmco(
        p_slice(1, 1),
        &[
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1: 5,
            },
            MmcoOp::ForgetLong { long_term_pic_num: 1 },
        ],
    );
    decode_all(&mut dpb, &[header]);
    assert_eq!(ref_frame_nums(&dpb), vec![0, 1], "找不到目标的 MMCO 不应影响其他参考帧");
}

#[test]
fn test_mmco5_rebases_frame_num_and_poc() {
    init_logger();
    let mut dpb = DecoderState::new(stream_poc0(2, 2)).unwrap();
    let first = decode(&mut dpb, &idr(0)).unwrap();
    let second = decode(&mut dpb, &with_lsb(p_slice(1, 1), 4)).unwrap();
    let header = with_mmco(with_lsb(p_slice(2, 1), 8), &[MmcoOp::ClearAll]);
    let third = decode(&mut dpb, &header).unwrap();

    assert_eq!(dpb.reference_mask().iter().collect::<Vec<_>>(), vec![third]);
    assert_eq!(dpb.frame_num_of(third), 0, "MMCO5 后 FrameNum 归零");
    assert_eq!(dpb.pic_order_cnt_of(third), 0, "MMCO5 后 POC 以自身为零点");
    assert_eq!(dpb.prev_ref_frame_num, 0);
    assert_eq!(dpb.prev_pic_order_cnt, 0);

    // MMCO5 之前的图像先于其输出
    let order: Vec<usize> = drain_outputs(&mut dpb, true)
        .into_iter()
        .map(|(slot, _, _)| slot)
        .collect();
    assert_eq!(order, vec![first, second, third]);

    // 后续 frame_num 从 0 起算, 没有间隔
    let next = decode(&mut dpb, &with_lsb(p_slice(1, 1), 4)).unwrap();
    assert_eq!(dpb.frame_num_of(next), 1);
    assert_eq!(dpb.pic_order_cnt_of(next), 4);
    assert_eq!(dpb.stats().non_existing_frames, 0);
}

#[test]
fn test_full_long_term_set_evicts_highest_index() {
    let mut dpb = DecoderState::new(stream(1, 0)).unwrap();
    let mut header = idr(0);
    header.dec_ref_pic_marking.long_term_reference_flag = true;
    let slots = decode_all(&mut dpb, &[header, p_slice(1, 1)]);
    assert_eq!(
        dpb.reference_mask().iter().collect::<Vec<_>>(),
        vec![slots[1]],
        "没有短期参考帧可移除时应移除长期参考帧"
    );
    assert!(dpb.long_term_mask().is_empty());
}

#[test]
fn test_single_reference_stream_keeps_exactly_one_reference() {
    init_logger();
    let mut dpb = DecoderState::new(stream(1, 0)).unwrap();
    let mut previous = None;
    for header in [idr(0), p_slice(1, 1), p_slice(2, 1)] {
        if let Some(prev) = previous {
            let lists = lists_for(&dpb, &header).unwrap();
            assert_eq!(lists[0], vec![prev], "P slice 应参考上一幅图像");
        }
        let slot = decode_all(&mut dpb, &[header])[0];
        assert_eq!(dpb.reference_mask().count(), 1, "每幅图像之后恰有一个参考帧");
        assert!(dpb.reference_mask().contains(slot));
        previous = Some(slot);
    }
}

#[test]
fn test_mmco5_picture_keeps_reference_order_across_slices() {
    init_logger();
    let mut dpb = DecoderState::new(stream_poc0(3, 2)).unwrap();
    let first = decode(&mut dpb, &idr(0)).unwrap();
    let second = decode(&mut dpb, &with_lsb(p_slice(1, 1), 8)).unwrap();

    let mut header = b_slice(2, 4, [1, 1]);
    header.nal_ref_idc = 1;
    let header = with_mmco(header, &[MmcoOp::ClearAll]);
    let before = lists_for(&dpb, &header).unwrap();
    assert_eq!(pocs_of(&dpb, &before[0]), vec![0]);
    assert_eq!(pocs_of(&dpb, &before[1]), vec![8]);

    let current = begin(&mut dpb, &header).unwrap();
    let mut next_slice = header.clone();
    next_slice.first_mb_in_slice = 1;
    dpb.mark_current_picture(&next_slice);
    let after = lists_for(&dpb, &next_slice).unwrap();
    assert_eq!(after, before, "同一 MMCO5 图像的各 slice 参考列表应一致");
    assert_eq!(pocs_of(&dpb, &after[0]), vec![0], "解码期间参考图像 POC 不应下移");

    let target = dpb.slot_ref(current);
    dpb.task_started(current);
    dpb.record_slice_progress(target, 0..2, Default::default())
        .unwrap();
    dpb.task_finished(target).unwrap();
    dpb.finish_picture();

    let outputs = drain_outputs(&mut dpb, true);
    let order: Vec<usize> = outputs.iter().map(|&(slot, _, _)| slot).collect();
    assert_eq!(order, vec![first, second, current], "MMCO5 之前的图像先输出");
    assert!(outputs[..2].iter().all(|&(_, _, poc)| poc < 0));
    assert_eq!(outputs[2].2, 0);
}

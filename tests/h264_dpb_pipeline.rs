//! H264 DPB 调度流水.
//!
//! 以合成宏块流水线驱动 `Decoder`, 验证:
//! - 多线程下 slice 依赖等待与输出顺序
//! - 有界任务池的非阻塞准入
//! - slice 失败后的错误恢复与降质标记
//! - 码流参数切换与复位

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tao::core::TaoError;
use tao::h264::{
    DeblockParams, Decoder, DecoderConfig, MacroblockPipeline, PictureBuffer, RetryCause,
    SliceContext, SliceHeader, SliceOutcome, SliceType, StreamParams, SubmitStatus, WaitMode,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================
// 合成流水线
// ============================================================

/// 每个 slice 写 `mbs_per_slice` 个宏块, 亮度为 frame_num 的函数;
/// 校验参考图像的像素, 记录解码顺序.
struct SyntheticPipeline {
    mbs_per_slice: u32,
    /// 该 frame_num 的 slice 在解码 1 个宏块后失败
    fail_frame_num: Option<u32>,
    gate: Mutex<bool>,
    gate_cv: Condvar,
    order: Mutex<Vec<(u32, u32)>>,
    mismatches: AtomicUsize,
    deblocked: AtomicU64,
}

impl SyntheticPipeline {
    fn new(mbs_per_slice: u32) -> Self {
        Self {
            mbs_per_slice,
            fail_frame_num: None,
            gate: Mutex::new(true),
            gate_cv: Condvar::new(),
            order: Mutex::new(Vec::new()),
            mismatches: AtomicUsize::new(0),
            deblocked: AtomicU64::new(0),
        }
    }

    fn luma_of(frame_num: i64) -> u8 {
        (frame_num.rem_euclid(16) as u8) * 10 + 5
    }

    fn set_gate(&self, open: bool) {
        *self.gate.lock().unwrap() = open;
        self.gate_cv.notify_all();
    }

    fn order(&self) -> Vec<(u32, u32)> {
        self.order.lock().unwrap().clone()
    }
}

impl MacroblockPipeline for SyntheticPipeline {
    fn decode_slice(&self, ctx: &mut SliceContext<'_>) -> SliceOutcome {
        {
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.gate_cv.wait(open).unwrap();
            }
        }
        let header = ctx.header;
        let first = header.first_mb_in_slice;
        let end = (first + self.mbs_per_slice).min(ctx.picture.mb_count());
        for refs in &ctx.ref_lists {
            for reference in refs {
                let Some(pixels) = reference.pixels else {
                    continue;
                };
                let expected = Self::luma_of(reference.frame_num as i64);
                if (0..pixels.mb_count()).any(|mb| pixels.mb_luma_sample(mb, 0, 0) != expected) {
                    self.mismatches.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.order
            .lock()
            .unwrap()
            .push((header.frame_num, first));

        let luma = Self::luma_of(header.frame_num as i64);
        if self.fail_frame_num == Some(header.frame_num) {
            ctx.picture.fill_mb(first, luma, 128, 128);
            return SliceOutcome::failed(first + 1, "合成错误");
        }
        for mb in first..end {
            ctx.picture.fill_mb(mb, luma, 128, 128);
        }
        SliceOutcome::complete(end)
    }

    fn deblock(&self, _picture: &mut PictureBuffer, mbs: std::ops::Range<u32>, _: &DeblockParams) {
        self.deblocked
            .fetch_add((mbs.end - mbs.start) as u64, Ordering::Relaxed);
    }
}

// ============================================================
// slice 构造
// ============================================================

fn stream(max_num_ref_frames: u32, max_num_reorder_frames: u32) -> StreamParams {
    StreamParams {
        width_in_mbs: 2,
        height_in_mbs: 2,
        max_num_ref_frames,
        max_num_reorder_frames,
        max_dec_frame_buffering: max_num_ref_frames.max(max_num_reorder_frames),
        log2_max_frame_num: 4,
        pic_order_cnt_type: 2,
        ..StreamParams::default()
    }
}

fn idr_slice(first_mb: u32) -> SliceHeader {
    SliceHeader {
        nal_ref_idc: 3,
        nal_unit_type: 5,
        slice_type: SliceType::I,
        first_mb_in_slice: first_mb,
        ..SliceHeader::default()
    }
}

fn p_slice(frame_num: u32, first_mb: u32, num_ref_idx_l0: u32) -> SliceHeader {
    SliceHeader {
        nal_ref_idc: 2,
        nal_unit_type: 1,
        slice_type: SliceType::P,
        frame_num,
        first_mb_in_slice: first_mb,
        num_ref_idx_active: [num_ref_idx_l0, 0],
        ..SliceHeader::default()
    }
}

fn decoder(threads: usize, task_slots: usize, pipeline: Arc<SyntheticPipeline>) -> Decoder {
    let config = DecoderConfig {
        worker_threads: threads,
        task_slots,
        non_blocking: false,
    };
    Decoder::new(config, pipeline).expect("创建解码器失败")
}

/// 取走并归还全部可输出图像, 返回 (frame_num, degraded)
fn collect_output(decoder: &mut Decoder, drain: bool) -> Vec<(i32, bool)> {
    let mut frames = Vec::new();
    while let Some(frame) = decoder.get_output_frame(drain) {
        frames.push((frame.frame_num, frame.degraded));
        decoder.return_frame(frame).expect("归还图像失败");
    }
    frames
}

/// 阻塞提交; 图像槽全被待输出图像占用时先取走输出再重试
fn submit_until_accepted(
    decoder: &mut Decoder,
    header: SliceHeader,
    outputs: &mut Vec<(i32, bool)>,
) {
    loop {
        match decoder.submit_slice(header.clone(), WaitMode::Blocking).unwrap() {
            SubmitStatus::Accepted => return,
            SubmitStatus::Retry(RetryCause::OutputPending) => {
                outputs.extend(collect_output(decoder, false));
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            SubmitStatus::Retry(cause) => panic!("阻塞提交不应返回 {:?}", cause),
        }
    }
}

// ============================================================
// 测试
// ============================================================

#[test]
fn test_multithreaded_stream_respects_dependencies() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(2));
    let mut decoder = decoder(4, 8, pipeline.clone());
    assert_eq!(
        decoder.configure(stream(3, 0), WaitMode::Blocking).unwrap(),
        SubmitStatus::Accepted
    );

    const FRAMES: u32 = 40;
    let mut outputs = Vec::new();
    for n in 0..FRAMES {
        for first_mb in [0, 2] {
            let header = if n == 0 {
                idr_slice(first_mb)
            } else {
                p_slice(n % 16, first_mb, n.min(3))
            };
            submit_until_accepted(&mut decoder, header, &mut outputs);
        }
        outputs.extend(collect_output(&mut decoder, false));
    }
    outputs.extend(collect_output(&mut decoder, true));

    let frame_nums: Vec<i32> = outputs.iter().map(|&(n, _)| n).collect();
    assert_eq!(frame_nums, (0..FRAMES as i32).collect::<Vec<_>>(), "应按解码顺序输出");
    assert!(outputs.iter().all(|&(_, degraded)| !degraded));
    assert_eq!(
        pipeline.mismatches.load(Ordering::Relaxed),
        0,
        "参考图像在完成之前被读取"
    );
    assert_eq!(
        pipeline.deblocked.load(Ordering::Relaxed),
        FRAMES as u64 * 4,
        "每个宏块应恰好去块一次"
    );
    let stats = decoder.stats();
    assert_eq!(stats.pictures, FRAMES as u64);
    assert_eq!(stats.output_frames, FRAMES as u64);
    assert_eq!(decoder.busy_tasks(), 0);
}

#[test]
fn test_bounded_task_pool_and_dependent_slice() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(2));
    pipeline.set_gate(false);
    let mut decoder = decoder(2, 3, pipeline.clone());
    decoder.configure(stream(2, 0), WaitMode::Blocking).unwrap();

    let slices = [idr_slice(0), idr_slice(2), p_slice(1, 0, 1)];
    for header in slices {
        assert_eq!(
            decoder.submit_slice(header, WaitMode::NonBlocking).unwrap(),
            SubmitStatus::Accepted
        );
    }
    assert_eq!(decoder.busy_tasks(), 3);
    assert_eq!(
        decoder
            .submit_slice(p_slice(1, 2, 1), WaitMode::NonBlocking)
            .unwrap(),
        SubmitStatus::Retry(RetryCause::NoTaskSlot),
        "任务池已满时非阻塞提交应返回可重试状态"
    );

    pipeline.set_gate(true);
    assert_eq!(
        decoder
            .submit_slice(p_slice(1, 2, 1), WaitMode::Blocking)
            .unwrap(),
        SubmitStatus::Accepted
    );
    decoder.flush(WaitMode::Blocking).unwrap();

    let order = pipeline.order();
    let last_idr = order.iter().rposition(|&(fnum, _)| fnum == 0).unwrap();
    let first_p = order.iter().position(|&(fnum, _)| fnum == 1).unwrap();
    assert!(last_idr < first_p, "P slice 应等待参考图像完成, 实际顺序 {:?}", order);
    assert_eq!(pipeline.mismatches.load(Ordering::Relaxed), 0);

    let outputs = collect_output(&mut decoder, true);
    assert_eq!(outputs, vec![(0, false), (1, false)]);
}

#[test]
fn test_inline_mode_runs_callbacks_in_submit() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(4));
    let mut decoder = decoder(0, 1, pipeline.clone());
    decoder.configure(stream(1, 0), WaitMode::Blocking).unwrap();

    let reports = Arc::new(Mutex::new(Vec::new()));
    for header in [idr_slice(0), p_slice(1, 0, 1)] {
        let sink = reports.clone();
        let status = decoder
            .submit_slice_with_callback(header, WaitMode::Blocking, move |report| {
                sink.lock().unwrap().push(report);
            })
            .unwrap();
        assert_eq!(status, SubmitStatus::Accepted);
        assert_eq!(decoder.busy_tasks(), 0, "同步模式下任务应在提交内完成");
    }
    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.end_mb == 4 && !r.recovered));

    let frame = decoder.get_output_frame(false).expect("IDR 应已输出");
    assert_eq!(frame.frame_num, 0);
    assert!(decoder.wait_for_progress(frame.slot, 3).unwrap());
    assert_eq!(frame.pixels().mb_luma_sample(3, 0, 0), 5);
    decoder.return_frame(frame).unwrap();
}

#[test]
fn test_failed_slice_is_recovered_and_marked_degraded() {
    init_logger();
    let mut pipeline = SyntheticPipeline::new(4);
    pipeline.fail_frame_num = Some(1);
    let pipeline = Arc::new(pipeline);
    let mut decoder = decoder(2, 4, pipeline.clone());
    decoder.configure(stream(2, 0), WaitMode::Blocking).unwrap();

    let report = Arc::new(Mutex::new(None));
    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();
    let sink = report.clone();
    decoder
        .submit_slice_with_callback(p_slice(1, 0, 1), WaitMode::Blocking, move |r| {
            *sink.lock().unwrap() = Some(r);
        })
        .unwrap();
    decoder.submit_slice(p_slice(2, 0, 2), WaitMode::Blocking).unwrap();

    let outputs = collect_output(&mut decoder, true);
    assert_eq!(outputs, vec![(0, false), (1, true), (2, false)]);

    let report = report.lock().unwrap().clone().expect("回调未执行");
    assert!(report.recovered);
    assert_eq!(report.end_mb, 1);
    assert!(report.error.is_some());
    let stats = decoder.stats();
    assert_eq!(stats.recovered_slices, 1);
    assert_eq!(stats.concealed_pictures, 1, "未覆盖的宏块应被隐藏");
}

#[test]
fn test_invalid_slices_are_dropped_and_unsupported_stops_stream() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(4));
    let mut decoder = decoder(0, 2, pipeline);

    assert!(matches!(
        decoder.submit_slice(idr_slice(0), WaitMode::Blocking),
        Err(TaoError::InvalidArgument(_))
    ));
    decoder.configure(stream(1, 0), WaitMode::Blocking).unwrap();
    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();

    let err = decoder
        .submit_slice(p_slice(1, 0, 2), WaitMode::Blocking)
        .unwrap_err();
    assert!(err.is_recoverable(), "参考帧不足属于可恢复错误: {}", err);

    let mut field = p_slice(1, 0, 1);
    field.field_pic_flag = true;
    assert!(matches!(
        decoder.submit_slice(field, WaitMode::Blocking),
        Err(TaoError::Unsupported(_))
    ));
    assert!(
        matches!(
            decoder.submit_slice(p_slice(1, 0, 1), WaitMode::Blocking),
            Err(TaoError::Unsupported(_))
        ),
        "遇到不支持的特性后码流应停止解码"
    );
    assert_eq!(decoder.busy_tasks(), 0);
    assert_eq!(collect_output(&mut decoder, true), vec![(0, false)], "停止前的图像仍可输出");
    assert_eq!(decoder.stats().dropped_slices, 1);

    decoder.reset();
    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();
    decoder.submit_slice(p_slice(1, 0, 1), WaitMode::Blocking).unwrap();
    assert_eq!(collect_output(&mut decoder, true).len(), 2, "复位后恢复解码");
}

#[test]
fn test_lost_first_slice_uses_poc_base_of_finished_picture() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(2));
    let mut decoder = decoder(0, 2, pipeline);
    let params = StreamParams {
        pic_order_cnt_type: 0,
        log2_max_pic_order_cnt_lsb: 4,
        ..stream(2, 2)
    };
    decoder.configure(params, WaitMode::Blocking).unwrap();
    for first_mb in [0, 2] {
        decoder.submit_slice(idr_slice(first_mb), WaitMode::Blocking).unwrap();
    }
    let mut partial = p_slice(1, 0, 1);
    partial.pic_order_cnt_lsb = 6;
    decoder.submit_slice(partial, WaitMode::Blocking).unwrap();

    // 下一幅参考图像的第一个 slice 丢失, 只能由 POC 变化判定为新图像
    let mut next = p_slice(1, 2, 1);
    next.pic_order_cnt_lsb = 12;
    decoder.submit_slice(next, WaitMode::Blocking).unwrap();

    let snapshot = decoder.snapshot().unwrap();
    let current = snapshot.current.expect("应有正在解码的图像");
    assert_eq!(
        snapshot.slots[current].pic_order_cnt, 12,
        "POC 应以上一参考图像 (POC 6) 为基准"
    );
    assert_eq!(
        collect_output(&mut decoder, true),
        vec![(0, false), (1, true), (1, true)]
    );
}

#[test]
fn test_reconfigure_outputs_pending_pictures_first() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(4));
    let mut decoder = decoder(2, 4, pipeline);
    decoder.configure(stream(2, 2), WaitMode::Blocking).unwrap();
    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();
    decoder.submit_slice(p_slice(1, 0, 1), WaitMode::Blocking).unwrap();
    assert_eq!(
        decoder.configure(stream(2, 2), WaitMode::Blocking).unwrap(),
        SubmitStatus::Accepted,
        "参数未变化时无操作"
    );

    let mut larger = stream(2, 2);
    larger.width_in_mbs = 4;
    assert_eq!(
        decoder.configure(larger.clone(), WaitMode::Blocking).unwrap(),
        SubmitStatus::Retry(RetryCause::OutputPending)
    );
    let outputs = collect_output(&mut decoder, false);
    assert_eq!(outputs, vec![(0, false), (1, false)]);
    assert_eq!(
        decoder.configure(larger, WaitMode::Blocking).unwrap(),
        SubmitStatus::Accepted
    );
    let snapshot = decoder.snapshot().unwrap();
    assert!(snapshot.reference_slots().is_empty());
}

#[test]
fn test_reset_invalidates_outstanding_handles() {
    init_logger();
    let pipeline = Arc::new(SyntheticPipeline::new(4));
    let mut decoder = decoder(1, 2, pipeline);
    decoder.configure(stream(1, 0), WaitMode::Blocking).unwrap();
    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();
    let frame = decoder.get_output_frame(true).unwrap();

    decoder.reset();
    decoder.reset();
    let snapshot = decoder.snapshot().unwrap();
    assert!(snapshot.output_slots().is_empty());
    assert!(matches!(
        decoder.return_frame(frame),
        Err(TaoError::Internal(_))
    ));

    decoder.submit_slice(idr_slice(0), WaitMode::Blocking).unwrap();
    assert_eq!(collect_output(&mut decoder, true), vec![(0, false)]);
}

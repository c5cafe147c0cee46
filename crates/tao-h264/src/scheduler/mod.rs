//! 并发 slice 任务调度器.
//!
//! 一把全局互斥锁保护 DPB 状态与任务池, 三个条件变量:
//! - `task_complete`: 任务结束 (任务槽或图像槽可能空出)
//! - `task_ready`: 有任务的依赖全部满足, 唤醒工作线程
//! - `task_progress`: 图像去块进度或完成状态推进
//!
//! 宏块解码在锁外执行. 工作线程数为 0 时任务在 `submit_slice` 内同步执行.

mod task;
mod worker;

pub use task::{SliceCallback, TaskState};

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Serialize;
use tao_core::{TaoError, TaoResult};

use crate::config::{DecoderConfig, WaitMode};
use crate::dpb::{Admission, DecoderState, DpbSnapshot, DpbStats, PictureHandle, SlotRef};
use crate::header::{SliceHeader, StreamParams};
use crate::pipeline::MacroblockPipeline;

use task::{SliceJob, TaskPool};

// ============================================================
// 公共类型
// ============================================================

/// 可重试状态的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryCause {
    /// 任务池已满
    NoTaskSlot,
    /// 空闲图像槽仍被在途任务依赖
    PictureSlotBusy,
    /// 需先取走或归还输出图像
    OutputPending,
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitStatus {
    Accepted,
    Retry(RetryCause),
}

/// slice 完成报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceReport {
    pub slot: SlotRef,
    pub first_mb: u32,
    pub end_mb: u32,
    /// 是否经过错误恢复
    pub recovered: bool,
    pub error: Option<String>,
}

// ============================================================
// 共享状态
// ============================================================

pub(crate) struct SchedulerState {
    pub dpb: Option<DecoderState>,
    pub tasks: TaskPool,
    pub shutdown: bool,
    /// 遇到不支持的特性或图像存储分配失败后码流停止解码, 直到 `reset()`/`configure()`
    pub failed: Option<TaoError>,
}

pub(crate) struct Shared {
    state: Mutex<SchedulerState>,
    task_complete: Condvar,
    task_ready: Condvar,
    task_progress: Condvar,
    pipeline: Arc<dyn MacroblockPipeline>,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        match condvar.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 阻塞直到没有在途任务
    fn wait_idle<'a>(
        &'a self,
        mut state: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        while !state.tasks.is_idle() {
            state = self.wait(&self.task_complete, state);
        }
        state
    }
}

/// 图像完成后唤醒依赖它的任务
pub(crate) fn wake_dependents(state: &mut SchedulerState, completed: Option<usize>) -> bool {
    match completed {
        Some(slot) => state.tasks.on_picture_complete(slot) > 0,
        None => false,
    }
}

/// 结束当前图像, 返回是否有任务因此就绪
fn finish_current(state: &mut SchedulerState) -> bool {
    let completed = match state.dpb.as_mut() {
        Some(dpb) => dpb.finish_picture(),
        None => None,
    };
    wake_dependents(state, completed)
}

// ============================================================
// 解码器
// ============================================================

/// DPB 管理与 slice 任务调度的入口
///
/// 提交端为单线程 (`&mut self`), 快照与统计可并发读取.
pub struct Decoder {
    config: DecoderConfig,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Decoder {
    /// 创建解码器并启动工作线程
    pub fn new(config: DecoderConfig, pipeline: Arc<dyn MacroblockPipeline>) -> TaoResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                dpb: None,
                tasks: TaskPool::new(config.task_slots),
                shutdown: false,
                failed: None,
            }),
            task_complete: Condvar::new(),
            task_ready: Condvar::new(),
            task_progress: Condvar::new(),
            pipeline,
        });
        let mut decoder = Self {
            config,
            shared,
            workers: Vec::new(),
        };
        for index in 0..decoder.config.worker_threads {
            let shared = decoder.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("tao-h264-worker-{}", index))
                .spawn(move || worker::run_worker(index, shared))
                .map_err(|e| TaoError::Internal(format!("H264: 启动工作线程失败, {}", e)))?;
            decoder.workers.push(handle);
        }
        info!(
            "H264: 调度器已启动, 工作线程 {}, 任务槽 {}",
            decoder.config.worker_threads,
            decoder.shared.lock_state().tasks.capacity()
        );
        Ok(decoder)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// 激活码流参数
    ///
    /// 参数未变化时无操作. 格式变化且仍有待输出或借出图像时,
    /// 水位线被提升以输出全部图像, 返回 `Retry(OutputPending)`.
    pub fn configure(&mut self, params: StreamParams, mode: WaitMode) -> TaoResult<SubmitStatus> {
        let mode = self.config.effective_mode(mode);
        params.validate()?;
        let normalized = params.clone().normalized();
        let mut state = self.shared.lock_state();

        let pending = match state.dpb.as_ref() {
            Some(dpb) if dpb.params() == &normalized && state.failed.is_none() => {
                return Ok(SubmitStatus::Accepted);
            }
            Some(dpb) => !(dpb.output_mask() | dpb.borrowed_mask()).is_empty(),
            None => false,
        };
        if pending {
            if finish_current(&mut state) {
                self.shared.task_ready.notify_all();
            }
            if let Some(dpb) = state.dpb.as_mut() {
                dpb.release_all_output();
            }
            debug!("H264: 码流参数变化, 等待输出剩余图像");
            if mode == WaitMode::Blocking {
                drop(self.shared.wait_idle(state));
            }
            return Ok(SubmitStatus::Retry(RetryCause::OutputPending));
        }

        if !state.tasks.is_idle() {
            if mode == WaitMode::NonBlocking {
                return Ok(SubmitStatus::Retry(RetryCause::PictureSlotBusy));
            }
            state = self.shared.wait_idle(state);
        }
        state.dpb = Some(DecoderState::new(params)?.with_deblocker(self.shared.pipeline.clone()));
        state.failed = None;
        info!(
            "H264: 码流参数已激活, {}x{} 宏块, max_num_ref_frames={}",
            normalized.width_in_mbs, normalized.height_in_mbs, normalized.max_num_ref_frames
        );
        Ok(SubmitStatus::Accepted)
    }

    /// 提交一个 slice
    pub fn submit_slice(&mut self, header: SliceHeader, mode: WaitMode) -> TaoResult<SubmitStatus> {
        self.submit(header, mode, None)
    }

    /// 提交一个 slice, 解码结束后在锁外调用 `callback`
    pub fn submit_slice_with_callback<F>(
        &mut self,
        header: SliceHeader,
        mode: WaitMode,
        callback: F,
    ) -> TaoResult<SubmitStatus>
    where
        F: FnOnce(SliceReport) + Send + 'static,
    {
        self.submit(header, mode, Some(Box::new(callback)))
    }

    fn submit(
        &mut self,
        header: SliceHeader,
        mode: WaitMode,
        callback: Option<SliceCallback>,
    ) -> TaoResult<SubmitStatus> {
        let mode = self.config.effective_mode(mode);
        let header = Arc::new(header);
        let shared = &*self.shared;
        let mut state = shared.lock_state();
        if let Some(err) = &state.failed {
            return Err(err.clone());
        }

        let task_id = loop {
            if let Some(id) = state.tasks.reserve() {
                break id;
            }
            if mode == WaitMode::NonBlocking || self.workers.is_empty() {
                return Ok(SubmitStatus::Retry(RetryCause::NoTaskSlot));
            }
            state = shared.wait(&shared.task_complete, state);
        };

        let admitted = loop {
            let result = admit(&mut state, &header);
            shared.task_ready.notify_all();
            shared.task_progress.notify_all();
            match result {
                Ok(Admission::Ready(admitted)) => break admitted,
                Ok(Admission::WaitForTasks)
                    if mode == WaitMode::Blocking && !self.workers.is_empty() =>
                {
                    debug!("H264: 空闲图像槽仍被依赖, 等待任务完成");
                    state = shared.wait(&shared.task_complete, state);
                }
                Ok(Admission::WaitForTasks) => {
                    state.tasks.cancel(task_id);
                    return Ok(SubmitStatus::Retry(RetryCause::PictureSlotBusy));
                }
                Ok(Admission::NeedOutput) => {
                    state.tasks.cancel(task_id);
                    return Ok(SubmitStatus::Retry(RetryCause::OutputPending));
                }
                Err(err) => {
                    state.tasks.cancel(task_id);
                    if err.is_recoverable() {
                        if let Some(dpb) = state.dpb.as_mut() {
                            dpb.note_dropped_slice(&err);
                        }
                    } else if matches!(err, TaoError::Unsupported(_) | TaoError::OutOfMemory(_)) {
                        error!("H264: 码流停止解码, {}", err);
                        state.failed = Some(err.clone());
                    } else {
                        warn!("H264: 拒绝 slice, {}", err);
                    }
                    return Err(err);
                }
            }
        };

        let (job, unmet) = admitted;
        let ready = state.tasks.enqueue(task_id, job, unmet, callback);
        if self.workers.is_empty() {
            while let Some(id) = state.tasks.pop_ready() {
                state = worker::execute_task(shared, state, id);
            }
        } else if ready {
            shared.task_ready.notify_one();
        }
        Ok(SubmitStatus::Accepted)
    }

    /// 结束当前图像并等待全部任务完成
    pub fn flush(&mut self, mode: WaitMode) -> TaoResult<SubmitStatus> {
        let mode = self.config.effective_mode(mode);
        let shared = &*self.shared;
        let mut state = shared.lock_state();
        if finish_current(&mut state) {
            shared.task_ready.notify_all();
        }
        shared.task_progress.notify_all();
        if !state.tasks.is_idle() {
            if mode == WaitMode::NonBlocking {
                return Ok(SubmitStatus::Retry(RetryCause::PictureSlotBusy));
            }
            state = shared.wait_idle(state);
        }
        drop(state);
        Ok(SubmitStatus::Accepted)
    }

    /// 取下一帧输出图像; `drain` 时先结束当前图像并忽略水位线
    pub fn get_output_frame(&mut self, drain: bool) -> Option<PictureHandle> {
        if drain {
            if let Err(err) = self.flush(WaitMode::Blocking) {
                warn!("H264: 输出前刷新失败, {}", err);
            }
        }
        let mut state = self.shared.lock_state();
        state.dpb.as_mut()?.take_output(drain)
    }

    /// 归还输出图像
    pub fn return_frame(&mut self, handle: PictureHandle) -> TaoResult<()> {
        let mut state = self.shared.lock_state();
        let dpb = state
            .dpb
            .as_mut()
            .ok_or_else(|| TaoError::Internal("H264: 码流未配置, 不能归还图像".into()))?;
        dpb.return_frame(handle)?;
        self.shared.task_complete.notify_all();
        Ok(())
    }

    /// 等待图像去块进度越过 `mb_addr`
    ///
    /// 返回 `false` 表示该图像暂无在途任务, 在提交更多 slice 之前不会再推进.
    pub fn wait_for_progress(&self, slot: SlotRef, mb_addr: u32) -> TaoResult<bool> {
        let shared = &*self.shared;
        let mut state = shared.lock_state();
        loop {
            let dpb = state
                .dpb
                .as_ref()
                .ok_or_else(|| TaoError::Internal("H264: 码流未配置".into()))?;
            dpb.check_slot_ref(slot)?;
            let progress = dpb.progress_of(slot.index);
            if progress.complete || progress.next_deblock_addr > mb_addr {
                return Ok(true);
            }
            if progress.tasks_in_flight == 0 {
                return Ok(false);
            }
            state = shared.wait(&shared.task_progress, state);
        }
    }

    /// 释放全部图像槽, 保留码流参数; 清除停止解码状态
    pub fn reset(&mut self) {
        let shared = &*self.shared;
        let mut state = shared.lock_state();
        state = shared.wait_idle(state);
        if let Some(dpb) = state.dpb.as_mut() {
            dpb.release_on_reset();
        }
        state.failed = None;
        debug!("H264: 解码器已复位");
    }

    /// DPB 快照, 未配置码流时为 `None`
    pub fn snapshot(&self) -> Option<DpbSnapshot> {
        self.shared.lock_state().dpb.as_ref().map(|dpb| dpb.snapshot())
    }

    pub fn stats(&self) -> DpbStats {
        self.shared
            .lock_state()
            .dpb
            .as_ref()
            .map(|dpb| dpb.stats().clone())
            .unwrap_or_default()
    }

    /// 在途任务数
    pub fn busy_tasks(&self) -> usize {
        self.shared.lock_state().tasks.busy_count()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        let shared = &*self.shared;
        let mut state = shared.lock_state();
        if finish_current(&mut state) {
            shared.task_ready.notify_all();
        }
        if self.workers.is_empty() {
            while let Some(id) = state.tasks.pop_ready() {
                state = worker::execute_task(shared, state, id);
            }
        } else {
            state = shared.wait_idle(state);
        }
        state.shutdown = true;
        drop(state);
        shared.task_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("H264: 工作线程异常退出");
            }
        }
    }
}

// ============================================================
// 准入
// ============================================================

type Admitted = (SliceJob, crate::dpb::SlotMask);

/// 一次准入尝试; 等待资源时返回 `WaitForTasks`/`NeedOutput`, 重试时各步骤幂等
fn admit(state: &mut SchedulerState, header: &Arc<SliceHeader>) -> TaoResult<Admission<Admitted>> {
    let SchedulerState { dpb, tasks, .. } = state;
    let dpb = dpb
        .as_mut()
        .ok_or_else(|| TaoError::InvalidArgument("H264: 尚未配置码流参数".into()))?;
    header.validate(dpb.params())?;

    let leaves_current = match dpb.current_picture() {
        Some(cur) => cur.frame_num != header.frame_num || header.first_mb_in_slice == 0,
        None => false,
    };
    if leaves_current {
        let completed = dpb.finish_picture();
        if let Some(slot) = completed {
            tasks.on_picture_complete(slot);
        }
    }

    // 与当前图像比较时使用当前图像开始时的 POC 基准
    if dpb.current_picture().is_some() {
        let frame_num = dpb.unwrap_frame_num(header);
        let field_order_cnt = dpb.compute_field_order_cnt(header, frame_num)?;
        if dpb.starts_new_picture(header, field_order_cnt) {
            if let Some(slot) = dpb.finish_picture() {
                tasks.on_picture_complete(slot);
            }
        }
    }

    if !header.is_idr() && dpb.current_picture().is_none() {
        let frame_num = dpb.unwrap_frame_num(header);
        match dpb.fill_frame_num_gap(frame_num, tasks.depended_slots()) {
            Admission::Ready(_) => {}
            Admission::WaitForTasks => return Ok(Admission::WaitForTasks),
            Admission::NeedOutput => return Ok(Admission::NeedOutput),
        }
    }
    let frame_num = dpb.unwrap_frame_num(header);
    let field_order_cnt = dpb.compute_field_order_cnt(header, frame_num)?;
    if let Some(cur) = dpb.current_picture() {
        if dpb.progress_of(cur.slot).complete {
            return Err(TaoError::InvalidData(format!(
                "H264: 图像 slot={} 已解码完成, 丢弃重复 slice first_mb={}",
                cur.slot, header.first_mb_in_slice
            )));
        }
    }

    let pic_order_cnt = field_order_cnt[0].min(field_order_cnt[1]);
    let plan = dpb.build_ref_lists(header, frame_num, pic_order_cnt)?;

    let new_picture = dpb.current_picture().is_none();
    if new_picture {
        let index = match dpb.acquire_slot(tasks.depended_slots()) {
            Admission::Ready(index) => index,
            Admission::WaitForTasks => return Ok(Admission::WaitForTasks),
            Admission::NeedOutput => return Ok(Admission::NeedOutput),
        };
        dpb.begin_picture(index, header, frame_num, field_order_cnt)?;
    }
    let Some(slot) = dpb.current_slot() else {
        return Err(TaoError::Internal("H264: 当前图像丢失".into()));
    };
    if header.is_reference() {
        dpb.mark_current_picture(header);
    }
    if new_picture {
        dpb.begin_picture_output(slot, header.is_idr(), header.is_reference());
    }

    let lists = plan.resolve(slot, header.num_ref_idx_active);
    let deps = dpb.dependency_mask(&lists, slot);
    let unmet = deps & dpb.incomplete_mask();
    let ref_lists = [
        lists[0].iter().map(|&i| dpb.slot_ref(i)).collect(),
        lists[1].iter().map(|&i| dpb.slot_ref(i)).collect(),
    ];
    let job = SliceJob {
        header: header.clone(),
        target: dpb.slot_ref(slot),
        ref_lists,
        deps,
    };
    dpb.task_started(slot);
    debug!(
        "H264: 接受 slice, slot={}, first_mb={}, {:?}, 依赖 {:?}, 未满足 {:?}",
        slot, header.first_mb_in_slice, header.slice_type, deps, unmet
    );
    Ok(Admission::Ready((job, unmet)))
}

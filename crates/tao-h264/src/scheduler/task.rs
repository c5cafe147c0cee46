//! 有界 slice 任务池与依赖计数.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::dpb::{SlotMask, SlotRef};
use crate::header::SliceHeader;

use super::SliceReport;

/// slice 完成回调, 在调度器锁之外执行
pub type SliceCallback = Box<dyn FnOnce(SliceReport) + Send>;

/// 任务状态: `Free → Reserved → Queued → Running → Completing → Free`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    Reserved,
    Queued,
    Running,
    Completing,
}

/// 一个 slice 的解码作业
#[derive(Debug, Clone)]
pub(crate) struct SliceJob {
    pub header: Arc<SliceHeader>,
    pub target: SlotRef,
    pub ref_lists: [Vec<SlotRef>; 2],
    /// 运动补偿可能读取的槽位 (不含目标槽位)
    pub deps: SlotMask,
}

struct Task {
    state: TaskState,
    job: Option<SliceJob>,
    /// 尚未完成的依赖槽位, 计数归零时进入就绪队列
    unmet: SlotMask,
    callback: Option<SliceCallback>,
}

impl Task {
    fn free() -> Self {
        Self {
            state: TaskState::Free,
            job: None,
            unmet: SlotMask::EMPTY,
            callback: None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state)
            .field("target", &self.job.as_ref().map(|j| j.target))
            .field("unmet", &self.unmet)
            .finish()
    }
}

/// 固定容量的任务池
#[derive(Debug)]
pub(crate) struct TaskPool {
    tasks: Vec<Task>,
    ready: VecDeque<usize>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let mut tasks = Vec::with_capacity(capacity);
        tasks.resize_with(capacity, Task::free);
        Self {
            tasks,
            ready: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tasks.len()
    }

    pub fn state(&self, id: usize) -> TaskState {
        self.tasks[id].state
    }

    /// 预留一个空闲任务
    pub fn reserve(&mut self) -> Option<usize> {
        let id = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Free)?;
        self.tasks[id].state = TaskState::Reserved;
        Some(id)
    }

    /// 放弃预留 (slice 未被接受)
    pub fn cancel(&mut self, id: usize) {
        debug_assert_eq!(self.tasks[id].state, TaskState::Reserved);
        self.tasks[id] = Task::free();
    }

    /// 提交作业, 依赖已全部满足时立即就绪; 返回是否就绪
    pub fn enqueue(
        &mut self,
        id: usize,
        job: SliceJob,
        unmet: SlotMask,
        callback: Option<SliceCallback>,
    ) -> bool {
        let task = &mut self.tasks[id];
        debug_assert_eq!(task.state, TaskState::Reserved);
        task.state = TaskState::Queued;
        task.job = Some(job);
        task.unmet = unmet;
        task.callback = callback;
        if unmet.is_empty() {
            self.ready.push_back(id);
            true
        } else {
            false
        }
    }

    /// 取出一个就绪任务并转为运行状态
    pub fn pop_ready(&mut self) -> Option<usize> {
        let id = self.ready.pop_front()?;
        self.tasks[id].state = TaskState::Running;
        Some(id)
    }

    pub fn job(&self, id: usize) -> Option<&SliceJob> {
        self.tasks[id].job.as_ref()
    }

    pub fn mark_completing(&mut self, id: usize) {
        debug_assert_eq!(self.tasks[id].state, TaskState::Running);
        self.tasks[id].state = TaskState::Completing;
    }

    /// 释放任务, 返回待执行的回调
    pub fn release(&mut self, id: usize) -> Option<SliceCallback> {
        let callback = self.tasks[id].callback.take();
        self.tasks[id] = Task::free();
        callback
    }

    /// 图像完成: 依赖该槽位的排队任务计数减一, 归零的进入就绪队列
    ///
    /// 返回新就绪的任务数.
    pub fn on_picture_complete(&mut self, slot: usize) -> usize {
        let mut woken = 0;
        for (id, task) in self.tasks.iter_mut().enumerate() {
            if task.state != TaskState::Queued || !task.unmet.contains(slot) {
                continue;
            }
            task.unmet.remove(slot);
            if task.unmet.is_empty() {
                self.ready.push_back(id);
                woken += 1;
            }
        }
        woken
    }

    /// 在途任务读写的全部槽位
    pub fn depended_slots(&self) -> SlotMask {
        let mut mask = SlotMask::EMPTY;
        for job in self.tasks.iter().filter_map(|t| t.job.as_ref()) {
            mask |= job.deps;
            mask.insert(job.target.index);
        }
        mask
    }

    pub fn busy_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state != TaskState::Free)
            .count()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Free)
    }
}

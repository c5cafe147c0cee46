//! 工作线程与单个 slice 任务的执行.

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, RwLockReadGuard};

use log::{debug, error, warn};

use crate::dpb::{PictureBuffer, SharedPicture, SlotRef, read_picture, write_picture};
use crate::pipeline::{ReferencePicture, SliceContext};
use crate::recovery;

use super::{SchedulerState, Shared, SliceReport, wake_dependents};

/// 工作线程主循环: 取就绪任务执行, 没有任务时等待 `task_ready`
pub(crate) fn run_worker(index: usize, shared: Arc<Shared>) {
    debug!("H264: 工作线程 {} 启动", index);
    let mut state = shared.lock_state();
    loop {
        if let Some(id) = state.tasks.pop_ready() {
            state = execute_task(&shared, state, id);
            continue;
        }
        if state.shutdown {
            break;
        }
        state = shared.wait(&shared.task_ready, state);
    }
    drop(state);
    debug!("H264: 工作线程 {} 退出", index);
}

/// 参考列表项在锁外使用的信息
struct RefEntry {
    slot: SlotRef,
    frame_num: i32,
    pic_order_cnt: i32,
    long_term: bool,
}

/// 执行一个已处于运行状态的任务, 返回重新获取的锁
///
/// 锁顺序: 先持有图像读写锁再获取调度器锁; 持有调度器锁时从不等待图像锁.
pub(crate) fn execute_task<'a>(
    shared: &'a Shared,
    mut state: MutexGuard<'a, SchedulerState>,
    id: usize,
) -> MutexGuard<'a, SchedulerState> {
    let Some(job) = state.tasks.job(id).cloned() else {
        error!("H264: 运行中的任务 {} 没有作业", id);
        state.tasks.release(id);
        shared.task_complete.notify_all();
        return state;
    };
    let target = job.target;

    // 在锁内收集目标与参考图像的存储
    let mut pictures: BTreeMap<usize, SharedPicture> = BTreeMap::new();
    let mut lists: [Vec<RefEntry>; 2] = [Vec::new(), Vec::new()];
    let mbs;
    {
        let Some(dpb) = state.dpb.as_ref() else {
            error!("H264: 任务 {} 执行时码流已被释放", id);
            state.tasks.release(id);
            shared.task_complete.notify_all();
            return state;
        };
        mbs = dpb.params().mbs_per_picture();
        let storage = dpb
            .check_slot_ref(target)
            .ok()
            .and_then(|_| dpb.storage_of(target.index));
        let Some(storage) = storage else {
            error!("H264: 任务 {} 的目标槽位 {:?} 不可用", id, target);
            state.tasks.release(id);
            shared.task_complete.notify_all();
            return state;
        };
        pictures.insert(target.index, storage);
        for (list, refs) in lists.iter_mut().zip(job.ref_lists.iter()) {
            for &slot in refs {
                let frame_num = dpb.frame_num_of(slot.index);
                let pic_order_cnt = dpb.pic_order_cnt_of(slot.index);
                let long_term = dpb.long_term_mask().contains(slot.index);
                if slot.index != target.index && !dpb.is_non_existing(slot.index) {
                    if let Some(storage) = dpb.storage_of(slot.index) {
                        pictures.entry(slot.index).or_insert(storage);
                    }
                }
                list.push(RefEntry {
                    slot,
                    frame_num,
                    pic_order_cnt,
                    long_term,
                });
            }
        }
    }
    drop(state);

    // 按槽位升序加锁: 目标写锁, 参考读锁
    let mut target_guard = None;
    let mut ref_guards = BTreeMap::new();
    for (&index, picture) in &pictures {
        if index == target.index {
            target_guard = Some(write_picture(picture));
        } else {
            ref_guards.insert(index, read_picture(picture));
        }
    }
    let Some(mut target_guard) = target_guard else {
        // 目标存储在上面已插入, 不会到达这里
        let mut state = shared.lock_state();
        state.tasks.release(id);
        shared.task_complete.notify_all();
        return state;
    };

    let header = job.header.as_ref();
    let first_mb = header.first_mb_in_slice;
    let (end_mb, error) = {
        let ref_lists = [
            to_reference_list(&lists[0], &ref_guards),
            to_reference_list(&lists[1], &ref_guards),
        ];
        let mut ctx = SliceContext {
            header,
            target,
            picture: &mut *target_guard,
            ref_lists,
        };
        let outcome = shared.pipeline.decode_slice(&mut ctx);
        let end_mb = outcome.end_mb.clamp(first_mb, mbs);
        if outcome.error.is_some() {
            recovery::recover_slice(shared.pipeline.as_ref(), &mut ctx, first_mb..end_mb);
        }
        ctx.picture.mark_decoded(first_mb..end_mb);
        (end_mb, outcome.error)
    };
    drop(ref_guards);
    if let Some(reason) = &error {
        warn!(
            "H264: slice 解码失败, slot={}, 宏块 {}..{}, {}",
            target.index, first_mb, end_mb, reason
        );
    }

    // 记录进度并领取新连续的去块区间
    let mut state = shared.lock_state();
    let claimed = match state.dpb.as_mut() {
        Some(dpb) => {
            if error.is_some() {
                dpb.note_recovered_slice(target);
            }
            match dpb.record_slice_progress(target, first_mb..end_mb, header.deblock) {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!("H264: {}", err);
                    Vec::new()
                }
            }
        }
        None => Vec::new(),
    };
    state.tasks.mark_completing(id);
    drop(state);

    for (range, params) in &claimed {
        if params.enabled() {
            shared.pipeline.deblock(&mut *target_guard, range.clone(), params);
        }
    }
    drop(target_guard);

    let mut state = shared.lock_state();
    let completed = match state.dpb.as_mut() {
        Some(dpb) => dpb.task_finished(target).unwrap_or_else(|err| {
            error!("H264: {}", err);
            None
        }),
        None => None,
    };
    if wake_dependents(&mut state, completed) {
        shared.task_ready.notify_all();
    }
    let callback = state.tasks.release(id);
    shared.task_progress.notify_all();
    shared.task_complete.notify_all();

    if let Some(callback) = callback {
        drop(state);
        callback(SliceReport {
            slot: target,
            first_mb,
            end_mb,
            recovered: error.is_some(),
            error,
        });
        state = shared.lock_state();
    }
    state
}

fn to_reference_list<'g>(
    entries: &[RefEntry],
    guards: &'g BTreeMap<usize, RwLockReadGuard<'_, PictureBuffer>>,
) -> Vec<ReferencePicture<'g>> {
    entries
        .iter()
        .map(|entry| ReferencePicture {
            slot: entry.slot,
            frame_num: entry.frame_num,
            pic_order_cnt: entry.pic_order_cnt,
            long_term: entry.long_term,
            pixels: guards.get(&entry.slot.index).map(|guard| &**guard),
        })
        .collect()
}

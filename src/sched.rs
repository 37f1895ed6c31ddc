//! Sector-task scheduling and the distributed reduction driver.
//!
//! Every distributed phase (matrix-vector products, noise-term contraction,
//! environment growth) decomposes into one task per quantum-number sector of
//! a split axis, with task difficulty given by the sector degeneracy. Tasks
//! beyond one-per-worker are handed out dynamically, largest first:
//! longest-processing-time-first list scheduling, whose makespan is within
//! 4/3 of optimal for this problem class.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::blocksparse::BlockTensor;
use crate::comm::{recv_tensor, recv_value, send_tensor, send_value, Transport, MASTER_RANK};
use crate::types::{Scalar, TaskIndex};

/// Task layout for one distributed phase: the first `min(workers, tasks)`
/// tasks are bound statically (worker `w` starts on task `w - 1`), the rest
/// form a difficulty-descending queue drained by whoever finishes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSchedule {
    pub n_tasks: usize,
    pub n_workers: usize,
    pub dynamic: Vec<TaskIndex>,
}

/// Longest-processing-time-first schedule over `difficulties`.
#[must_use]
pub fn lpt_schedule(difficulties: &[usize], n_workers: usize) -> TaskSchedule {
    let n_tasks = difficulties.len();
    let mut dynamic: Vec<TaskIndex> = if n_workers < n_tasks {
        (n_workers..n_tasks).collect()
    } else {
        Vec::new()
    };
    dynamic.sort_by(|&a, &b| difficulties[b].cmp(&difficulties[a]).then(a.cmp(&b)));
    TaskSchedule {
        n_tasks,
        n_workers,
        dynamic,
    }
}

/// Per-worker record of which tasks each worker completed, in order. Replayed
/// by the static-assignment rounds of the Lanczos matrix-vector product.
pub type Assignment = Vec<Vec<TaskIndex>>;

/// Master side of a distributed reduction over sector tasks.
///
/// Receives one tensor per task from the worker pool. Each busy worker is
/// served by its own coordination thread; these threads only move messages,
/// pulling dynamically assigned tasks from a shared cursor. With no workers
/// (single-rank world) every task runs through `local_kernel` instead.
///
/// Returns the task-indexed results and the per-worker assignment.
pub fn master_collect_sector_tasks<S, F>(
    tp: &dyn Transport,
    difficulties: &[usize],
    local_kernel: F,
) -> (Vec<BlockTensor<S>>, Assignment)
where
    S: Scalar,
    F: Fn(TaskIndex) -> BlockTensor<S>,
{
    let n_tasks = difficulties.len();
    let n_workers = tp.size() - 1;
    if n_workers == 0 {
        return ((0..n_tasks).map(local_kernel).collect(), Vec::new());
    }

    let schedule = lpt_schedule(difficulties, n_workers);
    let busy = n_tasks.min(n_workers);
    let cursor = AtomicUsize::new(0);
    let (res_tx, res_rx) = crossbeam::channel::unbounded();
    let mut assignment: Assignment = vec![Vec::new(); n_workers];

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for w in 1..=busy {
            let res_tx = res_tx.clone();
            let cursor = &cursor;
            let dynamic = &schedule.dynamic;
            handles.push(scope.spawn(move || {
                let mut done = Vec::new();
                // statically bound first task
                let first = w - 1;
                let tensor: BlockTensor<S> = recv_tensor(tp, w, first);
                res_tx.send((first, tensor)).unwrap();
                done.push(first);
                // dynamic phase: steal from the shared queue cursor
                loop {
                    let i = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(&task) = dynamic.get(i) else {
                        break;
                    };
                    send_value(tp, w, 2 * w, &task);
                    let tensor: BlockTensor<S> = recv_tensor(tp, w, task);
                    res_tx.send((task, tensor)).unwrap();
                    done.push(task);
                }
                // finish signal
                send_value(tp, w, 2 * w, &(2 * n_tasks));
                done
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assignment[i] = handle.join().expect("collector thread");
        }
    });
    drop(res_tx);

    let mut res_list: Vec<Option<BlockTensor<S>>> = (0..n_tasks).map(|_| None).collect();
    for (task, tensor) in res_rx {
        res_list[task] = Some(tensor);
    }
    debug!(n_tasks, n_workers; "collected sector tasks");
    (
        res_list
            .into_iter()
            .map(|t| t.expect("every task produced a result"))
            .collect(),
        assignment,
    )
}

/// Master side of a static-replay round: workers resend results for the
/// tasks they handled previously, in the same order, with no control
/// messages.
pub fn master_collect_static<S, F>(
    tp: &dyn Transport,
    n_tasks: usize,
    assignment: &Assignment,
    local_kernel: F,
) -> Vec<BlockTensor<S>>
where
    S: Scalar,
    F: Fn(TaskIndex) -> BlockTensor<S>,
{
    if tp.size() == 1 {
        return (0..n_tasks).map(local_kernel).collect();
    }
    let (res_tx, res_rx) = crossbeam::channel::unbounded();
    std::thread::scope(|scope| {
        for (i, tasks) in assignment.iter().enumerate() {
            if tasks.is_empty() {
                continue;
            }
            let res_tx = res_tx.clone();
            let w = i + 1;
            scope.spawn(move || {
                for &task in tasks {
                    let tensor: BlockTensor<S> = recv_tensor(tp, w, task);
                    res_tx.send((task, tensor)).unwrap();
                }
            });
        }
    });
    drop(res_tx);
    let mut res_list: Vec<Option<BlockTensor<S>>> = (0..n_tasks).map(|_| None).collect();
    for (task, tensor) in res_rx {
        res_list[task] = Some(tensor);
    }
    res_list
        .into_iter()
        .map(|t| t.expect("every task produced a result"))
        .collect()
}

/// Worker side of a dynamically scheduled phase: compute the statically
/// bound task, then serve assignments until the finish signal. Returns the
/// tasks completed, for later static replay.
pub fn slave_compute_sector_tasks<S, F>(
    tp: &dyn Transport,
    n_tasks: usize,
    kernel: F,
) -> Vec<TaskIndex>
where
    S: Scalar,
    F: Fn(TaskIndex) -> BlockTensor<S>,
{
    let w = tp.rank();
    let mut done = Vec::new();
    if w > n_tasks {
        debug!(rank = w, task_count = 0usize; "no sector tasks for this worker");
        return done;
    }
    let mut task = w - 1;
    loop {
        let tensor = kernel(task);
        send_tensor(tp, MASTER_RANK, task, &tensor);
        done.push(task);
        task = recv_value(tp, MASTER_RANK, 2 * w);
        if task >= n_tasks {
            break;
        }
    }
    debug!(rank = w, task_count = done.len(); "sector tasks done");
    done
}

/// Worker side of a static-replay round.
pub fn slave_compute_static<S, F>(tp: &dyn Transport, tasks: &[TaskIndex], kernel: F)
where
    S: Scalar,
    F: Fn(TaskIndex) -> BlockTensor<S>,
{
    for &task in tasks {
        let tensor = kernel(task);
        send_tensor(tp, MASTER_RANK, task, &tensor);
    }
}

/// Sums per-sector slices into the full result. Slices along a split output
/// axis occupy disjoint blocks, so this reassembly is exact.
#[must_use]
pub fn collective_linear_combine<S: Scalar>(slices: Vec<BlockTensor<S>>) -> BlockTensor<S> {
    let mut iter = slices.into_iter();
    let mut acc = iter.next().expect("at least one slice");
    for slice in iter {
        acc.scaled_add(S::one(), &slice);
    }
    acc
}

//! Master-driven, slave-assisted truncated SVD.
//!
//! The master splits the merged two-site state into independent per-charge
//! sector matrices, farms the dense decompositions out with the same
//! longest-task-first scheme as the matrix-vector products, then applies the
//! global truncation policy and reassembles block-sparse factors.

use log::debug;
use ndarray::Array2;

use crate::blocksparse::decomp::{assemble_svd, decide_kept, dense_svd, svd_partition};
use crate::blocksparse::{BlockTensor, SvdOutcome, SvdTask, TruncationSpec};
use crate::comm::{
    broadcast_serializing, recv_value, send_value, Transport, MASTER_RANK,
};
use crate::sched::lpt_schedule;
use crate::types::Scalar;

type Factors<S> = (Array2<S>, Vec<f64>, Array2<S>);

/// Master side of the distributed truncated SVD.
pub fn mpi_svd_master<S: Scalar>(
    state: &BlockTensor<S>,
    ldims: usize,
    spec: &TruncationSpec,
    tp: &dyn Transport,
) -> SvdOutcome<S> {
    let tasks = svd_partition(state, ldims);
    let n_tasks = tasks.len();
    let n_workers = tp.size() - 1;

    let factors: Vec<Factors<S>> = if n_workers == 0 {
        tasks.iter().map(|t| dense_svd(&t.mat)).collect()
    } else {
        broadcast_serializing(tp, MASTER_RANK, n_tasks);
        let difficulties: Vec<usize> = tasks.iter().map(SvdTask::difficulty).collect();
        let schedule = lpt_schedule(&difficulties, n_workers);
        let busy = n_tasks.min(n_workers);
        let cursor = std::sync::atomic::AtomicUsize::new(0);
        let (res_tx, res_rx) = crossbeam::channel::unbounded();

        std::thread::scope(|scope| {
            for w in 1..=busy {
                let res_tx = res_tx.clone();
                let cursor = &cursor;
                let dynamic = &schedule.dynamic;
                let tasks = &tasks;
                scope.spawn(move || {
                    let mut serve = |task: usize| {
                        send_value(tp, w, 2 * w, &task);
                        send_value(tp, w, task, &tasks[task].mat);
                        let factors: Factors<S> = recv_value(tp, w, task);
                        res_tx.send((task, factors)).unwrap();
                    };
                    serve(w - 1);
                    loop {
                        let i = cursor.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        let Some(&task) = dynamic.get(i) else {
                            break;
                        };
                        serve(task);
                    }
                    send_value(tp, w, 2 * w, &(2 * n_tasks));
                });
            }
        });
        drop(res_tx);

        let mut collected: Vec<Option<Factors<S>>> = (0..n_tasks).map(|_| None).collect();
        for (task, factors) in res_rx {
            collected[task] = Some(factors);
        }
        collected
            .into_iter()
            .map(|f| f.expect("every sector was decomposed"))
            .collect()
    };

    let class_svals: Vec<Vec<f64>> = factors.iter().map(|(_, sv, _)| sv.clone()).collect();
    let (kept, actual, d) = decide_kept(&class_svals, spec);
    let (u, s, vt, svals) = assemble_svd(state, ldims, &tasks, &factors, &kept);
    debug!(d, actual_trunc_err = actual; "distributed svd done");
    SvdOutcome {
        u,
        s,
        vt,
        actual_trunc_err: actual,
        d,
        svals,
    }
}

/// Slave side: decompose sector matrices until the finish signal.
pub fn mpi_svd_slave<S: Scalar>(tp: &dyn Transport) {
    let n_tasks: usize = broadcast_serializing(tp, MASTER_RANK, 0);
    let w = tp.rank();
    if w > n_tasks {
        return;
    }
    let mut task_count = 0usize;
    loop {
        let task: usize = recv_value(tp, MASTER_RANK, 2 * w);
        if task >= n_tasks {
            break;
        }
        let mat: Array2<S> = recv_value(tp, MASTER_RANK, task);
        let factors = dense_svd(&mat);
        send_value(tp, MASTER_RANK, task, &factors);
        task_count += 1;
    }
    debug!(rank = w, task_count; "svd sector tasks done");
}

/// Von Neumann entanglement entropy of the normalized squared singular
/// values. Diagnostic only; never feeds back into control flow.
#[must_use]
pub fn measure_entanglement_entropy(svals: &[f64]) -> f64 {
    let total: f64 = svals.iter().map(|s| s * s).sum();
    if total == 0.0 {
        return 0.0;
    }
    -svals
        .iter()
        .map(|s| {
            let p = s * s / total;
            if p > 0.0 {
                p * p.ln()
            } else {
                0.0
            }
        })
        .sum::<f64>()
}

//! Distributed Lanczos solvers for the two-site effective Hamiltonian:
//! ground-state minimization for VMPS and Krylov exponentiation for TDVP.
//!
//! The master owns the Krylov recurrence (cheap vector arithmetic); the
//! dominant cost, the effective-Hamiltonian matrix-vector product, is
//! distributed over quantum-number-sector tasks. The first product of a
//! solve uses dynamic assignment; subsequent products replay the recorded
//! assignment (`LanczosMatVecStatic`) with no control traffic.

use log::{debug, error, warn};
use ndarray::Array2;
use ndarray_linalg::{Eigh, UPLO};
use num_complex::Complex64;

use crate::blocksparse::{contract, contract_sector, BlockTensor};
use crate::comm::{
    broadcast_tensor, master_broadcast_order, slave_get_broadcast_order, Order, Transport,
    MASTER_RANK,
};
use crate::sched::{
    collective_linear_combine, master_collect_sector_tasks, master_collect_static,
    slave_compute_sector_tasks, slave_compute_static, Assignment,
};
use crate::types::Scalar;

/// Krylov convergence controls.
#[derive(Debug, Clone, Copy)]
pub struct LanczosParams {
    /// Stop when the tracked quantity (energy, or propagated coefficient
    /// vector) changes by less than this between iterations.
    pub error: f64,
    pub max_iterations: usize,
}

impl LanczosParams {
    #[must_use]
    pub fn new(error: f64, max_iterations: usize) -> Self {
        Self {
            error,
            max_iterations,
        }
    }
}

/// Non-owning view of the four tensors forming a two-site effective
/// Hamiltonian. Assembled per bond update; never copied wholesale across the
/// network, since slaves reconstruct their sub-blocks from broadcasts.
pub struct EffHam<'a, S: Scalar> {
    pub lenv: &'a BlockTensor<S>,
    pub lmpo: &'a BlockTensor<S>,
    pub rmpo: &'a BlockTensor<S>,
    pub renv: &'a BlockTensor<S>,
}

/// Result of a ground-state Lanczos solve. An iteration-cap exit returns the
/// best estimate reached; the caller decides whether that deserves a warning.
pub struct LanczosRes<S: Scalar> {
    pub iters: usize,
    pub gs_eng: f64,
    pub gs_vec: BlockTensor<S>,
}

/// Result of a Krylov `exp(-i δ H)|v⟩` application.
pub struct ExpmvRes<S: Scalar> {
    pub iters: usize,
    pub expmv: BlockTensor<S>,
}

/// Serial effective-Hamiltonian application to a merged two-site state.
#[must_use]
pub fn eff_ham_mul_two_site_state<S: Scalar>(
    eff: &EffHam<'_, S>,
    state: &BlockTensor<S>,
) -> BlockTensor<S> {
    let t1 = contract(eff.lenv, state, &[0], &[0]);
    let t2 = contract(&t1, eff.lmpo, &[0, 2], &[0, 1]);
    let t3 = contract(&t2, eff.rmpo, &[4, 1], &[0, 1]);
    contract(&t3, eff.renv, &[1, 4], &[0, 1])
}

/// One sector slice of the product: the left environment is restricted to
/// `sector` on its conjugate bond axis, so slices over distinct sectors are
/// disjoint and reassemble exactly.
#[must_use]
pub fn eff_ham_sector_slice<S: Scalar>(
    eff: &EffHam<'_, S>,
    state: &BlockTensor<S>,
    sector: usize,
) -> BlockTensor<S> {
    let t1 = contract_sector(eff.lenv, 2, sector, state, &[0], &[0]);
    let t2 = contract(&t1, eff.lmpo, &[0, 2], &[0, 1]);
    let t3 = contract(&t2, eff.rmpo, &[4, 1], &[0, 1]);
    contract(&t3, eff.renv, &[1, 4], &[0, 1])
}

/// Serial single-site effective-Hamiltonian application (used by the TDVP
/// backward half-steps).
#[must_use]
pub fn eff_ham_mul_one_site_state<S: Scalar>(
    lenv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    renv: &BlockTensor<S>,
    state: &BlockTensor<S>,
) -> BlockTensor<S> {
    let t1 = contract(lenv, state, &[0], &[0]);
    let t2 = contract(&t1, mpo_ten, &[0, 2], &[0, 1]);
    contract(&t2, renv, &[1, 3], &[0, 1])
}

fn matvec_difficulties<S: Scalar>(eff: &EffHam<'_, S>) -> Vec<usize> {
    let split = eff.lenv.index(2);
    (0..split.sector_count())
        .map(|s| split.sector_dim(s))
        .collect()
}

/// Master side of one distributed matrix-vector product. The first call of a
/// solve schedules dynamically and records the assignment; later calls
/// replay it statically.
pub fn master_mat_vec<S: Scalar>(
    eff: &EffHam<'_, S>,
    state: &BlockTensor<S>,
    tp: &dyn Transport,
    assignment: &mut Option<Assignment>,
) -> BlockTensor<S> {
    if tp.size() > 1 {
        let order = if assignment.is_none() {
            Order::LanczosMatVecDynamic
        } else {
            Order::LanczosMatVecStatic
        };
        master_broadcast_order(tp, order);
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(state.clone()));
    }
    let difficulties = matvec_difficulties(eff);
    let slices = match assignment {
        Some(recorded) => master_collect_static(tp, difficulties.len(), recorded, |task| {
            eff_ham_sector_slice(eff, state, task)
        }),
        None => {
            let (slices, recorded) = master_collect_sector_tasks(tp, &difficulties, |task| {
                eff_ham_sector_slice(eff, state, task)
            });
            *assignment = Some(recorded);
            slices
        }
    };
    collective_linear_combine(slices)
}

/// Slave side of one Lanczos solve: receives the environments, then serves
/// matrix-vector rounds until `LanczosFinish`. Returns the environments for
/// the subsequent environment-growth order.
pub fn slave_lanczos_solver<S: Scalar>(
    lmpo: &BlockTensor<S>,
    rmpo: &BlockTensor<S>,
    tp: &dyn Transport,
) -> (BlockTensor<S>, BlockTensor<S>) {
    let lenv: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let renv: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let n_tasks = lenv.index(2).sector_count();
    let mut recorded: Option<Vec<usize>> = None;
    loop {
        match slave_get_broadcast_order(tp) {
            Some(Order::LanczosMatVecDynamic) => {
                let state: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
                let eff = EffHam {
                    lenv: &lenv,
                    lmpo,
                    rmpo,
                    renv: &renv,
                };
                let done = slave_compute_sector_tasks(tp, n_tasks, |task| {
                    eff_ham_sector_slice(&eff, &state, task)
                });
                recorded = Some(done);
            }
            Some(Order::LanczosMatVecStatic) => {
                let state: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
                let eff = EffHam {
                    lenv: &lenv,
                    lmpo,
                    rmpo,
                    renv: &renv,
                };
                let tasks = recorded
                    .as_ref()
                    .expect("static round before any dynamic round");
                slave_compute_static(tp, tasks, |task| {
                    eff_ham_sector_slice(&eff, &state, task)
                });
            }
            Some(Order::LanczosFinish) => break,
            None => {
                warn!(rank = tp.rank(); "ignoring unknown order inside lanczos");
            }
            Some(other) => {
                error!(rank = tp.rank(), order = format!("{other:?}"); "unexpected order inside lanczos");
                tp.abort(1);
            }
        }
    }
    (lenv, renv)
}

fn tridiag_matrix(alpha: &[f64], beta: &[f64]) -> Array2<f64> {
    let m = alpha.len();
    let mut t = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        t[[i, i]] = alpha[i];
        if i > 0 {
            t[[i, i - 1]] = beta[i - 1];
            t[[i - 1, i]] = beta[i - 1];
        }
    }
    t
}

/// Lowest eigenpair of the symmetric tridiagonal projection.
#[must_use]
pub fn tridiag_ground_state(alpha: &[f64], beta: &[f64]) -> (f64, Vec<f64>) {
    let t = tridiag_matrix(alpha, beta);
    let (vals, vecs) = t.eigh(UPLO::Lower).expect("LAPACK eigh");
    let evec = vecs.column(0).to_vec();
    (vals[0], evec)
}

/// First column of `exp(-i δ T)` for the symmetric tridiagonal projection
/// `T`, i.e. the Krylov combination coefficients of the propagated state.
#[must_use]
pub fn tridiag_expmv_coeffs(alpha: &[f64], beta: &[f64], delta: f64) -> Vec<Complex64> {
    let m = alpha.len();
    let t = tridiag_matrix(alpha, beta);
    let (vals, vecs) = t.eigh(UPLO::Lower).expect("LAPACK eigh");
    (0..m)
        .map(|j| {
            (0..m)
                .map(|k| {
                    let phase = Complex64::new(0.0, -delta * vals[k]).exp();
                    phase * vecs[[j, k]] * vecs[[0, k]]
                })
                .sum()
        })
        .collect()
}

const KRYLOV_BREAKDOWN: f64 = 1e-14;

/// Master-side ground-state Lanczos over the distributed matrix-vector
/// product, with full reorthogonalization against the Krylov basis.
///
/// Reaching the iteration cap is not an error: the best estimate found is
/// returned together with the iteration count.
pub fn master_lanczos_solver<S: Scalar>(
    eff: &EffHam<'_, S>,
    init: BlockTensor<S>,
    params: &LanczosParams,
    tp: &dyn Transport,
) -> LanczosRes<S> {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(eff.lenv.clone()));
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(eff.renv.clone()));
    }
    let mut assignment: Option<Assignment> = None;

    let mut q = init;
    let norm = q.norm();
    q.scale(S::from_real(1.0 / norm));
    let mut basis = vec![q];
    let mut alpha: Vec<f64> = Vec::new();
    let mut beta: Vec<f64> = Vec::new();
    let mut prev_energy = f64::INFINITY;

    let (energy, evec, iters) = loop {
        let m = alpha.len();
        let mut w = master_mat_vec(eff, &basis[m], tp, &mut assignment);
        let a = basis[m].dot(&w).re();
        alpha.push(a);
        w.scaled_add(S::from_real(-a), &basis[m]);
        if m > 0 {
            w.scaled_add(S::from_real(-beta[m - 1]), &basis[m - 1]);
        }
        // full reorthogonalization keeps the recurrence stable
        for b in &basis {
            let overlap = b.dot(&w);
            w.scaled_add(S::zero() - overlap, b);
        }
        let (e0, evec) = tridiag_ground_state(&alpha, &beta);
        let b = w.norm();

        let converged = (prev_energy - e0).abs() < params.error;
        let breakdown = b < KRYLOV_BREAKDOWN;
        let capped = m + 1 >= params.max_iterations;
        if converged || breakdown || capped {
            if capped && !converged && !breakdown {
                warn!(iters = m + 1, energy = e0; "lanczos hit the iteration cap");
            }
            break (e0, evec, m + 1);
        }
        prev_energy = e0;
        beta.push(b);
        w.scale(S::from_real(1.0 / b));
        basis.push(w);
    };

    let mut gs_vec = basis[0].clone();
    gs_vec.scale(S::from_real(evec[0]));
    for (j, b) in basis.iter().enumerate().skip(1) {
        gs_vec.scaled_add(S::from_real(evec[j]), b);
    }
    let norm = gs_vec.norm();
    gs_vec.scale(S::from_real(1.0 / norm));

    if tp.size() > 1 {
        master_broadcast_order(tp, Order::LanczosFinish);
    }
    debug!(iters, energy; "lanczos done");
    LanczosRes {
        iters,
        gs_eng: energy,
        gs_vec,
    }
}

/// Krylov approximation of `exp(-i δ H)|v⟩` for an arbitrary Hermitian
/// matrix-vector product. Serial building block; the distributed variant
/// plugs the distributed product in as `matvec`.
pub fn lanczos_expmv<F>(
    mut matvec: F,
    init: &BlockTensor<Complex64>,
    delta: f64,
    params: &LanczosParams,
) -> ExpmvRes<Complex64>
where
    F: FnMut(&BlockTensor<Complex64>) -> BlockTensor<Complex64>,
{
    let beta0 = init.norm();
    let mut q = init.clone();
    q.scale(Complex64::new(1.0 / beta0, 0.0));
    let mut basis = vec![q];
    let mut alpha: Vec<f64> = Vec::new();
    let mut beta: Vec<f64> = Vec::new();
    let mut prev_coeffs: Vec<Complex64> = Vec::new();

    let (coeffs, iters) = loop {
        let m = alpha.len();
        let mut w = matvec(&basis[m]);
        let a = basis[m].dot(&w).re;
        alpha.push(a);
        w.scaled_add(Complex64::new(-a, 0.0), &basis[m]);
        if m > 0 {
            w.scaled_add(Complex64::new(-beta[m - 1], 0.0), &basis[m - 1]);
        }
        for b in &basis {
            let overlap = b.dot(&w);
            w.scaled_add(-overlap, b);
        }
        let coeffs = tridiag_expmv_coeffs(&alpha, &beta, delta);
        let b = w.norm();

        let drift: f64 = coeffs
            .iter()
            .enumerate()
            .map(|(j, c)| {
                let prev = prev_coeffs.get(j).copied().unwrap_or_default();
                (c - prev).norm_sqr()
            })
            .sum::<f64>()
            .sqrt();
        let converged = m > 0 && drift < params.error;
        let breakdown = b < KRYLOV_BREAKDOWN;
        let capped = m + 1 >= params.max_iterations;
        if converged || breakdown || capped {
            if capped && !converged && !breakdown {
                warn!(iters = m + 1, drift; "lanczos expmv hit the iteration cap");
            }
            break (coeffs, m + 1);
        }
        prev_coeffs = coeffs;
        beta.push(b);
        w.scale(Complex64::new(1.0 / b, 0.0));
        basis.push(w);
    };

    let mut expmv = basis[0].clone();
    expmv.scale(coeffs[0]);
    for (j, b) in basis.iter().enumerate().skip(1) {
        expmv.scaled_add(coeffs[j], b);
    }
    expmv.scale(Complex64::new(beta0, 0.0));
    ExpmvRes { iters, expmv }
}

/// Master-side distributed Krylov exponential for the two-site window.
pub fn master_lanczos_expmv_solver(
    eff: &EffHam<'_, Complex64>,
    init: &BlockTensor<Complex64>,
    delta: f64,
    params: &LanczosParams,
    tp: &dyn Transport,
) -> ExpmvRes<Complex64> {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(eff.lenv.clone()));
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(eff.renv.clone()));
    }
    let mut assignment: Option<Assignment> = None;
    let res = lanczos_expmv(
        |state| master_mat_vec(eff, state, tp, &mut assignment),
        init,
        delta,
        params,
    );
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::LanczosFinish);
    }
    res
}

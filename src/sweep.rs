//! Two-site finite VMPS with master/slave parallelism.
//!
//! The master owns the sweep loop, the bounded working window of MPS and
//! environment tensors, and all disk traffic; slaves run the order-driven
//! receive loop and supply the heavy sector contractions. Environment files
//! for interior bonds are single-use: each sweep direction consumes the
//! files the previous direction wrote.

use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;

use crate::blocksparse::{contract, BlockTensor, TruncationSpec};
use crate::comm::{
    broadcast_serializing, master_broadcast_order, recv_value, send_value,
    slave_get_broadcast_order, Order, Transport, MASTER_RANK,
};
use crate::env::{
    check_and_update_boundary_tensors, master_grow_left_environment,
    master_grow_right_environment, master_init_envs, need_generate_right_envs,
    slave_grow_left_environment, slave_grow_right_environment, slave_init_grow_step,
    update_boundary_envs,
};
use crate::expansion::{
    master_left_moving_expand, master_right_moving_expand, slave_left_moving_expand,
    slave_right_moving_expand,
};
use crate::io::{self, env_ten_path, mps_ten_path, EnvSide, StorageError};
use crate::lanczos::{master_lanczos_solver, slave_lanczos_solver, EffHam, LanczosParams};
use crate::mpo::Mpo;
use crate::mps::{FiniteMps, TenVec};
use crate::svd::{measure_entanglement_entropy, mpi_svd_master, mpi_svd_slave};
use crate::types::{Scalar, SiteIndex};

/// Noise magnitudes below this never trigger a subspace expansion.
pub const NOISE_FLOOR: f64 = 1e-10;

/// Sweep direction of a bond update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDirection {
    Right,
    Left,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type SweepResult<T> = Result<T, SweepError>;

/// Immutable configuration of a sweep program.
#[derive(Debug, Clone)]
pub struct SweepParams {
    pub sweeps: usize,
    pub dmin: usize,
    pub dmax: usize,
    pub trunc_err: f64,
    pub lancz_params: LanczosParams,
    /// Per-sweep noise magnitudes; sweeps beyond the end of the list hold
    /// the last configured value. An empty list means no expansion ever.
    pub noises: Vec<f64>,
    pub mps_path: PathBuf,
    pub temp_path: PathBuf,
}

impl SweepParams {
    #[must_use]
    pub fn new(
        sweeps: usize,
        dmin: usize,
        dmax: usize,
        trunc_err: f64,
        lancz_params: LanczosParams,
        mps_path: PathBuf,
        temp_path: PathBuf,
    ) -> Self {
        Self {
            sweeps,
            dmin,
            dmax,
            trunc_err,
            lancz_params,
            noises: Vec::new(),
            mps_path,
            temp_path,
        }
    }

    #[must_use]
    pub fn with_noises(mut self, noises: Vec<f64>) -> Self {
        self.noises = noises;
        self
    }

    pub(crate) fn truncation_spec(&self) -> TruncationSpec {
        TruncationSpec {
            trunc_err: self.trunc_err,
            dmin: self.dmin,
            dmax: self.dmax,
        }
    }
}

/// Runs the two-site VMPS program on every rank; dispatches to the master
/// sweep loop or the slave order loop depending on the rank. Returns the
/// final ground-energy estimate (zero on slaves).
pub fn two_site_finite_vmps<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    params: &SweepParams,
    tp: &dyn Transport,
) -> SweepResult<f64> {
    if tp.rank() == MASTER_RANK {
        master_two_site_finite_vmps(mps, mpo, params, tp)
    } else {
        slave_two_site_finite_vmps(mpo, tp);
        Ok(0.0)
    }
}

pub fn master_two_site_finite_vmps<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    params: &SweepParams,
    tp: &dyn Transport,
) -> SweepResult<f64> {
    assert_eq!(mps.len(), mpo.len());
    info!("***** Two-Site Update VMPS Program (with distributed workers) *****");
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::ProgramStart);
        for w in 1..tp.size() {
            let r: usize = recv_value(tp, w, 2 * w);
            assert_eq!(r, w, "handshake from worker {w} carried rank {r}");
        }
    }

    let (left_boundary, right_boundary) = master_vmps_init(mps, mpo, params, tp)?;

    info!(noises = format!("{:?}", params.noises); "preset noises");
    let noises = if params.noises.is_empty() {
        vec![0.0]
    } else {
        params.noises.clone()
    };

    let mut e0 = 0.0;
    mps.load_ten(left_boundary, &mps_ten_path(&params.mps_path, left_boundary))?;
    mps.load_ten(
        left_boundary + 1,
        &mps_ten_path(&params.mps_path, left_boundary + 1),
    )?;
    for sweep in 1..=params.sweeps {
        let noise = noises[(sweep - 1).min(noises.len() - 1)];
        let sweep_timer = Instant::now();
        e0 = two_site_finite_vmps_sweep(
            mps,
            mpo,
            params,
            left_boundary,
            right_boundary,
            noise,
            tp,
        )?;
        info!(
            sweep,
            e0,
            elapsed_s = sweep_timer.elapsed().as_secs_f64();
            "sweep finished"
        );
    }
    mps.dump_ten(
        left_boundary,
        &mps_ten_path(&params.mps_path, left_boundary),
        true,
    )?;
    mps.dump_ten(
        left_boundary + 1,
        &mps_ten_path(&params.mps_path, left_boundary + 1),
        true,
    )?;
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::ProgramFinal);
    }
    Ok(e0)
}

/// Pre-sweep initialization: boundary determination, self-healing right
/// environment cache, boundary environments.
pub(crate) fn master_vmps_init<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    params: &SweepParams,
    tp: &dyn Transport,
) -> SweepResult<(SiteIndex, SiteIndex)> {
    let n = mps.len();
    info!(
        size = n,
        sweeps = params.sweeps,
        dmin = params.dmin,
        dmax = params.dmax,
        trunc_err = params.trunc_err,
        lancz_max_iter = params.lancz_params.max_iterations,
        processors = tp.size();
        "sweep parameters"
    );

    let (left_boundary, right_boundary) =
        check_and_update_boundary_tensors(mps, &params.mps_path, params.dmax)?;

    if need_generate_right_envs(n, left_boundary, right_boundary, &params.temp_path)? {
        info!("creating the environment tensors");
        if tp.size() > 1 {
            master_broadcast_order(tp, Order::InitGrowEnv);
        }
        master_init_envs(
            mps,
            mpo,
            &params.mps_path,
            &params.temp_path,
            left_boundary,
            tp,
        )?;
        if tp.size() > 1 {
            master_broadcast_order(tp, Order::InitGrowEnvFinish);
        }
    } else {
        info!("found the environment tensors");
    }

    update_boundary_envs(
        mps,
        mpo,
        &params.mps_path,
        &params.temp_path,
        left_boundary,
        right_boundary,
    )?;
    Ok((left_boundary, right_boundary))
}

fn two_site_finite_vmps_sweep<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    params: &SweepParams,
    left_boundary: SiteIndex,
    right_boundary: SiteIndex,
    noise: f64,
    tp: &dyn Transport,
) -> SweepResult<f64> {
    let n = mps.len();
    let mut lenvs = TenVec::new(n);
    let mut renvs = TenVec::new(n);
    let mut e0 = 0.0;

    for i in left_boundary..=right_boundary - 2 {
        load_related_tens_right_moving(mps, &mut lenvs, &mut renvs, i, left_boundary, params)?;
        e0 = master_two_site_vmps_update(
            mps,
            &mut lenvs,
            &mut renvs,
            mpo,
            params,
            SweepDirection::Right,
            i,
            noise,
            tp,
        )?;
        dump_related_tens_right_moving(mps, &mut lenvs, &mut renvs, i, params)?;
    }
    for i in (left_boundary + 2..=right_boundary).rev() {
        load_related_tens_left_moving(mps, &mut lenvs, &mut renvs, i, right_boundary, params)?;
        e0 = master_two_site_vmps_update(
            mps,
            &mut lenvs,
            &mut renvs,
            mpo,
            params,
            SweepDirection::Left,
            i,
            noise,
            tp,
        )?;
        dump_related_tens_left_moving(mps, &mut lenvs, &mut renvs, i, params)?;
    }
    Ok(e0)
}

pub(crate) fn load_related_tens_right_moving<S: Scalar>(
    mps: &mut FiniteMps<S>,
    lenvs: &mut TenVec<S>,
    renvs: &mut TenVec<S>,
    target: SiteIndex,
    left_boundary: SiteIndex,
    params: &SweepParams,
) -> SweepResult<()> {
    let n = mps.len();
    mps.load_ten(target + 2, &mps_ten_path(&params.mps_path, target + 2))?;
    let renv_len = n - (target + 2);
    let renv_file = env_ten_path(&params.temp_path, EnvSide::Right, renv_len);
    renvs.load_ten(renv_len, &renv_file)?;
    io::remove_file(&renv_file)?;
    if target == left_boundary {
        let lenv_file = env_ten_path(&params.temp_path, EnvSide::Left, target);
        lenvs.load_ten(target, &lenv_file)?;
    }
    Ok(())
}

pub(crate) fn dump_related_tens_right_moving<S: Scalar>(
    mps: &mut FiniteMps<S>,
    lenvs: &mut TenVec<S>,
    renvs: &mut TenVec<S>,
    target: SiteIndex,
    params: &SweepParams,
) -> SweepResult<()> {
    let n = mps.len();
    mps.dump_ten(target, &mps_ten_path(&params.mps_path, target), true)?;
    lenvs.dump_ten(
        target + 1,
        &env_ten_path(&params.temp_path, EnvSide::Left, target + 1),
        false,
    )?;
    lenvs.dealloc(target);
    renvs.dealloc(n - (target + 2));
    Ok(())
}

pub(crate) fn load_related_tens_left_moving<S: Scalar>(
    mps: &mut FiniteMps<S>,
    lenvs: &mut TenVec<S>,
    renvs: &mut TenVec<S>,
    target: SiteIndex,
    right_boundary: SiteIndex,
    params: &SweepParams,
) -> SweepResult<()> {
    let n = mps.len();
    mps.load_ten(target - 2, &mps_ten_path(&params.mps_path, target - 2))?;
    if target == right_boundary {
        let renv_len = (n - 1) - target;
        renvs.load_ten(renv_len, &env_ten_path(&params.temp_path, EnvSide::Right, renv_len))?;
        // the in-memory left environment is current; its on-disk copy from
        // the right-moving pass is stale
        io::remove_file(&env_ten_path(&params.temp_path, EnvSide::Left, target - 1))?;
    } else {
        let lenv_len = target - 1;
        let lenv_file = env_ten_path(&params.temp_path, EnvSide::Left, lenv_len);
        lenvs.load_ten(lenv_len, &lenv_file)?;
        io::remove_file(&lenv_file)?;
    }
    Ok(())
}

pub(crate) fn dump_related_tens_left_moving<S: Scalar>(
    mps: &mut FiniteMps<S>,
    lenvs: &mut TenVec<S>,
    renvs: &mut TenVec<S>,
    target: SiteIndex,
    params: &SweepParams,
) -> SweepResult<()> {
    let n = mps.len();
    mps.dump_ten(target, &mps_ten_path(&params.mps_path, target), true)?;
    renvs.dump_ten(
        n - target,
        &env_ten_path(&params.temp_path, EnvSide::Right, n - target),
        false,
    )?;
    renvs.dealloc(n - target - 1);
    lenvs.dealloc(target - 1);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn master_two_site_vmps_update<S: Scalar>(
    mps: &mut FiniteMps<S>,
    lenvs: &mut TenVec<S>,
    renvs: &mut TenVec<S>,
    mpo: &Mpo<S>,
    params: &SweepParams,
    dir: SweepDirection,
    target: SiteIndex,
    noise: f64,
    tp: &dyn Transport,
) -> SweepResult<f64> {
    let update_timer = Instant::now();
    let n = mps.len();
    let (lsite, rsite, lenv_len, renv_len) = match dir {
        SweepDirection::Right => (target, target + 1, target, n - (target + 2)),
        SweepDirection::Left => (target - 1, target, target - 1, n - target - 1),
    };

    let init_state = contract(mps.get(lsite), mps.get(rsite), &[2], &[0]);
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::Lanczos);
        broadcast_serializing(tp, MASTER_RANK, lsite);
    }
    let lancz_timer = Instant::now();
    let lancz_res = {
        let eff = EffHam {
            lenv: lenvs.get(lenv_len),
            lmpo: &mpo[lsite],
            rmpo: &mpo[rsite],
            renv: renvs.get(renv_len),
        };
        master_lanczos_solver(&eff, init_state, &params.lancz_params, tp)
    };
    let lancz_elapsed = lancz_timer.elapsed().as_secs_f64();
    let mut gs_vec = lancz_res.gs_vec;

    if noise.abs() >= NOISE_FLOOR {
        let eff = EffHam {
            lenv: lenvs.get(lenv_len),
            lmpo: &mpo[lsite],
            rmpo: &mpo[rsite],
            renv: renvs.get(renv_len),
        };
        match dir {
            SweepDirection::Right => {
                if tp.size() > 1 {
                    master_broadcast_order(tp, Order::ContractForRightMovingExpansion);
                }
                master_right_moving_expand(mps, &mut gs_vec, &eff, target, noise, tp);
            }
            SweepDirection::Left => {
                if tp.size() > 1 {
                    master_broadcast_order(tp, Order::ContractForLeftMovingExpansion);
                }
                master_left_moving_expand(mps, &mut gs_vec, &eff, target, noise, tp);
            }
        }
    }

    if tp.size() > 1 {
        master_broadcast_order(tp, Order::Svd);
    }
    let svd_res = mpi_svd_master(&gs_vec, 2, &params.truncation_spec(), tp);
    let ee = measure_entanglement_entropy(&svd_res.svals);
    match dir {
        SweepDirection::Right => {
            mps.put(lsite, svd_res.u);
            mps.put(rsite, contract(&svd_res.s, &svd_res.vt, &[1], &[0]));
        }
        SweepDirection::Left => {
            mps.put(lsite, contract(&svd_res.u, &svd_res.s, &[2], &[0]));
            mps.put(rsite, svd_res.vt);
        }
    }

    match dir {
        SweepDirection::Right => {
            if tp.size() > 1 {
                master_broadcast_order(tp, Order::GrowingLeftEnv);
            }
            let new_lenv =
                master_grow_left_environment(lenvs.get(lenv_len), &mpo[target], mps.get(target), tp);
            lenvs.put(lenv_len + 1, new_lenv);
        }
        SweepDirection::Left => {
            if tp.size() > 1 {
                master_broadcast_order(tp, Order::GrowingRightEnv);
            }
            let new_renv =
                master_grow_right_environment(renvs.get(renv_len), &mpo[target], mps.get(target), tp);
            renvs.put(renv_len + 1, new_renv);
        }
    }

    info!(
        site = target,
        e0 = lancz_res.gs_eng,
        trunc_err = svd_res.actual_trunc_err,
        d = svd_res.d,
        iters = lancz_res.iters,
        lancz_s = lancz_elapsed,
        total_s = update_timer.elapsed().as_secs_f64(),
        entropy = ee;
        "bond update"
    );
    Ok(lancz_res.gs_eng)
}

/// Slave order loop for the VMPS program: block on the broadcast, dispatch,
/// repeat until `ProgramFinal`. Unknown order codes are reported and
/// ignored for forward compatibility.
pub fn slave_two_site_finite_vmps<S: Scalar>(mpo: &Mpo<S>, tp: &dyn Transport) {
    let rank = tp.rank();
    let mut lenv: Option<BlockTensor<S>> = None;
    let mut renv: Option<BlockTensor<S>> = None;
    let mut lsite: SiteIndex = 0;
    loop {
        let Some(order) = slave_get_broadcast_order(tp) else {
            warn!(rank; "slave does not understand the received order, ignoring");
            continue;
        };
        match order {
            Order::ProgramStart => {
                send_value(tp, MASTER_RANK, 2 * rank, &rank);
            }
            Order::InitGrowEnv => {
                debug!(rank; "initial environment generation begins");
            }
            Order::InitGrowEnvGrow => {
                slave_init_grow_step(mpo, tp);
            }
            Order::InitGrowEnvFinish => {
                debug!(rank; "initial environment generation finished");
            }
            Order::Lanczos => {
                lsite = broadcast_serializing(tp, MASTER_RANK, 0);
                let (l, r) = slave_lanczos_solver(&mpo[lsite], &mpo[lsite + 1], tp);
                lenv = Some(l);
                renv = Some(r);
            }
            Order::Svd => {
                mpi_svd_slave::<S>(tp);
            }
            Order::ContractForRightMovingExpansion => {
                let eff = EffHam {
                    lenv: lenv.as_ref().expect("expansion before any lanczos"),
                    lmpo: &mpo[lsite],
                    rmpo: &mpo[lsite + 1],
                    renv: renv.as_ref().expect("expansion before any lanczos"),
                };
                slave_right_moving_expand(&eff, tp);
            }
            Order::ContractForLeftMovingExpansion => {
                let eff = EffHam {
                    lenv: lenv.as_ref().expect("expansion before any lanczos"),
                    lmpo: &mpo[lsite],
                    rmpo: &mpo[lsite + 1],
                    renv: renv.as_ref().expect("expansion before any lanczos"),
                };
                slave_left_moving_expand(&eff, tp);
            }
            Order::GrowingLeftEnv => {
                let env = lenv.take().expect("environment growth before lanczos");
                renv = None;
                slave_grow_left_environment(&env, &mpo[lsite], tp);
            }
            Order::GrowingRightEnv => {
                let env = renv.take().expect("environment growth before lanczos");
                lenv = None;
                slave_grow_right_environment(&env, &mpo[lsite + 1], tp);
            }
            Order::ProgramFinal => {
                info!(rank; "slave will stop");
                break;
            }
            other => {
                warn!(rank, order = format!("{other:?}"); "order out of context, ignoring");
            }
        }
    }
}

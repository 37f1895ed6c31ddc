//! Two-site finite TDVP with master/slave parallelism.
//!
//! The controller structure is that of the VMPS sweep: the same order
//! protocol, the same working-window and environment-file choreography, the
//! same distributed matrix-vector product. Only the numeric kernel differs:
//! each bond evolves under the Krylov exponential instead of minimizing the
//! energy, and the site split off a bond is evolved backwards by the serial
//! single-site exponential to complete the projector-splitting step. TDVP
//! slaves do not carry the subspace-expansion capability; receiving an
//! expansion order is a fatal misconfiguration.

use std::time::Instant;

use log::{debug, error, info, warn};
use num_complex::Complex64;

use crate::blocksparse::contract;
use crate::blocksparse::BlockTensor;
use crate::comm::{
    broadcast_serializing, master_broadcast_order, recv_value, send_value,
    slave_get_broadcast_order, Order, Transport, MASTER_RANK,
};
use crate::env::{
    master_grow_left_environment, master_grow_right_environment, slave_grow_left_environment,
    slave_grow_right_environment, slave_init_grow_step,
};
use crate::io::mps_ten_path;
use crate::lanczos::{
    eff_ham_mul_one_site_state, lanczos_expmv, master_lanczos_expmv_solver,
    slave_lanczos_solver, EffHam,
};
use crate::mpo::Mpo;
use crate::mps::{FiniteMps, TenVec};
use crate::svd::{measure_entanglement_entropy, mpi_svd_master, mpi_svd_slave};
use crate::sweep::{
    dump_related_tens_left_moving, dump_related_tens_right_moving,
    load_related_tens_left_moving, load_related_tens_right_moving, master_vmps_init,
    SweepDirection, SweepParams, SweepResult,
};
use crate::types::SiteIndex;

/// TDVP configuration: the sweep machinery settings plus the time step.
/// `sweep.sweeps` is the number of time steps; each sweep advances the state
/// by `tau` (a right pass and a left pass of `tau / 2` each).
#[derive(Debug, Clone)]
pub struct TdvpParams {
    pub sweep: SweepParams,
    pub tau: f64,
}

/// Runs the two-site TDVP program on every rank.
pub fn two_site_finite_tdvp(
    mps: &mut FiniteMps<Complex64>,
    mpo: &Mpo<Complex64>,
    params: &TdvpParams,
    tp: &dyn Transport,
) -> SweepResult<()> {
    if tp.rank() == MASTER_RANK {
        master_two_site_finite_tdvp(mps, mpo, params, tp)
    } else {
        slave_two_site_finite_tdvp(mpo, tp);
        Ok(())
    }
}

pub fn master_two_site_finite_tdvp(
    mps: &mut FiniteMps<Complex64>,
    mpo: &Mpo<Complex64>,
    params: &TdvpParams,
    tp: &dyn Transport,
) -> SweepResult<()> {
    assert_eq!(mps.len(), mpo.len());
    info!("***** Two-Site Update TDVP Program (with distributed workers) *****");
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::ProgramStart);
        for w in 1..tp.size() {
            let r: usize = recv_value(tp, w, 2 * w);
            assert_eq!(r, w, "handshake from worker {w} carried rank {r}");
        }
    }

    let (left_boundary, right_boundary) = master_vmps_init(mps, mpo, &params.sweep, tp)?;

    mps.load_ten(
        left_boundary,
        &mps_ten_path(&params.sweep.mps_path, left_boundary),
    )?;
    mps.load_ten(
        left_boundary + 1,
        &mps_ten_path(&params.sweep.mps_path, left_boundary + 1),
    )?;
    for step in 1..=params.sweep.sweeps {
        let sweep_timer = Instant::now();
        two_site_finite_tdvp_sweep(mps, mpo, params, left_boundary, right_boundary, tp)?;
        info!(
            step,
            time = step as f64 * params.tau,
            elapsed_s = sweep_timer.elapsed().as_secs_f64();
            "time step finished"
        );
    }
    mps.dump_ten(
        left_boundary,
        &mps_ten_path(&params.sweep.mps_path, left_boundary),
        true,
    )?;
    mps.dump_ten(
        left_boundary + 1,
        &mps_ten_path(&params.sweep.mps_path, left_boundary + 1),
        true,
    )?;
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::ProgramFinal);
    }
    Ok(())
}

fn two_site_finite_tdvp_sweep(
    mps: &mut FiniteMps<Complex64>,
    mpo: &Mpo<Complex64>,
    params: &TdvpParams,
    left_boundary: SiteIndex,
    right_boundary: SiteIndex,
    tp: &dyn Transport,
) -> SweepResult<()> {
    let n = mps.len();
    let mut lenvs = TenVec::new(n);
    let mut renvs = TenVec::new(n);

    for i in left_boundary..=right_boundary - 2 {
        load_related_tens_right_moving(mps, &mut lenvs, &mut renvs, i, left_boundary, &params.sweep)?;
        master_two_site_tdvp_update(
            mps,
            &mut lenvs,
            &mut renvs,
            mpo,
            params,
            SweepDirection::Right,
            i,
            i == right_boundary - 2,
            tp,
        )?;
        dump_related_tens_right_moving(mps, &mut lenvs, &mut renvs, i, &params.sweep)?;
    }
    for i in (left_boundary + 2..=right_boundary).rev() {
        load_related_tens_left_moving(mps, &mut lenvs, &mut renvs, i, right_boundary, &params.sweep)?;
        master_two_site_tdvp_update(
            mps,
            &mut lenvs,
            &mut renvs,
            mpo,
            params,
            SweepDirection::Left,
            i,
            i == left_boundary + 2,
            tp,
        )?;
        dump_related_tens_left_moving(mps, &mut lenvs, &mut renvs, i, &params.sweep)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn master_two_site_tdvp_update(
    mps: &mut FiniteMps<Complex64>,
    lenvs: &mut TenVec<Complex64>,
    renvs: &mut TenVec<Complex64>,
    mpo: &Mpo<Complex64>,
    params: &TdvpParams,
    dir: SweepDirection,
    target: SiteIndex,
    pass_end: bool,
    tp: &dyn Transport,
) -> SweepResult<()> {
    let update_timer = Instant::now();
    let n = mps.len();
    let delta = params.tau / 2.0;
    let (lsite, rsite, lenv_len, renv_len) = match dir {
        SweepDirection::Right => (target, target + 1, target, n - (target + 2)),
        SweepDirection::Left => (target - 1, target, target - 1, n - target - 1),
    };

    let init_state = contract(mps.get(lsite), mps.get(rsite), &[2], &[0]);
    if tp.size() > 1 {
        master_broadcast_order(tp, Order::Lanczos);
        broadcast_serializing(tp, MASTER_RANK, lsite);
    }
    let evolved = {
        let eff = EffHam {
            lenv: lenvs.get(lenv_len),
            lmpo: &mpo[lsite],
            rmpo: &mpo[rsite],
            renv: renvs.get(renv_len),
        };
        master_lanczos_expmv_solver(&eff, &init_state, delta, &params.sweep.lancz_params, tp)
    };

    if tp.size() > 1 {
        master_broadcast_order(tp, Order::Svd);
    }
    let svd_res = mpi_svd_master(&evolved.expmv, 2, &params.sweep.truncation_spec(), tp);
    let ee = measure_entanglement_entropy(&svd_res.svals);

    match dir {
        SweepDirection::Right => {
            mps.put(lsite, svd_res.u);
            mps.put(rsite, contract(&svd_res.s, &svd_res.vt, &[1], &[0]));
            if tp.size() > 1 {
                master_broadcast_order(tp, Order::GrowingLeftEnv);
            }
            let new_lenv =
                master_grow_left_environment(lenvs.get(lenv_len), &mpo[target], mps.get(target), tp);
            lenvs.put(lenv_len + 1, new_lenv);
            if !pass_end {
                // complete the projector-splitting step: the split-off site
                // evolves backwards under its single-site Hamiltonian
                let center = mps.take(rsite);
                let back = lanczos_expmv(
                    |v| {
                        eff_ham_mul_one_site_state(
                            lenvs.get(lenv_len + 1),
                            &mpo[rsite],
                            renvs.get(renv_len),
                            v,
                        )
                    },
                    &center,
                    -delta,
                    &params.sweep.lancz_params,
                );
                mps.put(rsite, back.expmv);
            }
        }
        SweepDirection::Left => {
            mps.put(lsite, contract(&svd_res.u, &svd_res.s, &[2], &[0]));
            mps.put(rsite, svd_res.vt);
            if tp.size() > 1 {
                master_broadcast_order(tp, Order::GrowingRightEnv);
            }
            let new_renv =
                master_grow_right_environment(renvs.get(renv_len), &mpo[target], mps.get(target), tp);
            renvs.put(renv_len + 1, new_renv);
            if !pass_end {
                let center = mps.take(lsite);
                let back = lanczos_expmv(
                    |v| {
                        eff_ham_mul_one_site_state(
                            lenvs.get(lenv_len),
                            &mpo[lsite],
                            renvs.get(renv_len + 1),
                            v,
                        )
                    },
                    &center,
                    -delta,
                    &params.sweep.lancz_params,
                );
                mps.put(lsite, back.expmv);
            }
        }
    }

    info!(
        site = target,
        trunc_err = svd_res.actual_trunc_err,
        d = svd_res.d,
        iters = evolved.iters,
        total_s = update_timer.elapsed().as_secs_f64(),
        entropy = ee;
        "tdvp bond update"
    );
    Ok(())
}

/// Slave order loop for the TDVP program. Structurally the VMPS loop, except
/// that the subspace-expansion orders are outside this program's capability
/// and abort the whole job.
pub fn slave_two_site_finite_tdvp(mpo: &Mpo<Complex64>, tp: &dyn Transport) {
    let rank = tp.rank();
    let mut lenv: Option<BlockTensor<Complex64>> = None;
    let mut renv: Option<BlockTensor<Complex64>> = None;
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
                mpi_svd_slave::<Complex64>(tp);
            }
            Order::ContractForRightMovingExpansion
            | Order::ContractForLeftMovingExpansion => {
                error!(rank; "slave doesn't have the functionality of subspace expansion, aborting");
                tp.abort(1);
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

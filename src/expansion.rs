//! Noise-driven subspace expansion for two-site VMPS.
//!
//! The noise term is the environment-MPO-MPO chain applied to the current
//! ground-state candidate with the far environment left off, scaled by the
//! configured noise magnitude. It is merged into the trial state by direct
//! sum along the bond being grown (an additive enlargement, never an SVD)
//! and the neighboring MPS tensor is zero-padded to match, so the physical
//! content of the state is untouched until the following truncation decides
//! what to keep.

use crate::blocksparse::{contract, contract_sector, BlockTensor};
use crate::comm::{broadcast_serializing, broadcast_tensor, Transport, MASTER_RANK};
use crate::lanczos::EffHam;
use crate::mps::FiniteMps;
use crate::sched::{
    collective_linear_combine, master_collect_sector_tasks, slave_compute_sector_tasks,
};
use crate::types::{Scalar, SiteIndex};

/// One sector slice of the right-moving noise term, of shape
/// `[conjugate left bond, phys, phys, old right bond ⊗ mpo bond]`.
#[must_use]
pub fn right_expand_sector<S: Scalar>(
    eff: &EffHam<'_, S>,
    state: &BlockTensor<S>,
    noise: f64,
    sector: usize,
) -> BlockTensor<S> {
    let t1 = contract_sector(eff.lenv, 2, sector, state, &[0], &[0]);
    let t2 = contract(&t1, eff.lmpo, &[0, 2], &[0, 1]);
    let mut t3 = contract(&t2, eff.rmpo, &[4, 1], &[0, 1]);
    t3.transpose(&[0, 2, 3, 1, 4]);
    let mut res = t3.fuse_axes(3);
    res.scale(S::from_real(noise));
    res
}

/// One sector slice of the left-moving noise term, of shape
/// `[old left bond ⊗ mpo bond, phys, phys, conjugate right bond]`.
#[must_use]
pub fn left_expand_sector<S: Scalar>(
    eff: &EffHam<'_, S>,
    state: &BlockTensor<S>,
    noise: f64,
    sector: usize,
) -> BlockTensor<S> {
    let t1 = contract_sector(state, 0, sector, eff.renv, &[3], &[0]);
    let t2 = contract(&t1, eff.rmpo, &[2, 3], &[1, 3]);
    let mut t3 = contract(&t2, eff.lmpo, &[1, 3], &[1, 3]);
    t3.transpose(&[0, 3, 4, 2, 1]);
    let mut res = t3.fuse_axes(0);
    res.scale(S::from_real(noise));
    res
}

/// Master side of the right-moving expansion: distribute the noise-term
/// contraction, then enlarge the trial state along its right bond and
/// zero-pad `mps[target + 2]` to match.
pub fn master_right_moving_expand<S: Scalar>(
    mps: &mut FiniteMps<S>,
    gs_vec: &mut BlockTensor<S>,
    eff: &EffHam<'_, S>,
    target_site: SiteIndex,
    noise: f64,
    tp: &dyn Transport,
) {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(gs_vec.clone()));
        broadcast_serializing(tp, MASTER_RANK, noise);
    }
    let split = eff.lenv.index(2);
    let difficulties: Vec<usize> =
        (0..split.sector_count()).map(|s| split.sector_dim(s)).collect();
    let (slices, _) = master_collect_sector_tasks(tp, &difficulties, |task| {
        right_expand_sector(eff, gs_vec, noise, task)
    });
    let noise_term = collective_linear_combine(slices);

    *gs_vec = gs_vec.expand(&noise_term, 3);

    let next_next = target_site + 2;
    let old = mps.take(next_next);
    let zero = BlockTensor::new(
        vec![
            noise_term.index(3).inverse(),
            old.index(1).clone(),
            old.index(2).clone(),
        ],
        0,
    );
    mps.put(next_next, old.expand(&zero, 0));
}

/// Slave side of the right-moving expansion.
pub fn slave_right_moving_expand<S: Scalar>(eff: &EffHam<'_, S>, tp: &dyn Transport) {
    let state: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let noise: f64 = broadcast_serializing(tp, MASTER_RANK, 0.0);
    let n_tasks = eff.lenv.index(2).sector_count();
    slave_compute_sector_tasks(tp, n_tasks, |task| {
        right_expand_sector(eff, &state, noise, task)
    });
}

/// Master side of the left-moving expansion: mirror of the right-moving
/// case, growing the trial state's left bond and zero-padding
/// `mps[target - 2]`.
pub fn master_left_moving_expand<S: Scalar>(
    mps: &mut FiniteMps<S>,
    gs_vec: &mut BlockTensor<S>,
    eff: &EffHam<'_, S>,
    target_site: SiteIndex,
    noise: f64,
    tp: &dyn Transport,
) {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(gs_vec.clone()));
        broadcast_serializing(tp, MASTER_RANK, noise);
    }
    let split = gs_vec.index(0);
    let difficulties: Vec<usize> =
        (0..split.sector_count()).map(|s| split.sector_dim(s)).collect();
    let (slices, _) = master_collect_sector_tasks(tp, &difficulties, |task| {
        left_expand_sector(eff, gs_vec, noise, task)
    });
    let noise_term = collective_linear_combine(slices);

    *gs_vec = gs_vec.expand(&noise_term, 0);

    let next_next = target_site - 2;
    let old = mps.take(next_next);
    let zero = BlockTensor::new(
        vec![
            old.index(0).clone(),
            old.index(1).clone(),
            noise_term.index(0).inverse(),
        ],
        0,
    );
    mps.put(next_next, old.expand(&zero, 2));
}

/// Slave side of the left-moving expansion. The split axis lives on the
/// broadcast state itself here, mirroring the master.
pub fn slave_left_moving_expand<S: Scalar>(eff: &EffHam<'_, S>, tp: &dyn Transport) {
    let state: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let noise: f64 = broadcast_serializing(tp, MASTER_RANK, 0.0);
    let n_tasks = state.index(0).sector_count();
    slave_compute_sector_tasks(tp, n_tasks, |task| {
        left_expand_sector(eff, &state, noise, task)
    });
}

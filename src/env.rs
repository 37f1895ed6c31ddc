//! Environment tensors: incremental growth, disk cache, and the pre-sweep
//! boundary check.
//!
//! A left environment of length `l` is the exact contraction of sites
//! `0..l` with their MPO tensors and conjugates; its axis signature is
//! `[mps bond (Out), mpo bond (Out), conjugate mps bond (In)]`. Right
//! environments mirror this from the other end with signature
//! `[mps bond (In), mpo bond (In), conjugate mps bond (Out)]`.

use std::path::Path;

use log::{debug, info};

use crate::blocksparse::{
    contract, contract_sector, index_combiner, BlockTensor,
};
use crate::comm::{
    broadcast_serializing, broadcast_tensor, master_broadcast_order, Order, Transport,
    MASTER_RANK,
};
use crate::io::{
    self, env_ten_path, is_path_exist, mps_ten_path, EnvSide, StorageResult,
};
use crate::mps::FiniteMps;
use crate::mpo::Mpo;
use crate::sched::{
    collective_linear_combine, master_collect_sector_tasks, slave_compute_sector_tasks,
};
use crate::types::{Scalar, SiteIndex};

/// The length-zero left environment at the open left boundary.
#[must_use]
pub fn trivial_left_env<S: Scalar>(
    mps0: &BlockTensor<S>,
    mpo0: &BlockTensor<S>,
) -> BlockTensor<S> {
    let mut env = BlockTensor::new(
        vec![
            mps0.index(0).inverse(),
            mpo0.index(0).inverse(),
            mps0.index(0).clone(),
        ],
        0,
    );
    env.set(&[0, 0, 0], S::one());
    env
}

/// The length-zero right environment at the open right boundary.
#[must_use]
pub fn trivial_right_env<S: Scalar>(
    mps_last: &BlockTensor<S>,
    mpo_last: &BlockTensor<S>,
) -> BlockTensor<S> {
    let mut env = BlockTensor::new(
        vec![
            mps_last.index(2).inverse(),
            mpo_last.index(3).inverse(),
            mps_last.index(2).clone(),
        ],
        0,
    );
    env.set(&[0, 0, 0], S::one());
    env
}

/// One sector slice of the grown left environment: restricts the absorbed
/// site tensor to `sector` on its outgoing bond, which is the first output
/// axis, so slices over distinct sectors are disjoint.
#[must_use]
pub fn grow_left_env_sector<S: Scalar>(
    lenv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
    sector: usize,
) -> BlockTensor<S> {
    let t1 = contract_sector(mps_ten, 2, sector, lenv, &[0], &[0]);
    let t2 = contract(&t1, mpo_ten, &[0, 2], &[1, 0]);
    contract(&t2, &mps_ten.dag(), &[1, 2], &[0, 1])
}

/// Exact one-site extension of a left environment.
#[must_use]
pub fn grow_left_env<S: Scalar>(
    lenv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
) -> BlockTensor<S> {
    let t1 = contract(mps_ten, lenv, &[0], &[0]);
    let t2 = contract(&t1, mpo_ten, &[0, 2], &[1, 0]);
    contract(&t2, &mps_ten.dag(), &[1, 2], &[0, 1])
}

/// One sector slice of the grown right environment (site tensor restricted
/// on its incoming bond).
#[must_use]
pub fn grow_right_env_sector<S: Scalar>(
    renv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
    sector: usize,
) -> BlockTensor<S> {
    let t1 = contract_sector(mps_ten, 0, sector, renv, &[2], &[0]);
    let t2 = contract(&t1, mpo_ten, &[1, 2], &[1, 3]);
    contract(&t2, &mps_ten.dag(), &[1, 3], &[2, 1])
}

/// Exact one-site extension of a right environment.
#[must_use]
pub fn grow_right_env<S: Scalar>(
    renv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
) -> BlockTensor<S> {
    let t1 = contract(mps_ten, renv, &[2], &[0]);
    let t2 = contract(&t1, mpo_ten, &[1, 2], &[1, 3]);
    contract(&t2, &mps_ten.dag(), &[1, 3], &[2, 1])
}

fn sector_difficulties(idx: &crate::blocksparse::U1Index) -> Vec<usize> {
    (0..idx.sector_count()).map(|s| idx.sector_dim(s)).collect()
}

/// Master side of the distributed left-environment growth. Slaves already
/// hold the environment and MPO tensor from the preceding Lanczos phase;
/// only the freshly updated site tensor is broadcast.
#[must_use]
pub fn master_grow_left_environment<S: Scalar>(
    lenv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
    tp: &dyn Transport,
) -> BlockTensor<S> {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(mps_ten.clone()));
    }
    let difficulties = sector_difficulties(mps_ten.index(2));
    let (slices, _) = master_collect_sector_tasks(tp, &difficulties, |task| {
        grow_left_env_sector(lenv, mpo_ten, mps_ten, task)
    });
    collective_linear_combine(slices)
}

pub fn slave_grow_left_environment<S: Scalar>(
    lenv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    tp: &dyn Transport,
) {
    let mps_ten: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let n_tasks = mps_ten.index(2).sector_count();
    slave_compute_sector_tasks(tp, n_tasks, |task| {
        grow_left_env_sector(lenv, mpo_ten, &mps_ten, task)
    });
}

#[must_use]
pub fn master_grow_right_environment<S: Scalar>(
    renv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    mps_ten: &BlockTensor<S>,
    tp: &dyn Transport,
) -> BlockTensor<S> {
    if tp.size() > 1 {
        let _ = broadcast_tensor(tp, MASTER_RANK, Some(mps_ten.clone()));
    }
    let difficulties = sector_difficulties(mps_ten.index(0));
    let (slices, _) = master_collect_sector_tasks(tp, &difficulties, |task| {
        grow_right_env_sector(renv, mpo_ten, mps_ten, task)
    });
    collective_linear_combine(slices)
}

pub fn slave_grow_right_environment<S: Scalar>(
    renv: &BlockTensor<S>,
    mpo_ten: &BlockTensor<S>,
    tp: &dyn Transport,
) {
    let mps_ten: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    let n_tasks = mps_ten.index(0).sector_count();
    slave_compute_sector_tasks(tp, n_tasks, |task| {
        grow_right_env_sector(renv, mpo_ten, &mps_ten, task)
    });
}

/// Pre-sweep boundary determination.
///
/// Canonicalizes edge sites inward from both ends. A site whose two open
/// legs fuse to more than `dmax` fixes the boundary; a site whose bond has
/// not yet saturated that fused dimension is replaced by an index combiner
/// (an SVD-free basis change) with its content pushed to the neighbor, so
/// no sweep time is spent on unconverged edge bonds. Sites outside the
/// returned inclusive `(left_boundary, right_boundary)` range are frozen.
///
/// Only sites whose tensors actually changed are rewritten to disk, which
/// makes a second run on an already-canonical, saturated MPS a no-op.
pub fn check_and_update_boundary_tensors<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mps_path: &Path,
    dmax: usize,
) -> StorageResult<(SiteIndex, SiteIndex)> {
    assert!(mps.is_all_dealloc());
    let n = mps.len();
    let (left_middle, right_middle) = if n % 2 == 0 {
        (n / 2 - 1, n / 2)
    } else {
        (n / 2, n / 2)
    };
    let mut changed = vec![false; n];

    // left side
    let mut left_boundary = 0;
    mps.load_ten(0, &mps_ten_path(mps_path, 0))?;
    for i in 0..left_middle {
        mps.load_ten(i + 1, &mps_ten_path(mps_path, i + 1))?;
        if mps.left_canonicalize_ten(i) {
            changed[i] = true;
            changed[i + 1] = true;
        }
        let shape = mps.get(i).shape();
        if shape[0] * shape[1] > dmax {
            left_boundary = i;
            break;
        } else if shape[0] * shape[1] > shape[2] {
            let t = mps.take(i);
            let fused = t.fuse_axes(0);
            let next = mps.take(i + 1);
            mps.put(i + 1, contract(&fused, &next, &[1], &[0]));
            mps.put(i, index_combiner(t.index(0), t.index(1)));
            changed[i] = true;
            changed[i + 1] = true;
        }
        if i + 1 == left_middle {
            left_boundary = i;
        }
    }
    for i in 0..=left_boundary + 1 {
        if mps.is_loaded(i) {
            if changed[i] {
                mps.dump_ten(i, &mps_ten_path(mps_path, i), true)?;
            } else {
                mps.dealloc(i);
            }
        }
    }

    // right side
    let mut right_boundary = right_middle + 1;
    mps.load_ten(n - 1, &mps_ten_path(mps_path, n - 1))?;
    for i in ((right_middle + 1)..n).rev() {
        mps.load_ten(i - 1, &mps_ten_path(mps_path, i - 1))?;
        if mps.right_canonicalize_ten(i) {
            changed[i] = true;
            changed[i - 1] = true;
        }
        let shape = mps.get(i).shape();
        if shape[1] * shape[2] > dmax {
            right_boundary = i;
            break;
        } else if shape[1] * shape[2] > shape[0] {
            let t = mps.take(i);
            let fused = t.fuse_axes(1);
            let prev = mps.take(i - 1);
            mps.put(i - 1, contract(&prev, &fused, &[2], &[0]));
            let mut comb = index_combiner(t.index(1), t.index(2));
            comb.transpose(&[2, 0, 1]);
            mps.put(i, comb);
            changed[i] = true;
            changed[i - 1] = true;
        }
    }
    for i in (right_boundary - 1..n).rev() {
        if mps.is_loaded(i) {
            if changed[i] {
                mps.dump_ten(i, &mps_ten_path(mps_path, i), true)?;
            } else {
                mps.dealloc(i);
            }
        }
    }

    assert!(mps.is_all_dealloc());
    info!(left_boundary, right_boundary; "boundary check done");
    Ok((left_boundary, right_boundary))
}

/// Whether the on-disk right-environment cache for the sweep range is
/// incomplete. Creates `temp_path` if it does not exist yet.
pub fn need_generate_right_envs(
    n: usize,
    left_boundary: SiteIndex,
    right_boundary: SiteIndex,
    temp_path: &Path,
) -> StorageResult<bool> {
    if is_path_exist(temp_path) {
        for env_num in (n - 1) - right_boundary..=(n - 1) - (left_boundary + 1) {
            let file = env_ten_path(temp_path, EnvSide::Right, env_num);
            if !is_path_exist(&file) {
                info!(file = file.display().to_string(); "lost environment file");
                return Ok(true);
            }
        }
        Ok(false)
    } else {
        info!(temp_path = temp_path.display().to_string(); "no temp path, creating");
        io::create_path(temp_path)?;
        Ok(true)
    }
}

/// (Re)generates the right-environment cache, one file per interior bond,
/// distributing each absorption step over the worker pool. The caller wraps
/// this in `InitGrowEnv`/`InitGrowEnvFinish` orders; each step broadcasts
/// `InitGrowEnvGrow` with the site index, the current environment and the
/// absorbed site tensor.
pub fn master_init_envs<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    mps_path: &Path,
    temp_path: &Path,
    left_boundary: SiteIndex,
    tp: &dyn Transport,
) -> StorageResult<()> {
    let n = mps.len();
    mps.load_ten(n - 1, &mps_ten_path(mps_path, n - 1))?;
    let mut renv = trivial_right_env(mps.get(n - 1), &mpo[n - 1]);
    mps.dealloc(n - 1);

    for env_len in 1..=(n - 1) - (left_boundary + 1) {
        let site = n - env_len;
        mps.load_ten(site, &mps_ten_path(mps_path, site))?;
        if tp.size() > 1 {
            master_broadcast_order(tp, Order::InitGrowEnvGrow);
            broadcast_serializing(tp, MASTER_RANK, site);
            let _ = broadcast_tensor(tp, MASTER_RANK, Some(renv.clone()));
        }
        renv = master_grow_right_environment(&renv, &mpo[site], mps.get(site), tp);
        mps.dealloc(site);
        io::dump_tensor(&env_ten_path(temp_path, EnvSide::Right, env_len), &renv)?;
        debug!(env_len, site; "initial right environment grown");
    }
    Ok(())
}

/// Slave side of one `InitGrowEnvGrow` step.
pub fn slave_init_grow_step<S: Scalar>(mpo: &Mpo<S>, tp: &dyn Transport) {
    let site: SiteIndex = broadcast_serializing(tp, MASTER_RANK, 0);
    let renv: BlockTensor<S> = broadcast_tensor(tp, MASTER_RANK, None);
    slave_grow_right_environment(&renv, &mpo[site], tp);
}

/// Regenerates and rewrites the boundary environments: the left environment
/// of `left_boundary`, and the right environments of `right_boundary` and
/// `right_boundary - 1`. Serial on the master.
pub fn update_boundary_envs<S: Scalar>(
    mps: &mut FiniteMps<S>,
    mpo: &Mpo<S>,
    mps_path: &Path,
    temp_path: &Path,
    left_boundary: SiteIndex,
    right_boundary: SiteIndex,
) -> StorageResult<()> {
    assert!(mps.is_all_dealloc());
    let n = mps.len();

    mps.load_ten(n - 1, &mps_ten_path(mps_path, n - 1))?;
    let mut renv = trivial_right_env(mps.get(n - 1), &mpo[n - 1]);
    mps.dealloc(n - 1);
    for i in 1..=n - right_boundary - 1 {
        let site = n - i;
        mps.load_ten(site, &mps_ten_path(mps_path, site))?;
        renv = grow_right_env(&renv, &mpo[site], mps.get(site));
        mps.dealloc(site);
    }
    io::dump_tensor(
        &env_ten_path(temp_path, EnvSide::Right, n - right_boundary - 1),
        &renv,
    )?;

    mps.load_ten(right_boundary, &mps_ten_path(mps_path, right_boundary))?;
    renv = grow_right_env(&renv, &mpo[right_boundary], mps.get(right_boundary));
    mps.dealloc(right_boundary);
    io::dump_tensor(
        &env_ten_path(temp_path, EnvSide::Right, n - right_boundary),
        &renv,
    )?;

    mps.load_ten(0, &mps_ten_path(mps_path, 0))?;
    let mut lenv = trivial_left_env(mps.get(0), &mpo[0]);
    mps.dealloc(0);
    for i in 0..left_boundary {
        mps.load_ten(i, &mps_ten_path(mps_path, i))?;
        lenv = grow_left_env(&lenv, &mpo[i], mps.get(i));
        mps.dealloc(i);
    }
    io::dump_tensor(&env_ten_path(temp_path, EnvSide::Left, left_boundary), &lenv)?;
    assert!(mps.is_all_dealloc());
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::mps::occupation_phys_index;

    fn setup_disk_mps(
        dir: &Path,
        occs: &[usize],
    ) -> (FiniteMps<f64>, Mpo<f64>) {
        let phys = occupation_phys_index();
        let mut mps = FiniteMps::<f64>::product_state(&phys, occs);
        let mpo = Mpo::spinless_fermion_chain(occs.len(), 1.0);
        mps.dump_all(dir).unwrap();
        (mps, mpo)
    }

    #[test]
    fn test_env_growth_invariant_scratch_vs_disk() {
        let dir = tempdir().unwrap();
        let (mut mps, mpo) = setup_disk_mps(dir.path(), &[1, 1, 0, 1, 0, 0]);
        let n = mps.len();
        for i in 0..n {
            mps.load_ten(i, &mps_ten_path(dir.path(), i)).unwrap();
        }

        // grow from scratch to length 3
        let mut lenv = trivial_left_env(mps.get(0), &mpo[0]);
        for i in 0..3 {
            lenv = grow_left_env(&lenv, &mpo[i], mps.get(i));
        }

        // dump at length 2, reload, grow one more step
        let mut lenv2 = trivial_left_env(mps.get(0), &mpo[0]);
        for i in 0..2 {
            lenv2 = grow_left_env(&lenv2, &mpo[i], mps.get(i));
        }
        let file = env_ten_path(dir.path(), EnvSide::Left, 2);
        io::dump_tensor(&file, &lenv2).unwrap();
        let reloaded: BlockTensor<f64> = io::load_tensor(&file).unwrap();
        let regrown = grow_left_env(&reloaded, &mpo[2], mps.get(2));

        assert!(regrown.distance(&lenv) < 1e-13);
    }

    #[test]
    fn test_sector_slices_sum_to_serial_growth() {
        use crate::blocksparse::{Direction, U1Index};
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(83);
        let mpo = Mpo::<f64>::spinless_fermion_chain(4, 1.0);
        let phys = occupation_phys_index();
        let bond_l = U1Index::new(vec![(1, 2), (2, 2)], Direction::In);
        let bond_r = U1Index::new(vec![(0, 1), (1, 2), (2, 2)], Direction::Out);
        let a = BlockTensor::<f64>::random(
            vec![bond_l.clone(), phys.clone(), bond_r],
            0,
            &mut rng,
        );
        let lenv = BlockTensor::<f64>::random(
            vec![
                bond_l.inverse(),
                mpo[1].index(0).inverse(),
                bond_l.clone(),
            ],
            0,
            &mut rng,
        );

        let full = grow_left_env(&lenv, &mpo[1], &a);
        let split_sectors = a.index(2).sector_count();
        let combined = collective_linear_combine(
            (0..split_sectors)
                .map(|s| grow_left_env_sector(&lenv, &mpo[1], &a, s))
                .collect(),
        );
        assert!(combined.distance(&full) < 1e-14);

        // right-side mirror
        let renv = BlockTensor::<f64>::random(
            vec![
                a.index(2).inverse(),
                mpo[1].index(3).inverse(),
                a.index(2).clone(),
            ],
            0,
            &mut rng,
        );
        let full_r = grow_right_env(&renv, &mpo[1], &a);
        let combined_r = collective_linear_combine(
            (0..a.index(0).sector_count())
                .map(|s| grow_right_env_sector(&renv, &mpo[1], &a, s))
                .collect(),
        );
        assert!(combined_r.distance(&full_r) < 1e-14);
    }

    #[test]
    fn test_boundary_check_and_idempotence() {
        let dir = tempdir().unwrap();
        let (mps, _mpo) = setup_disk_mps(dir.path(), &[1, 1, 0, 1, 0, 0]);
        drop(mps);
        let mut mps = FiniteMps::<f64>::new(6);
        let (lb, rb) =
            check_and_update_boundary_tensors(&mut mps, dir.path(), 16).unwrap();
        assert_eq!((lb, rb), (1, 4));

        // bonds outside the boundary are now saturated
        mps.load_ten(0, &mps_ten_path(dir.path(), 0)).unwrap();
        assert_eq!(mps.get(0).index(2).dim(), 2);
        mps.dealloc(0);

        // state must be preserved by the basis change
        let mut full_mps = FiniteMps::<f64>::new(6);
        for i in 0..6 {
            full_mps
                .load_ten(i, &mps_ten_path(dir.path(), i))
                .unwrap();
        }
        let phys = occupation_phys_index();
        let reference = FiniteMps::<f64>::product_state(&phys, &[1, 1, 0, 1, 0, 0]);
        let overlap = full_mps
            .to_full_tensor()
            .dot(&reference.to_full_tensor())
            .abs();
        assert!((overlap - 1.0).abs() < 1e-12);
        drop(full_mps);

        // second run: boundaries unchanged, nothing rewritten
        let mtimes: Vec<_> = (0..6)
            .map(|i| {
                std::fs::metadata(mps_ten_path(dir.path(), i))
                    .unwrap()
                    .modified()
                    .unwrap()
            })
            .collect();
        let mut mps2 = FiniteMps::<f64>::new(6);
        let (lb2, rb2) =
            check_and_update_boundary_tensors(&mut mps2, dir.path(), 16).unwrap();
        assert_eq!((lb2, rb2), (lb, rb));
        for (i, mtime) in mtimes.iter().enumerate() {
            let now = std::fs::metadata(mps_ten_path(dir.path(), i))
                .unwrap()
                .modified()
                .unwrap();
            assert_eq!(&now, mtime, "site {i} was rewritten");
        }
    }

    #[test]
    fn test_need_generate_right_envs_self_heals() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("temp");
        // absent directory: created, regeneration requested
        assert!(need_generate_right_envs(6, 1, 4, &temp).unwrap());
        assert!(is_path_exist(&temp));
        // still incomplete: files are missing
        assert!(need_generate_right_envs(6, 1, 4, &temp).unwrap());
    }
}

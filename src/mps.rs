//! Finite MPS with a disk-backed, partially materialized site list.

use std::path::Path;

use crate::blocksparse::{contract, svd, BlockTensor, Direction, U1Index};
use crate::io::{self, StorageResult};
use crate::types::{Scalar, SiteIndex};

/// A vector of tensor slots, only some of which are memory-resident.
/// Used for MPS sites and for the left/right environment caches.
#[derive(Debug)]
pub struct TenVec<S: Scalar> {
    tens: Vec<Option<BlockTensor<S>>>,
}

impl<S: Scalar> TenVec<S> {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            tens: (0..len).map(|_| None).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tens.is_empty()
    }

    /// True when no slot is materialized.
    #[must_use]
    pub fn is_all_dealloc(&self) -> bool {
        self.tens.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn get(&self, i: usize) -> &BlockTensor<S> {
        self.tens[i]
            .as_ref()
            .unwrap_or_else(|| panic!("tensor {i} is not materialized"))
    }

    #[must_use]
    pub fn is_loaded(&self, i: usize) -> bool {
        self.tens[i].is_some()
    }

    pub fn put(&mut self, i: usize, tensor: BlockTensor<S>) {
        self.tens[i] = Some(tensor);
    }

    #[must_use]
    pub fn take(&mut self, i: usize) -> BlockTensor<S> {
        self.tens[i]
            .take()
            .unwrap_or_else(|| panic!("tensor {i} is not materialized"))
    }

    /// Frees the in-memory copy of slot `i` (the on-disk copy, if any, is
    /// untouched).
    pub fn dealloc(&mut self, i: usize) {
        self.tens[i] = None;
    }

    pub fn load_ten(&mut self, i: usize, path: &Path) -> StorageResult<()> {
        self.tens[i] = Some(io::load_tensor(path)?);
        Ok(())
    }

    /// Writes slot `i` to `path`; with `release` the in-memory copy is freed
    /// right after.
    pub fn dump_ten(&mut self, i: usize, path: &Path, release: bool) -> StorageResult<()> {
        io::dump_tensor(path, self.get(i))?;
        if release {
            self.dealloc(i);
        }
        Ok(())
    }
}

/// Finite matrix product state.
///
/// Site tensors are rank-3 with axis signature `[left bond (In), physical
/// (Out), right bond (Out)]` and zero divergence; a bond therefore carries
/// the total charge still to be placed on the sites to its right.
#[derive(Debug)]
pub struct FiniteMps<S: Scalar> {
    tens: TenVec<S>,
}

impl<S: Scalar> FiniteMps<S> {
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            tens: TenVec::new(n),
        }
    }

    /// Builds the product state `|occs⟩` with dimension-one bonds.
    #[must_use]
    pub fn product_state(phys: &U1Index, occs: &[usize]) -> Self {
        let n = occs.len();
        let charges: Vec<i64> = occs
            .iter()
            .map(|&occ| {
                let (sector, _) = phys.locate(occ);
                phys.sector_charge(sector)
            })
            .collect();
        let mut mps = Self::new(n);
        // remaining[i] is the charge carried by the bond left of site i
        let mut remaining: Vec<i64> = vec![0; n + 1];
        for i in (0..n).rev() {
            remaining[i] = remaining[i + 1] + charges[i];
        }
        for (i, &occ) in occs.iter().enumerate() {
            let lbond = U1Index::new(vec![(remaining[i], 1)], Direction::In);
            let rbond = U1Index::new(vec![(remaining[i + 1], 1)], Direction::Out);
            let mut t = BlockTensor::new(vec![lbond, phys.clone(), rbond], 0);
            t.set(&[0, occ, 0], S::one());
            mps.put(i, t);
        }
        mps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tens.is_empty()
    }

    #[must_use]
    pub fn is_all_dealloc(&self) -> bool {
        self.tens.is_all_dealloc()
    }

    #[must_use]
    pub fn get(&self, i: SiteIndex) -> &BlockTensor<S> {
        self.tens.get(i)
    }

    #[must_use]
    pub fn is_loaded(&self, i: SiteIndex) -> bool {
        self.tens.is_loaded(i)
    }

    pub fn put(&mut self, i: SiteIndex, tensor: BlockTensor<S>) {
        self.tens.put(i, tensor);
    }

    #[must_use]
    pub fn take(&mut self, i: SiteIndex) -> BlockTensor<S> {
        self.tens.take(i)
    }

    pub fn dealloc(&mut self, i: SiteIndex) {
        self.tens.dealloc(i);
    }

    pub fn load_ten(&mut self, i: SiteIndex, path: &Path) -> StorageResult<()> {
        self.tens.load_ten(i, path)
    }

    pub fn dump_ten(&mut self, i: SiteIndex, path: &Path, release: bool) -> StorageResult<()> {
        self.tens.dump_ten(i, path, release)
    }

    /// Dumps every materialized site under `mps_path`.
    pub fn dump_all(&mut self, mps_path: &Path) -> StorageResult<()> {
        for i in 0..self.len() {
            if self.tens.is_loaded(i) {
                self.dump_ten(i, &io::mps_ten_path(mps_path, i), true)?;
            }
        }
        Ok(())
    }

    /// Turns site `i` into a left isometry, pushing its weight into `i + 1`.
    /// Both sites must be materialized. A site that already is an exact left
    /// isometry is left untouched; returns whether anything changed.
    pub fn left_canonicalize_ten(&mut self, i: SiteIndex) -> bool {
        if is_left_isometry(self.tens.get(i)) {
            return false;
        }
        let t = self.tens.take(i);
        let out = svd(&t, 2);
        let sv = contract(&out.s, &out.vt, &[1], &[0]);
        let next = self.tens.take(i + 1);
        self.tens.put(i + 1, contract(&sv, &next, &[1], &[0]));
        self.tens.put(i, out.u);
        true
    }

    /// Turns site `i` into a right isometry, pushing its weight into `i - 1`.
    pub fn right_canonicalize_ten(&mut self, i: SiteIndex) -> bool {
        if is_right_isometry(self.tens.get(i)) {
            return false;
        }
        let t = self.tens.take(i);
        let out = svd(&t, 1);
        let us = contract(&out.u, &out.s, &[1], &[0]);
        let prev = self.tens.take(i - 1);
        self.tens.put(i - 1, contract(&prev, &us, &[2], &[0]));
        self.tens.put(i, out.vt);
        true
    }

    /// Moves the orthogonality center to `center`. Every site must be
    /// materialized; diagnostic-path use only.
    pub fn centralize(&mut self, center: SiteIndex) {
        for i in 0..center {
            self.left_canonicalize_ten(i);
        }
        for i in (center + 1..self.len()).rev() {
            self.right_canonicalize_ten(i);
        }
    }

    /// Contracts all sites into the full state tensor. Test use only.
    #[must_use]
    pub fn to_full_tensor(&self) -> BlockTensor<S> {
        let mut acc = self.get(0).clone();
        for i in 1..self.len() {
            acc = contract(&acc, self.get(i), &[acc.rank() - 1], &[0]);
        }
        acc
    }
}

/// The occupation-number physical index for a single spinless-fermion mode:
/// charge 0 (empty) and charge 1 (occupied).
#[must_use]
pub fn occupation_phys_index() -> U1Index {
    U1Index::new(vec![(0, 1), (1, 1)], Direction::Out)
}

const ISOMETRY_TOL: f64 = 1e-12;

fn gram_is_identity<S: Scalar>(gram: &BlockTensor<S>, bond_dim: usize) -> bool {
    let mut covered = 0;
    for (key, block) in gram.blocks() {
        let diag = key[0] == key[1];
        for (idx, &v) in block.indexed_iter() {
            let expect = if diag && idx[0] == idx[1] { 1.0 } else { 0.0 };
            if (v - S::from_real(expect)).abs() > ISOMETRY_TOL {
                return false;
            }
        }
        if diag {
            covered += block.shape()[0];
        }
    }
    // every bond slot must carry weight, or an SVD would trim it
    covered == bond_dim
}

/// Whether a rank-3 site tensor is an exact left isometry over its first two
/// axes.
#[must_use]
pub fn is_left_isometry<S: Scalar>(t: &BlockTensor<S>) -> bool {
    let gram = contract(&t.dag(), t, &[0, 1], &[0, 1]);
    gram_is_identity(&gram, t.index(2).dim())
}

/// Whether a rank-3 site tensor is an exact right isometry over its last two
/// axes.
#[must_use]
pub fn is_right_isometry<S: Scalar>(t: &BlockTensor<S>) -> bool {
    let gram = contract(&t.dag(), t, &[1, 2], &[1, 2]);
    gram_is_identity(&gram, t.index(0).dim())
}

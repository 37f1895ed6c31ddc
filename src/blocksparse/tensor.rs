use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::Scalar;

use super::index::U1Index;

/// A block-sparse tensor with one [`U1Index`] per axis.
///
/// Blocks are keyed by their per-axis sector positions; a block may be stored
/// only if it satisfies the selection rule
/// `Σ_ax sign(dir_ax) · charge_ax == div`. Absent blocks are zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTensor<S: Scalar> {
    indices: Vec<U1Index>,
    div: i64,
    blocks: FxHashMap<Vec<usize>, ArrayD<S>>,
}

impl<S: Scalar> BlockTensor<S> {
    /// Creates an all-zero tensor (no stored blocks).
    #[must_use]
    pub fn new(indices: Vec<U1Index>, div: i64) -> Self {
        Self {
            indices,
            div,
            blocks: FxHashMap::default(),
        }
    }

    /// Fills every charge-allowed block with uniform random entries.
    pub fn random<R: Rng>(indices: Vec<U1Index>, div: i64, rng: &mut R) -> Self {
        let mut t = Self::new(indices, div);
        for key in t.all_keys() {
            if t.charge_of(&key) == div {
                let shape = t.block_shape(&key);
                let block = ArrayD::from_shape_fn(IxDyn(&shape), |_| S::rand(rng));
                t.blocks.insert(key, block);
            }
        }
        t
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn index(&self, ax: usize) -> &U1Index {
        &self.indices[ax]
    }

    #[must_use]
    pub fn indices(&self) -> &[U1Index] {
        &self.indices
    }

    #[must_use]
    pub fn div(&self) -> i64 {
        self.div
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.indices.iter().map(U1Index::dim).collect()
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&Vec<usize>, &ArrayD<S>)> {
        self.blocks.iter()
    }

    /// Net charge of a sector combination under the selection rule.
    #[must_use]
    pub fn charge_of(&self, key: &[usize]) -> i64 {
        self.indices
            .iter()
            .zip(key)
            .map(|(idx, &s)| idx.dir().sign() * idx.sector_charge(s))
            .sum()
    }

    #[must_use]
    pub fn block_shape(&self, key: &[usize]) -> Vec<usize> {
        self.indices
            .iter()
            .zip(key)
            .map(|(idx, &s)| idx.sector_dim(s))
            .collect()
    }

    #[must_use]
    pub fn block(&self, key: &[usize]) -> Option<&ArrayD<S>> {
        self.blocks.get(key)
    }

    pub fn insert_block(&mut self, key: Vec<usize>, data: ArrayD<S>) {
        assert_eq!(
            self.charge_of(&key),
            self.div,
            "block {key:?} violates the charge selection rule"
        );
        assert_eq!(data.shape(), self.block_shape(&key).as_slice());
        self.blocks.insert(key, data);
    }

    /// Adds `data` into the block at `key`, creating it when absent.
    pub fn accumulate_block(&mut self, key: Vec<usize>, data: ArrayD<S>) {
        debug_assert_eq!(self.charge_of(&key), self.div);
        match self.blocks.get_mut(&key) {
            Some(block) => *block = block.clone() + data,
            None => {
                self.blocks.insert(key, data);
            }
        }
    }

    /// Writes one element addressed by flattened per-axis coordinates.
    /// Intended for construction of small operators and boundary tensors.
    pub fn set(&mut self, coords: &[usize], value: S) {
        assert_eq!(coords.len(), self.rank());
        let mut key = Vec::with_capacity(self.rank());
        let mut inner = Vec::with_capacity(self.rank());
        for (idx, &c) in self.indices.iter().zip(coords) {
            let (s, off) = idx.locate(c);
            key.push(s);
            inner.push(off);
        }
        assert_eq!(
            self.charge_of(&key),
            self.div,
            "element {coords:?} violates the charge selection rule"
        );
        let shape = self.block_shape(&key);
        let block = self
            .blocks
            .entry(key)
            .or_insert_with(|| ArrayD::zeros(IxDyn(&shape)));
        block[IxDyn(&inner)] = value;
    }

    #[must_use]
    pub fn get(&self, coords: &[usize]) -> S {
        let mut key = Vec::with_capacity(self.rank());
        let mut inner = Vec::with_capacity(self.rank());
        for (idx, &c) in self.indices.iter().zip(coords) {
            let (s, off) = idx.locate(c);
            key.push(s);
            inner.push(off);
        }
        self.blocks
            .get(&key)
            .map_or_else(S::zero, |b| b[IxDyn(&inner)])
    }

    /// Materializes the tensor densely. Test and cross-check use only.
    #[must_use]
    pub fn to_dense(&self) -> ArrayD<S> {
        let mut dense = ArrayD::zeros(IxDyn(&self.shape()));
        for (key, block) in &self.blocks {
            let offsets: Vec<usize> = self
                .indices
                .iter()
                .zip(key)
                .map(|(idx, &s)| idx.sector_offset(s))
                .collect();
            for (inner, &v) in block.indexed_iter() {
                let coords: Vec<usize> = offsets
                    .iter()
                    .zip(inner.slice())
                    .map(|(o, i)| o + i)
                    .collect();
                dense[IxDyn(&coords)] = v;
            }
        }
        dense
    }

    /// Hermitian adjoint: conjugate elements, reverse every index direction,
    /// negate the divergence. Block keys are unchanged.
    #[must_use]
    pub fn dag(&self) -> Self {
        let indices = self.indices.iter().map(U1Index::inverse).collect();
        let blocks = self
            .blocks
            .iter()
            .map(|(k, b)| (k.clone(), b.mapv(|v| v.conj())))
            .collect();
        Self {
            indices,
            div: -self.div,
            blocks,
        }
    }

    /// Permutes axes so that new axis `i` is old axis `perm[i]`.
    pub fn transpose(&mut self, perm: &[usize]) {
        assert_eq!(perm.len(), self.rank());
        self.indices = perm.iter().map(|&p| self.indices[p].clone()).collect();
        let blocks = std::mem::take(&mut self.blocks);
        self.blocks = blocks
            .into_iter()
            .map(|(key, block)| {
                let new_key: Vec<usize> = perm.iter().map(|&p| key[p]).collect();
                (new_key, block.permuted_axes(IxDyn(perm)))
            })
            .collect();
    }

    /// Fuses axes `ax` and `ax + 1` into a single index at position `ax`.
    #[must_use]
    pub fn fuse_axes(&self, ax: usize) -> Self {
        assert!(ax + 1 < self.rank());
        let fused = self.indices[ax].fuse(&self.indices[ax + 1]);
        let n2 = self.indices[ax + 1].sector_count();
        let mut indices = Vec::with_capacity(self.rank() - 1);
        indices.extend_from_slice(&self.indices[..ax]);
        indices.push(fused);
        indices.extend_from_slice(&self.indices[ax + 2..]);
        let mut out = Self::new(indices, self.div);
        for (key, block) in &self.blocks {
            let mut new_key = Vec::with_capacity(key.len() - 1);
            new_key.extend_from_slice(&key[..ax]);
            new_key.push(key[ax] * n2 + key[ax + 1]);
            new_key.extend_from_slice(&key[ax + 2..]);
            let mut new_shape: Vec<usize> = block.shape().to_vec();
            let merged = new_shape[ax] * new_shape[ax + 1];
            new_shape.remove(ax + 1);
            new_shape[ax] = merged;
            let data = block
                .as_standard_layout()
                .into_owned()
                .into_shape(IxDyn(&new_shape))
                .expect("fused block reshape");
            out.blocks.insert(new_key, data);
        }
        out
    }

    /// Sector-wise direct sum along `axis`: the result's `axis` index is the
    /// concatenation of both operands' indices there; all other axes must
    /// match. This is the additive enlargement used by subspace expansion;
    /// the content of `self` is preserved exactly.
    #[must_use]
    pub fn expand(&self, other: &Self, axis: usize) -> Self {
        assert_eq!(self.rank(), other.rank());
        assert_eq!(self.div, other.div, "direct sum requires equal divergence");
        for ax in 0..self.rank() {
            if ax != axis {
                assert_eq!(
                    self.indices[ax], other.indices[ax],
                    "direct sum operands differ on axis {ax}"
                );
            }
        }
        let offset = self.indices[axis].sector_count();
        let mut indices = self.indices.clone();
        indices[axis] = self.indices[axis].concat(&other.indices[axis]);
        let mut out = Self::new(indices, self.div);
        for (key, block) in &self.blocks {
            out.blocks.insert(key.clone(), block.clone());
        }
        for (key, block) in &other.blocks {
            let mut new_key = key.clone();
            new_key[axis] += offset;
            out.blocks.insert(new_key, block.clone());
        }
        out
    }

    pub fn scale(&mut self, alpha: S) {
        for block in self.blocks.values_mut() {
            block.mapv_inplace(|v| v * alpha);
        }
    }

    /// `self += alpha * other`; both tensors must share indices and div.
    pub fn scaled_add(&mut self, alpha: S, other: &Self) {
        assert_eq!(self.indices, other.indices);
        assert_eq!(self.div, other.div);
        for (key, block) in &other.blocks {
            match self.blocks.get_mut(key) {
                Some(mine) => mine.zip_mut_with(block, |a, &b| *a = *a + b * alpha),
                None => {
                    self.blocks.insert(key.clone(), block.mapv(|v| v * alpha));
                }
            }
        }
    }

    /// Inner product `⟨self|other⟩` (conjugating `self`).
    #[must_use]
    pub fn dot(&self, other: &Self) -> S {
        debug_assert_eq!(self.indices, other.indices);
        let mut acc = S::zero();
        for (key, block) in &self.blocks {
            if let Some(b) = other.blocks.get(key) {
                for (x, y) in block.iter().zip(b.iter()) {
                    acc = acc + x.conj() * *y;
                }
            }
        }
        acc
    }

    #[must_use]
    pub fn norm(&self) -> f64 {
        self.dot(self).re().sqrt()
    }

    /// Frobenius distance to `other`. Test helper.
    #[must_use]
    pub fn distance(&self, other: &Self) -> f64 {
        let mut diff = self.clone();
        diff.scaled_add(S::from_real(-1.0), other);
        diff.norm()
    }

    pub(crate) fn all_keys(&self) -> Vec<Vec<usize>> {
        let mut keys = vec![Vec::new()];
        for idx in &self.indices {
            let mut next = Vec::with_capacity(keys.len() * idx.sector_count());
            for key in &keys {
                for s in 0..idx.sector_count() {
                    let mut k = key.clone();
                    k.push(s);
                    next.push(k);
                }
            }
            keys = next;
        }
        keys
    }
}

/// The rank-3 combiner tensor `C[idx0, idx1, fused⁻¹]` whose blocks are
/// reshaped identities: contracting a tensor with `C` over `(idx0, idx1)`
/// fuses those axes, and `C` itself acts as the SVD-free replacement site
/// tensor in the boundary basis change.
#[must_use]
pub fn index_combiner<S: Scalar>(idx0: &U1Index, idx1: &U1Index) -> BlockTensor<S> {
    let fused = idx0.fuse(idx1);
    let n1 = idx1.sector_count();
    let mut c = BlockTensor::new(vec![idx0.clone(), idx1.clone(), fused.inverse()], 0);
    for s0 in 0..idx0.sector_count() {
        for s1 in 0..n1 {
            let d0 = idx0.sector_dim(s0);
            let d1 = idx1.sector_dim(s1);
            let mut block = ArrayD::<S>::zeros(IxDyn(&[d0, d1, d0 * d1]));
            for a in 0..d0 {
                for b in 0..d1 {
                    block[IxDyn(&[a, b, a * d1 + b])] = S::one();
                }
            }
            c.insert_block(vec![s0, s1, s0 * n1 + s1], block);
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::blocksparse::index::Direction;

    fn sample_index() -> U1Index {
        U1Index::new(vec![(0, 2), (1, 1)], Direction::Out)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let idx_in = sample_index().inverse();
        let idx_out = sample_index();
        let mut t = BlockTensor::<f64>::new(vec![idx_in, idx_out], 0);
        t.set(&[0, 1], 2.5);
        t.set(&[2, 2], -1.0);
        assert_eq!(t.get(&[0, 1]), 2.5);
        assert_eq!(t.get(&[2, 2]), -1.0);
        assert_eq!(t.get(&[1, 0]), 0.0);
        assert_eq!(t.num_blocks(), 2);
    }

    #[test]
    #[should_panic(expected = "selection rule")]
    fn test_set_forbidden_element_panics() {
        let mut t =
            BlockTensor::<f64>::new(vec![sample_index().inverse(), sample_index()], 0);
        // charge -1 on the In axis, 0 on the Out axis: net -(1) + 0 != 0
        t.set(&[2, 0], 1.0);
    }

    #[test]
    fn test_dag_flips_directions_and_div() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = BlockTensor::<f64>::random(
            vec![sample_index().inverse(), sample_index()],
            0,
            &mut rng,
        );
        let d = t.dag();
        assert_eq!(d.index(0).dir(), Direction::Out);
        assert_eq!(d.index(1).dir(), Direction::In);
        assert_eq!(d.div(), 0);
        assert_eq!(d.num_blocks(), t.num_blocks());
    }

    #[test]
    fn test_transpose_matches_dense() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = U1Index::new(vec![(0, 2), (1, 2)], Direction::In);
        let b = U1Index::new(vec![(0, 1), (1, 2)], Direction::Out);
        let c = U1Index::new(vec![(0, 2), (1, 1)], Direction::Out);
        let mut t = BlockTensor::<f64>::random(vec![a, b, c], 0, &mut rng);
        let dense = t.to_dense();
        t.transpose(&[2, 0, 1]);
        let transposed = t.to_dense();
        for ((i, j, k), &v) in dense
            .view()
            .into_dimensionality::<ndarray::Ix3>()
            .unwrap()
            .indexed_iter()
        {
            assert_eq!(transposed[[k, i, j]], v);
        }
    }

    #[test]
    fn test_fuse_axes_preserves_content() {
        let mut rng = StdRng::seed_from_u64(11);
        let a = U1Index::new(vec![(0, 1), (1, 2)], Direction::Out);
        let b = U1Index::new(vec![(0, 2), (2, 1)], Direction::Out);
        let c = U1Index::new(vec![(-3, 1), (-1, 2), (0, 1), (-2, 3)], Direction::Out);
        let t = BlockTensor::<f64>::random(vec![a.clone(), b.clone(), c], 0, &mut rng);
        let fused = t.fuse_axes(0);
        assert_eq!(fused.rank(), 2);
        assert_eq!(fused.index(0).dim(), a.dim() * b.dim());
        assert!((fused.norm() - t.norm()).abs() < 1e-14);
    }

    #[test]
    fn test_expand_direct_sum() {
        let mut rng = StdRng::seed_from_u64(19);
        let shared = U1Index::new(vec![(0, 2)], Direction::In);
        let bond_a = U1Index::new(vec![(0, 2)], Direction::Out);
        let bond_b = U1Index::new(vec![(0, 1), (1, 1)], Direction::Out);
        let t = BlockTensor::<f64>::random(vec![shared.clone(), bond_a.clone()], 0, &mut rng);
        let u = BlockTensor::<f64>::random(vec![shared, bond_b], 0, &mut rng);
        let e = t.expand(&u, 1);
        assert_eq!(e.index(1).dim(), 4);
        // original content preserved in the leading slots
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(e.get(&[i, j]), t.get(&[i, j]));
            }
            assert_eq!(e.get(&[i, 2]), u.get(&[i, 0]));
        }
    }

    #[test]
    fn test_dot_and_scaled_add() {
        let mut rng = StdRng::seed_from_u64(23);
        let idx = vec![sample_index().inverse(), sample_index()];
        let t = BlockTensor::<f64>::random(idx.clone(), 0, &mut rng);
        let mut u = t.clone();
        u.scaled_add(-1.0, &t);
        assert!(u.norm() < 1e-15);
        let n2 = t.dot(&t);
        assert!((n2 - t.norm() * t.norm()).abs() < 1e-12);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut rng = StdRng::seed_from_u64(29);
        let t = BlockTensor::<f64>::random(
            vec![sample_index().inverse(), sample_index()],
            0,
            &mut rng,
        );
        let bytes = bincode::serialize(&t).unwrap();
        let back: BlockTensor<f64> = bincode::deserialize(&bytes).unwrap();
        assert!(t.distance(&back) < 1e-15);
    }
}

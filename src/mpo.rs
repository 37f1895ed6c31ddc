//! Matrix product operators.
//!
//! MPO site tensors are rank-4 with axis signature `[left mpo bond (In),
//! physical in (In), physical out (Out), right mpo bond (Out)]` and zero
//! divergence. Hamiltonians are written directly in this form; the
//! finite-state-machine compression front-end stays outside this crate.

use std::ops::Index;

use crate::blocksparse::{BlockTensor, Direction, U1Index};
use crate::mps::occupation_phys_index;
use crate::types::{Scalar, SiteIndex};

/// An immutable ordered sequence of MPO site tensors.
#[derive(Debug, Clone)]
pub struct Mpo<S: Scalar> {
    tens: Vec<BlockTensor<S>>,
}

impl<S: Scalar> Mpo<S> {
    #[must_use]
    pub fn new(tens: Vec<BlockTensor<S>>) -> Self {
        assert!(!tens.is_empty());
        Self { tens }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tens.is_empty()
    }

    /// Builds the MPO of a translation-invariant nearest-neighbor Hamiltonian
    /// `H = Σ_i Σ_t a_t(i) b_t(i+1) + Σ_i c(i)` from its virtual-state
    /// automaton: state 0 has placed nothing, one state per two-site term has
    /// placed its opening operator, the final state has placed everything.
    ///
    /// Operators are rank-2 `[phys (Out), phys (In)]` tensors; the virtual
    /// state of a term carries the opposite of its opening operator's charge,
    /// so charged operator pairs (ladder operators) are supported. On-site
    /// operators must be charge-neutral.
    #[must_use]
    pub fn nearest_neighbor(
        n: usize,
        phys: &U1Index,
        terms: &[(BlockTensor<S>, BlockTensor<S>)],
        onsite: Option<&BlockTensor<S>>,
    ) -> Self {
        assert!(n >= 2);
        let fin = terms.len() + 1;
        if let Some(c) = onsite {
            assert_eq!(c.div(), 0, "on-site operators must be charge-neutral");
        }
        let mut sectors = vec![(0, 1)];
        sectors.extend(terms.iter().map(|(a, _)| (-a.div(), 1)));
        sectors.push((0, 1));
        let wbond = U1Index::new(sectors, Direction::Out);
        let trivial_in = U1Index::trivial(Direction::In);
        let trivial_out = U1Index::trivial(Direction::Out);
        let d = phys.dim();

        let mut tens = Vec::with_capacity(n);
        for site in 0..n {
            let (lbond, rbond, rows, cols): (U1Index, U1Index, Vec<usize>, Vec<usize>) =
                if site == 0 {
                    (trivial_in.clone(), wbond.clone(), vec![0], (0..=fin).collect())
                } else if site == n - 1 {
                    (wbond.inverse(), trivial_out.clone(), (0..=fin).collect(), vec![fin])
                } else {
                    (wbond.inverse(), wbond.clone(), (0..=fin).collect(), (0..=fin).collect())
                };
            let mut w = BlockTensor::new(
                vec![lbond, phys.inverse(), phys.clone(), rbond],
                0,
            );
            let put = |w: &mut BlockTensor<S>, row: usize, col: usize, op: &BlockTensor<S>| {
                let (Some(r), Some(c)) = (
                    rows.iter().position(|&x| x == row),
                    cols.iter().position(|&x| x == col),
                ) else {
                    return;
                };
                for out in 0..d {
                    for inn in 0..d {
                        let v = op.get(&[out, inn]);
                        if v != S::zero() {
                            w.set(&[r, inn, out, c], v);
                        }
                    }
                }
            };
            let identity = one_site_identity(phys);
            put(&mut w, 0, 0, &identity);
            put(&mut w, fin, fin, &identity);
            for (t, (a, b)) in terms.iter().enumerate() {
                put(&mut w, 0, t + 1, a);
                put(&mut w, t + 1, fin, b);
            }
            if let Some(c) = onsite {
                put(&mut w, 0, fin, c);
            }
            tens.push(w);
        }
        Self::new(tens)
    }

    /// Open spinless-fermion hopping chain
    /// `H = -t Σ_i (c†_i c_{i+1} + c†_{i+1} c_i)`
    /// with conserved total particle number. Nearest-neighbor hopping maps
    /// onto ladder operators without a Jordan-Wigner string.
    #[must_use]
    pub fn spinless_fermion_chain(n: usize, t: f64) -> Self {
        let phys = occupation_phys_index();
        let mut create = BlockTensor::new(vec![phys.clone(), phys.inverse()], 1);
        create.set(&[1, 0], S::one());
        let mut annihilate = BlockTensor::new(vec![phys.clone(), phys.inverse()], -1);
        annihilate.set(&[0, 1], S::one());
        let mut hop_close_l = annihilate.clone();
        hop_close_l.scale(S::from_real(-t));
        let mut hop_close_r = create.clone();
        hop_close_r.scale(S::from_real(-t));
        Self::nearest_neighbor(
            n,
            &phys,
            &[(create, hop_close_l), (annihilate, hop_close_r)],
            None,
        )
    }
}

fn one_site_identity<S: Scalar>(phys: &U1Index) -> BlockTensor<S> {
    let mut id = BlockTensor::new(vec![phys.clone(), phys.inverse()], 0);
    for i in 0..phys.dim() {
        id.set(&[i, i], S::one());
    }
    id
}

impl<S: Scalar> Index<SiteIndex> for Mpo<S> {
    type Output = BlockTensor<S>;

    fn index(&self, site: SiteIndex) -> &Self::Output {
        &self.tens[site]
    }
}

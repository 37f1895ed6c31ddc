//! Expectation-value measurements on a materialized MPS. Diagnostic,
//! master-side machinery: observables never feed back into the sweeps.

use crate::blocksparse::{contract, BlockTensor, U1Index};
use crate::types::Scalar;

use crate::mps::FiniteMps;

/// Builds a rank-2 single-site operator `[phys (Out), phys (In)]` from its
/// dense matrix elements `elems[(out, in)]`.
#[must_use]
pub fn one_site_op<S: Scalar>(phys: &U1Index, elems: &[(usize, usize, S)]) -> BlockTensor<S> {
    let mut op = BlockTensor::new(vec![phys.clone(), phys.inverse()], 0);
    for &(row, col, v) in elems {
        op.set(&[row, col], v);
    }
    op
}

/// Expectation value of `op` at every site. The MPS must be fully
/// materialized; it is re-centralized in place while walking the chain.
#[must_use]
pub fn measure_one_site_op<S: Scalar>(
    mps: &mut FiniteMps<S>,
    op: &BlockTensor<S>,
) -> Vec<S> {
    let n = mps.len();
    let mut res = Vec::with_capacity(n);
    mps.centralize(0);
    for i in 0..n {
        if i > 0 {
            mps.left_canonicalize_ten(i - 1);
        }
        let a = mps.get(i);
        let mut oa = contract(op, a, &[1], &[1]);
        oa.transpose(&[1, 0, 2]);
        let norm2 = a.dot(a);
        res.push(a.dot(&oa) * (S::one() / norm2));
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mps::occupation_phys_index;

    fn number_op() -> BlockTensor<f64> {
        one_site_op(&occupation_phys_index(), &[(1, 1, 1.0)])
    }

    #[test]
    fn test_occupation_of_product_state() {
        let phys = occupation_phys_index();
        let occs = [1, 0, 1, 1, 0];
        let mut mps = FiniteMps::<f64>::product_state(&phys, &occs);
        let n = measure_one_site_op(&mut mps, &number_op());
        for (i, &occ) in occs.iter().enumerate() {
            assert!((n[i] - occ as f64).abs() < 1e-13, "site {i}: {}", n[i]);
        }
    }

    #[test]
    fn test_total_number_is_conserved_by_canonicalization() {
        let phys = occupation_phys_index();
        let mut mps = FiniteMps::<f64>::product_state(&phys, &[0, 1, 1, 0]);
        mps.centralize(2);
        let n = measure_one_site_op(&mut mps, &number_op());
        let total: f64 = n.iter().sum();
        assert!((total - 2.0).abs() < 1e-12);
    }
}

use ndarray::{ArrayD, Ix2, IxDyn};
use rustc_hash::FxHashMap;

use crate::types::Scalar;

use super::tensor::BlockTensor;

/// Dense tensordot over the given axis pairs (permute, flatten, matrix
/// multiply, unflatten).
pub(crate) fn tensordot<S: Scalar>(
    a: &ArrayD<S>,
    b: &ArrayD<S>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> ArrayD<S> {
    let free_a: Vec<usize> = (0..a.ndim()).filter(|ax| !axes_a.contains(ax)).collect();
    let free_b: Vec<usize> = (0..b.ndim()).filter(|ax| !axes_b.contains(ax)).collect();

    let m: usize = free_a.iter().map(|&ax| a.shape()[ax]).product();
    let k: usize = axes_a.iter().map(|&ax| a.shape()[ax]).product();
    let n: usize = free_b.iter().map(|&ax| b.shape()[ax]).product();

    let mut perm_a = free_a.clone();
    perm_a.extend_from_slice(axes_a);
    let mut perm_b = axes_b.to_vec();
    perm_b.extend_from_slice(&free_b);

    let a2 = a
        .view()
        .permuted_axes(IxDyn(&perm_a))
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&[m, k]))
        .expect("tensordot lhs reshape")
        .into_dimensionality::<Ix2>()
        .unwrap();
    let b2 = b
        .view()
        .permuted_axes(IxDyn(&perm_b))
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&[k, n]))
        .expect("tensordot rhs reshape")
        .into_dimensionality::<Ix2>()
        .unwrap();

    let mut out_shape: Vec<usize> = free_a.iter().map(|&ax| a.shape()[ax]).collect();
    out_shape.extend(free_b.iter().map(|&ax| b.shape()[ax]));
    a2.dot(&b2)
        .into_shape(IxDyn(&out_shape))
        .expect("tensordot result reshape")
}

fn contract_impl<S: Scalar>(
    a: &BlockTensor<S>,
    b: &BlockTensor<S>,
    axes_a: &[usize],
    axes_b: &[usize],
    filter: Option<(usize, usize)>,
) -> BlockTensor<S> {
    assert_eq!(axes_a.len(), axes_b.len());
    for (&ax, &bx) in axes_a.iter().zip(axes_b) {
        assert_eq!(
            *a.index(ax),
            b.index(bx).inverse(),
            "contracted axes {ax}/{bx} carry incompatible indices"
        );
    }

    let free_a: Vec<usize> = (0..a.rank()).filter(|ax| !axes_a.contains(ax)).collect();
    let free_b: Vec<usize> = (0..b.rank()).filter(|ax| !axes_b.contains(ax)).collect();

    let mut indices = Vec::with_capacity(free_a.len() + free_b.len());
    indices.extend(free_a.iter().map(|&ax| a.index(ax).clone()));
    indices.extend(free_b.iter().map(|&ax| b.index(ax).clone()));
    let mut out = BlockTensor::new(indices, a.div() + b.div());

    // Group the rhs blocks by their contracted sector combination.
    let mut by_ckey: FxHashMap<Vec<usize>, Vec<&Vec<usize>>> = FxHashMap::default();
    for (key, _) in b.blocks() {
        let ckey: Vec<usize> = axes_b.iter().map(|&ax| key[ax]).collect();
        by_ckey.entry(ckey).or_default().push(key);
    }

    for (akey, ablock) in a.blocks() {
        if let Some((split_ax, sector)) = filter {
            if akey[split_ax] != sector {
                continue;
            }
        }
        let ckey: Vec<usize> = axes_a.iter().map(|&ax| akey[ax]).collect();
        let Some(bkeys) = by_ckey.get(&ckey) else {
            continue;
        };
        for bkey in bkeys {
            let bblock = b.block(bkey).unwrap();
            let mut out_key: Vec<usize> = free_a.iter().map(|&ax| akey[ax]).collect();
            out_key.extend(free_b.iter().map(|&ax| bkey[ax]));
            let data = tensordot(ablock, bblock, axes_a, axes_b);
            out.accumulate_block(out_key, data);
        }
    }
    out
}

/// Contracts `a` and `b` over the paired axes. The paired indices must agree
/// sector-by-sector and point in opposite directions; the result carries the
/// free axes of `a` followed by the free axes of `b`.
#[must_use]
pub fn contract<S: Scalar>(
    a: &BlockTensor<S>,
    b: &BlockTensor<S>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> BlockTensor<S> {
    contract_impl(a, b, axes_a, axes_b, None)
}

/// Like [`contract`], but restricted to the blocks of `a` whose sector on
/// `split_ax` equals `sector`. When `split_ax` is a free axis of `a`, the
/// results over distinct sectors are disjoint slices of the full contraction,
/// which is what makes this the distributed task primitive.
#[must_use]
pub fn contract_sector<S: Scalar>(
    a: &BlockTensor<S>,
    split_ax: usize,
    sector: usize,
    b: &BlockTensor<S>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> BlockTensor<S> {
    contract_impl(a, b, axes_a, axes_b, Some((split_ax, sector)))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::blocksparse::index::{Direction, U1Index};

    fn idx(sectors: &[(i64, usize)], dir: Direction) -> U1Index {
        U1Index::new(sectors.to_vec(), dir)
    }

    #[test]
    fn test_contract_matches_dense() {
        let mut rng = StdRng::seed_from_u64(5);
        let bond = idx(&[(0, 2), (1, 3)], Direction::Out);
        let phys = idx(&[(0, 1), (1, 1)], Direction::Out);
        let a = BlockTensor::<f64>::random(
            vec![bond.inverse(), phys.clone(), bond.clone()],
            0,
            &mut rng,
        );
        let b = BlockTensor::<f64>::random(
            vec![bond.inverse(), phys.clone(), bond.clone()],
            0,
            &mut rng,
        );

        let c = contract(&a, &b, &[2], &[0]);
        let dense_ref = tensordot(&a.to_dense(), &b.to_dense(), &[2], &[0]);
        let diff = &c.to_dense() - &dense_ref;
        let err = diff.iter().map(|v| v.abs()).fold(0.0f64, f64::max);
        assert!(err < 1e-13, "block contraction deviates from dense: {err}");
    }

    #[test]
    fn test_contract_multi_axis_matches_dense() {
        let mut rng = StdRng::seed_from_u64(17);
        let bond = idx(&[(0, 2), (1, 2), (2, 1)], Direction::Out);
        let phys = idx(&[(0, 1), (1, 1)], Direction::Out);
        let a = BlockTensor::<f64>::random(
            vec![bond.inverse(), phys.clone(), bond.clone()],
            0,
            &mut rng,
        );
        let adag = a.dag();
        // ⟨a|a⟩ through full contraction equals the Frobenius norm squared
        let s = contract(&adag, &a, &[0, 1, 2], &[0, 1, 2]);
        let val = s.get(&[]);
        assert!((val - a.norm() * a.norm()).abs() < 1e-12);
    }

    #[test]
    fn test_sector_slices_recompose_full_result() {
        let mut rng = StdRng::seed_from_u64(41);
        let bond = idx(&[(0, 2), (1, 2), (2, 2)], Direction::Out);
        let phys = idx(&[(0, 1), (1, 1)], Direction::Out);
        let a = BlockTensor::<f64>::random(
            vec![bond.inverse(), phys.clone(), bond.clone()],
            0,
            &mut rng,
        );
        let b = BlockTensor::<f64>::random(
            vec![bond.inverse(), phys, bond.clone()],
            0,
            &mut rng,
        );

        let full = contract(&a, &b, &[2], &[0]);
        // split on a free axis of `a`: slices must be disjoint and sum to full
        let split_ax = 0;
        let mut acc: Option<BlockTensor<f64>> = None;
        for sector in 0..a.index(split_ax).sector_count() {
            let slice = contract_sector(&a, split_ax, sector, &b, &[2], &[0]);
            acc = Some(match acc {
                None => slice,
                Some(mut t) => {
                    t.scaled_add(1.0, &slice);
                    t
                }
            });
        }
        assert!(acc.unwrap().distance(&full) < 1e-13);
    }

    #[test]
    #[should_panic(expected = "incompatible indices")]
    fn test_contract_incompatible_indices_panics() {
        let mut rng = StdRng::seed_from_u64(2);
        let bond = idx(&[(0, 2)], Direction::Out);
        let other = idx(&[(0, 3)], Direction::In);
        let a = BlockTensor::<f64>::random(vec![bond.clone(), bond.inverse()], 0, &mut rng);
        let b = BlockTensor::<f64>::random(vec![other.clone(), other.inverse()], 0, &mut rng);
        let _ = contract(&a, &b, &[1], &[0]);
    }
}

use serde::{Deserialize, Serialize};

/// Orientation of a tensor axis with respect to the charge flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Sign with which a sector charge on this axis enters the selection rule.
    #[must_use]
    pub fn sign(self) -> i64 {
        match self {
            Direction::In => -1,
            Direction::Out => 1,
        }
    }

    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

/// A U(1)-graded tensor index: an ordered list of `(charge, degeneracy)`
/// sectors plus a direction.
///
/// Sector order is significant; two indices are contractible exactly when
/// their sector lists agree element-wise and their directions are opposite.
/// Charges may repeat across sectors (fused indices produce such lists).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct U1Index {
    sectors: Vec<(i64, usize)>,
    dir: Direction,
}

impl U1Index {
    #[must_use]
    pub fn new(sectors: Vec<(i64, usize)>, dir: Direction) -> Self {
        assert!(!sectors.is_empty(), "index must have at least one sector");
        assert!(sectors.iter().all(|&(_, d)| d > 0));
        Self { sectors, dir }
    }

    /// The dimension-one, charge-zero index used at chain boundaries.
    #[must_use]
    pub fn trivial(dir: Direction) -> Self {
        Self::new(vec![(0, 1)], dir)
    }

    #[must_use]
    pub fn dir(&self) -> Direction {
        self.dir
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.sectors.iter().map(|&(_, d)| d).sum()
    }

    #[must_use]
    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    #[must_use]
    pub fn sector_charge(&self, sector: usize) -> i64 {
        self.sectors[sector].0
    }

    #[must_use]
    pub fn sector_dim(&self, sector: usize) -> usize {
        self.sectors[sector].1
    }

    #[must_use]
    pub fn sectors(&self) -> &[(i64, usize)] {
        &self.sectors
    }

    /// Offset of a sector's first slot within the flattened index range.
    #[must_use]
    pub fn sector_offset(&self, sector: usize) -> usize {
        self.sectors[..sector].iter().map(|&(_, d)| d).sum()
    }

    /// Maps a flattened coordinate to `(sector, offset_within_sector)`.
    #[must_use]
    pub fn locate(&self, coord: usize) -> (usize, usize) {
        let mut rest = coord;
        for (s, &(_, d)) in self.sectors.iter().enumerate() {
            if rest < d {
                return (s, rest);
            }
            rest -= d;
        }
        panic!("coordinate {coord} out of range for index of dim {}", self.dim());
    }

    /// The same index seen from the other side of a bond.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            sectors: self.sectors.clone(),
            dir: self.dir.reversed(),
        }
    }

    /// Fuses `self` with `other` into a single index carrying the direction of
    /// `self`. Sector order is `self`-major; charges combine with the sign
    /// ratio of the two directions.
    #[must_use]
    pub fn fuse(&self, other: &U1Index) -> Self {
        let ratio = self.dir.sign() * other.dir.sign();
        let mut sectors = Vec::with_capacity(self.sector_count() * other.sector_count());
        for &(q1, d1) in &self.sectors {
            for &(q2, d2) in &other.sectors {
                sectors.push((q1 + ratio * q2, d1 * d2));
            }
        }
        Self::new(sectors, self.dir)
    }

    /// Concatenates the sectors of `other` after those of `self`. Used by the
    /// additive subspace expansion; both indices must share a direction.
    #[must_use]
    pub fn concat(&self, other: &U1Index) -> Self {
        assert_eq!(self.dir, other.dir, "cannot concatenate opposing indices");
        let mut sectors = self.sectors.clone();
        sectors.extend_from_slice(&other.sectors);
        Self::new(sectors, self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_roundtrip() {
        let idx = U1Index::new(vec![(0, 2), (1, 3), (2, 1)], Direction::Out);
        assert_eq!(idx.dim(), 6);
        assert_eq!(idx.locate(0), (0, 0));
        assert_eq!(idx.locate(1), (0, 1));
        assert_eq!(idx.locate(2), (1, 0));
        assert_eq!(idx.locate(4), (1, 2));
        assert_eq!(idx.locate(5), (2, 0));
        assert_eq!(idx.sector_offset(1), 2);
        assert_eq!(idx.sector_offset(2), 5);
    }

    #[test]
    fn test_inverse_is_involution() {
        let idx = U1Index::new(vec![(0, 1), (1, 2)], Direction::In);
        assert_eq!(idx.inverse().inverse(), idx);
        assert_eq!(idx.inverse().dir(), Direction::Out);
    }

    #[test]
    fn test_fuse_same_direction() {
        let a = U1Index::new(vec![(0, 1), (1, 2)], Direction::Out);
        let b = U1Index::new(vec![(0, 3), (2, 1)], Direction::Out);
        let f = a.fuse(&b);
        assert_eq!(f.sectors(), &[(0, 3), (2, 1), (1, 6), (3, 2)]);
        assert_eq!(f.dim(), a.dim() * b.dim());
    }

    #[test]
    fn test_fuse_mixed_direction_subtracts() {
        let a = U1Index::new(vec![(1, 1)], Direction::In);
        let b = U1Index::new(vec![(1, 1)], Direction::Out);
        let f = a.fuse(&b);
        assert_eq!(f.sectors(), &[(0, 1)]);
        assert_eq!(f.dir(), Direction::In);
    }

    #[test]
    fn test_concat() {
        let a = U1Index::new(vec![(0, 2)], Direction::Out);
        let b = U1Index::new(vec![(0, 1), (1, 1)], Direction::Out);
        let c = a.concat(&b);
        assert_eq!(c.sectors(), &[(0, 2), (0, 1), (1, 1)]);
    }
}

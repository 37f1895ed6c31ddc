use serde::{de::DeserializeOwned, Serialize};

/// Zero-based site position within the chain.
pub type SiteIndex = usize;

/// Environment length counted in sites absorbed from a chain boundary.
pub type EnvLen = usize;

/// Quantum-number sector task identifier used by the distributed scheduler.
pub type TaskIndex = usize;

/// Element types the solvers operate on (`f64`, `Complex64`).
///
/// The bound set follows the pattern of the pack's MPS code: LAPACK-backed
/// dense kernels plus serde so tensors can cross the wire and hit disk.
pub trait Scalar:
    ndarray_linalg::Scalar<Real = f64>
    + ndarray_linalg::Lapack
    + ndarray::LinalgScalar
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Scalar for T where
    T: ndarray_linalg::Scalar<Real = f64>
        + ndarray_linalg::Lapack
        + ndarray::LinalgScalar
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

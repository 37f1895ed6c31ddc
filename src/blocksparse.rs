//! U(1)-symmetric block-sparse tensors.
//!
//! Tensors carry one [`U1Index`] per axis; only blocks satisfying the charge
//! selection rule are stored. This module knows nothing about MPS, MPO or
//! sweeps. It only provides contraction, decomposition and index surgery,
//! and is consumed by the rest of the crate through that narrow interface.

pub mod contraction;
pub mod decomp;
pub mod index;
pub mod tensor;

pub use contraction::{contract, contract_sector};
pub use decomp::{svd, svd_trunc, SvdOutcome, SvdTask, TruncationSpec};
pub use index::{Direction, U1Index};
pub use tensor::{index_combiner, BlockTensor};

//! Distributed-memory variational (VMPS/DMRG) and time-dependent (TDVP)
//! matrix product state solvers for 1-D quantum chains with U(1) symmetry.
//!
//! The crate is organized around a master/slave two-site sweep engine: rank
//! 0 orchestrates sweeps, environment bookkeeping and disk I/O of the
//! partially materialized MPS, while worker ranks run an order-driven
//! receive loop serving block-sparse contractions, truncated SVD sectors and
//! Krylov matrix-vector products. The same binary runs in-process over a
//! channel mesh (testing, single-node) or over MPI (feature `mpi`).

pub mod blocksparse;
pub mod comm;
pub mod env;
pub mod expansion;
pub mod io;
pub mod lanczos;
pub mod measure;
pub mod mpo;
pub mod mps;
pub mod sched;
pub mod svd;
pub mod sweep;
pub mod tdvp;
pub mod types;

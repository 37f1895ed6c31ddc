//! Disk layout for partially materialized MPS and environment tensors.
//!
//! One file per MPS site under `mps_path`, one file per `(side, length)`
//! environment under `temp_path`, bincode-encoded. Environment files for
//! interior bonds are single-use: loading one mid-sweep removes it, so at
//! any time exactly one on-disk copy exists per bond outside the
//! materialized window.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::blocksparse::BlockTensor;
use crate::comm::serialization::{deserialize_from, serialize_into};
use crate::types::{EnvLen, Scalar, SiteIndex};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Which chain boundary an environment tensor summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSide {
    Left,
    Right,
}

impl fmt::Display for EnvSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvSide::Left => write!(f, "l"),
            EnvSide::Right => write!(f, "r"),
        }
    }
}

/// File storing the MPS tensor of `site`.
#[must_use]
pub fn mps_ten_path(mps_path: &Path, site: SiteIndex) -> PathBuf {
    mps_path.join(format!("mps_ten{site}.dmps"))
}

/// File storing the environment of `len` absorbed sites on `side`.
#[must_use]
pub fn env_ten_path(temp_path: &Path, side: EnvSide, len: EnvLen) -> PathBuf {
    temp_path.join(format!("{side}env{len}.dmps"))
}

pub fn dump_tensor<S: Scalar>(path: &Path, tensor: &BlockTensor<S>) -> StorageResult<()> {
    let file = File::create(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serialize_into(BufWriter::new(file), tensor);
    Ok(())
}

pub fn load_tensor<S: Scalar>(path: &Path) -> StorageResult<BlockTensor<S>> {
    let file = File::open(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(deserialize_from(BufReader::new(file)))
}

pub fn remove_file(path: &Path) -> StorageResult<()> {
    fs::remove_file(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[must_use]
pub fn is_path_exist(path: &Path) -> bool {
    path.exists()
}

pub fn create_path(path: &Path) -> StorageResult<()> {
    fs::create_dir_all(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

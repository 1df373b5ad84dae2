//! The hash-chained block store
//!
//! A single primary chain holds every committed transaction and
//! attack verdict for the run. Each validator additionally maintains
//! a replica fed by replication messages; replicas validate linkage
//! and flag divergence but never roll anything back.

mod block;
mod replica;
mod store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("system io error: {0}")]
  SystemIO(#[from] std::io::Error),
}

pub use {
  block::{merkle_root, Block, BlockHash, BlockType},
  replica::{ChainReplica, ReplicaError, ReplicaSummary},
  store::{BlockStore, IntegrityReport},
};

use {
  super::{Block, BlockHash},
  crate::primitives::Asn,
  serde::Serialize,
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicaError {
  #[error("expected block {expected}, got {got}")]
  NumberGap { expected: u64, got: u64 },

  #[error("previous hash does not match the local tip")]
  PrevHashMismatch,

  #[error("block hash does not match its header")]
  HashMismatch,
}

/// Final state of one replica, reported in the blockchain snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSummary {
  pub owner: Asn,
  pub height: u64,
  pub valid: bool,
  pub chain_divergence: u64,
}

/// A validator's read-only copy of the chain, fed exclusively by
/// replication messages. Only a block that extends the local tip is
/// accepted; anything else is rejected and counted, never
/// remediated.
#[derive(Debug)]
pub struct ChainReplica {
  owner: Asn,
  blocks: Vec<Block>,
  divergence: u64,
}

impl ChainReplica {
  pub fn new(owner: Asn, genesis: Block) -> Self {
    Self {
      owner,
      blocks: vec![genesis],
      divergence: 0,
    }
  }

  pub fn height(&self) -> u64 {
    self.blocks.last().unwrap().block_number
  }

  pub fn tip_hash(&self) -> BlockHash {
    self.blocks.last().unwrap().block_hash
  }

  pub fn divergence(&self) -> u64 {
    self.divergence
  }

  /// Validates and applies one replicated block against the local
  /// tip.
  pub fn apply_replicated(&mut self, block: Block) -> Result<(), ReplicaError> {
    let result = self.validate(&block);
    match result {
      Ok(()) => {
        self.blocks.push(block);
        Ok(())
      }
      Err(error) => {
        self.divergence += 1;
        debug!(
          "{} replica rejected block {}: {error}",
          self.owner, block.block_number
        );
        Err(error)
      }
    }
  }

  fn validate(&self, block: &Block) -> Result<(), ReplicaError> {
    let expected = self.height() + 1;
    if block.block_number != expected {
      return Err(ReplicaError::NumberGap {
        expected,
        got: block.block_number,
      });
    }
    if block.previous_hash != self.tip_hash() {
      return Err(ReplicaError::PrevHashMismatch);
    }
    if block.expected_hash() != block.block_hash {
      return Err(ReplicaError::HashMismatch);
    }
    Ok(())
  }

  pub fn summary(&self) -> ReplicaSummary {
    ReplicaSummary {
      owner: self.owner,
      height: self.height(),
      valid: self.divergence == 0,
      chain_divergence: self.divergence,
    }
  }
}

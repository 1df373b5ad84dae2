//! Knowledge-based BFT consensus over route observations: the
//! Proof of Population engine and the secondary attack-verdict
//! protocol layered on top of it.

mod engine;
mod tx;
mod verdict;

pub use {
  engine::{ConsensusCounters, EngineContext, PopEngine, ValidatorOutcome},
  tx::{
    AttackVerdictRecord, ConsensusStatus, Transaction, TxId, VerdictId,
    VerdictOutcome, Vote, VoteVerdict,
  },
  verdict::{AttackProposal, AttackVote, VerdictManager},
};

//! Run outputs
//!
//! Everything the results collaborator consumes at the end of a run.
//! All types serialize to JSON; persistence is somebody else's job.
//! The chain snapshot is the single source of truth: attack verdicts
//! are extracted from `attack_verdict` blocks, not tracked
//! separately.

use {
  crate::{
    chain::{Block, BlockType, IntegrityReport, ReplicaSummary},
    clock::LogicalTime,
    consensus::{AttackVerdictRecord, ConsensusCounters},
    dataset::{Observation, UpdateKind},
    detector::{AttackKind, Classified, Severity},
    fabric::FabricStats,
    ledger::LedgerReport,
    metrics::{PerNodeStats, TpsSample},
    primitives::{Asn, IpPrefix},
    rating::RatingReport,
  },
  itertools::Itertools,
  serde::Serialize,
  std::collections::BTreeMap,
};

/// One observation's classification decision at one node.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
  pub observer: Asn,
  pub prefix: IpPrefix,
  pub origin: Asn,
  pub timestamp: LogicalTime,
  pub update: UpdateKind,
  pub classified: Option<AttackKind>,
  pub severity: Option<Severity>,
  pub ground_truth_attack: bool,
}

impl DetectionRecord {
  pub fn new(obs: &Observation, classified: Classified) -> Self {
    let (kind, severity) = match classified {
      Classified::Attack { kind, severity } => (Some(kind), Some(severity)),
      Classified::Legitimate => (None, None),
    };
    Self {
      observer: obs.observer,
      prefix: obs.prefix,
      origin: obs.origin,
      timestamp: obs.timestamp,
      update: obs.kind,
      classified: kind,
      severity,
      ground_truth_attack: obs.ground_truth_attack,
    }
  }
}

/// The ordered block list plus its verification results.
#[derive(Debug, Clone, Serialize)]
pub struct BlockchainSnapshot {
  pub blocks: Vec<Block>,
  pub integrity: IntegrityReport,
  pub replicas: Vec<ReplicaSummary>,
}

/// Aggregated consensus outcome counts for the whole run.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ConsensusLog {
  pub confirmed: u64,
  pub insufficient_consensus: u64,
  pub single_witness: u64,
  pub timed_out: u64,
  pub replay_votes: u64,
  pub late_votes: u64,
  pub bad_signatures: u64,
  pub unknown_tx: u64,
  pub unsolicited_votes: u64,
  pub award_failures: u64,
  pub verdicts_confirmed: u64,
  pub verdicts_not_attack: u64,
  pub verdicts_disputed: u64,
  pub chain_divergence: u64,
}

impl ConsensusLog {
  pub fn absorb(&mut self, counters: &ConsensusCounters) {
    self.confirmed += counters.confirmed;
    self.insufficient_consensus += counters.insufficient_consensus;
    self.single_witness += counters.single_witness;
    self.timed_out += counters.timed_out;
    self.replay_votes += counters.replay_votes;
    self.late_votes += counters.late_votes;
    self.bad_signatures += counters.bad_signatures;
    self.unknown_tx += counters.unknown_tx;
    self.unsolicited_votes += counters.unsolicited_votes;
    self.award_failures += counters.award_failures;
    self.verdicts_confirmed += counters.verdicts_confirmed;
    self.verdicts_not_attack += counters.verdicts_not_attack;
    self.verdicts_disputed += counters.verdicts_disputed;
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
  pub per_node: BTreeMap<Asn, u64>,
  pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CryptoSummary {
  pub scheme: &'static str,
  pub key_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SimReport {
  pub blockchain: BlockchainSnapshot,
  pub detections: BTreeMap<Asn, Vec<DetectionRecord>>,
  pub verdicts: Vec<AttackVerdictRecord>,
  pub rating: RatingReport,
  pub ledger: LedgerReport,
  pub consensus: ConsensusLog,
  pub fabric: FabricStats,
  pub dedup: DedupStats,
  pub crypto: CryptoSummary,
  pub per_node: BTreeMap<Asn, PerNodeStats>,
  pub tps: Vec<TpsSample>,
}

/// Pulls every verdict record out of the chain's `attack_verdict`
/// blocks, in block order.
pub fn verdicts_in_chain(blocks: &[Block]) -> Vec<AttackVerdictRecord> {
  blocks
    .iter()
    .filter(|b| b.block_type == BlockType::AttackVerdict)
    .flat_map(|b| b.transactions.iter())
    .filter_map(|tx| tx.verdict.clone())
    .collect()
}

impl SimReport {
  /// Compact run summary for log output and the CLI.
  pub fn summary(&self) -> serde_json::Value {
    let detection_counts: BTreeMap<String, usize> = self
      .detections
      .values()
      .flatten()
      .filter_map(|d| d.classified)
      .counts()
      .into_iter()
      .map(|(kind, count)| (kind.to_string(), count))
      .collect();
    serde_json::json!({
      "blocks": self.blockchain.blocks.len(),
      "chain_ok": self.blockchain.integrity.ok,
      "consensus": self.consensus,
      "attacks_detected": detection_counts,
      "verdicts_in_chain": self.verdicts.len(),
      "fabric": self.fabric,
      "dedup_total": self.dedup.total,
      "treasury": self.ledger.treasury,
      "distributed": self.ledger.total_distributed,
      "crypto": self.crypto,
    })
  }
}

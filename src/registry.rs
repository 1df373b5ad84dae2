//! Node registry
//!
//! Immutable view of the validator/observer split for a run. The
//! effective consensus threshold is computed once at construction and
//! never changes; dynamic membership is not part of this protocol
//! iteration.

use {
  crate::{config::ConsensusConfig, dataset::Classification, primitives::Asn},
  std::collections::BTreeSet,
};

#[derive(Debug, Clone)]
pub struct NodeRegistry {
  validators: Vec<Asn>,
  validator_set: BTreeSet<Asn>,
  observers: Vec<Asn>,
  threshold: usize,
}

impl NodeRegistry {
  pub fn new(classification: &Classification, cfg: &ConsensusConfig) -> Self {
    let validator_set = classification.validators.clone();
    let validators: Vec<Asn> = validator_set.iter().copied().collect();
    let observers: Vec<Asn> =
      classification.observers.iter().copied().collect();
    let threshold = effective_threshold(validators.len(), cfg);
    Self {
      validators,
      validator_set,
      observers,
      threshold,
    }
  }

  pub fn is_validator(&self, asn: Asn) -> bool {
    self.validator_set.contains(&asn)
  }

  pub fn validators(&self) -> &[Asn] {
    &self.validators
  }

  pub fn observers(&self) -> &[Asn] {
    &self.observers
  }

  /// All validators except `asn` itself, the population every
  /// broadcast sample is drawn from.
  pub fn peers_of(&self, asn: Asn) -> Vec<Asn> {
    self
      .validators
      .iter()
      .copied()
      .filter(|v| *v != asn)
      .collect()
  }

  /// The approval threshold fixed for this run.
  pub fn threshold(&self) -> usize {
    self.threshold
  }
}

/// `T = max(T_MIN, min(floor(N/3) + 1, T_CAP))` over the validator
/// population N, additionally clamped so a merger with N-1 peers can
/// still reach it. Tiny networks would otherwise have every round
/// time out by construction.
fn effective_threshold(validators: usize, cfg: &ConsensusConfig) -> usize {
  let base = cfg.t_min.max((validators / 3 + 1).min(cfg.t_cap));
  base.min(validators.saturating_sub(1).max(1))
}

//! Run configuration
//!
//! A single record with every recognized knob, grouped by subsystem.
//! Values deserialize from JSON with humantime duration strings
//! ("3s", "30days") and every field has the documented default, so a
//! config file only needs to name what it overrides.

use {
  crate::detector::AttackKind,
  serde::{Deserialize, Serialize},
  std::time::Duration,
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("speed multiplier must be positive, got {0}")]
  InvalidSpeed(f64),

  #[error("consensus threshold floor must be at least 1")]
  InvalidThresholdFloor,

  #[error("broadcast fan-out must be at least 1")]
  InvalidFanout,

  #[error("batch size must be at least 1")]
  InvalidBatchSize,

  #[error("{0} window must be non-zero")]
  ZeroWindow(&'static str),

  #[error("total token supply must be non-zero")]
  ZeroSupply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
  /// Lower bound on the approval threshold.
  pub t_min: usize,

  /// Upper cap on the approval threshold.
  pub t_cap: usize,

  /// Vote collection deadline for regular transactions.
  #[serde(with = "humantime_serde")]
  pub regular_timeout: Duration,

  /// Vote collection deadline for attack transactions.
  #[serde(with = "humantime_serde")]
  pub attack_timeout: Duration,

  /// Size of the random validator sample each transaction is
  /// broadcast to.
  pub max_broadcast_peers: usize,
}

impl Default for ConsensusConfig {
  fn default() -> Self {
    Self {
      t_min: 3,
      t_cap: 5,
      regular_timeout: Duration::from_secs(3),
      attack_timeout: Duration::from_secs(5),
      max_broadcast_peers: 5,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
  /// Dedup skip window on validator nodes.
  #[serde(with = "humantime_serde")]
  pub rpki_window: Duration,

  /// Dedup skip window on observer nodes.
  #[serde(with = "humantime_serde")]
  pub nonrpki_window: Duration,

  /// Knowledge-base entry lifetime and vote lookup tolerance.
  #[serde(with = "humantime_serde")]
  pub kb_window: Duration,

  /// Interval between knowledge-base eviction sweeps.
  #[serde(with = "humantime_serde")]
  pub kb_cleanup: Duration,
}

impl Default for WindowConfig {
  fn default() -> Self {
    Self {
      rpki_window: Duration::from_secs(300),
      nonrpki_window: Duration::from_secs(120),
      kb_window: Duration::from_secs(480),
      kb_cleanup: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
  /// Sliding window over which state changes are counted.
  #[serde(with = "humantime_serde")]
  pub flap_window: Duration,

  /// State changes within the window that constitute flapping.
  pub flap_threshold: usize,

  /// Minimum spacing between two counted state changes.
  #[serde(with = "humantime_serde")]
  pub flap_dedup: Duration,

  /// Votes required before an attack verdict round settles early.
  pub attack_consensus_min_votes: usize,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      flap_window: Duration::from_secs(60),
      flap_threshold: 5,
      flap_dedup: Duration::from_secs(2),
      attack_consensus_min_votes: 3,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
  pub kb_max: usize,
  pub pending_max: usize,
  pub committed_max: usize,
  pub dedup_max: usize,
  pub ingest_buffer_max: usize,
}

impl Default for CapacityConfig {
  fn default() -> Self {
    Self {
      kb_max: 50_000,
      pending_max: 5_000,
      committed_max: 50_000,
      dedup_max: 100_000,
      ingest_buffer_max: 1_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
  pub total_supply: u64,
  pub reward_block_commit: u64,
  pub reward_vote_approve: u64,
  pub reward_attack_detection: u64,
}

impl Default for LedgerConfig {
  fn default() -> Self {
    Self {
      total_supply: 10_000_000,
      reward_block_commit: 10,
      reward_vote_approve: 1,
      reward_attack_detection: 100,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
  pub initial_score: u8,

  pub penalty_prefix_hijack: u8,
  pub penalty_subprefix_hijack: u8,
  pub penalty_bogon_injection: u8,
  pub penalty_route_flapping: u8,

  /// Extra penalty when another verdict lands within the repeat
  /// window.
  pub repeat_surcharge: u8,

  /// Extra penalty once three or more verdicts accumulate within the
  /// repeat window.
  pub persistent_surcharge: u8,

  /// Window over which repeat offences are tracked (30 simulated
  /// days by default).
  #[serde(with = "humantime_serde")]
  pub repeat_window: Duration,

  /// A point of score is awarded per this many legitimate
  /// announcements.
  pub legit_reward_every: u64,

  /// Periodic bonus for a penalty-free period of activity.
  pub good_behavior_bonus: u8,

  #[serde(with = "humantime_serde")]
  pub good_behavior_period: Duration,
}

impl Default for RatingConfig {
  fn default() -> Self {
    Self {
      initial_score: 50,
      penalty_prefix_hijack: 25,
      penalty_subprefix_hijack: 20,
      penalty_bogon_injection: 15,
      penalty_route_flapping: 10,
      repeat_surcharge: 5,
      persistent_surcharge: 10,
      repeat_window: Duration::from_secs(30 * 24 * 3600),
      legit_reward_every: 50,
      good_behavior_bonus: 2,
      good_behavior_period: Duration::from_secs(30 * 24 * 3600),
    }
  }
}

impl RatingConfig {
  pub fn penalty_for(&self, kind: AttackKind) -> u8 {
    match kind {
      AttackKind::PrefixHijack => self.penalty_prefix_hijack,
      AttackKind::SubprefixHijack => self.penalty_subprefix_hijack,
      AttackKind::BogonInjection => self.penalty_bogon_injection,
      AttackKind::RouteFlapping => self.penalty_route_flapping,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
  /// Dataset replay speed: logical seconds per wall-clock second.
  pub speed_multiplier: f64,

  /// Committed transactions per block; 1 disables batching.
  pub batch_size: usize,

  /// Maximum time a committed transaction waits in the batch queue.
  #[serde(with = "humantime_serde")]
  pub batch_timeout: Duration,

  /// Metrics sampling interval (logical time).
  #[serde(with = "humantime_serde")]
  pub metrics_period: Duration,

  /// Master seed for key generation and peer sampling.
  pub seed: u64,
}

impl Default for SimulationConfig {
  fn default() -> Self {
    Self {
      speed_multiplier: 1.0,
      batch_size: 1,
      batch_timeout: Duration::from_millis(500),
      metrics_period: Duration::from_secs(1),
      seed: 0,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
  /// Worker pool size; `None` selects `max(48, 2 * cores)`.
  pub workers: Option<usize>,
}

impl FabricConfig {
  pub fn effective_workers(&self) -> usize {
    self.workers.unwrap_or_else(|| {
      let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
      48.max(2 * cores)
    })
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
  pub consensus: ConsensusConfig,
  pub windows: WindowConfig,
  pub detection: DetectionConfig,
  pub capacity: CapacityConfig,
  pub ledger: LedgerConfig,
  pub rating: RatingConfig,
  pub simulation: SimulationConfig,
  pub fabric: FabricConfig,
}

impl SimConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(self.simulation.speed_multiplier > 0.0)
      || !self.simulation.speed_multiplier.is_finite()
    {
      return Err(ConfigError::InvalidSpeed(self.simulation.speed_multiplier));
    }
    if self.consensus.t_min < 1 {
      return Err(ConfigError::InvalidThresholdFloor);
    }
    if self.consensus.max_broadcast_peers < 1 {
      return Err(ConfigError::InvalidFanout);
    }
    if self.simulation.batch_size < 1 {
      return Err(ConfigError::InvalidBatchSize);
    }
    if self.windows.rpki_window.is_zero()
      || self.windows.nonrpki_window.is_zero()
    {
      return Err(ConfigError::ZeroWindow("dedup"));
    }
    if self.windows.kb_window.is_zero() {
      return Err(ConfigError::ZeroWindow("knowledge"));
    }
    if self.detection.flap_window.is_zero() {
      return Err(ConfigError::ZeroWindow("flap"));
    }
    if self.ledger.total_supply == 0 {
      return Err(ConfigError::ZeroSupply);
    }
    Ok(())
  }
}

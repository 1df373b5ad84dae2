//! Trust ratings
//!
//! Every non-validator AS carries a 0..=100 trust score seeded at the
//! configured initial value. Confirmed attack verdicts subtract the
//! per-class penalty, with surcharges for repeat and persistent
//! offenders inside a 30-simulated-day window. Sustained legitimate
//! announcements earn the score back slowly.
//!
//! Updates are serialized per AS through the shard locks of the
//! backing map; different ASes never contend.

use {
  crate::{
    clock::LogicalTime,
    config::RatingConfig,
    detector::AttackKind,
    primitives::Asn,
  },
  dashmap::DashMap,
  serde::Serialize,
  std::{collections::BTreeMap, collections::VecDeque, sync::Arc},
  tracing::debug,
};

/// One recorded score mutation.
#[derive(Debug, Clone, Serialize)]
pub struct RatingEvent {
  pub at: LogicalTime,
  pub change: i32,
  pub score_after: u8,
  pub cause: RatingCause,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingCause {
  AttackPenalty(AttackKind),
  RepeatSurcharge,
  PersistentSurcharge,
  LegitimateTraffic,
  GoodBehaviorBonus,
}

#[derive(Debug)]
struct RatingEntry {
  score: u8,
  history: Vec<RatingEvent>,
  /// Timestamps of penalties inside the repeat window.
  penalties: VecDeque<LogicalTime>,
  legit_count: u64,
  /// Start of the current penalty-free stretch.
  clean_since: Option<LogicalTime>,
  last_bonus: Option<LogicalTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingReport {
  pub scores: BTreeMap<Asn, u8>,
  pub histories: BTreeMap<Asn, Vec<RatingEvent>>,
}

pub struct TrustRatingEngine {
  cfg: RatingConfig,
  entries: DashMap<Asn, RatingEntry>,
}

impl TrustRatingEngine {
  pub fn new(cfg: RatingConfig) -> Arc<Self> {
    Arc::new(Self {
      cfg,
      entries: DashMap::new(),
    })
  }

  fn with_entry<R>(
    &self,
    asn: Asn,
    now: LogicalTime,
    f: impl FnOnce(&RatingConfig, &mut RatingEntry) -> R,
  ) -> R {
    let mut entry = self.entries.entry(asn).or_insert_with(|| RatingEntry {
      score: self.cfg.initial_score,
      history: Vec::new(),
      penalties: VecDeque::new(),
      legit_count: 0,
      clean_since: Some(now),
      last_bonus: None,
    });
    f(&self.cfg, entry.value_mut())
  }

  pub fn score_of(&self, asn: Asn) -> u8 {
    self
      .entries
      .get(&asn)
      .map(|e| e.score)
      .unwrap_or(self.cfg.initial_score)
  }

  /// Applies the penalty for a confirmed attack verdict against
  /// `asn`, including repeat and persistent surcharges.
  pub fn apply_penalty(&self, asn: Asn, kind: AttackKind, now: LogicalTime) {
    self.with_entry(asn, now, |cfg, entry| {
      while let Some(front) = entry.penalties.front() {
        if now.since(*front) > cfg.repeat_window {
          entry.penalties.pop_front();
        } else {
          break;
        }
      }
      let repeat = !entry.penalties.is_empty();
      entry.penalties.push_back(now);
      let persistent = entry.penalties.len() >= 3;
      entry.clean_since = None;

      apply(entry, now, -(cfg.penalty_for(kind) as i32), RatingCause::AttackPenalty(kind));
      if repeat {
        apply(
          entry,
          now,
          -(cfg.repeat_surcharge as i32),
          RatingCause::RepeatSurcharge,
        );
      }
      if persistent {
        apply(
          entry,
          now,
          -(cfg.persistent_surcharge as i32),
          RatingCause::PersistentSurcharge,
        );
      }
      debug!("{asn} penalized for {kind}, score now {}", entry.score);
    });
  }

  /// Records one legitimate announcement originated by `asn`.
  /// Every `legit_reward_every` announcements earn a point, and a
  /// penalty-free good-behavior period earns the periodic bonus.
  pub fn record_legitimate(&self, asn: Asn, now: LogicalTime) {
    self.with_entry(asn, now, |cfg, entry| {
      entry.legit_count += 1;
      if entry.legit_count % cfg.legit_reward_every == 0 {
        apply(entry, now, 1, RatingCause::LegitimateTraffic);
      }
      let clean_since = *entry.clean_since.get_or_insert(now);
      let bonus_base = entry.last_bonus.unwrap_or(clean_since).max(clean_since);
      if now.since(bonus_base) >= cfg.good_behavior_period {
        entry.last_bonus = Some(now);
        apply(
          entry,
          now,
          cfg.good_behavior_bonus as i32,
          RatingCause::GoodBehaviorBonus,
        );
      }
    });
  }

  pub fn report(&self) -> RatingReport {
    let mut scores = BTreeMap::new();
    let mut histories = BTreeMap::new();
    for entry in self.entries.iter() {
      scores.insert(*entry.key(), entry.score);
      histories.insert(*entry.key(), entry.history.clone());
    }
    RatingReport { scores, histories }
  }
}

fn apply(
  entry: &mut RatingEntry,
  at: LogicalTime,
  change: i32,
  cause: RatingCause,
) {
  let score = (entry.score as i32 + change).clamp(0, 100) as u8;
  entry.score = score;
  entry.history.push(RatingEvent {
    at,
    change,
    score_after: score,
    cause,
  });
}

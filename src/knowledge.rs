//! Per-node knowledge base
//!
//! Every node keeps a sliding window of the announcements it has
//! itself observed. Votes on other mergers' transactions are decided
//! entirely from this store: a matching (prefix, origin) within the
//! window approves, a conflicting origin for a known prefix rejects,
//! and everything else abstains.
//!
//! Entries expire after the knowledge window. Stale entries are
//! evicted lazily from the queried bucket before every lookup, plus a
//! periodic full sweep driven by the owning runtime; capacity
//! overflow drops the oldest entry.

use {
  crate::{
    clock::LogicalTime,
    primitives::{Asn, IpPrefix},
  },
  std::{
    collections::{HashMap, VecDeque},
    time::Duration,
  },
};

/// What a node can say about a (prefix, origin) claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KnowledgeVerdict {
  /// A matching announcement is in the window.
  Approve,
  /// The prefix is unknown within the window.
  NoKnowledge,
  /// The prefix is known with a different origin.
  Reject,
}

/// The single capability consensus voting needs. The engine queries
/// through this trait so tests can substitute a fixed-response
/// oracle.
pub trait KnowledgeOracle {
  fn has_compatible(
    &mut self,
    prefix: &IpPrefix,
    origin: Asn,
    now: LogicalTime,
  ) -> KnowledgeVerdict;
}

#[derive(Debug, Clone)]
struct KnowledgeEntry {
  origin: Asn,
  observed_at: LogicalTime,
  #[allow(dead_code)]
  trust_score: u8,
}

#[derive(Debug)]
pub struct KnowledgeBase {
  window: Duration,
  cleanup_every: Duration,
  max: usize,
  by_prefix: HashMap<IpPrefix, Vec<KnowledgeEntry>>,
  /// Insertion order, used for oldest-first capacity eviction. May
  /// reference entries the window sweep already removed; those are
  /// skipped when popped.
  order: VecDeque<(IpPrefix, Asn, LogicalTime)>,
  len: usize,
  last_cleanup: LogicalTime,
  overflow_evictions: u64,
}

impl KnowledgeBase {
  pub fn new(window: Duration, cleanup_every: Duration, max: usize) -> Self {
    Self {
      window,
      cleanup_every,
      max,
      by_prefix: HashMap::new(),
      order: VecDeque::new(),
      len: 0,
      last_cleanup: LogicalTime::ZERO,
      overflow_evictions: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn overflow_evictions(&self) -> u64 {
    self.overflow_evictions
  }

  /// Records an observed announcement. On a full store the oldest
  /// entry is dropped first.
  pub fn add(
    &mut self,
    prefix: IpPrefix,
    origin: Asn,
    observed_at: LogicalTime,
    trust_score: u8,
  ) {
    while self.len >= self.max {
      if !self.evict_oldest() {
        break;
      }
      self.overflow_evictions += 1;
    }
    self.by_prefix.entry(prefix).or_default().push(KnowledgeEntry {
      origin,
      observed_at,
      trust_score,
    });
    self.order.push_back((prefix, origin, observed_at));
    self.len += 1;
  }

  /// Answers whether an announcement is compatible with what this
  /// node has itself seen within `tolerance` of `now`. Expired
  /// entries in the queried bucket are evicted first so the answer
  /// never rests on stale knowledge.
  pub fn query(
    &mut self,
    prefix: &IpPrefix,
    origin: Asn,
    now: LogicalTime,
  ) -> KnowledgeVerdict {
    self.evict_bucket(prefix, now);
    let Some(entries) = self.by_prefix.get(prefix) else {
      return KnowledgeVerdict::NoKnowledge;
    };
    if entries.is_empty() {
      return KnowledgeVerdict::NoKnowledge;
    }
    if entries.iter().any(|e| e.origin == origin) {
      KnowledgeVerdict::Approve
    } else {
      KnowledgeVerdict::Reject
    }
  }

  /// Periodic full sweep. The owning runtime calls this on every
  /// iteration; the sweep only runs once per cleanup interval.
  pub fn maybe_cleanup(&mut self, now: LogicalTime) {
    if now.since(self.last_cleanup) < self.cleanup_every {
      return;
    }
    self.last_cleanup = now;
    let window = self.window;
    let mut removed = 0usize;
    self.by_prefix.retain(|_, entries| {
      let before = entries.len();
      entries.retain(|e| now.since(e.observed_at) <= window);
      removed += before - entries.len();
      !entries.is_empty()
    });
    self.len -= removed;
  }

  fn evict_bucket(&mut self, prefix: &IpPrefix, now: LogicalTime) {
    if let Some(entries) = self.by_prefix.get_mut(prefix) {
      let window = self.window;
      let before = entries.len();
      entries.retain(|e| now.since(e.observed_at) <= window);
      self.len -= before - entries.len();
      if entries.is_empty() {
        self.by_prefix.remove(prefix);
      }
    }
  }

  fn evict_oldest(&mut self) -> bool {
    while let Some((prefix, origin, observed_at)) = self.order.pop_front() {
      let Some(entries) = self.by_prefix.get_mut(&prefix) else {
        continue; // already swept
      };
      let Some(pos) = entries
        .iter()
        .position(|e| e.origin == origin && e.observed_at == observed_at)
      else {
        continue;
      };
      entries.remove(pos);
      if entries.is_empty() {
        self.by_prefix.remove(&prefix);
      }
      self.len -= 1;
      return true;
    }
    false
  }
}

impl KnowledgeOracle for KnowledgeBase {
  fn has_compatible(
    &mut self,
    prefix: &IpPrefix,
    origin: Asn,
    now: LogicalTime,
  ) -> KnowledgeVerdict {
    self.query(prefix, origin, now)
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{KnowledgeBase, KnowledgeVerdict},
    crate::{clock::LogicalTime, primitives::{Asn, IpPrefix}},
    std::time::Duration,
  };

  fn p(s: &str) -> IpPrefix {
    s.parse().unwrap()
  }

  fn t(secs: u64) -> LogicalTime {
    LogicalTime::from_secs(secs)
  }

  fn kb() -> KnowledgeBase {
    KnowledgeBase::new(Duration::from_secs(480), Duration::from_secs(60), 100)
  }

  #[test]
  fn approve_reject_no_knowledge() {
    let mut kb = kb();
    kb.add(p("10.0.0.0/8"), Asn(100), t(100), 50);

    assert_eq!(
      kb.query(&p("10.0.0.0/8"), Asn(100), t(110)),
      KnowledgeVerdict::Approve
    );
    assert_eq!(
      kb.query(&p("10.0.0.0/8"), Asn(999), t(110)),
      KnowledgeVerdict::Reject
    );
    assert_eq!(
      kb.query(&p("192.0.2.0/24"), Asn(100), t(110)),
      KnowledgeVerdict::NoKnowledge
    );
  }

  #[test]
  fn expired_entries_do_not_answer() {
    let mut kb = kb();
    kb.add(p("10.0.0.0/8"), Asn(100), t(100), 50);
    // beyond the 480s window the entry is gone
    assert_eq!(
      kb.query(&p("10.0.0.0/8"), Asn(100), t(700)),
      KnowledgeVerdict::NoKnowledge
    );
    assert!(kb.is_empty());
  }

  #[test]
  fn overflow_evicts_oldest() {
    let mut kb =
      KnowledgeBase::new(Duration::from_secs(480), Duration::from_secs(60), 2);
    kb.add(p("10.0.0.0/8"), Asn(1), t(100), 50);
    kb.add(p("11.0.0.0/8"), Asn(2), t(101), 50);
    kb.add(p("12.0.0.0/8"), Asn(3), t(102), 50);
    assert_eq!(kb.len(), 2);
    assert_eq!(kb.overflow_evictions(), 1);
    assert_eq!(
      kb.query(&p("10.0.0.0/8"), Asn(1), t(110)),
      KnowledgeVerdict::NoKnowledge
    );
    assert_eq!(
      kb.query(&p("12.0.0.0/8"), Asn(3), t(110)),
      KnowledgeVerdict::Approve
    );
  }

  #[test]
  fn periodic_sweep_prunes_and_is_idempotent() {
    let mut kb = kb();
    kb.add(p("10.0.0.0/8"), Asn(1), t(100), 50);
    kb.add(p("11.0.0.0/8"), Asn(2), t(500), 50);
    kb.maybe_cleanup(t(700));
    assert_eq!(kb.len(), 1);
    kb.maybe_cleanup(t(700));
    assert_eq!(kb.len(), 1);
  }

  #[test]
  fn fixed_oracle_substitutes_for_the_store() {
    use super::KnowledgeOracle;

    struct FixedOracle(KnowledgeVerdict);
    impl KnowledgeOracle for FixedOracle {
      fn has_compatible(
        &mut self,
        _: &IpPrefix,
        _: Asn,
        _: LogicalTime,
      ) -> KnowledgeVerdict {
        self.0
      }
    }

    fn decide(
      oracle: &mut dyn KnowledgeOracle,
      prefix: &IpPrefix,
      origin: Asn,
    ) -> KnowledgeVerdict {
      oracle.has_compatible(prefix, origin, t(0))
    }

    let mut oracle = FixedOracle(KnowledgeVerdict::Reject);
    assert_eq!(
      decide(&mut oracle, &p("10.0.0.0/8"), Asn(1)),
      KnowledgeVerdict::Reject
    );
    let mut kb = kb();
    assert_eq!(
      decide(&mut kb, &p("10.0.0.0/8"), Asn(1)),
      KnowledgeVerdict::NoKnowledge
    );
  }

  #[test]
  fn capacity_eviction_skips_swept_entries() {
    let mut kb =
      KnowledgeBase::new(Duration::from_secs(100), Duration::from_secs(10), 2);
    kb.add(p("10.0.0.0/8"), Asn(1), t(100), 50);
    kb.add(p("11.0.0.0/8"), Asn(2), t(150), 50);
    // sweep removes the first entry, leaving its order record stale
    kb.maybe_cleanup(t(210));
    assert_eq!(kb.len(), 1);
    kb.add(p("12.0.0.0/8"), Asn(3), t(211), 50);
    kb.add(p("13.0.0.0/8"), Asn(4), t(212), 50);
    assert_eq!(kb.len(), 2);
    assert_eq!(
      kb.query(&p("11.0.0.0/8"), Asn(2), t(213)),
      KnowledgeVerdict::NoKnowledge
    );
    assert_eq!(
      kb.query(&p("13.0.0.0/8"), Asn(4), t(213)),
      KnowledgeVerdict::Approve
    );
  }
}

//! Duplicate announcement suppression
//!
//! Real BGP feeds repeat the same (prefix, origin) pair constantly.
//! Each node keeps a last-seen cache and skips observations repeated
//! within its skip window, so only fresh routing facts reach
//! consensus. Observations classified as attacks always bypass the
//! gate; the cache is never even consulted for them, and they are not
//! recorded into it.

use {
  crate::{
    clock::LogicalTime,
    primitives::{Asn, IpPrefix},
  },
  indexmap::IndexMap,
  std::time::Duration,
};

#[derive(Debug)]
pub struct DedupCache {
  window: Duration,
  max: usize,
  /// (prefix, origin) -> last seen, in least-recently-touched order.
  seen: IndexMap<(IpPrefix, Asn), LogicalTime>,
  skips: u64,
}

impl DedupCache {
  pub fn new(window: Duration, max: usize) -> Self {
    Self {
      window,
      max,
      seen: IndexMap::new(),
      skips: 0,
    }
  }

  /// Gate decision for one observation. `classified_attack` is the
  /// detector's call on the current observation, never ground truth.
  pub fn should_skip(
    &mut self,
    prefix: &IpPrefix,
    origin: Asn,
    now: LogicalTime,
    classified_attack: bool,
  ) -> bool {
    if classified_attack {
      return false;
    }
    let skip = match self.seen.get(&(*prefix, origin)) {
      Some(last_seen) => now.since(*last_seen) < self.window,
      None => false,
    };
    if skip {
      self.skips += 1;
    }
    skip
  }

  /// Marks the pair as seen now and refreshes its LRU position.
  pub fn record(&mut self, prefix: IpPrefix, origin: Asn, now: LogicalTime) {
    // shift-remove keeps the map ordered by recency of touch
    self.seen.shift_remove(&(prefix, origin));
    self.seen.insert((prefix, origin), now);
    while self.seen.len() > self.max {
      self.seen.shift_remove_index(0);
    }
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }

  /// Total observations this cache has skipped.
  pub fn skips(&self) -> u64 {
    self.skips
  }
}

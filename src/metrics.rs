//! Run metrics
//!
//! Monotone counters per node and for the whole run, cheap enough to
//! bump from every hot path, plus a periodic sampler that turns the
//! global commit counter into a TPS time series.

use {
  crate::{
    clock::{LogicalTime, Shutdown, SimClock},
    primitives::Asn,
  },
  dashmap::DashMap,
  serde::Serialize,
  std::{
    collections::BTreeMap,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc, Mutex,
    },
    time::Duration,
  },
  tokio::task::JoinHandle,
};

#[derive(Debug, Default)]
pub struct NodeCounters {
  pub observations: AtomicU64,
  pub attacks_detected: AtomicU64,
  pub txs_created: AtomicU64,
  pub dedup_skips: AtomicU64,
  pub buffer_drops: AtomicU64,
}

impl NodeCounters {
  pub fn snapshot(&self) -> PerNodeStats {
    PerNodeStats {
      observations: self.observations.load(Ordering::Relaxed),
      attacks_detected: self.attacks_detected.load(Ordering::Relaxed),
      txs_created: self.txs_created.load(Ordering::Relaxed),
      dedup_skips: self.dedup_skips.load(Ordering::Relaxed),
      buffer_drops: self.buffer_drops.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerNodeStats {
  pub observations: u64,
  pub attacks_detected: u64,
  pub txs_created: u64,
  pub dedup_skips: u64,
  pub buffer_drops: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TpsSample {
  pub at: LogicalTime,
  pub committed_txs: u64,
  pub tps: f64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
  nodes: DashMap<Asn, Arc<NodeCounters>>,
  committed_txs: AtomicU64,
  samples: Mutex<Vec<TpsSample>>,
}

impl MetricsCollector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// The counter block for one node, created on first use.
  pub fn node(&self, asn: Asn) -> Arc<NodeCounters> {
    self
      .nodes
      .entry(asn)
      .or_insert_with(|| Arc::new(NodeCounters::default()))
      .clone()
  }

  pub fn record_committed(&self, txs: u64) {
    self.committed_txs.fetch_add(txs, Ordering::Relaxed);
  }

  pub fn committed_txs(&self) -> u64 {
    self.committed_txs.load(Ordering::Relaxed)
  }

  /// Appends one TPS sample covering the time since the previous one.
  pub fn sample(&self, at: LogicalTime) {
    let committed = self.committed_txs();
    let mut samples = self.samples.lock().unwrap();
    let (prev_at, prev_committed) = samples
      .last()
      .map(|s| (s.at, s.committed_txs))
      .unwrap_or((LogicalTime::ZERO, 0));
    let elapsed = at.since(prev_at).as_secs_f64();
    let tps = if elapsed > 0.0 {
      (committed - prev_committed) as f64 / elapsed
    } else {
      0.0
    };
    samples.push(TpsSample {
      at,
      committed_txs: committed,
      tps,
    });
  }

  pub fn samples(&self) -> Vec<TpsSample> {
    self.samples.lock().unwrap().clone()
  }

  pub fn per_node(&self) -> BTreeMap<Asn, PerNodeStats> {
    self
      .nodes
      .iter()
      .map(|e| (*e.key(), e.value().snapshot()))
      .collect()
  }

  /// Background sampler ticking every `period` of logical time until
  /// shutdown.
  pub fn spawn_sampler(
    self: &Arc<Self>,
    clock: Arc<SimClock>,
    period: Duration,
    shutdown: &Shutdown,
  ) -> JoinHandle<()> {
    let metrics = Arc::clone(self);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      let wall_period = clock.wall_duration(period);
      loop {
        tokio::select! {
          _ = tokio::time::sleep(wall_period) => {
            metrics.sample(clock.now());
          }
          _ = shutdown.triggered() => return,
        }
      }
    })
  }
}

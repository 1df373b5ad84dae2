//! Per-AS node runtimes
//!
//! Each AS is driven by two tasks. The feeder paces that AS's slice
//! of the dataset against the simulation clock and pushes admitted
//! observations into a bounded ingest buffer; above the high-water
//! mark admission turns probabilistic, ramping to a full stop at
//! capacity, with stateless-classified attacks always admitted. The
//! runtime actor owns every piece of node-local state and drains its
//! ingest buffer, its fabric inbox and its consensus deadlines from
//! a single select loop, so no lock ever guards node state.

use {
  crate::{
    clock::{LogicalTime, Shutdown, SimClock, WaitOutcome},
    consensus::{
      AttackVerdictRecord, ConsensusCounters, EngineContext, PopEngine,
    },
    dataset::{Observation, UpdateKind},
    dedup::DedupCache,
    detector::{classify_stateless, AttackDetector},
    fabric::Envelope,
    metrics::NodeCounters,
    primitives::Asn,
    report::DetectionRecord,
    chain::ReplicaSummary,
  },
  rand::{Rng, SeedableRng},
  rand_chacha::ChaCha20Rng,
  std::sync::{atomic::Ordering, Arc},
  tokio::{
    sync::mpsc::{Receiver, Sender, UnboundedReceiver},
    task::JoinHandle,
  },
  tracing::debug,
};

/// What one node runtime hands back to the orchestrator.
#[derive(Debug)]
pub struct NodeOutcome {
  pub asn: Asn,
  pub detections: Vec<DetectionRecord>,
  pub verdicts: Vec<AttackVerdictRecord>,
  pub consensus: Option<ConsensusCounters>,
  pub replica: Option<ReplicaSummary>,
}

/// Probabilistic admission over a bounded ingest buffer: everything
/// below the high-water mark is admitted, then the drop probability
/// ramps linearly to certainty at a full buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferPolicy {
  high_water: f64,
}

impl Default for BufferPolicy {
  fn default() -> Self {
    Self { high_water: 0.6 }
  }
}

impl BufferPolicy {
  pub fn should_drop(
    &self,
    fill: f64,
    attack_exempt: bool,
    rng: &mut impl Rng,
  ) -> bool {
    if attack_exempt || fill < self.high_water {
      return false;
    }
    let p = ((fill - self.high_water) / (1.0 - self.high_water))
      .clamp(0.0, 1.0);
    rng.gen_bool(p)
  }
}

/// Paces one AS's observation stream against the clock and applies
/// the buffer policy. Finishes when the stream is exhausted or the
/// run is cancelled.
pub fn spawn_feeder(
  asn: Asn,
  stream: Vec<Observation>,
  ctx: &EngineContext,
  ingest: Sender<Observation>,
  counters: Arc<NodeCounters>,
) -> JoinHandle<()> {
  let clock = Arc::clone(&ctx.clock);
  let vrp = Arc::clone(&ctx.vrp);
  let capacity = ctx.cfg.capacity.ingest_buffer_max.max(1);
  let seed = ctx.cfg.simulation.seed ^ (asn.0 as u64).rotate_left(32);
  let policy = BufferPolicy::default();
  tokio::spawn(async move {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    for obs in stream {
      if clock.wait_until(obs.timestamp).await == WaitOutcome::Cancelled {
        return;
      }
      let fill = 1.0 - ingest.capacity() as f64 / capacity as f64;
      let exempt =
        classify_stateless(&vrp, &obs.prefix, obs.origin).is_some();
      if policy.should_drop(fill, exempt, &mut rng) {
        counters.buffer_drops.fetch_add(1, Ordering::Relaxed);
        continue;
      }
      if ingest.send(obs).await.is_err() {
        return;
      }
    }
    debug!("{asn} stream exhausted");
  })
}

async fn wake_at(clock: &SimClock, at: Option<LogicalTime>) {
  match at {
    Some(t) => tokio::time::sleep_until(clock.wall_instant(t)).await,
    None => futures::future::pending().await,
  }
}

/// The validator actor: full observation pipeline plus consensus
/// participation. Lives until shutdown so late votes and replication
/// keep being served after its own stream ends.
pub fn spawn_validator(
  mut engine: PopEngine,
  ctx: &EngineContext,
  mut ingest: Receiver<Observation>,
  mut inbox: UnboundedReceiver<Envelope>,
  shutdown: &Shutdown,
) -> JoinHandle<NodeOutcome> {
  let clock = Arc::clone(&ctx.clock);
  let shutdown = shutdown.clone();
  tokio::spawn(async move {
    let mut ingest_open = true;
    loop {
      let wake = engine.next_wake();
      tokio::select! {
        biased;
        _ = shutdown.triggered() => break,
        maybe_obs = ingest.recv(), if ingest_open => {
          match maybe_obs {
            Some(obs) => {
              engine.submit_local(&obs);
              engine.housekeeping(clock.now());
            }
            None => ingest_open = false,
          }
        }
        maybe_env = inbox.recv() => {
          if let Some(env) = maybe_env {
            engine.handle(env);
          }
        }
        _ = wake_at(&clock, wake) => {
          engine.on_deadlines(clock.now());
        }
      }
    }
    // settle anything already due before reporting
    engine.on_deadlines(clock.now());
    let outcome = engine.finish();
    NodeOutcome {
      asn: outcome.asn,
      detections: outcome.detections,
      verdicts: outcome.verdicts,
      consensus: Some(outcome.counters),
      replica: Some(outcome.replica),
    }
  })
}

/// The observer actor: detection and trust-rating contributions
/// only, no consensus and no fabric presence. Exits as soon as its
/// stream is done.
pub fn spawn_observer(
  asn: Asn,
  ctx: &EngineContext,
  mut ingest: Receiver<Observation>,
  shutdown: &Shutdown,
) -> JoinHandle<NodeOutcome> {
  let ctx = ctx.clone();
  let shutdown = shutdown.clone();
  tokio::spawn(async move {
    let counters = ctx.metrics.node(asn);
    let mut detector = AttackDetector::new(
      Arc::clone(&ctx.vrp),
      &ctx.cfg.detection,
    );
    let mut dedup = DedupCache::new(
      ctx.cfg.windows.nonrpki_window,
      ctx.cfg.capacity.dedup_max,
    );
    let mut detections = Vec::new();
    loop {
      tokio::select! {
        biased;
        _ = shutdown.triggered() => break,
        maybe_obs = ingest.recv() => {
          let Some(obs) = maybe_obs else { break };
          let now = ctx.clock.now();
          counters.observations.fetch_add(1, Ordering::Relaxed);
          let classified = detector.classify(&obs);
          detections.push(DetectionRecord::new(&obs, classified));
          if classified.is_attack() {
            counters.attacks_detected.fetch_add(1, Ordering::Relaxed);
          } else if obs.kind == UpdateKind::Announce {
            if dedup.should_skip(&obs.prefix, obs.origin, now, false) {
              counters.dedup_skips.fetch_add(1, Ordering::Relaxed);
            } else {
              dedup.record(obs.prefix, obs.origin, now);
              if !ctx.registry.is_validator(obs.origin) {
                ctx.rating.record_legitimate(obs.origin, now);
              }
            }
          }
          detector.gc(now);
        }
      }
    }
    NodeOutcome {
      asn,
      detections,
      verdicts: Vec::new(),
      consensus: None,
      replica: None,
    }
  })
}

#[cfg(test)]
mod tests {
  use {
    super::BufferPolicy,
    rand::SeedableRng,
    rand_chacha::ChaCha20Rng,
  };

  #[test]
  fn below_high_water_never_drops() {
    let policy = BufferPolicy::default();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    for _ in 0..1000 {
      assert!(!policy.should_drop(0.59, false, &mut rng));
    }
  }

  #[test]
  fn full_buffer_always_drops_non_attacks() {
    let policy = BufferPolicy::default();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    for _ in 0..1000 {
      assert!(policy.should_drop(1.0, false, &mut rng));
    }
  }

  #[test]
  fn attacks_are_always_admitted() {
    let policy = BufferPolicy::default();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    for _ in 0..1000 {
      assert!(!policy.should_drop(1.0, true, &mut rng));
    }
  }

  #[test]
  fn ramp_is_probabilistic_in_between() {
    let policy = BufferPolicy::default();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let drops = (0..10_000)
      .filter(|_| policy.should_drop(0.8, false, &mut rng))
      .count();
    // the 0.8 fill point sits at p = 0.5 on the ramp
    assert!(drops > 4000 && drops < 6000, "drops = {drops}");
  }
}

//! Run orchestration
//!
//! Builds every shared service in a fixed order, spawns the per-AS
//! runtimes, waits for the dataset to drain (or an optional wall
//! deadline), broadcasts shutdown, and assembles the final report.
//! All components are explicitly constructed here and passed down;
//! nothing in the system reaches for hidden global state.

use {
  crate::{
    chain::BlockStore,
    clock::{LogicalTime, Shutdown, SimClock},
    config::{ConfigError, SimConfig},
    consensus::EngineContext,
    dataset::Dataset,
    fabric::MessageFabric,
    ledger::TokenLedger,
    metrics::MetricsCollector,
    primitives::{Asn, KeyRing, Keypair},
    rating::TrustRatingEngine,
    registry::NodeRegistry,
    report::{
      verdicts_in_chain, BlockchainSnapshot, ConsensusLog, CryptoSummary,
      DedupStats, SimReport,
    },
    runtime::{spawn_feeder, spawn_observer, spawn_validator, NodeOutcome},
  },
  futures::future::join_all,
  rand::SeedableRng,
  rand_chacha::ChaCha20Rng,
  std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
  },
  thiserror::Error,
  tokio::sync::mpsc,
  tracing::{info, warn},
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),

  #[error("block store error: {0}")]
  Chain(#[from] crate::chain::ChainError),
}

pub struct Orchestrator {
  cfg: Arc<SimConfig>,
  dataset: Dataset,
  persist_dir: Option<PathBuf>,
  wall_deadline: Option<Duration>,
}

impl Orchestrator {
  pub fn new(
    cfg: SimConfig,
    dataset: Dataset,
  ) -> Result<Self, OrchestratorError> {
    cfg.validate()?;
    Ok(Self {
      cfg: Arc::new(cfg),
      dataset,
      persist_dir: None,
      wall_deadline: None,
    })
  }

  /// Persist appended blocks into this directory (write-behind).
  pub fn with_persistence(mut self, dir: PathBuf) -> Self {
    self.persist_dir = Some(dir);
    self
  }

  /// Hard wall-clock cap on the replay phase.
  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.wall_deadline = Some(deadline);
    self
  }

  pub async fn run(self) -> Result<SimReport, OrchestratorError> {
    let cfg = self.cfg;
    let shutdown = Shutdown::new();

    let span = self.dataset.span();
    let t0 = span.map(|(lo, _)| lo).unwrap_or(LogicalTime::ZERO);
    let clock = Arc::new(SimClock::start(
      t0,
      cfg.simulation.speed_multiplier,
      &shutdown,
    ));

    // deterministic key generation in classification order
    let mut keygen = ChaCha20Rng::seed_from_u64(cfg.simulation.seed);
    let mut keypairs: HashMap<Asn, Keypair> = HashMap::new();
    for asn in &self.dataset.classification.validators {
      keypairs.insert(*asn, Keypair::generate(&mut keygen));
    }
    let keyring = Arc::new(KeyRing::new(
      keypairs.iter().map(|(asn, kp)| (*asn, kp.public())),
    ));

    let registry = Arc::new(NodeRegistry::new(
      &self.dataset.classification,
      &cfg.consensus,
    ));
    info!(
      "starting run: {} validators, {} observers, threshold {}",
      registry.validators().len(),
      registry.observers().len(),
      registry.threshold()
    );

    let fabric =
      MessageFabric::new(cfg.fabric.effective_workers(), &shutdown);
    let store = BlockStore::new(t0, cfg.simulation.batch_size);
    let persist_worker = match &self.persist_dir {
      Some(dir) => Some(store.enable_persistence(dir.clone())?),
      None => None,
    };
    let ledger = TokenLedger::new(&cfg.ledger);
    let rating = TrustRatingEngine::new(cfg.rating.clone());
    let metrics = MetricsCollector::new();

    let sampler = metrics.spawn_sampler(
      Arc::clone(&clock),
      cfg.simulation.metrics_period,
      &shutdown,
    );
    let flusher = (cfg.simulation.batch_size > 1).then(|| {
      store.spawn_batch_flusher(
        Arc::clone(&clock),
        cfg.simulation.batch_timeout,
        &shutdown,
      )
    });

    let ctx = EngineContext {
      cfg: Arc::clone(&cfg),
      clock: Arc::clone(&clock),
      registry: Arc::clone(&registry),
      keyring: Arc::clone(&keyring),
      fabric: Arc::clone(&fabric),
      store: Arc::clone(&store),
      ledger: Arc::clone(&ledger),
      rating: Arc::clone(&rating),
      metrics: Arc::clone(&metrics),
      vrp: Arc::new(self.dataset.vrp.clone()),
    };

    let mut feeders = Vec::new();
    let mut runtimes = Vec::new();
    let mut streams = self.dataset.streams;

    for asn in registry.validators() {
      let stream = streams.remove(asn).unwrap_or_default();
      let inbox = fabric.register(*asn);
      let (ingest_tx, ingest_rx) =
        mpsc::channel(cfg.capacity.ingest_buffer_max.max(1));
      let counters = metrics.node(*asn);
      feeders.push(spawn_feeder(*asn, stream, &ctx, ingest_tx, counters));
      let engine = crate::consensus::PopEngine::new(
        *asn,
        keypairs[asn].clone(),
        ctx.clone(),
      );
      runtimes.push(spawn_validator(
        engine, &ctx, ingest_rx, inbox, &shutdown,
      ));
    }

    for (asn, stream) in streams {
      if stream.is_empty() {
        continue;
      }
      let (ingest_tx, ingest_rx) =
        mpsc::channel(cfg.capacity.ingest_buffer_max.max(1));
      let counters = metrics.node(asn);
      feeders.push(spawn_feeder(asn, stream, &ctx, ingest_tx, counters));
      runtimes.push(spawn_observer(asn, &ctx, ingest_rx, &shutdown));
    }

    // replay until the streams drain or the deadline cuts them off
    let total = self.dataset.classification.validators.len();
    let replay = join_all(feeders);
    match self.wall_deadline {
      Some(deadline) => {
        if tokio::time::timeout(deadline, replay).await.is_err() {
          warn!("run deadline reached before dataset exhaustion");
        }
      }
      None => {
        replay.await;
      }
    }

    // grace period for in-flight consensus and verdict rounds
    if span.is_some() && !shutdown.is_triggered() {
      let logical_grace = cfg.consensus.regular_timeout
        + cfg.consensus.attack_timeout
        + cfg.simulation.batch_timeout;
      let grace =
        clock.wall_duration(logical_grace) + Duration::from_millis(300);
      tokio::time::sleep(grace).await;
    }

    shutdown.trigger();
    let outcomes: Vec<NodeOutcome> = join_all(runtimes)
      .await
      .into_iter()
      .filter_map(|join| join.ok())
      .collect();
    fabric.join(Duration::from_secs(2)).await;
    if let Some(handle) = flusher {
      let _ = handle.await;
    } else {
      store.flush_batch(clock.now());
    }
    let _ = sampler.await;
    metrics.sample(clock.now());
    store.close_persistence();
    if let Some(worker) = persist_worker {
      let _ = worker.await;
    }

    let blocks = store.snapshot();
    let integrity = store.verify_integrity();
    if !integrity.ok {
      warn!("chain integrity check failed: {:?}", integrity.errors);
    }

    let mut consensus = ConsensusLog::default();
    let mut detections = BTreeMap::new();
    let mut replicas = Vec::new();
    for outcome in outcomes {
      if let Some(counters) = &outcome.consensus {
        consensus.absorb(counters);
      }
      if let Some(replica) = outcome.replica {
        consensus.chain_divergence += replica.chain_divergence;
        replicas.push(replica);
      }
      detections.insert(outcome.asn, outcome.detections);
    }

    let per_node = metrics.per_node();
    let dedup = DedupStats {
      total: per_node.values().map(|s| s.dedup_skips).sum(),
      per_node: per_node
        .iter()
        .map(|(asn, s)| (*asn, s.dedup_skips))
        .collect(),
    };

    let verdicts = verdicts_in_chain(&blocks);
    info!(
      "run complete: {} blocks, {} verdicts, {} confirmed commits",
      blocks.len(),
      verdicts.len(),
      consensus.confirmed
    );

    Ok(SimReport {
      blockchain: BlockchainSnapshot {
        blocks,
        integrity,
        replicas,
      },
      detections,
      verdicts,
      rating: rating.report(),
      ledger: ledger.report(),
      consensus,
      fabric: fabric.stats(),
      dedup,
      crypto: CryptoSummary {
        scheme: "ed25519",
        key_count: total,
      },
      per_node,
      tps: metrics.samples(),
    })
  }
}

//! Proof of Population
//!
//! One validator, one vote. A merger lifts a locally observed
//! announcement into a transaction, broadcasts it to a random sample
//! of peers, and collects signed votes. Peers answer purely from
//! their own knowledge bases. Once approvals reach the run threshold
//! the transaction commits as CONFIRMED; a deadline sweep settles
//! everything else as INSUFFICIENT_CONSENSUS or SINGLE_WITNESS.
//!
//! The engine is single-owner state: exactly one node runtime drives
//! it, so nothing in here needs a lock. All cross-node effects travel
//! through the message fabric; all shared services (chain, ledger,
//! ratings, metrics) are internally synchronized.

use {
  super::{
    tx::{ConsensusStatus, Transaction, TxId, Vote, VoteVerdict},
    verdict::{
      AttackProposal, AttackVote, SettledVerdict, VerdictManager,
      VerdictVoteOutcome,
    },
    AttackVerdictRecord,
  },
  crate::{
    chain::{BlockStore, ChainReplica, ReplicaSummary},
    clock::{LogicalTime, SimClock},
    config::SimConfig,
    dataset::{Observation, UpdateKind, VrpTable},
    dedup::DedupCache,
    detector::AttackDetector,
    fabric::{Envelope, Message, MessageFabric},
    knowledge::{KnowledgeBase, KnowledgeVerdict},
    ledger::TokenLedger,
    metrics::{MetricsCollector, NodeCounters},
    primitives::{Asn, KeyRing, Keypair},
    rating::TrustRatingEngine,
    registry::NodeRegistry,
    report::DetectionRecord,
  },
  indexmap::IndexSet,
  rand::{seq::SliceRandom, SeedableRng},
  rand_chacha::ChaCha20Rng,
  serde::Serialize,
  std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{atomic::Ordering, Arc},
  },
  tracing::{debug, info, warn},
};

/// Shared services handed to every engine and runtime at start-up.
/// Construction order is fixed by the orchestrator; there is no
/// global state.
#[derive(Clone)]
pub struct EngineContext {
  pub cfg: Arc<SimConfig>,
  pub clock: Arc<SimClock>,
  pub registry: Arc<NodeRegistry>,
  pub keyring: Arc<KeyRing>,
  pub fabric: Arc<MessageFabric>,
  pub store: Arc<BlockStore>,
  pub ledger: Arc<TokenLedger>,
  pub rating: Arc<TrustRatingEngine>,
  pub metrics: Arc<MetricsCollector>,
  pub vrp: Arc<VrpTable>,
}

/// Monotone per-validator consensus counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ConsensusCounters {
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
}

impl ConsensusCounters {
  fn bump_status(&mut self, status: ConsensusStatus) {
    match status {
      ConsensusStatus::Confirmed => self.confirmed += 1,
      ConsensusStatus::InsufficientConsensus => {
        self.insufficient_consensus += 1
      }
      ConsensusStatus::SingleWitness => self.single_witness += 1,
      ConsensusStatus::TimedOut => self.timed_out += 1,
      ConsensusStatus::Pending => {}
    }
  }
}

/// Everything a validator runtime hands back when it stops.
#[derive(Debug)]
pub struct ValidatorOutcome {
  pub asn: Asn,
  pub detections: Vec<DetectionRecord>,
  pub verdicts: Vec<AttackVerdictRecord>,
  pub counters: ConsensusCounters,
  pub replica: ReplicaSummary,
  pub dedup_skips: u64,
  pub kb_overflow_evictions: u64,
}

/// An id set with FIFO eviction at a fixed capacity.
struct BoundedIdSet {
  ids: IndexSet<TxId>,
  cap: usize,
}

impl BoundedIdSet {
  fn new(cap: usize) -> Self {
    Self {
      ids: IndexSet::new(),
      cap: cap.max(1),
    }
  }

  fn insert(&mut self, id: TxId) {
    self.ids.insert(id);
    while self.ids.len() > self.cap {
      self.ids.shift_remove_index(0);
    }
  }

  fn contains(&self, id: &TxId) -> bool {
    self.ids.contains(id)
  }
}

struct Round {
  tx: Transaction,
  /// The originating observation, kept verbatim for the attack
  /// proposal peers re-classify.
  observation: Observation,
  deadline: LogicalTime,
  subset: Vec<Asn>,
  responded: HashSet<Asn>,
}

pub struct PopEngine {
  me: Asn,
  keypair: Keypair,
  ctx: EngineContext,
  node_counters: Arc<NodeCounters>,

  kb: KnowledgeBase,
  dedup: DedupCache,
  detector: AttackDetector,

  pending: HashMap<TxId, Round>,
  /// Wake queue; the composite key settles deadline ties in
  /// lexicographic transaction-id order.
  deadlines: BTreeMap<(LogicalTime, TxId), ()>,
  pending_fifo: VecDeque<TxId>,
  committed: BoundedIdSet,
  voted: BoundedIdSet,

  verdicts: VerdictManager,
  verdict_log: Vec<AttackVerdictRecord>,
  detections: Vec<DetectionRecord>,
  counters: ConsensusCounters,
  replica: ChainReplica,

  peers: Vec<Asn>,
  rng: ChaCha20Rng,
  nonce: u64,
}

impl PopEngine {
  pub fn new(me: Asn, keypair: Keypair, ctx: EngineContext) -> Self {
    let cfg = &ctx.cfg;
    let kb = KnowledgeBase::new(
      cfg.windows.kb_window,
      cfg.windows.kb_cleanup,
      cfg.capacity.kb_max,
    );
    let dedup =
      DedupCache::new(cfg.windows.rpki_window, cfg.capacity.dedup_max);
    let detector = AttackDetector::new(Arc::clone(&ctx.vrp), &cfg.detection);
    let replica = ChainReplica::new(me, ctx.store.genesis());
    let node_counters = ctx.metrics.node(me);
    let peers = ctx.registry.peers_of(me);
    let seed = cfg.simulation.seed ^ (me.0 as u64).wrapping_mul(0x9E37_79B9);
    Self {
      me,
      keypair,
      node_counters,
      kb,
      dedup,
      detector,
      pending: HashMap::new(),
      deadlines: BTreeMap::new(),
      pending_fifo: VecDeque::new(),
      committed: BoundedIdSet::new(cfg.capacity.committed_max),
      voted: BoundedIdSet::new(cfg.capacity.committed_max),
      verdicts: VerdictManager::new(cfg.capacity.committed_max),
      verdict_log: Vec::new(),
      detections: Vec::new(),
      counters: ConsensusCounters::default(),
      replica,
      peers,
      rng: ChaCha20Rng::seed_from_u64(seed),
      nonce: 0,
      ctx,
    }
  }

  /// Ingests one observation from this node's own stream: classify,
  /// gate, record, and lift it into a consensus round.
  pub fn submit_local(&mut self, obs: &Observation) {
    let now = self.ctx.clock.now();
    self.node_counters.observations.fetch_add(1, Ordering::Relaxed);

    let classified = self.detector.classify(obs);
    self.detections.push(DetectionRecord::new(obs, classified));
    let attack_kind = classified.kind();

    if classified.is_attack() {
      self
        .node_counters
        .attacks_detected
        .fetch_add(1, Ordering::Relaxed);
    } else {
      if obs.kind == UpdateKind::Withdraw {
        // a legitimate withdrawal carries no routing claim to attest
        return;
      }
      if !self.ctx.registry.is_validator(obs.origin) {
        self.ctx.rating.record_legitimate(obs.origin, now);
      }
    }

    if obs.kind == UpdateKind::Announce {
      if self.dedup.should_skip(
        &obs.prefix,
        obs.origin,
        now,
        classified.is_attack(),
      ) {
        self.node_counters.dedup_skips.fetch_add(1, Ordering::Relaxed);
        return;
      }
      let trust = self.ctx.rating.score_of(obs.origin);
      self.kb.add(obs.prefix, obs.origin, obs.timestamp, trust);
      if !classified.is_attack() {
        self.dedup.record(obs.prefix, obs.origin, now);
      }
    }

    let tx_id = TxId::derive(self.me, obs.timestamp, self.nonce);
    self.nonce += 1;
    let tx = Transaction::create(
      &self.keypair,
      tx_id,
      self.me,
      obs,
      attack_kind,
      now,
    );
    self.node_counters.txs_created.fetch_add(1, Ordering::Relaxed);

    let fanout = self.ctx.cfg.consensus.max_broadcast_peers;
    let subset: Vec<Asn> = self
      .peers
      .choose_multiple(&mut self.rng, fanout.min(self.peers.len()))
      .copied()
      .collect();
    let timeout = if classified.is_attack() {
      self.ctx.cfg.consensus.attack_timeout
    } else {
      self.ctx.cfg.consensus.regular_timeout
    };
    let deadline = now + timeout;

    while self.pending.len() >= self.ctx.cfg.capacity.pending_max {
      let Some(oldest) = self.pending_fifo.pop_front() else {
        break;
      };
      if self.pending.contains_key(&oldest) {
        warn!("{} pending pool full, expiring {oldest:?}", self.me);
        self.commit(oldest, ConsensusStatus::TimedOut, now);
      }
    }

    debug!(
      "{} created {tx_id:?} for {}/{} fanout {}",
      self.me,
      obs.prefix,
      obs.origin,
      subset.len()
    );
    self.deadlines.insert((deadline, tx_id), ());
    self.pending_fifo.push_back(tx_id);
    self.pending.insert(tx_id, Round {
      tx: tx.clone(),
      observation: obs.clone(),
      deadline,
      subset: subset.clone(),
      responded: HashSet::new(),
    });
    self.ctx.fabric.broadcast(
      self.me,
      &subset,
      Message::VoteRequest(Box::new(tx)),
    );
  }

  /// Dispatches one fabric envelope.
  pub fn handle(&mut self, env: Envelope) {
    match env.msg {
      Message::VoteRequest(tx) => self.on_vote_request(env.from, *tx),
      Message::VoteResponse(vote) => self.on_vote_response(vote),
      Message::BlockReplicate(block) => {
        let _ = self.replica.apply_replicated(*block);
      }
      Message::AttackProposal(proposal) => {
        self.on_attack_proposal(env.from, *proposal)
      }
      Message::AttackVote(vote) => self.on_attack_vote(vote),
    }
  }

  fn on_vote_request(&mut self, from: Asn, tx: Transaction) {
    let now = self.ctx.clock.now();
    if self.committed.contains(&tx.tx_id) || self.voted.contains(&tx.tx_id) {
      debug!("{} ignoring duplicate vote request {:?}", self.me, tx.tx_id);
      return;
    }
    if tx.verify_merger_signature(&self.ctx.keyring).is_err() {
      self.counters.bad_signatures += 1;
      return;
    }
    let verdict = match self.kb.query(&tx.prefix, tx.origin, now) {
      KnowledgeVerdict::Approve => VoteVerdict::Approve,
      KnowledgeVerdict::Reject => VoteVerdict::Reject,
      KnowledgeVerdict::NoKnowledge => VoteVerdict::NoKnowledge,
    };
    let vote = Vote::new(&self.keypair, tx.tx_id, self.me, verdict, now);
    self.voted.insert(tx.tx_id);
    self.ctx.ledger.bump_participation(self.me);
    self
      .ctx
      .fabric
      .send(self.me, from, Message::VoteResponse(vote));
  }

  fn on_vote_response(&mut self, vote: Vote) {
    let now = self.ctx.clock.now();
    let threshold = self.ctx.registry.threshold();
    let Some(round) = self.pending.get_mut(&vote.tx_id) else {
      if self.committed.contains(&vote.tx_id) {
        // the round settled before this vote arrived
        self.counters.late_votes += 1;
      } else {
        self.counters.unknown_tx += 1;
      }
      return;
    };
    if !round.subset.contains(&vote.voter) {
      self.counters.unsolicited_votes += 1;
      return;
    }
    if round.responded.contains(&vote.voter) {
      self.counters.replay_votes += 1;
      return;
    }
    if vote.verify(&self.ctx.keyring).is_err() {
      self.counters.bad_signatures += 1;
      return;
    }
    round.responded.insert(vote.voter);
    round.tx.votes.push(vote.clone());
    if round.tx.approvals() >= threshold {
      self.commit(vote.tx_id, ConsensusStatus::Confirmed, now);
    }
  }

  /// Settles every pending round whose deadline has passed. Ties are
  /// processed in transaction-id order by construction of the key.
  pub fn on_deadlines(&mut self, now: LogicalTime) {
    while let Some((&(deadline, tx_id), ())) = self.deadlines.iter().next() {
      if deadline > now {
        break;
      }
      self.deadlines.remove(&(deadline, tx_id));
      let Some(round) = self.pending.get(&tx_id) else {
        continue;
      };
      let status = match round.tx.approvals() {
        n if n >= self.ctx.registry.threshold() => ConsensusStatus::Confirmed,
        0 => ConsensusStatus::SingleWitness,
        _ => ConsensusStatus::InsufficientConsensus,
      };
      self.commit(tx_id, status, now);
    }
    for settled in self.verdicts.expire_due(now) {
      self.finalize_verdict(settled, now);
    }
  }

  fn commit(&mut self, tx_id: TxId, status: ConsensusStatus, now: LogicalTime) {
    let Some(mut round) = self.pending.remove(&tx_id) else {
      return;
    };
    self.deadlines.remove(&(round.deadline, tx_id));
    round.tx.consensus_status = status;
    self.committed.insert(tx_id);
    self.counters.bump_status(status);
    self.ctx.metrics.record_committed(1);

    info!(
      "{} committed {tx_id:?} as {status} with {} approvals",
      self.me,
      round.tx.approvals()
    );

    if status == ConsensusStatus::Confirmed {
      if self
        .ctx
        .ledger
        .award(self.me, self.ctx.cfg.ledger.reward_block_commit)
        .is_err()
      {
        self.counters.award_failures += 1;
      }
      for vote in &round.tx.votes {
        if vote.verdict == VoteVerdict::Approve {
          if self
            .ctx
            .ledger
            .award(vote.voter, self.ctx.cfg.ledger.reward_vote_approve)
            .is_err()
          {
            self.counters.award_failures += 1;
          }
          self.ctx.ledger.bump_accuracy(vote.voter, true);
        }
      }
    }

    let tx = round.tx;
    let is_attack = tx.is_attack;
    let attack_kind = tx.attack_kind;
    let observation = round.observation;
    let committed_tx_id = tx.tx_id;
    if let Some(block) = self.ctx.store.submit_committed(tx, now) {
      self.replicate(block);
    }

    if is_attack {
      if let Some(kind) = attack_kind {
        self.open_verdict_round(committed_tx_id, observation, kind, now);
      }
    }
  }

  fn replicate(&mut self, block: crate::chain::Block) {
    // keep our own replica in lockstep with our own commits
    let _ = self.replica.apply_replicated(block.clone());
    for peer in &self.peers {
      self.ctx.fabric.send(
        self.me,
        *peer,
        Message::BlockReplicate(Box::new(block.clone())),
      );
    }
  }

  fn open_verdict_round(
    &mut self,
    tx_id: TxId,
    observation: Observation,
    kind: crate::detector::AttackKind,
    now: LogicalTime,
  ) {
    let verdict_id = TxId::derive(self.me, now, self.nonce);
    self.nonce += 1;
    let proposal = AttackProposal {
      verdict_id,
      proposer: self.me,
      tx_id,
      observation,
      kind,
      severity: kind.severity(),
      emitted_at: now,
    };
    let deadline = now + self.ctx.cfg.consensus.attack_timeout;
    self.verdicts.open_round(
      proposal.clone(),
      deadline,
      self.ctx.cfg.detection.attack_consensus_min_votes,
    );
    debug!("{} opened verdict round {verdict_id:?} for {kind}", self.me);
    self.ctx.fabric.broadcast(
      self.me,
      &self.peers,
      Message::AttackProposal(Box::new(proposal)),
    );
  }

  fn on_attack_proposal(&mut self, from: Asn, proposal: AttackProposal) {
    let now = self.ctx.clock.now();
    if !self.verdicts.mark_seen(proposal.verdict_id) {
      debug!("{} replayed proposal {:?}", self.me, proposal.verdict_id);
      return;
    }
    // vote from this node's own detector run over the proposed
    // observation; flap questions are answered from local history
    let agree = self.detector.peek(&proposal.observation).is_attack();
    let vote = AttackVote::new(
      &self.keypair,
      proposal.verdict_id,
      self.me,
      agree,
      now,
    );
    self.ctx.ledger.bump_participation(self.me);
    self
      .ctx
      .fabric
      .send(self.me, from, Message::AttackVote(vote));
  }

  fn on_attack_vote(&mut self, vote: AttackVote) {
    let now = self.ctx.clock.now();
    match self.verdicts.record_vote(vote, &self.ctx.keyring) {
      VerdictVoteOutcome::Settled(settled) => {
        self.finalize_verdict(*settled, now)
      }
      VerdictVoteOutcome::Pending => {}
      VerdictVoteOutcome::Replay => self.counters.replay_votes += 1,
      VerdictVoteOutcome::Late => self.counters.late_votes += 1,
      VerdictVoteOutcome::Unknown => self.counters.unknown_tx += 1,
      VerdictVoteOutcome::BadSignature => self.counters.bad_signatures += 1,
    }
  }

  fn finalize_verdict(&mut self, settled: SettledVerdict, now: LogicalTime) {
    let SettledVerdict { record, proposal } = settled;
    self.verdict_log.push(record.clone());
    match record.outcome {
      super::VerdictOutcome::Confirmed => {
        self.counters.verdicts_confirmed += 1;
        info!(
          "{} attack verdict CONFIRMED against {} ({}, {:.0}%)",
          self.me,
          record.attacker,
          record.attack_kind,
          record.confidence * 100.0
        );
        let mut verdict_tx = Transaction::create(
          &self.keypair,
          record.verdict_id,
          self.me,
          &proposal.observation,
          Some(record.attack_kind),
          now,
        );
        verdict_tx.consensus_status = ConsensusStatus::Confirmed;
        verdict_tx.verdict = Some(record.clone());
        let block = self.ctx.store.append_verdict(verdict_tx, now);
        self.replicate(block);

        if !self.ctx.registry.is_validator(record.attacker) {
          self
            .ctx
            .rating
            .apply_penalty(record.attacker, record.attack_kind, now);
        }
        if self
          .ctx
          .ledger
          .award(self.me, self.ctx.cfg.ledger.reward_attack_detection)
          .is_err()
        {
          self.counters.award_failures += 1;
        }
        self.ctx.ledger.bump_quality(self.me);
        let yes_voters = &record.voters[..record.yes_count as usize];
        for voter in yes_voters {
          if self
            .ctx
            .ledger
            .award(*voter, self.ctx.cfg.ledger.reward_vote_approve)
            .is_err()
          {
            self.counters.award_failures += 1;
          }
          self.ctx.ledger.bump_accuracy(*voter, true);
        }
      }
      super::VerdictOutcome::NotAttack => {
        self.counters.verdicts_not_attack += 1;
        // the network disagreed with this node's detector
        self.ctx.ledger.bump_accuracy(self.me, false);
      }
      super::VerdictOutcome::Disputed => {
        self.counters.verdicts_disputed += 1;
      }
    }
  }

  /// The next instant this engine needs waking for a deadline.
  pub fn next_wake(&self) -> Option<LogicalTime> {
    let tx_deadline = self.deadlines.keys().next().map(|(t, _)| *t);
    match (tx_deadline, self.verdicts.next_deadline()) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    }
  }

  /// Lazy eviction sweeps, driven from the runtime loop.
  pub fn housekeeping(&mut self, now: LogicalTime) {
    self.kb.maybe_cleanup(now);
    self.detector.gc(now);
  }

  /// True when no consensus or verdict round is still open.
  pub fn quiescent(&self) -> bool {
    self.pending.is_empty() && self.verdicts.open_rounds() == 0
  }

  pub fn finish(self) -> ValidatorOutcome {
    ValidatorOutcome {
      asn: self.me,
      detections: self.detections,
      verdicts: self.verdict_log,
      counters: self.counters,
      replica: self.replica.summary(),
      dedup_skips: self.dedup.skips(),
      kb_overflow_evictions: self.kb.overflow_evictions(),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{EngineContext, PopEngine},
    crate::{
      clock::{LogicalTime, Shutdown, SimClock},
      config::SimConfig,
      consensus::{Vote, VoteVerdict},
      dataset::{Classification, Observation, UpdateKind, VrpTable},
      fabric::{Envelope, Message, MessageFabric},
      ledger::TokenLedger,
      metrics::MetricsCollector,
      primitives::{Asn, IpPrefix, KeyRing, Keypair},
      rating::TrustRatingEngine,
      registry::NodeRegistry,
      chain::BlockStore,
    },
    rand::SeedableRng,
    rand_chacha::ChaCha20Rng,
    std::{collections::HashMap, sync::Arc},
  };

  struct Harness {
    ctx: EngineContext,
    keypairs: HashMap<Asn, Keypair>,
    #[allow(dead_code)]
    shutdown: Shutdown,
  }

  fn harness(validators: &[u32], cfg: SimConfig) -> Harness {
    let shutdown = Shutdown::new();
    let clock =
      Arc::new(SimClock::start(LogicalTime::from_secs(100), 1.0, &shutdown));
    let mut rng = ChaCha20Rng::seed_from_u64(cfg.simulation.seed);
    let keypairs: HashMap<Asn, Keypair> = validators
      .iter()
      .map(|v| (Asn(*v), Keypair::generate(&mut rng)))
      .collect();
    let keyring = Arc::new(KeyRing::new(
      keypairs.iter().map(|(asn, kp)| (*asn, kp.public())),
    ));
    let classification = Classification::new(
      validators.iter().copied().map(Asn),
      [Asn(100), Asn(999)],
    );
    let registry =
      Arc::new(NodeRegistry::new(&classification, &cfg.consensus));
    let fabric = MessageFabric::new(2, &shutdown);
    let store = BlockStore::new(LogicalTime::from_secs(100), 1);
    let ctx = EngineContext {
      cfg: Arc::new(cfg.clone()),
      clock,
      registry,
      keyring,
      fabric,
      store,
      ledger: TokenLedger::new(&cfg.ledger),
      rating: TrustRatingEngine::new(cfg.rating),
      metrics: MetricsCollector::new(),
      vrp: Arc::new(VrpTable::new([(
        "10.0.0.0/8".parse::<IpPrefix>().unwrap(),
        Asn(100),
      )])),
    };
    Harness {
      ctx,
      keypairs,
      shutdown,
    }
  }

  fn engine(h: &Harness, asn: u32) -> PopEngine {
    PopEngine::new(Asn(asn), h.keypairs[&Asn(asn)].clone(), h.ctx.clone())
  }

  fn obs(observer: u32, origin: u32, ts: u64) -> Observation {
    Observation {
      observer: Asn(observer),
      prefix: "10.0.0.0/8".parse().unwrap(),
      origin: Asn(origin),
      as_path: vec![Asn(observer), Asn(origin)],
      timestamp: LogicalTime::from_secs(ts),
      kind: UpdateKind::Announce,
      ground_truth_attack: false,
      attack_label: None,
    }
  }

  fn peer_vote(
    h: &Harness,
    engine: &PopEngine,
    voter: u32,
    verdict: VoteVerdict,
  ) -> Vote {
    let tx_id = *engine.pending.keys().next().unwrap();
    Vote::new(
      &h.keypairs[&Asn(voter)],
      tx_id,
      Asn(voter),
      verdict,
      LogicalTime::from_secs(101),
    )
  }

  #[tokio::test]
  async fn creation_registers_round_and_fans_out() {
    let h = harness(&[1, 2, 3, 4, 5, 6], SimConfig::default());
    let mut engine = engine(&h, 1);
    engine.submit_local(&obs(1, 100, 100));

    assert_eq!(engine.pending.len(), 1);
    assert!(engine.next_wake().is_some());
    // sampled five of the five available peers
    assert_eq!(h.ctx.fabric.stats().sent, 5);
    let round = engine.pending.values().next().unwrap();
    assert_eq!(round.subset.len(), 5);
    assert!(!round.subset.contains(&Asn(1)));
  }

  #[tokio::test]
  async fn signers_answer_from_their_knowledge_base() {
    let h = harness(&[1, 2, 3, 4, 5, 6], SimConfig::default());
    let mut merger = engine(&h, 1);
    let mut signer = engine(&h, 2);
    let mut merger_inbox = h.ctx.fabric.register(Asn(1));

    merger.submit_local(&obs(1, 100, 100));
    let request = merger.pending.values().next().unwrap().tx.clone();

    // no knowledge of the prefix yet
    signer.handle(Envelope {
      from: Asn(1),
      to: Asn(2),
      msg: Message::VoteRequest(Box::new(request.clone())),
    });
    let env = merger_inbox.recv().await.unwrap();
    let Message::VoteResponse(vote) = env.msg else {
      panic!("expected a vote response");
    };
    assert_eq!(vote.verdict, VoteVerdict::NoKnowledge);
    assert_eq!(vote.voter, Asn(2));

    // a second request is ignored entirely
    signer.handle(Envelope {
      from: Asn(1),
      to: Asn(2),
      msg: Message::VoteRequest(Box::new(request)),
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(merger_inbox.try_recv().is_err());
  }

  #[tokio::test]
  async fn approvals_at_threshold_commit_confirmed() {
    let h = harness(&[1, 2, 3, 4, 5, 6], SimConfig::default());
    let mut merger = engine(&h, 1);
    merger.submit_local(&obs(1, 100, 100));
    let subset = merger.pending.values().next().unwrap().subset.clone();

    for voter in &subset[..3] {
      let vote = peer_vote(&h, &merger, voter.0, VoteVerdict::Approve);
      merger.on_vote_response(vote);
    }
    assert!(merger.pending.is_empty());
    assert_eq!(merger.counters.confirmed, 1);
    assert_eq!(h.ctx.store.height(), 1);
    // the merger and every approving voter got paid
    assert!(h.ctx.ledger.balance_of(Asn(1)) >= 10);
    for voter in &subset[..3] {
      assert!(h.ctx.ledger.balance_of(*voter) >= 1);
    }
  }

  #[tokio::test]
  async fn replays_foreign_and_forged_votes_are_rejected() {
    let h = harness(&[1, 2, 3, 4, 5, 6], SimConfig::default());
    let mut merger = engine(&h, 1);
    merger.submit_local(&obs(1, 100, 100));
    let subset = merger.pending.values().next().unwrap().subset.clone();
    let voter = subset[0];

    let vote = peer_vote(&h, &merger, voter.0, VoteVerdict::Approve);
    merger.on_vote_response(vote.clone());
    // same voter again is a replay
    merger.on_vote_response(vote.clone());
    assert_eq!(merger.counters.replay_votes, 1);

    // vote claiming another identity fails verification
    let mut forged = peer_vote(&h, &merger, subset[1].0, VoteVerdict::Approve);
    forged.voter = subset[2];
    merger.on_vote_response(forged);
    assert_eq!(merger.counters.bad_signatures, 1);

    // vote for a transaction nobody asked about
    let mut stray = vote;
    stray.tx_id = super::TxId::derive(Asn(9), LogicalTime::from_secs(1), 9);
    merger.on_vote_response(stray);
    assert_eq!(merger.counters.unknown_tx, 1);

    let round = merger.pending.values().next().unwrap();
    assert_eq!(round.tx.approvals(), 1);
  }

  #[tokio::test]
  async fn deadline_settles_partial_and_silent_rounds() {
    let h = harness(&[1, 2, 3, 4, 5, 6], SimConfig::default());
    let mut merger = engine(&h, 1);
    // two distinct rounds, one with a single approval
    merger.submit_local(&obs(1, 100, 100));
    let first = *merger.pending.keys().next().unwrap();
    let vote = peer_vote(&h, &merger, merger.pending[&first].subset[0].0,
      VoteVerdict::Approve);
    merger.on_vote_response(vote);
    let mut second_obs = obs(1, 100, 100);
    second_obs.prefix = "10.1.0.0/16".parse().unwrap();
    merger.submit_local(&second_obs);

    merger.on_deadlines(LogicalTime::from_secs(9_999));
    assert!(merger.pending.is_empty());
    assert_eq!(merger.counters.insufficient_consensus, 1);
    assert_eq!(merger.counters.single_witness, 1);
    // both commits landed as blocks
    assert_eq!(h.ctx.store.height(), 2);

    // a vote arriving after settlement is late, not unknown
    let late = Vote::new(
      &h.keypairs[&Asn(2)],
      first,
      Asn(2),
      VoteVerdict::Approve,
      LogicalTime::from_secs(9_999),
    );
    merger.on_vote_response(late);
    assert_eq!(merger.counters.late_votes, 1);
  }

  #[tokio::test]
  async fn pending_overflow_expires_oldest_as_timed_out() {
    let mut cfg = SimConfig::default();
    cfg.capacity.pending_max = 2;
    let h = harness(&[1, 2, 3, 4, 5, 6], cfg);
    let mut merger = engine(&h, 1);

    for i in 0..3u32 {
      let mut o = obs(1, 100, 100 + i as u64);
      o.prefix = format!("10.{i}.0.0/16").parse().unwrap();
      merger.submit_local(&o);
    }
    assert_eq!(merger.pending.len(), 2);
    assert_eq!(merger.counters.timed_out, 1);
    assert_eq!(h.ctx.store.height(), 1);
  }
}

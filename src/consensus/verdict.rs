//! Attack verdict rounds
//!
//! When a committed transaction is flagged as an attack, the
//! committer opens a secondary majority-vote round: every other
//! validator re-runs its own detector over the same observation and
//! answers YES or NO. The round settles once enough votes arrive or
//! its deadline passes. Outcomes and their side effects (verdict
//! blocks, rating penalties, rewards) are applied by the engine; this
//! module owns the round bookkeeping.

use {
  super::tx::{AttackVerdictRecord, VerdictId, VerdictOutcome},
  crate::{
    clock::LogicalTime,
    dataset::Observation,
    detector::{AttackKind, Severity},
    primitives::{Asn, KeyRing, Keypair},
  },
  ed25519_dalek::{Signature, SignatureError},
  indexmap::IndexSet,
  serde::{Deserialize, Serialize},
  std::collections::{BTreeMap, HashMap, HashSet},
};

/// A committer's claim that `observation` was an attack, asking peers
/// to confirm from their own detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackProposal {
  pub verdict_id: VerdictId,
  pub proposer: Asn,
  /// The committed transaction this verdict refers to.
  pub tx_id: super::TxId,
  pub observation: Observation,
  pub kind: AttackKind,
  pub severity: Severity,
  pub emitted_at: LogicalTime,
}

/// A peer's signed yes/no answer. The signature covers
/// `(verdict_id, voter_as, agree)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackVote {
  pub verdict_id: VerdictId,
  pub voter: Asn,
  pub agree: bool,
  #[serde(with = "crate::primitives::b58::serde::signature")]
  pub signature: Signature,
  pub emitted_at: LogicalTime,
}

impl AttackVote {
  fn payload(verdict_id: &VerdictId, voter: Asn, agree: bool) -> Vec<u8> {
    let mut msg = Vec::with_capacity(37);
    msg.extend_from_slice(verdict_id.as_bytes());
    msg.extend_from_slice(&voter.to_be_bytes());
    msg.push(agree as u8);
    msg
  }

  pub fn new(
    keypair: &Keypair,
    verdict_id: VerdictId,
    voter: Asn,
    agree: bool,
    emitted_at: LogicalTime,
  ) -> Self {
    let signature = keypair.sign(&Self::payload(&verdict_id, voter, agree));
    Self {
      verdict_id,
      voter,
      agree,
      signature,
      emitted_at,
    }
  }

  pub fn verify(&self, ring: &KeyRing) -> Result<(), SignatureError> {
    ring.verify(
      self.voter,
      &Self::payload(&self.verdict_id, self.voter, self.agree),
      &self.signature,
    )
  }
}

/// A settled round handed back to the engine for side effects.
#[derive(Debug, Clone)]
pub struct SettledVerdict {
  pub record: AttackVerdictRecord,
  pub proposal: AttackProposal,
}

/// What happened to an incoming verdict vote.
#[derive(Debug)]
pub enum VerdictVoteOutcome {
  Settled(Box<SettledVerdict>),
  Pending,
  Replay,
  /// The round already settled; the vote arrived too late to count.
  Late,
  Unknown,
  BadSignature,
}

struct VerdictRound {
  proposal: AttackProposal,
  deadline: LogicalTime,
  yes: Vec<Asn>,
  no: Vec<Asn>,
  responded: HashSet<Asn>,
  min_votes: usize,
}

impl VerdictRound {
  fn settle(&self) -> SettledVerdict {
    let yes = self.yes.len() as u32;
    let no = self.no.len() as u32;
    let total = yes + no;
    let outcome = match yes.cmp(&no) {
      std::cmp::Ordering::Greater => VerdictOutcome::Confirmed,
      std::cmp::Ordering::Less => VerdictOutcome::NotAttack,
      std::cmp::Ordering::Equal => VerdictOutcome::Disputed,
    };
    let confidence = if total > 0 {
      yes.max(no) as f64 / total as f64
    } else {
      0.0
    };
    let victim_prefix = match self.proposal.kind {
      AttackKind::PrefixHijack | AttackKind::SubprefixHijack => {
        Some(self.proposal.observation.prefix)
      }
      _ => None,
    };
    SettledVerdict {
      record: AttackVerdictRecord {
        verdict_id: self.proposal.verdict_id,
        attack_kind: self.proposal.kind,
        severity: self.proposal.severity,
        attacker: self.proposal.observation.origin,
        victim_prefix,
        proposer: self.proposal.proposer,
        yes_count: yes,
        no_count: no,
        voters: self.yes.iter().chain(self.no.iter()).copied().collect(),
        confidence,
        outcome,
      },
      proposal: self.proposal.clone(),
    }
  }
}

/// Proposer-side round table plus the verdict-id dedup set shared by
/// both roles.
pub struct VerdictManager {
  rounds: HashMap<VerdictId, VerdictRound>,
  deadlines: BTreeMap<(LogicalTime, VerdictId), ()>,
  seen: IndexSet<VerdictId>,
  seen_cap: usize,
}

impl VerdictManager {
  pub fn new(seen_cap: usize) -> Self {
    Self {
      rounds: HashMap::new(),
      deadlines: BTreeMap::new(),
      seen: IndexSet::new(),
      seen_cap: seen_cap.max(1),
    }
  }

  /// Marks a verdict id as seen; false means it was already known
  /// and the caller should treat the proposal as a replay.
  pub fn mark_seen(&mut self, id: VerdictId) -> bool {
    let fresh = self.seen.insert(id);
    while self.seen.len() > self.seen_cap {
      self.seen.shift_remove_index(0);
    }
    fresh
  }

  /// Opens a round on the proposer. The proposal's own id is marked
  /// seen.
  pub fn open_round(
    &mut self,
    proposal: AttackProposal,
    deadline: LogicalTime,
    min_votes: usize,
  ) {
    self.mark_seen(proposal.verdict_id);
    self.deadlines.insert((deadline, proposal.verdict_id), ());
    self.rounds.insert(proposal.verdict_id, VerdictRound {
      proposal,
      deadline,
      yes: Vec::new(),
      no: Vec::new(),
      responded: HashSet::new(),
      min_votes,
    });
  }

  pub fn record_vote(
    &mut self,
    vote: AttackVote,
    ring: &KeyRing,
  ) -> VerdictVoteOutcome {
    let Some(round) = self.rounds.get_mut(&vote.verdict_id) else {
      return if self.seen.contains(&vote.verdict_id) {
        VerdictVoteOutcome::Late
      } else {
        VerdictVoteOutcome::Unknown
      };
    };
    if round.responded.contains(&vote.voter) {
      return VerdictVoteOutcome::Replay;
    }
    if vote.verify(ring).is_err() {
      return VerdictVoteOutcome::BadSignature;
    }
    round.responded.insert(vote.voter);
    if vote.agree {
      round.yes.push(vote.voter);
    } else {
      round.no.push(vote.voter);
    }
    if round.yes.len() + round.no.len() >= round.min_votes {
      let settled = round.settle();
      let deadline = round.deadline;
      self.rounds.remove(&vote.verdict_id);
      self.deadlines.remove(&(deadline, vote.verdict_id));
      return VerdictVoteOutcome::Settled(Box::new(settled));
    }
    VerdictVoteOutcome::Pending
  }

  /// Settles every round whose deadline has passed, in deadline
  /// order with verdict-id tie breaking.
  pub fn expire_due(&mut self, now: LogicalTime) -> Vec<SettledVerdict> {
    let mut settled = Vec::new();
    while let Some((&(deadline, id), ())) = self.deadlines.iter().next() {
      if deadline > now {
        break;
      }
      self.deadlines.remove(&(deadline, id));
      if let Some(round) = self.rounds.remove(&id) {
        settled.push(round.settle());
      }
    }
    settled
  }

  pub fn next_deadline(&self) -> Option<LogicalTime> {
    self.deadlines.keys().next().map(|(deadline, _)| *deadline)
  }

  pub fn open_rounds(&self) -> usize {
    self.rounds.len()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{AttackProposal, AttackVote, VerdictManager, VerdictVoteOutcome},
    crate::{
      clock::LogicalTime,
      consensus::{TxId, VerdictOutcome},
      dataset::{Observation, UpdateKind},
      detector::AttackKind,
      primitives::{Asn, KeyRing, Keypair},
    },
    rand::SeedableRng,
    rand_chacha::ChaCha20Rng,
  };

  fn t(secs: u64) -> LogicalTime {
    LogicalTime::from_secs(secs)
  }

  fn setup() -> (Vec<Keypair>, KeyRing) {
    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let keypairs: Vec<Keypair> =
      (0..4).map(|_| Keypair::generate(&mut rng)).collect();
    let ring = KeyRing::new(
      keypairs
        .iter()
        .enumerate()
        .map(|(i, kp)| (Asn(i as u32 + 1), kp.public())),
    );
    (keypairs, ring)
  }

  fn proposal(id_nonce: u64) -> AttackProposal {
    let observation = Observation {
      observer: Asn(1),
      prefix: "10.0.0.0/8".parse().unwrap(),
      origin: Asn(999),
      as_path: vec![Asn(1), Asn(999)],
      timestamp: t(100),
      kind: UpdateKind::Announce,
      ground_truth_attack: true,
      attack_label: Some("prefix_hijack".into()),
    };
    AttackProposal {
      verdict_id: TxId::derive(Asn(1), t(100), id_nonce),
      proposer: Asn(1),
      tx_id: TxId::derive(Asn(1), t(100), 1000 + id_nonce),
      observation,
      kind: AttackKind::PrefixHijack,
      severity: AttackKind::PrefixHijack.severity(),
      emitted_at: t(100),
    }
  }

  #[test]
  fn majority_yes_confirms_with_confidence() {
    let (keypairs, ring) = setup();
    let mut manager = VerdictManager::new(100);
    let p = proposal(0);
    let id = p.verdict_id;
    manager.open_round(p, t(105), 3);

    for (i, agree) in [(1usize, true), (2, true)] {
      let vote =
        AttackVote::new(&keypairs[i], id, Asn(i as u32 + 1), agree, t(101));
      assert!(matches!(
        manager.record_vote(vote, &ring),
        VerdictVoteOutcome::Pending
      ));
    }
    let vote = AttackVote::new(&keypairs[3], id, Asn(4), false, t(102));
    let VerdictVoteOutcome::Settled(settled) =
      manager.record_vote(vote, &ring)
    else {
      panic!("expected settlement at min votes");
    };
    assert_eq!(settled.record.outcome, VerdictOutcome::Confirmed);
    assert_eq!(settled.record.yes_count, 2);
    assert_eq!(settled.record.no_count, 1);
    assert!((settled.record.confidence - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(settled.record.attacker, Asn(999));
    assert_eq!(manager.open_rounds(), 0);
  }

  #[test]
  fn deadline_settles_partial_rounds() {
    let (keypairs, ring) = setup();
    let mut manager = VerdictManager::new(100);
    let p = proposal(0);
    let id = p.verdict_id;
    manager.open_round(p, t(105), 3);
    let vote = AttackVote::new(&keypairs[1], id, Asn(2), false, t(101));
    manager.record_vote(vote, &ring);

    assert!(manager.expire_due(t(104)).is_empty());
    let settled = manager.expire_due(t(105));
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].record.outcome, VerdictOutcome::NotAttack);
    assert_eq!(manager.next_deadline(), None);
  }

  #[test]
  fn zero_votes_settle_disputed() {
    let (_, _) = setup();
    let mut manager = VerdictManager::new(100);
    manager.open_round(proposal(0), t(105), 3);
    let settled = manager.expire_due(t(200));
    assert_eq!(settled[0].record.outcome, VerdictOutcome::Disputed);
    assert_eq!(settled[0].record.confidence, 0.0);
  }

  #[test]
  fn duplicate_and_unknown_votes_are_flagged() {
    let (keypairs, ring) = setup();
    let mut manager = VerdictManager::new(100);
    let p = proposal(0);
    let id = p.verdict_id;
    manager.open_round(p, t(105), 5);

    let vote = AttackVote::new(&keypairs[1], id, Asn(2), true, t(101));
    assert!(matches!(
      manager.record_vote(vote.clone(), &ring),
      VerdictVoteOutcome::Pending
    ));
    assert!(matches!(
      manager.record_vote(vote, &ring),
      VerdictVoteOutcome::Replay
    ));

    let stray = AttackVote::new(
      &keypairs[2],
      TxId::derive(Asn(9), t(1), 9),
      Asn(3),
      true,
      t(101),
    );
    assert!(matches!(
      manager.record_vote(stray, &ring),
      VerdictVoteOutcome::Unknown
    ));
  }

  #[test]
  fn forged_votes_are_rejected() {
    let (keypairs, ring) = setup();
    let mut manager = VerdictManager::new(100);
    let p = proposal(0);
    let id = p.verdict_id;
    manager.open_round(p, t(105), 2);
    // vote signed by keypair 1 but claiming to be AS3
    let mut vote = AttackVote::new(&keypairs[1], id, Asn(2), true, t(101));
    vote.voter = Asn(3);
    assert!(matches!(
      manager.record_vote(vote, &ring),
      VerdictVoteOutcome::BadSignature
    ));
  }

  #[test]
  fn verdict_ids_deduplicate() {
    let mut manager = VerdictManager::new(2);
    let a = TxId::derive(Asn(1), t(1), 0);
    assert!(manager.mark_seen(a));
    assert!(!manager.mark_seen(a));
    // FIFO-bounded: old ids age out
    manager.mark_seen(TxId::derive(Asn(1), t(1), 1));
    manager.mark_seen(TxId::derive(Asn(1), t(1), 2));
    assert!(manager.mark_seen(a));
  }
}

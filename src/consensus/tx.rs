use {
  crate::{
    clock::LogicalTime,
    dataset::Observation,
    detector::{AttackKind, Severity},
    primitives::{Asn, IpPrefix, KeyRing, Keypair},
  },
  ed25519_dalek::{Signature, SignatureError},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  sha2::{Digest, Sha256},
  std::fmt::{Debug, Display},
};

/// Globally unique transaction identifier, assigned by the merger as
/// a hash over its own AS number, the observation timestamp and a
/// local nonce. Verdict rounds reuse the same identifier space.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId([u8; 32]);

pub type VerdictId = TxId;

impl TxId {
  pub fn derive(merger: Asn, observed_at: LogicalTime, nonce: u64) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(merger.to_be_bytes());
    hasher.update(observed_at.as_millis().to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    Self(hasher.finalize().into())
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl Display for TxId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl Debug for TxId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "TxId({}..)", &self.to_hex()[..12])
  }
}

impl Serialize for TxId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for TxId {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(&s).map_err(de::Error::custom)?;
    let bytes: [u8; 32] = bytes
      .try_into()
      .map_err(|_| de::Error::custom("expected 32 hex-encoded bytes"))?;
    Ok(Self(bytes))
  }
}

/// Where a transaction ended up after its consensus round.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
  Pending,
  Confirmed,
  InsufficientConsensus,
  SingleWitness,
  TimedOut,
}

impl Display for ConsensusStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ConsensusStatus::Pending => "PENDING",
      ConsensusStatus::Confirmed => "CONFIRMED",
      ConsensusStatus::InsufficientConsensus => "INSUFFICIENT_CONSENSUS",
      ConsensusStatus::SingleWitness => "SINGLE_WITNESS",
      ConsensusStatus::TimedOut => "TIMED_OUT",
    };
    f.write_str(name)
  }
}

/// A signer's answer to a vote request. Only approvals count toward
/// the commit threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteVerdict {
  Approve,
  NoKnowledge,
  Reject,
}

impl VoteVerdict {
  /// Stable byte tag included in the signed payload.
  pub fn code(&self) -> u8 {
    match self {
      VoteVerdict::Approve => 1,
      VoteVerdict::NoKnowledge => 2,
      VoteVerdict::Reject => 3,
    }
  }
}

/// A signed vote on a transaction. The signature covers
/// `(tx_id, voter_as, verdict_code)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
  pub tx_id: TxId,
  pub voter: Asn,
  pub verdict: VoteVerdict,
  #[serde(with = "crate::primitives::b58::serde::signature")]
  pub signature: Signature,
  pub emitted_at: LogicalTime,
}

impl Vote {
  fn payload(tx_id: &TxId, voter: Asn, verdict: VoteVerdict) -> Vec<u8> {
    let mut msg = Vec::with_capacity(37);
    msg.extend_from_slice(tx_id.as_bytes());
    msg.extend_from_slice(&voter.to_be_bytes());
    msg.push(verdict.code());
    msg
  }

  pub fn new(
    keypair: &Keypair,
    tx_id: TxId,
    voter: Asn,
    verdict: VoteVerdict,
    emitted_at: LogicalTime,
  ) -> Self {
    let signature = keypair.sign(&Self::payload(&tx_id, voter, verdict));
    Self {
      tx_id,
      voter,
      verdict,
      signature,
      emitted_at,
    }
  }

  pub fn verify(&self, ring: &KeyRing) -> Result<(), SignatureError> {
    ring.verify(
      self.voter,
      &Self::payload(&self.tx_id, self.voter, self.verdict),
      &self.signature,
    )
  }
}

fn merger_payload(
  tx_id: &TxId,
  merger: Asn,
  prefix: &IpPrefix,
  origin: Asn,
  observed_at: LogicalTime,
) -> Vec<u8> {
  let mut msg = Vec::new();
  msg.extend_from_slice(tx_id.as_bytes());
  msg.extend_from_slice(&merger.to_be_bytes());
  msg.extend_from_slice(prefix.canonical().as_bytes());
  msg.extend_from_slice(&origin.to_be_bytes());
  msg.extend_from_slice(&observed_at.as_millis().to_be_bytes());
  msg
}

/// Majority-vote outcome over a detected attack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictOutcome {
  Confirmed,
  NotAttack,
  Disputed,
}

/// The payload of an `attack_verdict` block entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackVerdictRecord {
  pub verdict_id: VerdictId,
  pub attack_kind: AttackKind,
  pub severity: Severity,
  pub attacker: Asn,
  pub victim_prefix: Option<IpPrefix>,
  pub proposer: Asn,
  pub yes_count: u32,
  pub no_count: u32,
  pub voters: Vec<Asn>,
  /// `majority_votes / total_votes`, zero when nobody voted.
  pub confidence: f64,
  pub outcome: VerdictOutcome,
}

/// A route observation lifted into consensus by its merger.
///
/// Until its round settles the transaction lives exclusively in the
/// merger's pending pool. After the status is stamped it is immutable
/// and resides, together with its block, in the block store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
  pub tx_id: TxId,
  pub merger: Asn,
  pub observer: Asn,
  pub prefix: IpPrefix,
  pub origin: Asn,
  pub as_path: Vec<Asn>,
  pub observation_timestamp: LogicalTime,
  pub created_at: LogicalTime,
  pub is_attack: bool,
  pub attack_kind: Option<AttackKind>,
  #[serde(with = "crate::primitives::b58::serde::signature")]
  pub merger_signature: Signature,
  pub votes: Vec<Vote>,
  pub consensus_status: ConsensusStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub verdict: Option<AttackVerdictRecord>,
}

impl Transaction {
  /// Builds a fresh pending transaction from a local observation and
  /// signs it with the merger's key.
  pub fn create(
    keypair: &Keypair,
    tx_id: TxId,
    merger: Asn,
    obs: &Observation,
    attack_kind: Option<AttackKind>,
    created_at: LogicalTime,
  ) -> Self {
    let merger_signature = keypair.sign(&merger_payload(
      &tx_id,
      merger,
      &obs.prefix,
      obs.origin,
      obs.timestamp,
    ));
    Self {
      tx_id,
      merger,
      observer: obs.observer,
      prefix: obs.prefix,
      origin: obs.origin,
      as_path: obs.as_path.clone(),
      observation_timestamp: obs.timestamp,
      created_at,
      is_attack: attack_kind.is_some(),
      attack_kind,
      merger_signature,
      votes: Vec::new(),
      consensus_status: ConsensusStatus::Pending,
      verdict: None,
    }
  }

  /// Canonical merger-signed payload:
  /// `(tx_id, merger_as, prefix, origin_asn, observation_timestamp)`.
  pub fn signing_payload(&self) -> Vec<u8> {
    merger_payload(
      &self.tx_id,
      self.merger,
      &self.prefix,
      self.origin,
      self.observation_timestamp,
    )
  }

  pub fn verify_merger_signature(
    &self,
    ring: &KeyRing,
  ) -> Result<(), SignatureError> {
    ring.verify(self.merger, &self.signing_payload(), &self.merger_signature)
  }

  /// Full field-ordered encoding hashed into merkle leaves.
  pub fn canonical_bytes(&self) -> Vec<u8> {
    let mut buf = self.signing_payload();
    buf.extend_from_slice(&self.observer.to_be_bytes());
    for hop in &self.as_path {
      buf.extend_from_slice(&hop.to_be_bytes());
    }
    buf.extend_from_slice(&self.created_at.as_millis().to_be_bytes());
    buf.push(self.is_attack as u8);
    buf.push(self.attack_kind.map(|k| k.code()).unwrap_or(0));
    buf.extend_from_slice(&self.merger_signature.to_bytes());
    buf.extend_from_slice(self.consensus_status.to_string().as_bytes());
    for vote in &self.votes {
      buf.extend_from_slice(&vote.voter.to_be_bytes());
      buf.push(vote.verdict.code());
      buf.extend_from_slice(&vote.signature.to_bytes());
    }
    if let Some(verdict) = &self.verdict {
      buf.extend_from_slice(verdict.verdict_id.as_bytes());
      buf.push(verdict.attack_kind.code());
      buf.extend_from_slice(&verdict.attacker.to_be_bytes());
      buf.extend_from_slice(&verdict.yes_count.to_be_bytes());
      buf.extend_from_slice(&verdict.no_count.to_be_bytes());
    }
    buf
  }

  pub fn approvals(&self) -> usize {
    self
      .votes
      .iter()
      .filter(|v| v.verdict == VoteVerdict::Approve)
      .count()
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{ConsensusStatus, Transaction, TxId, Vote, VoteVerdict},
    crate::{
      clock::LogicalTime,
      dataset::{Observation, UpdateKind},
      primitives::{Asn, KeyRing, Keypair},
    },
    rand::SeedableRng,
    rand_chacha::ChaCha20Rng,
  };

  fn keypair(seed: u64) -> Keypair {
    Keypair::generate(&mut ChaCha20Rng::seed_from_u64(seed))
  }

  fn observation() -> Observation {
    Observation {
      observer: Asn(1),
      prefix: "10.0.0.0/8".parse().unwrap(),
      origin: Asn(100),
      as_path: vec![Asn(1), Asn(100)],
      timestamp: LogicalTime::from_secs(100),
      kind: UpdateKind::Announce,
      ground_truth_attack: false,
      attack_label: None,
    }
  }

  #[test]
  fn tx_ids_are_unique_per_nonce() {
    let at = LogicalTime::from_secs(100);
    let a = TxId::derive(Asn(1), at, 0);
    let b = TxId::derive(Asn(1), at, 1);
    let c = TxId::derive(Asn(2), at, 0);
    assert_ne!(a, b);
    assert_ne!(a, c);
    // same inputs, same id
    assert_eq!(a, TxId::derive(Asn(1), at, 0));
  }

  #[test]
  fn merger_signature_verifies() {
    let kp = keypair(1);
    let ring = KeyRing::new([(Asn(1), kp.public())]);
    let tx_id = TxId::derive(Asn(1), LogicalTime::from_secs(100), 0);
    let tx = Transaction::create(
      &kp,
      tx_id,
      Asn(1),
      &observation(),
      None,
      LogicalTime::from_secs(100),
    );
    assert_eq!(tx.consensus_status, ConsensusStatus::Pending);
    assert!(tx.verify_merger_signature(&ring).is_ok());

    let mut forged = tx.clone();
    forged.origin = Asn(999);
    assert!(forged.verify_merger_signature(&ring).is_err());
  }

  #[test]
  fn vote_signature_binds_verdict() {
    let kp = keypair(2);
    let ring = KeyRing::new([(Asn(3), kp.public())]);
    let tx_id = TxId::derive(Asn(1), LogicalTime::from_secs(100), 0);
    let vote = Vote::new(
      &kp,
      tx_id,
      Asn(3),
      VoteVerdict::Approve,
      LogicalTime::from_secs(101),
    );
    assert!(vote.verify(&ring).is_ok());

    let mut flipped = vote.clone();
    flipped.verdict = VoteVerdict::Reject;
    assert!(flipped.verify(&ring).is_err());
  }

  #[test]
  fn tx_id_serde_is_hex() {
    let tx_id = TxId::derive(Asn(1), LogicalTime::from_secs(100), 0);
    let json = serde_json::to_string(&tx_id).unwrap();
    assert_eq!(json.trim_matches('"'), tx_id.to_hex());
    let back: TxId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, tx_id);
  }
}

use {
  crate::{clock::LogicalTime, consensus::Transaction},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  sha2::{Digest, Sha256},
  std::fmt::{Debug, Display},
};

/// SHA-256 digest of a block header or merkle node, rendered as
/// lowercase hex everywhere it surfaces.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
  pub const ZERO: BlockHash = BlockHash([0u8; 32]);

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl From<[u8; 32]> for BlockHash {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

impl Display for BlockHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl Debug for BlockHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlockHash({}..)", &self.to_hex()[..12])
  }
}

impl Serialize for BlockHash {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for BlockHash {
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

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
  Genesis,
  Transaction,
  Batch,
  AttackVerdict,
}

impl BlockType {
  /// Stable tag hashed into the block header.
  pub fn tag(&self) -> &'static str {
    match self {
      BlockType::Genesis => "genesis",
      BlockType::Transaction => "transaction",
      BlockType::Batch => "batch",
      BlockType::AttackVerdict => "attack_verdict",
    }
  }
}

impl Display for BlockType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.tag())
  }
}

mod rfc3339_ts {
  use {
    super::LogicalTime,
    chrono::{DateTime, Utc},
    serde::{de, Deserialize, Deserializer, Serializer},
  };

  pub fn serialize<S: Serializer>(
    ts: &LogicalTime,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<LogicalTime, D::Error> {
    let s = String::deserialize(deserializer)?;
    let dt: DateTime<Utc> = s
      .parse()
      .map_err(|e| de::Error::custom(format!("bad timestamp: {e}")))?;
    Ok(LogicalTime::from_millis(dt.timestamp_millis().max(0) as u64))
  }
}

/// One link of the hash chain.
///
/// The serialized form is the canonical block encoding: keys in
/// declaration order, hashes as lowercase hex, the timestamp as
/// RFC 3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
  pub block_number: u64,
  #[serde(with = "rfc3339_ts")]
  pub timestamp: LogicalTime,
  pub previous_hash: BlockHash,
  pub merkle_root: BlockHash,
  pub block_hash: BlockHash,
  pub block_type: BlockType,
  pub transactions: Vec<Transaction>,
}

impl Block {
  /// Block 0. Fixed shape: zero previous hash, empty transaction
  /// list.
  pub fn genesis(created_at: LogicalTime) -> Self {
    Self::build(0, BlockHash::ZERO, BlockType::Genesis, vec![], created_at)
  }

  /// Computes the merkle root and header hash for a new block at
  /// `block_number` on top of `previous_hash`.
  pub fn build(
    block_number: u64,
    previous_hash: BlockHash,
    block_type: BlockType,
    transactions: Vec<Transaction>,
    created_at: LogicalTime,
  ) -> Self {
    let merkle_root = merkle_root(&transactions);
    let block_hash = header_hash(
      block_number,
      &previous_hash,
      &merkle_root,
      created_at,
      block_type,
    );
    Self {
      block_number,
      timestamp: created_at,
      previous_hash,
      merkle_root,
      block_hash,
      block_type,
      transactions,
    }
  }

  /// Recomputes the header hash from the stored fields.
  pub fn expected_hash(&self) -> BlockHash {
    header_hash(
      self.block_number,
      &self.previous_hash,
      &self.merkle_root,
      self.timestamp,
      self.block_type,
    )
  }

  /// Recomputes the merkle root from the stored transactions.
  pub fn expected_merkle_root(&self) -> BlockHash {
    merkle_root(&self.transactions)
  }

  /// The canonical JSON encoding of this block.
  pub fn to_canonical_json(&self) -> String {
    serde_json::to_string_pretty(self).expect("block encoding is infallible")
  }
}

impl Display for Block {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "block {} [{}] {}",
      self.block_number,
      self.block_type,
      &self.block_hash.to_hex()[..12]
    )
  }
}

/// `H(block_number || prev_hash || merkle_root || created_at ||
/// block_type)`.
fn header_hash(
  block_number: u64,
  previous_hash: &BlockHash,
  merkle_root: &BlockHash,
  created_at: LogicalTime,
  block_type: BlockType,
) -> BlockHash {
  let mut hasher = Sha256::new();
  hasher.update(block_number.to_be_bytes());
  hasher.update(previous_hash.as_bytes());
  hasher.update(merkle_root.as_bytes());
  hasher.update(created_at.as_millis().to_be_bytes());
  hasher.update(block_type.tag().as_bytes());
  BlockHash(hasher.finalize().into())
}

/// Root of a binary SHA-256 merkle tree over the canonical
/// transaction encodings. An odd trailing node is paired with itself;
/// the empty tree has a zero root.
pub fn merkle_root(transactions: &[Transaction]) -> BlockHash {
  if transactions.is_empty() {
    return BlockHash::ZERO;
  }
  let mut level: Vec<[u8; 32]> = transactions
    .iter()
    .map(|tx| Sha256::digest(tx.canonical_bytes()).into())
    .collect();
  while level.len() > 1 {
    let mut next = Vec::with_capacity((level.len() + 1) / 2);
    for pair in level.chunks(2) {
      let mut hasher = Sha256::new();
      hasher.update(pair[0]);
      hasher.update(pair.get(1).unwrap_or(&pair[0]));
      next.push(hasher.finalize().into());
    }
    level = next;
  }
  BlockHash(level[0])
}

use {
  super::Asn,
  ed25519_dalek::{PublicKey, SecretKey, Signature, SignatureError, Signer, Verifier},
  rand::RngCore,
  serde::{de, Deserialize, Deserializer, Serialize},
  std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

/// The public half of a validator signing identity.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
  pub fn verify(
    &self,
    message: &[u8],
    signature: &Signature,
  ) -> Result<(), SignatureError> {
    PublicKey::from_bytes(&self.0)?.verify(message, signature)
  }
}

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl FromStr for Pubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e| de::Error::custom(format!("{e:?}")))
  }
}

/// A validator signing identity generated at startup and kept in RAM
/// for the duration of the run.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  /// Generates a fresh keypair from the given RNG. Seeded RNGs make
  /// the whole key ring reproducible across runs.
  pub fn generate<R: RngCore>(rng: &mut R) -> Self {
    let mut seed = [0u8; 32];
    rng.fill_bytes(&mut seed);
    Self::from_seed(&seed).expect("32 bytes are always a valid secret key")
  }

  pub fn from_seed(seed: &[u8; 32]) -> Result<Self, KeypairError> {
    let secret = SecretKey::from_bytes(seed)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }

  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn sign(&self, message: &[u8]) -> Signature {
    self.0.sign(message)
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.0.public).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Keypair({})",
      bs58::encode(self.0.public.as_bytes()).into_string()
    )
  }
}

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("failed parsing base58 string: {0:?}")]
  Base58ParseError(bs58::decode::Error),

  #[error("{0}")]
  Ed25519Error(#[from] ed25519_dalek::ed25519::Error),
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let mut seed = [0u8; 32];
    bs58::decode(value)
      .into(&mut seed)
      .map_err(KeypairError::Base58ParseError)?;
    Self::from_seed(&seed)
  }
}

/// The directory of validator public keys, shared read-only by every
/// node so vote and proposal signatures can be checked against the
/// claimed sender.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
  keys: HashMap<Asn, Pubkey>,
}

impl KeyRing {
  pub fn new(keys: impl IntoIterator<Item = (Asn, Pubkey)>) -> Self {
    Self {
      keys: keys.into_iter().collect(),
    }
  }

  pub fn pubkey_of(&self, asn: Asn) -> Option<&Pubkey> {
    self.keys.get(&asn)
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Verifies a signature claimed by `asn` over `message`.
  pub fn verify(
    &self,
    asn: Asn,
    message: &[u8],
    signature: &Signature,
  ) -> Result<(), SignatureError> {
    match self.keys.get(&asn) {
      Some(pk) => pk.verify(message, signature),
      None => Err(SignatureError::new()),
    }
  }
}

pub trait ToBase58String {
  fn to_b58(&self) -> String;
}

impl ToBase58String for ed25519_dalek::Signature {
  fn to_b58(&self) -> String {
    bs58::encode(self.to_bytes()).into_string()
  }
}

impl ToBase58String for &[u8] {
  fn to_b58(&self) -> String {
    bs58::encode(self).into_string()
  }
}

impl ToBase58String for [u8; 32] {
  fn to_b58(&self) -> String {
    bs58::encode(self).into_string()
  }
}

/// Serde adapters that render binary crypto material as base58
/// strings in JSON outputs instead of byte arrays.
pub mod serde {
  pub mod signature {
    use {
      ed25519_dalek::Signature,
      serde::{de, Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S: Serializer>(
      sig: &Signature,
      serializer: S,
    ) -> Result<S::Ok, S::Error> {
      serializer.serialize_str(&bs58::encode(sig.to_bytes()).into_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
      deserializer: D,
    ) -> Result<Signature, D::Error> {
      let s = String::deserialize(deserializer)?;
      let bytes = bs58::decode(&s)
        .into_vec()
        .map_err(|e| de::Error::custom(format!("{e:?}")))?;
      Signature::try_from(bytes.as_slice())
        .map_err(|e| de::Error::custom(format!("{e:?}")))
    }
  }
}

use {
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display},
    num::ParseIntError,
    str::FromStr,
  },
};

/// An Autonomous System number.
///
/// ASNs identify every participant of the monitored routing system:
/// validators, observers and the origins of announcements under
/// scrutiny. They are plain 32-bit numbers on the wire, so the
/// newtype exists only to keep them from being confused with other
/// integers in signatures and map keys.
#[derive(
  Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Asn(pub u32);

impl Asn {
  pub fn to_be_bytes(self) -> [u8; 4] {
    self.0.to_be_bytes()
  }
}

impl Display for Asn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "AS{}", self.0)
  }
}

impl Debug for Asn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "AS{}", self.0)
  }
}

impl From<u32> for Asn {
  fn from(n: u32) -> Self {
    Self(n)
  }
}

impl FromStr for Asn {
  type Err = ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let digits = s.strip_prefix("AS").unwrap_or(s);
    Ok(Self(digits.parse()?))
  }
}

use {
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
  },
  thiserror::Error,
};

/// An IP prefix in CIDR notation, the unit of every route
/// announcement, VRP authorization and bogon range in the system.
///
/// Host bits below the mask are normalized to zero on construction,
/// so two prefixes compare equal iff they describe the same address
/// block. Both IPv4 and IPv6 are supported; the relations used by
/// the attack detector (`covers`, `is_more_specific_than`,
/// `overlaps`) never mix the two families.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
  addr: IpAddr,
  len: u8,
}

#[derive(Debug, Error)]
pub enum PrefixParseError {
  #[error("missing '/' separator in prefix")]
  MissingSeparator,

  #[error("invalid address: {0}")]
  InvalidAddress(#[from] std::net::AddrParseError),

  #[error("invalid prefix length: {0}")]
  InvalidLength(String),
}

impl IpPrefix {
  pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixParseError> {
    let max = match addr {
      IpAddr::V4(_) => 32,
      IpAddr::V6(_) => 128,
    };
    if len > max {
      return Err(PrefixParseError::InvalidLength(format!(
        "/{len} exceeds /{max}"
      )));
    }
    Ok(Self {
      addr: mask_addr(addr, len),
      len,
    })
  }

  pub fn len(&self) -> u8 {
    self.len
  }

  pub fn addr(&self) -> IpAddr {
    self.addr
  }

  /// True when `other` is equal to this prefix or lies entirely
  /// inside it. Always false across address families.
  pub fn covers(&self, other: &IpPrefix) -> bool {
    if self.len > other.len {
      return false;
    }
    match (self.addr, other.addr) {
      (IpAddr::V4(a), IpAddr::V4(b)) => {
        mask_v4(b, self.len) == a
      }
      (IpAddr::V6(a), IpAddr::V6(b)) => {
        mask_v6(b, self.len) == a
      }
      _ => false,
    }
  }

  /// Strictly-more-specific relation: `self` lies inside `other`
  /// and has a longer mask.
  pub fn is_more_specific_than(&self, other: &IpPrefix) -> bool {
    self.len > other.len && other.covers(self)
  }

  /// Two prefixes overlap when either contains the other.
  pub fn overlaps(&self, other: &IpPrefix) -> bool {
    self.covers(other) || other.covers(self)
  }

  /// Canonical textual form, used in signature payloads and the
  /// block encoding.
  pub fn canonical(&self) -> String {
    format!("{}/{}", self.addr, self.len)
  }
}

fn mask_v4(addr: Ipv4Addr, len: u8) -> Ipv4Addr {
  if len == 0 {
    return Ipv4Addr::UNSPECIFIED;
  }
  let raw = u32::from(addr);
  let mask = u32::MAX << (32 - len as u32);
  Ipv4Addr::from(raw & mask)
}

fn mask_v6(addr: Ipv6Addr, len: u8) -> Ipv6Addr {
  if len == 0 {
    return Ipv6Addr::UNSPECIFIED;
  }
  let raw = u128::from(addr);
  let mask = u128::MAX << (128 - len as u32);
  Ipv6Addr::from(raw & mask)
}

fn mask_addr(addr: IpAddr, len: u8) -> IpAddr {
  match addr {
    IpAddr::V4(a) => IpAddr::V4(mask_v4(a, len)),
    IpAddr::V6(a) => IpAddr::V6(mask_v6(a, len)),
  }
}

impl Display for IpPrefix {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.addr, self.len)
  }
}

impl Debug for IpPrefix {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.addr, self.len)
  }
}

impl FromStr for IpPrefix {
  type Err = PrefixParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (addr, len) = s
      .split_once('/')
      .ok_or(PrefixParseError::MissingSeparator)?;
    let addr: IpAddr = addr.parse()?;
    let len: u8 = len
      .parse()
      .map_err(|_| PrefixParseError::InvalidLength(len.to_owned()))?;
    Self::new(addr, len)
  }
}

impl Serialize for IpPrefix {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.canonical())
  }
}

impl<'de> Deserialize<'de> for IpPrefix {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::IpPrefix;

  fn p(s: &str) -> IpPrefix {
    s.parse().unwrap()
  }

  #[test]
  fn host_bits_are_normalized() {
    assert_eq!(p("10.1.2.3/8"), p("10.0.0.0/8"));
    assert_eq!(p("2001:db8::1/32"), p("2001:db8::/32"));
  }

  #[test]
  fn covering_relations() {
    assert!(p("10.0.0.0/8").covers(&p("10.0.0.0/8")));
    assert!(p("10.0.0.0/8").covers(&p("10.42.0.0/16")));
    assert!(!p("10.42.0.0/16").covers(&p("10.0.0.0/8")));
    assert!(!p("11.0.0.0/8").covers(&p("10.42.0.0/16")));

    assert!(p("10.42.0.0/16").is_more_specific_than(&p("10.0.0.0/8")));
    assert!(!p("10.0.0.0/8").is_more_specific_than(&p("10.0.0.0/8")));

    assert!(p("10.0.0.0/8").overlaps(&p("10.42.0.0/16")));
    assert!(p("10.42.0.0/16").overlaps(&p("10.0.0.0/8")));
    assert!(!p("192.168.0.0/16").overlaps(&p("10.0.0.0/8")));
  }

  #[test]
  fn families_never_mix() {
    assert!(!p("::/0").covers(&p("10.0.0.0/8")));
    assert!(!p("0.0.0.0/0").covers(&p("2001:db8::/32")));
  }

  #[test]
  fn zero_length_masks() {
    assert!(p("0.0.0.0/0").covers(&p("203.0.113.0/24")));
  }

  #[test]
  fn rejects_garbage() {
    assert!("10.0.0.0".parse::<IpPrefix>().is_err());
    assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
    assert!("banana/8".parse::<IpPrefix>().is_err());
  }
}

mod asn;
pub(crate) mod b58;
mod keys;
mod prefix;

pub use {
  asn::Asn,
  b58::ToBase58String,
  keys::{KeyRing, Keypair, Pubkey},
  prefix::{IpPrefix, PrefixParseError},
};

//! Run inputs
//!
//! Everything the ingestion collaborator hands to the simulator:
//! per-AS observation streams, the validator/observer classification
//! derived from RPKI deployment measurements, and the Validated Route
//! Origin (VRP) table. The core treats all of it as immutable.
//!
//! Parsing of real-world CAIDA/ROA dumps lives outside this crate;
//! the [`synthetic`] generator below produces structurally identical
//! data for the bundled driver and for tests.

use {
  crate::{
    clock::LogicalTime,
    primitives::{Asn, IpPrefix},
  },
  rand::{Rng, SeedableRng},
  rand_chacha::ChaCha20Rng,
  rayon::prelude::*,
  serde::{Deserialize, Serialize},
  std::collections::{BTreeMap, BTreeSet},
};

/// Whether an observation announces or withdraws a route. Withdrawals
/// matter only to the flap detector and never enter knowledge bases.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
  Announce,
  Withdraw,
}

/// A single BGP route observation as seen by one AS.
///
/// `ground_truth_attack` and `attack_label` come from the dataset's
/// labeling and are carried for accuracy reporting only. No runtime
/// decision consults them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
  pub observer: Asn,
  pub prefix: IpPrefix,
  pub origin: Asn,
  pub as_path: Vec<Asn>,
  pub timestamp: LogicalTime,
  pub kind: UpdateKind,
  pub ground_truth_attack: bool,
  pub attack_label: Option<String>,
}

/// One Validated Route Origin authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrpEntry {
  pub prefix: IpPrefix,
  pub origin: Asn,
}

/// The VRP table used by every attack detector in the run.
///
/// Lookups are linear over the entry list. Tables derived from ROA
/// dumps are small compared to the observation volume, and the
/// detector asks one covering query per observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VrpTable {
  entries: Vec<VrpEntry>,
}

impl VrpTable {
  pub fn new(entries: impl IntoIterator<Item = (IpPrefix, Asn)>) -> Self {
    Self {
      entries: entries
        .into_iter()
        .map(|(prefix, origin)| VrpEntry { prefix, origin })
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Entries whose prefix equals `prefix` exactly.
  pub fn exact<'a>(
    &'a self,
    prefix: &'a IpPrefix,
  ) -> impl Iterator<Item = &'a VrpEntry> {
    self.entries.iter().filter(move |e| e.prefix == *prefix)
  }

  /// Entries strictly less specific than `prefix` that cover it.
  pub fn covering<'a>(
    &'a self,
    prefix: &'a IpPrefix,
  ) -> impl Iterator<Item = &'a VrpEntry> {
    self
      .entries
      .iter()
      .filter(move |e| prefix.is_more_specific_than(&e.prefix))
  }

  /// True when some entry covering `prefix` (exactly or as a
  /// less-specific) authorizes `origin`.
  pub fn authorizes(&self, prefix: &IpPrefix, origin: Asn) -> bool {
    self
      .entries
      .iter()
      .any(|e| e.origin == origin && e.prefix.covers(prefix))
  }
}

/// Validator / observer split for the run, fixed by the dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
  pub validators: BTreeSet<Asn>,
  pub observers: BTreeSet<Asn>,
}

impl Classification {
  pub fn new(
    validators: impl IntoIterator<Item = Asn>,
    observers: impl IntoIterator<Item = Asn>,
  ) -> Self {
    Self {
      validators: validators.into_iter().collect(),
      observers: observers.into_iter().collect(),
    }
  }
}

/// A complete simulator input: streams grouped by observer AS, the
/// classification, and the VRP table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
  pub streams: BTreeMap<Asn, Vec<Observation>>,
  pub classification: Classification,
  pub vrp: VrpTable,
}

impl Dataset {
  /// The `[t0, t1]` logical span of all observations, `None` for an
  /// empty dataset.
  pub fn span(&self) -> Option<(LogicalTime, LogicalTime)> {
    let mut span: Option<(LogicalTime, LogicalTime)> = None;
    for obs in self.streams.values().flatten() {
      span = Some(match span {
        None => (obs.timestamp, obs.timestamp),
        Some((lo, hi)) => (lo.min(obs.timestamp), hi.max(obs.timestamp)),
      });
    }
    span
  }

  pub fn total_observations(&self) -> usize {
    self.streams.values().map(Vec::len).sum()
  }

  /// Sorts every stream by timestamp. Ingestion is expected to hand
  /// over ordered streams; the bundled generator calls this once.
  pub fn sort_streams(&mut self) {
    for stream in self.streams.values_mut() {
      stream.sort_by_key(|o| o.timestamp);
    }
  }
}

/// Parameters for the synthetic scenario generator.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
  pub validators: usize,
  pub observers: usize,
  pub observations_per_node: usize,
  /// Fraction of observations that are ground-truth attacks.
  pub attack_ratio: f64,
  pub start_secs: u64,
  pub duration_secs: u64,
  pub seed: u64,
}

impl Default for SyntheticSpec {
  fn default() -> Self {
    Self {
      validators: 10,
      observers: 40,
      observations_per_node: 200,
      attack_ratio: 0.05,
      start_secs: 1_000_000,
      duration_secs: 600,
      seed: 0,
    }
  }
}

/// Generates a reproducible synthetic dataset: a routed address plan
/// with matching VRP entries, mostly-legitimate announcement traffic,
/// and a labeled mixture of hijacks, bogon injections and flap
/// bursts. Per-AS streams are generated in parallel from seeds
/// derived from the run seed, so the output depends only on the spec.
pub fn synthetic(spec: &SyntheticSpec) -> Dataset {
  let validators: Vec<Asn> =
    (0..spec.validators as u32).map(|i| Asn(1000 + i)).collect();
  let observers: Vec<Asn> =
    (0..spec.observers as u32).map(|i| Asn(2000 + i)).collect();

  // one authorized /16 per observer, carved out of 20.0.0.0/8
  let plan: Vec<(IpPrefix, Asn)> = observers
    .iter()
    .enumerate()
    .map(|(i, asn)| {
      let prefix: IpPrefix = format!("20.{}.0.0/16", i % 256).parse().unwrap();
      (prefix, *asn)
    })
    .collect();
  let vrp = VrpTable::new(plan.clone());

  let bogons: Vec<IpPrefix> = vec![
    "192.168.0.0/16".parse().unwrap(),
    "10.0.0.0/8".parse().unwrap(),
    "198.51.100.0/24".parse().unwrap(),
  ];

  let all_nodes: Vec<Asn> =
    validators.iter().chain(observers.iter()).copied().collect();

  let streams: BTreeMap<Asn, Vec<Observation>> = all_nodes
    .par_iter()
    .map(|&observer| {
      let mut rng =
        ChaCha20Rng::seed_from_u64(spec.seed ^ (observer.0 as u64) << 17);
      let mut stream = Vec::with_capacity(spec.observations_per_node);
      for _ in 0..spec.observations_per_node {
        let ts = LogicalTime::from_secs(
          spec.start_secs + rng.gen_range(0..spec.duration_secs.max(1)),
        );
        let (prefix, origin) = plan[rng.gen_range(0..plan.len())];
        let obs = if rng.gen_bool(spec.attack_ratio) {
          match rng.gen_range(0..3u8) {
            0 => Observation {
              observer,
              prefix,
              origin: Asn(6500 + rng.gen_range(0..100)),
              as_path: vec![observer, Asn(6500)],
              timestamp: ts,
              kind: UpdateKind::Announce,
              ground_truth_attack: true,
              attack_label: Some("prefix_hijack".into()),
            },
            1 => Observation {
              observer,
              prefix: bogons[rng.gen_range(0..bogons.len())],
              origin,
              as_path: vec![observer, origin],
              timestamp: ts,
              kind: UpdateKind::Announce,
              ground_truth_attack: true,
              attack_label: Some("bogon_injection".into()),
            },
            _ => Observation {
              observer,
              prefix,
              origin,
              as_path: vec![observer, origin],
              timestamp: ts,
              kind: if rng.gen_bool(0.5) {
                UpdateKind::Announce
              } else {
                UpdateKind::Withdraw
              },
              ground_truth_attack: true,
              attack_label: Some("route_flapping".into()),
            },
          }
        } else {
          Observation {
            observer,
            prefix,
            origin,
            as_path: vec![observer, origin],
            timestamp: ts,
            kind: UpdateKind::Announce,
            ground_truth_attack: false,
            attack_label: None,
          }
        };
        stream.push(obs);
      }
      stream.sort_by_key(|o| o.timestamp);
      (observer, stream)
    })
    .collect();

  Dataset {
    streams,
    classification: Classification::new(validators, observers),
    vrp,
  }
}

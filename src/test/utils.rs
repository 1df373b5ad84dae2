use {
  crate::{
    clock::LogicalTime,
    config::SimConfig,
    dataset::{Classification, Dataset, Observation, UpdateKind, VrpTable},
    orchestrator::Orchestrator,
    primitives::{Asn, IpPrefix},
    report::SimReport,
  },
  std::collections::BTreeMap,
};

pub fn prefix(s: &str) -> IpPrefix {
  s.parse().unwrap()
}

pub fn announce(observer: u32, p: &str, origin: u32, ts: u64) -> Observation {
  observation(observer, p, origin, ts, UpdateKind::Announce)
}

pub fn withdraw(observer: u32, p: &str, origin: u32, ts: u64) -> Observation {
  observation(observer, p, origin, ts, UpdateKind::Withdraw)
}

fn observation(
  observer: u32,
  p: &str,
  origin: u32,
  ts: u64,
  kind: UpdateKind,
) -> Observation {
  Observation {
    observer: Asn(observer),
    prefix: prefix(p),
    origin: Asn(origin),
    as_path: vec![Asn(observer), Asn(origin)],
    timestamp: LogicalTime::from_secs(ts),
    kind,
    ground_truth_attack: false,
    attack_label: None,
  }
}

/// Declarative dataset builder for the end-to-end scenarios.
#[derive(Default)]
pub struct Scenario {
  vrp: Vec<(IpPrefix, Asn)>,
  validators: Vec<Asn>,
  observers: Vec<Asn>,
  streams: BTreeMap<Asn, Vec<Observation>>,
}

impl Scenario {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn vrp(mut self, p: &str, origin: u32) -> Self {
    self.vrp.push((prefix(p), Asn(origin)));
    self
  }

  pub fn validators(mut self, asns: impl IntoIterator<Item = u32>) -> Self {
    self.validators = asns.into_iter().map(Asn).collect();
    self
  }

  pub fn observers(mut self, asns: impl IntoIterator<Item = u32>) -> Self {
    self.observers = asns.into_iter().map(Asn).collect();
    self
  }

  pub fn stream(
    mut self,
    asn: u32,
    observations: impl IntoIterator<Item = Observation>,
  ) -> Self {
    self
      .streams
      .entry(Asn(asn))
      .or_default()
      .extend(observations);
    self
  }

  /// The same observation sequence delivered to every validator,
  /// rewritten to each one's own observer field.
  pub fn broadcast_stream(
    mut self,
    observations: impl IntoIterator<Item = Observation>,
  ) -> Self {
    let observations: Vec<Observation> = observations.into_iter().collect();
    for asn in self.validators.clone() {
      let stream: Vec<Observation> = observations
        .iter()
        .cloned()
        .map(|mut obs| {
          obs.observer = asn;
          obs
        })
        .collect();
      self = self.stream(asn.0, stream);
    }
    self
  }

  pub fn build(self) -> Dataset {
    let mut dataset = Dataset {
      streams: self.streams,
      classification: Classification::new(self.validators, self.observers),
      vrp: VrpTable::new(self.vrp),
    };
    dataset.sort_streams();
    dataset
  }
}

/// Config tuned for tests: fast replay, fixed seed.
pub fn fast_config(speed: f64) -> SimConfig {
  let mut cfg = SimConfig::default();
  cfg.simulation.speed_multiplier = speed;
  cfg.simulation.seed = 42;
  cfg
}

pub async fn run(dataset: Dataset, cfg: SimConfig) -> SimReport {
  Orchestrator::new(cfg, dataset)
    .expect("valid test configuration")
    .run()
    .await
    .expect("run completes")
}

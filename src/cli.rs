use {
  crate::{config::SimConfig, dataset::SyntheticSpec},
  clap::Parser,
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(short, long, help = "path to a JSON configuration file")]
  pub config: Option<PathBuf>,

  #[clap(
    long,
    default_value = "10",
    help = "validator count for the synthetic scenario"
  )]
  pub validators: usize,

  #[clap(
    long,
    default_value = "40",
    help = "observer count for the synthetic scenario"
  )]
  pub observers: usize,

  #[clap(
    long,
    default_value = "200",
    help = "observations generated per node"
  )]
  pub observations: usize,

  #[clap(
    long,
    default_value = "0.05",
    help = "fraction of generated observations that are attacks"
  )]
  pub attack_ratio: f64,

  #[clap(long, help = "replay speed override (logical seconds per second)")]
  pub speed: Option<f64>,

  #[clap(long, default_value = "0", help = "master seed for the run")]
  pub seed: u64,

  #[clap(long, help = "directory to persist blocks into")]
  pub persist: Option<PathBuf>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  /// Loads the configuration file if given, then applies the command
  /// line overrides.
  pub fn load_config(&self) -> anyhow::Result<SimConfig> {
    let mut cfg: SimConfig = match &self.config {
      Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
      None => SimConfig::default(),
    };
    if let Some(speed) = self.speed {
      cfg.simulation.speed_multiplier = speed;
    }
    cfg.simulation.seed = self.seed;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn synthetic_spec(&self) -> SyntheticSpec {
    SyntheticSpec {
      validators: self.validators,
      observers: self.observers,
      observations_per_node: self.observations,
      attack_ratio: self.attack_ratio,
      seed: self.seed,
      ..SyntheticSpec::default()
    }
  }
}

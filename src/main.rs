use {
  clap::Parser,
  popchain::{cli::CliOpts, dataset, orchestrator::Orchestrator},
  tracing::{info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  info!("popchain simulator");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));

  let cfg = opts.load_config()?;
  let data = dataset::synthetic(&opts.synthetic_spec());
  info!(
    "synthetic dataset: {} nodes, {} observations, {} VRP entries",
    data.streams.len(),
    data.total_observations(),
    data.vrp.len()
  );

  let mut orchestrator = Orchestrator::new(cfg, data)?;
  if let Some(dir) = &opts.persist {
    orchestrator = orchestrator.with_persistence(dir.clone());
  }

  let report = orchestrator.run().await?;
  println!("{}", serde_json::to_string_pretty(&report.summary())?);
  Ok(())
}

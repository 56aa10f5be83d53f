#![recursion_limit = "256"]

use anyhow::Context;
use burn::prelude::Backend;
use clap::Parser;
use indicatif::MultiProgress;
use photon_cli::telemetry::MetricsSink;
use photon_cli::ui::{ProgressReporter, init_logging};
use photon_cli::{Cli, output_folder, prepare_output_folder};
use photon_dataset::load_dataset;
use photon_render::dense::DenseRenderer;
use photon_render::{MainBackend, TrainBackend};
use photon_train::train::TrainingLoop;
use tracing::trace_span;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve()?;

    let multi = MultiProgress::new();
    init_logging(&multi, config.process.quiet)?;

    let model_path = output_folder(&config.process, &mut rand::rng());
    log::info!("Output folder: {}", model_path.display());
    prepare_output_folder(&model_path, &config)?;

    let dataset = trace_span!("load_dataset")
        .in_scope(|| load_dataset(&cli.source, &config.load))
        .with_context(|| format!("Failed to load dataset from {}", cli.source.display()))?;

    let device = <MainBackend as Backend>::Device::default();
    let mut train = TrainingLoop::<TrainBackend, _>::new(
        config.loop_config(model_path, &cli.source),
        &dataset,
        DenseRenderer::default(),
        &device,
    )?;

    let mut progress = ProgressReporter::new(
        &multi,
        config.train.iterations,
        train.first_iter(),
        train.scene().num_points(),
    );
    let metrics = MetricsSink::new(&config.rerun)?;

    train.run(&mut |msg| {
        if let Err(e) = progress.handle(&msg) {
            log::warn!("Failed to print progress: {e}");
        }
        if let Err(e) = metrics.record(&msg) {
            log::warn!("Failed to record metrics: {e}");
        }
    })?;

    progress
        .print_summary()
        .context("Failed to print the training summary")?;
    log::info!("Training complete.");
    Ok(())
}

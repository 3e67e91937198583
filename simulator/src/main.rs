use anyhow::Context;
use clap::Parser;
use gui_bridge::bridge::{default_bind_address, GuiBridge};
use gui_bridge::model::SpectrumModel;
use log::info;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod gui_bridge;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Synthetic slit-spectroscopy workflow driver")]
struct Args {
    /// Reduce one synthetic exposure and write the extracted spectra as JSON
    #[arg(long, default_value_t = false)]
    offline: bool,
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 100)]
    window_width: usize,
    #[arg(long, default_value_t = 4)]
    poly_order: usize,
    #[arg(long, default_value_t = 4.0)]
    threshold: f64,
    /// Where the offline run writes its spectra
    #[arg(long, default_value = "tools/data/offline_spectrum.json")]
    output: PathBuf,
    /// Keep the GUI bridge alive for incoming scenarios
    #[arg(long, default_value_t = false)]
    serve: bool,
    #[arg(long, default_value_t = default_bind_address())]
    bind: SocketAddr,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        let config = WorkflowConfig::from_args(args.window_width, args.poly_order, args.threshold);
        config.validate()?;
        config
    };

    let runner = Arc::new(Runner::new(workflow_config.clone()));

    let mut offline_model = None;
    if args.offline {
        let result = runner
            .execute(&workflow_config.generator)
            .context("running offline workflow")?;
        let model =
            SpectrumModel::from_result(&result, workflow_config.generator.scenario.clone());

        println!(
            "Offline run -> integrations {}, rows {}, outliers replaced {}/{}, trace failures {}",
            result.spectrum.integrations(),
            result.spectrum.wavelengths.len(),
            model.outliers_replaced,
            result.injected_outliers,
            result.metrics.trace_failures
        );

        if let Some(parent) = args.output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let report = serde_json::to_string_pretty(&model).context("serializing spectra")?;
        fs::write(&args.output, report)
            .with_context(|| format!("writing {}", args.output.display()))?;
        info!("spectra written to {}", args.output.display());
        offline_model = Some(model);
    }

    if args.serve {
        let gui_bridge = GuiBridge::new(runner, args.bind).context("starting GUI bridge")?;
        if let Some(model) = offline_model {
            gui_bridge.publish(model);
        }
        gui_bridge.publish_status(&format!(
            "HTTP bridge running on {} (Ctrl+C to stop)...",
            gui_bridge.address()
        ));
        let runtime = TokioBuilder::new_current_thread()
            .enable_all()
            .build()
            .context("creating runtime for signal handling")?;
        runtime.block_on(async {
            signal::ctrl_c().await.context("awaiting Ctrl+C to exit")?;
            Ok::<(), anyhow::Error>(())
        })?;
    }

    Ok(())
}

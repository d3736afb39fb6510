mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use amplify_core::Step;
use amplify_engine::{
    ChannelProgressSink, ConvertRequest, Converter, EngineConfig, EngineEvent, JobProgress,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use engine_logging::{engine_debug, engine_info, engine_warn, LogDestination};
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "amplify", version, about = "Convert web pages into AMP markup")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Also write the log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert one page and write its artifacts under the output root.
    Convert {
        url: String,
        /// Output directory name instead of the one derived from the URL.
        #[arg(short, long)]
        output: Option<String>,
        /// JSON pipeline file; the built-in pipeline is used otherwise.
        #[arg(long)]
        steps: Option<PathBuf>,
        /// RON engine configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output_root: Option<PathBuf>,
        /// Show the browser window.
        #[arg(long)]
        headful: bool,
        #[arg(long)]
        full_page_screenshot: bool,
    },
    /// List the steps of a pipeline.
    Steps {
        #[arg(long)]
        steps: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    match &cli.log_file {
        Some(path) => engine_logging::initialize(LogDestination::Both, level, path),
        None => engine_logging::initialize(LogDestination::Terminal, level, Path::new("")),
    }

    match cli.command {
        Command::Convert {
            url,
            output,
            steps,
            config: config_path,
            output_root,
            headful,
            full_page_screenshot,
        } => {
            let mut engine_config = config::load_engine_config(config_path.as_deref())?;
            if let Some(root) = output_root {
                engine_config.output_root = root;
            }
            if headful {
                engine_config.headless = false;
            }
            if full_page_screenshot {
                engine_config.full_page_screenshot = true;
            }
            let pipeline = config::load_pipeline(steps.as_deref())?;
            convert(engine_config, url, output, pipeline).await
        }
        Command::Steps { steps } => {
            for (index, step) in config::load_pipeline(steps.as_deref())?.iter().enumerate() {
                let marker = if step.is_runnable() { "" } else { " (skipped)" };
                println!(
                    "Step {}: {} - {} actions{marker}",
                    index + 1,
                    step.name,
                    step.actions.len()
                );
            }
            Ok(())
        }
    }
}

async fn convert(
    engine_config: EngineConfig,
    url: String,
    output: Option<String>,
    pipeline: Vec<Step>,
) -> Result<()> {
    let (sink, mut events) = ChannelProgressSink::channel();
    let progress = tokio::spawn(async move {
        while let Some(EngineEvent::Progress(JobProgress { url, stage })) = events.recv().await {
            engine_debug!("{url}: {stage}");
        }
    });
    let converter = Converter::with_defaults(engine_config).with_progress_sink(Arc::new(sink));
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            engine_warn!("Interrupted, finishing the current action");
            on_interrupt.cancel();
        }
    });

    let mut request = ConvertRequest::new(url);
    if let Some(name) = output {
        request = request.with_output(name);
    }
    let result = converter.convert(&request, &pipeline, &cancel).await;
    converter.shutdown().await;
    drop(converter);
    if let Err(err) = progress.await {
        engine_warn!("Progress logger stopped: {err}");
    }

    let outcome = result?;
    engine_info!(
        "Done: {} ({}, {} validation errors)",
        outcome.url,
        if outcome.validation.pass { "valid" } else { "invalid" },
        outcome.validation.errors.len()
    );
    Ok(())
}

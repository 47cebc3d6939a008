//! `lipsync` command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lipsync_media::{default_detector_factory, VideoProcessor};
use lipsync_models::{InferenceOptions, ModelVariant, RunEvent};
use lipsync_worker::{InferenceOrchestrator, ModelProvisioner, PipelineConfig, RunRequest};

#[derive(Parser)]
#[command(
    name = "lipsync",
    version,
    about = "Align faces in a video and lip-sync it to an audio track"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    Standard,
    Gan,
    All,
}

#[derive(Subcommand)]
enum Commands {
    /// Download model weights that are not on disk yet
    Provision {
        #[arg(long, value_enum, default_value_t = VariantArg::All)]
        variant: VariantArg,
    },

    /// Resize and align a video without running inference
    Preprocess {
        input: PathBuf,
        output: PathBuf,

        /// Downscale videos taller than this
        #[arg(long)]
        target_height: Option<u32>,

        /// Leave frames tilted by more than this many degrees untouched
        #[arg(long)]
        max_angle: Option<f64>,
    },

    /// Run the whole pipeline and print the path of the result
    Run {
        video: PathBuf,
        audio: PathBuf,

        /// Use the GAN weights
        #[arg(long, default_value_t = false)]
        gan: bool,

        /// Keep face box smoothing enabled (omit --nosmooth)
        #[arg(long, default_value_t = false)]
        smooth: bool,
    },
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = execute(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("lipsync=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = PipelineConfig::from_env();
    config.validate()?;

    match cli.cmd {
        Commands::Provision { variant } => provision(config, variant).await,
        Commands::Preprocess {
            input,
            output,
            target_height,
            max_angle,
        } => preprocess(config, input, output, target_height, max_angle).await,
        Commands::Run {
            video,
            audio,
            gan,
            smooth,
        } => {
            let options = InferenceOptions {
                use_gan: gan,
                smoothing_disabled: !smooth,
            };
            run(config, video, audio, options).await
        }
    }
}

async fn provision(config: PipelineConfig, variant: VariantArg) -> Result<()> {
    let provisioner = ModelProvisioner::new(config.provisioner)?;
    let paths = match variant {
        VariantArg::Standard => vec![provisioner.ensure(ModelVariant::Standard).await?],
        VariantArg::Gan => vec![provisioner.ensure(ModelVariant::Gan).await?],
        VariantArg::All => provisioner.ensure_all().await?,
    };
    if let Some(face_model) = provisioner.ensure_face_model().await? {
        println!("{}", face_model.display());
    }
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}

async fn preprocess(
    config: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
    target_height: Option<u32>,
    max_angle: Option<f64>,
) -> Result<()> {
    let mut processor_config = config.processor;
    if let Some(height) = target_height {
        if height == 0 {
            bail!("--target-height must be positive");
        }
        processor_config.target_height = height;
    }
    if let Some(angle) = max_angle {
        if !angle.is_finite() || angle <= 0.0 {
            bail!("--max-angle must be a positive number of degrees");
        }
        processor_config.aligner = processor_config.aligner.with_max_angle(angle);
    }

    let factory = default_detector_factory(config.provisioner.face_model_path.clone());
    let processor = VideoProcessor::new(processor_config, factory);
    let cancel = cancel_on_ctrl_c();

    let progress = |percent: u8| info!("Preprocessing: {}%", percent);
    let processed = processor
        .process(&input, &output, &progress, Some(cancel))
        .await
        .with_context(|| format!("preprocessing {} failed", input.display()))?;

    println!("{}", serde_json::to_string_pretty(&processed)?);
    Ok(())
}

async fn run(
    config: PipelineConfig,
    video: PathBuf,
    audio: PathBuf,
    options: InferenceOptions,
) -> Result<()> {
    let orchestrator = InferenceOrchestrator::from_config(config)?;
    let request = RunRequest::new(video, audio, options);
    info!("Starting run {}", request.run_id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::InferenceOutput { line } => println!("{}", line),
                RunEvent::Preprocessing { percent } => info!("Preprocessing: {}%", percent),
                RunEvent::Stage { status } => info!("Stage: {}", status.as_str()),
                RunEvent::Warning { message } => eprintln!("warning: {}", message),
            }
        }
    });

    let report = orchestrator
        .run(request, Some(tx), Some(cancel_on_ctrl_c()))
        .await;
    printer.await.ok();

    match report.result {
        Ok(artifact) => {
            println!("{}", artifact.path.display());
            Ok(())
        }
        Err(e) => {
            if let Some(diagnostic) = e.diagnostic().filter(|d| !d.trim().is_empty()) {
                eprintln!("{}", diagnostic);
            }
            Err(e.into())
        }
    }
}

/// Cancellation flag raised by the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}

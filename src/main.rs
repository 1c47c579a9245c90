//! ffpilot - Supervised FFmpeg Transcoding Driver
//!
//! Command-line front end over the ffpilot engine: declarative transcoding
//! runs with structured progress, media inspection, and stall protection.

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::{non_blocking, rolling};

use ffpilot::cli::{Args, Commands};
use ffpilot::config::Config;
use ffpilot::probe::{ProbeReport, ProberFactory};
use ffpilot::transcode::{EventKind, InputSpec, OutputSpec, TranscodeEvent, Transcoder};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logging to both console and file
    setup_logging(args.verbose)?;

    // Load configuration
    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            // Try to load ffpilot.toml from current directory first
            if std::path::Path::new("ffpilot.toml").exists() {
                info!("Found ffpilot.toml in current directory, loading...");
                Config::from_file("ffpilot.toml")?
            } else {
                Config::default()
            }
        }
    };

    // Execute command
    match args.command {
        Commands::Run {
            input,
            output,
            input_options,
            output_options,
            tee,
            timeout_ms,
            overwrite,
            cwd,
        } => {
            run_transcode(
                config,
                input,
                output,
                input_options,
                output_options,
                tee,
                timeout_ms,
                overwrite,
                cwd,
            )
            .await?;
        }
        Commands::Probe { input, json } => {
            info!("Probing media file: {}", input.display());
            let prober = ProberFactory::create_prober(config.probe);
            let report = prober.probe(&input).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_probe_summary(&report);
            }
        }
        Commands::Info => {
            let transcoder = Transcoder::new(config.transcode);
            let prober = ProberFactory::create_prober(config.probe);
            println!("{}", transcoder.version().await?);
            println!("{}", prober.version().await?);
        }
        Commands::Config { output, show } => {
            if show {
                print!("{}", toml::to_string_pretty(&config)?);
            } else {
                Config::default().save_to_file(&output)?;
                println!("Wrote default configuration to {}", output.display());
            }
        }
    }

    Ok(())
}

/// Drive one transcoding run with a console progress bar.
async fn run_transcode(
    mut config: Config,
    inputs: Vec<String>,
    outputs: Vec<String>,
    input_options: Vec<String>,
    output_options: Vec<String>,
    tee: bool,
    timeout_ms: Option<u64>,
    overwrite: Option<bool>,
    cwd: Option<PathBuf>,
) -> Result<()> {
    info!(
        "Transcoding {} input(s) into {} output(s)",
        inputs.len(),
        outputs.len()
    );

    if tee {
        config.transcode.tee = true;
    }
    if let Some(timeout_ms) = timeout_ms {
        config.transcode.timeout_ms = timeout_ms;
    }
    if let Some(overwrite) = overwrite {
        config.transcode.overwrite_existing = overwrite;
    }
    if let Some(cwd) = cwd {
        config.transcode.cwd = Some(cwd);
    }
    config.transcode.input_options.extend(input_options);
    config.transcode.output_options.extend(output_options);

    let mut transcoder = Transcoder::new(config.transcode);
    transcoder.set_inputs(inputs.into_iter().map(|input| InputSpec::path(input)).collect());
    transcoder.set_outputs(outputs.into_iter().map(|output| OutputSpec::path(output)).collect());

    // Progress bar fed from the event stream
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    let progress = bar.clone();
    transcoder.subscribe(EventKind::Progress, move |event| {
        if let TranscodeEvent::Progress(update) = event {
            progress.set_position(update.percent.round() as u64);
            if let Some(speed) = update.sample.speed {
                progress.set_message(format!("{speed:.2}x"));
            }
        }
    });
    let writing = bar.clone();
    transcoder.subscribe(EventKind::Writing, move |event| {
        if let TranscodeEvent::Writing(infos) = event {
            if let Some(info) = infos.first() {
                writing.set_message(info.file.clone());
            }
        }
    });

    transcoder.run().await?;
    match transcoder.done().await {
        Ok(summary) => {
            bar.finish_and_clear();
            match &summary.file {
                Some(file) => info!("Transcode finished: {}", file),
                None => info!("Transcode finished"),
            }
            if let Some(sizes) = &summary.sizes {
                info!(
                    "Final sizes: video {} KiB, audio {} KiB",
                    sizes.video_bytes / 1024,
                    sizes.audio_bytes / 1024
                );
            }
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

/// Human-oriented rendition of a probe report.
fn print_probe_summary(report: &ProbeReport) {
    if let Some(name) = &report.format.format_name {
        println!("Container: {}", name);
    }
    if let Some(duration) = report.duration_seconds() {
        println!("Duration: {:.2}s", duration);
    }
    if let Some(size) = report.format.size_bytes() {
        println!("Size: {:.2} MB", size as f64 / 1024.0 / 1024.0);
    }
    for stream in &report.streams {
        let kind = stream.codec_type.as_deref().unwrap_or("data");
        let codec = stream.codec_name.as_deref().unwrap_or("unknown");
        let detail = if stream.is_video() {
            match (stream.width, stream.height, stream.frame_rate()) {
                (Some(w), Some(h), Some(rate)) => format!(", {}x{} @ {:.2} fps", w, h, rate),
                (Some(w), Some(h), None) => format!(", {}x{}", w, h),
                _ => String::new(),
            }
        } else if stream.is_audio() {
            match (stream.channels, stream.sample_rate.as_deref()) {
                (Some(channels), Some(rate)) => format!(", {} ch @ {} Hz", channels, rate),
                (Some(channels), None) => format!(", {} ch", channels),
                _ => String::new(),
            }
        } else {
            String::new()
        };
        println!("  #{} {}: {}{}", stream.index, kind, codec, detail);
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let state_dir = std::env::current_dir()?.join(".ffpilot");
    let log_dir = state_dir.join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "ffpilot.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    // Determine log level
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Create console layer
    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    // Create file layer
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    // Setup layered subscriber
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer);

    // Initialize the subscriber
    subscriber.try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized - console: {}, file: {}",
          log_level, log_dir.join("ffpilot.log").display());

    Ok(())
}

//! TribeLogParser - Main Application Entrypoint
//!
//! This file is responsible for parsing command-line arguments, initializing
//! the application environment (like logging), and feeding captured panel
//! frames through the processing pipeline.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::{Path, PathBuf};
use tribelogparser::segmenter::PanelGeometry;
use tribelogparser::tracker::DEFAULT_VOTE_THRESHOLD;
use tribelogparser::{Config, LogPipeline};

/// A command-line tool that turns tribe-log panel screenshots into validated,
/// deduplicated log entries stored in SQLite.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a captured panel image, or a directory of frames processed
    /// in filename order
    #[arg(short, long)]
    input: PathBuf,

    /// Path to the log entry database
    #[arg(long, default_value = "log.db")]
    log_db: PathBuf,

    /// Path to the log image database
    #[arg(long, default_value = "log_images.db")]
    images_db: PathBuf,

    /// Path to the OCR replacement rules file
    #[arg(long, default_value = "replacements.json")]
    replacements: PathBuf,

    /// Optional JSON file overriding the panel crop geometry
    #[arg(long)]
    geometry: Option<PathBuf>,

    /// Matching observations required before an entry is accepted
    #[arg(short, long, default_value_t = DEFAULT_VOTE_THRESHOLD)]
    threshold: u32,

    /// OCR language (e.g., "eng" for English)
    #[arg(short, long, default_value_t = String::from("eng"))]
    lang: String,

    /// Logging verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Info,
    Debug,
}

fn main() {
    let args = Args::parse();

    // 1. Initialize Logger
    let log_level = match args.log_level {
        LogLevel::Error => "error",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting TribeLogParser...");

    // 2. Validate input path
    if !args.input.exists() {
        error!("Input path does not exist: {:?}", args.input);
        std::process::exit(1);
    }

    // 3. Create a configuration object from arguments
    let config = Config {
        geometry: PanelGeometry::load_or_default(args.geometry.as_deref()),
        vote_threshold: args.threshold,
        lang: args.lang,
        replacements_file: args.replacements,
        log_db: args.log_db,
        images_db: args.images_db,
    };

    // 4. Run the main application logic
    if let Err(e) = run(&args.input, config) {
        error!("Application failed: {}", e);
        std::process::exit(2);
    }

    info!("Processing completed successfully.");
    std::process::exit(0);
}

fn run(input: &Path, config: Config) -> Result<()> {
    let mut pipeline = LogPipeline::new(config)?;

    for frame_path in collect_frames(input)? {
        info!("Processing frame {:?}", frame_path);
        let panel = image::open(&frame_path)
            .with_context(|| format!("failed to load frame {:?}", frame_path))?
            .to_rgb8();

        let new_entries = pipeline.process_panel(&panel)?;
        for entry in new_entries {
            println!("{}", entry.text);
        }
    }

    Ok(())
}

/// A single file is one pass; a directory is processed as consecutive
/// frames, sorted by filename so capture order is preserved.
fn collect_frames(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let mut frames: Vec<PathBuf> = std::fs::read_dir(input)
        .with_context(|| format!("failed to read frame directory {:?}", input))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    frames.sort();
    Ok(frames)
}

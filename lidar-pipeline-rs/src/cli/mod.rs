//! Command-line interface for the LIDAR pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{
    ExtractorConfig, PipelineConfig, PlaneParams, RangeImageParams, TransformerConfig,
};
use crate::core::output::{OutputFormat, OutputWriter, DEFAULT_BATCH_SIZE};
use crate::pipeline::{LidarProcessor, Progress};
use crate::processors::transform::PlaneTransformer;

/// Project file used by `fit-plane` when no path is given.
const DEFAULT_PROJECT_FILE: &str = "project.json";

#[derive(Parser)]
#[command(name = "lidar-pipeline")]
#[command(about = "LIDAR capture processing and object tracking pipeline", version)]
pub struct Cli {
    /// Path to the project configuration (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count the frames in a capture
    Info {
        /// Input pcap capture
        capture: PathBuf,
    },

    /// Fit the ground plane through three points and store it in the project
    FitPlane {
        /// First point as x,y,z
        #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
        p0: [f64; 3],
        /// Second point as x,y,z
        #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
        p1: [f64; 3],
        /// Third point as x,y,z
        #[arg(long, value_parser = parse_point, allow_hyphen_values = true)]
        p2: [f64; 3],
        /// Project file to update (defaults to --config, then project.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract a background from the first frames of a capture
    ExtractBackground {
        /// Input pcap capture
        capture: PathBuf,
        /// Number of frames to extract from (defaults to the extractor's n_frames)
        #[arg(short, long)]
        frames: Option<usize>,
        /// Output background table
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the configured pipeline and write tracked objects
    Process {
        /// Input pcap capture
        capture: PathBuf,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Output format (json or csv)
        #[arg(long, default_value = "json")]
        format: String,
        /// First frame to process
        #[arg(long, default_value_t = 0)]
        from: usize,
        /// Last frame to process (defaults to the last frame of the capture)
        #[arg(long)]
        to: Option<usize>,
    },
}

fn parse_point(s: &str) -> std::result::Result<[f64; 3], String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("invalid coordinate in '{}': {}", s, e))?;
    match values.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => Err(format!("expected x,y,z, got '{}'", s)),
    }
}

/// Spinner shown while frames are counted or buffered
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Drive a pipeline operation, mirroring its percentage on a progress bar.
fn run_with_bar(message: &str, progress: Progress<'_>) -> Result<()> {
    let pb = ProgressBar::new(100);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos:>3}% ({elapsed})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_message(message.to_string());

    for step in progress {
        match step {
            Ok(percent) => pb.set_position(percent.round() as u64),
            Err(e) => {
                pb.abandon();
                return Err(e.into());
            }
        }
    }
    pb.finish_and_clear();
    Ok(())
}

/// Boxed key/value summary printed after a command
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Logger before anything can emit records
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Info { capture } => cmd_info(&capture),
        Commands::FitPlane { p0, p1, p2, output } => cmd_fit_plane([p0, p1, p2], output, config),
        Commands::ExtractBackground { capture, frames, output } => {
            cmd_extract_background(&capture, frames, &output, config)
        }
        Commands::Process { capture, output, format, from, to } => {
            cmd_process(&capture, &output, &format, from, to, config)
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_project(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path)
        .with_context(|| format!("failed to load project {}", path.display()))?;
    info!("Loaded config from: {}", path.display());
    Ok(config)
}

fn cmd_info(capture: &Path) -> Result<()> {
    let start = Instant::now();

    let mut processor = LidarProcessor::new();
    processor
        .set_capture(capture)
        .with_context(|| format!("cannot read capture {}", capture.display()))?;

    let spinner = create_spinner("Counting frames...");
    let frames = processor.peek_frame_count();
    spinner.finish_and_clear();
    let frames = frames.context("failed to scan capture")?;

    print_summary(
        "Capture Info",
        &[
            ("Capture", capture.display().to_string()),
            ("Frames", frames.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_fit_plane(
    points: [[f64; 3]; 3],
    output: Option<PathBuf>,
    config: Option<&Path>,
) -> Result<()> {
    let target = output
        .or_else(|| config.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECT_FILE));

    let transformer = PlaneTransformer::fit(points).context("cannot fit plane")?;

    let mut project = if target.exists() {
        load_project(&target)?
    } else {
        PipelineConfig::default()
    };
    project.transformer = Some(TransformerConfig::ThreePointsPlane(PlaneParams {
        normal: transformer.normal(),
        intercept: transformer.intercept(),
    }));
    project
        .save(&target)
        .with_context(|| format!("failed to save project {}", target.display()))?;

    let [a, b, c] = transformer.normal();
    print_summary(
        "Plane Fitted",
        &[
            ("Project", target.display().to_string()),
            ("Normal", format!("{:.4}, {:.4}, {:.4}", a, b, c)),
            ("Intercept", format!("{:.4}", transformer.intercept())),
        ],
    );
    Ok(())
}

fn cmd_extract_background(
    capture: &Path,
    frames: Option<usize>,
    output: &Path,
    config: Option<&Path>,
) -> Result<()> {
    let start = Instant::now();

    let mut params = match config {
        Some(path) => match load_project(path)?.background.and_then(|b| b.extractor) {
            Some(ExtractorConfig::RangeImage(params)) => params,
            None => RangeImageParams::default(),
        },
        None => RangeImageParams::default(),
    };
    if let Some(n) = frames {
        if n == 0 {
            bail!("--frames must be at least 1");
        }
        params.n_frames = n;
    }

    let mut processor = LidarProcessor::new();
    processor
        .set_capture(capture)
        .with_context(|| format!("cannot read capture {}", capture.display()))?;
    run_with_bar("Buffering frames", processor.buffer_frames(0..params.n_frames)?)?;
    let buffered = processor.len();

    let spinner = create_spinner("Extracting background...");
    let extracted = processor.extract_background(params.clone());
    spinner.finish_and_clear();
    extracted.context("background extraction failed")?;

    processor
        .save_background(output)
        .with_context(|| format!("failed to save background {}", output.display()))?;
    let samples = processor.background().map_or(0, |b| b.len());

    print_summary(
        "Background Extracted",
        &[
            ("Capture", capture.display().to_string()),
            ("Output", output.display().to_string()),
            ("Frames used", buffered.to_string()),
            ("Samples", samples.to_string()),
            ("Percentile", params.percentile.to_string()),
            ("Non-zero", params.non_zero.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_process(
    capture: &Path,
    output: &Path,
    format: &str,
    from: usize,
    to: Option<usize>,
    config: Option<&Path>,
) -> Result<()> {
    let start = Instant::now();

    let Some(config_path) = config else {
        bail!("processing requires a project configuration (--config)");
    };
    let project = load_project(config_path)?;
    let format: OutputFormat = format.parse()?;

    let mut processor = LidarProcessor::new();
    processor
        .set_capture(capture)
        .with_context(|| format!("cannot read capture {}", capture.display()))?;

    // A background that is extracted rather than loaded needs frames first.
    if let Some(background) = &project.background {
        let stored = background.path.as_ref().is_some_and(|p| p.exists());
        if let (false, Some(ExtractorConfig::RangeImage(params))) = (stored, &background.extractor) {
            run_with_bar("Buffering frames", processor.buffer_frames(0..params.n_frames)?)?;
        }
    }
    processor
        .apply_config(&project)
        .context("failed to apply project configuration")?;

    let total = processor.peek_frame_count()?;
    if total == 0 {
        bail!("capture {} contains no complete frames", capture.display());
    }
    let end = to.unwrap_or(total - 1).min(total - 1);
    if from > end {
        bail!("empty frame range {}..={}", from, end);
    }

    let writer = OutputWriter::create(output, format, DEFAULT_BATCH_SIZE)
        .with_context(|| format!("cannot create output {}", output.display()))?;
    run_with_bar("Processing frames", processor.write_output(writer, from..=end)?)?;

    let stages: Vec<&str> = processor
        .status()
        .into_iter()
        .filter_map(|(stage, on)| on.then_some(stage))
        .collect();

    print_summary(
        "Processing Complete",
        &[
            ("Capture", capture.display().to_string()),
            ("Output", output.display().to_string()),
            ("Frames", format!("{}..={}", from, end)),
            ("Stages", stages.join(", ")),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("1,-2.5, 3").unwrap(), [1.0, -2.5, 3.0]);
        assert!(parse_point("1,2").is_err());
        assert!(parse_point("1,x,3").is_err());
    }

    #[test]
    fn test_cli_parses_process() {
        let cli = Cli::try_parse_from([
            "lidar-pipeline",
            "-vv",
            "--config",
            "project.yaml",
            "process",
            "capture.pcap",
            "--output",
            "out.csv",
            "--format",
            "csv",
            "--from",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("project.yaml")));
        match cli.command {
            Commands::Process { from, to, format, .. } => {
                assert_eq!(from, 5);
                assert_eq!(to, None);
                assert_eq!(format, "csv");
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn test_cli_parses_negative_points() {
        let cli = Cli::try_parse_from([
            "lidar-pipeline",
            "fit-plane",
            "--p0",
            "0,0,-1.5",
            "--p1",
            "1,0,-1.5",
            "--p2",
            "0,1,-1.5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::FitPlane { p0: [_, _, z], .. } if z == -1.5));
    }

    #[test]
    fn test_fit_plane_writes_project() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        cmd_fit_plane(
            [[0.0, 0.0, -1.5], [1.0, 0.0, -1.5], [0.0, 1.0, -1.5]],
            Some(path.clone()),
            None,
        )
        .unwrap();

        let project = PipelineConfig::load(&path).unwrap();
        let Some(TransformerConfig::ThreePointsPlane(plane)) = project.transformer else {
            panic!("transformer missing");
        };
        assert_eq!(plane.normal, [0.0, 0.0, 1.0]);
        assert!((plane.intercept - 1.5).abs() < 1e-12);
    }
}

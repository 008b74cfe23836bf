use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use robovision_core::pipeline::detect_objects_use_case::DetectObjectsUseCase;
use robovision_core::pipeline::detection_sink::DetectionSink;
use robovision_core::runner::infrastructure::async_inference_runner::AsyncInferenceRunner;
use robovision_core::shared::constants::IMAGE_EXTENSIONS;
use robovision_core::shared::detection::{Detection, Location};
use robovision_core::shared::frame::Frame;

/// Runs the asynchronous detection pipeline over still images, one image per
/// simulated control tick.
#[derive(Parser)]
#[command(name = "robovision")]
struct Cli {
    /// Input image files, offered in order.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Backend configuration (JSON object).
    #[arg(long)]
    config: PathBuf,

    /// Directory holding the model graph and label file.
    #[arg(long)]
    model_dir: PathBuf,

    /// Scratch directory for the messenger backend (cleared at startup).
    #[arg(long, default_value = "robovision-cache")]
    cache_dir: PathBuf,

    /// Control tick period in milliseconds.
    #[arg(long, default_value = "33")]
    tick_ms: u64,

    /// How long to wait for the last in-flight frame after the final tick.
    #[arg(long, default_value = "2000")]
    drain_ms: u64,
}

/// Prints each published batch to stdout.
struct StdoutDetectionSink;

impl DetectionSink for StdoutDetectionSink {
    fn publish(&mut self, detections: &[Detection]) {
        if detections.is_empty() {
            println!("(no detections)");
        }
        for d in detections {
            println!("{}", format_detection(d));
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;

    let config: serde_json::Value = serde_json::from_str(&fs::read_to_string(&cli.config)?)?;
    let mut runner = AsyncInferenceRunner::new();
    runner.init(&cli.model_dir, &cli.cache_dir, &config)?;

    let mut stage = DetectObjectsUseCase::new(runner, Box::new(StdoutDetectionSink));
    let tick = Duration::from_millis(cli.tick_ms);
    let boot = Instant::now();

    for path in &cli.images {
        let tick_start = Instant::now();
        let frame = load_frame(path, boot.elapsed().as_millis() as u64)?;
        log::debug!("Tick at {} ms: {}", frame.timestamp_ms(), path.display());
        stage.tick(Some(&frame));
        if let Some(rest) = tick.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    if !stage.drain(Duration::from_millis(cli.drain_ms)) && !stage.runner().state().accepts_frames() {
        log::warn!("Last frame still in flight after {} ms", cli.drain_ms);
    }

    let stats = stage.stats();
    log::info!(
        "{} frames offered, {} submitted, {} skipped, {} batches with {} detections",
        stats.frames_offered,
        stats.frames_submitted,
        stats.frames_skipped(),
        stats.batches_published,
        stats.detections_published
    );
    Ok(())
}

fn load_frame(path: &Path, timestamp_ms: u64) -> Result<Frame, Box<dyn std::error::Error>> {
    let rgb = image::open(path)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Frame::new(rgb.into_raw(), width, height, 3, timestamp_ms))
}

fn format_detection(d: &Detection) -> String {
    let location = match d.location {
        Location::Rect(r) => format!("rect x={} y={} w={} h={}", r.x(), r.y(), r.width(), r.height()),
        Location::Point(p) => format!(
            "point x={:.3} y={:.3} area={:.3}",
            p.x, p.y, p.area_fraction
        ),
    };
    format!("[{} ms] {} {:.3} {}", d.timestamp_ms, d.label, d.score, location)
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.config.is_file() {
        return Err(format!("Config file not found: {}", cli.config.display()).into());
    }
    if !cli.model_dir.is_dir() {
        return Err(format!("Model directory not found: {}", cli.model_dir.display()).into());
    }
    if cli.tick_ms == 0 {
        return Err("Tick period must be at least 1 ms".into());
    }
    for image in &cli.images {
        if !image.exists() {
            return Err(format!("Input file not found: {}", image.display()).into());
        }
        if !is_image(image) {
            return Err(format!("Not a supported image file: {}", image.display()).into());
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

//! panosweep-bench: CLI tool for stitching experiments and diagnostics.
//!
//! Stitches a sweep of image files, or a rendered synthetic sweep, and
//! prints per-stage diagnostics. Useful for:
//!
//! - Comparing wave correction on/off and multi-band vs feather blending
//! - Tuning registration resolution, feature counts and match windows
//! - Measuring per-stage durations to identify bottlenecks
//! - Checking how the capture interval changes which frames get stitched
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin panosweep-bench -- [OPTIONS] [IMAGES]...
//! cargo run --release --bin panosweep-bench -- --synthetic 5 --all-options
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use panosweep_session::{
    CaptureController, LiveFrame, Review, Session, StitchEngine, Stitcher,
};
use panosweep_stitch::diagnostics::{Clock, StitchDiagnostics};
use panosweep_stitch::synthetic::{Scene, SweepSpec};
use panosweep_stitch::{FrameSequence, StitchConfig, StitchOptions, StitchResult, WarpSurface};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Panorama stitching experiments and diagnostics for panosweep.
///
/// Stitches the given images (in capture order) or a synthetic sweep and
/// prints detailed per-stage timing and count diagnostics.
#[derive(Parser)]
#[command(name = "panosweep-bench", version)]
struct Cli {
    /// Input images in capture order (PNG, JPEG, BMP, WebP).
    #[arg(required_unless_present = "synthetic", conflicts_with = "synthetic")]
    images: Vec<PathBuf>,

    /// Render a synthetic sweep with this many frames instead of reading
    /// images.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    synthetic: Option<usize>,

    /// Scene seed for `--synthetic`.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Disable wave correction.
    #[arg(long)]
    no_wave_correct: bool,

    /// Use feather blending instead of multi-band blending.
    #[arg(long)]
    feather: bool,

    /// Stitch all four option combinations through a session cache and
    /// report cache hits.
    #[arg(long)]
    all_options: bool,

    /// Feed the frames through the capture controller with this interval
    /// and stitch only the frames it keeps.
    #[arg(long)]
    capture_interval_ms: Option<u64>,

    /// Delivery rate of the simulated live source.
    #[arg(long, default_value_t = 10.0, requires = "capture_interval_ms")]
    simulate_fps: f64,

    /// Registration resolution in megapixels.
    #[arg(long, default_value_t = StitchConfig::DEFAULT_WORK_MEGAPIX)]
    work_megapix: f64,

    /// Maximum features per frame.
    #[arg(long, default_value_t = StitchConfig::DEFAULT_MAX_FEATURES)]
    max_features: usize,

    /// Match each frame with this many successors (0 matches all pairs).
    #[arg(long, default_value_t = 4)]
    match_window: usize,

    /// Projection surface.
    #[arg(long, value_enum, default_value_t = Surface::Spherical)]
    surface: Surface,

    /// Disable exposure compensation.
    #[arg(long)]
    no_exposure: bool,

    /// Write the panorama (PNG) from the first run to this file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    runs: usize,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Full stitch config as a JSON string.
    ///
    /// When provided, all other config flags are ignored. The JSON must be
    /// a valid `StitchConfig` serialization; missing fields take their
    /// defaults.
    #[arg(long)]
    config_json: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Surface {
    Spherical,
    Cylindrical,
    Plane,
}

/// Build a [`StitchConfig`] from CLI arguments.
fn config_from_cli(cli: &Cli) -> Result<StitchConfig, String> {
    let config = if let Some(ref json) = cli.config_json {
        serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
    } else {
        StitchConfig {
            work_megapix: cli.work_megapix,
            max_features: cli.max_features,
            match_window: (cli.match_window > 0).then_some(cli.match_window),
            surface: match cli.surface {
                Surface::Spherical => WarpSurface::Spherical,
                Surface::Cylindrical => WarpSurface::Cylindrical,
                Surface::Plane => WarpSurface::Plane,
            },
            exposure_compensation: !cli.no_exposure,
            ..StitchConfig::default()
        }
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let frames = match input_frames(&cli) {
        Ok(frames) => frames,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Frames: {}", frames.len());
    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    if cli.all_options {
        return run_all_options(&cli, &frames, config);
    }

    let options = StitchOptions::new(!cli.no_wave_correct, !cli.feather);
    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match panosweep_stitch::stitch_with_diagnostics(&frames, options, &config, &StdClock) {
            Ok((panorama, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                }

                // Write the panorama on the first run only.
                if run == 0
                    && let Some(ref path) = cli.output
                {
                    write_output(path, &panorama);
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Stitch error ({}): {e}", e.kind());
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Load or render the sweep, then optionally thin it through the capture
/// controller.
#[allow(clippy::cast_precision_loss)]
fn input_frames(cli: &Cli) -> Result<FrameSequence, String> {
    let per_keep = cli
        .capture_interval_ms
        .map(|ms| live_frames_per_capture(ms, cli.simulate_fps));

    let source = if let Some(count) = cli.synthetic {
        let base = SweepSpec::default();
        // A denser live stream covering the same sweep. Its last delivery
        // is the one toggle_off keeps.
        let spec = per_keep.map_or_else(
            || base.with_frames(count),
            |per| SweepSpec {
                step: base.step / per as f64,
                ..base.with_frames(((count - 1) * per).max(1))
            },
        );
        spec.render(&Scene::new(cli.seed))
    } else {
        panosweep_io::load_frames(&cli.images).map_err(|e| format!("Error loading images: {e}"))?
    };

    match cli.capture_interval_ms {
        Some(ms) => simulate_capture(&source, Duration::from_millis(ms), cli.simulate_fps),
        None => Ok(source),
    }
}

/// Live deliveries between two kept frames at the given rates.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn live_frames_per_capture(interval_ms: u64, fps: f64) -> usize {
    #[allow(clippy::cast_precision_loss)]
    let per = (interval_ms as f64 / 1000.0 * fps).round();
    if per.is_finite() && per >= 1.0 { per as usize } else { 1 }
}

/// Deliver `source` at `fps` through a capture sweep and return what the
/// session kept.
fn simulate_capture(
    source: &FrameSequence,
    interval: Duration,
    fps: f64,
) -> Result<FrameSequence, String> {
    if !(fps.is_finite() && fps > 0.0) {
        return Err(format!("--simulate-fps must be positive, got {fps}"));
    }
    let period = Duration::from_secs_f64(1.0 / fps);
    let session = Session::new();
    let mut capture = CaptureController::with_interval(session.clone(), interval);
    capture.source_started();
    capture.toggle_on();
    for (i, frame) in source.iter().enumerate() {
        let elapsed = if i == 0 { Duration::ZERO } else { period };
        capture.tick(LiveFrame::new(frame.image().clone(), elapsed));
    }
    capture
        .toggle_off()
        .map_err(|e| format!("Capture error: {e}"))?;
    info!(
        delivered = source.len(),
        kept = session.len(),
        interval_ms = interval.as_millis(),
        "simulated capture"
    );
    Ok(session.snapshot().frames)
}

fn write_output(path: &std::path::Path, panorama: &panosweep_stitch::RgbImage) {
    let written = panosweep_io::encode_png(panorama)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            std::fs::write(path, &bytes)
                .map(|()| bytes.len())
                .map_err(|e| e.to_string())
        });
    match written {
        Ok(len) => eprintln!(
            "Panorama {}x{} written to {} ({len} bytes)",
            panorama.width(),
            panorama.height(),
            path.display(),
        ),
        Err(e) => eprintln!("Error writing panorama to {}: {e}", path.display()),
    }
}

/// Engine wrapper that counts real stitches.
struct CountingEngine {
    inner: Stitcher,
    calls: AtomicUsize,
}

impl StitchEngine for CountingEngine {
    fn stitch(&self, frames: &FrameSequence, options: StitchOptions) -> StitchResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.stitch(frames, options)
    }
}

#[derive(Serialize)]
struct OptionOutcome {
    options: StitchOptions,
    stitched: bool,
    width: u32,
    height: u32,
    #[serde(with = "millis")]
    duration: Duration,
}

#[derive(Serialize)]
struct AllOptionsReport {
    renders: usize,
    engine_calls: usize,
    cache_hits: usize,
    outcomes: Vec<OptionOutcome>,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }
}

/// Walk the four option values the way a reviewer would, twice, through
/// one session cache.
fn run_all_options(cli: &Cli, frames: &FrameSequence, config: StitchConfig) -> ExitCode {
    let session = Session::new();
    for frame in frames {
        session.append(frame.clone());
    }
    let engine = Arc::new(CountingEngine {
        inner: Stitcher::new(config),
        calls: AtomicUsize::new(0),
    });
    let mut review = Review::new(session, Arc::clone(&engine));

    let walk: [fn(&mut Review<Arc<CountingEngine>>) -> StitchResult; 4] = [
        Review::render,
        Review::toggle_blender,
        Review::toggle_wave_correction,
        Review::toggle_blender,
    ];

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        for step in walk {
            let start = Instant::now();
            let result = step(&mut review);
            let duration = start.elapsed();
            let (width, height) = result.panorama().map_or((0, 0), |p| p.dimensions());
            outcomes.push(OptionOutcome {
                options: review.options(),
                stitched: result.is_stitched(),
                width,
                height,
                duration,
            });
        }
    }

    if let Some(ref path) = cli.output
        && let Some(panorama) = review.current().and_then(StitchResult::panorama)
    {
        write_output(path, panorama);
    }

    let engine_calls = engine.calls.load(Ordering::Relaxed);
    let report = AllOptionsReport {
        renders: outcomes.len(),
        engine_calls,
        cache_hits: outcomes.len().saturating_sub(engine_calls),
        outcomes,
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_all_options(&report);
    }
    ExitCode::SUCCESS
}

fn print_all_options(report: &AllOptionsReport) {
    println!("All Options Report\n{}", "=".repeat(60));
    println!(
        "{:<10} {:<12} {:>12} {:>12}",
        "Wave", "Blender", "Result", "Time (ms)"
    );
    println!("{}", "-".repeat(50));
    for outcome in &report.outcomes {
        let result = if outcome.stitched {
            format!("{}x{}", outcome.width, outcome.height)
        } else {
            "failed".to_owned()
        };
        println!(
            "{:<10} {:<12} {:>12} {:>10.3}ms",
            if outcome.options.wave_correct { "on" } else { "off" },
            if outcome.options.multi_band { "multiband" } else { "feather" },
            result,
            outcome.duration.as_secs_f64() * 1000.0,
        );
    }
    println!();
    println!(
        "Renders: {}  |  Engine calls: {}  |  Cache hits: {}",
        report.renders, report.engine_calls, report.cache_hits
    );
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&StitchDiagnostics) -> Option<Duration>;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[StitchDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Features", |d| Some(d.features.duration)),
        ("Matching", |d| Some(d.matching.duration)),
        ("Cameras", |d| Some(d.cameras.duration)),
        ("Wave Correction", |d| d.wave_correction.as_ref().map(|s| s.duration)),
        ("Warp", |d| Some(d.warp.duration)),
        ("Exposure", |d| d.exposure.as_ref().map(|s| s.duration)),
        ("Seams", |d| Some(d.seams.duration)),
        ("Blend", |d| Some(d.blend.duration)),
    ];

    for (name, extractor) in stage_extractors {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(extractor)
            .map(|dur| dur.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_synthetic_run() {
        let cli = Cli::try_parse_from([
            "panosweep-bench",
            "--synthetic",
            "4",
            "--feather",
            "--runs",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.synthetic, Some(4));
        assert!(cli.feather);
        assert_eq!(cli.runs, 2);
    }

    #[test]
    fn images_or_synthetic_required() {
        assert!(Cli::try_parse_from(["panosweep-bench"]).is_err());
        assert!(Cli::try_parse_from(["panosweep-bench", "a.png", "--synthetic", "3"]).is_err());
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = Cli::try_parse_from([
            "panosweep-bench",
            "--synthetic",
            "2",
            "--max-features",
            "10",
            "--config-json",
            r#"{"max_features": 123}"#,
        ])
        .unwrap();
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.max_features, 123);
        assert_eq!(config.work_megapix, StitchConfig::DEFAULT_WORK_MEGAPIX);
    }

    #[test]
    fn zero_window_matches_all_pairs() {
        let cli =
            Cli::try_parse_from(["panosweep-bench", "--synthetic", "2", "--match-window", "0"])
                .unwrap();
        assert_eq!(config_from_cli(&cli).unwrap().match_window, None);
    }

    #[test]
    fn capture_keeps_one_frame_per_interval() {
        assert_eq!(live_frames_per_capture(1000, 10.0), 10);
        assert_eq!(live_frames_per_capture(10, 10.0), 1);
        let source = SweepSpec {
            width: 16,
            height: 12,
            ..SweepSpec::default()
        }
        .with_frames(21)
        .render(&Scene::new(2));
        let kept = simulate_capture(&source, Duration::from_millis(1000), 10.0).unwrap();
        // Deliveries 0, 10 and 20 are kept; toggle_off adds delivery 20 again.
        assert_eq!(kept.len(), 4);
    }
}

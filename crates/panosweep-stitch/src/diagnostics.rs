//! Stitching diagnostics: timing and counts for each pipeline stage.
//!
//! [`stitch_with_diagnostics`] drives the staged [`Pipeline`] and records
//! how long each stage took along with stage-specific metrics. Time is
//! read through the [`Clock`] trait so callers can supply their own
//! source; [`SystemClock`] uses the `web-time` crate, which is
//! `std::time::Instant` on native targets and `performance.now()` on WASM.
//!
//! Durations are serialized as fractional seconds (`f64`), since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;
use crate::types::{FrameSequence, RgbImage, StitchConfig, StitchError, StitchOptions};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of monotonic timestamps.
pub trait Clock {
    type Instant;

    fn now(&self) -> Self::Instant;

    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by `web_time::Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = web_time::Instant;

    fn now(&self) -> Self::Instant {
        web_time::Instant::now()
    }

    fn elapsed(&self, since: &Self::Instant) -> Duration {
        since.elapsed()
    }
}

/// Diagnostics collected from one stitch.
///
/// Stages that are conditionally skipped have `Option` fields that are
/// `None` when the stage did not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchDiagnostics {
    pub features: StageDiagnostics,
    pub matching: StageDiagnostics,
    pub cameras: StageDiagnostics,
    /// Only when `options.wave_correct`.
    pub wave_correction: Option<StageDiagnostics>,
    pub warp: StageDiagnostics,
    /// Only when `config.exposure_compensation`.
    pub exposure: Option<StageDiagnostics>,
    pub seams: StageDiagnostics,
    pub blend: StageDiagnostics,
    /// Wall-clock duration of the whole stitch (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    pub summary: StitchSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    Features {
        frame_count: usize,
        /// Registration scale relative to the input frames.
        work_scale: f64,
        total_keypoints: usize,
        min_keypoints: usize,
        /// Frames with at least `config.min_features` keypoints.
        usable_frames: usize,
    },
    Matching {
        candidate_pairs: usize,
        accepted_pairs: usize,
        /// Frames merged into an earlier frame showing the same view.
        duplicate_frames: usize,
        mean_confidence: f64,
        components: usize,
    },
    Cameras {
        /// Focal estimate from the homographies, before refinement.
        initial_focal: f64,
        median_focal: f64,
        /// Index of the reference camera.
        center: usize,
        /// RMS ray residual after refinement, in registration pixels.
        rms: f64,
        evaluations: usize,
        converged: bool,
    },
    WaveCorrection {
        camera_count: usize,
    },
    Warp {
        surface: String,
        scale: f64,
        canvas_width: u32,
        canvas_height: u32,
    },
    Exposure {
        min_gain: f64,
        max_gain: f64,
    },
    Seams {
        /// Sum of warped-frame mask pixels.
        valid_pixels: u64,
        /// Sum of ownership mask pixels; the difference went to overlaps.
        owned_pixels: u64,
    },
    Blend {
        strategy: String,
        bands: usize,
        width: u32,
        height: u32,
    },
}

/// High-level summary of one stitch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchSummary {
    pub frame_count: usize,
    pub options: StitchOptions,
    pub accepted_pairs: usize,
    pub panorama_width: u32,
    pub panorama_height: u32,
}

impl StitchDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Stitch Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Frames: {}  |  wave correction: {}  |  multi-band: {}",
            self.summary.frame_count,
            self.summary.options.wave_correct,
            self.summary.options.multi_band,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Pairs: {}  |  Panorama: {}x{}",
            self.summary.accepted_pairs, self.summary.panorama_width, self.summary.panorama_height,
        ));

        lines.join("\n")
    }

    /// Stages that ran, in order, with display names.
    #[must_use]
    pub fn stages(&self) -> Vec<(&'static str, &StageDiagnostics)> {
        let mut stages = vec![
            ("Features", &self.features),
            ("Matching", &self.matching),
            ("Cameras", &self.cameras),
        ];
        if let Some(ref wave) = self.wave_correction {
            stages.push(("Wave Correction", wave));
        }
        stages.push(("Warp", &self.warp));
        if let Some(ref exposure) = self.exposure {
            stages.push(("Exposure", exposure));
        }
        stages.push(("Seams", &self.seams));
        stages.push(("Blend", &self.blend));
        stages
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Features {
            frame_count,
            work_scale,
            total_keypoints,
            min_keypoints,
            usable_frames,
        } => format!(
            "{frame_count} frames @ {work_scale:.3}, {total_keypoints} keypoints \
             (min {min_keypoints}), {usable_frames} usable",
        ),
        StageMetrics::Matching {
            candidate_pairs,
            accepted_pairs,
            duplicate_frames,
            mean_confidence,
            components,
        } => format!(
            "{accepted_pairs}/{candidate_pairs} pairs, {duplicate_frames} duplicate(s), \
             confidence {mean_confidence:.2}, {components} component(s)",
        ),
        StageMetrics::Cameras {
            initial_focal,
            median_focal,
            center,
            rms,
            evaluations,
            converged,
        } => format!(
            "f {initial_focal:.1}->{median_focal:.1} ref={center} rms={rms:.3} \
             evals={evaluations} converged={converged}",
        ),
        StageMetrics::WaveCorrection { camera_count } => format!("{camera_count} cameras"),
        StageMetrics::Warp {
            surface,
            scale,
            canvas_width,
            canvas_height,
        } => format!("{surface} s={scale:.1} canvas {canvas_width}x{canvas_height}"),
        StageMetrics::Exposure { min_gain, max_gain } => {
            format!("gains {min_gain:.3}..{max_gain:.3}")
        }
        StageMetrics::Seams {
            valid_pixels,
            owned_pixels,
        } => format!("{owned_pixels}/{valid_pixels} px owned"),
        StageMetrics::Blend {
            strategy,
            bands,
            width,
            height,
        } => format!("{strategy} bands={bands} -> {width}x{height}"),
    }
}

/// Time one stage: run `f`, returning its output with the elapsed time.
fn timed<C: Clock, T>(clock: &C, f: impl FnOnce() -> T) -> (T, Duration) {
    let start = clock.now();
    let out = f();
    (out, clock.elapsed(&start))
}

/// Run the full pipeline, collecting per-stage diagnostics.
///
/// Unlike [`crate::try_stitch`] there is no single-frame shortcut: the
/// pipeline always runs, so at least two usable frames are required.
///
/// # Errors
///
/// Returns the first [`StitchError`] any stage produces, or
/// [`StitchError::InvalidConfig`] for a bad config.
pub fn stitch_with_diagnostics<C: Clock>(
    frames: &FrameSequence,
    options: StitchOptions,
    config: &StitchConfig,
    clock: &C,
) -> Result<(RgbImage, StitchDiagnostics), StitchError> {
    config.validate()?;
    let start = clock.now();
    let frame_count = frames.len();

    let (detected, d) = timed(clock, || {
        Pipeline::new(frames.clone(), options, config.clone()).detect_features()
    });
    let detected = detected?;
    let features = StageDiagnostics {
        duration: d,
        metrics: detected.metrics(),
    };

    let (matched, d) = timed(clock, || detected.match_pairs());
    let matched = matched?;
    let accepted_pairs = matched.pairs().len();
    let matching = StageDiagnostics {
        duration: d,
        metrics: matched.metrics(),
    };

    let (estimated, d) = timed(clock, || matched.estimate_cameras());
    let estimated = estimated?;
    let cameras = StageDiagnostics {
        duration: d,
        metrics: estimated.metrics(),
    };

    let (straightened, d) = timed(clock, || estimated.straighten());
    let wave_correction = straightened
        .metrics()
        .map(|metrics| StageDiagnostics { duration: d, metrics });

    let (warped, d) = timed(clock, || straightened.warp());
    let warped = warped?;
    let warp = StageDiagnostics {
        duration: d,
        metrics: warped.metrics(),
    };

    let (compensated, d) = timed(clock, || warped.compensate_exposure());
    let exposure = compensated
        .metrics()
        .map(|metrics| StageDiagnostics { duration: d, metrics });

    let (seamed, d) = timed(clock, || compensated.find_seams());
    let seams = StageDiagnostics {
        duration: d,
        metrics: seamed.metrics(),
    };

    let (blended, d) = timed(clock, || seamed.blend());
    let blended = blended?;
    let blend = StageDiagnostics {
        duration: d,
        metrics: blended.metrics(),
    };

    let panorama = blended.into_panorama();
    let diagnostics = StitchDiagnostics {
        features,
        matching,
        cameras,
        wave_correction,
        warp,
        exposure,
        seams,
        blend,
        total_duration: clock.elapsed(&start),
        summary: StitchSummary {
            frame_count,
            options,
            accepted_pairs,
            panorama_width: panorama.width(),
            panorama_height: panorama.height(),
        },
    };
    Ok((panorama, diagnostics))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Advances one millisecond per reading.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get() + 1;
            self.0.set(t);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn stage(ms: u64, metrics: StageMetrics) -> StageDiagnostics {
        StageDiagnostics {
            duration: Duration::from_millis(ms),
            metrics,
        }
    }

    fn sample() -> StitchDiagnostics {
        StitchDiagnostics {
            features: stage(
                10,
                StageMetrics::Features {
                    frame_count: 3,
                    work_scale: 1.0,
                    total_keypoints: 900,
                    min_keypoints: 250,
                    usable_frames: 3,
                },
            ),
            matching: stage(
                20,
                StageMetrics::Matching {
                    candidate_pairs: 3,
                    accepted_pairs: 2,
                    duplicate_frames: 0,
                    mean_confidence: 3.5,
                    components: 1,
                },
            ),
            cameras: stage(
                5,
                StageMetrics::Cameras {
                    initial_focal: 150.0,
                    median_focal: 160.0,
                    center: 1,
                    rms: 0.4,
                    evaluations: 12,
                    converged: true,
                },
            ),
            wave_correction: None,
            warp: stage(
                8,
                StageMetrics::Warp {
                    surface: "spherical".to_owned(),
                    scale: 160.0,
                    canvas_width: 300,
                    canvas_height: 130,
                },
            ),
            exposure: None,
            seams: stage(
                4,
                StageMetrics::Seams {
                    valid_pixels: 50_000,
                    owned_pixels: 35_000,
                },
            ),
            blend: stage(
                12,
                StageMetrics::Blend {
                    strategy: "feather".to_owned(),
                    bands: 0,
                    width: 290,
                    height: 125,
                },
            ),
            total_duration: Duration::from_millis(59),
            summary: StitchSummary {
                frame_count: 3,
                options: StitchOptions::new(false, false),
                accepted_pairs: 2,
                panorama_width: 290,
                panorama_height: 125,
            },
        }
    }

    #[test]
    fn report_lists_stages_that_ran() {
        let report = sample().report();
        assert!(report.contains("Stitch Diagnostics Report"));
        assert!(report.contains("Matching"));
        assert!(report.contains("feather"));
        assert!(!report.contains("Wave Correction"));
        assert!(!report.contains("Exposure"));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 0.059).abs() < 1e-9);
        let back: StitchDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_duration, Duration::from_millis(59));
        assert_eq!(back.blend.metrics, sample().blend.metrics);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<StitchDiagnostics>(json).is_err());
    }

    #[test]
    fn diagnostics_cover_every_enabled_stage() {
        let frames = crate::synthetic::SweepSpec::default()
            .with_frames(3)
            .render(&crate::synthetic::Scene::new(11));
        let clock = TickClock(Cell::new(0));
        let (panorama, diag) = stitch_with_diagnostics(
            &frames,
            StitchOptions::default(),
            &StitchConfig::default(),
            &clock,
        )
        .unwrap();
        assert!(diag.wave_correction.is_some());
        assert!(diag.exposure.is_some());
        assert_eq!(diag.stages().len(), 8);
        assert_eq!(diag.summary.panorama_width, panorama.width());
        assert!(diag.features.duration >= Duration::from_millis(1));
        assert!(matches!(
            diag.blend.metrics,
            StageMetrics::Blend { ref strategy, .. } if strategy == "multi_band"
        ));
    }
}

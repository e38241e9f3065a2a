use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use serde::Serialize;

use fall_monitor_rs::alert::{AlertDispatcher, DryRunTransport};
use fall_monitor_rs::clock::SystemClock;
use fall_monitor_rs::config::{AlertConfig, AlertMode, DetectionConfig, ModemTimings, MonitorConfig};
use fall_monitor_rs::metrics::MetricsRecorder;
use fall_monitor_rs::source::{AttachedLandmarks, FrameSource, LastFrameHold, PoseStream};
use fall_monitor_rs::{FallStateMachine, Monitor, PostureClassifier};

#[derive(Parser, Debug)]
struct Args {
    /// Recorded pose log (.ndjson / .jsonl, optionally .gz)
    #[arg(long, conflicts_with = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of pose logs to batch replay
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON configuration file (detection and camera sections are used)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the trunk/leg/head harness profile instead of the configured detection
    #[arg(long, default_value_t = false)]
    trunk_leg_head: bool,

    /// Seconds to keep feeding the last frame after a log ends
    #[arg(long)]
    hold_timeout: Option<f64>,

    /// Frame rate used for the last-frame hold
    #[arg(long, default_value = "30")]
    fps: f64,

    /// Write the JSON summary here as well as stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Serialize, Debug)]
struct LogResult {
    log: String,
    detected: bool,
    /// Seconds from the first frame to confirmation.
    detection_time: Option<f64>,
    detection_frame: Option<u64>,
    total_frames: u64,
    recording_duration: f64,
    analysis_duration: f64,
    alert_ok: Option<bool>,
    error: Option<String>,
}

#[derive(Serialize, Debug)]
struct BatchSummary {
    logs: usize,
    detected: usize,
    errors: usize,
    detection_rate: f64,
    mean_detection_time: Option<f64>,
    results: Vec<LogResult>,
}

fn is_pose_log(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    [".ndjson", ".ndjson.gz", ".jsonl", ".jsonl.gz"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

fn dry_run_alerts() -> AlertConfig {
    AlertConfig {
        phone_number: "+0000000000".to_string(),
        mode: AlertMode::Tones { duration_secs: 0.0 },
        timings: ModemTimings {
            text_mode_wait: 0.0,
            recipient_wait: 0.0,
            body_wait: 0.0,
            submit_wait: 0.0,
            dial_wait: 0.0,
            answer_wait: 0.0,
            tone_wait: 0.0,
            tone_gap: 0.0,
            hangup_wait: 0.0,
            ping_wait: 0.0,
        },
        ..AlertConfig::default()
    }
}

fn run_once(path: &Path, config: &MonitorConfig, args: &Args) -> anyhow::Result<LogResult> {
    let analysis_start = Instant::now();
    let stream = PoseStream::open_log(path)?;
    let hold_timeout = args.hold_timeout.unwrap_or(config.detection.hold_timeout_secs);
    let mut source = LastFrameHold::new(stream, SystemClock, hold_timeout, args.fps);

    let rules = &config.detection;
    let mut monitor = Monitor::new(
        AttachedLandmarks::new(
            config.camera.min_detection_confidence,
            config.camera.min_tracking_confidence,
        ),
        PostureClassifier::new(rules.policy.clone()),
        FallStateMachine::new(rules.fall_config(), "replay"),
        MetricsRecorder::new(&config.metrics),
        SystemClock,
    )
    .with_dispatcher(AlertDispatcher::new(
        DryRunTransport::new(),
        SystemClock,
        dry_run_alerts(),
    ));

    let mut first_ts: Option<f64> = None;
    let mut last_recorded_ts = 0.0;
    let mut recorded_frames = 0u64;
    let mut detection = None;

    while let Some(frame) = source.next_frame()? {
        if !source.is_holding() {
            first_ts.get_or_insert(frame.timestamp);
            last_recorded_ts = frame.timestamp;
            recorded_frames += 1;
        }
        let outcome = monitor.process_frame(&frame);
        if let Some(incident) = outcome.transition.incident {
            let origin = first_ts.unwrap_or(0.0);
            info!(
                "[REPLAY] {} fall confirmed at frame {} ({:.2}s)",
                path.display(),
                frame.index,
                incident.confirmed_at - origin
            );
            detection = Some((
                incident.confirmed_at - origin,
                frame.index,
                outcome.alert.map(|r| r.any_success()),
            ));
            break;
        }
    }

    let origin = first_ts.unwrap_or(0.0);
    Ok(LogResult {
        log: path.display().to_string(),
        detected: detection.is_some(),
        detection_time: detection.map(|d| d.0),
        detection_frame: detection.map(|d| d.1),
        total_frames: recorded_frames,
        recording_duration: last_recorded_ts - origin,
        analysis_duration: analysis_start.elapsed().as_secs_f64(),
        alert_ok: detection.and_then(|d| d.2),
        error: None,
    })
}

fn failed(path: &Path, error: &anyhow::Error) -> LogResult {
    LogResult {
        log: path.display().to_string(),
        detected: false,
        detection_time: None,
        detection_frame: None,
        total_frames: 0,
        recording_duration: 0.0,
        analysis_duration: 0.0,
        alert_ok: None,
        error: Some(format!("{:#}", error)),
    }
}

fn summarize(results: Vec<LogResult>) -> BatchSummary {
    let detected: Vec<f64> = results
        .iter()
        .filter(|r| r.detected)
        .filter_map(|r| r.detection_time)
        .collect();
    let detected_count = results.iter().filter(|r| r.detected).count();
    let errors = results.iter().filter(|r| r.error.is_some()).count();
    BatchSummary {
        logs: results.len(),
        detected: detected_count,
        errors,
        detection_rate: if results.is_empty() {
            0.0
        } else {
            detected_count as f64 / results.len() as f64
        },
        mean_detection_time: if detected.is_empty() {
            None
        } else {
            Some(detected.iter().sum::<f64>() / detected.len() as f64)
        },
        results,
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load(args.config.as_deref())?;
    if args.trunk_leg_head {
        config.detection = DetectionConfig::trunk_leg_head_profile();
    }
    let mut results = Vec::new();

    if let Some(dir) = args.log_dir.as_ref() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_pose_log(p))
            .collect();
        paths.sort();
        for path in paths {
            match run_once(&path, &config, &args) {
                Ok(res) => results.push(res),
                Err(e) => {
                    warn!("[REPLAY] Failed {}: {:#}", path.display(), e);
                    results.push(failed(&path, &e));
                }
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &config, &args)?);
    } else {
        anyhow::bail!("Provide --log or --log-dir");
    }

    let summary = summarize(results);
    let json = serde_json::to_string_pretty(&summary)?;
    println!("{}", json);
    if let Some(path) = args.output.as_ref() {
        std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

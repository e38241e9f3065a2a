use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fall_monitor_rs::alert::serial_dispatcher;
use fall_monitor_rs::clock::SystemClock;
use fall_monitor_rs::config::{DetectionConfig, MonitorConfig};
use fall_monitor_rs::dashboard;
use fall_monitor_rs::live_status::LiveView;
use fall_monitor_rs::metrics::MetricsRecorder;
use fall_monitor_rs::source::{
    discover_camera, AttachedLandmarks, EstimatorProcess, FrameSource, LastFrameHold, PoseStream,
};
use fall_monitor_rs::{FallStateMachine, Monitor, PostureClassifier, SessionSummary};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    AngleAspect,
    TrunkLegHead,
}

#[derive(Parser, Debug)]
#[command(name = "fall_monitor")]
#[command(about = "Camera fall detection with SMS and voice-call alerts", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Camera index (probed when omitted)
    #[arg(long)]
    camera: Option<u32>,

    /// Recorded pose log (.ndjson or .ndjson.gz) instead of a live camera
    #[arg(long)]
    recording: Option<PathBuf>,

    /// Detection rule set
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Number to alert
    #[arg(long)]
    phone: Option<String>,

    /// Modem serial port
    #[arg(long)]
    modem_port: Option<String>,

    /// Dashboard port
    #[arg(long)]
    port: Option<u16>,

    /// Disable the web dashboard
    #[arg(long)]
    no_dashboard: bool,

    /// Output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(camera) = self.camera {
            config.camera.index = Some(camera);
        }
        match self.policy {
            Some(PolicyArg::TrunkLegHead) => {
                config.detection = DetectionConfig {
                    tracking_loss: config.detection.tracking_loss,
                    hold_timeout_secs: config.detection.hold_timeout_secs,
                    ..DetectionConfig::trunk_leg_head_profile()
                };
            }
            Some(PolicyArg::AngleAspect) => {
                config.detection.policy = Default::default();
            }
            None => {}
        }
        if let Some(phone) = &self.phone {
            config.alert.phone_number = phone.clone();
        }
        if let Some(port) = &self.modem_port {
            config.alert.modem_port = port.clone();
        }
        if let Some(port) = self.port {
            config.dashboard.port = port;
        }
        if self.no_dashboard {
            config.dashboard.enabled = false;
        }
        if let Some(dir) = &self.output_dir {
            config.metrics.output_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = MonitorConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);

    info!("[{}] Fall Monitor RS Starting", ts_now());
    info!("  Policy: {}", config.detection.policy.name());
    info!(
        "  Confirm: {:.1}s, velocity threshold {:.0}px/frame",
        config.detection.confirm_time_secs, config.detection.velocity_threshold
    );
    info!("  Output Dir: {}", config.metrics.output_dir.display());

    std::fs::create_dir_all(&config.metrics.output_dir).with_context(|| {
        format!("creating {}", config.metrics.output_dir.display())
    })?;

    let view = LiveView::new();
    if config.dashboard.enabled {
        let dashboard_view = view.clone();
        let port = config.dashboard.port;
        tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard(dashboard_view, port).await {
                error!("[DASHBOARD] server stopped: {}", e);
            }
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[{}] Ctrl-C received, finishing current frame...", ts_now());
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let recording = args.recording.clone();
    let summary = tokio::task::spawn_blocking(move || run_monitor(config, recording, view, &shutdown))
        .await
        .context("monitor thread panicked")??;

    info!(
        "[{}] Session ended: {} frames, {} incident(s), {} alert(s)",
        ts_now(),
        summary.frames_processed,
        summary.incidents.len(),
        summary.alerts.len()
    );
    Ok(())
}

fn run_monitor(
    config: MonitorConfig,
    recording: Option<PathBuf>,
    view: LiveView,
    shutdown: &AtomicBool,
) -> Result<SessionSummary> {
    let mut source: Box<dyn FrameSource> = match &recording {
        Some(path) => {
            let stream = PoseStream::open_log(path)
                .with_context(|| format!("opening recording {}", path.display()))?;
            Box::new(LastFrameHold::new(
                stream,
                SystemClock,
                config.detection.hold_timeout_secs,
                30.0,
            ))
        }
        None => {
            let camera = match config.camera.index {
                Some(index) => index,
                None => discover_camera(config.camera.probe_limit).context("no camera available")?,
            };
            Box::new(
                EstimatorProcess::spawn(&config.camera.estimator_command, camera, SystemClock)
                    .context("starting pose estimator")?,
            )
        }
    };

    let estimator = AttachedLandmarks::new(
        config.camera.min_detection_confidence,
        config.camera.min_tracking_confidence,
    );
    let machine = FallStateMachine::new(config.detection.fall_config(), &config.alert.sms_message);
    let mut monitor = Monitor::new(
        estimator,
        PostureClassifier::new(config.detection.policy.clone()),
        machine,
        MetricsRecorder::new(&config.metrics),
        SystemClock,
    )
    .with_live_view(view)
    .with_status_file(
        config.metrics.output_dir.join("live_status.json"),
        config.metrics.status_interval_secs,
    );

    if config.alert.phone_number.is_empty() {
        warn!("[ALERT] no phone number configured, running detection only");
    } else {
        monitor = monitor.with_dispatcher(serial_dispatcher(&config.alert));
    }

    let result = monitor.run(source.as_mut(), shutdown);

    let summary = monitor.summary();
    let path = config
        .metrics
        .output_dir
        .join(format!("session_{}.json", ts_now_clean()));
    summary
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("[{}] Session summary saved to {}", ts_now(), path.display());

    result.context("frame acquisition failed")?;
    Ok(summary)
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

//! Frame acquisition and pose estimation boundaries.
//!
//! Frames arrive as newline-delimited JSON records, one per captured image,
//! produced either live by an external pose estimator process or read back
//! from a recorded log.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::clock::{secs, Clock};
use crate::types::{Frame, FrameSize, Landmark, PoseSample};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("no camera found in {dir} (probed video0..video{probed})")]
    NoCamera { dir: PathBuf, probed: u32 },

    #[error("failed to open {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("estimator command is empty")]
    EmptyCommand,

    #[error("failed to launch estimator `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed frame record on line {line}")]
    Parse {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame stream read failed")]
    Io(#[from] std::io::Error),
}

pub trait FrameSource {
    /// `Ok(None)` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    fn describe(&self) -> String {
        String::from("frames")
    }
}

pub trait PoseEstimator {
    /// None when no person is found in the frame.
    fn estimate(&mut self, frame: &Frame) -> Option<PoseSample>;
}

#[derive(Deserialize)]
struct FrameRecord {
    #[serde(default)]
    index: Option<u64>,
    #[serde(default)]
    timestamp: Option<f64>,
    width: u32,
    height: u32,
    #[serde(default)]
    landmarks: Option<Vec<Landmark>>,
    #[serde(default)]
    image_path: Option<PathBuf>,
}

/// Frame records read line by line from any `BufRead`.
pub struct PoseStream<R: BufRead> {
    reader: R,
    label: String,
    base_dir: Option<PathBuf>,
    nominal_fps: f64,
    arrival_clock: Option<Box<dyn Clock>>,
    line_no: u64,
    next_index: u64,
}

impl<R: BufRead> PoseStream<R> {
    pub fn new(reader: R, label: &str) -> Self {
        Self {
            reader,
            label: label.to_string(),
            base_dir: None,
            nominal_fps: 30.0,
            arrival_clock: None,
            line_no: 0,
            next_index: 0,
        }
    }

    /// Relative `image_path`s are resolved against `dir`.
    pub fn with_base_dir(mut self, dir: &Path) -> Self {
        self.base_dir = Some(dir.to_path_buf());
        self
    }

    /// Rate used to derive timestamps for records that carry none.
    pub fn with_nominal_fps(mut self, fps: f64) -> Self {
        if fps > 0.0 {
            self.nominal_fps = fps;
        }
        self
    }

    /// Records without a timestamp are stamped with `clock.now()` on arrival
    /// instead of being derived from the frame index.
    pub fn with_arrival_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.arrival_clock = Some(Box::new(clock));
        self
    }

    fn load_image(&self, path: &Path) -> Option<Vec<u8>> {
        let full = match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        match std::fs::read(&full) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("[MONITOR] frame image {} unreadable: {}", full.display(), e);
                None
            }
        }
    }
}

impl PoseStream<Box<dyn BufRead>> {
    /// Recorded log; `.gz` files are decompressed on the fly.
    pub fn open_log(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let reader: Box<dyn BufRead> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let stream = PoseStream::new(reader, &path.display().to_string());
        Ok(match path.parent() {
            Some(dir) => stream.with_base_dir(dir),
            None => stream,
        })
    }
}

impl<R: BufRead> FrameSource for PoseStream<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if !line.trim().is_empty() {
                break;
            }
        }

        let record: FrameRecord =
            serde_json::from_str(line.trim()).map_err(|source| SourceError::Parse {
                line: self.line_no,
                source,
            })?;

        let index = record.index.unwrap_or(self.next_index);
        self.next_index = index + 1;
        let timestamp = match (record.timestamp, &self.arrival_clock) {
            (Some(ts), _) => ts,
            (None, Some(clock)) => clock.now(),
            (None, None) => index as f64 / self.nominal_fps,
        };
        let image = record.image_path.as_deref().and_then(|p| self.load_image(p));

        Ok(Some(Frame {
            index,
            timestamp,
            size: FrameSize::new(record.width, record.height),
            landmarks: record.landmarks,
            image,
        }))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Estimator child process streaming frame records on stdout. Killed on drop.
///
/// Unstamped records take the arrival time from the given clock.
pub struct EstimatorProcess {
    child: Child,
    stream: PoseStream<BufReader<ChildStdout>>,
}

impl EstimatorProcess {
    /// `{camera}` in `argv` is replaced with the camera index.
    pub fn spawn(
        argv: &[String],
        camera: u32,
        clock: impl Clock + 'static,
    ) -> Result<Self, SourceError> {
        let argv: Vec<String> = argv
            .iter()
            .map(|a| a.replace("{camera}", &camera.to_string()))
            .collect();
        let (program, args) = argv.split_first().ok_or(SourceError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: program.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| SourceError::Spawn {
            program: program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout"),
        })?;
        info!("[MONITOR] estimator started: {}", argv.join(" "));

        Ok(Self {
            child,
            stream: PoseStream::new(BufReader::new(stdout), &format!("camera {}", camera))
                .with_arrival_clock(clock),
        })
    }
}

impl FrameSource for EstimatorProcess {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.stream.next_frame()
    }

    fn describe(&self) -> String {
        self.stream.describe()
    }
}

impl Drop for EstimatorProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Uses landmarks attached to the frame record, gated on their mean visibility.
///
/// The gate is `min_detection_confidence` while searching for a person and
/// `min_tracking_confidence` once one is tracked.
pub struct AttachedLandmarks {
    min_detection_confidence: f64,
    min_tracking_confidence: f64,
    tracking: bool,
}

impl AttachedLandmarks {
    pub fn new(min_detection_confidence: f64, min_tracking_confidence: f64) -> Self {
        Self {
            min_detection_confidence,
            min_tracking_confidence,
            tracking: false,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }
}

impl PoseEstimator for AttachedLandmarks {
    fn estimate(&mut self, frame: &Frame) -> Option<PoseSample> {
        let sample = frame
            .landmarks
            .clone()
            .and_then(PoseSample::from_landmarks);
        let threshold = if self.tracking {
            self.min_tracking_confidence
        } else {
            self.min_detection_confidence
        };
        let accepted = sample.filter(|s| s.mean_visibility() >= threshold);
        self.tracking = accepted.is_some();
        accepted
    }
}

/// Keeps replaying the last frame after the inner source ends, until `timeout_secs`
/// of wall-clock time has passed.
///
/// A recording that ends mid-fall still gets the chance to reach confirmation.
pub struct LastFrameHold<S: FrameSource, C: Clock> {
    inner: S,
    clock: C,
    timeout_secs: f64,
    frame_interval_secs: f64,
    last: Option<Frame>,
    hold_started: Option<f64>,
}

impl<S: FrameSource, C: Clock> LastFrameHold<S, C> {
    pub fn new(inner: S, clock: C, timeout_secs: f64, fps: f64) -> Self {
        Self {
            inner,
            clock,
            timeout_secs,
            frame_interval_secs: if fps > 0.0 { 1.0 / fps } else { 1.0 / 30.0 },
            last: None,
            hold_started: None,
        }
    }

    pub fn is_holding(&self) -> bool {
        self.hold_started.is_some()
    }
}

impl<S: FrameSource, C: Clock> FrameSource for LastFrameHold<S, C> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.hold_started.is_none() {
            if let Some(frame) = self.inner.next_frame()? {
                self.last = Some(frame.clone());
                return Ok(Some(frame));
            }
            if self.last.is_none() {
                return Ok(None);
            }
            info!(
                "[REPLAY] end of {}, holding last frame for up to {:.1}s",
                self.inner.describe(),
                self.timeout_secs
            );
            self.hold_started = Some(self.clock.now());
        }

        let started = self.hold_started.unwrap_or_else(|| self.clock.now());
        let Some(last) = self.last.as_mut() else {
            return Ok(None);
        };
        if self.clock.now() - started >= self.timeout_secs {
            warn!("[REPLAY] last-frame hold timed out after {:.1}s", self.timeout_secs);
            return Ok(None);
        }

        self.clock.sleep(secs(self.frame_interval_secs));
        let held = Frame {
            index: last.index + 1,
            timestamp: last.timestamp + self.frame_interval_secs,
            ..last.clone()
        };
        *last = held.clone();
        Ok(Some(held))
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// First `/dev/video<N>` that exists, probing `0..probe_limit`.
pub fn discover_camera(probe_limit: u32) -> Result<u32, SourceError> {
    discover_camera_in(Path::new("/dev"), probe_limit)
}

pub fn discover_camera_in(dir: &Path, probe_limit: u32) -> Result<u32, SourceError> {
    for index in 0..probe_limit {
        let device = dir.join(format!("video{}", index));
        if device.exists() {
            info!("[MONITOR] camera found at {}", device.display());
            return Ok(index);
        }
    }
    Err(SourceError::NoCamera {
        dir: dir.to_path_buf(),
        probed: probe_limit.saturating_sub(1),
    })
}


#[cfg(test)]
mod tests {
    use super::fakes::FramesFromVec;
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::types::NUM_LANDMARKS;
    use std::io::Cursor;

    fn record(index: u64, ts: f64, visibility: f64) -> String {
        let landmarks: Vec<String> = (0..NUM_LANDMARKS)
            .map(|_| format!(r#"{{"x":0.5,"y":0.5,"visibility":{}}}"#, visibility))
            .collect();
        format!(
            r#"{{"index":{},"timestamp":{},"width":640,"height":480,"landmarks":[{}]}}"#,
            index,
            ts,
            landmarks.join(",")
        )
    }

    fn frame(index: u64, ts: f64) -> Frame {
        Frame {
            index,
            timestamp: ts,
            size: FrameSize::new(640, 480),
            landmarks: None,
            image: None,
        }
    }

    #[test]
    fn test_stream_parses_records_and_skips_blank_lines() {
        let input = format!("{}\n\n{}\n{{\"width\":640,\"height\":480}}\n", record(0, 0.0, 0.9), record(1, 0.033, 0.9));
        let mut stream = PoseStream::new(Cursor::new(input), "test");

        let first = stream.next_frame().unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.landmarks.as_ref().map(|l| l.len()), Some(NUM_LANDMARKS));

        let second = stream.next_frame().unwrap().unwrap();
        assert_eq!(second.index, 1);

        // No person, no timestamp: index continues and time is derived at 30 fps.
        let third = stream.next_frame().unwrap().unwrap();
        assert_eq!(third.index, 2);
        assert!(third.landmarks.is_none());
        assert!((third.timestamp - 2.0 / 30.0).abs() < 1e-9);

        assert!(stream.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_malformed_record_reports_line() {
        let input = format!("{}\nnot json\n", record(0, 0.0, 0.9));
        let mut stream = PoseStream::new(Cursor::new(input), "test");
        stream.next_frame().unwrap();
        match stream.next_frame() {
            Err(SourceError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other.map(|f| f.map(|f| f.index))),
        }
    }

    #[test]
    fn test_gzip_log() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let path = std::env::temp_dir().join(format!("pose_log_{}.ndjson.gz", std::process::id()));
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        writeln!(encoder, "{}", record(0, 0.0, 0.9)).unwrap();
        writeln!(encoder, "{}", record(1, 0.5, 0.9)).unwrap();
        encoder.finish().unwrap();

        let mut stream = PoseStream::open_log(&path).unwrap();
        assert_eq!(stream.next_frame().unwrap().unwrap().index, 0);
        assert_eq!(stream.next_frame().unwrap().unwrap().timestamp, 0.5);
        assert!(stream.next_frame().unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_confidence_gate_switches_with_tracking() {
        let mut estimator = AttachedLandmarks::new(0.8, 0.4);
        let parse = |line: String| {
            PoseStream::new(Cursor::new(line), "t")
                .next_frame()
                .unwrap()
                .unwrap()
        };

        // 0.6 is below the detection minimum while searching.
        assert!(estimator.estimate(&parse(record(0, 0.0, 0.6))).is_none());
        assert!(estimator.estimate(&parse(record(1, 0.0, 0.9))).is_some());
        assert!(estimator.is_tracking());
        // Once tracking, the lower minimum applies.
        assert!(estimator.estimate(&parse(record(2, 0.0, 0.6))).is_some());
        assert!(estimator.estimate(&parse(record(3, 0.0, 0.3))).is_none());
        assert!(!estimator.is_tracking());
    }

    #[test]
    fn test_last_frame_hold_repeats_until_timeout() {
        let clock = FakeClock::starting_at(0.0);
        let inner = FramesFromVec::new(vec![frame(0, 0.0), frame(1, 0.1)]);
        let mut source = LastFrameHold::new(inner, clock.clone(), 1.0, 10.0);

        assert_eq!(source.next_frame().unwrap().unwrap().index, 0);
        assert_eq!(source.next_frame().unwrap().unwrap().index, 1);

        let mut held = 0;
        let mut last_ts = 0.1;
        while let Some(f) = source.next_frame().unwrap() {
            assert!(f.timestamp > last_ts);
            last_ts = f.timestamp;
            held += 1;
        }
        assert!(source.is_holding());
        // 1 s of hold at 10 fps
        assert!((9..=11).contains(&held), "held {} frames", held);
    }

    #[test]
    fn test_hold_on_empty_source_ends_immediately() {
        let mut source = LastFrameHold::new(FramesFromVec::new(Vec::new()), FakeClock::default(), 10.0, 30.0);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_discover_camera_picks_first_device() {
        let dir = std::env::temp_dir().join(format!("fake_dev_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            discover_camera_in(&dir, 15),
            Err(SourceError::NoCamera { probed: 14, .. })
        ));

        std::fs::write(dir.join("video3"), b"").unwrap();
        std::fs::write(dir.join("video7"), b"").unwrap();
        assert_eq!(discover_camera_in(&dir, 15).unwrap(), 3);
        assert!(discover_camera_in(&dir, 3).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_spawn_empty_command() {
        assert!(matches!(
            EstimatorProcess::spawn(&[], 0, FakeClock::default()),
            Err(SourceError::EmptyCommand)
        ));
    }

    #[test]
    fn test_unstamped_live_records_use_arrival_time() {
        // 10 fps camera, no timestamps in the records.
        let clock = FakeClock::starting_at(100.0);
        let input: String = (0..45)
            .map(|_| "{\"width\":640,\"height\":480}\n")
            .collect();
        let mut stream =
            PoseStream::new(Cursor::new(input), "camera 0").with_arrival_clock(clock.clone());

        let mut last = 0.0;
        while let Some(f) = stream.next_frame().unwrap() {
            last = f.timestamp;
            clock.advance(0.1);
        }
        assert!((last - 104.4).abs() < 1e-9, "last timestamp {}", last);

        // Explicit timestamps still win.
        let mut stamped = PoseStream::new(Cursor::new(record(0, 7.0, 0.9)), "camera 0")
            .with_arrival_clock(FakeClock::starting_at(100.0));
        assert_eq!(stamped.next_frame().unwrap().unwrap().timestamp, 7.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_estimator_process_stamps_with_clock() {
        let argv: Vec<String> = ["sh", "-c", "echo '{\"width\":640,\"height\":480}'"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut process = EstimatorProcess::spawn(&argv, 0, FakeClock::starting_at(50.0)).unwrap();
        let frame = process.next_frame().unwrap().unwrap();
        assert_eq!(frame.timestamp, 50.0);
        assert!(process.next_frame().unwrap().is_none());
    }
}

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::models::{EnrichedVideo, ProbeOutcome, VideoMetadata};

const HEADER_LEN: usize = 8 * 1024;

/// Extracts technical metadata from a single video file.
///
/// Implementations must return `Error::UnreadableMedia` only when the file
/// cannot be opened at all; anything openable yields a (possibly empty)
/// `VideoMetadata`.
pub trait VideoProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoMetadata>;
}

/// Runs `ffprobe` with a hard timeout, on top of a magic-byte container sniff.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.ffprobe_path.clone(), config.probe_timeout())
    }

    /// `Ok(None)` means the child was killed after `timeout`.
    fn run_ffprobe(&self, path: &Path, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut child = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_entries",
                "format=duration,bit_rate,format_name:stream=codec_type,codec_name,width,height,avg_frame_rate,r_frame_rate,bit_rate,duration,disposition",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "ffprobe stdout not captured"))?;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        match child.wait_timeout(timeout)? {
            Some(status) => {
                let output = reader
                    .join()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "ffprobe reader panicked"))??;
                if !status.success() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("ffprobe exited with {status}"),
                    ));
                }
                Ok(Some(output))
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                // A grandchild may still hold the pipe open; the reader is left detached.
                drop(reader);
                Ok(None)
            }
        }
    }
}

impl VideoProber for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        let started = Instant::now();
        let header = read_header_within(path, self.timeout)?;
        let mut metadata = VideoMetadata {
            container_format: sniff_container(&header),
            ..VideoMetadata::default()
        };

        let remaining = self.timeout.saturating_sub(started.elapsed());
        match self.run_ffprobe(path, remaining) {
            Ok(Some(stdout)) => match serde_json::from_slice::<FfprobeOutput>(&stdout) {
                Ok(output) => output.fill(&mut metadata),
                Err(err) => debug!(path = %path.display(), %err, "unparseable ffprobe output"),
            },
            Ok(None) => warn!(
                path = %path.display(),
                timeout_ms = self.timeout.as_millis() as u64,
                "ffprobe timed out, keeping header-only metadata"
            ),
            Err(err) => debug!(path = %path.display(), %err, "ffprobe unavailable or failed"),
        }

        Ok(metadata)
    }
}

/// Opening or reading a file on a stalled mount can hang; the read runs on a
/// helper thread that is abandoned once `timeout` passes.
fn read_header_within(path: &Path, timeout: Duration) -> Result<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    let owned = path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(read_header(&owned));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            warn!(path = %path.display(), "header read timed out");
            Err(Error::UnreadableMedia {
                path: path.to_path_buf(),
                reason: format!("no data within {} ms", timeout.as_millis()),
            })
        }
    }
}

fn read_header(path: &Path) -> Result<Vec<u8>> {
    let unreadable = |reason: String| Error::UnreadableMedia {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| unreadable(e.to_string()))?;
    let md = file.metadata().map_err(|e| unreadable(e.to_string()))?;
    if !md.is_file() {
        return Err(unreadable("not a regular file".to_string()));
    }
    if md.len() == 0 {
        return Err(unreadable("empty file".to_string()));
    }

    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| unreadable(e.to_string()))?;
    Ok(header)
}

pub fn sniff_container(header: &[u8]) -> Option<String> {
    infer::get(header)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Video)
        .map(|kind| kind.extension().to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FfprobeOutput {
    streams: Vec<Stream>,
    format: Option<Format>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Stream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
    duration: Option<String>,
    disposition: Option<Disposition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Disposition {
    default: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Format {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl FfprobeOutput {
    fn fill(&self, metadata: &mut VideoMetadata) {
        let video = self.select_video_stream();
        let audio = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"));
        let format = self.format.as_ref();

        metadata.duration = format
            .and_then(|f| f.duration.as_deref())
            .or_else(|| video.and_then(|v| v.duration.as_deref()))
            .and_then(parse_duration);
        metadata.resolution = video.and_then(|v| match (v.width, v.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        });
        metadata.codec = video.and_then(|v| v.codec_name.clone());
        metadata.audio_codec = audio.and_then(|a| a.codec_name.clone());
        if metadata.container_format.is_none() {
            metadata.container_format = format
                .and_then(|f| f.format_name.as_deref())
                .and_then(|name| name.split(',').next())
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string());
        }
        metadata.frame_rate = video.and_then(|v| {
            v.avg_frame_rate
                .as_deref()
                .and_then(parse_fps)
                .or_else(|| v.r_frame_rate.as_deref().and_then(parse_fps))
        });
        metadata.bit_rate = format
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse().ok())
            .or_else(|| video.and_then(|v| v.bit_rate.as_deref()).and_then(|b| b.parse().ok()));
    }

    /// Prefers the default-disposition stream, then the largest frame.
    fn select_video_stream(&self) -> Option<&Stream> {
        let mut best: Option<&Stream> = None;
        let mut best_pixels = 0u64;
        let mut best_is_default = false;

        for stream in self
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("video"))
        {
            let is_default = stream
                .disposition
                .as_ref()
                .and_then(|d| d.default)
                .unwrap_or(0)
                == 1;
            let pixels = (stream.width.unwrap_or(0) as u64)
                .saturating_mul(stream.height.unwrap_or(0) as u64);

            if best.is_none()
                || (is_default && !best_is_default)
                || (is_default == best_is_default && pixels > best_pixels)
            {
                best = Some(stream);
                best_pixels = pixels;
                best_is_default = is_default;
            }
        }

        best
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let secs: f64 = s.parse().ok()?;
    if secs.is_finite() && secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn parse_fps(s: &str) -> Option<f64> {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Fixed-size worker pool for probing; bounds concurrent file handles and
/// child processes regardless of how many videos a directory holds.
pub struct ProbePool {
    pool: rayon::ThreadPool,
    probes_started: AtomicU64,
}

impl ProbePool {
    pub fn new(concurrency: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("videovault-probe-{i}"))
            .build()
            .map_err(|e| Error::InvalidArgument(format!("cannot build probe pool: {e}")))?;
        Ok(Self {
            pool,
            probes_started: AtomicU64::new(0),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn probes_started(&self) -> u64 {
        self.probes_started.load(Ordering::Relaxed)
    }

    /// Probes every path; results come back in input order.
    pub fn probe_all(&self, prober: &dyn VideoProber, paths: &[PathBuf]) -> Vec<EnrichedVideo> {
        self.pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    self.probes_started.fetch_add(1, Ordering::Relaxed);
                    let outcome = match prober.probe(path) {
                        Ok(metadata) => ProbeOutcome::Probed { metadata },
                        Err(err) => {
                            warn!(path = %path.display(), %err, "probe failed");
                            ProbeOutcome::Unreadable {
                                reason: err.to_string(),
                            }
                        }
                    };
                    EnrichedVideo {
                        path: path.clone(),
                        outcome,
                    }
                })
                .collect()
        })
    }
}

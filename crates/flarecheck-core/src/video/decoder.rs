use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::frame::Frame;
use super::FrameSource;

/// `ffprobe -of json` output restricted to the first video stream.
#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    r_frame_rate: String,
    #[serde(default)]
    tags: StreamTags,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

/// Older muxers store the orientation as a `rotate` tag.
#[derive(Debug, Default, Deserialize)]
struct StreamTags {
    rotate: Option<String>,
}

/// Newer ffmpeg reports a display matrix with a `rotation` in degrees.
#[derive(Debug, Deserialize)]
struct SideData {
    rotation: Option<f64>,
}

/// Geometry of the first video stream, as ffmpeg will deliver it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StreamGeometry {
    /// Width of decoded frames after ffmpeg applied the display rotation.
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Display rotation in whole degrees, normalised to `0..360`.
    pub rotation: u32,
}

impl ProbeStream {
    fn rotation_degrees(&self) -> f64 {
        self.side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .or_else(|| {
                self.tags
                    .rotate
                    .as_deref()
                    .and_then(|tag| tag.trim().parse::<f64>().ok())
            })
            .filter(|deg| deg.is_finite())
            .unwrap_or(0.0)
    }
}

/// Turn ffprobe's JSON report into the frame geometry ffmpeg will pipe out.
///
/// ffmpeg autorotates by default, so a quarter-turn rotation swaps width and height.
pub(crate) fn parse_probe_report(json: &str) -> Result<StreamGeometry> {
    let report: ProbeReport =
        serde_json::from_str(json).context("ffprobe printed invalid JSON")?;
    let stream = report
        .streams
        .into_iter()
        .next()
        .context("ffprobe found no video stream")?;

    let rotation = (stream.rotation_degrees().round() as i64).rem_euclid(360) as u32;
    let (width, height) = if rotation == 90 || rotation == 270 {
        (stream.height, stream.width)
    } else {
        (stream.width, stream.height)
    };

    Ok(StreamGeometry {
        width,
        height,
        fps: parse_frame_rate(&stream.r_frame_rate),
        rotation,
    })
}

fn probe_stream(path: &Path) -> Result<StreamGeometry> {
    debug!(?path, "running ffprobe");

    let output = Command::new("ffprobe")
        .args(["-v", "error"])
        .args(["-select_streams", "v:0"])
        .args([
            "-show_entries",
            "stream=width,height,r_frame_rate:stream_tags=rotate:stream_side_data=rotation",
        ])
        .args(["-of", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .context("failed to run ffprobe, is ffmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(%stderr, ?path, "ffprobe rejected the file");
        bail!("ffprobe failed: {}", stderr.trim());
    }

    let geometry = parse_probe_report(&String::from_utf8_lossy(&output.stdout))?;
    if geometry.fps <= 0.0 {
        warn!(?path, "video has no usable frame rate, every frame will be sampled");
    }
    Ok(geometry)
}

/// Parse ffprobe's `r_frame_rate` ("30000/1001" or "25"). Anything unusable is 0.0.
pub(crate) fn parse_frame_rate(text: &str) -> f64 {
    let text = text.trim();
    let fps = if let Some((num, den)) = text.split_once('/') {
        match (num.parse::<f64>(), den.parse::<f64>()) {
            (Ok(num), Ok(den)) if den > 0.0 => num / den,
            _ => 0.0,
        }
    } else {
        text.parse::<f64>().unwrap_or(0.0)
    };

    if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        0.0
    }
}

/// Reads upright RGB24 frames from an ffmpeg child process.
pub struct VideoDecoder {
    child: Child,
    geometry: StreamGeometry,
    frame_len: usize,
    decoded: u32,
}

impl VideoDecoder {
    /// Probe `path` and start streaming its first video track.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("video file does not exist: {}", path.display());
        }

        let geometry = probe_stream(path)?;
        if geometry.width == 0 || geometry.height == 0 {
            bail!("video reports no picture size ({}x{})", geometry.width, geometry.height);
        }

        let child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin"])
            .arg("-i")
            .arg(path)
            .args(["-map", "0:v:0", "-an", "-sn"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg, is ffmpeg installed?")?;

        let frame_len = geometry.width as usize * geometry.height as usize * 3;
        info!(
            ?path,
            width = geometry.width,
            height = geometry.height,
            rotation = geometry.rotation,
            fps = geometry.fps,
            "video opened"
        );

        Ok(Self {
            child,
            geometry,
            frame_len,
            decoded: 0,
        })
    }

    /// Width of the delivered frames, after rotation.
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Display rotation found in the container, in degrees.
    pub fn rotation(&self) -> u32 {
        self.geometry.rotation
    }

    /// Next frame from the pipe, or `None` once ffmpeg has closed it cleanly.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let pipe = self
            .child
            .stdout
            .as_mut()
            .context("ffmpeg stdout was not captured")?;

        let mut buf = vec![0u8; self.frame_len];
        let filled = fill_frame(pipe, &mut buf)?;
        if filled == 0 {
            debug!(frames = self.decoded, "ffmpeg closed the frame pipe");
            return Ok(None);
        }
        if filled < self.frame_len {
            bail!(
                "frame {} is truncated ({filled} of {} bytes)",
                self.decoded,
                self.frame_len
            );
        }

        let image = RgbImage::from_raw(self.geometry.width, self.geometry.height, buf)
            .context("raw frame does not match the probed size")?;

        let frame_number = self.decoded;
        self.decoded += 1;
        let timestamp_seconds = if self.geometry.fps > 0.0 {
            f64::from(frame_number) / self.geometry.fps
        } else {
            0.0
        };

        Ok(Some(Frame {
            image,
            frame_number,
            timestamp_seconds,
        }))
    }
}

/// Read until `buf` is full or the pipe hits end of file. Returns the bytes read.
fn fill_frame(pipe: &mut ChildStdout, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("failed to read from ffmpeg pipe"),
        }
    }
    Ok(filled)
}

impl FrameSource for VideoDecoder {
    fn fps(&self) -> f64 {
        self.geometry.fps
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        VideoDecoder::next_frame(self)
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        debug!(frames = self.decoded, "stopping ffmpeg");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

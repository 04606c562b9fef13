//! File size and media duration probing for candidate uploads.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::policy::MediaInspector;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// How durations are measured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DurationBackend {
    /// Demux in-process with Symphonia.
    Symphonia,
    /// Ask an external `ffprobe` binary.
    Ffprobe { program: PathBuf },
}

/// Inspector for files on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalInspector {
    backend: DurationBackend,
}

impl LocalInspector {
    pub fn new(backend: DurationBackend) -> Self {
        Self { backend }
    }
}

impl MediaInspector for LocalInspector {
    fn size_mb(&self, path: &Path) -> Result<u64> {
        let meta = std::fs::metadata(path).with_context(|| format!("stat {:?}", path))?;
        Ok(meta.len() / BYTES_PER_MB)
    }

    fn duration_secs(&self, path: &Path) -> Result<u64> {
        match &self.backend {
            DurationBackend::Symphonia => symphonia_duration_secs(path),
            DurationBackend::Ffprobe { program } => ffprobe_duration_secs(program, path),
        }
    }
}

/// Duration from the default track's frame count, or by summing packet
/// durations when the container does not declare one.
pub fn symphonia_duration_secs(path: &Path) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {:?}", path))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track"))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
        if rate > 0 {
            return Ok(frames / rate as u64);
        }
    }

    let time_base = params
        .time_base
        .or_else(|| params.sample_rate.map(|rate| symphonia::core::units::TimeBase::new(1, rate)))
        .ok_or_else(|| anyhow!("no time base for duration"))?;
    let mut total_ts: u64 = 0;
    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() == track_id {
                    total_ts = total_ts.saturating_add(packet.dur());
                }
            }
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(anyhow!(e).context("read packets for duration")),
        }
    }
    Ok(time_base.calc_time(total_ts).seconds)
}

/// `ffprobe -i <path> -show_entries format=duration -v quiet -of csv=p=0`
pub fn ffprobe_duration_secs(program: &Path, path: &Path) -> Result<u64> {
    let output = Command::new(program)
        .arg("-i")
        .arg(path)
        .args(["-show_entries", "format=duration", "-v", "quiet", "-of", "csv=p=0"])
        .output()
        .with_context(|| format!("run {:?}", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{:?} exited with {} for {:?}",
            program,
            output.status,
            path
        ));
    }
    parse_ffprobe_duration(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ffprobe_duration(stdout: &str) -> Result<u64> {
    let raw = stdout.trim();
    let seconds = raw
        .parse::<f64>()
        .with_context(|| format!("parse ffprobe duration {raw:?}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(anyhow!("invalid ffprobe duration {raw:?}"));
    }
    Ok(seconds.floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal PCM WAV: 16-bit mono at `rate` Hz with `frames` samples.
    fn write_wav(path: &Path, rate: u32, frames: u32) {
        let data_len = frames * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(44 + data_len as usize, 0);
        std::fs::write(path, bytes).expect("write wav");
    }

    #[test]
    fn size_rounds_down_to_whole_megabytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.mp3");
        let file = File::create(&path).expect("create");
        file.set_len(3 * BYTES_PER_MB - 1).expect("set len");

        let inspector = LocalInspector::new(DurationBackend::Symphonia);
        assert_eq!(inspector.size_mb(&path).expect("size"), 2);
        assert!(inspector.size_mb(&dir.path().join("missing.mp3")).is_err());
    }

    #[test]
    fn symphonia_reads_wav_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8000, 8000 * 3 + 4000);

        let inspector = LocalInspector::new(DurationBackend::Symphonia);
        assert_eq!(inspector.duration_secs(&path).expect("duration"), 3);
    }

    #[test]
    fn symphonia_rejects_non_media() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.mp3");
        std::fs::write(&path, b"definitely not audio").expect("write");
        assert!(symphonia_duration_secs(&path).is_err());
    }

    #[test]
    fn ffprobe_output_is_floored() {
        assert_eq!(parse_ffprobe_duration("120.987\n").expect("parse"), 120);
        assert_eq!(parse_ffprobe_duration("0.2").expect("parse"), 0);
        assert!(parse_ffprobe_duration("N/A").is_err());
        assert!(parse_ffprobe_duration("").is_err());
        assert!(parse_ffprobe_duration("-3").is_err());
    }

    #[test]
    fn missing_ffprobe_binary_is_an_error() {
        let result = ffprobe_duration_secs(
            Path::new("/nonexistent/ffprobe-for-tests"),
            Path::new("/in/a.mp3"),
        );
        assert!(result.is_err());
    }
}

//! The codec engine: demuxing, decoding and encoding behind traits so the
//! producer can run against ffmpeg or the in-memory synthetic engine.

pub mod ffmpeg;
pub mod fifo;
pub mod mpegts;
pub mod synthetic;

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::{Packet, Rational, StreamKind};

#[derive(Debug, Error)]
pub enum CodecError {
    /// Needs more input (or output must be drained) before it can proceed.
    #[error("resource temporarily unavailable")]
    WouldBlock,
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True for conditions the caller skips over without abandoning the file.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CodecError::WouldBlock | CodecError::InvalidData(_))
    }
}

/// Which engine produces the channels' packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Ffmpeg,
    Synthetic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Mpeg2,
}

impl VideoCodec {
    /// ISO/IEC 13818-1 stream_type for the PMT.
    pub fn stream_type(self) -> u8 {
        match self {
            VideoCodec::H264 => 0x1b,
            VideoCodec::Mpeg2 => 0x02,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Mpeg2 => "mpeg2",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: Rational,
    pub language: Option<String>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per decoded audio frame, when fixed.
    pub frame_samples: Option<usize>,
}

impl StreamInfo {
    pub fn video(index: usize, time_base: Rational, width: u32, height: u32) -> Self {
        Self {
            index,
            kind: StreamKind::Video,
            time_base,
            language: None,
            width,
            height,
            sample_rate: 0,
            channels: 0,
            frame_samples: None,
        }
    }

    pub fn audio(index: usize, time_base: Rational, sample_rate: u32, channels: u16) -> Self {
        Self {
            index,
            kind: StreamKind::Audio,
            time_base,
            language: None,
            width: 0,
            height: 0,
            sample_rate,
            channels,
            frame_samples: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_frame_samples(mut self, samples: usize) -> Self {
        self.frame_samples = Some(samples);
        self
    }

    /// An untagged stream matches any requested language.
    pub fn matches_language(&self, wanted: Option<&str>) -> bool {
        match (wanted, self.language.as_deref()) {
            (None, _) | (_, None) => true,
            (Some(w), Some(l)) => w.eq_ignore_ascii_case(l) || l.eq_ignore_ascii_case("und"),
        }
    }
}

/// A decoded unit. For audio `samples` counts samples per channel and
/// `data` holds interleaved s16 samples.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: StreamKind,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub samples: usize,
    pub is_key: bool,
    pub data: Bytes,
}

/// Per-file options the engine needs when opening a source.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Channel name, for logs and metric labels.
    pub channel: String,
    pub video_codec: VideoCodec,
    pub language: Option<String>,
    /// Ignore any video stream in the source.
    pub audio_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoParams {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub time_base: Rational,
    pub frame_size: Option<usize>,
}

/// Read-only copy of the producer's encoder configuration. Sessions take it
/// once at attach to lay out their own output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderParams {
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl EncoderParams {
    /// Output stream index for `kind`: video first, then audio.
    pub fn stream_index(&self, kind: StreamKind) -> Option<usize> {
        match kind {
            StreamKind::Video => self.video.map(|_| 0),
            StreamKind::Audio => self.audio.map(|_| usize::from(self.video.is_some())),
        }
    }

    pub fn time_base(&self, kind: StreamKind) -> Option<Rational> {
        match kind {
            StreamKind::Video => self.video.map(|v| v.time_base),
            StreamKind::Audio => self.audio.map(|a| a.time_base),
        }
    }
}

pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];
    /// Next packet in source order. `Err(EndOfStream)` once exhausted.
    fn read_packet(&mut self) -> Result<Packet, CodecError>;
    /// Pauses whatever produces this source's packets. False when the
    /// source cannot pause; the caller then keeps reading to hold its place.
    fn suspend(&mut self) -> bool {
        false
    }
    fn resume(&mut self) {}
}

pub trait Decoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError>;
    fn receive_frame(&mut self) -> Result<Frame, CodecError>;
    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

pub trait Encoder: Send {
    fn time_base(&self) -> Rational;
    /// Exact sample count each audio frame must carry, if the codec has one.
    fn frame_size(&self) -> Option<usize> {
        None
    }
    fn send_frame(&mut self, frame: Frame) -> Result<(), CodecError>;
    fn receive_packet(&mut self) -> Result<Packet, CodecError>;
    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

pub trait CodecEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn open_demuxer(&self, path: &Path, options: &OpenOptions) -> Result<Box<dyn Demuxer>, CodecError>;
    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, CodecError>;
    fn open_encoder(&self, stream: &StreamInfo, options: &OpenOptions) -> Result<Box<dyn Encoder>, CodecError>;
}

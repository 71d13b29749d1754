//! Deterministic in-memory engine. Each registered path describes a fake
//! source file; unregistered paths play the default source.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecEngine, CodecError, Decoder, Demuxer, Encoder, Frame, OpenOptions, StreamInfo, VideoCodec};
use crate::packet::{rescale_q, Packet, Rational, StreamKind, MICROSECONDS, MPEG_CLOCK};

#[derive(Debug, Clone)]
pub struct VideoProfile {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    /// Frames per keyframe interval.
    pub gop: u32,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            fps: 25,
            width: 640,
            height: 360,
            time_base: Rational::new(1, 1000),
            gop: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioProfile {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
    pub time_base: Rational,
    pub language: Option<String>,
    /// Delay of the first audio packet relative to the first video packet.
    pub offset: Duration,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_samples: 1536,
            time_base: Rational::new(1, 48_000),
            language: None,
            offset: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub duration: Duration,
    /// Container timestamp of the first packet; real files rarely start at 0.
    pub start: Duration,
    pub video: Option<VideoProfile>,
    pub audio: Vec<AudioProfile>,
    pub fail_open: bool,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            start: Duration::from_millis(1400),
            video: Some(VideoProfile::default()),
            audio: vec![AudioProfile::default()],
            fail_open: false,
        }
    }
}

impl SyntheticSource {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_start(mut self, start: Duration) -> Self {
        self.start = start;
        self
    }

    pub fn audio_only(mut self) -> Self {
        self.video = None;
        self
    }

    pub fn video_only(mut self) -> Self {
        self.audio.clear();
        self
    }

    pub fn broken() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }
}

pub struct SyntheticEngine {
    sources: Mutex<HashMap<PathBuf, SyntheticSource>>,
    default_source: SyntheticSource,
    audio_frame_size: usize,
    opened: Mutex<Vec<PathBuf>>,
    suspendable: bool,
    suspensions: Arc<AtomicUsize>,
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            default_source: SyntheticSource::default(),
            audio_frame_size: 1536,
            opened: Mutex::new(Vec::new()),
            suspendable: false,
            suspensions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Demuxers accept `suspend`, like a transcoder child that can be paused.
    pub fn with_suspend(mut self) -> Self {
        self.suspendable = true;
        self
    }

    /// How often any demuxer of this engine was suspended.
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::Acquire)
    }

    pub fn with_default_source(mut self, source: SyntheticSource) -> Self {
        self.default_source = source;
        self
    }

    /// Frame size the audio encoder demands. Differing from the source
    /// frame size routes audio through the re-chunking FIFO.
    pub fn with_audio_frame_size(mut self, samples: usize) -> Self {
        self.audio_frame_size = samples.max(1);
        self
    }

    pub fn register(&self, path: impl Into<PathBuf>, source: SyntheticSource) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        sources.insert(path.into(), source);
    }

    /// Every path passed to `open_demuxer`, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn source_for(&self, path: &Path) -> SyntheticSource {
        let sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        sources.get(path).cloned().unwrap_or_else(|| self.default_source.clone())
    }
}

impl CodecEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_demuxer(&self, path: &Path, _options: &OpenOptions) -> Result<Box<dyn Demuxer>, CodecError> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).push(path.to_path_buf());
        let source = self.source_for(path);
        if source.fail_open {
            return Err(CodecError::Fatal(format!("cannot open {}", path.display())));
        }
        let mut demuxer = SyntheticDemuxer::new(source);
        if self.suspendable {
            demuxer.suspensions = Some(self.suspensions.clone());
        }
        Ok(Box::new(demuxer))
    }

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(Box::new(SyntheticDecoder {
            stream: stream.clone(),
            frames: VecDeque::new(),
        }))
    }

    fn open_encoder(&self, stream: &StreamInfo, options: &OpenOptions) -> Result<Box<dyn Encoder>, CodecError> {
        let (time_base, frame_size) = match stream.kind {
            StreamKind::Video => (MPEG_CLOCK, None),
            StreamKind::Audio => (
                Rational::new(1, stream.sample_rate.max(1) as i32),
                Some(self.audio_frame_size),
            ),
        };
        Ok(Box::new(SyntheticEncoder {
            kind: stream.kind,
            codec: options.video_codec,
            time_base,
            frame_size,
            packets: VecDeque::new(),
        }))
    }
}

struct Track {
    stream: StreamInfo,
    /// Duration of one packet in stream time base.
    step: i64,
    first: i64,
    emitted: u64,
    gop: u32,
}

impl Track {
    fn next_pts(&self) -> i64 {
        self.first + self.emitted as i64 * self.step
    }

    fn next_us(&self) -> i64 {
        rescale_q(self.next_pts(), self.stream.time_base, MICROSECONDS)
    }
}

pub struct SyntheticDemuxer {
    streams: Vec<StreamInfo>,
    tracks: Vec<Track>,
    end_us: i64,
    suspensions: Option<Arc<AtomicUsize>>,
    suspended: bool,
}

impl SyntheticDemuxer {
    fn new(source: SyntheticSource) -> Self {
        let start_us = source.start.as_micros() as i64;
        let mut streams = Vec::new();
        let mut tracks = Vec::new();
        if let Some(video) = &source.video {
            let info = StreamInfo::video(streams.len(), video.time_base, video.width, video.height);
            let step = rescale_q(1, Rational::new(1, video.fps.max(1) as i32), video.time_base).max(1);
            tracks.push(Track {
                stream: info.clone(),
                step,
                first: rescale_q(start_us, MICROSECONDS, video.time_base),
                emitted: 0,
                gop: video.gop.max(1),
            });
            streams.push(info);
        }
        for audio in &source.audio {
            let mut info = StreamInfo::audio(streams.len(), audio.time_base, audio.sample_rate, audio.channels)
                .with_frame_samples(audio.frame_samples);
            info.language = audio.language.clone();
            let step = rescale_q(
                audio.frame_samples as i64,
                Rational::new(1, audio.sample_rate.max(1) as i32),
                audio.time_base,
            )
            .max(1);
            let first_us = start_us + audio.offset.as_micros() as i64;
            tracks.push(Track {
                stream: info.clone(),
                step,
                first: rescale_q(first_us, MICROSECONDS, audio.time_base),
                emitted: 0,
                gop: 1,
            });
            streams.push(info);
        }
        Self {
            streams,
            tracks,
            end_us: start_us + source.duration.as_micros() as i64,
            suspensions: None,
            suspended: false,
        }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        if self.suspended {
            return Err(CodecError::Fatal("read from a suspended source".into()));
        }
        let track = self
            .tracks
            .iter_mut()
            .filter(|t| t.next_us() < self.end_us)
            .min_by_key(|t| t.next_us())
            .ok_or(CodecError::EndOfStream)?;

        let pts = track.next_pts();
        let is_key = track.stream.kind == StreamKind::Audio || track.emitted % u64::from(track.gop) == 0;
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u64(track.emitted);
        payload.put_u32(track.stream.index as u32);
        track.emitted += 1;

        let mut packet = Packet::new(track.stream.kind, pts, pts, track.stream.time_base, payload.freeze());
        packet.stream_index = track.stream.index;
        packet.duration = track.step;
        packet.is_key = is_key;
        Ok(packet)
    }

    fn suspend(&mut self) -> bool {
        let Some(count) = &self.suspensions else {
            return false;
        };
        count.fetch_add(1, Ordering::AcqRel);
        self.suspended = true;
        true
    }

    fn resume(&mut self) {
        self.suspended = false;
    }
}

struct SyntheticDecoder {
    stream: StreamInfo,
    frames: VecDeque<Frame>,
}

impl Decoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        if packet.payload.is_empty() {
            return Err(CodecError::InvalidData("empty packet".into()));
        }
        let (samples, data) = match self.stream.kind {
            StreamKind::Video => (0, packet.payload.clone()),
            StreamKind::Audio => {
                let samples = self.stream.frame_samples.unwrap_or(1024);
                let bytes = samples * usize::from(self.stream.channels.max(1)) * 2;
                (samples, Bytes::from(vec![0u8; bytes]))
            }
        };
        self.frames.push_back(Frame {
            kind: self.stream.kind,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            time_base: packet.time_base,
            samples,
            is_key: packet.is_key,
            data,
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Frame, CodecError> {
        self.frames.pop_front().ok_or(CodecError::WouldBlock)
    }
}

struct SyntheticEncoder {
    kind: StreamKind,
    codec: VideoCodec,
    time_base: Rational,
    frame_size: Option<usize>,
    packets: VecDeque<Packet>,
}

impl Encoder for SyntheticEncoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn frame_size(&self) -> Option<usize> {
        self.frame_size
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), CodecError> {
        if let Some(size) = self.frame_size {
            if frame.samples != size {
                return Err(CodecError::InvalidData(format!(
                    "expected {size} samples per frame, got {}",
                    frame.samples
                )));
            }
        }
        let mut payload = BytesMut::with_capacity(frame.data.len().min(64) + 8);
        match (self.kind, self.codec) {
            // Access unit delimiter so the output resembles Annex B.
            (StreamKind::Video, VideoCodec::H264) => payload.put_slice(&[0, 0, 0, 1, 0x09, 0xf0]),
            (StreamKind::Video, VideoCodec::Mpeg2) => payload.put_slice(&[0, 0, 1, 0x00]),
            // AC-3 syncword.
            (StreamKind::Audio, _) => payload.put_slice(&[0x0b, 0x77]),
        }
        payload.put_slice(&frame.data[..frame.data.len().min(64)]);

        let pts = rescale_q(frame.pts, frame.time_base, self.time_base);
        let mut packet = Packet::new(self.kind, pts, pts, self.time_base, payload.freeze());
        packet.duration = rescale_q(frame.duration, frame.time_base, self.time_base);
        packet.is_key = frame.is_key;
        self.packets.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Packet, CodecError> {
        self.packets.pop_front().ok_or(CodecError::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demuxer_interleaves_by_time_and_ends() {
        let engine = SyntheticEngine::new().with_default_source(
            SyntheticSource::default()
                .with_duration(Duration::from_millis(200))
                .with_start(Duration::ZERO),
        );
        let mut demuxer = engine.open_demuxer(Path::new("a.mkv"), &OpenOptions::default()).unwrap();
        assert_eq!(demuxer.streams().len(), 2);

        let mut last_us = i64::MIN;
        let mut video = 0;
        let mut audio = 0;
        loop {
            match demuxer.read_packet() {
                Ok(p) => {
                    let us = rescale_q(p.pts, p.time_base, MICROSECONDS);
                    assert!(us >= last_us);
                    last_us = us;
                    match p.kind {
                        StreamKind::Video => video += 1,
                        StreamKind::Audio => audio += 1,
                    }
                }
                Err(CodecError::EndOfStream) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(video, 5);
        assert_eq!(audio, 7);
        assert_eq!(engine.opened(), vec![PathBuf::from("a.mkv")]);
    }

    #[test]
    fn first_video_packet_is_a_keyframe() {
        let engine = SyntheticEngine::new();
        let mut demuxer = engine.open_demuxer(Path::new("x"), &OpenOptions::default()).unwrap();
        let first_video = std::iter::from_fn(|| demuxer.read_packet().ok())
            .find(|p| p.kind == StreamKind::Video)
            .unwrap();
        assert!(first_video.is_key);
        assert_eq!(first_video.pts, 1400);
    }

    #[test]
    fn broken_source_fails_to_open() {
        let engine = SyntheticEngine::new();
        engine.register("bad.mkv", SyntheticSource::broken());
        assert!(engine.open_demuxer(Path::new("bad.mkv"), &OpenOptions::default()).is_err());
        assert!(engine.open_demuxer(Path::new("good.mkv"), &OpenOptions::default()).is_ok());
    }

    #[test]
    fn audio_encoder_enforces_frame_size() {
        let engine = SyntheticEngine::new().with_audio_frame_size(1024);
        let stream = StreamInfo::audio(1, Rational::new(1, 48_000), 48_000, 2).with_frame_samples(1536);
        let mut encoder = engine.open_encoder(&stream, &OpenOptions::default()).unwrap();
        assert_eq!(encoder.frame_size(), Some(1024));

        let frame = |samples: usize| Frame {
            kind: StreamKind::Audio,
            pts: 0,
            dts: 0,
            duration: samples as i64,
            time_base: Rational::new(1, 48_000),
            samples,
            is_key: true,
            data: Bytes::from(vec![0u8; samples * 4]),
        };
        assert!(matches!(encoder.send_frame(frame(1536)), Err(CodecError::InvalidData(_))));
        encoder.send_frame(frame(1024)).unwrap();
        let packet = encoder.receive_packet().unwrap();
        assert_eq!(&packet.payload[..2], &[0x0b, 0x77]);
        assert!(matches!(encoder.receive_packet(), Err(CodecError::WouldBlock)));
    }
}

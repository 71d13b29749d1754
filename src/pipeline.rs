//! The producer. Plays one playlist entry at a time into its channel's ring:
//! open and probe, then decode, re-encode, rebase and push in real time,
//! then drain the codecs.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channels::PlaylistItem;
use crate::codec::fifo::AudioFifo;
use crate::codec::{
    AudioParams, CodecEngine, CodecError, Demuxer, EncoderParams, Frame, OpenOptions, StreamInfo, VideoCodec,
    VideoParams,
};
use crate::error::PipelineError;
use crate::metrics::{PRODUCER_DROPPED, RING_PACKETS};
use crate::pacing::{sleep_cancellable, PaceOutcome, RealtimePacer};
use crate::packet::{rescale_q, Packet, StreamKind, MICROSECONDS, NO_PTS};
use crate::rebase::RebaseInput;
use crate::supervisor::Channel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Opening,
    Transcoding,
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub probe_packet_limit: usize,
    pub pacing_ceiling: Duration,
    pub options: OpenOptions,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileReport {
    pub generation: u64,
    pub pushed: u64,
    pub dropped: u64,
    pub skipped_unwatched: u64,
    /// Times the source was paused for lack of viewers.
    pub suspended: u64,
}

const IDLE_POLL: Duration = Duration::from_millis(50);

/// Encoding chain for one selected source stream.
struct Track {
    stream: StreamInfo,
    decoder: Box<dyn crate::codec::Decoder>,
    encoder: Box<dyn crate::codec::Encoder>,
    fifo: Option<AudioFifo>,
    /// First pts of this kind in the file, in the stream's time base.
    start_pts: i64,
    /// Same origin in the encoder's time base, as stored in the ring.
    encoded_start: i64,
    last_frame_pts: i64,
    output_index: usize,
}

impl Track {
    fn kind(&self) -> StreamKind {
        self.stream.kind
    }
}

pub struct TranscodePipeline<'a> {
    channel: &'a Channel,
    engine: &'a dyn CodecEngine,
    config: &'a PipelineConfig,
    cancel: &'a CancellationToken,
}

impl<'a> TranscodePipeline<'a> {
    pub fn new(
        channel: &'a Channel,
        engine: &'a dyn CodecEngine,
        config: &'a PipelineConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            channel,
            engine,
            config,
            cancel,
        }
    }

    /// Plays `item` to its end. Codec resources are released on every exit
    /// path when the locals holding them drop.
    pub fn play(&self, item: &PlaylistItem) -> Result<FileReport, PipelineError> {
        let generation = self.channel.next_generation();
        let mut report = FileReport {
            generation,
            ..FileReport::default()
        };
        self.channel.set_state(PipelineState::Opening);
        self.channel.set_current_file(Some(item.display_name.clone()));
        info!(channel = %self.channel.id(), generation, "opening {}", item.full_path.display());

        let result = self.run(item, generation, &mut report);
        self.channel.set_state(PipelineState::Closed);
        result.map(|_| report)
    }

    fn run(&self, item: &PlaylistItem, generation: u64, report: &mut FileReport) -> Result<(), PipelineError> {
        let path = &item.full_path;
        let mut demuxer = self
            .engine
            .open_demuxer(path, &self.config.options)
            .map_err(|e| PipelineError::source_file(path, e))?;

        let (video, audio) = self.select_streams(demuxer.streams());
        if video.is_none() && audio.is_none() {
            return Err(PipelineError::source_file(
                path,
                CodecError::InvalidData("no usable audio or video stream".into()),
            ));
        }

        let mut video = match video {
            Some(stream) => Some(self.open_track(stream)?),
            None => None,
        };
        let mut audio = match audio {
            Some(stream) => Some(self.open_track(stream)?),
            None => None,
        };

        let mut pending = self.probe(demuxer.as_mut(), item, video.as_mut(), audio.as_mut())?;
        let params = encoder_params(self.config.options.video_codec, video.as_ref(), audio.as_ref());
        for track in [video.as_mut(), audio.as_mut()].into_iter().flatten() {
            track.output_index = params.stream_index(track.kind()).unwrap_or_default();
        }
        self.channel.publish_encoder_params(params);

        self.channel.set_state(PipelineState::Transcoding);
        let pace_kind = if video.is_some() { StreamKind::Video } else { StreamKind::Audio };
        let mut pacer = RealtimePacer::new(self.config.pacing_ceiling);
        let mut last_paced = NO_PTS;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.channel.viewers() == 0 && demuxer.suspend() {
                report.suspended += 1;
                self.wait_for_viewer()?;
                demuxer.resume();
                // Continue from the pause point instead of catching up.
                pacer.reset();
            }
            let packet = match pending.pop_front() {
                Some(packet) => packet,
                None => match demuxer.read_packet() {
                    Ok(packet) => packet,
                    Err(CodecError::EndOfStream) => break,
                    Err(e) if e.is_retryable() => {
                        debug!(channel = %self.channel.id(), "ignoring unreadable packet: {}", e);
                        continue;
                    }
                    Err(e) => return Err(PipelineError::source_file(path, e)),
                },
            };

            let track = match packet.stream_index {
                i if video.as_ref().is_some_and(|t| t.stream.index == i) => video.as_mut(),
                i if audio.as_ref().is_some_and(|t| t.stream.index == i) => audio.as_mut(),
                _ => None,
            };
            let Some(track) = track else {
                continue;
            };

            if track.kind() == pace_kind && packet.pts != NO_PTS && packet.pts >= last_paced {
                last_paced = packet.pts;
                let pts_us = rescale_q(packet.pts - track.start_pts, track.stream.time_base, MICROSECONDS);
                if pacer.pace(pts_us, self.cancel) == PaceOutcome::Cancelled {
                    return Err(PipelineError::Cancelled);
                }
            }

            // Nobody is watching and the source cannot pause: keep time but
            // leave the codecs idle.
            if self.channel.viewers() == 0 {
                report.skipped_unwatched += 1;
                continue;
            }

            if let Err(e) = track.decoder.send_packet(&packet) {
                if e.is_retryable() {
                    debug!(channel = %self.channel.id(), "decoder skipped packet: {}", e);
                    continue;
                }
                return Err(PipelineError::source_file(path, e));
            }
            self.drain_decoder(track, generation, report)?;
        }

        self.channel.set_state(PipelineState::Draining);
        for track in [video.as_mut(), audio.as_mut()].into_iter().flatten() {
            if let Err(e) = track.decoder.flush() {
                debug!(channel = %self.channel.id(), "decoder flush: {}", e);
            }
            self.drain_decoder(track, generation, report)?;
            let tail = track.fifo.as_mut().and_then(|fifo| fifo.drain());
            if let Some(frame) = tail {
                self.encode(track, frame, generation, report)?;
            }
            track
                .encoder
                .flush()
                .map_err(|source| PipelineError::Encoder { kind: track.kind().as_str(), source })?;
            self.drain_encoder(track, generation, report)?;
        }

        info!(
            channel = %self.channel.id(),
            generation,
            pushed = report.pushed,
            dropped = report.dropped,
            "finished {}",
            item.display_name
        );
        Ok(())
    }

    /// Parks the producer while its source is paused and nobody watches.
    fn wait_for_viewer(&self) -> Result<(), PipelineError> {
        info!(channel = %self.channel.id(), "no viewers, pausing source");
        while self.channel.viewers() == 0 {
            if !sleep_cancellable(IDLE_POLL, self.cancel) {
                return Err(PipelineError::Cancelled);
            }
        }
        info!(channel = %self.channel.id(), "viewer connected, resuming source");
        Ok(())
    }

    fn select_streams<'s>(&self, streams: &'s [StreamInfo]) -> (Option<&'s StreamInfo>, Option<&'s StreamInfo>) {
        let video = if self.config.options.audio_only {
            None
        } else {
            streams.iter().find(|s| s.kind == StreamKind::Video)
        };
        let language = self.config.options.language.as_deref();
        let audio = streams
            .iter()
            .find(|s| s.kind == StreamKind::Audio && s.matches_language(language));
        if audio.is_none() && streams.iter().any(|s| s.kind == StreamKind::Audio) {
            info!(
                channel = %self.channel.id(),
                "no audio stream for language {:?}, playing without audio",
                language.unwrap_or("any")
            );
        }
        (video, audio)
    }

    fn open_track(&self, stream: &StreamInfo) -> Result<Track, PipelineError> {
        let kind = stream.kind.as_str();
        let decoder = self
            .engine
            .open_decoder(stream)
            .map_err(|source| PipelineError::Decoder { kind, source })?;
        let encoder = self
            .engine
            .open_encoder(stream, &self.config.options)
            .map_err(|source| PipelineError::Encoder { kind, source })?;

        let fifo = match (stream.kind, encoder.frame_size()) {
            (StreamKind::Audio, Some(size)) if Some(size) != stream.frame_samples => Some(AudioFifo::new(
                size,
                stream.frame_samples.unwrap_or(size),
                stream.sample_rate,
                stream.channels,
                stream.time_base,
            )),
            _ => None,
        };

        Ok(Track {
            stream: stream.clone(),
            decoder,
            encoder,
            fifo,
            start_pts: NO_PTS,
            encoded_start: 0,
            last_frame_pts: NO_PTS,
            output_index: 0,
        })
    }

    /// Reads leading packets until each selected stream has shown a pts,
    /// keeping them for playback, and aligns audio and video to the later
    /// of the two origins.
    fn probe(
        &self,
        demuxer: &mut dyn Demuxer,
        item: &PlaylistItem,
        mut video: Option<&mut Track>,
        mut audio: Option<&mut Track>,
    ) -> Result<VecDeque<Packet>, PipelineError> {
        let mut pending = VecDeque::new();
        let needs = |t: &Option<&mut Track>| t.as_ref().is_some_and(|t| t.start_pts == NO_PTS);

        for _ in 0..self.config.probe_packet_limit {
            if !needs(&video) && !needs(&audio) {
                break;
            }
            let packet = match demuxer.read_packet() {
                Ok(packet) => packet,
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(PipelineError::source_file(&item.full_path, e)),
            };
            if packet.pts != NO_PTS {
                for track in [video.as_deref_mut(), audio.as_deref_mut()].into_iter().flatten() {
                    if track.stream.index == packet.stream_index && track.start_pts == NO_PTS {
                        track.start_pts = packet.pts;
                    }
                }
            }
            pending.push_back(packet);
        }

        for (track, kind) in [(&video, "video"), (&audio, "audio")] {
            if track.as_ref().is_some_and(|t| t.start_pts == NO_PTS) {
                return Err(PipelineError::NoStartTimestamp {
                    path: item.full_path.clone(),
                    reason: format!("no {kind} pts within {} packets", self.config.probe_packet_limit),
                });
            }
        }

        if let (Some(v), Some(a)) = (video.as_deref_mut(), audio.as_deref_mut()) {
            let audio_in_video = rescale_q(a.start_pts, a.stream.time_base, v.stream.time_base);
            if audio_in_video > v.start_pts {
                v.start_pts = audio_in_video;
            } else {
                a.start_pts = rescale_q(v.start_pts, v.stream.time_base, a.stream.time_base);
            }
        }
        for track in [video, audio].into_iter().flatten() {
            track.encoded_start = rescale_q(track.start_pts, track.stream.time_base, track.encoder.time_base());
            track.last_frame_pts = NO_PTS;
        }
        Ok(pending)
    }

    fn drain_decoder(&self, track: &mut Track, generation: u64, report: &mut FileReport) -> Result<(), PipelineError> {
        loop {
            let frame = match track.decoder.receive_frame() {
                Ok(frame) => frame,
                Err(CodecError::WouldBlock) | Err(CodecError::EndOfStream) => return Ok(()),
                Err(CodecError::InvalidData(reason)) => {
                    debug!(channel = %self.channel.id(), "ignoring frame with invalid data: {}", reason);
                    return Ok(());
                }
                Err(source) => {
                    return Err(PipelineError::Decoder {
                        kind: track.kind().as_str(),
                        source,
                    })
                }
            };

            match track.kind() {
                StreamKind::Video => {
                    if frame.pts != NO_PTS {
                        if track.last_frame_pts != NO_PTS && frame.pts <= track.last_frame_pts {
                            debug!(
                                channel = %self.channel.id(),
                                "PTS problem: {} <= {}, dropping frame",
                                frame.pts,
                                track.last_frame_pts
                            );
                            continue;
                        }
                        track.last_frame_pts = frame.pts;
                    }
                    self.encode(track, frame, generation, report)?;
                }
                StreamKind::Audio => {
                    if let Some(fifo) = track.fifo.as_mut() {
                        fifo.write(&frame)?;
                        let chunks: Vec<Frame> = std::iter::from_fn(|| fifo.pop()).collect();
                        for chunk in chunks {
                            self.encode(track, chunk, generation, report)?;
                        }
                    } else {
                        self.encode(track, frame, generation, report)?;
                    }
                }
            }
        }
    }

    fn encode(&self, track: &mut Track, frame: Frame, generation: u64, report: &mut FileReport) -> Result<(), PipelineError> {
        match track.encoder.send_frame(frame) {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                debug!(channel = %self.channel.id(), "{} encoder skipped frame: {}", track.kind().as_str(), e);
                return Ok(());
            }
            Err(source) => {
                return Err(PipelineError::Encoder {
                    kind: track.kind().as_str(),
                    source,
                })
            }
        }
        self.drain_encoder(track, generation, report)
    }

    fn drain_encoder(&self, track: &mut Track, generation: u64, report: &mut FileReport) -> Result<(), PipelineError> {
        loop {
            match track.encoder.receive_packet() {
                Ok(packet) => self.push(track, packet, generation, report)?,
                Err(CodecError::WouldBlock) | Err(CodecError::EndOfStream) => return Ok(()),
                Err(e) if e.is_retryable() => return Ok(()),
                Err(source) => {
                    return Err(PipelineError::Encoder {
                        kind: track.kind().as_str(),
                        source,
                    })
                }
            }
        }
    }

    fn push(&self, track: &Track, mut packet: Packet, generation: u64, report: &mut FileReport) -> Result<(), PipelineError> {
        let kind = track.kind();
        if packet.pts != NO_PTS && packet.pts <= 0 {
            trace!(channel = %self.channel.id(), kind = kind.as_str(), pts = packet.pts, "skipping non-positive encoder pts");
            report.dropped += 1;
            PRODUCER_DROPPED.with_label_values(&[self.channel.id()]).inc();
            return Ok(());
        }

        packet.kind = kind;
        packet.stream_index = track.output_index;
        packet.time_base = track.encoder.time_base();
        packet.file_start_pts = track.encoded_start;
        packet.generation = generation;

        if !self.channel.producer_rebase(&RebaseInput::from(&packet)).advanced {
            trace!(channel = %self.channel.id(), kind = kind.as_str(), pts = packet.pts, "dropping packet behind channel timeline");
            report.dropped += 1;
            PRODUCER_DROPPED.with_label_values(&[self.channel.id()]).inc();
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.channel.ring().push(packet);
        report.pushed += 1;
        RING_PACKETS.with_label_values(&[self.channel.id()]).inc();
        Ok(())
    }
}

fn encoder_params(codec: VideoCodec, video: Option<&Track>, audio: Option<&Track>) -> EncoderParams {
    EncoderParams {
        video: video.map(|t| VideoParams {
            codec,
            width: t.stream.width,
            height: t.stream.height,
            time_base: t.encoder.time_base(),
        }),
        audio: audio.map(|t| AudioParams {
            sample_rate: t.stream.sample_rate,
            channels: t.stream.channels,
            time_base: t.encoder.time_base(),
            frame_size: t.encoder.frame_size(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::channels::ChannelSettings;
    use crate::codec::synthetic::{SyntheticEngine, SyntheticSource};
    use crate::packet::MPEG_CLOCK;
    use crate::rebase::{RebaseState, TimestampContinuityEngine};
    use crate::ring::{Cursor, RingBuffer};

    fn config() -> PipelineConfig {
        PipelineConfig {
            probe_packet_limit: 100,
            pacing_ceiling: Duration::from_secs(100),
            options: OpenOptions::default(),
        }
    }

    fn channel(capacity: usize) -> Channel {
        Channel::new(ChannelSettings::new("pipeline"), capacity, &CancellationToken::new())
    }

    fn short(ms: u64) -> SyntheticSource {
        SyntheticSource::default().with_duration(Duration::from_millis(ms))
    }

    fn readable(ring: &RingBuffer) -> Vec<Arc<Packet>> {
        let mut cursor = Cursor {
            index: ring.capacity() - 1,
            last_sequence_id: 0,
        };
        let mut out = Vec::new();
        while let Some(packet) = ring.try_read(&cursor) {
            cursor = Cursor {
                index: ring.index_next(cursor.index),
                last_sequence_id: packet.sequence_id,
            };
            out.push(packet);
        }
        out
    }

    /// Replays the ring through a fresh timeline, as a viewer would.
    fn assert_increasing(packets: &[Arc<Packet>], kind: StreamKind) {
        let mut timeline = RebaseState::new(MPEG_CLOCK, MPEG_CLOCK);
        let pts: Vec<i64> = packets
            .iter()
            .map(|p| (p.kind, TimestampContinuityEngine::rebase(&mut timeline, &RebaseInput::from(p.as_ref())).pts))
            .filter(|(k, _)| *k == kind)
            .map(|(_, pts)| pts)
            .collect();
        assert!(!pts.is_empty());
        assert!(pts.windows(2).all(|w| w[0] < w[1]), "{kind:?} not increasing: {pts:?}");
    }

    #[test]
    fn watched_file_fills_ring() {
        let engine = SyntheticEngine::new().with_default_source(short(400));
        let channel = channel(64);
        let _viewer = channel.add_viewer();
        let cancel = CancellationToken::new();
        let config = config();

        let report = TranscodePipeline::new(&channel, &engine, &config, &cancel)
            .play(&PlaylistItem::from_path("/media/one.mkv"))
            .unwrap();
        // 10 video frames at 25 fps and 13 AC-3 sized audio frames in 400 ms.
        assert_eq!(report.generation, 1);
        assert_eq!(report.pushed, 23);
        assert_eq!(report.dropped, 0);
        assert_eq!(channel.ring().latest_sequence_id(), 23);
        assert_eq!(channel.status().state, PipelineState::Closed);

        let params = channel.snapshot_encoder_params().unwrap();
        assert_eq!(params.video.unwrap().time_base, MPEG_CLOCK);
        assert_eq!(params.audio.unwrap().frame_size, Some(1536));

        let packets = readable(channel.ring());
        let video = packets.iter().find(|p| p.kind == StreamKind::Video).unwrap();
        assert_eq!((video.stream_index, video.file_start_pts, video.generation), (0, 126_000, 1));
        assert!(video.is_key);
        let audio = packets.iter().find(|p| p.kind == StreamKind::Audio).unwrap();
        assert_eq!((audio.stream_index, audio.file_start_pts), (1, 67_200));
        assert_increasing(&packets, StreamKind::Video);
        assert_increasing(&packets, StreamKind::Audio);
    }

    #[test]
    fn unwatched_file_skips_codecs() {
        let engine = SyntheticEngine::new().with_default_source(short(200));
        let channel = channel(64);
        let cancel = CancellationToken::new();
        let config = config();

        let report = TranscodePipeline::new(&channel, &engine, &config, &cancel)
            .play(&PlaylistItem::from_path("/media/idle.mkv"))
            .unwrap();
        assert_eq!(report.pushed, 0);
        assert!(report.skipped_unwatched > 0);
        assert_eq!(channel.ring().latest_sequence_id(), 0);
        assert!(channel.snapshot_encoder_params().is_some());
    }

    #[test]
    fn suspendable_source_waits_for_a_viewer() {
        let engine = SyntheticEngine::new().with_default_source(short(400)).with_suspend();
        let channel = channel(64);
        let cancel = CancellationToken::new();
        let config = config();

        std::thread::scope(|scope| {
            let producer = scope.spawn(|| {
                TranscodePipeline::new(&channel, &engine, &config, &cancel).play(&PlaylistItem::from_path("/media/paused.mkv"))
            });
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while engine.suspensions() == 0 {
                assert!(std::time::Instant::now() < deadline, "source never paused");
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(100));
            assert!(!producer.is_finished());
            assert_eq!(channel.ring().latest_sequence_id(), 0);

            let _viewer = channel.add_viewer();
            let report = producer.join().unwrap().unwrap();
            // Nothing was skipped: the whole file played once watched.
            assert_eq!(report.suspended, 1);
            assert_eq!(report.skipped_unwatched, 0);
            assert_eq!(report.pushed, 23);
        });
    }

    #[test]
    fn cancel_while_suspended_stops_the_producer() {
        let engine = SyntheticEngine::new().with_default_source(short(400)).with_suspend();
        let channel = channel(8);
        let cancel = CancellationToken::new();
        let config = config();

        std::thread::scope(|scope| {
            let producer = scope.spawn(|| {
                TranscodePipeline::new(&channel, &engine, &config, &cancel).play(&PlaylistItem::from_path("/media/paused.mkv"))
            });
            while engine.suspensions() == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            cancel.cancel();
            assert!(matches!(producer.join().unwrap(), Err(PipelineError::Cancelled)));
        });
    }

    #[test]
    fn consecutive_files_share_one_timeline() {
        let engine = SyntheticEngine::new().with_default_source(short(200));
        engine.register("/media/late.mkv", short(200).with_start(Duration::from_secs(3600)));
        let channel = channel(64);
        let _viewer = channel.add_viewer();
        let cancel = CancellationToken::new();
        let config = config();

        for path in ["/media/late.mkv", "/media/early.mkv"] {
            TranscodePipeline::new(&channel, &engine, &config, &cancel)
                .play(&PlaylistItem::from_path(path))
                .unwrap();
        }
        assert_eq!(channel.generation(), 2);

        let packets = readable(channel.ring());
        assert!(packets.iter().any(|p| p.generation == 2));
        assert_increasing(&packets, StreamKind::Video);
        assert_increasing(&packets, StreamKind::Audio);
    }

    #[test]
    fn fifo_rechunks_audio_for_fixed_frame_encoder() {
        let engine = SyntheticEngine::new()
            .with_default_source(short(320).audio_only())
            .with_audio_frame_size(1024);
        let channel = channel(64);
        let _viewer = channel.add_viewer();
        let cancel = CancellationToken::new();
        let config = config();

        let report = TranscodePipeline::new(&channel, &engine, &config, &cancel)
            .play(&PlaylistItem::from_path("/media/radio.mka"))
            .unwrap();
        // 10 source frames of 1536 samples become 15 frames of 1024.
        assert_eq!(report.pushed, 15);

        let packets = readable(channel.ring());
        assert!(packets.iter().all(|p| p.kind == StreamKind::Audio && p.stream_index == 0));
        assert!(packets.iter().all(|p| p.duration == 1024));
        let pts: Vec<i64> = packets.iter().map(|p| p.pts).collect();
        assert!(pts.windows(2).all(|w| w[1] - w[0] == 1024), "{pts:?}");
    }

    #[test]
    fn broken_source_is_a_file_error() {
        let engine = SyntheticEngine::new().with_default_source(SyntheticSource::broken());
        let channel = channel(8);
        let cancel = CancellationToken::new();
        let config = config();

        let err = TranscodePipeline::new(&channel, &engine, &config, &cancel)
            .play(&PlaylistItem::from_path("/media/bad.mkv"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceFile { .. }), "{err}");
        assert_eq!(channel.status().state, PipelineState::Closed);
    }

    #[test]
    fn cancelled_before_first_packet() {
        let engine = SyntheticEngine::new();
        let channel = channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = config();

        let err = TranscodePipeline::new(&channel, &engine, &config, &cancel)
            .play(&PlaylistItem::from_path("/media/any.mkv"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn selects_audio_by_language() {
        let engine = SyntheticEngine::new();
        let channel = channel(8);
        let cancel = CancellationToken::new();
        let mut config = config();
        config.options.language = Some("eng".into());

        let tb = crate::packet::Rational::new(1, 48_000);
        let streams = vec![
            StreamInfo::video(0, MPEG_CLOCK, 640, 360),
            StreamInfo::audio(1, tb, 48_000, 2).with_language("ger"),
            StreamInfo::audio(2, tb, 48_000, 2).with_language("eng"),
        ];
        let pipeline = TranscodePipeline::new(&channel, &engine, &config, &cancel);
        let (video, audio) = pipeline.select_streams(&streams);
        assert_eq!(video.map(|s| s.index), Some(0));
        assert_eq!(audio.map(|s| s.index), Some(2));

        config.options.language = Some("fra".into());
        config.options.audio_only = true;
        let pipeline = TranscodePipeline::new(&channel, &engine, &config, &cancel);
        assert_eq!(pipeline.select_streams(&streams), (None, None));
    }

    #[test]
    fn state_reads_back_from_status_json() {
        let json = serde_json::to_string(&PipelineState::Transcoding).unwrap();
        assert_eq!(json, "\"transcoding\"");
        let state: PipelineState = serde_json::from_str("\"draining\"").unwrap();
        assert_eq!(state, PipelineState::Draining);
    }
}

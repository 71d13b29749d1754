//! One viewer's read cursor over a channel's ring.
//!
//! A session joins about half a ring behind the producer, waits for a video
//! keyframe, and from then on rebases every packet into its own timeline
//! starting near 1 before pacing it out through its MPEG-TS muxer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::channels::StreamingConfig;
use crate::codec::mpegts::TsMuxer;
use crate::codec::EncoderParams;
use crate::metrics::{SESSION_DROPPED, SESSION_OVERTAKEN, SESSION_STARVATION};
use crate::pacing::{sleep_cancellable, PaceOutcome, RealtimePacer};
use crate::packet::{rescale_q, Packet, StreamKind, MICROSECONDS, MPEG_CLOCK, NO_PTS};
use crate::rebase::{RebaseInput, RebaseState, TimestampContinuityEngine};
use crate::ring::Cursor;
use crate::supervisor::{Channel, ViewerGuard};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub poll_ceiling: u32,
    pub pacing_ceiling: Duration,
    /// Muxed output older than this is handed back even if the caller asked
    /// for more, so low-bitrate channels trickle instead of bursting.
    pub flush_interval: Duration,
}

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

impl SessionConfig {
    pub fn from_streaming(streaming: &StreamingConfig) -> Self {
        Self {
            poll_interval: streaming.poll_interval(),
            poll_ceiling: streaming.poll_ceiling.max(1),
            pacing_ceiling: streaming.session_pacing_ceiling(),
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

/// Result of one pull from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// Nothing fresh within the poll ceiling; try again.
    Pending,
    /// The channel is gone or shutting down.
    Closed,
}

pub struct StreamSession {
    channel: Arc<Channel>,
    _guard: ViewerGuard,
    params: EncoderParams,
    config: SessionConfig,
    cancel: CancellationToken,
    cursor: Cursor,
    timeline: RebaseState,
    pacer: RealtimePacer,
    muxer: TsMuxer,
    pending: BytesMut,
    last_flush: Instant,
    need_keyframe: bool,
    pace_kind: StreamKind,
    emitted: u64,
}

impl StreamSession {
    /// Attaches to `channel` using the encoder layout snapshot `params`.
    pub fn new(channel: Arc<Channel>, params: EncoderParams, config: SessionConfig) -> Self {
        let guard = channel.add_viewer();
        let cursor = channel.ring().join_cursor();
        let pace_kind = if params.video.is_some() { StreamKind::Video } else { StreamKind::Audio };
        debug!(
            channel = %channel.id(),
            index = cursor.index,
            last_sequence_id = cursor.last_sequence_id,
            "session joined"
        );
        Self {
            cancel: channel.cancel_token().clone(),
            _guard: guard,
            muxer: TsMuxer::new(&params),
            need_keyframe: params.video.is_some(),
            timeline: RebaseState::new(MPEG_CLOCK, MPEG_CLOCK),
            pacer: RealtimePacer::new(config.pacing_ceiling),
            pending: BytesMut::new(),
            last_flush: Instant::now(),
            emitted: 0,
            channel,
            params,
            config,
            cursor,
            pace_kind,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    /// Packets written to the muxer so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Pulls up to `max_bytes` of MPEG-TS. Output already muxed is handed
    /// back as soon as the ring has nothing fresh or the flush interval has
    /// passed; with nothing muxed the call polls up to the ceiling before
    /// returning `Pending`. Blocks while pacing.
    pub fn next_chunk(&mut self, max_bytes: usize) -> Chunk {
        let max_bytes = max_bytes.max(188);
        loop {
            if self.cancel.is_cancelled() {
                return self.flush_or(Chunk::Closed);
            }
            if self.pending.len() >= max_bytes {
                self.last_flush = Instant::now();
                return Chunk::Data(self.pending.split_to(max_bytes).freeze());
            }
            let attempts = if self.pending.is_empty() { self.config.poll_ceiling } else { 1 };
            let Some(packet) = self.poll(attempts) else {
                if self.cancel.is_cancelled() {
                    return self.flush_or(Chunk::Closed);
                }
                if !self.pending.is_empty() {
                    return self.flush();
                }
                SESSION_STARVATION.with_label_values(&[self.channel.id()]).inc();
                info!(
                    channel = %self.channel.id(),
                    "no fresh packet after {} polls (last sequence {})",
                    self.config.poll_ceiling,
                    self.cursor.last_sequence_id
                );
                return Chunk::Pending;
            };
            if !self.emit(&packet) {
                if self.cancel.is_cancelled() {
                    return self.flush_or(Chunk::Closed);
                }
            } else if self.last_flush.elapsed() >= self.config.flush_interval {
                return self.flush();
            }
        }
    }

    fn flush(&mut self) -> Chunk {
        self.last_flush = Instant::now();
        Chunk::Data(self.pending.split().freeze())
    }

    fn flush_or(&mut self, empty: Chunk) -> Chunk {
        if self.pending.is_empty() {
            empty
        } else {
            self.flush()
        }
    }

    /// Waits for the next fresh packet, re-joining when the producer has
    /// lapped this cursor.
    fn poll(&mut self, attempts: u32) -> Option<Arc<Packet>> {
        let channel = self.channel.clone();
        let ring = channel.ring();
        for attempt in 1..=attempts {
            if let Some(packet) = ring.try_read(&self.cursor) {
                let last = self.cursor.last_sequence_id;
                if last != 0 && packet.sequence_id > last + 1 {
                    self.rejoin(packet.sequence_id);
                    continue;
                }
                self.cursor = Cursor {
                    index: ring.index_next(self.cursor.index),
                    last_sequence_id: packet.sequence_id,
                };
                return Some(packet);
            }
            if attempt == attempts || !sleep_cancellable(self.config.poll_interval, &self.cancel) {
                return None;
            }
        }
        None
    }

    /// Rejoins half a ring behind the writer rather than at the live edge,
    /// so a keyframe is likely already in reach.
    fn rejoin(&mut self, seen: u64) {
        SESSION_OVERTAKEN.with_label_values(&[self.channel.id()]).inc();
        info!(
            channel = %self.channel.id(),
            "session overtaken (expected sequence {}, found {}), re-joining",
            self.cursor.last_sequence_id + 1,
            seen
        );
        self.cursor = self.channel.ring().join_cursor();
        self.need_keyframe = self.params.video.is_some();
        self.pacer.reset();
    }

    fn drop_packet(&self, packet: &Packet, reason: &str) {
        trace!(
            channel = %self.channel.id(),
            kind = packet.kind.as_str(),
            sequence_id = packet.sequence_id,
            reason,
            "session dropped packet"
        );
        SESSION_DROPPED.with_label_values(&[self.channel.id(), reason]).inc();
    }

    /// Rebases, paces and muxes one packet. False when it was not written.
    fn emit(&mut self, packet: &Packet) -> bool {
        if self.params.stream_index(packet.kind).is_none() {
            self.drop_packet(packet, "unmapped");
            return false;
        }
        if self.need_keyframe {
            if packet.kind != StreamKind::Video || !packet.is_key {
                self.drop_packet(packet, "awaiting_keyframe");
                return false;
            }
            self.need_keyframe = false;
        }
        if packet.pts == NO_PTS {
            self.drop_packet(packet, "no_pts");
            return false;
        }

        let rebased = TimestampContinuityEngine::rebase(&mut self.timeline, &RebaseInput::from(packet));
        if !rebased.advanced {
            self.drop_packet(packet, "non_monotonic");
            return false;
        }

        if packet.kind == self.pace_kind {
            let pts_us = rescale_q(rebased.pts, MPEG_CLOCK, MICROSECONDS);
            if self.pacer.pace(pts_us, &self.cancel) == PaceOutcome::Cancelled {
                return false;
            }
        }

        let dts = if rebased.dts == NO_PTS { rebased.pts } else { rebased.dts };
        self.muxer
            .write_packet(packet.kind, rebased.pts, dts, packet.is_key, &packet.payload, &mut self.pending);
        self.emitted += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSettings;
    use crate::codec::mpegts::{TsDemuxer, MUX_DELAY};
    use crate::codec::{AudioParams, VideoCodec, VideoParams};
    use crate::packet::Rational;

    const AUDIO_TB: Rational = Rational::new(1, 48_000);

    fn params() -> EncoderParams {
        EncoderParams {
            video: Some(VideoParams {
                codec: VideoCodec::H264,
                width: 640,
                height: 360,
                time_base: MPEG_CLOCK,
            }),
            audio: Some(AudioParams {
                sample_rate: 48_000,
                channels: 2,
                time_base: AUDIO_TB,
                frame_size: Some(1536),
            }),
        }
    }

    fn fast() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(1),
            poll_ceiling: 5,
            pacing_ceiling: Duration::from_millis(1),
            flush_interval: Duration::from_secs(60),
        }
    }

    fn channel(capacity: usize) -> Arc<Channel> {
        Arc::new(Channel::new(ChannelSettings::new("session"), capacity, &CancellationToken::new()))
    }

    fn video(pts: i64, key: bool, generation: u64) -> Packet {
        let mut p = Packet::new(StreamKind::Video, pts, pts, MPEG_CLOCK, Bytes::from_static(&[0, 0, 1, 9]));
        p.is_key = key;
        p.file_start_pts = 0;
        p.generation = generation;
        p.duration = 3600;
        p
    }

    fn audio(pts: i64, generation: u64) -> Packet {
        let mut p = Packet::new(StreamKind::Audio, pts, pts, AUDIO_TB, Bytes::from_static(&[0x0b, 0x77]));
        p.stream_index = 1;
        p.generation = generation;
        p.duration = 1536;
        p
    }

    fn demux(bytes: &[u8]) -> Vec<crate::codec::mpegts::TsUnit> {
        let mut demuxer = TsDemuxer::new();
        demuxer.push(bytes);
        demuxer.finish();
        std::iter::from_fn(|| demuxer.next_unit()).collect()
    }

    #[test]
    fn waits_for_keyframe_then_starts_near_one() {
        let channel = channel(16);
        let mut session = StreamSession::new(channel.clone(), params(), fast());
        assert_eq!(channel.viewers(), 1);

        channel.ring().push(audio(48_000, 1));
        channel.ring().push(video(900_000, false, 1));
        channel.ring().push(video(903_600, true, 1));
        channel.ring().push(audio(49_536, 1));
        channel.ring().push(video(907_200, false, 1));
        // The last written slot is never readable.
        channel.ring().push(video(910_800, false, 1));

        let Chunk::Data(bytes) = session.next_chunk(64 * 1024) else {
            panic!("expected data");
        };
        assert_eq!(session.emitted(), 3);
        let units = demux(&bytes);
        let video_pts: Vec<i64> = units.iter().filter(|u| u.pid == 0x100).filter_map(|u| u.pts).collect();
        assert_eq!(video_pts, vec![1 + MUX_DELAY, 3600 + MUX_DELAY]);
        assert!(units.iter().find(|u| u.pid == 0x100).unwrap().is_key);

        drop(session);
        assert_eq!(channel.viewers(), 0);
    }

    #[test]
    fn starvation_returns_pending() {
        let channel = channel(8);
        let mut session = StreamSession::new(channel, params(), fast());
        assert_eq!(session.next_chunk(1024), Chunk::Pending);
    }

    #[test]
    fn cancelled_channel_closes() {
        let root = CancellationToken::new();
        let channel = Arc::new(Channel::new(ChannelSettings::new("closing"), 8, &root));
        let mut session = StreamSession::new(channel, params(), fast());
        root.cancel();
        assert_eq!(session.next_chunk(1024), Chunk::Closed);
    }

    #[test]
    fn overtaken_session_rejoins_and_stays_monotonic() {
        let channel = channel(8);
        let mut session = StreamSession::new(channel.clone(), params(), fast());
        for i in 0..4 {
            channel.ring().push(video(i * 3600, i % 2 == 0, 1));
        }
        let Chunk::Data(first) = session.next_chunk(64 * 1024) else {
            panic!("expected data");
        };

        // Lap the session several times over.
        for i in 4..40 {
            channel.ring().push(video(i * 3600, i % 2 == 0, 1));
        }
        let Chunk::Data(second) = session.next_chunk(64 * 1024) else {
            panic!("expected data after re-join");
        };

        let mut all = first.to_vec();
        all.extend_from_slice(&second);
        let pts: Vec<i64> = demux(&all).iter().filter(|u| u.pid == 0x100).filter_map(|u| u.pts).collect();
        assert!(pts.len() > 3);
        assert!(pts.windows(2).all(|w| w[0] < w[1]), "pts not increasing: {pts:?}");
    }

    #[test]
    fn audio_only_needs_no_keyframe() {
        let channel = channel(8);
        let audio_only = EncoderParams {
            video: None,
            audio: params().audio,
        };
        let mut session = StreamSession::new(channel.clone(), audio_only, fast());
        for i in 0..4 {
            let mut p = audio(i * 1536, 1);
            p.stream_index = 0;
            channel.ring().push(p);
        }
        // A stray video packet is not part of this session's layout.
        channel.ring().push(video(0, true, 1));
        channel.ring().push(audio(4 * 1536, 1));

        let Chunk::Data(bytes) = session.next_chunk(64 * 1024) else {
            panic!("expected data");
        };
        let units = demux(&bytes);
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.pid == 0x101));
    }

    #[test]
    fn flush_interval_hands_back_each_paced_packet() {
        let channel = channel(16);
        let config = SessionConfig {
            flush_interval: Duration::ZERO,
            ..fast()
        };
        let mut session = StreamSession::new(channel.clone(), params(), config);
        for i in 0..5 {
            channel.ring().push(video(i * 3600, i == 0, 1));
        }

        for expected in 1..=4 {
            let Chunk::Data(bytes) = session.next_chunk(64 * 1024) else {
                panic!("expected data");
            };
            assert_eq!(session.emitted(), expected);
            let video_units = demux(&bytes).iter().filter(|u| u.pid == 0x100).count();
            assert_eq!(video_units, 1);
        }
    }

    #[test]
    fn first_viewer_after_idle_gets_no_stale_packets() {
        let channel = channel(16);
        let mut earlier = StreamSession::new(channel.clone(), params(), fast());
        for i in 0..6 {
            channel.ring().push(video(i * 3600, i % 3 == 0, 1));
        }
        assert!(matches!(earlier.next_chunk(64 * 1024), Chunk::Data(_)));
        drop(earlier);
        assert_eq!(channel.viewers(), 0);
        assert!(channel.ring().live_count() > 0);

        let mut session = StreamSession::new(channel.clone(), params(), fast());
        assert_eq!(channel.ring().live_count(), 0);
        assert_eq!(session.next_chunk(64 * 1024), Chunk::Pending);

        let stale = channel.ring().latest_sequence_id();
        for i in 0..3 {
            channel.ring().push(video(7_200_000 + i * 3600, i == 0, 2));
        }
        let Chunk::Data(bytes) = session.next_chunk(64 * 1024) else {
            panic!("expected data");
        };
        assert_eq!(session.emitted(), 2);
        assert_eq!(channel.ring().latest_sequence_id(), stale + 3);
        let video_pts: Vec<i64> = demux(&bytes).iter().filter(|u| u.pid == 0x100).filter_map(|u| u.pts).collect();
        assert_eq!(video_pts, vec![1 + MUX_DELAY, 3600 + MUX_DELAY]);
    }
}

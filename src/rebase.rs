//! Timestamp continuity across file boundaries and viewer join points.
//!
//! Every consumer of a channel's packets (the producer's own guard and each
//! viewer session) owns a [`RebaseState`] and runs packets through
//! [`TimestampContinuityEngine`]. The engine maps a packet's file-relative
//! timestamps into the owner's output time base so that, per stream kind,
//! the emitted pts sequence starts near 1 and keeps increasing across any
//! number of source files.

use crate::packet::{rescale_q, Rational, StreamKind, NO_PTS};

const UNSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackState {
    /// Output time base of this track.
    pub time_base: Rational,
    /// `-1` until the first packet of this kind is seen.
    pub start_pts: i64,
    pub last_pts: i64,
    pub base_pts: i64,
    pub generation: u64,
    /// Set on the other kind when a cut is propagated to it; its next packet
    /// gets the same strict-monotonicity bump as the one that saw the cut.
    cut_pending: bool,
}

impl TrackState {
    pub fn new(time_base: Rational) -> Self {
        Self {
            time_base,
            start_pts: UNSET,
            last_pts: 0,
            base_pts: 0,
            generation: 0,
            cut_pending: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.start_pts != UNSET
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseState {
    pub video: TrackState,
    pub audio: TrackState,
}

impl RebaseState {
    pub fn new(video_time_base: Rational, audio_time_base: Rational) -> Self {
        Self {
            video: TrackState::new(video_time_base),
            audio: TrackState::new(audio_time_base),
        }
    }

    pub fn track(&self, kind: StreamKind) -> &TrackState {
        match kind {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }

    fn track_mut(&mut self, kind: StreamKind) -> &mut TrackState {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    pub fn last_pts(&self, kind: StreamKind) -> i64 {
        self.track(kind).last_pts
    }
}

/// Timestamps of one packet as read from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseInput {
    pub kind: StreamKind,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub file_start_pts: i64,
    pub generation: u64,
}

impl From<&crate::packet::Packet> for RebaseInput {
    fn from(p: &crate::packet::Packet) -> Self {
        Self {
            kind: p.kind,
            pts: p.pts,
            dts: p.dts,
            duration: p.duration,
            time_base: p.time_base,
            file_start_pts: p.file_start_pts,
            generation: p.generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebased {
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    /// False when the pts does not move this track's timeline forward. The
    /// caller must drop such a packet.
    pub advanced: bool,
    /// The packet opened a new generation for this state.
    pub discontinuity: bool,
}

pub struct TimestampContinuityEngine;

impl TimestampContinuityEngine {
    /// Pure: computes the output for `input` and the state that would
    /// follow, without touching `state`.
    pub fn plan(state: &RebaseState, input: &RebaseInput) -> (Rebased, RebaseState) {
        let mut next = *state;
        let kind = input.kind;
        let out_tb = next.track(kind).time_base;

        if !next.track(kind).is_started() {
            Self::capture_start(&mut next, input);
        }

        let discontinuity = next.track(kind).generation != input.generation;
        if discontinuity {
            let track = next.track(kind);
            let base = track.last_pts + track.start_pts;
            next.track_mut(kind).base_pts = base;
            next.track_mut(kind).generation = input.generation;

            // Keep the other kind in lockstep across the cut.
            let other = kind.other();
            let other_tb = next.track(other).time_base;
            let other_track = next.track_mut(other);
            other_track.base_pts = rescale_q(base, out_tb, other_tb);
            other_track.generation = input.generation;
            other_track.cut_pending = other_track.is_started();
        }

        let bump = discontinuity || next.track(kind).cut_pending;
        next.track_mut(kind).cut_pending = false;
        let track = *next.track(kind);
        let map = |ts: i64| -> i64 {
            if ts == NO_PTS {
                return NO_PTS;
            }
            let mut out =
                rescale_q(ts - input.file_start_pts, input.time_base, out_tb) - track.start_pts + track.base_pts;
            if bump && out == track.last_pts {
                out += 1;
            }
            if out <= 0 {
                out = 1;
            }
            out
        };

        let pts = map(input.pts);
        let dts = map(input.dts);
        let duration = rescale_q(input.duration, input.time_base, out_tb);

        let advanced = pts != NO_PTS && pts > track.last_pts;
        if advanced {
            next.track_mut(kind).last_pts = pts;
        }

        (
            Rebased {
                pts,
                dts,
                duration,
                advanced,
                discontinuity,
            },
            next,
        )
    }

    /// Applies [`plan`](Self::plan) and commits the resulting state.
    pub fn rebase(state: &mut RebaseState, input: &RebaseInput) -> Rebased {
        let (out, next) = Self::plan(state, input);
        *state = next;
        out
    }

    fn capture_start(state: &mut RebaseState, input: &RebaseInput) {
        let kind = input.kind;
        let tb = state.track(kind).time_base;
        let origin = if input.pts == NO_PTS {
            input.file_start_pts
        } else {
            input.pts
        };
        let mut start = rescale_q(origin - input.file_start_pts, input.time_base, tb).max(1);

        let other = kind.other();
        let other_track = *state.track(other);
        if other_track.is_started() && other_track.generation != input.generation {
            // First packet of this kind comes from a newer file than the other
            // kind has seen: cut both onto the other's current position.
            let cut = other_track.last_pts + other_track.start_pts;
            let o = state.track_mut(other);
            o.base_pts = cut;
            o.generation = input.generation;
            o.cut_pending = true;

            let track = state.track_mut(kind);
            track.start_pts = rescale_q(other_track.start_pts, other_track.time_base, tb).max(1);
            track.last_pts = 0;
            track.base_pts = rescale_q(cut, other_track.time_base, tb);
            track.generation = input.generation;
            return;
        }
        if other_track.is_started() {
            // Later of the two wins so both kinds share one wall-clock origin.
            let other_here = rescale_q(other_track.start_pts, other_track.time_base, tb);
            if other_here > start {
                start = other_here;
            } else {
                state.track_mut(other).start_pts = rescale_q(start, tb, other_track.time_base).max(1);
            }
        }

        let generation = if other_track.is_started() {
            other_track.generation
        } else {
            input.generation
        };
        let track = state.track_mut(kind);
        track.start_pts = start;
        track.last_pts = 0;
        track.base_pts = if other_track.is_started() {
            rescale_q(other_track.base_pts, other_track.time_base, tb)
        } else {
            0
        };
        track.generation = generation;
    }
}

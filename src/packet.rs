use bytes::Bytes;
use serde::Serialize;

/// Reserved "no timestamp" value. Never emitted as a real pts/dts.
pub const NO_PTS: i64 = i64::MIN;

pub const MICROSECONDS: Rational = Rational::new(1, 1_000_000);
pub const MPEG_CLOCK: Rational = Rational::new(1, 90_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Convert `value` expressed in `from` units into `to` units, rounding to
/// the nearest integer with halves away from zero.
///
/// `NO_PTS` passes through untouched. An invalid time base yields 0.
pub fn rescale_q(value: i64, from: Rational, to: Rational) -> i64 {
    if value == NO_PTS {
        return NO_PTS;
    }
    if !from.is_valid() || !to.is_valid() {
        return 0;
    }
    let n = value as i128 * from.num as i128 * to.den as i128;
    let d = from.den as i128 * to.num as i128;
    let half = d / 2;
    let q = if n >= 0 { (n + half) / d } else { -((-n + half) / d) };
    q.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn other(self) -> Self {
        match self {
            StreamKind::Video => StreamKind::Audio,
            StreamKind::Audio => StreamKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

/// One encoded access unit as stored in a channel's ring.
///
/// Timestamps are in `time_base` units and relative to the source file's
/// timeline; `file_start_pts` is that file's origin for this stream kind.
/// `sequence_id` is stamped by the ring on insertion.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: StreamKind,
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub file_start_pts: i64,
    pub is_key: bool,
    pub sequence_id: u64,
    pub generation: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: StreamKind, pts: i64, dts: i64, time_base: Rational, payload: Bytes) -> Self {
        Self {
            kind,
            stream_index: 0,
            pts,
            dts,
            duration: 0,
            time_base,
            file_start_pts: 0,
            is_key: false,
            sequence_id: 0,
            generation: 0,
            payload,
        }
    }

    pub fn has_pts(&self) -> bool {
        self.pts != NO_PTS
    }
}

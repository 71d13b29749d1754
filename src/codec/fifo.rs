//! Re-chunks decoded audio into the frame size the encoder insists on.
//!
//! Timestamps are carried as the pts of the oldest queued sample. Each write
//! re-anchors that head from the incoming frame's pts minus whatever is
//! still queued, so source jitter spreads over the output frames instead of
//! accumulating, and a padded tail never causes a jump.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

use super::Frame;
use crate::packet::{rescale_q, Rational, StreamKind, NO_PTS};

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Error)]
#[error("audio fifo full: {queued} queued + {incoming} incoming exceeds {capacity} samples")]
pub struct FifoOverflow {
    pub queued: usize,
    pub incoming: usize,
    pub capacity: usize,
}

pub struct AudioFifo {
    frame_size: usize,
    capacity: usize,
    channels: usize,
    sample_tb: Rational,
    time_base: Rational,
    data: VecDeque<u8>,
    head_pts: i64,
}

impl AudioFifo {
    /// `source_frame` is the decoder's frame size; together with the
    /// encoder's `frame_size` it bounds how much may ever be queued.
    pub fn new(frame_size: usize, source_frame: usize, sample_rate: u32, channels: u16, time_base: Rational) -> Self {
        let channels = usize::from(channels.max(1));
        let capacity = frame_size + source_frame.max(1);
        Self {
            frame_size,
            capacity,
            channels,
            sample_tb: Rational::new(1, sample_rate.max(1) as i32),
            time_base,
            data: VecDeque::with_capacity(capacity * channels * BYTES_PER_SAMPLE),
            head_pts: NO_PTS,
        }
    }

    fn sample_bytes(&self) -> usize {
        self.channels * BYTES_PER_SAMPLE
    }

    pub fn queued(&self) -> usize {
        self.data.len() / self.sample_bytes()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), FifoOverflow> {
        let queued = self.queued();
        if queued + frame.samples > self.capacity {
            return Err(FifoOverflow {
                queued,
                incoming: frame.samples,
                capacity: self.capacity,
            });
        }
        if frame.pts != NO_PTS {
            let pts = rescale_q(frame.pts, frame.time_base, self.time_base);
            self.head_pts = pts - rescale_q(queued as i64, self.sample_tb, self.time_base);
        }
        let want = frame.samples * self.sample_bytes();
        let have = frame.data.len().min(want);
        self.data.extend(&frame.data[..have]);
        // Short payloads are padded with silence.
        self.data.extend(std::iter::repeat(0u8).take(want - have));
        Ok(())
    }

    /// Next full encoder frame, if enough samples are queued.
    pub fn pop(&mut self) -> Option<Frame> {
        if self.queued() < self.frame_size {
            return None;
        }
        Some(self.take(self.frame_size))
    }

    /// Pads whatever remains to a full frame. Used when the source ends.
    pub fn drain(&mut self) -> Option<Frame> {
        let queued = self.queued();
        if queued == 0 {
            return None;
        }
        let pad = (self.frame_size - queued % self.frame_size) % self.frame_size;
        self.data.extend(std::iter::repeat(0u8).take(pad * self.sample_bytes()));
        self.pop()
    }

    fn take(&mut self, samples: usize) -> Frame {
        let bytes: Vec<u8> = self.data.drain(..samples * self.sample_bytes()).collect();
        let pts = self.head_pts;
        let duration = rescale_q(samples as i64, self.sample_tb, self.time_base);
        if self.head_pts != NO_PTS {
            self.head_pts += duration;
        }
        Frame {
            kind: StreamKind::Audio,
            pts,
            dts: pts,
            duration,
            time_base: self.time_base,
            samples,
            is_key: true,
            data: Bytes::from(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB: Rational = Rational::new(1, 48_000);

    fn frame(pts: i64, samples: usize) -> Frame {
        Frame {
            kind: StreamKind::Audio,
            pts,
            dts: pts,
            duration: samples as i64,
            time_base: TB,
            samples,
            is_key: true,
            data: Bytes::from(vec![1u8; samples * 4]),
        }
    }

    #[test]
    fn rechunks_to_encoder_frame_size() {
        let mut fifo = AudioFifo::new(1024, 1536, 48_000, 2, TB);
        fifo.write(&frame(0, 1536)).unwrap();
        let first = fifo.pop().unwrap();
        assert_eq!(first.samples, 1024);
        assert_eq!(first.pts, 0);
        assert_eq!(first.data.len(), 1024 * 4);
        assert!(fifo.pop().is_none());
        assert_eq!(fifo.queued(), 512);

        fifo.write(&frame(1536, 1536)).unwrap();
        let pts: Vec<i64> = std::iter::from_fn(|| fifo.pop()).map(|f| f.pts).collect();
        assert_eq!(pts, vec![1024, 2048]);
    }

    #[test]
    fn output_pts_never_jumps_backwards_with_jitter() {
        let mut fifo = AudioFifo::new(1024, 1536, 48_000, 2, TB);
        let mut out = Vec::new();
        let mut src = 0;
        for i in 0..20 {
            let jitter = if i % 3 == 0 { 7 } else { -5 };
            fifo.write(&frame(src + jitter, 1536)).unwrap();
            while let Some(f) = fifo.pop() {
                out.push(f.pts);
            }
            src += 1536;
        }
        assert!(out.windows(2).all(|w| w[1] > w[0]), "{out:?}");
    }

    #[test]
    fn overflow_is_reported() {
        let mut fifo = AudioFifo::new(1024, 1536, 48_000, 2, TB);
        fifo.write(&frame(0, 1536)).unwrap();
        let err = fifo.write(&frame(1536, 1536)).unwrap_err();
        assert_eq!(err.capacity, 2560);
    }

    #[test]
    fn drain_pads_the_tail_with_silence() {
        let mut fifo = AudioFifo::new(1024, 1536, 48_000, 2, TB);
        fifo.write(&frame(0, 1536)).unwrap();
        fifo.pop().unwrap();
        let tail = fifo.drain().unwrap();
        assert_eq!(tail.samples, 1024);
        assert_eq!(tail.pts, 1024);
        assert!(tail.data[512 * 4..].iter().all(|&b| b == 0));
        assert!(fifo.drain().is_none());
    }

    #[test]
    fn output_is_rescaled_into_encoder_time_base() {
        let mut fifo = AudioFifo::new(1024, 1536, 48_000, 2, crate::packet::MPEG_CLOCK);
        fifo.write(&frame(48_000, 1536)).unwrap();
        let f = fifo.pop().unwrap();
        assert_eq!(f.pts, 90_000);
        assert_eq!(f.duration, 1920);
    }
}

//! MPEG transport stream writer for session output, plus a push-style reader
//! used on ffmpeg's stdout and by tests to inspect what sessions emit.

use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};

use super::{EncoderParams, VideoCodec};
use crate::packet::StreamKind;

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = 184;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;
const NULL_PID: u16 = 0x1fff;

const PROGRAM_NUMBER: u16 = 1;
pub const STREAM_TYPE_AC3: u8 = 0x81;
const VIDEO_STREAM_ID: u8 = 0xe0;
const PRIVATE_STREAM_1: u8 = 0xbd;

/// PSI tables and PCR are repeated at least this often (90 kHz ticks).
const PSI_INTERVAL: i64 = 9_000;
const PCR_INTERVAL: i64 = 2_700;
/// PTS/DTS run this far ahead of the PCR so players buffer before decoding
/// (700 ms at 90 kHz).
pub const MUX_DELAY: i64 = 63_000;
const TIMESTAMP_MASK: i64 = (1 << 33) - 1;

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 { (r << 1) ^ 0x04c1_1db7 } else { r << 1 };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// CRC-32/MPEG-2 as used by PSI sections.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    data.iter().fold(0xffff_ffff, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) ^ u32::from(b)) as usize]
    })
}

fn write_timestamp(out: &mut BytesMut, prefix: u8, ts: i64) {
    let ts = ts & TIMESTAMP_MASK;
    out.put_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    out.put_u8(((ts >> 22) & 0xff) as u8);
    out.put_u8(((((ts >> 15) & 0x7f) as u8) << 1) | 1);
    out.put_u8(((ts >> 7) & 0xff) as u8);
    out.put_u8((((ts & 0x7f) as u8) << 1) | 1);
}

fn read_timestamp(data: &[u8]) -> i64 {
    ((i64::from(data[0]) >> 1) & 0x07) << 30
        | i64::from(data[1]) << 22
        | (i64::from(data[2]) >> 1) << 15
        | i64::from(data[3]) << 7
        | i64::from(data[4]) >> 1
}

pub struct TsMuxer {
    video: Option<VideoCodec>,
    audio: bool,
    pcr_pid: u16,
    continuity: HashMap<u16, u8>,
    last_psi: Option<i64>,
    last_pcr: Option<i64>,
}

impl TsMuxer {
    pub fn new(params: &EncoderParams) -> Self {
        let video = params.video.map(|v| v.codec);
        Self {
            video,
            audio: params.audio.is_some(),
            pcr_pid: if video.is_some() { VIDEO_PID } else { AUDIO_PID },
            continuity: HashMap::new(),
            last_psi: None,
            last_pcr: None,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0f);
        *cc = (*cc + 1) & 0x0f;
        *cc
    }

    /// Writes one access unit. `pts`/`dts` are in 90 kHz ticks on the
    /// session clock, which the PCR follows; the PES timestamps carry
    /// [`MUX_DELAY`] on top.
    pub fn write_packet(&mut self, kind: StreamKind, pts: i64, dts: i64, is_key: bool, payload: &[u8], out: &mut BytesMut) {
        let pid = match kind {
            StreamKind::Video if self.video.is_some() => VIDEO_PID,
            StreamKind::Audio if self.audio => AUDIO_PID,
            _ => return,
        };
        let clock = if dts > 0 { dts } else { pts };

        let psi_due = self.last_psi.map_or(true, |t| clock - t >= PSI_INTERVAL);
        if psi_due || (kind == StreamKind::Video && is_key) {
            self.write_psi(out);
            self.last_psi = Some(clock);
        }

        let pcr = if pid == self.pcr_pid && self.last_pcr.map_or(true, |t| clock - t >= PCR_INTERVAL) {
            self.last_pcr = Some(clock);
            Some(clock)
        } else {
            None
        };

        let stream_id = if pid == VIDEO_PID { VIDEO_STREAM_ID } else { PRIVATE_STREAM_1 };
        let pes = build_pes(stream_id, pts + MUX_DELAY, if dts > 0 { dts + MUX_DELAY } else { dts }, payload);
        self.write_pes(pid, &pes, is_key, pcr, out);
    }

    fn write_pes(&mut self, pid: u16, pes: &[u8], is_key: bool, pcr: Option<i64>, out: &mut BytesMut) {
        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            // Adaptation field body, excluding its length byte.
            let mut adaptation: Option<Vec<u8>> = None;
            if first && (is_key || pcr.is_some()) {
                let mut body = vec![0u8];
                if is_key {
                    body[0] |= 0x40;
                }
                if let Some(clock) = pcr {
                    body[0] |= 0x10;
                    let base = clock & TIMESTAMP_MASK;
                    body.extend_from_slice(&[
                        (base >> 25) as u8,
                        (base >> 17) as u8,
                        (base >> 9) as u8,
                        (base >> 1) as u8,
                        (((base & 1) as u8) << 7) | 0x7e,
                        0,
                    ]);
                }
                adaptation = Some(body);
            }

            let remaining = pes.len() - offset;
            let af_len = adaptation.as_ref().map_or(0, |a| a.len() + 1);
            let space = TS_PAYLOAD_SIZE - af_len;
            if remaining < space {
                let stuffing = space - remaining;
                match adaptation.as_mut() {
                    Some(body) => body.extend(std::iter::repeat(0xff).take(stuffing)),
                    None if stuffing == 1 => adaptation = Some(Vec::new()),
                    None => {
                        let mut body = vec![0u8];
                        body.extend(std::iter::repeat(0xff).take(stuffing - 2));
                        adaptation = Some(body);
                    }
                }
            }

            let af_len = adaptation.as_ref().map_or(0, |a| a.len() + 1);
            let take = remaining.min(TS_PAYLOAD_SIZE - af_len);
            let cc = self.next_cc(pid);
            out.put_u8(SYNC_BYTE);
            out.put_u8((if first { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1f));
            out.put_u8(pid as u8);
            out.put_u8((if adaptation.is_some() { 0x30 } else { 0x10 }) | cc);
            if let Some(body) = adaptation {
                out.put_u8(body.len() as u8);
                out.put_slice(&body);
            }
            out.put_slice(&pes[offset..offset + take]);
            offset += take;
            first = false;
        }
    }

    pub fn write_psi(&mut self, out: &mut BytesMut) {
        let pat = self.pat_section();
        self.write_section(PAT_PID, &pat, out);
        let pmt = self.pmt_section();
        self.write_section(PMT_PID, &pmt, out);
    }

    fn write_section(&mut self, pid: u16, section: &[u8], out: &mut BytesMut) {
        let cc = self.next_cc(pid);
        out.put_u8(SYNC_BYTE);
        out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1f));
        out.put_u8(pid as u8);
        out.put_u8(0x10 | cc);
        out.put_u8(0); // pointer_field
        out.put_slice(section);
        out.put_bytes(0xff, TS_PAYLOAD_SIZE - 1 - section.len());
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
        body.extend_from_slice(&[0xc1, 0x00, 0x00]);
        body.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        body.extend_from_slice(&[0xe0 | (PMT_PID >> 8) as u8, PMT_PID as u8]);
        finish_section(0x00, body)
    }

    fn pmt_section(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        body.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        body.extend_from_slice(&[0xc1, 0x00, 0x00]);
        body.extend_from_slice(&[0xe0 | (self.pcr_pid >> 8) as u8, self.pcr_pid as u8]);
        body.extend_from_slice(&[0xf0, 0x00]);
        if let Some(codec) = self.video {
            body.extend_from_slice(&[codec.stream_type(), 0xe0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xf0, 0x00]);
        }
        if self.audio {
            body.extend_from_slice(&[STREAM_TYPE_AC3, 0xe0 | (AUDIO_PID >> 8) as u8, AUDIO_PID as u8, 0xf0, 0x00]);
        }
        finish_section(0x02, body)
    }
}

fn finish_section(table_id: u8, body: Vec<u8>) -> Vec<u8> {
    let length = body.len() + 4;
    let mut section = Vec::with_capacity(3 + length);
    section.push(table_id);
    section.push(0xb0 | ((length >> 8) as u8 & 0x0f));
    section.push(length as u8);
    section.extend_from_slice(&body);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn build_pes(stream_id: u8, pts: i64, dts: i64, payload: &[u8]) -> Vec<u8> {
    let with_dts = dts > 0 && dts != pts;
    let header_data_len: usize = if with_dts { 10 } else { 5 };
    let mut pes = BytesMut::with_capacity(9 + header_data_len + payload.len());
    pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    let length = 3 + header_data_len + payload.len();
    // Unbounded video PES is signalled with length 0.
    let length = if stream_id == VIDEO_STREAM_ID || length > 0xffff { 0 } else { length as u16 };
    pes.put_u16(length);
    pes.put_u8(0x80);
    pes.put_u8(if with_dts { 0xc0 } else { 0x80 });
    pes.put_u8(header_data_len as u8);
    if with_dts {
        write_timestamp(&mut pes, 0x3, pts);
        write_timestamp(&mut pes, 0x1, dts);
    } else {
        write_timestamp(&mut pes, 0x2, pts);
    }
    pes.put_slice(payload);
    pes.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsStream {
    pub pid: u16,
    pub stream_type: u8,
    pub language: Option<String>,
}

impl TsStream {
    pub fn kind(&self) -> Option<StreamKind> {
        match self.stream_type {
            0x01 | 0x02 | 0x1b | 0x24 => Some(StreamKind::Video),
            0x03 | 0x04 | 0x0f | 0x11 | 0x81 | 0x87 => Some(StreamKind::Audio),
            _ => None,
        }
    }
}

/// One reassembled PES payload. Timestamps are raw 90 kHz values.
#[derive(Debug, Clone)]
pub struct TsUnit {
    pub pid: u16,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub is_key: bool,
    pub payload: Bytes,
}

struct PesAssembly {
    buffer: Vec<u8>,
    is_key: bool,
}

/// Accepts arbitrary byte chunks and yields complete PES units once the
/// next unit on the same PID starts (or its declared length is reached).
#[derive(Default)]
pub struct TsDemuxer {
    pending: Vec<u8>,
    pmt_pid: Option<u16>,
    streams: Vec<TsStream>,
    assemblies: HashMap<u16, PesAssembly>,
    ready: VecDeque<TsUnit>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streams(&self) -> &[TsStream] {
        &self.streams
    }

    pub fn has_program(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        let mut pos = 0;
        while self.pending.len() - pos >= TS_PACKET_SIZE {
            if self.pending[pos] != SYNC_BYTE {
                pos += 1;
                continue;
            }
            let packet: [u8; TS_PACKET_SIZE] = match self.pending[pos..pos + TS_PACKET_SIZE].try_into() {
                Ok(p) => p,
                Err(_) => break,
            };
            self.handle_packet(&packet);
            pos += TS_PACKET_SIZE;
        }
        self.pending.drain(..pos);
    }

    pub fn next_unit(&mut self) -> Option<TsUnit> {
        self.ready.pop_front()
    }

    /// Emits whatever is still being assembled. Call at end of input.
    pub fn finish(&mut self) {
        let mut pids: Vec<u16> = self.assemblies.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            self.complete(pid);
        }
    }

    fn handle_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        let pusi = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1] & 0x1f) << 8) | u16::from(packet[2]);
        let has_adaptation = packet[3] & 0x20 != 0;
        let has_payload = packet[3] & 0x10 != 0;
        if pid == NULL_PID || !has_payload {
            return;
        }

        let mut offset = 4;
        let mut random_access = false;
        if has_adaptation {
            let len = usize::from(packet[4]);
            if len > 0 {
                random_access = packet[5] & 0x40 != 0;
            }
            offset += 1 + len;
        }
        if offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if pid == PAT_PID {
            if pusi {
                self.parse_pat(payload);
            }
            return;
        }
        if Some(pid) == self.pmt_pid {
            if pusi {
                self.parse_pmt(payload);
            }
            return;
        }
        if !self.streams.iter().any(|s| s.pid == pid) {
            return;
        }

        if pusi {
            self.complete(pid);
            self.assemblies.insert(
                pid,
                PesAssembly {
                    buffer: payload.to_vec(),
                    is_key: random_access,
                },
            );
        } else if let Some(assembly) = self.assemblies.get_mut(&pid) {
            assembly.buffer.extend_from_slice(payload);
            assembly.is_key |= random_access;
        }

        let declared_done = self.assemblies.get(&pid).is_some_and(|a| {
            let declared = a.buffer.get(4..6).map_or(0, |b| usize::from(u16::from_be_bytes([b[0], b[1]])));
            declared > 0 && a.buffer.len() >= 6 + declared
        });
        if declared_done {
            self.complete(pid);
        }
    }

    fn complete(&mut self, pid: u16) {
        let Some(assembly) = self.assemblies.remove(&pid) else {
            return;
        };
        let data = assembly.buffer;
        if data.len() < 9 || data[..3] != [0x00, 0x00, 0x01] {
            return;
        }
        let declared = usize::from(u16::from_be_bytes([data[4], data[5]]));
        let flags = (data[7] >> 6) & 0x03;
        let header_end = 9 + usize::from(data[8]);
        if header_end > data.len() {
            return;
        }
        let pts = (flags >= 2 && data.len() >= 14).then(|| read_timestamp(&data[9..14]));
        let dts = if flags == 3 && data.len() >= 19 {
            Some(read_timestamp(&data[14..19]))
        } else {
            pts
        };
        let end = if declared > 0 { (6 + declared).min(data.len()) } else { data.len() };
        self.ready.push_back(TsUnit {
            pid,
            pts,
            dts,
            is_key: assembly.is_key,
            payload: Bytes::copy_from_slice(&data[header_end..end.max(header_end)]),
        });
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(section) = section_after_pointer(payload, 0x00) else {
            return;
        };
        let end = section_end(section);
        let mut pos = 8;
        while pos + 4 <= end {
            let program = u16::from_be_bytes([section[pos], section[pos + 1]]);
            let pid = (u16::from(section[pos + 2] & 0x1f) << 8) | u16::from(section[pos + 3]);
            if program != 0 {
                self.pmt_pid = Some(pid);
                return;
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some(section) = section_after_pointer(payload, 0x02) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let end = section_end(section);
        let info_len = (usize::from(section[10] & 0x0f) << 8) | usize::from(section[11]);
        let mut pos = 12 + info_len;
        let mut streams = Vec::new();
        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = (u16::from(section[pos + 1] & 0x1f) << 8) | u16::from(section[pos + 2]);
            let es_len = (usize::from(section[pos + 3] & 0x0f) << 8) | usize::from(section[pos + 4]);
            let descriptors = section.get(pos + 5..(pos + 5 + es_len).min(end)).unwrap_or(&[]);
            streams.push(TsStream {
                pid,
                stream_type,
                language: language_descriptor(descriptors),
            });
            pos += 5 + es_len;
        }
        self.streams = streams;
    }
}

fn section_after_pointer(payload: &[u8], table_id: u8) -> Option<&[u8]> {
    let pointer = usize::from(*payload.first()?);
    let section = payload.get(1 + pointer..)?;
    (section.len() >= 8 && section[0] == table_id).then_some(section)
}

/// Offset of the CRC within the section, bounded by what we actually have.
fn section_end(section: &[u8]) -> usize {
    let length = (usize::from(section[1] & 0x0f) << 8) | usize::from(section[2]);
    (3 + length).min(section.len()).saturating_sub(4)
}

fn language_descriptor(mut data: &[u8]) -> Option<String> {
    while data.len() >= 2 {
        let tag = data[0];
        let len = usize::from(data[1]);
        let body = data.get(2..2 + len)?;
        if tag == 0x0a && len >= 3 {
            return Some(String::from_utf8_lossy(&body[..3]).to_string());
        }
        data = &data[2 + len..];
    }
    None
}

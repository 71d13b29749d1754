//! Production engine: one ffmpeg child per source file transcodes to H.264
//! or MPEG-2 plus AC-3 in an MPEG-TS container on stdout, which is demuxed
//! here. Decoding and encoding happen inside ffmpeg, so this engine's
//! decoder and encoder stages only forward units and convert time bases.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::Signal;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::mpegts::TsDemuxer;
use super::{CodecEngine, CodecError, Decoder, Demuxer, Encoder, Frame, OpenOptions, StreamInfo};
use crate::hardware;
use crate::metrics::FFMPEG_CPU_USAGE;
use crate::packet::{rescale_q, Packet, Rational, StreamKind, MPEG_CLOCK, NO_PTS};

const STDERR_LINES: usize = 50;
const READ_CHUNK: usize = 64 * 1024;
/// Give up if the program tables have not shown up after this much output.
const PROBE_BYTES: usize = 8 * 1024 * 1024;
const OUTPUT_SAMPLE_RATE: u32 = 48_000;
const AC3_FRAME_SAMPLES: usize = 1536;

#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    binary: String,
    hw_accel: String,
    threads: u8,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<String>, hw_accel: &str, threads: u8) -> Self {
        Self {
            binary: binary.into(),
            hw_accel: hw_accel.to_string(),
            threads,
        }
    }

    pub fn build_args(&self, path: &Path, options: &OpenOptions) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(), "warning".into(),
        ];
        args.extend(hardware::get_global_args(&self.hw_accel));

        // Clean up input timestamps and drop garbage.
        args.extend(["-fflags".into(), "+genpts+discardcorrupt".into()]);
        args.push("-i".into());
        args.push(path.to_string_lossy().into_owned());

        if options.audio_only {
            args.push("-vn".into());
        } else {
            args.extend(["-map".into(), "0:v:0?".into()]);
        }
        let audio_map = match &options.language {
            Some(lang) => format!("0:a:m:language:{lang}?"),
            None => "0:a:0?".into(),
        };
        args.extend(["-map".into(), audio_map, "-sn".into(), "-dn".into()]);

        args.extend(hardware::get_ffmpeg_args(&self.hw_accel, options.video_codec, self.threads));
        args.extend(hardware::get_audio_args(OUTPUT_SAMPLE_RATE));

        args.extend([
            "-max_muxing_queue_size".into(), "1024".into(),
            "-mpegts_flags".into(), "+resend_headers".into(),
            "-f".into(), "mpegts".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

impl CodecEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_demuxer(&self, path: &Path, options: &OpenOptions) -> Result<Box<dyn Demuxer>, CodecError> {
        if !path.exists() {
            return Err(CodecError::Fatal(format!("no such file: {}", path.display())));
        }
        let args = self.build_args(path, options);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        info!("ffmpeg spawned: pid={} channel={} file={}", child.id(), options.channel, path.display());

        let stderr_ring: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&stderr_ring);
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!("ffmpeg: {}", line);
                    let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
                    if ring.len() >= STDERR_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(line);
                }
            });
        }

        let stop = CancellationToken::new();
        spawn_cpu_monitor(child.id(), options.channel.clone(), stop.clone());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CodecError::Fatal("ffmpeg stdout unavailable".into()))?;
        let mut demuxer = FfmpegDemuxer {
            child,
            stdout,
            ts: TsDemuxer::new(),
            streams: Vec::new(),
            pid_index: HashMap::new(),
            stderr_ring,
            stop,
            channel: options.channel.clone(),
            file: path.display().to_string(),
            eof: false,
            suspended: false,
            audio: AudioTiming::default(),
        };
        demuxer.probe()?;
        Ok(Box::new(demuxer))
    }

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(Box::new(Passthrough::new(stream)))
    }

    fn open_encoder(&self, stream: &StreamInfo, _options: &OpenOptions) -> Result<Box<dyn Encoder>, CodecError> {
        Ok(Box::new(Passthrough::new(stream)))
    }
}

fn spawn_cpu_monitor(pid: u32, channel: String, stop: CancellationToken) {
    std::thread::spawn(move || {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        while crate::pacing::sleep_cancellable(Duration::from_secs(5), &stop) {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            match sys.process(pid) {
                Some(process) => {
                    FFMPEG_CPU_USAGE.with_label_values(&[&channel]).set(f64::from(process.cpu_usage()));
                }
                None => break,
            }
        }
        FFMPEG_CPU_USAGE.with_label_values(&[&channel]).set(0.0);
    });
}

pub struct FfmpegDemuxer {
    child: Child,
    stdout: ChildStdout,
    ts: TsDemuxer,
    streams: Vec<StreamInfo>,
    pid_index: HashMap<u16, usize>,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    stop: CancellationToken,
    channel: String,
    file: String,
    eof: bool,
    suspended: bool,
    audio: AudioTiming,
}

impl FfmpegDemuxer {
    /// Reads until the PMT has been seen and maps its streams.
    fn probe(&mut self) -> Result<(), CodecError> {
        let mut consumed = 0;
        while !self.ts.has_program() {
            if consumed > PROBE_BYTES {
                return Err(CodecError::Fatal("no program tables in ffmpeg output".into()));
            }
            match self.fill()? {
                0 => return Err(self.exit_error()),
                n => consumed += n,
            }
        }
        for ts in self.ts.streams() {
            let index = self.streams.len();
            let info = match ts.kind() {
                Some(StreamKind::Video) => StreamInfo::video(index, MPEG_CLOCK, 0, 0),
                Some(StreamKind::Audio) => StreamInfo::audio(index, MPEG_CLOCK, OUTPUT_SAMPLE_RATE, 2)
                    .with_frame_samples(AC3_FRAME_SAMPLES),
                None => continue,
            };
            let info = match &ts.language {
                Some(lang) => info.with_language(lang.clone()),
                None => info,
            };
            self.pid_index.insert(ts.pid, index);
            self.streams.push(info);
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<usize, CodecError> {
        let mut buffer = vec![0u8; READ_CHUNK];
        let n = self.stdout.read(&mut buffer)?;
        if n == 0 {
            self.eof = true;
            self.ts.finish();
        } else {
            self.ts.push(&buffer[..n]);
        }
        Ok(n)
    }

    fn exit_error(&mut self) -> CodecError {
        match self.child.wait() {
            Ok(status) if status.success() => CodecError::EndOfStream,
            Ok(status) => {
                let ring = self.stderr_ring.lock().unwrap_or_else(|e| e.into_inner());
                if ring.is_empty() {
                    warn!("ffmpeg exited with error: channel={} file={} status={} (no stderr captured)", self.channel, self.file, status);
                } else {
                    warn!(
                        "ffmpeg exited with error: channel={} file={} status={} last_stderr_lines=\n{}",
                        self.channel,
                        self.file,
                        status,
                        ring.iter().cloned().collect::<Vec<_>>().join("\n")
                    );
                }
                CodecError::Fatal(format!("ffmpeg exited with {status}"))
            }
            Err(e) => CodecError::Io(e),
        }
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        loop {
            if let Some(unit) = self.ts.next_unit() {
                let Some(&index) = self.pid_index.get(&unit.pid) else {
                    continue;
                };
                let stream = &self.streams[index];
                let pts = unit.pts.unwrap_or(NO_PTS);
                let mut packet = Packet::new(stream.kind, pts, unit.dts.unwrap_or(pts), MPEG_CLOCK, unit.payload);
                packet.stream_index = index;
                packet.is_key = unit.is_key || stream.kind == StreamKind::Audio;
                if stream.kind != StreamKind::Audio {
                    return Ok(packet);
                }
                match self.audio.offer(packet) {
                    Some(ready) => return Ok(ready),
                    None => continue,
                }
            }
            if self.eof {
                if let Some(last) = self.audio.finish() {
                    return Ok(last);
                }
                return Err(self.exit_error());
            }
            self.fill()?;
        }
    }

    #[cfg(unix)]
    fn suspend(&mut self) -> bool {
        if !self.suspended && !self.eof {
            self.suspended = signal_child(&self.child, Signal::SIGSTOP);
            if self.suspended {
                debug!("ffmpeg paused: channel={} file={}", self.channel, self.file);
            }
        }
        self.suspended
    }

    #[cfg(unix)]
    fn resume(&mut self) {
        if self.suspended {
            signal_child(&self.child, Signal::SIGCONT);
            self.suspended = false;
            debug!("ffmpeg resumed: channel={} file={}", self.channel, self.file);
        }
    }
}

#[cfg(unix)]
fn signal_child(child: &Child, signal: Signal) -> bool {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    match nix::sys::signal::kill(pid, signal) {
        Ok(()) => true,
        Err(e) => {
            warn!("cannot send {:?} to ffmpeg pid {}: {}", signal, child.id(), e);
            false
        }
    }
}

/// Audio PES from ffmpeg may bundle several AC-3 frames, so each unit is
/// held until the next one shows how long it really lasts.
#[derive(Debug)]
struct AudioTiming {
    held: Option<Packet>,
    last_duration: i64,
}

impl Default for AudioTiming {
    fn default() -> Self {
        Self {
            held: None,
            last_duration: rescale_q(AC3_FRAME_SAMPLES as i64, Rational::new(1, OUTPUT_SAMPLE_RATE as i32), MPEG_CLOCK),
        }
    }
}

impl AudioTiming {
    /// Takes the newest audio packet and returns the previous one with its
    /// duration filled in.
    fn offer(&mut self, packet: Packet) -> Option<Packet> {
        let next_pts = packet.pts;
        let mut ready = self.held.replace(packet)?;
        if ready.pts != NO_PTS && next_pts != NO_PTS && next_pts > ready.pts {
            self.last_duration = next_pts - ready.pts;
        }
        ready.duration = self.last_duration;
        Some(ready)
    }

    /// The last packet of the file, assumed as long as the one before it.
    fn finish(&mut self) -> Option<Packet> {
        let mut last = self.held.take()?;
        last.duration = self.last_duration;
        Some(last)
    }
}

impl Drop for FfmpegDemuxer {
    fn drop(&mut self) {
        self.stop.cancel();
        if !self.eof {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        debug!("ffmpeg stopped: channel={} file={} suspended={}", self.channel, self.file, self.suspended);
    }
}

/// Decoder and encoder stage for already-encoded units.
struct Passthrough {
    kind: StreamKind,
    time_base: Rational,
    samples: usize,
    queue: VecDeque<Packet>,
}

impl Passthrough {
    fn new(stream: &StreamInfo) -> Self {
        let time_base = match stream.kind {
            StreamKind::Video => MPEG_CLOCK,
            StreamKind::Audio => Rational::new(1, stream.sample_rate.max(1) as i32),
        };
        Self {
            kind: stream.kind,
            time_base,
            samples: stream.frame_samples.unwrap_or(0),
            queue: VecDeque::new(),
        }
    }
}

impl Decoder for Passthrough {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        self.queue.push_back(packet.clone());
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Frame, CodecError> {
        let packet = self.queue.pop_front().ok_or(CodecError::WouldBlock)?;
        Ok(Frame {
            kind: self.kind,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            time_base: packet.time_base,
            samples: self.samples,
            is_key: packet.is_key,
            data: packet.payload,
        })
    }
}

impl Encoder for Passthrough {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), CodecError> {
        let pts = rescale_q(frame.pts, frame.time_base, self.time_base);
        let dts = rescale_q(frame.dts, frame.time_base, self.time_base);
        let mut packet = Packet::new(self.kind, pts, dts, self.time_base, frame.data);
        packet.duration = rescale_q(frame.duration, frame.time_base, self.time_base);
        packet.is_key = frame.is_key;
        self.queue.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Packet, CodecError> {
        self.queue.pop_front().ok_or(CodecError::WouldBlock)
    }
}

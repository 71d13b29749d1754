use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, register_int_gauge_vec, Encoder, GaugeVec, IntCounterVec,
    IntGaugeVec, TextEncoder,
};
use serde::Deserialize;

lazy_static! {
    pub static ref CHANNEL_VIEWERS: IntGaugeVec = register_int_gauge_vec!(
        "loopcast_channel_viewers",
        "Viewers currently attached to a channel",
        &["channel"]
    )
    .unwrap();
    pub static ref RING_PACKETS: IntCounterVec = register_int_counter_vec!(
        "loopcast_ring_packets_total",
        "Packets pushed into a channel's ring buffer",
        &["channel"]
    )
    .unwrap();
    pub static ref PRODUCER_DROPPED: IntCounterVec = register_int_counter_vec!(
        "loopcast_producer_dropped_packets_total",
        "Encoded packets the producer discarded before the ring",
        &["channel"]
    )
    .unwrap();
    pub static ref SESSION_STARVATION: IntCounterVec = register_int_counter_vec!(
        "loopcast_session_starvation_total",
        "Polls that hit the retry ceiling without a fresh packet",
        &["channel"]
    )
    .unwrap();
    pub static ref SESSION_DROPPED: IntCounterVec = register_int_counter_vec!(
        "loopcast_session_dropped_packets_total",
        "Packets a session read but did not emit",
        &["channel", "reason"]
    )
    .unwrap();
    pub static ref SESSION_OVERTAKEN: IntCounterVec = register_int_counter_vec!(
        "loopcast_session_overtaken_total",
        "Times a session fell a full ring behind and re-joined",
        &["channel"]
    )
    .unwrap();
    pub static ref CLIENT_BANDWIDTH: GaugeVec = register_gauge_vec!(
        "loopcast_client_bandwidth_bytes",
        "Current bandwidth usage per client in bytes/sec",
        &["channel"]
    )
    .unwrap();
    pub static ref FFMPEG_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "loopcast_ffmpeg_cpu_usage_percent",
        "Current CPU usage of the ffmpeg process per channel (0-100+)",
        &["channel"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
    #[serde(default = "default_console_log_bandwidth")]
    pub console_log_bandwidth: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
            console_log_bandwidth: default_console_log_bandwidth(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_console_log_bandwidth() -> bool {
    false
}

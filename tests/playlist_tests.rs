use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use loopcast::channels::{ChannelSettings, SortOrder, StreamingConfig};
use loopcast::codec::synthetic::{SyntheticEngine, SyntheticSource};
use loopcast::supervisor::ChannelRegistry;

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn engine() -> Arc<SyntheticEngine> {
    Arc::new(SyntheticEngine::new().with_default_source(SyntheticSource::default().with_duration(Duration::from_millis(300))))
}

fn streaming() -> StreamingConfig {
    StreamingConfig {
        shutdown_grace_secs: 2,
        ..StreamingConfig::default()
    }
}

#[test]
fn m3u_channel_plays_in_alpha_order_and_loops() {
    let dir = tempfile::tempdir().unwrap();
    let m3u = dir.path().join("channel.m3u");
    std::fs::write(&m3u, "#EXTM3U\n#EXTINF:60,Second Feature\nzeta.mkv\n#EXTINF:60,Opening Short\nalpha.mkv\n").unwrap();

    let engine = engine();
    let registry = ChannelRegistry::new(engine.clone(), streaming());
    let mut settings = ChannelSettings::new("Matinee");
    settings.playlist = Some(m3u);
    let channel = registry.start(settings).unwrap();

    wait_for("a full lap", || engine.opened().len() >= 3);
    let opened = engine.opened();
    assert_eq!(opened[0], dir.path().join("alpha.mkv"));
    assert_eq!(opened[1], dir.path().join("zeta.mkv"));
    assert_eq!(opened[2], dir.path().join("alpha.mkv"));

    let status = channel.status();
    assert_eq!(status.playlist_len, 2);
    assert!(matches!(
        status.current_file.as_deref(),
        Some("Opening Short") | Some("Second Feature")
    ));

    registry.shutdown();
}

#[test]
fn directory_channel_ignores_non_media() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["episode_02.mkv", "episode_01.mp4", "cover.jpg", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let engine = engine();
    let registry = ChannelRegistry::new(engine.clone(), streaming());
    let mut settings = ChannelSettings::new("Series");
    settings.dir = Some(dir.path().to_path_buf());
    settings.sort = SortOrder::Alpha;
    let channel = registry.start(settings).unwrap();

    wait_for("both episodes", || engine.opened().len() >= 2);
    let opened = engine.opened();
    assert_eq!(opened[0], dir.path().join("episode_01.mp4"));
    assert_eq!(opened[1], dir.path().join("episode_02.mkv"));
    assert_eq!(channel.status().playlist_len, 2);

    registry.shutdown();
}

#[test]
fn missing_directory_keeps_the_channel_alive() {
    let engine = engine();
    let registry = ChannelRegistry::new(engine.clone(), streaming());
    let mut settings = ChannelSettings::new("Nowhere");
    settings.dir = Some("/definitely/not/here".into());
    let channel = registry.start(settings).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(channel.is_running());
    assert!(engine.opened().is_empty());
    assert!(channel.snapshot_encoder_params().is_none());

    // The producer is parked in a cancellable backoff.
    let started = Instant::now();
    registry.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!channel.is_running());
}

#[test]
fn zero_capacity_ring_is_rejected() {
    let registry = ChannelRegistry::new(engine(), streaming());
    let settings = ChannelSettings::new("Tiny").with_files(["/m/a.mkv"]).with_ring_capacity(0);
    assert!(registry.start(settings).is_err());
    assert!(registry.channels().is_empty());
}

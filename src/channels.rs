use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::codec::{EngineKind, VideoCodec};
use crate::ring::{AUDIO_ONLY_CAPACITY, DEFAULT_CAPACITY};

pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "ts", "m2ts", "mpg", "mpeg", "webm", "flv", "wmv",
];

lazy_static! {
    static ref RE_EXTINF: Regex = Regex::new(r"^#EXTINF:\s*-?\d+(?:\.\d+)?[^,]*,(.*)$").unwrap();
    static ref RE_SLUG: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Alpha,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    pub name: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub playlist: Option<PathBuf>,
    /// Explicit file list; takes precedence over `dir` and `playlist`.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub encode: VideoCodec,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default)]
    pub ring_capacity: Option<usize>,
}

impl ChannelSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            playlist: None,
            files: Vec::new(),
            sort: SortOrder::Alpha,
            encode: VideoCodec::H264,
            audio_only: false,
            ring_capacity: None,
        }
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = Some(capacity);
        self
    }

    /// URL-safe identifier derived from the name.
    pub fn id(&self) -> String {
        let lower = self.name.to_lowercase();
        RE_SLUG.replace_all(&lower, "-").trim_matches('-').to_string()
    }

    pub fn ring_capacity(&self, streaming: &StreamingConfig) -> usize {
        self.ring_capacity.unwrap_or(if self.audio_only {
            streaming.audio_only_ring_capacity
        } else {
            streaming.ring_capacity
        })
    }
}

/// Tunables shared by every channel's producer and sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_audio_only_ring_capacity")]
    pub audio_only_ring_capacity: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_ceiling")]
    pub poll_ceiling: u32,
    #[serde(default = "default_join_wait_ms")]
    pub join_wait_ms: u64,
    #[serde(default = "default_producer_pacing_ceiling_secs")]
    pub producer_pacing_ceiling_secs: u64,
    #[serde(default = "default_session_pacing_ceiling_secs")]
    pub session_pacing_ceiling_secs: u64,
    #[serde(default = "default_probe_packet_limit")]
    pub probe_packet_limit: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            language: None,
            ring_capacity: default_ring_capacity(),
            audio_only_ring_capacity: default_audio_only_ring_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_ceiling: default_poll_ceiling(),
            join_wait_ms: default_join_wait_ms(),
            producer_pacing_ceiling_secs: default_producer_pacing_ceiling_secs(),
            session_pacing_ceiling_secs: default_session_pacing_ceiling_secs(),
            probe_packet_limit: default_probe_packet_limit(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl StreamingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_wait(&self) -> Duration {
        Duration::from_millis(self.join_wait_ms)
    }

    pub fn producer_pacing_ceiling(&self) -> Duration {
        Duration::from_secs(self.producer_pacing_ceiling_secs)
    }

    pub fn session_pacing_ceiling(&self) -> Duration {
        Duration::from_secs(self.session_pacing_ceiling_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_ring_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_audio_only_ring_capacity() -> usize {
    AUDIO_ONLY_CAPACITY
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_poll_ceiling() -> u32 {
    1000
}

fn default_join_wait_ms() -> u64 {
    15_000
}

fn default_producer_pacing_ceiling_secs() -> u64 {
    100
}

fn default_session_pacing_ceiling_secs() -> u64 {
    1
}

fn default_probe_packet_limit() -> usize {
    100
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistItem {
    pub full_path: PathBuf,
    pub file_name: String,
    pub display_name: String,
}

impl PlaylistItem {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let full_path = path.into();
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = full_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let display_name = stem.replace(['_', '.'], " ").trim().to_string();
        Self {
            full_path,
            file_name,
            display_name,
        }
    }

    fn with_title(mut self, title: Option<String>) -> Self {
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            self.display_name = title;
        }
        self
    }
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.iter().any(|m| m.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

pub fn scan_dir(dir: &Path) -> Result<Vec<PlaylistItem>> {
    if !dir.is_dir() {
        bail!("playlist directory {} does not exist", dir.display());
    }
    let mut items = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
        let entry = entry.with_context(|| format!("scanning {}", dir.display()))?;
        if entry.file_type().is_file() && is_media_file(entry.path()) {
            items.push(PlaylistItem::from_path(entry.path()));
        }
    }
    Ok(items)
}

/// Parses an extended m3u. Relative entries resolve against `base`.
pub fn parse_m3u(content: &str, base: &Path) -> Vec<PlaylistItem> {
    let mut items = Vec::new();
    let mut title = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = RE_EXTINF.captures(line) {
            title = Some(caps[1].trim().to_string());
        } else if line.starts_with('#') {
            continue;
        } else {
            let path = Path::new(line);
            let full = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
            items.push(PlaylistItem::from_path(full).with_title(title.take()));
        }
    }

    items
}

pub fn sort_playlist(items: &mut [PlaylistItem], order: SortOrder) {
    match order {
        SortOrder::Alpha => items.sort_by_cached_key(|i| i.file_name.to_lowercase()),
        SortOrder::Random => items.shuffle(&mut rand::thread_rng()),
    }
}

/// Loads and sorts a channel's playlist.
pub fn load_playlist(settings: &ChannelSettings) -> Result<Vec<PlaylistItem>> {
    let mut items = if !settings.files.is_empty() {
        settings.files.iter().map(PlaylistItem::from_path).collect()
    } else if let Some(dir) = &settings.dir {
        scan_dir(dir)?
    } else if let Some(m3u) = &settings.playlist {
        let content = std::fs::read_to_string(m3u).with_context(|| format!("reading {}", m3u.display()))?;
        let base = m3u.parent().unwrap_or_else(|| Path::new("."));
        parse_m3u(&content, base)
    } else {
        bail!("channel '{}' has no dir, playlist or files", settings.name);
    };
    sort_playlist(&mut items, settings.sort);
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_m3u() {
        let data = r#"#EXTM3U
#EXTINF:5400,The Big Movie
movies/big_movie.mkv
#EXTVLCOPT:network-caching=1000
/abs/other.mp4
#EXTINF:-1 tvg-id="x",  Spaced Title
clip.ts"#;

        let items = parse_m3u(data, Path::new("/srv/media"));
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].display_name, "The Big Movie");
        assert_eq!(items[0].full_path, PathBuf::from("/srv/media/movies/big_movie.mkv"));
        assert_eq!(items[1].display_name, "other");
        assert_eq!(items[1].full_path, PathBuf::from("/abs/other.mp4"));
        assert_eq!(items[2].display_name, "Spaced Title");
    }

    #[test]
    fn display_name_from_file_stem() {
        let item = PlaylistItem::from_path("/x/night_of.the_living.mkv");
        assert_eq!(item.file_name, "night_of.the_living.mkv");
        assert_eq!(item.display_name, "night of the living");
    }

    #[test]
    fn scans_media_files_sorted_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mkv", "A.mp4", "notes.txt", "c.TS"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("d.mkv"), b"").unwrap();

        let mut settings = ChannelSettings::new("Movies");
        settings.dir = Some(dir.path().to_path_buf());
        let names: Vec<String> = load_playlist(&settings).unwrap().into_iter().map(|i| i.file_name).collect();
        assert_eq!(names, vec!["A.mp4", "b.mkv", "c.TS"]);
    }

    #[test]
    fn random_order_keeps_every_item() {
        let mut items: Vec<PlaylistItem> = (0..20).map(|i| PlaylistItem::from_path(format!("{i:02}.mkv"))).collect();
        sort_playlist(&mut items, SortOrder::Random);
        sort_playlist(&mut items, SortOrder::Alpha);
        assert_eq!(items[0].file_name, "00.mkv");
        assert_eq!(items.len(), 20);
    }

    #[test]
    fn missing_source_is_an_error() {
        assert!(load_playlist(&ChannelSettings::new("empty")).is_err());
        let mut settings = ChannelSettings::new("gone");
        settings.dir = Some(PathBuf::from("/no/such/dir"));
        assert!(load_playlist(&settings).is_err());
    }

    #[test]
    fn ids_are_url_safe() {
        assert_eq!(ChannelSettings::new("Sci-Fi  Classics!").id(), "sci-fi-classics");
        assert_eq!(ChannelSettings::new("News 24").id(), "news-24");
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: ChannelSettings = serde_json::from_str(r#"{"name":"One","dir":"/m","encode":"mpeg2","sort":"random"}"#).unwrap();
        assert_eq!(settings.encode, VideoCodec::Mpeg2);
        assert_eq!(settings.sort, SortOrder::Random);
        assert_eq!(settings.ring_capacity(&StreamingConfig::default()), 600);

        let streaming: StreamingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(streaming.poll_ceiling, 1000);
        assert_eq!(streaming.probe_packet_limit, 100);
    }
}

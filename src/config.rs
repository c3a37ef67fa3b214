use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `VDRWEB_`.  Defaults are suitable for a stock VDR install on the same
/// host; deployments MUST override at least the SVDRP address and the
/// video root.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP listener to.
    pub bind_addr: String,

    // ── SVDRP backend ───────────────────────────────────────────────────
    /// Hostname of the VDR daemon.
    pub svdrp_host: String,
    /// SVDRP port (VDR ≥ 1.7.15 defaults to 6419).
    pub svdrp_port: u16,
    /// Per-command deadline for SVDRP exchanges.
    pub svdrp_timeout: Duration,

    // ── Channels ────────────────────────────────────────────────────────
    /// Channel ids the UI cares about.  Empty list = every channel.
    pub wanted_channels: Vec<String>,
    /// Number of tuners available for overlap classification.
    pub tuners: u32,

    // ── Paths ───────────────────────────────────────────────────────────
    /// VDR's video directory; recording paths must resolve inside it.
    pub video_root: PathBuf,
    /// Target root for archive jobs; archive previews must resolve inside it.
    pub archive_root: PathBuf,
    /// Scratch root for live HLS streams (one subdirectory per channel).
    pub stream_work_dir: PathBuf,

    // ── Timer defaults ──────────────────────────────────────────────────
    /// Default priority for new timers (0..=99).
    pub timer_priority: u8,
    /// Default lifetime for new timers (0..=99).
    pub timer_lifetime: u8,
    /// Minutes to start recording before an event begins.
    pub margin_start_min: i64,
    /// Minutes to keep recording after an event ends.
    pub margin_stop_min: i64,

    // ── Cache expiries ──────────────────────────────────────────────────
    pub epg_cache: Duration,
    pub channel_cache: Duration,
    pub recording_cache: Duration,

    // ── Transcoding ─────────────────────────────────────────────────────
    /// URL template for the live TS source; `{channel}` is substituted.
    pub stream_url_template: String,
    /// Argument string appended to the live transcoder command line.
    pub stream_transcode_args: String,
    /// Default codec/muxer argument string for archive jobs.
    pub archive_args: String,
    /// Transcoder binary.
    pub ffmpeg_bin: String,
    /// Prober binary used for duration detection.
    pub ffprobe_bin: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let bind_addr = env_or("VDRWEB_BIND_ADDR", "0.0.0.0:8099");

        let svdrp_host = env_or("VDRWEB_SVDRP_HOST", "127.0.0.1");
        let svdrp_port = env_u64("VDRWEB_SVDRP_PORT", 6419) as u16;
        let svdrp_timeout = Duration::from_secs(env_u64("VDRWEB_SVDRP_TIMEOUT_SECS", 10));

        let wanted_channels = env_csv("VDRWEB_WANTED_CHANNELS", &[]);
        let tuners = env_u64("VDRWEB_TUNERS", 1).max(1) as u32;

        let video_root = PathBuf::from(env_or("VDRWEB_VIDEO_ROOT", "/var/lib/video"));
        let archive_root = PathBuf::from(env_or("VDRWEB_ARCHIVE_ROOT", "/var/lib/video/archive"));
        let stream_work_dir = PathBuf::from(env_or("VDRWEB_STREAM_WORK_DIR", "/tmp/vdrweb-streams"));

        let timer_priority = env_u64("VDRWEB_TIMER_PRIORITY", 50).min(99) as u8;
        let timer_lifetime = env_u64("VDRWEB_TIMER_LIFETIME", 99).min(99) as u8;
        let margin_start_min = env_u64("VDRWEB_MARGIN_START_MIN", 2) as i64;
        let margin_stop_min = env_u64("VDRWEB_MARGIN_STOP_MIN", 10) as i64;

        let epg_cache = Duration::from_secs(env_u64("VDRWEB_EPG_CACHE_SECS", 300));
        let channel_cache = Duration::from_secs(env_u64("VDRWEB_CHANNEL_CACHE_SECS", 3600));
        let recording_cache = Duration::from_secs(env_u64("VDRWEB_RECORDING_CACHE_SECS", 60));

        let stream_url_template = env_or(
            "VDRWEB_STREAM_URL_TEMPLATE",
            "http://127.0.0.1:3000/TS/{channel}",
        );
        let stream_transcode_args = env_or(
            "VDRWEB_STREAM_TRANSCODE_ARGS",
            "-c:v libx264 -preset veryfast -tune zerolatency -g 50 -c:a aac -b:a 128k \
             -f hls -hls_time 2 -hls_list_size 8 -hls_flags delete_segments",
        );
        let archive_args = env_or("VDRWEB_ARCHIVE_ARGS", "-c:v copy -c:a copy");
        let ffmpeg_bin = env_or("VDRWEB_FFMPEG_BIN", "ffmpeg");
        let ffprobe_bin = env_or("VDRWEB_FFPROBE_BIN", "ffprobe");

        let log_level = env_or("VDRWEB_LOG_LEVEL", "info");

        let config = Config {
            bind_addr,
            svdrp_host,
            svdrp_port,
            svdrp_timeout,
            wanted_channels,
            tuners,
            video_root,
            archive_root,
            stream_work_dir,
            timer_priority,
            timer_lifetime,
            margin_start_min,
            margin_stop_min,
            epg_cache,
            channel_cache,
            recording_cache,
            stream_url_template,
            stream_transcode_args,
            archive_args,
            ffmpeg_bin,
            ffprobe_bin,
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── vdrweb configuration ────");
        info!("  bind_addr        : {}", self.bind_addr);
        info!(
            "  svdrp            : {}:{} (timeout {:?})",
            self.svdrp_host, self.svdrp_port, self.svdrp_timeout
        );
        info!(
            "  wanted_channels  : {}",
            if self.wanted_channels.is_empty() {
                "(all)".to_string()
            } else {
                format!("{} channel(s)", self.wanted_channels.len())
            }
        );
        info!("  tuners           : {}", self.tuners);
        info!("  video_root       : {}", self.video_root.display());
        info!("  archive_root     : {}", self.archive_root.display());
        info!("  stream_work_dir  : {}", self.stream_work_dir.display());
        info!(
            "  timer defaults   : priority {}, lifetime {}, margins -{}/+{} min",
            self.timer_priority, self.timer_lifetime, self.margin_start_min, self.margin_stop_min
        );
        info!(
            "  cache expiries   : epg {:?}, channels {:?}, recordings {:?}",
            self.epg_cache, self.channel_cache, self.recording_cache
        );
        info!("  stream_url       : {}", self.stream_url_template);
        info!("  ffmpeg           : {} / {}", self.ffmpeg_bin, self.ffprobe_bin);
        info!("  log_level        : {}", self.log_level);
        info!("──────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("VDRWEB_TEST_U64", "not-a-number");
        assert_eq!(env_u64("VDRWEB_TEST_U64", 7), 7);
        std::env::set_var("VDRWEB_TEST_U64", "42");
        assert_eq!(env_u64("VDRWEB_TEST_U64", 7), 42);
        std::env::remove_var("VDRWEB_TEST_U64");
    }

    #[test]
    fn env_csv_trims_and_drops_empties() {
        std::env::set_var("VDRWEB_TEST_CSV", " a , ,b,");
        assert_eq!(env_csv("VDRWEB_TEST_CSV", &[]), vec!["a", "b"]);
        std::env::remove_var("VDRWEB_TEST_CSV");
    }

    #[test]
    fn env_csv_unset_uses_defaults() {
        std::env::remove_var("VDRWEB_TEST_CSV2");
        assert_eq!(env_csv("VDRWEB_TEST_CSV2", &["x"]), vec!["x"]);
    }
}

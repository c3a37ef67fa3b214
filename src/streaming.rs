use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, VdrError, VdrResult};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// How long a playlist request waits for the stream to become ready.
const PLAYLIST_WAIT: Duration = Duration::from_secs(12);
/// Filesystem poll interval while waiting for the playlist.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// A first segment at least this large counts as playable.
const READY_SEGMENT_BYTES: u64 = 100_000;
/// Settle time after the first segment appears.
const READY_SETTLE: Duration = Duration::from_millis(500);
/// Sweeper wake-up interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Streams idle longer than this are reaped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Stderr lines kept for the post-mortem log.
const STDERR_TAIL: usize = 20;

const PLAYLIST_FILE: &str = "index.m3u8";
const FIRST_SEGMENT: &str = "segment-0.ts";

/// Only characters safe inside a scratch-directory path. Channel ids and
/// segment names both pass through here.
pub fn safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// StreamHandle — one live transcoding stream
// ---------------------------------------------------------------------------

/// The live state of one per-channel stream.
///
/// Owns the child transcoder (through the supervising tasks), its scratch
/// directory, and the readiness latch.
pub struct StreamHandle {
    pub channel: String,
    scratch_dir: PathBuf,
    /// Cancelling kills the child and tears the stream down.
    cancel: CancellationToken,
    /// Latched once the first segment looks playable — or when the child
    /// exits, so waiters never hang on a dead stream.
    ready: CancellationToken,
    last_access: Mutex<Instant>,
    pid: Option<u32>,
    stderr_tail: Mutex<VecDeque<String>>,
}

impl StreamHandle {
    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// StreamManager — owns all active streams
// ---------------------------------------------------------------------------

/// Map from channel key to live stream, plus the knobs to start new ones.
pub struct StreamManager {
    work_root: PathBuf,
    url_template: String,
    transcode_args: String,
    ffmpeg_bin: String,
    playlist_wait: Duration,
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamManager {
    pub fn new(config: &Config) -> Self {
        Self {
            work_root: config.stream_work_dir.clone(),
            url_template: config.stream_url_template.clone(),
            transcode_args: config.stream_transcode_args.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            playlist_wait: PLAYLIST_WAIT,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    /// Get the stream for `channel`, starting it on first request.
    /// Double-checked locking keeps racing starts from spawning twice.
    fn ensure(self: &Arc<Self>, channel: &str) -> VdrResult<Arc<StreamHandle>> {
        if !safe_name(channel) {
            return Err(VdrError::invalid(format!("invalid channel key '{channel}'")));
        }

        if let Some(handle) = self.streams.read().unwrap().get(channel) {
            return Ok(handle.clone());
        }

        let mut streams = self.streams.write().unwrap();
        if let Some(handle) = streams.get(channel) {
            return Ok(handle.clone());
        }

        let handle = self.start_stream(channel)?;
        streams.insert(channel.to_string(), handle.clone());
        Ok(handle)
    }

    /// Spawn the transcoder and its two supervising workers.
    fn start_stream(self: &Arc<Self>, channel: &str) -> VdrResult<Arc<StreamHandle>> {
        let scratch_dir = self.work_root.join(channel);
        std::fs::create_dir_all(&scratch_dir).map_err(VdrError::internal)?;

        let url = self.url_template.replace("{channel}", channel);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-i")
            .arg(&url)
            .args(self.transcode_args.split_whitespace())
            .arg("-hls_segment_filename")
            .arg("segment-%d.ts")
            .arg(PLAYLIST_FILE)
            .current_dir(&scratch_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            let _ = std::fs::remove_dir_all(&scratch_dir);
            VdrError::internal(format!("failed to spawn transcoder: {e}"))
        })?;
        let pid = child.id();
        let stderr = child.stderr.take();

        let handle = Arc::new(StreamHandle {
            channel: channel.to_string(),
            scratch_dir: scratch_dir.clone(),
            cancel: CancellationToken::new(),
            ready: CancellationToken::new(),
            last_access: Mutex::new(Instant::now()),
            pid,
            stderr_tail: Mutex::new(VecDeque::new()),
        });
        info!(channel, pid, url = %url, "stream started");

        // Worker 1: keep the stderr tail for post-mortem logging.
        if let Some(stderr) = stderr {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = handle.stderr_tail.lock().unwrap();
                    if tail.len() >= STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // Worker 2: poll for readiness until latched or cancelled.
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                let segment = handle.scratch_dir.join(FIRST_SEGMENT);
                loop {
                    tokio::select! {
                        _ = handle.cancel.cancelled() => return,
                        _ = handle.ready.cancelled() => return,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                    if let Ok(meta) = tokio::fs::metadata(&segment).await {
                        if meta.len() >= READY_SEGMENT_BYTES {
                            tokio::time::sleep(READY_SETTLE).await;
                            handle.ready.cancel();
                            debug!(channel = %handle.channel, "stream ready");
                            return;
                        }
                    }
                }
            });
        }

        // Worker 3: wait for exit (or cancellation), then clean up.
        {
            let manager = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status.ok(),
                    _ = handle.cancel.cancelled() => {
                        kill_process_group(handle.pid);
                        let _ = child.start_kill();
                        child.wait().await.ok()
                    }
                };

                // A stream that dies before its first segment must not
                // leave waiters hanging.
                if !handle.ready.is_cancelled() {
                    let tail: Vec<String> =
                        handle.stderr_tail.lock().unwrap().iter().cloned().collect();
                    warn!(
                        channel = %handle.channel,
                        status = ?status,
                        stderr = ?tail,
                        "transcoder exited before the stream became ready"
                    );
                    handle.ready.cancel();
                } else if !handle.cancel.is_cancelled() {
                    info!(channel = %handle.channel, status = ?status, "transcoder exited");
                }

                let _ = tokio::fs::remove_dir_all(&handle.scratch_dir).await;
                manager.remove_entry(&handle);
            });
        }

        Ok(handle)
    }

    /// Drop the map entry, but only if it still points at this stream —
    /// a replacement stream for the same channel must survive.
    fn remove_entry(&self, handle: &Arc<StreamHandle>) {
        let mut streams = self.streams.write().unwrap();
        if let Some(current) = streams.get(&handle.channel) {
            if Arc::ptr_eq(current, handle) {
                streams.remove(&handle.channel);
            }
        }
    }

    /// Ensure the stream and wait (bounded) for a non-empty playlist.
    /// Returns the playlist path, or a Timeout error after the deadline —
    /// the stream record is retained for subsequent attempts.
    pub async fn playlist(self: &Arc<Self>, channel: &str) -> VdrResult<PathBuf> {
        let handle = self.ensure(channel)?;
        handle.touch();

        let playlist = handle.scratch_dir.join(PLAYLIST_FILE);
        let deadline = tokio::time::Instant::now() + self.playlist_wait;

        loop {
            if let Ok(meta) = tokio::fs::metadata(&playlist).await {
                if meta.len() > 0 {
                    handle.touch();
                    return Ok(playlist);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VdrError::Timeout(format!(
                    "stream for channel '{channel}' did not become ready"
                )));
            }
            tokio::select! {
                _ = handle.ready.cancelled(), if !handle.is_ready() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Resolve a segment path for an already-running stream.
    pub fn segment_path(&self, channel: &str, segment: &str) -> VdrResult<PathBuf> {
        if !safe_name(channel) || !safe_name(segment) {
            return Err(VdrError::invalid("invalid stream path"));
        }
        let handle = self
            .streams
            .read()
            .unwrap()
            .get(channel)
            .cloned()
            .ok_or_else(|| VdrError::not_found(format!("no stream for channel '{channel}'")))?;
        handle.touch();
        Ok(handle.scratch_dir.join(segment))
    }

    /// Stop one stream: cancel its context (which kills the process
    /// group) and drop the map entry. The waiter task removes the
    /// scratch directory.
    fn stop(&self, handle: &Arc<StreamHandle>) {
        info!(channel = %handle.channel, "stopping stream");
        self.remove_entry(handle);
        handle.cancel.cancel();
    }

    /// Stop every stream. Idempotent — a second call sees an empty map.
    pub fn stop_all(&self) {
        let handles: Vec<Arc<StreamHandle>> = {
            let streams = self.streams.read().unwrap();
            streams.values().cloned().collect()
        };
        for handle in handles {
            self.stop(&handle);
        }
    }

    /// One sweep: reap streams idle longer than `idle_timeout`.
    pub fn sweep_once(&self, idle_timeout: Duration) {
        let idle: Vec<Arc<StreamHandle>> = {
            let streams = self.streams.read().unwrap();
            streams
                .values()
                .filter(|h| h.idle_for() > idle_timeout)
                .cloned()
                .collect()
        };
        for handle in idle {
            info!(channel = %handle.channel, "reaping idle stream");
            self.stop(&handle);
        }
    }

    /// Background sweeper; runs until the token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                manager.sweep_once(IDLE_TIMEOUT);
            }
        });
    }
}

/// SIGKILL the whole process group so orphaned grandchildren die too.
pub(crate) fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

/// GET /watch/stream/:channel/index.m3u8
pub async fn playlist_handler(
    State(state): State<Arc<crate::AppState>>,
    UrlPath(channel): UrlPath<String>,
) -> Result<Response, ApiError> {
    match state.streams.playlist(&channel).await {
        Ok(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| ApiError::internal(format!("playlist vanished: {e}")))?;
            let mut response = Response::new(Body::from(bytes));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            );
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            );
            Ok(response)
        }
        Err(VdrError::Timeout(_)) => {
            let mut response = ApiError::stream_not_ready(&channel).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            Ok(response)
        }
        Err(err) => Err(err.into()),
    }
}

/// GET /watch/stream/:channel/:segment
pub async fn segment_handler(
    State(state): State<Arc<crate::AppState>>,
    UrlPath((channel, segment)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state
        .streams
        .segment_path(&channel, &segment)
        .map_err(|err| match err {
            VdrError::NotFound(_) => ApiError::stream_not_found(&channel),
            other => other.into(),
        })?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("segment '{segment}' does not exist")))?;

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/MP2T"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=10"),
    );
    Ok(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, VdrError, VdrResult};
use crate::models::Recording;
use crate::streaming::kill_process_group;
use crate::vdr::path_inside;

/// Lines of transcoder output kept per job.
const LOG_TAIL: usize = 120;
/// Name of the transient concat-demuxer list inside the target dir.
const CONCAT_LIST: &str = "concat.txt";
/// Metadata file copied next to the archived video.
const INFO_FILE: &str = "info";

// ---------------------------------------------------------------------------
// Preview — the resolved output layout of a job
// ---------------------------------------------------------------------------

/// Where an archive job writes: the target directory plus the two files
/// inside it. Computed before execution so the UI can show it up front.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub target_dir: PathBuf,
    pub video_path: PathBuf,
    pub info_path: PathBuf,
}

impl Preview {
    /// Both file paths must resolve directly inside the target dir after
    /// lexical path cleaning.
    pub fn validate(&self) -> VdrResult<()> {
        let target = clean_path(&self.target_dir);
        for (label, path) in [("video", &self.video_path), ("info", &self.info_path)] {
            let cleaned = clean_path(path);
            if cleaned.parent() != Some(target.as_path()) {
                return Err(VdrError::invalid(format!(
                    "{label} path {} is not directly inside the target directory",
                    path.display()
                )));
            }
            if cleaned.file_name().is_none() {
                return Err(VdrError::invalid(format!("{label} path has no file name")));
            }
        }
        Ok(())
    }
}

/// Lexical normalization: drop `.` components and resolve `..` upward.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Derive the temporary output for a final path by inserting `.tmp`
/// before the extension (`video.mkv` → `video.tmp.mkv`).
fn tmp_output_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.with_extension(format!("tmp.{ext}")),
        None => path.with_extension("tmp"),
    }
}

/// One concat-demuxer line. Single quotes inside the path are escaped as
/// `'\''` (close quote, literal quote, reopen quote).
fn concat_line(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{escaped}'\n")
}

/// Enumerate the MPEG-TS segments of a recording directory in
/// lexicographic file-name order.
fn list_segments(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("ts"))
                    .unwrap_or(false)
        })
        .collect();
    segments.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Transcoder progress, fed by the `key=value` progress pipe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub percent: f64,
    pub out_time_ms: i64,
    pub speed: String,
    pub duration_known: bool,
    pub raw: HashMap<String, String>,
}

impl Progress {
    fn apply(&mut self, key: &str, value: &str, duration_secs: Option<f64>) {
        self.raw.insert(key.to_string(), value.trim().to_string());
        match key {
            "out_time_ms" => {
                if let Ok(micros) = value.trim().parse::<i64>() {
                    self.out_time_ms = micros;
                    if let Some(duration) = duration_secs {
                        if duration > 0.0 {
                            let done = micros as f64 / 1_000_000.0;
                            self.percent = (done / duration * 100.0).clamp(0.0, 100.0);
                        }
                    }
                }
            }
            "speed" => self.speed = value.trim().to_string(),
            _ => {}
        }
    }
}

struct JobInner {
    status: JobStatus,
    started_at: Option<DateTime<Local>>,
    ended_at: Option<DateTime<Local>>,
    error: Option<String>,
    duration_secs: Option<f64>,
    progress: Progress,
    /// Last [`LOG_TAIL`] transcoder lines; `log_start` is the all-time
    /// index of `logs[0]`, `log_total` the all-time line count.
    logs: VecDeque<String>,
    log_start: u64,
    log_total: u64,
}

/// One archive job: a supervised probe → transcode → rename pipeline.
pub struct ArchiveJob {
    pub id: String,
    pub recording_id: u32,
    pub created_at: DateTime<Local>,
    pub preview: Preview,
    cancel: CancellationToken,
    inner: Mutex<JobInner>,
}

impl ArchiveJob {
    fn new(id: String, recording_id: u32, created_at: DateTime<Local>, preview: Preview) -> Self {
        Self {
            id,
            recording_id,
            created_at,
            preview,
            cancel: CancellationToken::new(),
            inner: Mutex::new(JobInner {
                status: JobStatus::Queued,
                started_at: None,
                ended_at: None,
                error: None,
                duration_secs: None,
                progress: Progress::default(),
                logs: VecDeque::new(),
                log_start: 0,
                log_total: 0,
            }),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().unwrap().status
    }

    fn mark_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == JobStatus::Queued {
            inner.status = JobStatus::Running;
            inner.started_at = Some(Local::now());
        }
    }

    /// Terminal transitions are one-way; repeated failures keep the
    /// first error.
    fn finish(&self, result: Result<(), String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() {
            return;
        }
        match result {
            Ok(()) => {
                inner.status = JobStatus::Success;
                if inner.duration_secs.is_some() {
                    inner.progress.percent = 100.0;
                }
            }
            Err(message) => {
                inner.status = JobStatus::Failed;
                inner.error = Some(message);
            }
        }
        inner.ended_at = Some(Local::now());
    }

    fn push_log(&self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.logs.push_back(line.to_string());
        inner.log_total += 1;
        if inner.logs.len() > LOG_TAIL {
            inner.logs.pop_front();
            inner.log_start += 1;
        }
    }

    /// A fully-owned snapshot; the caller never sees live state.
    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.lock().unwrap();
        self.snapshot_locked(&inner)
    }

    fn snapshot_locked(&self, inner: &JobInner) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            recording_id: self.recording_id,
            status: inner.status,
            created_at: self.created_at,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            error: inner.error.clone(),
            progress: inner.progress.clone(),
            log_tail: inner.logs.iter().cloned().collect::<Vec<_>>().join("\n"),
            preview: self.preview.clone(),
        }
    }

    /// Snapshot plus the log lines appended since `from` (an offset from
    /// a previous poll), and the offset to poll from next. Snapshot and
    /// delta are taken under one lock so they agree with each other.
    fn poll(&self, from: u64) -> (JobSnapshot, Vec<String>, u64) {
        let inner = self.inner.lock().unwrap();
        let snapshot = self.snapshot_locked(&inner);
        let start = from.max(inner.log_start).min(inner.log_total);
        let skip = (start - inner.log_start) as usize;
        let lines: Vec<String> = inner.logs.iter().skip(skip).cloned().collect();
        (snapshot, lines, inner.log_total)
    }
}

/// Serialisable snapshot for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub recording_id: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: Progress,
    /// Last lines joined by newlines, for at-a-glance display.
    pub log_tail: String,
    pub preview: Preview,
}

// ---------------------------------------------------------------------------
// ArchiveManager — owns all jobs
// ---------------------------------------------------------------------------

pub struct ArchiveManager {
    instance: String,
    archive_root: PathBuf,
    default_args: String,
    ffmpeg_bin: String,
    ffprobe_bin: String,
    jobs: RwLock<HashMap<String, Arc<ArchiveJob>>>,
    /// Last issued id timestamp; bumped to keep ids strictly increasing.
    last_nanos: Mutex<i64>,
}

impl ArchiveManager {
    pub fn new(config: &Config) -> Self {
        Self {
            instance: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            archive_root: config.archive_root.clone(),
            default_args: config.archive_args.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ffprobe_bin: config.ffprobe_bin.clone(),
            jobs: RwLock::new(HashMap::new()),
            last_nanos: Mutex::new(0),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Job ids sort by creation: instance prefix + zero-padded
    /// nanosecond timestamp, forced strictly monotone within the process.
    fn next_id(&self) -> String {
        let mut last = self.last_nanos.lock().unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        let nanos = now.max(*last + 1);
        *last = nanos;
        format!("{}-{:020}", self.instance, nanos)
    }

    /// The default output layout for a recording: one directory under
    /// the archive root named after the title.
    pub fn default_preview(&self, recording: &Recording) -> Preview {
        let stem = sanitize_name(&recording.title);
        let target_dir = self.archive_root.join(&stem);
        Preview {
            video_path: target_dir.join(format!("{stem}.mkv")),
            info_path: target_dir.join(INFO_FILE),
            target_dir,
        }
    }

    /// Start a job for `recording`. The job runs in its own supervising
    /// task; there is no queue. Returns the job record immediately.
    pub fn start(
        self: &Arc<Self>,
        recording: &Recording,
        preview: Option<Preview>,
        args: Option<String>,
    ) -> VdrResult<Arc<ArchiveJob>> {
        let source_dir = recording
            .path
            .clone()
            .ok_or_else(|| VdrError::invalid("recording has no on-disk directory"))?;

        let preview = preview.unwrap_or_else(|| self.default_preview(recording));
        preview.validate()?;
        if !path_inside(&self.archive_root, &preview.target_dir) {
            return Err(VdrError::invalid(format!(
                "target directory {} is outside the archive root",
                preview.target_dir.display()
            )));
        }

        let id = self.next_id();
        let job = Arc::new(ArchiveJob::new(
            id.clone(),
            recording.id,
            Local::now(),
            preview,
        ));
        self.jobs.write().unwrap().insert(id, job.clone());

        let ctx = RunContext {
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            ffprobe_bin: self.ffprobe_bin.clone(),
            args: args.unwrap_or_else(|| self.default_args.clone()),
        };
        info!(job = %job.id, recording = job.recording_id, "archive job started");
        tokio::spawn(run_job(ctx, job.clone(), source_dir));
        Ok(job)
    }

    pub fn job(&self, id: &str) -> Option<Arc<ArchiveJob>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    pub fn poll(&self, id: &str, from: u64) -> VdrResult<(JobSnapshot, Vec<String>, u64)> {
        let job = self
            .job(id)
            .ok_or_else(|| VdrError::not_found(format!("archive job {id}")))?;
        Ok(job.poll(from))
    }

    /// Best-effort cancel; returns false for unknown or terminal jobs.
    pub fn cancel(&self, id: &str) -> bool {
        match self.job(id) {
            Some(job) if !job.status().is_terminal() => {
                info!(job = %job.id, "canceling archive job");
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// The most recently created active job for one recording.
    /// Ties break on the id, which is strictly increasing.
    pub fn active_job_for(&self, recording_id: u32) -> Option<String> {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.recording_id == recording_id && j.status().is_active())
            .map(|j| j.id.clone())
            .max()
    }

    /// Active job id per recording, for listings.
    pub fn active_jobs(&self) -> HashMap<u32, String> {
        let mut active: HashMap<u32, String> = HashMap::new();
        for job in self.jobs.read().unwrap().values() {
            if !job.status().is_active() {
                continue;
            }
            match active.get(&job.recording_id) {
                Some(existing) if *existing >= job.id => {}
                _ => {
                    active.insert(job.recording_id, job.id.clone());
                }
            }
        }
        active
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status().is_active())
            .count()
    }
}

fn sanitize_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "recording".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

struct RunContext {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    args: String,
}

async fn run_job(ctx: RunContext, job: Arc<ArchiveJob>, source_dir: PathBuf) {
    // A job cancelled before it ran must not touch the filesystem.
    if job.cancel.is_cancelled() {
        job.finish(Err("canceled".into()));
        return;
    }

    if job.preview.video_path.exists() {
        job.finish(Err(format!(
            "target file {} already exists",
            job.preview.video_path.display()
        )));
        return;
    }

    // Plan: enumerate segments and write the concat list.
    let segments = match list_segments(&source_dir) {
        Ok(segments) if !segments.is_empty() => segments,
        Ok(_) => {
            job.finish(Err(format!(
                "no .ts segments in {}",
                source_dir.display()
            )));
            return;
        }
        Err(err) => {
            job.finish(Err(format!(
                "cannot read {}: {err}",
                source_dir.display()
            )));
            return;
        }
    };

    if let Err(err) = std::fs::create_dir_all(&job.preview.target_dir) {
        job.finish(Err(format!("cannot create target directory: {err}")));
        return;
    }
    let concat_path = job.preview.target_dir.join(CONCAT_LIST);
    let list: String = segments.iter().map(|p| concat_line(p)).collect();
    if let Err(err) = std::fs::write(&concat_path, list) {
        job.finish(Err(format!("cannot write concat list: {err}")));
        return;
    }

    job.mark_running();

    // Optional probe: total duration enables percent computation.
    if let Some(duration) = probe_duration(&ctx, &concat_path, &job.cancel).await {
        let mut inner = job.inner.lock().unwrap();
        inner.duration_secs = Some(duration);
        inner.progress.duration_known = true;
        inner
            .progress
            .raw
            .insert("duration".into(), format!("{duration:.3}"));
    } else {
        debug!(job = %job.id, "duration probe failed, percent stays unknown");
    }
    if job.cancel.is_cancelled() {
        let _ = std::fs::remove_file(&concat_path);
        job.finish(Err("canceled".into()));
        return;
    }

    // Transcode to a temporary path; the real name appears only after a
    // successful rename.
    let tmp_path = tmp_output_path(&job.preview.video_path);
    let mut cmd = Command::new(&ctx.ffmpeg_bin);
    cmd.arg("-hide_banner")
        .arg("-nostdin")
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(&concat_path)
        .args(ctx.args.split_whitespace())
        .arg("-progress")
        .arg("pipe:1")
        .arg(&tmp_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let _ = std::fs::remove_file(&concat_path);
            job.finish(Err(format!("failed to spawn transcoder: {err}")));
            return;
        }
    };
    let pid = child.id();

    // Reader 1: the progress pipe, `key=value` per line.
    let progress_reader = child.stdout.take().map(|stdout| {
        let job = job.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((key, value)) = line.split_once('=') {
                    let mut inner = job.inner.lock().unwrap();
                    let duration = inner.duration_secs;
                    inner.progress.apply(key, value, duration);
                }
            }
        })
    });

    // Reader 2: stderr into the bounded log ring.
    let log_reader = child.stderr.take().map(|stderr| {
        let job = job.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                job.push_log(&line);
            }
        })
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = job.cancel.cancelled() => {
            kill_process_group(pid);
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // Join both readers before declaring the job terminated.
    if let Some(reader) = progress_reader {
        let _ = reader.await;
    }
    if let Some(reader) = log_reader {
        let _ = reader.await;
    }

    let _ = std::fs::remove_file(&concat_path);

    let success = matches!(&status, Ok(s) if s.success()) && !job.cancel.is_cancelled();
    if !success {
        let _ = std::fs::remove_file(&tmp_path);
        if job.cancel.is_cancelled() {
            job.finish(Err("canceled".into()));
        } else {
            job.finish(Err(match status {
                Ok(s) => format!("transcoder exited with {s}"),
                Err(err) => format!("transcoder failed: {err}"),
            }));
        }
        return;
    }

    // Atomically move the finished file into place.
    if let Err(err) = std::fs::rename(&tmp_path, &job.preview.video_path) {
        let _ = std::fs::remove_file(&tmp_path);
        job.finish(Err(format!("cannot rename output into place: {err}")));
        return;
    }

    // Best-effort metadata copy; failure is logged, not fatal.
    let info_source = source_dir.join(INFO_FILE);
    if info_source.is_file() {
        if let Err(err) = std::fs::copy(&info_source, &job.preview.info_path) {
            warn!(job = %job.id, %err, "info file copy failed");
            job.push_log(&format!("info file copy failed: {err}"));
        }
    }

    info!(job = %job.id, video = %job.preview.video_path.display(), "archive job finished");
    job.finish(Ok(()));
}

async fn probe_duration(
    ctx: &RunContext,
    concat_path: &Path,
    cancel: &CancellationToken,
) -> Option<f64> {
    let mut cmd = Command::new(&ctx.ffprobe_bin);
    cmd.args([
        "-v",
        "error",
        "-f",
        "concat",
        "-safe",
        "0",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        "-i",
    ])
    .arg(concat_path)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .process_group(0)
    .kill_on_drop(true);

    let output = tokio::select! {
        _ = cancel.cancelled() => return None,
        output = cmd.output() => output.ok()?,
    };
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| *d > 0.0)
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub recording: u32,
    /// Directory under the archive root; defaults to one named after the
    /// recording title.
    #[serde(default)]
    pub target_dir: Option<String>,
    /// Codec/muxer argument string; defaults to the configured one.
    #[serde(default)]
    pub args: Option<String>,
}

#[derive(Serialize)]
pub struct StartResponse {
    pub id: String,
    pub preview: Preview,
}

/// POST /recordings/archive/start
pub async fn start_handler(
    State(state): State<Arc<crate::AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let recording = state.vdr.recording(request.recording).await?;

    let preview = match &request.target_dir {
        Some(dir) => {
            let dir = Path::new(dir);
            if dir.is_absolute() || dir.components().any(|c| c == Component::ParentDir) {
                return Err(ApiError::unsafe_path("target_dir"));
            }
            let target_dir = state.archive.archive_root().join(dir);
            let stem = sanitize_name(&recording.title);
            Some(Preview {
                video_path: target_dir.join(format!("{stem}.mkv")),
                info_path: target_dir.join(INFO_FILE),
                target_dir,
            })
        }
        None => None,
    };

    let job = state.archive.start(&recording, preview, request.args.clone())?;
    Ok(Json(StartResponse {
        id: job.id.clone(),
        preview: job.preview.clone(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub id: String,
    #[serde(default)]
    pub from: u64,
}

#[derive(Serialize)]
pub struct PollResponse {
    pub job: JobSnapshot,
    /// Log lines appended since the `from` offset.
    pub lines: Vec<String>,
    /// Offset to poll from next.
    pub next: u64,
}

/// GET /recordings/archive/job/poll?id=…&from=…
pub async fn poll_handler(
    State(state): State<Arc<crate::AppState>>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let (job, lines, next) = state
        .archive
        .poll(&query.id, query.from)
        .map_err(|_| ApiError::job_not_found(&query.id))?;
    Ok(Json(PollResponse { job, lines, next }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub id: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

/// POST /recordings/archive/job/cancel
pub async fn cancel_handler(
    State(state): State<Arc<crate::AppState>>,
    Json(request): Json<CancelRequest>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        canceled: state.archive.cancel(&request.id),
    })
}

/// GET /recordings/archive/jobs — active job id per recording.
pub async fn jobs_handler(State(state): State<Arc<crate::AppState>>) -> Json<HashMap<u32, String>> {
    Json(state.archive.active_jobs())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// A transcoder stand-in: reports progress, logs to stderr, writes
    /// its last argument (the temp output), then runs `tail_cmd`.
    fn fake_ffmpeg(dir: &Path, tail_cmd: &str) -> String {
        script(
            dir,
            "fake-ffmpeg",
            &format!(
                "for a in \"$@\"; do out=\"$a\"; done\n\
                 echo \"out_time_ms=5000000\"\n\
                 echo \"speed=1.01x\"\n\
                 echo \"frame 42\" >&2\n\
                 printf data > \"$out\"\n\
                 {tail_cmd}"
            ),
        )
    }

    fn fake_ffprobe(dir: &Path) -> String {
        script(dir, "fake-ffprobe", "echo 10.0")
    }

    fn source_recording(dir: &Path) -> (PathBuf, Recording) {
        let source = dir.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("00002.ts"), "b").unwrap();
        std::fs::write(source.join("00001.ts"), "a").unwrap();
        std::fs::write(source.join("00003.TS"), "c").unwrap();
        std::fs::write(source.join("index.vdr"), "x").unwrap();
        std::fs::write(source.join(INFO_FILE), "T Title").unwrap();

        let recording = Recording {
            id: 1,
            title: "Show".into(),
            subtitle: None,
            description: None,
            channel: "One".into(),
            recorded_at: Local::now(),
            length: "1:00".into(),
            new: false,
            path: Some(source.clone()),
        };
        (source, recording)
    }

    fn manager(dir: &Path, ffmpeg: String, ffprobe: String) -> Arc<ArchiveManager> {
        Arc::new(ArchiveManager {
            instance: "test0000".into(),
            archive_root: dir.join("archive"),
            default_args: "-c copy".into(),
            ffmpeg_bin: ffmpeg,
            ffprobe_bin: ffprobe,
            jobs: RwLock::new(HashMap::new()),
            last_nanos: Mutex::new(0),
        })
    }

    async fn wait_terminal(job: &Arc<ArchiveJob>) {
        for _ in 0..200 {
            if job.status().is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not terminate in time");
    }

    // ── plumbing ────────────────────────────────────────────────────────

    #[test]
    fn concat_escaping_round_trips() {
        // Property: `'` becomes `'\''` and nothing else changes; the
        // inverse substitution recovers the original path.
        let path = Path::new("/video/It's 'quoted'/001.ts");
        let line = concat_line(path);
        assert_eq!(line, "file '/video/It'\\''s '\\''quoted'\\''/001.ts'\n");

        let inner = line
            .strip_prefix("file '")
            .unwrap()
            .strip_suffix("'\n")
            .unwrap();
        assert_eq!(inner.replace("'\\''", "'"), path.to_string_lossy());
    }

    #[test]
    fn tmp_path_keeps_extension() {
        assert_eq!(
            tmp_output_path(Path::new("/a/video.mkv")),
            Path::new("/a/video.tmp.mkv")
        );
        assert_eq!(
            tmp_output_path(Path::new("/a/video")),
            Path::new("/a/video.tmp")
        );
    }

    #[test]
    fn preview_validation_requires_direct_children() {
        let good = Preview {
            target_dir: PathBuf::from("/archive/show"),
            video_path: PathBuf::from("/archive/show/show.mkv"),
            info_path: PathBuf::from("/archive/show/info"),
        };
        assert!(good.validate().is_ok());

        let nested = Preview {
            video_path: PathBuf::from("/archive/show/sub/show.mkv"),
            ..good.clone()
        };
        assert!(nested.validate().is_err());

        let escaping = Preview {
            video_path: PathBuf::from("/archive/show/../other/show.mkv"),
            ..good.clone()
        };
        assert!(escaping.validate().is_err());

        // Cleaning makes dotted-but-contained paths acceptable.
        let dotted = Preview {
            video_path: PathBuf::from("/archive/show/./show.mkv"),
            ..good
        };
        assert!(dotted.validate().is_ok());
    }

    #[test]
    fn progress_apply_computes_clamped_percent() {
        let mut progress = Progress::default();
        progress.duration_known = true;

        progress.apply("out_time_ms", "5000000", Some(10.0));
        assert_eq!(progress.out_time_ms, 5_000_000);
        assert!((progress.percent - 50.0).abs() < 1e-9);

        progress.apply("out_time_ms", "99000000", Some(10.0));
        assert!((progress.percent - 100.0).abs() < 1e-9);

        progress.apply("speed", " 1.5x", None);
        assert_eq!(progress.speed, "1.5x");
        assert_eq!(progress.raw.get("speed").unwrap(), "1.5x");
    }

    #[test]
    fn segments_sort_lexicographically_and_ignore_other_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (source, _) = source_recording(tmp.path());

        let segments = list_segments(&source).unwrap();
        let names: Vec<_> = segments
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["00001.ts", "00002.ts", "00003.TS"]);
    }

    #[test]
    fn job_ids_are_strictly_increasing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), "true".into(), "true".into());

        let mut previous = String::new();
        for _ in 0..1000 {
            let id = mgr.next_id();
            assert!(id > previous, "{id} not greater than {previous}");
            previous = id;
        }
    }

    #[test]
    fn log_ring_is_bounded_and_offsets_clip() {
        let job = Arc::new(ArchiveJob::new(
            "test0000-1".into(),
            1,
            Local::now(),
            Preview {
                target_dir: PathBuf::from("/a"),
                video_path: PathBuf::from("/a/v.mkv"),
                info_path: PathBuf::from("/a/info"),
            },
        ));

        for i in 0..300 {
            job.push_log(&format!("line {i}"));
        }
        job.push_log("   ");
        job.push_log("");

        let (snapshot, lines, next) = job.poll(0);
        assert_eq!(next, 300);
        assert_eq!(lines.len(), LOG_TAIL);
        assert_eq!(lines.first().unwrap(), "line 180");
        assert_eq!(lines.last().unwrap(), "line 299");
        assert_eq!(snapshot.log_tail.lines().count(), LOG_TAIL);

        // Incremental polling: nothing new after the end.
        let (_, lines, next) = job.poll(next);
        assert!(lines.is_empty());
        assert_eq!(next, 300);

        // A fresh delta arrives from its offset only.
        job.push_log("tail");
        let (_, lines, next) = job.poll(300);
        assert_eq!(lines, vec!["tail"]);
        assert_eq!(next, 301);
    }

    // ── job execution ───────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_job_renames_and_copies_info() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(
            tmp.path(),
            fake_ffmpeg(tmp.path(), ":"),
            fake_ffprobe(tmp.path()),
        );

        let job = mgr.start(&recording, None, None).unwrap();
        wait_terminal(&job).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Success, "{:?}", snapshot.error);
        assert!(job.preview.video_path.is_file());
        assert!(!tmp_output_path(&job.preview.video_path).exists());
        assert!(job.preview.info_path.is_file());
        assert!(!job.preview.target_dir.join(CONCAT_LIST).exists());

        // Progress observed the probe (10 s) and the pipe (5 s → 50%,
        // then forced to 100 on success).
        assert!(snapshot.progress.duration_known);
        assert_eq!(snapshot.progress.out_time_ms, 5_000_000);
        assert!((snapshot.progress.percent - 100.0).abs() < 1e-9);
        assert_eq!(snapshot.progress.speed, "1.01x");
        assert!(snapshot.log_tail.contains("frame 42"));
    }

    #[tokio::test]
    async fn empty_segment_list_fails_before_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty-source");
        std::fs::create_dir_all(&source).unwrap();
        let recording = Recording {
            path: Some(source),
            ..source_recording(tmp.path()).1
        };

        let mgr = manager(tmp.path(), "/nonexistent-bin".into(), "true".into());
        let job = mgr.start(&recording, None, None).unwrap();
        wait_terminal(&job).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.unwrap().contains("no .ts segments"));
        // Nothing was transcoded, so no output may exist.
        assert!(!job.preview.video_path.exists());
    }

    #[tokio::test]
    async fn existing_final_output_refuses_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(tmp.path(), "/nonexistent-bin".into(), "true".into());

        let preview = mgr.default_preview(&recording);
        std::fs::create_dir_all(&preview.target_dir).unwrap();
        std::fs::write(&preview.video_path, "already here").unwrap();

        let job = mgr.start(&recording, Some(preview.clone()), None).unwrap();
        wait_terminal(&job).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.unwrap().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&preview.video_path).unwrap(), "already here");
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        // Scenario: Start with an already-cancelled context — the job
        // fails with "canceled", no scratch files, no rename.
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(tmp.path(), "/nonexistent-bin".into(), "true".into());

        let preview = mgr.default_preview(&recording);
        let job = Arc::new(ArchiveJob::new(
            mgr.next_id(),
            recording.id,
            Local::now(),
            preview,
        ));
        job.cancel.cancel();

        let ctx = RunContext {
            ffmpeg_bin: "/nonexistent-bin".into(),
            ffprobe_bin: "true".into(),
            args: "-c copy".into(),
        };
        run_job(ctx, job.clone(), recording.path.clone().unwrap()).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("canceled"));
        assert!(!job.preview.target_dir.exists());
    }

    #[tokio::test]
    async fn failing_transcoder_removes_temp_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let ffmpeg = script(
            tmp.path(),
            "fake-ffmpeg",
            "for a in \"$@\"; do out=\"$a\"; done\nprintf junk > \"$out\"\necho broken >&2\nexit 3",
        );
        let mgr = manager(tmp.path(), ffmpeg, fake_ffprobe(tmp.path()));

        let job = mgr.start(&recording, None, None).unwrap();
        wait_terminal(&job).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.unwrap().contains("transcoder exited"));
        assert!(!job.preview.video_path.exists());
        assert!(!tmp_output_path(&job.preview.video_path).exists());
        assert!(snapshot.log_tail.contains("broken"));
    }

    #[tokio::test]
    async fn cancel_kills_running_job() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(
            tmp.path(),
            fake_ffmpeg(tmp.path(), "sleep 30"),
            fake_ffprobe(tmp.path()),
        );

        let job = mgr.start(&recording, None, None).unwrap();
        // Wait for the transcoder to produce its temp output.
        let tmp_path = tmp_output_path(&job.preview.video_path);
        for _ in 0..200 {
            if tmp_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(mgr.cancel(&job.id));
        wait_terminal(&job).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("canceled"));
        assert!(!tmp_path.exists());
        assert!(!job.preview.video_path.exists());

        // Cancelling a terminal job is a no-op that returns false.
        assert!(!mgr.cancel(&job.id));
        assert!(!mgr.cancel("no-such-job"));
    }

    #[tokio::test]
    async fn active_job_lookups_prefer_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(
            tmp.path(),
            fake_ffmpeg(tmp.path(), "sleep 30"),
            fake_ffprobe(tmp.path()),
        );

        let preview_b = Preview {
            target_dir: mgr.archive_root.join("second"),
            video_path: mgr.archive_root.join("second").join("Show.mkv"),
            info_path: mgr.archive_root.join("second").join(INFO_FILE),
        };

        let first = mgr.start(&recording, None, None).unwrap();
        let second = mgr.start(&recording, Some(preview_b), None).unwrap();
        assert!(second.id > first.id);

        assert_eq!(mgr.active_job_for(recording.id), Some(second.id.clone()));
        assert_eq!(
            mgr.active_jobs().get(&recording.id),
            Some(&second.id)
        );
        assert_eq!(mgr.active_job_for(999), None);

        mgr.cancel(&first.id);
        mgr.cancel(&second.id);
        wait_terminal(&first).await;
        wait_terminal(&second).await;
        assert_eq!(mgr.active_job_for(recording.id), None);
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.job_count(), 2);
    }

    #[tokio::test]
    async fn start_rejects_pathless_recordings_and_escaping_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, recording) = source_recording(tmp.path());
        let mgr = manager(tmp.path(), "true".into(), "true".into());

        let mut pathless = recording.clone();
        pathless.path = None;
        assert!(matches!(
            mgr.start(&pathless, None, None),
            Err(VdrError::InvalidInput(_))
        ));

        let outside = Preview {
            target_dir: PathBuf::from("/tmp/elsewhere"),
            video_path: PathBuf::from("/tmp/elsewhere/v.mkv"),
            info_path: PathBuf::from("/tmp/elsewhere/info"),
        };
        assert!(matches!(
            mgr.start(&recording, Some(outside), None),
            Err(VdrError::InvalidInput(_))
        ));
        assert_eq!(mgr.job_count(), 0);
    }
}

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{VdrError, VdrResult};
use crate::models::{timer_from_event, Channel, EpgEvent, Recording, Timer};
use crate::overlap::{classify_timers, Severity};
use crate::svdrp::VdrBackend;

/// Name of the metadata file every intact recording directory carries.
pub const INFO_FILE: &str = "info";

/// True when `path` stays inside `root` without upward traversal.
pub fn path_inside(root: &Path, path: &Path) -> bool {
    path.starts_with(root) && path.components().all(|c| c != Component::ParentDir)
}

// ---------------------------------------------------------------------------
// Timer defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct TimerDefaults {
    priority: u8,
    lifetime: u8,
    margin_start_min: i64,
    margin_stop_min: i64,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// A saved search over the EPG.
///
/// Substring matching lower-cases ASCII only; non-ASCII letters compare
/// byte-wise. Regular-expression mode compiles `query` with the
/// case-sensitivity toggle applied.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchOptions {
    pub query: String,
    #[serde(default)]
    pub use_regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Restrict to a single channel id.
    #[serde(default)]
    pub channel: Option<String>,
    /// Restrict to an inclusive channel-number range.
    #[serde(default)]
    pub channel_from: Option<u32>,
    #[serde(default)]
    pub channel_to: Option<u32>,
}

enum Matcher {
    Substring { needle: String, case_sensitive: bool },
    Regex(regex::Regex),
}

impl Matcher {
    fn build(opts: &SearchOptions) -> VdrResult<Self> {
        if opts.query.is_empty() {
            return Err(VdrError::invalid("search query must not be empty"));
        }
        if opts.use_regex {
            let re = RegexBuilder::new(&opts.query)
                .case_insensitive(!opts.case_sensitive)
                .build()
                .map_err(|e| VdrError::invalid(format!("bad search pattern: {e}")))?;
            Ok(Self::Regex(re))
        } else {
            let needle = if opts.case_sensitive {
                opts.query.clone()
            } else {
                opts.query.to_ascii_lowercase()
            };
            Ok(Self::Substring {
                needle,
                case_sensitive: opts.case_sensitive,
            })
        }
    }

    fn matches(&self, event: &EpgEvent) -> bool {
        let fields = [
            Some(event.title.as_str()),
            event.subtitle.as_deref(),
            event.description.as_deref(),
        ];
        fields.into_iter().flatten().any(|text| match self {
            Self::Substring {
                needle,
                case_sensitive,
            } => {
                if *case_sensitive {
                    text.contains(needle.as_str())
                } else {
                    text.to_ascii_lowercase().contains(needle.as_str())
                }
            }
            Self::Regex(re) => re.is_match(text),
        })
    }
}

// ---------------------------------------------------------------------------
// Timer listing with overlap annotation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TimerStatus {
    #[serde(flatten)]
    pub timer: Timer,
    pub overlap: Severity,
}

// ---------------------------------------------------------------------------
// VdrService
// ---------------------------------------------------------------------------

/// The application service every HTTP handler talks to.
///
/// Owns the three caches (EPG, channels, recordings) and applies the
/// wanted-channels filter on every read. Mutating operations go straight
/// to the backend and invalidate the affected cache on success.
pub struct VdrService {
    backend: Arc<dyn VdrBackend>,
    wanted: Vec<String>,
    tuners: u32,
    video_root: PathBuf,
    defaults: TimerDefaults,

    /// Keyed by `<channel>@<hour-bucket>`, `<channel>@all`, or `all`.
    epg_cache: TtlCache<String, Vec<EpgEvent>>,
    channel_cache: TtlCache<(), Vec<Channel>>,
    recording_cache: TtlCache<(), Vec<Recording>>,
}

impl VdrService {
    pub fn new(backend: Arc<dyn VdrBackend>, config: &Config) -> Self {
        Self {
            backend,
            wanted: config.wanted_channels.clone(),
            tuners: config.tuners,
            video_root: config.video_root.clone(),
            defaults: TimerDefaults {
                priority: config.timer_priority,
                lifetime: config.timer_lifetime,
                margin_start_min: config.margin_start_min,
                margin_stop_min: config.margin_stop_min,
            },
            epg_cache: TtlCache::new(config.epg_cache),
            channel_cache: TtlCache::new(config.channel_cache),
            recording_cache: TtlCache::new(config.recording_cache),
        }
    }

    /// An empty filter list means every channel is wanted.
    fn is_wanted(&self, channel_id: &str) -> bool {
        self.wanted.is_empty() || self.wanted.iter().any(|w| w == channel_id)
    }

    /// Drop all cached listings. The next reads go to the backend.
    pub fn invalidate_caches(&self) {
        self.epg_cache.invalidate();
        self.channel_cache.invalidate();
        self.recording_cache.invalidate();
    }

    // ── channels ────────────────────────────────────────────────────────

    pub async fn channels(&self) -> VdrResult<Vec<Channel>> {
        let all = match self.channel_cache.get(&()) {
            Some(list) => list,
            None => {
                let list = self.backend.list_channels().await?;
                self.channel_cache.put((), list.clone());
                list
            }
        };
        Ok(all
            .into_iter()
            .filter(|c| self.is_wanted(&c.id))
            .collect())
    }

    pub async fn current_channel(&self) -> VdrResult<String> {
        self.backend.current_channel().await
    }

    pub async fn set_channel(&self, channel: &str) -> VdrResult<String> {
        self.backend.set_channel(channel).await
    }

    pub async fn send_key(&self, key: &str) -> VdrResult<()> {
        self.backend.send_key(key).await
    }

    // ── EPG ─────────────────────────────────────────────────────────────

    /// EPG listing for one channel (optionally at an instant) or for
    /// every wanted channel. Explicitly asking for an unwanted channel
    /// short-circuits to an empty result without touching the backend.
    pub async fn epg(&self, channel: Option<&str>, at: Option<i64>) -> VdrResult<Vec<EpgEvent>> {
        let channel = channel.filter(|c| !c.is_empty());
        let at = at.filter(|t| *t > 0);

        if let Some(ch) = channel {
            if !self.is_wanted(ch) {
                debug!(channel = ch, "EPG request for unwanted channel");
                return Ok(Vec::new());
            }
        }

        let key = match (channel, at) {
            (Some(ch), Some(ts)) => format!("{ch}@{}", ts / 3600),
            (Some(ch), None) => format!("{ch}@all"),
            (None, _) => "all".to_string(),
        };

        let events = match self.epg_cache.get(&key) {
            Some(events) => events,
            None => {
                let events = self.backend.list_epg(channel, at).await?;
                self.epg_cache.put(key, events.clone());
                events
            }
        };

        Ok(events
            .into_iter()
            .filter(|ev| self.is_wanted(&ev.channel_id))
            .collect())
    }

    /// What is running right now, one event per channel, derived from a
    /// single all-EPG listing rather than one call per channel.
    pub async fn current_programs(&self) -> VdrResult<Vec<EpgEvent>> {
        let events = self.epg(None, None).await?;
        let now = Local::now();

        // Best event per channel: the latest start still in the past.
        let mut best: HashMap<String, EpgEvent> = HashMap::new();
        for ev in events {
            if ev.start <= now && now < ev.stop {
                match best.get(&ev.channel_id) {
                    Some(current) if current.start >= ev.start => {}
                    _ => {
                        best.insert(ev.channel_id.clone(), ev);
                    }
                }
            }
        }

        let mut programs: Vec<EpgEvent> = best.into_values().collect();
        self.fill_channel_info(&mut programs).await?;

        programs.sort_by(|a, b| {
            channel_sort_key(a)
                .cmp(&channel_sort_key(b))
                .then(a.start.cmp(&b.start))
        });
        Ok(programs)
    }

    /// Run a saved search over the all-EPG listing.
    pub async fn search(&self, opts: &SearchOptions) -> VdrResult<Vec<EpgEvent>> {
        let matcher = Matcher::build(opts)?;

        let mut events = self.epg(None, None).await?;
        self.fill_channel_info(&mut events).await?;

        let mut hits: Vec<EpgEvent> = events
            .into_iter()
            .filter(|ev| {
                if let Some(ch) = &opts.channel {
                    if ev.channel_id != *ch {
                        return false;
                    }
                }
                if opts.channel_from.is_some() || opts.channel_to.is_some() {
                    let number = match ev.channel_number {
                        Some(n) => n,
                        None => return false,
                    };
                    if number < opts.channel_from.unwrap_or(0)
                        || number > opts.channel_to.unwrap_or(u32::MAX)
                    {
                        return false;
                    }
                }
                matcher.matches(ev)
            })
            .collect();

        hits.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.channel_number.unwrap_or(u32::MAX).cmp(&b.channel_number.unwrap_or(u32::MAX)))
                .then(a.channel_name.cmp(&b.channel_name))
                .then(a.title.cmp(&b.title))
                .then(a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    /// Fill missing channel number/name from the channels cache.
    async fn fill_channel_info(&self, events: &mut [EpgEvent]) -> VdrResult<()> {
        let channels = self.channels().await?;
        let by_id: HashMap<&str, &Channel> =
            channels.iter().map(|c| (c.id.as_str(), c)).collect();

        for ev in events.iter_mut() {
            if let Some(ch) = by_id.get(ev.channel_id.as_str()) {
                if ev.channel_number.is_none() {
                    ev.channel_number = Some(ch.number);
                }
                if ev.channel_name.is_none() {
                    ev.channel_name = Some(ch.name.clone());
                }
            }
        }
        Ok(())
    }

    // ── timers ──────────────────────────────────────────────────────────

    pub async fn timers(&self) -> VdrResult<Vec<Timer>> {
        self.backend.list_timers().await
    }

    /// Timers annotated with their overlap classification for the
    /// configured tuner count.
    pub async fn timers_with_overlap(&self) -> VdrResult<Vec<TimerStatus>> {
        let timers = self.backend.list_timers().await?;
        let classification = classify_timers(&timers, self.tuners, None);
        Ok(timers
            .into_iter()
            .map(|timer| {
                let overlap = classification.severity(timer.id);
                TimerStatus { timer, overlap }
            })
            .collect())
    }

    pub async fn create_timer(&self, timer: &Timer) -> VdrResult<()> {
        self.backend.new_timer(timer).await?;
        self.epg_cache.invalidate();
        Ok(())
    }

    pub async fn update_timer(&self, timer: &Timer) -> VdrResult<()> {
        self.backend.update_timer(timer).await?;
        self.epg_cache.invalidate();
        Ok(())
    }

    pub async fn delete_timer(&self, id: u32) -> VdrResult<()> {
        self.backend.delete_timer(id).await?;
        self.epg_cache.invalidate();
        Ok(())
    }

    /// Flip the active flag; returns the new state.
    pub async fn toggle_timer(&self, id: u32) -> VdrResult<bool> {
        let timers = self.backend.list_timers().await?;
        let mut timer = timers
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| VdrError::not_found(format!("timer {id}")))?;
        timer.active = !timer.active;
        let active = timer.active;
        self.backend.update_timer(&timer).await?;
        self.epg_cache.invalidate();
        Ok(active)
    }

    /// Create a timer for an EPG event, widened by the configured margins.
    pub async fn create_timer_from_event(
        &self,
        event_id: u32,
        channel: Option<&str>,
    ) -> VdrResult<Timer> {
        let events = self.epg(channel, None).await?;
        let event = events
            .iter()
            .find(|ev| ev.id == event_id)
            .ok_or_else(|| VdrError::not_found(format!("EPG event {event_id}")))?;

        let timer = timer_from_event(
            event,
            self.defaults.margin_start_min,
            self.defaults.margin_stop_min,
            self.defaults.priority,
            self.defaults.lifetime,
        );
        self.backend.new_timer(&timer).await?;
        self.epg_cache.invalidate();
        Ok(timer)
    }

    // ── recordings ──────────────────────────────────────────────────────

    /// Recording listing with resolved on-disk directories.
    ///
    /// On a cache hit, entries whose directory (or info file) has
    /// vanished are pruned from the snapshot and the cache is updated
    /// without a backend call. On a miss, recordings whose path cannot be
    /// resolved, escapes the video root, or is gone from disk are
    /// filtered out before caching.
    pub async fn recordings(&self) -> VdrResult<Vec<Recording>> {
        if let Some(cached) = self.recording_cache.get(&()) {
            let pruned: Vec<Recording> = cached
                .iter()
                .filter(|r| self.recording_on_disk(r))
                .cloned()
                .collect();
            if pruned.len() != cached.len() {
                self.recording_cache.replace(&(), pruned.clone());
            }
            return Ok(pruned);
        }

        let list = self.backend.list_recordings().await?;
        let mut resolved = Vec::with_capacity(list.len());
        for mut rec in list {
            match self.backend.recording_path(rec.id).await {
                Ok(path) => {
                    if !path_inside(&self.video_root, &path) {
                        warn!(
                            recording = rec.id,
                            path = %path.display(),
                            "recording path escapes the video root, skipping"
                        );
                        continue;
                    }
                    rec.path = Some(path);
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
            if !self.recording_on_disk(&rec) {
                continue;
            }
            resolved.push(rec);
        }

        self.recording_cache.put((), resolved.clone());
        Ok(resolved)
    }

    pub async fn recording(&self, id: u32) -> VdrResult<Recording> {
        self.recordings()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| VdrError::not_found(format!("recording {id}")))
    }

    pub async fn delete_recording(&self, id: u32) -> VdrResult<()> {
        self.backend.delete_recording(id).await?;
        self.recording_cache.invalidate();
        Ok(())
    }

    fn recording_on_disk(&self, rec: &Recording) -> bool {
        match &rec.path {
            Some(dir) => dir.is_dir() && dir.join(INFO_FILE).is_file(),
            None => true,
        }
    }

    // ── introspection (health endpoint) ─────────────────────────────────

    pub async fn backend_alive(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    pub async fn shutdown(&self) {
        self.backend.close().await;
    }
}

fn channel_sort_key(ev: &EpgEvent) -> (u32, u32, String) {
    (
        ev.channel_number.unwrap_or(u32::MAX),
        ev.channel_id.parse::<u32>().unwrap_or(u32::MAX),
        ev.channel_name.clone().unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

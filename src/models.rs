use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A channel as enumerated by the VDR backend.
///
/// The ordinal `number` is the 1-based position in the backend's listing;
/// the `id` is the stable channel identifier used everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub number: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Physical tuning resource descriptor (`source:frequency`).
    pub transponder: String,
}

/// Parse one channel listing line:
/// `<id> <name>[;<provider>]:<freq>:<params>:<source>:…`
///
/// `position` is the 1-based index in the listing and becomes the ordinal
/// channel number. Returns `None` for lines that do not look like a channel.
pub fn parse_channel_line(line: &str, position: u32) -> Option<Channel> {
    let (id, rest) = line.split_once(' ')?;
    if id.is_empty() {
        return None;
    }

    let mut fields = rest.split(':');
    let name_field = fields.next()?;
    let freq = fields.next().unwrap_or("");
    let _params = fields.next().unwrap_or("");
    let source = fields.next().unwrap_or("");

    let (name, provider) = match name_field.split_once(';') {
        Some((n, p)) if !p.is_empty() => (n.to_string(), Some(p.to_string())),
        Some((n, _)) => (n.to_string(), None),
        None => (name_field.to_string(), None),
    };
    if name.is_empty() {
        return None;
    }

    let transponder = if !source.is_empty() && !freq.is_empty() {
        format!("{source}:{freq}")
    } else {
        transponder_key(id).to_string()
    };

    Some(Channel {
        id: id.to_string(),
        number: position,
        name,
        provider,
        transponder,
    })
}

/// Derive the tuning-resource key from a channel id.
///
/// Channel ids end in a service id (`S19.2E-1-100-10`); every service on
/// the same transponder shares the prefix, so a single tuner can record
/// all of them at once.
pub fn transponder_key(channel_id: &str) -> &str {
    channel_id
        .rsplit_once('-')
        .map(|(prefix, _)| prefix)
        .unwrap_or(channel_id)
}

// ---------------------------------------------------------------------------
// EPG event
// ---------------------------------------------------------------------------

/// A single electronic-program-guide event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpgEvent {
    pub id: u32,
    pub channel_id: String,
    /// Filled from the channel cache when the listing itself lacks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: DateTime<Local>,
    pub stop: DateTime<Local>,
    pub duration_secs: i64,
}

/// Parse an EPG listing (the payload lines of an `LSTE` response).
///
/// The listing is a stream of sub-records:
/// * `C <channelID> <channelName>` — channel context for following events
/// * `E <eventID> <unixStart> <durationSeconds> …` — event header
/// * `T <title>` / `S <subtitle>` / `D <descLine>` — text fields
///   (multiple `D` lines concatenate with a newline)
/// * `e` — end of event, `c` — end of channel
///
/// Unparseable lines are skipped.
pub fn parse_epg(lines: &[String]) -> Vec<EpgEvent> {
    let mut events = Vec::new();

    let mut channel_id = String::new();
    let mut channel_name: Option<String> = None;
    let mut current: Option<EpgEvent> = None;

    for line in lines {
        let (tag, payload) = match line.split_once(' ') {
            Some((t, p)) => (t, p),
            None => (line.as_str(), ""),
        };

        match tag {
            "C" => {
                let mut parts = payload.splitn(2, ' ');
                channel_id = parts.next().unwrap_or("").to_string();
                channel_name = parts.next().map(|s| s.to_string());
            }
            "E" => {
                let mut parts = payload.split_whitespace();
                let id = parts.next().and_then(|s| s.parse::<u32>().ok());
                let start = parts.next().and_then(|s| s.parse::<i64>().ok());
                let duration = parts.next().and_then(|s| s.parse::<i64>().ok());
                if let (Some(id), Some(start), Some(duration)) = (id, start, duration) {
                    if let Some(start) = Local.timestamp_opt(start, 0).single() {
                        current = Some(EpgEvent {
                            id,
                            channel_id: channel_id.clone(),
                            channel_number: None,
                            channel_name: channel_name.clone(),
                            title: String::new(),
                            subtitle: None,
                            description: None,
                            start,
                            stop: start + Duration::seconds(duration),
                            duration_secs: duration,
                        });
                    }
                }
            }
            "T" => {
                if let Some(ev) = current.as_mut() {
                    ev.title = payload.to_string();
                }
            }
            "S" => {
                if let Some(ev) = current.as_mut() {
                    ev.subtitle = Some(payload.to_string());
                }
            }
            "D" => {
                if let Some(ev) = current.as_mut() {
                    match ev.description.as_mut() {
                        Some(desc) => {
                            desc.push('\n');
                            desc.push_str(payload);
                        }
                        None => ev.description = Some(payload.to_string()),
                    }
                }
            }
            "e" => {
                if let Some(ev) = current.take() {
                    events.push(ev);
                }
            }
            "c" => {
                channel_id.clear();
                channel_name = None;
            }
            _ => {}
        }
    }

    events
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// When a timer fires: a concrete date or a weekday pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DaySpec {
    /// A single recording with resolved local start/stop instants.
    OneShot {
        start: DateTime<Local>,
        stop: DateTime<Local>,
    },
    /// A weekly pattern. `days[0]` is Monday. Minutes are measured from
    /// local midnight; `stop_min <= start_min` means the recording crosses
    /// midnight into the following day.
    Recurring {
        days: [bool; 7],
        start_min: u16,
        stop_min: u16,
    },
}

/// A scheduled recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Backend-assigned; zero on not-yet-created timers.
    #[serde(default)]
    pub id: u32,
    pub active: bool,
    pub channel_id: String,
    pub day: DaySpec,
    pub priority: u8,
    pub lifetime: u8,
    pub title: String,
    #[serde(default)]
    pub aux: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u32>,
}

const DAY_LETTERS: [char; 7] = ['M', 'T', 'W', 'T', 'F', 'S', 'S'];

impl Timer {
    /// Check the invariants the backend enforces on write.
    pub fn validate(&self) -> Result<(), String> {
        if self.channel_id.is_empty() {
            return Err("channel id must not be empty".into());
        }
        if self.priority > 99 {
            return Err(format!("priority {} outside 0..=99", self.priority));
        }
        if self.lifetime > 99 {
            return Err(format!("lifetime {} outside 0..=99", self.lifetime));
        }
        match &self.day {
            DaySpec::OneShot { start, stop } => {
                if stop <= start {
                    return Err("stop must be after start".into());
                }
            }
            DaySpec::Recurring {
                days,
                start_min,
                stop_min,
            } => {
                if !days.iter().any(|d| *d) {
                    return Err("recurring timer needs at least one weekday".into());
                }
                if *start_min >= 1440 || *stop_min >= 1440 {
                    return Err("minutes must be below 1440".into());
                }
            }
        }
        Ok(())
    }

    /// The colon-separated settings string written over the wire
    /// (everything after the timer id). Colons inside title and aux are
    /// escaped to `|` so they cannot be mistaken for field separators.
    pub fn settings_string(&self) -> String {
        let (day, start, stop) = match &self.day {
            DaySpec::OneShot { start, stop } => (
                start.format("%Y-%m-%d").to_string(),
                start.format("%H%M").to_string(),
                stop.format("%H%M").to_string(),
            ),
            DaySpec::Recurring {
                days,
                start_min,
                stop_min,
            } => {
                let mask: String = days
                    .iter()
                    .enumerate()
                    .map(|(i, on)| if *on { DAY_LETTERS[i] } else { '-' })
                    .collect();
                (mask, format_hhmm(*start_min), format_hhmm(*stop_min))
            }
        };

        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            if self.active { 1 } else { 0 },
            self.channel_id,
            day,
            start,
            stop,
            self.priority,
            self.lifetime,
            escape_field(&self.title),
            escape_field(&self.aux),
        )
    }
}

fn escape_field(s: &str) -> String {
    s.replace(':', "|")
}

fn format_hhmm(minutes: u16) -> String {
    format!("{:02}{:02}", minutes / 60, minutes % 60)
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let digits = s.trim();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits[..2].parse().ok()?;
    let min: u32 = digits[2..].parse().ok()?;
    NaiveTime::from_hms_opt(hour, min, 0)
}

fn parse_minutes(s: &str) -> Option<u16> {
    let t = parse_hhmm(s)?;
    use chrono::Timelike;
    Some((t.hour() * 60 + t.minute()) as u16)
}

/// Resolve a local date + time into a concrete instant, taking the
/// earliest candidate when the wall-clock time is ambiguous (DST).
fn local_datetime(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&date.and_time(time)).earliest()
}

/// Parse one timer listing line:
/// `<id> <flags>:<channelID>:<day>:<startHHMM>:<stopHHMM>:<priority>:<lifetime>:<title>:<aux>`
///
/// `day` is `YYYY-MM-DD` for a one-shot timer or a 7-character weekday
/// mask for a recurring one. HHMM values are interpreted in the
/// process-local timezone; a one-shot whose stop is not after its start
/// rolls over to the next calendar day.
pub fn parse_timer_line(line: &str) -> Option<Timer> {
    let (id, settings) = line.split_once(' ')?;
    let id: u32 = id.parse().ok()?;

    let fields: Vec<&str> = settings.splitn(9, ':').collect();
    if fields.len() < 8 {
        return None;
    }

    let flags: u32 = fields[0].parse().ok()?;
    let channel_id = fields[1].to_string();
    if channel_id.is_empty() {
        return None;
    }

    let day = parse_day_spec(fields[2], fields[3], fields[4])?;

    let priority: u8 = fields[5].parse().ok()?;
    let lifetime: u8 = fields[6].parse().ok()?;
    if priority > 99 || lifetime > 99 {
        return None;
    }

    Some(Timer {
        id,
        active: flags & 1 == 1,
        channel_id,
        day,
        priority,
        lifetime,
        title: fields[7].to_string(),
        aux: fields.get(8).map(|s| s.to_string()).unwrap_or_default(),
        event_id: None,
    })
}

fn parse_day_spec(day: &str, start: &str, stop: &str) -> Option<DaySpec> {
    if let Ok(date) = NaiveDate::parse_from_str(day, "%Y-%m-%d") {
        let start_t = parse_hhmm(start)?;
        let stop_t = parse_hhmm(stop)?;
        let start = local_datetime(date, start_t)?;
        let mut stop = local_datetime(date, stop_t)?;
        if stop <= start {
            stop = local_datetime(date.succ_opt()?, stop_t)?;
        }
        return Some(DaySpec::OneShot { start, stop });
    }

    if day.len() == 7 && day.chars().all(|c| c == '-' || DAY_LETTERS.contains(&c)) {
        let mut days = [false; 7];
        for (i, c) in day.chars().enumerate() {
            days[i] = c != '-';
        }
        return Some(DaySpec::Recurring {
            days,
            start_min: parse_minutes(start)?,
            stop_min: parse_minutes(stop)?,
        });
    }

    None
}

/// Build a one-shot timer for an EPG event, widened by the recording
/// margins. The margins can move the timer day onto the previous
/// calendar day when the event starts shortly after midnight.
pub fn timer_from_event(
    event: &EpgEvent,
    margin_start_min: i64,
    margin_stop_min: i64,
    priority: u8,
    lifetime: u8,
) -> Timer {
    Timer {
        id: 0,
        active: true,
        channel_id: event.channel_id.clone(),
        day: DaySpec::OneShot {
            start: event.start - Duration::minutes(margin_start_min),
            stop: event.stop + Duration::minutes(margin_stop_min),
        },
        priority,
        lifetime,
        title: event.title.clone(),
        aux: String::new(),
        event_id: Some(event.id),
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// A completed recording as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub channel: String,
    pub recorded_at: DateTime<Local>,
    /// Length as reported by the backend (`H:MM`).
    pub length: String,
    /// True when the backend flags the recording as not yet watched.
    pub new: bool,
    /// Resolved on-disk directory, when known. Must live inside the
    /// configured video root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Parse one recording listing line:
/// `<id> <dd.mm.yy> <HH:MM> <len>[*|!|*!] <channel>~<title>[~<subtitle>[~<desc>]]`
pub fn parse_recording_line(line: &str) -> Option<Recording> {
    let mut parts = line.splitn(5, ' ');
    let id: u32 = parts.next()?.parse().ok()?;
    let date = parts.next()?;
    let time = parts.next()?;
    let len_field = parts.next()?;
    let name = parts.next()?;

    let date = NaiveDate::parse_from_str(date, "%d.%m.%y").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M").ok()?;
    let recorded_at = local_datetime(date, time)?;

    let new = len_field.contains('*');
    let length = len_field.trim_end_matches(|c| c == '*' || c == '!').to_string();

    let mut name_parts = name.split('~');
    let channel = name_parts.next()?.to_string();
    let title = name_parts.next()?.to_string();
    let subtitle = name_parts.next().map(|s| s.to_string());
    let description = name_parts.next().map(|s| s.to_string());
    if title.is_empty() {
        return None;
    }

    Some(Recording {
        id,
        title,
        subtitle,
        description,
        channel,
        recorded_at,
        length,
        new,
        path: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

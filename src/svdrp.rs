use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{VdrError, VdrResult};
use crate::models::{
    parse_channel_line, parse_epg, parse_recording_line, parse_timer_line, Channel, EpgEvent,
    Recording, Timer,
};

// ---------------------------------------------------------------------------
// VdrBackend — the capability set the services program against
// ---------------------------------------------------------------------------

/// Operations the VDR backend offers.
///
/// The production implementation is [`SvdrpClient`]; tests use an
/// in-memory fake. Service code only ever sees `Arc<dyn VdrBackend>`.
#[async_trait]
pub trait VdrBackend: Send + Sync {
    async fn ping(&self) -> VdrResult<()>;

    async fn list_channels(&self) -> VdrResult<Vec<Channel>>;

    /// List EPG events, optionally restricted to one channel and one
    /// point in time (Unix seconds). An empty channel id degrades to the
    /// all-channel listing regardless of the timestamp.
    async fn list_epg(&self, channel: Option<&str>, at: Option<i64>) -> VdrResult<Vec<EpgEvent>>;

    async fn list_timers(&self) -> VdrResult<Vec<Timer>>;
    async fn new_timer(&self, timer: &Timer) -> VdrResult<()>;
    async fn update_timer(&self, timer: &Timer) -> VdrResult<()>;
    async fn delete_timer(&self, id: u32) -> VdrResult<()>;

    async fn list_recordings(&self) -> VdrResult<Vec<Recording>>;
    /// Resolve the on-disk directory of a recording.
    async fn recording_path(&self, id: u32) -> VdrResult<PathBuf>;
    async fn delete_recording(&self, id: u32) -> VdrResult<()>;

    /// The currently tuned channel, as reported by the backend
    /// (`<number> <name>`).
    async fn current_channel(&self) -> VdrResult<String>;
    async fn set_channel(&self, channel: &str) -> VdrResult<String>;

    /// Send a remote-control key press.
    async fn send_key(&self, key: &str) -> VdrResult<()>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Response framing
// ---------------------------------------------------------------------------

/// Split one response line into `(code, continuation, payload)`.
///
/// Lines look like `CCC-payload` (continuation) or `CCC payload`
/// (terminator). Returns `None` for lines that do not carry the prefix.
fn split_line(line: &str) -> Option<(u16, bool, &str)> {
    if line.len() < 4 {
        return None;
    }
    let code: u16 = line.get(..3)?.parse().ok()?;
    let cont = match line.as_bytes()[3] {
        b'-' => true,
        b' ' => false,
        _ => return None,
    };
    Some((code, cont, &line[4..]))
}

/// Read one complete response and return its payload lines in order.
///
/// Codes ≥ 400 become a protocol error carrying the code and the remote
/// message; remaining continuation lines are drained so the connection
/// stays usable. Lines without a valid prefix are skipped. EOF before
/// the terminator is a connection error.
async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> VdrResult<Vec<String>> {
    let mut payload = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(VdrError::connection)?;
        if n == 0 {
            return Err(VdrError::Connection(
                "connection closed mid-response".into(),
            ));
        }
        let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');

        let (code, cont, text) = match split_line(trimmed) {
            Some(parts) => parts,
            None => continue,
        };

        if code >= 400 {
            let message = text.to_string();
            let mut more = cont;
            while more {
                line.clear();
                let n = reader
                    .read_line(&mut line)
                    .await
                    .map_err(VdrError::connection)?;
                if n == 0 {
                    break;
                }
                let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
                more = matches!(split_line(trimmed), Some((_, true, _)));
            }
            return Err(VdrError::Protocol { code, message });
        }

        payload.push(text.to_string());
        if !cont {
            return Ok(payload);
        }
    }
}

/// Listings answer with a not-found code when they are merely empty
/// ("No timers defined"); callers want an empty list for those.
fn empty_on_not_found(result: VdrResult<Vec<String>>) -> VdrResult<Vec<String>> {
    match result {
        Err(VdrError::Protocol { code: 550, .. }) => Ok(Vec::new()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// SvdrpClient
// ---------------------------------------------------------------------------

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Sole owner of the TCP connection to the VDR daemon.
///
/// Commands are serialized by a client-wide lock — exactly one is in
/// flight at any time. Every command lazily connects; transport errors
/// drop the socket so the next command starts fresh.
pub struct SvdrpClient {
    host: String,
    port: u16,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl SvdrpClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> VdrResult<Connection> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| VdrError::Timeout(format!("connecting to {addr}")))?
            .map_err(VdrError::connection)?;

        let (read, write) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read),
            writer: write,
        };

        // Consume the welcome banner.
        let banner = tokio::time::timeout(self.timeout, read_response(&mut conn.reader))
            .await
            .map_err(|_| VdrError::Timeout(format!("waiting for greeting from {addr}")))??;
        debug!(addr = %addr, banner = ?banner.first(), "SVDRP connected");

        Ok(conn)
    }

    /// Send one command and collect the payload lines of its response.
    pub async fn command(&self, cmd: &str) -> VdrResult<Vec<String>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().expect("connection populated above");

        match tokio::time::timeout(self.timeout, Self::exchange(conn, cmd)).await {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(err)) => {
                if matches!(err, VdrError::Connection(_)) {
                    *guard = None;
                }
                Err(err)
            }
            Err(_) => {
                // The exchange may have half-completed; the socket state is
                // unknown, so force a reconnect.
                *guard = None;
                Err(VdrError::Timeout(format!("SVDRP command '{cmd}'")))
            }
        }
    }

    async fn exchange(conn: &mut Connection, cmd: &str) -> VdrResult<Vec<String>> {
        conn.writer
            .write_all(cmd.as_bytes())
            .await
            .map_err(VdrError::connection)?;
        conn.writer
            .write_all(b"\r\n")
            .await
            .map_err(VdrError::connection)?;
        read_response(&mut conn.reader).await
    }
}

#[async_trait]
impl VdrBackend for SvdrpClient {
    async fn ping(&self) -> VdrResult<()> {
        self.command("PING").await.map(|_| ())
    }

    async fn list_channels(&self) -> VdrResult<Vec<Channel>> {
        let lines = empty_on_not_found(self.command("LSTC").await)?;
        let mut channels = Vec::with_capacity(lines.len());
        for line in &lines {
            let position = channels.len() as u32 + 1;
            if let Some(ch) = parse_channel_line(line, position) {
                channels.push(ch);
            }
        }
        Ok(channels)
    }

    async fn list_epg(&self, channel: Option<&str>, at: Option<i64>) -> VdrResult<Vec<EpgEvent>> {
        let channel = channel.filter(|c| !c.is_empty());
        let cmd = match (channel, at) {
            (Some(ch), Some(ts)) => format!("LSTE {ch} at {ts}"),
            (Some(ch), None) => format!("LSTE {ch}"),
            // An empty channel id degrades to the all-EPG listing.
            (None, _) => "LSTE".to_string(),
        };

        let result = self.command(&cmd).await;
        let lines = match (result, channel, at) {
            // Backend rejected the "at" option — retry once without it.
            (Err(VdrError::Protocol { code: 501, .. }), Some(ch), Some(_)) => {
                debug!(channel = ch, "backend rejected EPG timestamp, retrying without");
                empty_on_not_found(self.command(&format!("LSTE {ch}")).await)?
            }
            (result, _, _) => empty_on_not_found(result)?,
        };
        Ok(parse_epg(&lines))
    }

    async fn list_timers(&self) -> VdrResult<Vec<Timer>> {
        // A fresh connect absorbs the transient drops seen in practice.
        let lines = match empty_on_not_found(self.command("LSTT").await) {
            Err(VdrError::Connection(reason)) => {
                warn!(%reason, "LSTT failed on transport, retrying once");
                empty_on_not_found(self.command("LSTT").await)?
            }
            other => other?,
        };
        Ok(lines.iter().filter_map(|l| parse_timer_line(l)).collect())
    }

    async fn new_timer(&self, timer: &Timer) -> VdrResult<()> {
        timer.validate().map_err(VdrError::invalid)?;
        self.command(&format!("NEWT {}", timer.settings_string()))
            .await
            .map(|_| ())
    }

    async fn update_timer(&self, timer: &Timer) -> VdrResult<()> {
        timer.validate().map_err(VdrError::invalid)?;
        if timer.id == 0 {
            return Err(VdrError::invalid("timer id must be set for an update"));
        }
        self.command(&format!("MODT {} {}", timer.id, timer.settings_string()))
            .await
            .map(|_| ())
    }

    async fn delete_timer(&self, id: u32) -> VdrResult<()> {
        self.command(&format!("DELT {id}")).await.map(|_| ())
    }

    async fn list_recordings(&self) -> VdrResult<Vec<Recording>> {
        let lines = empty_on_not_found(self.command("LSTR").await)?;
        Ok(lines.iter().filter_map(|l| parse_recording_line(l)).collect())
    }

    async fn recording_path(&self, id: u32) -> VdrResult<PathBuf> {
        let lines = self.command(&format!("LSTR {id} path")).await?;
        let path = lines
            .first()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| VdrError::not_found(format!("recording {id} has no path")))?;
        Ok(PathBuf::from(path))
    }

    async fn delete_recording(&self, id: u32) -> VdrResult<()> {
        self.command(&format!("DELR {id}")).await.map(|_| ())
    }

    async fn current_channel(&self) -> VdrResult<String> {
        let lines = self.command("CHAN").await?;
        lines
            .into_iter()
            .next()
            .ok_or_else(|| VdrError::internal("empty CHAN response"))
    }

    async fn set_channel(&self, channel: &str) -> VdrResult<String> {
        if channel.is_empty() {
            return Err(VdrError::invalid("channel must not be empty"));
        }
        let lines = self.command(&format!("CHAN {channel}")).await?;
        lines
            .into_iter()
            .next()
            .ok_or_else(|| VdrError::internal("empty CHAN response"))
    }

    async fn send_key(&self, key: &str) -> VdrResult<()> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(VdrError::invalid(format!("invalid remote key '{key}'")));
        }
        self.command(&format!("HITK {key}")).await.map(|_| ())
    }

    async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            // Best-effort goodbye; the socket is dropped either way.
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                let _ = conn.writer.write_all(b"QUIT\r\n").await;
            })
            .await;
        }
        *guard = None;
    }
}

// ---------------------------------------------------------------------------
// In-memory fake (used by service and contract tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct FakeState {
        pub channels: Vec<Channel>,
        pub epg: Vec<EpgEvent>,
        pub timers: Vec<Timer>,
        pub recordings: Vec<Recording>,
        pub recording_paths: HashMap<u32, PathBuf>,
        pub current: String,
        pub keys: Vec<String>,
        pub next_timer_id: u32,
        /// Per-operation call counter, used by cache tests.
        pub calls: HashMap<&'static str, u32>,
        /// When set, every operation fails with a connection error.
        pub offline: bool,
    }

    /// Stateful in-memory stand-in for the VDR daemon.
    pub struct FakeVdr {
        pub state: StdMutex<FakeState>,
    }

    impl FakeVdr {
        pub fn new() -> Self {
            Self {
                state: StdMutex::new(FakeState {
                    next_timer_id: 1,
                    current: "1 Fake".into(),
                    ..FakeState::default()
                }),
            }
        }

        pub fn calls(&self, op: &str) -> u32 {
            *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
        }

        fn begin(&self, op: &'static str) -> VdrResult<std::sync::MutexGuard<'_, FakeState>> {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(op).or_insert(0) += 1;
            if state.offline {
                return Err(VdrError::Connection("fake backend offline".into()));
            }
            Ok(state)
        }
    }

    #[async_trait]
    impl VdrBackend for FakeVdr {
        async fn ping(&self) -> VdrResult<()> {
            self.begin("ping").map(|_| ())
        }

        async fn list_channels(&self) -> VdrResult<Vec<Channel>> {
            Ok(self.begin("list_channels")?.channels.clone())
        }

        async fn list_epg(
            &self,
            channel: Option<&str>,
            _at: Option<i64>,
        ) -> VdrResult<Vec<EpgEvent>> {
            let state = self.begin("list_epg")?;
            let channel = channel.filter(|c| !c.is_empty());
            Ok(state
                .epg
                .iter()
                .filter(|ev| channel.map_or(true, |ch| ev.channel_id == ch))
                .cloned()
                .collect())
        }

        async fn list_timers(&self) -> VdrResult<Vec<Timer>> {
            Ok(self.begin("list_timers")?.timers.clone())
        }

        async fn new_timer(&self, timer: &Timer) -> VdrResult<()> {
            timer.validate().map_err(VdrError::invalid)?;
            let mut state = self.begin("new_timer")?;
            let mut timer = timer.clone();
            timer.id = state.next_timer_id;
            state.next_timer_id += 1;
            state.timers.push(timer);
            Ok(())
        }

        async fn update_timer(&self, timer: &Timer) -> VdrResult<()> {
            timer.validate().map_err(VdrError::invalid)?;
            let mut state = self.begin("update_timer")?;
            match state.timers.iter_mut().find(|t| t.id == timer.id) {
                Some(slot) => {
                    *slot = timer.clone();
                    Ok(())
                }
                None => Err(VdrError::not_found(format!("timer {}", timer.id))),
            }
        }

        async fn delete_timer(&self, id: u32) -> VdrResult<()> {
            let mut state = self.begin("delete_timer")?;
            let before = state.timers.len();
            state.timers.retain(|t| t.id != id);
            if state.timers.len() == before {
                return Err(VdrError::not_found(format!("timer {id}")));
            }
            Ok(())
        }

        async fn list_recordings(&self) -> VdrResult<Vec<Recording>> {
            Ok(self.begin("list_recordings")?.recordings.clone())
        }

        async fn recording_path(&self, id: u32) -> VdrResult<PathBuf> {
            let state = self.begin("recording_path")?;
            state
                .recording_paths
                .get(&id)
                .cloned()
                .ok_or_else(|| VdrError::Protocol {
                    code: 550,
                    message: format!("recording {id} not found"),
                })
        }

        async fn delete_recording(&self, id: u32) -> VdrResult<()> {
            let mut state = self.begin("delete_recording")?;
            let before = state.recordings.len();
            state.recordings.retain(|r| r.id != id);
            if state.recordings.len() == before {
                return Err(VdrError::not_found(format!("recording {id}")));
            }
            Ok(())
        }

        async fn current_channel(&self) -> VdrResult<String> {
            Ok(self.begin("current_channel")?.current.clone())
        }

        async fn set_channel(&self, channel: &str) -> VdrResult<String> {
            let mut state = self.begin("set_channel")?;
            state.current = channel.to_string();
            Ok(state.current.clone())
        }

        async fn send_key(&self, key: &str) -> VdrResult<()> {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(VdrError::invalid(format!("invalid remote key '{key}'")));
            }
            self.begin("send_key")?.keys.push(key.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Append-only event log: the single source of truth of a workspace.
//!
//! Layout: `events.jsonl`, one [`Event`] per line, plus `events.lock`, the
//! target of an OS advisory lock held for the duration of each append.
//!
//! Writers hold the lock while they heal a torn tail, read the last sequence
//! number and write one complete line. Readers never lock: they only consume
//! bytes up to the last newline, so an in-flight append is invisible to them.

use crate::core::config::BoardConfig;
use crate::core::error::{BlockedError, BoardError};
use crate::core::fold::{BoardState, Event, FoldRegistry, ReplayReport, SkippedRecord};
use crate::core::lockfile::FileLock;
use crate::core::store::Store;
use crate::core::time;
use serde_json::Value as JsonValue;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const APPEND_LOCK_RESOURCE: &str = "events";
const TAIL_CHUNK: u64 = 8 * 1024;

pub struct EventLog {
    store: Store,
    config: BoardConfig,
    registry: FoldRegistry,
}

impl EventLog {
    pub fn new(store: Store, config: BoardConfig) -> Self {
        Self {
            store,
            config,
            registry: FoldRegistry::default(),
        }
    }

    /// Opens the log under `root` with configuration resolved from the workspace.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BoardError> {
        let store = Store::new(root);
        let config = BoardConfig::load(&store)?;
        Ok(Self::new(store, config))
    }

    pub fn with_registry(mut self, registry: FoldRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn registry(&self) -> &FoldRegistry {
        &self.registry
    }

    pub fn path(&self) -> PathBuf {
        self.store.events_path()
    }

    pub fn append_event(&self, event_type: &str, payload: JsonValue) -> Result<Event, BoardError> {
        self.append_event_as("agentboard", event_type, payload)
    }

    pub fn append_event_as(
        &self,
        actor: &str,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<Event, BoardError> {
        self.append_with_ts(actor, event_type, payload, None)
    }

    /// Appends with an explicit envelope `ts`, so callers that apply the same
    /// change elsewhere (the snapshot writer) can record identical timestamps.
    pub fn append_with_ts(
        &self,
        actor: &str,
        event_type: &str,
        payload: JsonValue,
        ts: Option<String>,
    ) -> Result<Event, BoardError> {
        if event_type.trim().is_empty() {
            return Err(BoardError::ValidationError("event type must not be empty".into()));
        }
        if !payload.is_object() {
            return Err(BoardError::ValidationError(format!(
                "payload of '{}' must be a JSON object",
                event_type
            )));
        }

        self.store.ensure_root()?;
        let _lock = AppendLock::acquire(&self.store.events_lock_path(), &self.config)?;

        let path = self.path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(BoardError::IoError)?;

        heal_torn_tail(&mut file, &path)?;
        let seq = last_sequence(&mut file, &path)? + 1;

        let ts_ms = time::now_epoch_millis();
        let ev = Event {
            seq,
            event_id: time::new_event_id(),
            event_type: event_type.to_string(),
            ts: ts.unwrap_or_else(|| time::epoch_z_from_millis(ts_ms)),
            ts_ms,
            actor: actor.to_string(),
            payload,
        };

        let mut line = serde_json::to_vec(&ev)?;
        line.push(b'\n');
        file.write_all(&line).map_err(BoardError::IoError)?;
        if self.config.fsync {
            file.sync_data().map_err(BoardError::IoError)?;
        }

        debug!(seq = ev.seq, event_type = %ev.event_type, actor = %ev.actor, "event appended");
        Ok(ev)
    }

    /// Every decodable event in log order.
    pub fn read_events(&self) -> Result<Vec<Event>, BoardError> {
        self.events_since(0)
    }

    /// Events with `seq > after`, for cheap polling by observers.
    pub fn events_since(&self, after: u64) -> Result<Vec<Event>, BoardError> {
        let Some(bytes) = read_log_bytes(&self.path())? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (_, line) in complete_lines(&bytes, 1) {
            if let Ok(ev) = serde_json::from_slice::<Event>(line) {
                if ev.seq > after {
                    out.push(ev);
                }
            }
        }
        Ok(out)
    }

    /// Replays the on-disk log, reporting what had to be skipped.
    pub fn replay(&self) -> Result<ReplayReport, BoardError> {
        let mut report = ReplayReport::default();
        if let Some(bytes) = read_log_bytes(&self.path())? {
            fold_lines(&mut report, &self.registry, &bytes, 1);
        }
        if !report.skipped.is_empty() {
            warn!(
                path = %self.path().display(),
                skipped = report.skipped.len(),
                "replay skipped malformed records"
            );
        }
        Ok(report)
    }

    /// Folds the whole log into a fresh state. Missing or empty logs give the empty state.
    pub fn get_current_state(&self) -> Result<BoardState, BoardError> {
        Ok(self.replay()?.state)
    }

    /// An advisory cache that folds only bytes appended since its last refresh.
    pub fn incremental(&self) -> IncrementalReplayer {
        IncrementalReplayer::new(self.path(), self.registry.clone())
    }
}

/// Incremental reader over one log file.
///
/// Always equal to a cold [`EventLog::replay`] of the same bytes. If the file
/// shrinks (or disappears) the cache is discarded and rebuilt.
pub struct IncrementalReplayer {
    path: PathBuf,
    registry: FoldRegistry,
    offset: u64,
    next_line: u64,
    report: ReplayReport,
}

impl IncrementalReplayer {
    fn new(path: PathBuf, registry: FoldRegistry) -> Self {
        Self {
            path,
            registry,
            offset: 0,
            next_line: 1,
            report: ReplayReport::default(),
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.next_line = 1;
        self.report = ReplayReport::default();
    }

    pub fn refresh(&mut self) -> Result<&ReplayReport, BoardError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.reset();
                return Ok(&self.report);
            }
            Err(e) => return Err(BoardError::IoError(e)),
        };
        if len < self.offset {
            debug!(path = %self.path.display(), "log shrank; rebuilding cached state");
            self.reset();
        }
        if len == self.offset {
            return Ok(&self.report);
        }

        let mut file = File::open(&self.path).map_err(BoardError::IoError)?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(BoardError::IoError)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(BoardError::IoError)?;

        let consumed = fold_lines(&mut self.report, &self.registry, &buf, self.next_line);
        self.offset += consumed.bytes;
        self.next_line += consumed.lines;
        Ok(&self.report)
    }

    pub fn state(&mut self) -> Result<BoardState, BoardError> {
        Ok(self.refresh()?.state.clone())
    }
}

struct Consumed {
    bytes: u64,
    lines: u64,
}

/// Splits off complete (newline-terminated) lines, numbering from `first_line`.
fn complete_lines(bytes: &[u8], first_line: u64) -> impl Iterator<Item = (u64, &[u8])> {
    let end = bytes.iter().rposition(|b| *b == b'\n').map(|p| p + 1).unwrap_or(0);
    bytes[..end]
        .split(|b| *b == b'\n')
        .take(bytes[..end].iter().filter(|b| **b == b'\n').count())
        .enumerate()
        .map(move |(i, line)| (first_line + i as u64, line))
}

fn fold_lines(
    report: &mut ReplayReport,
    registry: &FoldRegistry,
    bytes: &[u8],
    first_line: u64,
) -> Consumed {
    let mut consumed = Consumed { bytes: 0, lines: 0 };
    for (line_no, line) in complete_lines(bytes, first_line) {
        consumed.bytes += line.len() as u64 + 1;
        consumed.lines += 1;

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let ev: Event = match serde_json::from_slice(line) {
            Ok(ev) => ev,
            Err(e) => {
                report.skipped.push(SkippedRecord {
                    line: line_no,
                    reason: format!("invalid JSONL event: {}", e),
                });
                continue;
            }
        };
        if report.last_seq > 0 && ev.seq <= report.last_seq {
            report.skipped.push(SkippedRecord {
                line: line_no,
                reason: format!("non-increasing seq {} after {}", ev.seq, report.last_seq),
            });
            continue;
        }
        report.absorb(registry, line_no, &ev);
    }
    consumed
}

fn read_log_bytes(path: &Path) -> Result<Option<Vec<u8>>, BoardError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BoardError::IoError(e)),
    }
}

/// Position of the last `\n` strictly before `end`.
fn rfind_newline(file: &mut File, end: u64) -> io::Result<Option<u64>> {
    let mut hi = end;
    let mut buf = vec![0u8; TAIL_CHUNK as usize];
    while hi > 0 {
        let lo = hi.saturating_sub(TAIL_CHUNK);
        let len = (hi - lo) as usize;
        file.seek(SeekFrom::Start(lo))?;
        file.read_exact(&mut buf[..len])?;
        if let Some(p) = buf[..len].iter().rposition(|b| *b == b'\n') {
            return Ok(Some(lo + p as u64));
        }
        hi = lo;
    }
    Ok(None)
}

/// Drops a trailing record without newline. It belongs to a writer that died
/// mid-append and was never acknowledged.
fn heal_torn_tail(file: &mut File, path: &Path) -> Result<(), BoardError> {
    let len = file.metadata().map_err(BoardError::IoError)?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .map_err(BoardError::IoError)?;
    file.read_exact(&mut last).map_err(BoardError::IoError)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    let keep = rfind_newline(file, len)
        .map_err(BoardError::IoError)?
        .map(|p| p + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "truncating torn record left by an interrupted append"
    );
    file.set_len(keep).map_err(BoardError::IoError)?;
    Ok(())
}

/// Sequence number of the last record. Falls back to a full scan when the
/// last line is not decodable.
fn last_sequence(file: &mut File, path: &Path) -> Result<u64, BoardError> {
    let len = file.metadata().map_err(BoardError::IoError)?.len();
    if len == 0 {
        return Ok(0);
    }
    let start = rfind_newline(file, len - 1)
        .map_err(BoardError::IoError)?
        .map(|p| p + 1)
        .unwrap_or(0);
    let mut tail = vec![0u8; (len - 1 - start) as usize];
    file.seek(SeekFrom::Start(start))
        .map_err(BoardError::IoError)?;
    file.read_exact(&mut tail).map_err(BoardError::IoError)?;
    if let Ok(ev) = serde_json::from_slice::<Event>(&tail) {
        return Ok(ev.seq);
    }

    warn!(path = %path.display(), "last record undecodable; scanning log for max seq");
    let bytes = fs::read(path).map_err(BoardError::IoError)?;
    Ok(complete_lines(&bytes, 1)
        .filter_map(|(_, line)| serde_json::from_slice::<Event>(line).ok())
        .map(|ev| ev.seq)
        .max()
        .unwrap_or(0))
}

/// Cross-process append lock. The OS drops it if the holder dies.
struct AppendLock {
    _lock: FileLock,
}

impl AppendLock {
    fn acquire(path: &Path, config: &BoardConfig) -> Result<Self, BoardError> {
        let Some(mut lock) = FileLock::acquire(path, config.append_timeout(), config.claim_poll())?
        else {
            let holder = fs::read_to_string(path).unwrap_or_default();
            let holder = holder.trim();
            return Err(BoardError::Blocked(BlockedError {
                resource: APPEND_LOCK_RESOURCE.to_string(),
                holder: if holder.is_empty() {
                    "unknown".to_string()
                } else {
                    holder.to_string()
                },
                expires_at_ms: 0,
            }));
        };

        // Holder identity is diagnostic only.
        let file = lock.file();
        file.set_len(0).map_err(BoardError::IoError)?;
        file.seek(SeekFrom::Start(0)).map_err(BoardError::IoError)?;
        if let Err(e) = write!(file, "pid:{}", std::process::id()) {
            debug!(path = %path.display(), error = %e, "could not record append lock holder");
        }
        Ok(Self { _lock: lock })
    }
}

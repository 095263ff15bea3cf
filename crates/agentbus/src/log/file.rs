use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{DurableLog, tail};
use crate::error::{LogCorruption, LogError};
use agentbus_protocol::Event;

const SEGMENT_PREFIX: &str = "events-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// Append-only, count-bounded event log stored as rotated JSONL segments.
///
/// Every record is one JSON object terminated by a newline. The active
/// segment holds at most `segment_events` records; once it is full a new
/// segment is opened and the oldest segments beyond the retention bound are
/// deleted. Readers only ever see the newest `max_events` valid records.
pub struct FileLog {
    dir: PathBuf,
    max_events: usize,
    segment_events: usize,
    fsync: bool,
    writer: Mutex<Writer>,
    corrupt_records: AtomicU64,
}

struct Writer {
    file: File,
    segment: u64,
    records: usize,
    /// A previous write failed midway and may have left a torn record.
    torn: bool,
}

impl FileLog {
    /// Open (or create) a log directory.
    ///
    /// A torn trailing record in the active segment is sealed with a newline
    /// so later appends start on a fresh line.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_events: usize,
        segment_events: usize,
    ) -> Result<Self, LogError> {
        let dir = dir.into();
        let max_events = max_events.max(1);
        let segment_events = segment_events.clamp(1, max_events);

        fs::create_dir_all(&dir).await?;

        let segment = list_segments(&dir).await?.last().copied().unwrap_or(1);
        let path = segment_path(&dir, segment);
        let records = seal_and_count(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            dir = %dir.display(),
            segment,
            records,
            max_events,
            segment_events,
            "file log opened"
        );

        Ok(Self {
            dir,
            max_events,
            segment_events,
            fsync: false,
            writer: Mutex::new(Writer {
                file,
                segment,
                records,
                torn: false,
            }),
            corrupt_records: AtomicU64::new(0),
        })
    }

    /// Sync file data to disk after every append.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of undecodable records skipped by reads so far.
    pub fn corrupt_records(&self) -> u64 {
        self.corrupt_records.load(Ordering::Relaxed)
    }

    fn max_segments(&self) -> u64 {
        (self.max_events.div_ceil(self.segment_events) + 1) as u64
    }

    async fn rotate(&self, writer: &mut Writer) -> Result<(), LogError> {
        let next = writer.segment + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, next))
            .await?;

        writer.file = file;
        writer.segment = next;
        writer.records = 0;
        writer.torn = false;
        debug!(segment = next, "rotated log segment");

        self.prune(next).await;
        Ok(())
    }

    /// Delete segments that fall outside the retention bound.
    async fn prune(&self, active: u64) {
        let segments = match list_segments(&self.dir).await {
            Ok(segments) => segments,
            Err(e) => {
                warn!(error = %e, "failed to list log segments for pruning");
                return;
            }
        };

        let keep = self.max_segments();
        for segment in segments.into_iter().filter(|s| s + keep <= active) {
            match fs::remove_file(segment_path(&self.dir, segment)).await {
                Ok(()) => debug!(segment, "pruned log segment"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(segment, error = %e, "failed to prune log segment"),
            }
        }
    }

    fn decode_segment(&self, segment: u64, bytes: &[u8], out: &mut Vec<Event>) {
        for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Event>(line) {
                Ok(event) => out.push(event),
                Err(e) => {
                    self.corrupt_records.fetch_add(1, Ordering::Relaxed);
                    let corruption = LogCorruption {
                        segment: segment_name(segment),
                        line: idx + 1,
                        reason: e.to_string(),
                    };
                    warn!(error = %corruption, "skipping corrupt log record");
                }
            }
        }
    }
}

#[async_trait]
impl DurableLog for FileLog {
    async fn append(&self, event: &Event) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.records >= self.segment_events {
            self.rotate(&mut writer).await?;
        }

        if writer.torn {
            writer.file.write_all(b"\n").await?;
            writer.torn = false;
        }

        if let Err(e) = writer.file.write_all(&line).await {
            writer.torn = true;
            return Err(e.into());
        }
        writer.file.flush().await?;
        if self.fsync {
            writer.file.sync_data().await?;
        }
        writer.records += 1;

        Ok(())
    }

    async fn recent(&self, limit: usize, kind: Option<&str>) -> Result<Vec<Event>, LogError> {
        // Holding the writer lock gives a snapshot as of this call.
        let _writer = self.writer.lock().await;

        let mut events = Vec::new();
        for segment in list_segments(&self.dir).await? {
            let bytes = match fs::read(segment_path(&self.dir, segment)).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            self.decode_segment(segment, &bytes, &mut events);
        }

        let overflow = events.len().saturating_sub(self.max_events);
        events.drain(..overflow);

        Ok(tail(events.into_iter(), limit, kind))
    }

    fn describe(&self) -> String {
        format!(
            "file({}, max_events={})",
            self.dir.display(),
            self.max_events
        )
    }
}

fn segment_name(segment: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment:08}{SEGMENT_SUFFIX}")
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(segment_name(segment))
}

/// Segment numbers present in `dir`, ascending.
async fn list_segments(dir: &Path) -> Result<Vec<u64>, LogError> {
    let mut entries = fs::read_dir(dir).await?;
    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let number = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(number) = number {
            segments.push(number);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Count records in an existing segment, terminating a torn final record.
async fn seal_and_count(path: &Path) -> Result<usize, LogError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    if bytes.last().is_some_and(|b| *b != b'\n') {
        warn!(segment = %path.display(), "sealing torn trailing record");
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
    }

    Ok(bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .count())
}

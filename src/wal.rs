//! Durable history of a `MemoryStore`.
//!
//! Every catalog change and every confirmed or cancelled reservation is
//! appended here as an [`Event`] before the caller sees success. Opening a
//! store replays the file in order to rebuild resources, their weekly
//! windows and the reservation book. Compaction replaces the history with a
//! snapshot of current state: one `ResourceCreated` per resource, its live
//! windows, and each reservation (a cancelled one as a confirm and cancel
//! pair). Removed windows and superseded bookable flips are gone afterwards.
//!
//! Each record on disk is `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

fn write_record(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Outcome of reading one record during replay.
enum Record {
    Event(Event),
    /// Clean end of file on a record boundary.
    End,
    /// A partial, corrupt or undecodable record. Nothing after it is trusted.
    Tail(&'static str),
}

/// Fills `buf`, or returns `false` if the file ends first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len = [0u8; 4];
    if !fill(reader, &mut len)? {
        return Ok(Record::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    if !fill(reader, &mut payload)? {
        return Ok(Record::Tail("truncated payload"));
    }
    let mut crc = [0u8; 4];
    if !fill(reader, &mut crc)? {
        return Ok(Record::Tail("truncated checksum"));
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Record::Tail("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Record::Event(event),
        Err(_) => Record::Tail("undecodable event"),
    })
}

/// Append handle on the schedule log. Owned by the store's writer task,
/// which batches appends and fsyncs once per batch.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(open_for_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffers one event. Not durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a live-state snapshot next to the log at `path`. The log itself
    /// is untouched until [`Wal::swap_compact_file`].
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(snapshot_path(path))?);
        for event in snapshot {
            write_record(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Replaces the log with the snapshot and resumes appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(snapshot_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(open_for_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    /// Events appended since open or the last compaction; the compactor's trigger.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Reads the schedule history at `path`. A missing file is an empty
    /// schedule. Replay keeps every record before the first damaged one, so a
    /// write cut short by a crash loses only that write.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Tail(reason) => {
                    tracing::warn!(
                        log = %path.display(),
                        kept = events.len(),
                        "schedule log ends in a damaged record ({reason}), dropping it"
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}

fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn snapshot_path(log: &Path) -> PathBuf {
    log.with_extension("wal.snapshot")
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: length prefix + CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the
/// number of bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(FRAME_OVERHEAD + u64::from(len))
}

/// The file the log appends to.
trait LogFile: Write + Send {
    fn sync(&self) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Stands in while a failed batch is being rolled back.
impl LogFile for io::Sink {
    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

fn log_writer(file: impl LogFile + 'static) -> BufWriter<Box<dyn LogFile>> {
    let file: Box<dyn LogFile> = Box::new(file);
    BufWriter::new(file)
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
    /// True if bytes after the valid prefix were discarded.
    pub torn_tail: bool,
}

/// Append-only write-ahead log of ledger events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail (crash mid-write) is cut off on open, so entries
/// appended afterwards stay reachable on the next replay. A batch that fails
/// is cut off the same way before anything else is appended.
pub struct Wal {
    writer: BufWriter<Box<dyn LogFile>>,
    path: PathBuf,
    /// Byte length of the acknowledged prefix.
    len: u64,
    /// Set while the file may hold bytes of a failed batch.
    needs_rollback: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, truncate any torn tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.torn_tail {
            tracing::warn!(
                "wal {}: discarding torn tail after byte {}",
                path.display(),
                replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let wal = Self {
            writer: log_writer(file),
            path: path.to_path_buf(),
            len: replay.valid_len,
            needs_rollback: false,
            appends_since_compact: 0,
        };
        Ok((wal, replay.events))
    }

    /// Encode a batch, flush, and fsync once for all of it. On failure the
    /// batch is removed from both the buffer and the file.
    pub fn append_batch(&mut self, events: &[Event]) -> io::Result<()> {
        if self.needs_rollback {
            self.rollback()?;
        }
        match self.write_batch(events) {
            Ok(written) => {
                self.len += written;
                self.appends_since_compact += events.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    tracing::error!(
                        "wal {}: cannot roll back failed batch: {rollback}",
                        self.path.display()
                    );
                }
                Err(e)
            }
        }
    }

    fn write_batch(&mut self, events: &[Event]) -> io::Result<u64> {
        let mut written = 0;
        for event in events {
            written += encode_event(&mut self.writer, event)?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync()?;
        Ok(written)
    }

    /// Drop buffered bytes unwritten and cut the file back to `len`.
    fn rollback(&mut self) -> io::Result<()> {
        self.needs_rollback = true;
        let stale = std::mem::replace(&mut self.writer, log_writer(io::sink()));
        let (_, _unwritten) = stale.into_parts();

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.len)?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = log_writer(file);
        self.needs_rollback = false;
        tracing::warn!("wal {}: rolled back to byte {}", self.path.display(), self.len);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut len = 0;
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for event in events {
                len += encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, log_writer(file));
        let (_, _unwritten) = stale.into_parts();
        self.len = len;
        self.needs_rollback = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid event. Stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as u64;
            if replay.valid_len + FRAME_OVERHEAD + len > file_len {
                break; // truncated
            }

            let mut payload = vec![0u8; len as usize];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => break,
            }
            replay.valid_len += FRAME_OVERHEAD + len;
        }

        replay.torn_tail = replay.valid_len < file_len;
        Ok(replay)
    }
}

/// `Ok(false)` on a clean or partial EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

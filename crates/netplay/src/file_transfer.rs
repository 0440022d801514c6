//! Chunked, resumable delivery of maps and mods over the control channel.
//!
//! The same [`Transfers`] table serves both ends. On the host it holds the
//! files being sent to one player; on a client it holds the files that
//! player is receiving. A [`WzFile`] owns its open handle, and the handle is
//! released as soon as the transfer completes or is cancelled.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::codec::MAX_MSG_SIZE;
use crate::messages::{FileRequest, FilePayload, PlayerIndex};

/// Largest chunk that still fits an envelope with room for the record header.
pub const MAX_CHUNK_SIZE: usize = 8192;

/// Kind of file being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// A map archive.
    Map,
    /// A mod archive.
    Mod,
    /// Anything else.
    Other,
}

/// Reason a sender aborted a transfer, carried in NET_FILE_CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFault {
    /// The requester already has the file.
    AlreadyHaveFile,
    /// The requester asked again for a range it already received.
    StuckInFileLoop,
    /// The sender cannot provide the file.
    Unavailable,
}

/// File transfer failures.
#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    /// The file is already present or already in flight.
    #[error("already have file {0}")]
    AlreadyHaveFile(String),

    /// The same range was requested again after it completed.
    #[error("stuck in file loop: {file_id} re-requested from offset {offset}")]
    StuckInFileLoop {
        /// File identifier.
        file_id: String,
        /// Offset of the repeated request.
        offset: u64,
    },

    /// The sender does not have the file.
    #[error("file {0} unavailable")]
    Unavailable(String),

    /// A resume offset lies beyond the end of the file.
    #[error("offset {offset} beyond end of {file_id} ({size} bytes)")]
    InvalidOffset {
        /// File identifier.
        file_id: String,
        /// Requested offset.
        offset: u64,
        /// File size.
        size: u64,
    },

    /// Sizes and offsets travel as 32-bit fields.
    #[error("{file_id} is {size} bytes, too large to transfer")]
    TooLarge {
        /// File identifier.
        file_id: String,
        /// File or partial size.
        size: u64,
    },

    /// A chunk did not start where the previous one ended.
    #[error("chunk for {file_id} at {got}, expected {expected}")]
    OutOfOrderChunk {
        /// File identifier.
        file_id: String,
        /// Next expected offset.
        expected: u64,
        /// Offset received.
        got: u64,
    },

    /// No transfer with this identifier is in flight.
    #[error("no transfer in flight for {0}")]
    UnknownTransfer(String),

    /// A compressed chunk could not be expanded.
    #[error("corrupt chunk: {0}")]
    Corrupt(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FileTransferError {
    /// Fault code to report to the peer, if this error ends the transfer.
    pub fn fault(&self) -> Option<FileFault> {
        match self {
            Self::AlreadyHaveFile(_) => Some(FileFault::AlreadyHaveFile),
            Self::StuckInFileLoop { .. } => Some(FileFault::StuckInFileLoop),
            Self::Unavailable(_)
            | Self::InvalidOffset { .. }
            | Self::TooLarge { .. }
            | Self::Io(_) => {
                Some(FileFault::Unavailable)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// A readable, seekable byte source.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Filesystem-like store for complete and partially received files.
pub trait FileStore {
    /// Whether a complete copy of `file_id` exists.
    fn contains(&self, file_id: &str) -> bool;

    /// Open a complete file for reading. Returns the handle and its size.
    fn open(&mut self, file_id: &str) -> io::Result<(Box<dyn ReadSeek>, u64)>;

    /// Bytes already received for `file_id`, zero if none.
    fn partial_len(&self, file_id: &str) -> u64;

    /// Open the partial file for appending, creating it if needed.
    fn create_partial(&mut self, file_id: &str) -> io::Result<Box<dyn Write>>;

    /// Promote the partial file to a complete one.
    fn commit(&mut self, file_id: &str) -> io::Result<()>;

    /// Delete the partial file.
    fn discard(&mut self, file_id: &str) -> io::Result<()>;
}

/// [`FileStore`] rooted in a directory. Partial files carry a `.part` suffix.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store files under `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn complete_path(&self, file_id: &str) -> PathBuf {
        self.root.join(sanitize(file_id))
    }

    fn partial_path(&self, file_id: &str) -> PathBuf {
        self.root.join(format!("{}.part", sanitize(file_id)))
    }
}

/// Flatten a peer-supplied identifier into a single safe file name.
fn sanitize(file_id: &str) -> String {
    let name: String = file_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        format!("_{name}")
    } else {
        name
    }
}

impl FileStore for DirectoryStore {
    fn contains(&self, file_id: &str) -> bool {
        self.complete_path(file_id).is_file()
    }

    fn open(&mut self, file_id: &str) -> io::Result<(Box<dyn ReadSeek>, u64)> {
        let file = File::open(self.complete_path(file_id))?;
        let size = file.metadata()?.len();
        Ok((Box::new(file), size))
    }

    fn partial_len(&self, file_id: &str) -> u64 {
        fs::metadata(self.partial_path(file_id)).map_or(0, |m| m.len())
    }

    fn create_partial(&mut self, file_id: &str) -> io::Result<Box<dyn Write>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partial_path(file_id))?;
        Ok(Box::new(file))
    }

    fn commit(&mut self, file_id: &str) -> io::Result<()> {
        fs::rename(self.partial_path(file_id), self.complete_path(file_id))
    }

    fn discard(&mut self, file_id: &str) -> io::Result<()> {
        match fs::remove_file(self.partial_path(file_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    complete: HashMap<String, Vec<u8>>,
    partial: HashMap<String, Rc<RefCell<Vec<u8>>>>,
}

struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a complete file.
    pub fn insert(&mut self, file_id: &str, data: Vec<u8>) {
        self.complete.insert(file_id.to_string(), data);
    }

    /// Contents of a complete file.
    pub fn get(&self, file_id: &str) -> Option<&[u8]> {
        self.complete.get(file_id).map(Vec::as_slice)
    }
}

impl FileStore for MemoryStore {
    fn contains(&self, file_id: &str) -> bool {
        self.complete.contains_key(file_id)
    }

    fn open(&mut self, file_id: &str) -> io::Result<(Box<dyn ReadSeek>, u64)> {
        let data = self
            .complete
            .get(file_id)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }

    fn partial_len(&self, file_id: &str) -> u64 {
        self.partial
            .get(file_id)
            .map_or(0, |buf| buf.borrow().len() as u64)
    }

    fn create_partial(&mut self, file_id: &str) -> io::Result<Box<dyn Write>> {
        let buf = self.partial.entry(file_id.to_string()).or_default().clone();
        Ok(Box::new(SharedBuf(buf)))
    }

    fn commit(&mut self, file_id: &str) -> io::Result<()> {
        let buf = self
            .partial
            .remove(file_id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let data = buf.borrow().clone();
        self.complete.insert(file_id.to_string(), data);
        Ok(())
    }

    fn discard(&mut self, file_id: &str) -> io::Result<()> {
        self.partial.remove(file_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transfer state
// ---------------------------------------------------------------------------

enum FileHandle {
    Read(Box<dyn ReadSeek>),
    Write(Box<dyn Write>),
    Released,
}

/// One file in flight between two machines.
pub struct WzFile {
    pub file_id: String,
    pub file_type: FileType,
    /// Total size; zero on the receiving side until the first chunk arrives.
    pub file_size: u64,
    /// Next byte to send or receive.
    pub curr_pos: u64,
    pub is_sending: bool,
    pub is_cancelled: bool,
    start_offset: u64,
    handle: FileHandle,
}

impl fmt::Debug for WzFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WzFile")
            .field("file_id", &self.file_id)
            .field("file_type", &self.file_type)
            .field("file_size", &self.file_size)
            .field("curr_pos", &self.curr_pos)
            .field("is_sending", &self.is_sending)
            .field("is_cancelled", &self.is_cancelled)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WzFile {
    /// Whether the file handle is still held.
    pub fn is_open(&self) -> bool {
        !matches!(self.handle, FileHandle::Released)
    }

    /// Percentage complete, 0..=100.
    pub fn percent_done(&self) -> u8 {
        if self.file_size == 0 {
            return 0;
        }
        (self.curr_pos.min(self.file_size) * 100 / self.file_size) as u8
    }

    fn release(&mut self) {
        if let FileHandle::Write(w) = &mut self.handle {
            if let Err(e) = w.flush() {
                tracing::warn!("Flushing {} failed: {e}", self.file_id);
            }
        }
        self.handle = FileHandle::Released;
    }
}

impl Drop for WzFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Progress report for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Player on the other end of the transfer.
    pub player: PlayerIndex,
    pub file_id: String,
    /// Percentage complete.
    pub done: u8,
    /// Bytes moved so far.
    pub byte_count: u64,
}

/// Output of the sending pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A chunk to transmit.
    Chunk(FilePayload),
    /// The transfer died; tell the receiver why.
    Aborted {
        /// File identifier.
        file_id: String,
        /// Reason.
        fault: FileFault,
    },
}

/// Transfers owned by one player record.
#[derive(Debug, Default)]
pub struct Transfers {
    active: BTreeMap<String, WzFile>,
    completed_ranges: HashSet<(String, u64)>,
}

impl Transfers {
    /// Number of transfers in flight.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Look up a transfer.
    pub fn get(&self, file_id: &str) -> Option<&WzFile> {
        self.active.get(file_id)
    }

    /// Progress of every transfer, tagged with `player`.
    pub fn status(&self, player: PlayerIndex) -> Vec<FileStatus> {
        self.active
            .values()
            .map(|f| FileStatus {
                player,
                file_id: f.file_id.clone(),
                done: f.percent_done(),
                byte_count: f.curr_pos,
            })
            .collect()
    }

    // -- receiving side ----------------------------------------------------

    /// Start receiving `file_id`, resuming from any partial copy.
    pub fn request(
        &mut self,
        store: &mut dyn FileStore,
        file_id: &str,
        file_type: FileType,
    ) -> Result<FileRequest, FileTransferError> {
        if store.contains(file_id) || self.active.contains_key(file_id) {
            return Err(FileTransferError::AlreadyHaveFile(file_id.to_string()));
        }
        let offset = store.partial_len(file_id);
        let wire_offset = wire_u32(file_id, offset)?;
        let writer = store.create_partial(file_id)?;
        self.active.insert(
            file_id.to_string(),
            WzFile {
                file_id: file_id.to_string(),
                file_type,
                file_size: 0,
                curr_pos: offset,
                is_sending: false,
                is_cancelled: false,
                start_offset: offset,
                handle: FileHandle::Write(writer),
            },
        );
        tracing::info!("Requesting {file_id} from offset {offset}");
        Ok(FileRequest {
            file_id: file_id.to_string(),
            file_type,
            offset: wire_offset,
        })
    }

    /// Apply a received chunk. Returns `true` when the file is complete.
    pub fn receive_chunk(
        &mut self,
        store: &mut dyn FileStore,
        chunk: &FilePayload,
    ) -> Result<bool, FileTransferError> {
        let file = self
            .active
            .get_mut(&chunk.file_id)
            .ok_or_else(|| FileTransferError::UnknownTransfer(chunk.file_id.clone()))?;
        if file.is_sending {
            return Err(FileTransferError::UnknownTransfer(chunk.file_id.clone()));
        }
        let offset = u64::from(chunk.offset);
        if offset != file.curr_pos {
            return Err(FileTransferError::OutOfOrderChunk {
                file_id: chunk.file_id.clone(),
                expected: file.curr_pos,
                got: offset,
            });
        }

        let data = if chunk.compressed {
            decompress_chunk(&chunk.data)?
        } else {
            chunk.data.clone()
        };
        if let FileHandle::Write(w) = &mut file.handle {
            w.write_all(&data)?;
        }
        file.file_size = u64::from(chunk.file_size);
        file.curr_pos += data.len() as u64;

        if file.curr_pos < file.file_size {
            return Ok(false);
        }
        if let Some(mut done) = self.active.remove(&chunk.file_id) {
            done.release();
        }
        store.commit(&chunk.file_id)?;
        tracing::info!("Received {} ({} bytes)", chunk.file_id, chunk.file_size);
        Ok(true)
    }

    // -- sending side ------------------------------------------------------

    /// Accept a request from the receiver.
    ///
    /// Returns `false` for a duplicate of a transfer already in flight.
    pub fn accept_request(
        &mut self,
        store: &mut dyn FileStore,
        request: &FileRequest,
    ) -> Result<bool, FileTransferError> {
        let offset = u64::from(request.offset);
        if self
            .active
            .get(&request.file_id)
            .is_some_and(|f| f.is_sending)
        {
            tracing::debug!("Ignoring duplicate request for {}", request.file_id);
            return Ok(false);
        }
        if self
            .completed_ranges
            .contains(&(request.file_id.clone(), offset))
        {
            return Err(FileTransferError::StuckInFileLoop {
                file_id: request.file_id.clone(),
                offset,
            });
        }
        if !store.contains(&request.file_id) {
            return Err(FileTransferError::Unavailable(request.file_id.clone()));
        }

        let (mut reader, size) = store.open(&request.file_id)?;
        wire_u32(&request.file_id, size)?;
        if offset > size {
            return Err(FileTransferError::InvalidOffset {
                file_id: request.file_id.clone(),
                offset,
                size,
            });
        }
        reader.seek(SeekFrom::Start(offset))?;
        self.active.insert(
            request.file_id.clone(),
            WzFile {
                file_id: request.file_id.clone(),
                file_type: request.file_type,
                file_size: size,
                curr_pos: offset,
                is_sending: true,
                is_cancelled: false,
                start_offset: offset,
                handle: FileHandle::Read(reader),
            },
        );
        tracing::info!("Sending {} from offset {offset} ({size} bytes)", request.file_id);
        Ok(true)
    }

    /// Read up to `max_chunks` chunks of at most `chunk_size` bytes.
    pub fn next_chunks(&mut self, chunk_size: usize, max_chunks: usize) -> Vec<Outgoing> {
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let mut out = Vec::new();
        let mut finished = Vec::new();

        for file in self.active.values_mut().filter(|f| f.is_sending) {
            let mut done = false;
            while out.len() < max_chunks {
                match read_chunk(file, chunk_size) {
                    Ok(chunk) => out.push(Outgoing::Chunk(chunk)),
                    Err(e) => {
                        tracing::warn!("Reading {} failed: {e}", file.file_id);
                        out.push(Outgoing::Aborted {
                            file_id: file.file_id.clone(),
                            fault: FileFault::Unavailable,
                        });
                        file.is_cancelled = true;
                        done = true;
                        break;
                    }
                }
                if file.curr_pos >= file.file_size {
                    done = true;
                    break;
                }
            }
            if done {
                finished.push(file.file_id.clone());
            }
        }

        for file_id in finished {
            if let Some(mut file) = self.active.remove(&file_id) {
                file.release();
                if !file.is_cancelled {
                    self.completed_ranges.insert((file_id, file.start_offset));
                }
            }
        }
        out
    }

    // -- both sides --------------------------------------------------------

    /// Stop a transfer and release its handle.
    pub fn cancel(&mut self, file_id: &str) -> Option<WzFile> {
        let mut file = self.active.remove(file_id)?;
        file.is_cancelled = true;
        file.release();
        Some(file)
    }

    /// Cancel everything, e.g. when the player leaves.
    pub fn cancel_all(&mut self) -> Vec<WzFile> {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        ids.iter().filter_map(|id| self.cancel(id)).collect()
    }
}

fn read_chunk(file: &mut WzFile, chunk_size: usize) -> Result<FilePayload, FileTransferError> {
    let FileHandle::Read(reader) = &mut file.handle else {
        return Err(FileTransferError::UnknownTransfer(file.file_id.clone()));
    };
    let remaining = file.file_size - file.curr_pos;
    let mut data = vec![0u8; remaining.min(chunk_size as u64) as usize];
    reader.read_exact(&mut data)?;

    let offset = wire_u32(&file.file_id, file.curr_pos)?;
    let file_size = wire_u32(&file.file_id, file.file_size)?;
    file.curr_pos += data.len() as u64;

    let packed = lz4_flex::compress_prepend_size(&data);
    let (compressed, data) = if packed.len() < data.len() {
        (true, packed)
    } else {
        (false, data)
    };
    Ok(FilePayload {
        file_id: file.file_id.clone(),
        file_type: file.file_type,
        file_size,
        offset,
        compressed,
        data,
    })
}

fn wire_u32(file_id: &str, value: u64) -> Result<u32, FileTransferError> {
    u32::try_from(value).map_err(|_| FileTransferError::TooLarge {
        file_id: file_id.to_string(),
        size: value,
    })
}

fn decompress_chunk(data: &[u8]) -> Result<Vec<u8>, FileTransferError> {
    let claimed = data
        .get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| FileTransferError::Corrupt("missing size prefix".to_string()))?;
    if claimed > MAX_MSG_SIZE {
        return Err(FileTransferError::Corrupt(format!(
            "chunk claims {claimed} bytes"
        )));
    }
    lz4_flex::decompress_size_prepended(data).map_err(|e| FileTransferError::Corrupt(e.to_string()))
}

//! Journal segment file and frame format.
//!
//! Segments are named `journal-NNNNNN.seg` where `NNNNNN` is a zero-padded segment id.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Frame 1                            │
//! ├────────────────────────────────────┤
//! │ Frame 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┐
//! │ Length (4 bytes)│ CRC32 (4 bytes)  │ Payload (Length bytes)  │
//! └─────────────────┴──────────────────┴─────────────────────────┘
//! ```

use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Magic bytes identifying a journal segment file: "BSJN"
pub const SEGMENT_MAGIC: [u8; 4] = *b"BSJN";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Segment header size in bytes
pub const SEGMENT_HEADER_SIZE: u64 = 32;

/// Frame header size in bytes (length + crc)
pub const FRAME_HEADER_SIZE: u64 = 8;

const SEGMENT_PREFIX: &str = "journal-";
const SEGMENT_SUFFIX: &str = ".seg";

/// Segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "BSJN"
    pub magic: [u8; 4],
    /// Format version for forward compatibility
    pub format_version: u32,
    /// Segment id (monotonically increasing)
    pub segment_id: u32,
    /// Creation time in microseconds since the epoch
    pub created_micros: u64,
}

impl SegmentHeader {
    /// Create a header stamped with the current time.
    pub fn new(segment_id: u32) -> Self {
        let created_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_id,
            created_micros,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.segment_id.to_le_bytes());
        // 12..16 reserved
        bytes[16..24].copy_from_slice(&self.created_micros.to_le_bytes());
        // 24..32 reserved
        bytes
    }

    /// Deserialize header from bytes. Returns `None` if the magic is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE as usize {
            return None;
        }
        let header = SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            segment_id: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            created_micros: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
        };
        (header.magic == SEGMENT_MAGIC).then_some(header)
    }
}

/// Path of segment `segment_id` inside `dir`.
pub fn segment_path(dir: &Path, segment_id: u32) -> PathBuf {
    dir.join(format!("{}{:06}{}", SEGMENT_PREFIX, segment_id, SEGMENT_SUFFIX))
}

/// List all segment ids in `dir`, in ascending order.
pub fn list_segment_ids(dir: &Path) -> std::io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(num) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(id) = num.parse::<u32>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Encode a payload into a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Why a segment scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Every byte after the header belongs to a valid frame
    EndOfData,
    /// A frame header or payload runs past the end of the file
    PartialFrame,
    /// A complete frame failed its checksum
    ChecksumMismatch,
}

/// Result of validating a segment's frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    /// Number of valid frames
    pub frames: usize,
    /// Offset just past the last valid frame
    pub valid_end: u64,
    /// Offset of the last valid frame, if any
    pub last_frame: Option<u64>,
    /// Why the scan stopped
    pub stop: ScanStop,
}

/// Validate the frames of a whole segment image (header included).
pub fn scan_frames(data: &[u8]) -> ScanResult {
    let mut pos = SEGMENT_HEADER_SIZE as usize;
    let mut frames = 0;
    let mut last_frame = None;
    let stop = loop {
        if pos == data.len() {
            break ScanStop::EndOfData;
        }
        if pos + FRAME_HEADER_SIZE as usize > data.len() {
            break ScanStop::PartialFrame;
        }
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let expected = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let start = pos + FRAME_HEADER_SIZE as usize;
        let end = start + len as usize;
        if end > data.len() {
            break ScanStop::PartialFrame;
        }
        if crc(&data[start..end]) != expected {
            break ScanStop::ChecksumMismatch;
        }
        frames += 1;
        last_frame = Some(pos as u64);
        pos = end;
    };
    ScanResult {
        frames,
        valid_end: pos as u64,
        last_frame,
        stop,
    }
}

/// Frame-level read failure.
#[derive(Debug)]
pub enum FrameError {
    /// Underlying I/O error
    Io(std::io::Error),
    /// Frame does not fit inside the segment's valid length
    OutOfBounds,
    /// Checksum mismatch
    Checksum,
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read the payload length of the frame at `offset`.
pub fn read_frame_len(file: &mut File, offset: u64, valid_len: u64) -> Result<u64, FrameError> {
    if offset < SEGMENT_HEADER_SIZE || offset + FRAME_HEADER_SIZE > valid_len {
        return Err(FrameError::OutOfBounds);
    }
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
    if offset + FRAME_HEADER_SIZE + len > valid_len {
        return Err(FrameError::OutOfBounds);
    }
    Ok(len)
}

/// Read and verify the payload of the frame at `offset`.
pub fn read_frame(file: &mut File, offset: u64, valid_len: u64) -> Result<Vec<u8>, FrameError> {
    let len = read_frame_len(file, offset, valid_len)?;
    let mut crc_bytes = [0u8; 4];
    file.seek(SeekFrom::Start(offset + 4))?;
    file.read_exact(&mut crc_bytes)?;
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    if crc(&payload) != u32::from_le_bytes(crc_bytes) {
        return Err(FrameError::Checksum);
    }
    Ok(payload)
}

/// Writable journal segment.
///
/// Only the active segment is open for writing; rotated segments are
/// immutable and are only ever read or deleted.
pub struct SegmentFile {
    file: File,
    segment_id: u32,
    len: u64,
    /// A failed write left bytes past `len` that could not be cut off.
    broken: bool,
}

impl SegmentFile {
    /// Create a new segment and write its header.
    ///
    /// Fails if the file already exists.
    pub fn create(dir: &Path, segment_id: u32) -> std::io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        file.write_all(&SegmentHeader::new(segment_id).to_bytes())?;
        file.sync_all()?;
        Ok(SegmentFile {
            file,
            segment_id,
            len: SEGMENT_HEADER_SIZE,
            broken: false,
        })
    }

    /// Open an existing segment for appending at `valid_len`.
    ///
    /// Bytes past `valid_len` (a torn tail) are truncated.
    pub fn open_append(dir: &Path, segment_id: u32, valid_len: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        Ok(SegmentFile {
            file,
            segment_id,
            len: valid_len,
            broken: false,
        })
    }

    /// Segment id.
    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// Current length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the segment holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len <= SEGMENT_HEADER_SIZE
    }

    /// Append an encoded frame; returns its offset.
    ///
    /// A failed write is cut back off the file so the next frame starts at
    /// a clean boundary. If that cut fails too the segment is broken and
    /// refuses every later write.
    pub fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<u64> {
        if self.broken {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "segment {} holds a partial frame at offset {}",
                    self.segment_id, self.len
                ),
            ));
        }
        let offset = self.len;
        if let Err(e) = self.file.write_all(frame) {
            let restored = self
                .file
                .set_len(offset)
                .and_then(|()| self.file.seek(SeekFrom::Start(offset)).map(|_| ()));
            if let Err(cut) = restored {
                warn!(
                    target: "brokerstore::journal",
                    segment_id = self.segment_id,
                    offset,
                    error = %cut,
                    "Could not cut back failed write; segment is broken"
                );
                self.broken = true;
            }
            return Err(e);
        }
        self.len += frame.len() as u64;
        Ok(offset)
    }

    /// Whether a failed write left the segment unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sync segment data to disk.
    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Duplicate the handle so another thread can fsync without the writer lock.
    pub fn sync_handle(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }
}

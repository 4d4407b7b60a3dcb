//! Page format of the index file.
//!
//! The index file is an array of fixed-size pages. Page `n` lives at byte
//! offset `n * PAGE_SIZE`.
//!
//! # Page Layout
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────┬──────────┬──────────┬────────────────────┐
//! │ Kind (1) │ Rsvd (3) │ Len (4)  │ Next (8)  │ CRC (4)  │ Rsvd (4) │ Payload (4072)     │
//! └──────────┴──────────┴──────────┴───────────┴──────────┴──────────┴────────────────────┘
//! ```
//!
//! An entity larger than one payload spills into a chain: a `Data` head
//! page followed by `Overflow` pages linked through `next`. The CRC covers
//! the first 16 header bytes and the used part of the payload. An all-zero
//! page is a valid `Free` page.

use crc32fast::Hasher;

/// Page identifier (index into the page array).
pub type PageId = u64;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Page header size in bytes
pub const PAGE_HEADER_SIZE: usize = 24;

/// Payload bytes available per page
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// `next` value marking the end of a chain
pub const NO_PAGE: PageId = u64::MAX;

/// Kind of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// Unused, available for allocation
    Free = 0,
    /// Head of an entity chain
    Data = 1,
    /// Continuation of an entity chain
    Overflow = 2,
}

impl PageKind {
    /// Decode from the header byte.
    pub fn from_byte(b: u8) -> Option<PageKind> {
        match b {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::Data),
            2 => Some(PageKind::Overflow),
            _ => None,
        }
    }
}

/// Decoded page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page kind
    pub kind: PageKind,
    /// Used payload bytes
    pub len: u32,
    /// Next page of the chain, [`NO_PAGE`] at the end
    pub next: PageId,
}

/// Why a page image was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFault {
    /// Kind byte not recognised
    UnknownKind(u8),
    /// Length larger than the payload area
    BadLength(u32),
    /// Checksum mismatch
    Checksum,
}

/// Build a page image.
///
/// `payload` must fit in [`PAGE_PAYLOAD_SIZE`].
pub fn encode_page(kind: PageKind, next: PageId, payload: &[u8]) -> Box<[u8]> {
    debug_assert!(payload.len() <= PAGE_PAYLOAD_SIZE);
    let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
    if kind == PageKind::Free {
        return page;
    }
    page[0] = kind as u8;
    page[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    page[8..16].copy_from_slice(&next.to_le_bytes());
    page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let crc = page_crc(&page, payload.len());
    page[16..20].copy_from_slice(&crc.to_le_bytes());
    page
}

/// A fresh zeroed (free) page image.
pub fn free_page() -> Box<[u8]> {
    vec![0u8; PAGE_SIZE].into_boxed_slice()
}

/// Read only the kind byte, without verifying the page.
pub fn peek_kind(page: &[u8]) -> Option<PageKind> {
    page.first().copied().and_then(PageKind::from_byte)
}

/// Decode and verify a page image, returning its header and payload.
pub fn decode_page(page: &[u8]) -> Result<(PageHeader, &[u8]), PageFault> {
    let kind = PageKind::from_byte(page[0]).ok_or(PageFault::UnknownKind(page[0]))?;
    if kind == PageKind::Free {
        return Ok((
            PageHeader {
                kind,
                len: 0,
                next: NO_PAGE,
            },
            &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE],
        ));
    }
    let len = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
    if len as usize > PAGE_PAYLOAD_SIZE {
        return Err(PageFault::BadLength(len));
    }
    let mut next_bytes = [0u8; 8];
    next_bytes.copy_from_slice(&page[8..16]);
    let stored = u32::from_le_bytes([page[16], page[17], page[18], page[19]]);
    if page_crc(page, len as usize) != stored {
        return Err(PageFault::Checksum);
    }
    Ok((
        PageHeader {
            kind,
            len,
            next: u64::from_le_bytes(next_bytes),
        },
        &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len as usize],
    ))
}

fn page_crc(page: &[u8], len: usize) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page[0..16]);
    hasher.update(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len]);
    hasher.finalize()
}

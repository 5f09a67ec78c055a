//! Minimal MP4 box scanner used to split an encoder's fragmented-MP4 byte
//! stream into an `ftyp+moov` init segment and the media bytes that follow.
//! Follows the ISO/IEC 14496-12 box layout (32-bit size, 4-byte type,
//! optional 64-bit extended size) — no full parse of box contents, just
//! enough to know where `moov` ends.

use bytes::{Bytes, BytesMut};

use crate::error::PublisherError;

/// No single `ftyp`/`moov` box in a live fragment stream should ever
/// approach this; a header declaring more is corrupt input rather than a
/// box we just haven't fully received yet.
const MAX_INIT_BOX_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// Total box size including the header, in bytes.
    pub total_len: u64,
    pub header_len: u64,
}

/// Reads one box header from the front of `buf`, if a complete header is
/// present. Does not consume `buf`.
pub fn peek_header(buf: &[u8]) -> Option<BoxHeader> {
    if buf.len() < 8 {
        return None;
    }
    let small_size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as u64;
    let box_type: [u8; 4] = buf[4..8].try_into().unwrap();

    if small_size == 1 {
        if buf.len() < 16 {
            return None;
        }
        let large_size = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Some(BoxHeader {
            box_type,
            total_len: large_size,
            header_len: 16,
        })
    } else {
        // size == 0 ("to EOF") is not expected for a live fragment stream;
        // treat it as unparseable rather than guessing a length.
        if small_size < 8 {
            return None;
        }
        Some(BoxHeader {
            box_type,
            total_len: small_size,
            header_len: 8,
        })
    }
}

/// Accumulates `ftyp`/`moov` bytes from a live encoder byte stream until the
/// init segment (everything through the end of `moov`) is complete.
#[derive(Default)]
pub struct InitSegmentCollector {
    pending: BytesMut,
    init: BytesMut,
    ready: bool,
}

impl InitSegmentCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns the captured init segment once `moov` has fully arrived.
    pub fn init_segment(&self) -> Option<Bytes> {
        self.ready.then(|| self.init.clone().freeze())
    }

    /// Feed newly read bytes. While not yet ready, returns `None` (bytes are
    /// being held for the init segment or awaiting more of the current box).
    /// Once ready, any trailing bytes beyond `moov` are returned as media.
    /// Errors if a header declares an implausible box length — a corrupt
    /// stream would otherwise stall here forever waiting for bytes that
    /// never arrive.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, PublisherError> {
        if self.ready {
            return Ok(Some(Bytes::copy_from_slice(chunk)));
        }

        self.pending.extend_from_slice(chunk);
        loop {
            let Some(header) = peek_header(&self.pending) else {
                return Ok(None);
            };
            if header.total_len > MAX_INIT_BOX_LEN {
                return Err(PublisherError::MalformedBoxStream(format!(
                    "box {:?} declares {} bytes, exceeding the {} byte init segment cap",
                    String::from_utf8_lossy(&header.box_type),
                    header.total_len,
                    MAX_INIT_BOX_LEN
                )));
            }
            if (self.pending.len() as u64) < header.total_len {
                return Ok(None); // wait for the rest of this box
            }
            let box_bytes = self.pending.split_to(header.total_len as usize);
            let is_moov = &header.box_type == b"moov";
            self.init.extend_from_slice(&box_bytes);
            if is_moov {
                self.ready = true;
                let trailing = self.pending.split().freeze();
                return Ok(if trailing.is_empty() { None } else { Some(trailing) });
            }
            // ftyp, free, or any other leading box: keep scanning.
            if self.pending.is_empty() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], payload_len: usize) -> Vec<u8> {
        let total = 8 + payload_len;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend(std::iter::repeat(0u8).take(payload_len));
        out
    }

    #[test]
    fn peek_header_reads_standard_size() {
        let bytes = make_box(b"ftyp", 12);
        let header = peek_header(&bytes).unwrap();
        assert_eq!(&header.box_type, b"ftyp");
        assert_eq!(header.total_len, 20);
        assert_eq!(header.header_len, 8);
    }

    #[test]
    fn peek_header_reads_extended_size() {
        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(b"moov");
        bytes.extend_from_slice(&(24u64).to_be_bytes());
        bytes.extend(std::iter::repeat(0u8).take(16));
        let header = peek_header(&bytes).unwrap();
        assert_eq!(&header.box_type, b"moov");
        assert_eq!(header.total_len, 24);
        assert_eq!(header.header_len, 16);
    }

    #[test]
    fn collector_becomes_ready_after_moov_and_returns_trailing_media() {
        let mut collector = InitSegmentCollector::new();
        let mut stream = make_box(b"ftyp", 4);
        stream.extend(make_box(b"moov", 8));
        stream.extend_from_slice(b"MEDIADATA");

        let trailing = collector.feed(&stream).unwrap();
        assert!(collector.is_ready());
        assert_eq!(trailing.unwrap(), Bytes::from_static(b"MEDIADATA"));
        assert_eq!(collector.init_segment().unwrap().len(), 20);
    }

    #[test]
    fn collector_waits_for_incomplete_box() {
        let mut collector = InitSegmentCollector::new();
        let full = make_box(b"ftyp", 12);
        assert!(collector.feed(&full[..10]).unwrap().is_none());
        assert!(!collector.is_ready());
        assert!(collector.feed(&full[10..]).unwrap().is_none());
    }

    #[test]
    fn collector_rejects_an_implausibly_large_declared_box() {
        let mut collector = InitSegmentCollector::new();
        // size==1 extended-size form so a declared length past u32::MAX is expressible.
        let mut stream = vec![0, 0, 0, 1];
        stream.extend_from_slice(b"ftyp");
        stream.extend_from_slice(&(MAX_INIT_BOX_LEN + 1).to_be_bytes());

        let err = collector.feed(&stream).unwrap_err();
        assert!(matches!(err, PublisherError::MalformedBoxStream(_)));
    }
}

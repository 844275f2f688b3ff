use crate::record::{Header, TYPE_STDOUT};
use std::fmt::Arguments;
use std::io::{self, Write};

/// Fixed-capacity per-request scratch region that packs body bytes into
/// `FCGI_STDOUT` records (§3, §4.B).
///
/// Appends that would overflow the region trigger an implicit flush first;
/// an append larger than the region is split across successive flushes.
pub struct OutputBuffer {
    request_id: u16,
    buf: Vec<u8>,
    cap: usize,
}

impl OutputBuffer {
    pub const CAPACITY: usize = 1024;

    pub fn new(request_id: u16) -> Self {
        OutputBuffer {
            request_id,
            buf: Vec::with_capacity(Self::CAPACITY),
            cap: Self::CAPACITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends `bytes`, flushing to `sink` as many times as necessary to
    /// keep the scratch region within capacity.
    pub fn append(&mut self, bytes: &[u8], sink: &mut Vec<u8>) -> io::Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if self.buf.len() == self.cap {
                self.flush(sink)?;
            }
            let space = self.cap - self.buf.len();
            let take = space.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
        }
        Ok(())
    }

    pub fn append_fmt(&mut self, args: Arguments<'_>, sink: &mut Vec<u8>) -> io::Result<()> {
        let s = std::fmt::format(args);
        self.append(s.as_bytes(), sink)
    }

    /// Packages the current contents as one `FCGI_STDOUT` record and
    /// appends it to `sink` (the connection's outbound queue), then resets
    /// the cursor. A no-op if the buffer is already empty.
    pub fn flush(&mut self, sink: &mut Vec<u8>) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let header = Header {
            type_id: TYPE_STDOUT,
            request_id: self.request_id,
            content_length: self.buf.len() as u16,
            padding_length: 0,
        };
        sink.write_all(&header.encode())?;
        sink.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_append_does_not_flush() {
        let mut out = OutputBuffer::new(1);
        let mut sink = vec![];
        out.append(b"hello", &mut sink).unwrap();
        assert!(sink.is_empty());
        assert!(!out.is_empty());
    }

    #[test]
    fn explicit_flush_emits_one_stdout_record() {
        let mut out = OutputBuffer::new(7);
        let mut sink = vec![];
        out.append(b"hello", &mut sink).unwrap();
        out.flush(&mut sink).unwrap();

        let header = Header::decode(sink[..8].try_into().unwrap()).unwrap();
        assert_eq!(header.type_id, TYPE_STDOUT);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.content_length, 5);
        assert_eq!(&sink[8..13], b"hello");
        assert!(out.is_empty());
    }

    #[test]
    fn overflowing_append_flushes_implicitly() {
        let mut out = OutputBuffer::new(1);
        let mut sink = vec![];
        let chunk = vec![b'a'; OutputBuffer::CAPACITY];
        out.append(&chunk, &mut sink).unwrap();
        // Exactly fills the buffer; no flush yet.
        assert!(sink.is_empty());
        out.append(b"more", &mut sink).unwrap();
        // Had to flush the full buffer to make room for "more".
        assert!(!sink.is_empty());
        let header = Header::decode(sink[..8].try_into().unwrap()).unwrap();
        assert_eq!(header.content_length as usize, OutputBuffer::CAPACITY);
    }

    #[test]
    fn append_larger_than_capacity_splits_across_flushes() {
        let mut out = OutputBuffer::new(1);
        let mut sink = vec![];
        let chunk = vec![b'x'; OutputBuffer::CAPACITY * 2 + 10];
        out.append(&chunk, &mut sink).unwrap();
        out.flush(&mut sink).unwrap();

        // Replay every record out of `sink` and check the total length matches.
        let mut pos = 0;
        let mut total = 0;
        while pos < sink.len() {
            let header = Header::decode(sink[pos..pos + 8].try_into().unwrap()).unwrap();
            pos += 8 + header.content_length as usize;
            total += header.content_length as usize;
        }
        assert_eq!(total, chunk.len());
    }
}

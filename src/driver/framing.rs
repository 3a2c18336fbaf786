//! Delimiter-based framing of an inbound byte stream.
//!
//! RFCOMM is a byte stream; peers mark message boundaries with a delimiter
//! (commonly `\r` or `\r\n`). `FrameSplitter` buffers partial input until a
//! delimiter arrives, including delimiters split across reads.

use log::warn;

use crate::device::{Delimiter, Message};

/// Frames longer than this without a delimiter are flushed as-is.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub struct FrameSplitter {
   delimiter: Delimiter,
   buf: Vec<u8>,
   /// Offset up to which `buf` has been searched for a delimiter.
   scanned: usize,
}

impl FrameSplitter {
   pub const fn new(delimiter: Delimiter) -> Self {
      Self {
         delimiter,
         buf: Vec::new(),
         scanned: 0,
      }
   }

   /// Feeds received bytes, returning every message they complete.
   pub fn push(&mut self, bytes: &[u8]) -> Vec<Message> {
      if self.delimiter.is_empty() {
         return if bytes.is_empty() {
            Vec::new()
         } else {
            vec![Message::from_slice(bytes)]
         };
      }

      self.buf.extend_from_slice(bytes);
      let delim = self.delimiter.as_bytes();
      let mut out = Vec::new();
      let mut start = 0;
      // A delimiter may straddle the previous read, so step back a little.
      let mut pos = self.scanned.saturating_sub(delim.len() - 1).max(start);

      while let Some(idx) = find(&self.buf[pos..], delim) {
         let end = pos + idx;
         out.push(Message::from_slice(&self.buf[start..end]));
         start = end + delim.len();
         pos = start;
      }

      self.buf.drain(..start);
      if self.buf.len() > MAX_FRAME_LEN {
         warn!(
            "Frame exceeded {MAX_FRAME_LEN} bytes without a delimiter, flushing {} bytes",
            self.buf.len()
         );
         out.push(Message::from_slice(&self.buf));
         self.buf.clear();
      }
      self.scanned = self.buf.len();
      out
   }

   /// Bytes received since the last complete message.
   pub fn pending(&self) -> &[u8] {
      &self.buf
   }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
   haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn splitter(delim: &[u8]) -> FrameSplitter {
      FrameSplitter::new(Delimiter::new(delim).unwrap())
   }

   fn texts(msgs: Vec<Message>) -> Vec<String> {
      msgs
         .iter()
         .map(|m| String::from_utf8_lossy(m).into_owned())
         .collect()
   }

   #[test]
   fn test_splits_multiple_messages_in_one_read() {
      let mut s = splitter(b"\r");
      assert_eq!(texts(s.push(b"temp=21\rhum=40\rpar")), ["temp=21", "hum=40"]);
      assert_eq!(s.pending(), b"par");
      assert_eq!(texts(s.push(b"tial\r")), ["partial"]);
      assert!(s.pending().is_empty());
   }

   #[test]
   fn test_multibyte_delimiter_across_reads() {
      let mut s = splitter(b"\r\n");
      assert!(s.push(b"OK\r").is_empty());
      assert_eq!(texts(s.push(b"\nREADY\r")), ["OK"]);
      assert_eq!(texts(s.push(b"\n")), ["READY"]);
   }

   #[test]
   fn test_empty_frames_are_kept() {
      let mut s = splitter(b";");
      assert_eq!(texts(s.push(b";;a;")), ["", "", "a"]);
   }

   #[test]
   fn test_empty_delimiter_passes_chunks_through() {
      let mut s = splitter(b"");
      assert_eq!(texts(s.push(b"raw\rbytes")), ["raw\rbytes"]);
      assert!(s.push(b"").is_empty());
   }

   #[test]
   fn test_oversized_frame_is_flushed() {
      let mut s = splitter(b"\n");
      let big = vec![b'x'; MAX_FRAME_LEN + 1];
      let out = s.push(&big);
      assert_eq!(out.len(), 1);
      assert_eq!(out[0].len(), MAX_FRAME_LEN + 1);
      assert!(s.pending().is_empty());
      assert_eq!(texts(s.push(b"next\n")), ["next"]);
   }
}

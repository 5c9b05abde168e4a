// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A binary blob with an append cursor, the backing store of every message.

use std::fmt;

/// Growable binary buffer.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    cursor: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled buffer of the given size.
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            cursor: 0,
        }
    }

    /// Take ownership of raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    /// Fill the buffer with the bytes of a string.
    pub fn from_string(s: &str) -> Self {
        Self {
            data: s.as_bytes().to_vec(),
            cursor: 0,
        }
    }

    /// Zero the contents, keeping the size.
    pub fn zero(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.data.len());
    }

    pub fn advance_cursor(&mut self, delta: usize) {
        self.set_cursor(self.cursor + delta);
    }

    /// Append bytes at the cursor, growing the buffer as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.append_at(bytes, self.cursor);
        self.cursor += bytes.len();
    }

    /// Write bytes at the given offset, growing the buffer as needed.
    pub fn append_at(&mut self, bytes: &[u8], offset: usize) {
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    /// The bytes from the cursor to the end.
    pub fn at_cursor(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Truncate to the given length.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.cursor = self.cursor.min(len);
    }

    /// The contents interpreted as UTF-8, lossily.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let buf = Buffer::from_string("/store/data/file.root");
        assert_eq!(buf.as_string(), "/store/data/file.root");
    }

    #[test]
    fn append_moves_cursor() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.as_slice(), b"abcdef");
        assert_eq!(buf.cursor(), 6);
        buf.set_cursor(3);
        assert_eq!(buf.at_cursor(), b"def");
    }

    #[test]
    fn append_at_grows() {
        let mut buf = Buffer::with_size(4);
        buf.append_at(b"xy", 6);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf.as_slice()[6..], b"xy");
    }

    #[test]
    fn zero_keeps_size() {
        let mut buf = Buffer::from_string("abc");
        buf.zero();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice(), &[0, 0, 0]);
    }
}

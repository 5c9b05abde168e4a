// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The message envelope: a wire buffer plus the metadata the runtime needs
//! to shepherd it through send, redirect and retry.

use super::{
    buffer::Buffer,
    header::{RequestCode, ResponseStatus, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN},
};
use std::{
    convert::TryInto,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

static VIRTUAL_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Produce the next virtual request id. The id is stamped once per logical
/// request and stays stable across redirects so log lines can be correlated.
pub fn next_virtual_req_id() -> u64 {
    VIRTUAL_REQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// A request or response travelling through the post-master.
#[derive(Debug, Clone, Default)]
pub struct Message {
    buffer: Buffer,
    description: String,
    session_id: u64,
    virtual_req_id: u64,
    is_marshalled: bool,
}

impl Message {
    /// An empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request whose body is a path string. The header is laid out
    /// in host byte order; the transport converts it when the message is
    /// put on the wire.
    pub fn request(code: RequestCode, path: &str) -> Self {
        Self::request_with_body(code, [0; 16], path.as_bytes())
            .with_description(format!("{:?} {}", code, path))
    }

    /// Build a request with explicit parameter bytes and body.
    pub fn request_with_body(code: RequestCode, params: [u8; 16], body: &[u8]) -> Self {
        let mut buffer = Buffer::with_size(REQUEST_HEADER_LEN);
        buffer.append_at(&(code as u16).to_ne_bytes(), 2);
        buffer.append_at(&params, 4);
        buffer.append_at(&(body.len() as u32).to_ne_bytes(), 20);
        if !body.is_empty() {
            buffer.append_at(body, REQUEST_HEADER_LEN);
        }
        Self {
            buffer,
            description: format!("{:?}", code),
            session_id: 0,
            virtual_req_id: 0,
            is_marshalled: false,
        }
    }

    /// Wrap a complete frame received from the wire.
    pub fn from_wire(header: [u8; RESPONSE_HEADER_LEN], body: Vec<u8>) -> Self {
        let mut buffer = Buffer::from_bytes(header.to_vec());
        if !body.is_empty() {
            buffer.append_at(&body, RESPONSE_HEADER_LEN);
        }
        Self {
            buffer,
            description: "inbound".to_string(),
            session_id: 0,
            virtual_req_id: 0,
            is_marshalled: true,
        }
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = description;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    /// The stream incarnation that first saw this message.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    /// Stable id for log correlation across redirects.
    pub fn virtual_req_id(&self) -> u64 {
        self.virtual_req_id
    }

    pub fn set_virtual_req_id(&mut self, id: u64) {
        self.virtual_req_id = id;
    }

    /// Whether the header has been converted to wire byte order.
    pub fn is_marshalled(&self) -> bool {
        self.is_marshalled
    }

    pub fn set_marshalled(&mut self, marshalled: bool) {
        self.is_marshalled = marshalled;
    }

    //--------------------------------------------------------------------
    // Request header peeks
    //--------------------------------------------------------------------

    /// The stream id stamped into a request header, as a big-endian value.
    pub fn request_sid(&self) -> u16 {
        let b = self.buffer.as_slice();
        if b.len() < 2 {
            return 0;
        }
        u16::from_be_bytes([b[0], b[1]])
    }

    /// Stamp a stream id into the request header.
    pub fn set_request_sid(&mut self, sid: [u8; 2]) {
        self.buffer.append_at(&sid, 0);
    }

    /// The request code, honoring the marshalled flag.
    pub fn request_code(&self) -> Option<RequestCode> {
        let b = self.buffer.as_slice();
        if b.len() < 4 {
            return None;
        }
        let raw = if self.is_marshalled {
            u16::from_be_bytes([b[2], b[3]])
        } else {
            u16::from_ne_bytes([b[2], b[3]])
        };
        num_traits::FromPrimitive::from_u16(raw)
    }

    /// The request body length, honoring the marshalled flag.
    pub fn request_dlen(&self) -> u32 {
        let b = self.buffer.as_slice();
        if b.len() < REQUEST_HEADER_LEN {
            return 0;
        }
        let bytes: [u8; 4] = b[20..24].try_into().unwrap();
        if self.is_marshalled {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_ne_bytes(bytes)
        }
    }

    /// The request body interpreted as a path string.
    pub fn request_path(&self) -> Option<String> {
        let b = self.buffer.as_slice();
        if b.len() <= REQUEST_HEADER_LEN {
            return None;
        }
        String::from_utf8(b[REQUEST_HEADER_LEN..].to_vec()).ok()
    }

    /// Replace the request body with a new path string and fix up the body
    /// length. Only valid on an unmarshalled request.
    pub fn set_request_path(&mut self, path: &str) {
        debug_assert!(!self.is_marshalled);
        self.buffer.truncate(REQUEST_HEADER_LEN);
        self.buffer.append_at(&(path.len() as u32).to_ne_bytes(), 20);
        self.buffer.append_at(path.as_bytes(), REQUEST_HEADER_LEN);
    }

    //--------------------------------------------------------------------
    // Response header peeks, always wire byte order
    //--------------------------------------------------------------------

    /// The stream id of a response.
    pub fn response_sid(&self) -> u16 {
        let b = self.buffer.as_slice();
        if b.len() < 2 {
            return 0;
        }
        u16::from_be_bytes([b[0], b[1]])
    }

    /// The raw status word of a response.
    pub fn response_status_raw(&self) -> u16 {
        let b = self.buffer.as_slice();
        if b.len() < 4 {
            return 0;
        }
        u16::from_be_bytes([b[2], b[3]])
    }

    /// The decoded status of a response.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        num_traits::FromPrimitive::from_u16(self.response_status_raw())
    }

    /// The body length of a response.
    pub fn response_dlen(&self) -> u32 {
        let b = self.buffer.as_slice();
        if b.len() < RESPONSE_HEADER_LEN {
            return 0;
        }
        u32::from_be_bytes(b[4..8].try_into().unwrap())
    }

    /// The response body bytes.
    pub fn response_body(&self) -> &[u8] {
        let b = self.buffer.as_slice();
        if b.len() <= RESPONSE_HEADER_LEN {
            return &[];
        }
        &b[RESPONSE_HEADER_LEN..]
    }
}

impl Deref for Message {
    type Target = Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (vreq {})", self.description, self.virtual_req_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrd::header::ResponseHeader;

    #[test]
    fn request_layout() {
        let msg = Message::request(RequestCode::Stat, "/data/file");
        assert_eq!(msg.len(), REQUEST_HEADER_LEN + 10);
        assert_eq!(msg.request_code(), Some(RequestCode::Stat));
        assert_eq!(msg.request_dlen(), 10);
        assert_eq!(msg.request_path().as_deref(), Some("/data/file"));
        assert_eq!(msg.request_sid(), 0);
    }

    #[test]
    fn sid_stamping() {
        let mut msg = Message::request(RequestCode::Open, "/f");
        msg.set_request_sid(7u16.to_be_bytes());
        assert_eq!(msg.request_sid(), 7);
    }

    #[test]
    fn path_rewrite() {
        let mut msg = Message::request(RequestCode::Open, "/f");
        msg.set_request_path("/f?tried=host");
        assert_eq!(msg.request_path().as_deref(), Some("/f?tried=host"));
        assert_eq!(msg.request_dlen(), 13);
    }

    #[test]
    fn response_peeks() {
        let header: [u8; RESPONSE_HEADER_LEN] = ResponseHeader {
            sid: 3,
            status: 4000,
            dlen: 5,
        }
        .into();
        let msg = Message::from_wire(header, b"HELLO".to_vec());
        assert_eq!(msg.response_sid(), 3);
        assert_eq!(msg.response_status(), Some(ResponseStatus::OkSoFar));
        assert_eq!(msg.response_dlen(), 5);
        assert_eq!(msg.response_body(), b"HELLO");
    }
}

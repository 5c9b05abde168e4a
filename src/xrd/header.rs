// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The fixed XRootD wire headers.
//!
//! A request starts with 24 bytes: `streamid[2] | requestid[2] | body[16] |
//! dlen[4]`. A response starts with 8 bytes: `streamid[2] | status[2] |
//! dlen[4]`. Multi-byte fields travel in big-endian byte order; requests are
//! built in host order and converted by the transport when they are put on
//! the wire.

use num_derive::FromPrimitive;
use std::convert::TryFrom;

/// Length of the fixed request header.
pub const REQUEST_HEADER_LEN: usize = 24;
/// Length of the fixed response header.
pub const RESPONSE_HEADER_LEN: usize = 8;
/// Length of the client greeting.
pub const HANDSHAKE_REQUEST_LEN: usize = 20;
/// Length of the server's greeting body.
pub const HANDSHAKE_BODY_LEN: usize = 8;

/// The kXR_* request codes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum RequestCode {
    Auth = 3000,
    Query = 3001,
    Chmod = 3002,
    Close = 3003,
    DirList = 3004,
    Protocol = 3006,
    Login = 3007,
    MkDir = 3008,
    Mv = 3009,
    Open = 3010,
    Ping = 3011,
    Read = 3013,
    Rm = 3014,
    RmDir = 3015,
    Sync = 3016,
    Stat = 3017,
    Set = 3018,
    Write = 3019,
    Prepare = 3021,
    EndSess = 3023,
    Locate = 3027,
    Truncate = 3028,
}

impl RequestCode {
    /// Whether the operation depends on server-side state (an open file) and
    /// must fail on disconnect instead of being replayed.
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            RequestCode::Open
                | RequestCode::Close
                | RequestCode::Read
                | RequestCode::Write
                | RequestCode::Sync
                | RequestCode::Truncate
                | RequestCode::EndSess
        )
    }

    /// Whether the request body is a path string that redirect CGI can be
    /// merged into.
    pub fn carries_path(&self) -> bool {
        matches!(
            self,
            RequestCode::Chmod
                | RequestCode::DirList
                | RequestCode::MkDir
                | RequestCode::Mv
                | RequestCode::Open
                | RequestCode::Rm
                | RequestCode::RmDir
                | RequestCode::Stat
                | RequestCode::Prepare
                | RequestCode::Locate
                | RequestCode::Truncate
                | RequestCode::Query
        )
    }
}

/// The kXR_* response status codes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ResponseStatus {
    Ok = 0,
    OkSoFar = 4000,
    Attn = 4001,
    AuthMore = 4002,
    Error = 4003,
    Redirect = 4004,
    Wait = 4005,
    WaitResp = 4006,
}

/// The fixed 8 byte response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Stream identifier the response belongs to
    pub sid: u16,
    /// Raw status word
    pub status: u16,
    /// Length of the appended body
    pub dlen: u32,
}

impl ResponseHeader {
    /// Decode the status word.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        num_traits::FromPrimitive::from_u16(self.status)
    }
}

impl TryFrom<&[u8]> for ResponseHeader {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        anyhow::ensure!(bytes.len() >= RESPONSE_HEADER_LEN, "Invalid response header length");
        Ok(ResponseHeader {
            sid: u16::from_be_bytes([bytes[0], bytes[1]]),
            status: u16::from_be_bytes([bytes[2], bytes[3]]),
            dlen: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

impl From<ResponseHeader> for [u8; RESPONSE_HEADER_LEN] {
    fn from(h: ResponseHeader) -> Self {
        let sid = h.sid.to_be_bytes();
        let status = h.status.to_be_bytes();
        let dlen = h.dlen.to_be_bytes();
        [sid[0], sid[1], status[0], status[1], dlen[0], dlen[1], dlen[2], dlen[3]]
    }
}

/// The client greeting: five big-endian words, the last two carrying the
/// protocol generation markers.
pub fn handshake_request() -> [u8; HANDSHAKE_REQUEST_LEN] {
    let mut bytes = [0u8; HANDSHAKE_REQUEST_LEN];
    bytes[12..16].copy_from_slice(&4u32.to_be_bytes());
    bytes[16..20].copy_from_slice(&2012u32.to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn response_header_round_trip() {
        let header = ResponseHeader {
            sid: 0x0102,
            status: 4004,
            dlen: 77,
        };
        let bytes: [u8; RESPONSE_HEADER_LEN] = header.into();
        let parsed: ResponseHeader = bytes.as_ref().try_into().unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.response_status(), Some(ResponseStatus::Redirect));
    }

    #[test]
    fn short_header_is_rejected() {
        let bytes = [0u8; 4];
        assert!(ResponseHeader::try_from(bytes.as_ref()).is_err());
    }

    #[test]
    fn greeting_markers() {
        let hs = handshake_request();
        assert_eq!(hs.len(), HANDSHAKE_REQUEST_LEN);
        assert_eq!(&hs[12..16], &4u32.to_be_bytes());
        assert_eq!(&hs[16..20], &2012u32.to_be_bytes());
    }

    #[test]
    fn stateful_codes() {
        assert!(RequestCode::Open.is_stateful());
        assert!(RequestCode::Write.is_stateful());
        assert!(!RequestCode::Locate.is_stateful());
        assert!(!RequestCode::Stat.is_stateful());
    }
}

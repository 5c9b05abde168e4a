// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Decoders for the response bodies the dispatch state machine inspects:
//! redirect, wait and error.

use crate::status::{ErrorCode, Status, XrdResult};
use std::convert::TryInto;

/// Body of a kXR_redirect response: `port[4] | host['?'cgi]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    /// Port of the new endpoint
    pub port: u16,
    /// Host of the new endpoint
    pub host: String,
    /// CGI to merge into the redirected request, may be empty
    pub cgi: String,
}

impl RedirectInfo {
    /// Decode a redirect body.
    pub fn decode(body: &[u8]) -> XrdResult<Self> {
        if body.len() < 5 {
            return Err(Status::error(ErrorCode::InvalidRedirectUrl));
        }
        let port = i32::from_be_bytes(body[..4].try_into().unwrap());
        if port <= 0 || port > u16::MAX as i32 {
            return Err(Status::error(ErrorCode::InvalidRedirectUrl));
        }
        let target =
            std::str::from_utf8(&body[4..]).map_err(|_| Status::error(ErrorCode::InvalidRedirectUrl))?;
        let (host, cgi) = match target.find('?') {
            Some(pos) => (&target[..pos], &target[pos + 1..]),
            None => (target, ""),
        };
        if host.is_empty() {
            return Err(Status::error(ErrorCode::InvalidRedirectUrl));
        }
        Ok(Self {
            port: port as u16,
            host: host.to_string(),
            cgi: cgi.to_string(),
        })
    }
}

/// Body of a kXR_wait response: `seconds[4] | message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitInfo {
    /// Seconds the server asked us to pause before resending
    pub seconds: u32,
    /// Optional diagnostic message
    pub message: String,
}

impl WaitInfo {
    /// Decode a wait body.
    pub fn decode(body: &[u8]) -> XrdResult<Self> {
        if body.len() < 4 {
            return Err(Status::error(ErrorCode::InvalidResponse));
        }
        let seconds = i32::from_be_bytes(body[..4].try_into().unwrap());
        if seconds < 0 {
            return Err(Status::error(ErrorCode::ResponseNegative));
        }
        Ok(Self {
            seconds: seconds as u32,
            message: String::from_utf8_lossy(&body[4..]).trim_end_matches('\0').to_string(),
        })
    }
}

/// Body of a kXR_error response: `errno[4] | message '\0'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Server supplied error number
    pub errnum: i32,
    /// Server supplied error message
    pub message: String,
}

impl ErrorInfo {
    /// Decode an error body.
    pub fn decode(body: &[u8]) -> XrdResult<Self> {
        if body.len() < 4 {
            return Err(Status::error(ErrorCode::InvalidResponse));
        }
        let errnum = i32::from_be_bytes(body[..4].try_into().unwrap());
        Ok(Self {
            errnum,
            message: String::from_utf8_lossy(&body[4..]).trim_end_matches('\0').to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_with_cgi() {
        let mut body = 1094i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"disk7.cern.ch?foo=bar");
        let info = RedirectInfo::decode(&body).unwrap();
        assert_eq!(info.port, 1094);
        assert_eq!(info.host, "disk7.cern.ch");
        assert_eq!(info.cgi, "foo=bar");
    }

    #[test]
    fn redirect_without_cgi() {
        let mut body = 2094i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"disk8");
        let info = RedirectInfo::decode(&body).unwrap();
        assert_eq!(info.cgi, "");
        assert_eq!(info.host, "disk8");
    }

    #[test]
    fn redirect_rejects_bad_port() {
        let mut body = (-1i32).to_be_bytes().to_vec();
        body.extend_from_slice(b"host");
        assert!(RedirectInfo::decode(&body).is_err());
        assert!(RedirectInfo::decode(b"xy").is_err());
    }

    #[test]
    fn wait_body() {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"busy");
        let info = WaitInfo::decode(&body).unwrap();
        assert_eq!(info.seconds, 5);
        assert_eq!(info.message, "busy");
    }

    #[test]
    fn error_body() {
        let mut body = 3011i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"file not found\0");
        let info = ErrorInfo::decode(&body).unwrap();
        assert_eq!(info.errnum, 3011);
        assert_eq!(info.message, "file not found");
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Execution status passed between the post-master components and returned
//! to the caller. A status is either a success or an error carrying one of
//! the client error codes, with an optional OS errno attached.

use num_derive::FromPrimitive;
use std::fmt;

/// Severity of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Everything went fine
    Ok,
    /// An error that could potentially be retried
    Error,
    /// An error that disables further retries
    Fatal,
}

/// The client error codes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    Retry = 1,
    Unknown = 2,
    InvalidOp = 3,
    Fcntl = 4,
    Poll = 5,
    Internal = 6,
    InvalidArgs = 7,
    Uninitialized = 8,
    NotImplemented = 9,
    OsError = 50,
    InvalidAddr = 101,
    SocketError = 102,
    SocketTimeout = 103,
    SocketDisconnected = 104,
    PollerError = 105,
    SocketOptError = 106,
    StreamDisconnect = 107,
    ConnectionError = 108,
    InvalidSession = 109,
    InvalidMessage = 201,
    HandshakeFailed = 202,
    LoginFailed = 203,
    AuthFailed = 204,
    QueryNotSupported = 205,
    OperationExpired = 206,
    NoMoreFreeSids = 301,
    InvalidRedirectUrl = 302,
    InvalidResponse = 303,
    NotFound = 304,
    ChecksumError = 305,
    RedirectLimit = 306,
    ErrorResponse = 307,
    Redirect = 308,
    ResponseNegative = 309,
    DataError = 310,
}

impl ErrorCode {
    /// A human readable description of the code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::None => "No error",
            ErrorCode::Retry => "Try again",
            ErrorCode::Unknown => "Unknown error",
            ErrorCode::InvalidOp => "Invalid operation",
            ErrorCode::Fcntl => "Fcntl error",
            ErrorCode::Poll => "Poll error",
            ErrorCode::Internal => "Internal error",
            ErrorCode::InvalidArgs => "Invalid arguments",
            ErrorCode::Uninitialized => "Initialization error",
            ErrorCode::NotImplemented => "Not implemented",
            ErrorCode::OsError => "OS error",
            ErrorCode::InvalidAddr => "Invalid address",
            ErrorCode::SocketError => "Socket error",
            ErrorCode::SocketTimeout => "Socket timeout",
            ErrorCode::SocketDisconnected => "Socket disconnected",
            ErrorCode::PollerError => "Poller error",
            ErrorCode::SocketOptError => "Socket opt error",
            ErrorCode::StreamDisconnect => "Stream disconnect",
            ErrorCode::ConnectionError => "Connection error",
            ErrorCode::InvalidSession => "Invalid session",
            ErrorCode::InvalidMessage => "Invalid message",
            ErrorCode::HandshakeFailed => "Hand shake failed",
            ErrorCode::LoginFailed => "Login failed",
            ErrorCode::AuthFailed => "Auth failed",
            ErrorCode::QueryNotSupported => "Query not supported",
            ErrorCode::OperationExpired => "Operation expired",
            ErrorCode::NoMoreFreeSids => "No more free SIDs",
            ErrorCode::InvalidRedirectUrl => "Invalid redirect URL",
            ErrorCode::InvalidResponse => "Invalid response",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::ChecksumError => "Checksum error",
            ErrorCode::RedirectLimit => "Redirect limit reached",
            ErrorCode::ErrorResponse => "Error response",
            ErrorCode::Redirect => "Redirection",
            ErrorCode::ResponseNegative => "Negative response",
            ErrorCode::DataError => "Data error",
        }
    }
}

/// Result of a post-master operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Severity of the outcome
    pub kind: StatusKind,
    /// Reason, [`ErrorCode::None`] on success
    pub code: ErrorCode,
    /// OS errno, if any
    pub errno: i32,
}

/// Result type used at every facade boundary.
pub type XrdResult<T> = Result<T, Status>;

impl Status {
    /// A successful status.
    pub fn ok() -> Self {
        Self {
            kind: StatusKind::Ok,
            code: ErrorCode::None,
            errno: 0,
        }
    }

    /// A recoverable error with the given code.
    pub fn error(code: ErrorCode) -> Self {
        Self {
            kind: StatusKind::Error,
            code,
            errno: 0,
        }
    }

    /// A fatal error with the given code.
    pub fn fatal(code: ErrorCode) -> Self {
        Self {
            kind: StatusKind::Fatal,
            code,
            errno: 0,
        }
    }

    /// Attach an OS errno.
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    pub fn is_error(&self) -> bool {
        self.kind == StatusKind::Error || self.kind == StatusKind::Fatal
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == StatusKind::Fatal
    }

    /// Map the status to a POSIX shell exit code band: 0 for success,
    /// otherwise 50 + the error class (generic, socket, protocol, request).
    pub fn shell_code(&self) -> i32 {
        if self.is_ok() {
            return 0;
        }
        50 + (self.code as u16 / 100) as i32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StatusKind::Ok => return write!(f, "[SUCCESS]"),
            StatusKind::Error => write!(f, "[ERROR] ")?,
            StatusKind::Fatal => write!(f, "[FATAL] ")?,
        }
        write!(f, "{}", self.code.message())?;
        if self.errno != 0 {
            write!(f, ": {}", std::io::Error::from_raw_os_error(self.errno))?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The endpoint protocol plug. A transport builds and consumes the
//! handshake, converts request headers to wire byte order, sizes inbound
//! frames and classifies responses for the dispatch machinery.

use crate::{
    status::{ErrorCode, Status, XrdResult},
    url::Url,
    xrd::{
        header::{
            handshake_request, ResponseHeader, ResponseStatus, HANDSHAKE_BODY_LEN,
            RESPONSE_HEADER_LEN,
        },
        message::Message,
    },
};
use async_trait::async_trait;
use std::convert::{TryFrom, TryInto};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// What a response means to the dispatch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// A terminal response for the request
    Final,
    /// A fragment; more will follow
    Partial,
    /// The server asked us to pause and resend
    Wait,
    /// An application error
    Error,
    /// A new endpoint for the request
    Redirect,
    /// An unsolicited push, not tied to a stream id
    Async,
}

/// Capability queries answered by a channel's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportQuery {
    /// The stream id allocator of the channel's stream
    SidManager,
    /// The protocol version negotiated during the handshake
    ProtocolVersion,
    /// The server flags sent during the handshake
    ServerFlags,
}

/// Result of the initial handshake exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Protocol version the server speaks
    pub version: u32,
    /// Server type flags
    pub flags: u32,
}

/// Per-endpoint protocol behavior.
#[async_trait]
pub trait TransportHandler: Send + Sync + 'static {
    /// Run the greeting exchange on a freshly connected socket.
    async fn hand_shake(&self, stream: &mut TcpStream, url: &Url) -> XrdResult<ProtocolInfo>;

    /// Convert a request header to wire byte order. Idempotent.
    fn marshall_request(&self, msg: &mut Message) -> XrdResult<()>;

    /// Convert a request header back to host byte order. Idempotent.
    fn unmarshall_request(&self, msg: &mut Message) -> XrdResult<()>;

    /// Size of the fixed response header.
    fn header_size(&self) -> usize;

    /// Body length promised by a complete fixed header.
    fn body_size(&self, header: &[u8]) -> XrdResult<u32>;

    /// Classify a complete inbound message.
    fn classify(&self, msg: &Message) -> ResponseClass;

    /// Select the socket leg an outgoing message should use.
    fn multiplex_substream(&self, msg: &Message, substreams: u16) -> u16;
}

/// The XRootD protocol transport.
#[derive(Debug, Default)]
pub struct XRootDTransport;

#[async_trait]
impl TransportHandler for XRootDTransport {
    async fn hand_shake(&self, stream: &mut TcpStream, url: &Url) -> XrdResult<ProtocolInfo> {
        let greeting = handshake_request();
        stream
            .write_all(&greeting)
            .await
            .map_err(|e| handshake_error(url, "write", e))?;

        let mut header = [0u8; RESPONSE_HEADER_LEN];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| handshake_error(url, "read", e))?;
        let header = ResponseHeader::try_from(header.as_ref())
            .map_err(|_| Status::error(ErrorCode::HandshakeFailed))?;
        if header.status != 0 || header.dlen as usize != HANDSHAKE_BODY_LEN {
            log::error!("[{}] Malformed handshake response", url.host_id());
            return Err(Status::error(ErrorCode::HandshakeFailed));
        }

        let mut body = [0u8; HANDSHAKE_BODY_LEN];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| handshake_error(url, "read", e))?;
        let info = ProtocolInfo {
            version: u32::from_be_bytes(body[..4].try_into().unwrap()),
            flags: u32::from_be_bytes(body[4..].try_into().unwrap()),
        };
        log::debug!(
            "[{}] Hand shake done, protocol version {}, server flags {:#x}",
            url.host_id(),
            info.version,
            info.flags
        );
        Ok(info)
    }

    fn marshall_request(&self, msg: &mut Message) -> XrdResult<()> {
        if msg.is_marshalled() {
            return Ok(());
        }
        convert_request_header(msg, true)?;
        msg.set_marshalled(true);
        Ok(())
    }

    fn unmarshall_request(&self, msg: &mut Message) -> XrdResult<()> {
        if !msg.is_marshalled() {
            return Ok(());
        }
        convert_request_header(msg, false)?;
        msg.set_marshalled(false);
        Ok(())
    }

    fn header_size(&self) -> usize {
        RESPONSE_HEADER_LEN
    }

    fn body_size(&self, header: &[u8]) -> XrdResult<u32> {
        let header = ResponseHeader::try_from(header)
            .map_err(|_| Status::error(ErrorCode::InvalidMessage))?;
        Ok(header.dlen)
    }

    fn classify(&self, msg: &Message) -> ResponseClass {
        match msg.response_status() {
            Some(ResponseStatus::Ok) => ResponseClass::Final,
            Some(ResponseStatus::OkSoFar) => ResponseClass::Partial,
            Some(ResponseStatus::Attn) => ResponseClass::Async,
            Some(ResponseStatus::Wait) | Some(ResponseStatus::WaitResp) => ResponseClass::Wait,
            Some(ResponseStatus::Redirect) => ResponseClass::Redirect,
            Some(ResponseStatus::Error) | Some(ResponseStatus::AuthMore) | None => ResponseClass::Error,
        }
    }

    fn multiplex_substream(&self, msg: &Message, substreams: u16) -> u16 {
        if substreams <= 1 {
            return 0;
        }
        msg.request_sid() % substreams
    }
}

fn handshake_error(url: &Url, op: &str, e: std::io::Error) -> Status {
    log::error!("[{}] Hand shake {} failed: {}", url.host_id(), op, e);
    Status::error(ErrorCode::HandshakeFailed).with_errno(e.raw_os_error().unwrap_or(0))
}

/// Convert the requestid and dlen words between host and network byte
/// order. The stream id travels as raw bytes and the sixteen parameter
/// bytes are owned by the request builder, so neither is touched.
fn convert_request_header(msg: &mut Message, to_wire: bool) -> XrdResult<()> {
    if msg.len() < crate::xrd::header::REQUEST_HEADER_LEN {
        return Err(Status::error(ErrorCode::InvalidMessage));
    }
    let bytes = msg.as_mut_slice();
    let code: [u8; 2] = bytes[2..4].try_into().unwrap();
    let dlen: [u8; 4] = bytes[20..24].try_into().unwrap();
    if to_wire {
        bytes[2..4].copy_from_slice(&u16::from_ne_bytes(code).to_be_bytes());
        bytes[20..24].copy_from_slice(&u32::from_ne_bytes(dlen).to_be_bytes());
    } else {
        bytes[2..4].copy_from_slice(&u16::from_be_bytes(code).to_ne_bytes());
        bytes[20..24].copy_from_slice(&u32::from_be_bytes(dlen).to_ne_bytes());
    }
    Ok(())
}

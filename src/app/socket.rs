// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A thin wrapper around a connected TCP socket. Reads and writes are
//! non-blocking; readiness is awaited through the poller.

use crate::{
    status::{ErrorCode, Status, XrdResult},
    url::Url,
};
use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{Interest, Ready},
    net::TcpStream,
};

static SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// A connected, non-blocking socket leg.
pub struct Socket {
    stream: TcpStream,
    name: String,
    id: u64,
}

impl Socket {
    /// Open a TCP connection to the URL's endpoint, bounded by the connect
    /// window. The raw stream is returned so the transport can run its
    /// handshake before the socket joins the poller.
    pub async fn connect(url: &Url, window: Duration) -> XrdResult<TcpStream> {
        let address = url.host_port();
        let connect = TcpStream::connect(address.clone());
        match tokio::time::timeout(window, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                log::debug!("[{}] Unable to connect: {}", url.host_id(), e);
                Err(Status::error(ErrorCode::ConnectionError)
                    .with_errno(e.raw_os_error().unwrap_or(0)))
            }
            Err(_) => {
                log::debug!("[{}] Connect window of {:?} elapsed", url.host_id(), window);
                Err(Status::error(ErrorCode::SocketTimeout))
            }
        }
    }

    /// Wrap a stream that completed its handshake.
    pub fn new(stream: TcpStream) -> Self {
        let name = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream,
            name,
            id: SOCKET_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Process-unique id, the poller registration key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer address, for log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the socket is ready for any of the given interests.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.stream.ready(interest).await
    }

    /// Non-blocking read.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    /// Non-blocking write.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).field("peer", &self.name).finish()
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The client runtime. The post-master owns one channel per endpoint; a
//! channel owns a stream; a stream owns its stream-id allocator, queues and
//! socket legs. The poller, task manager and job manager are the shared
//! background services.

/// Per host-id forwarder and push listeners
pub mod channel;
/// The response dispatch state machine
pub mod handler;
/// Pending incoming-message handlers keyed by stream id
pub mod inqueue;
/// Worker pool running handler callbacks
pub mod job;
/// Ordered queue of outgoing messages
pub mod outqueue;
/// Socket readiness and timeout dispatch
pub mod poller;
/// The top level facade
pub mod postmaster;
/// Stream id allocation
pub mod sid;
/// Byte transport for a single socket leg
pub mod socket;
/// Per endpoint byte stream and its sub-streams
pub mod stream;
/// Timed task scheduling
pub mod task;
/// Endpoint protocol plug
pub mod transport;
/// User facing response callbacks
pub mod worker;

use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Produce the next stream session id. Session ids are process-wide and
/// monotonic so that no stream incarnation, not even one created after a
/// `reinitialize`, can be mistaken for an older one.
pub(crate) fn next_session_id() -> u64 {
    SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Post-master configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds before a connect attempt is abandoned
    pub connection_window: u16,
    /// Connect attempts before the channel gives up
    pub connection_retry: u16,
    /// Default per request deadline, in seconds
    pub request_timeout: u16,
    /// Idle read seconds before a stream is declared broken
    pub stream_timeout: u16,
    /// Parallel socket legs per channel
    pub sub_streams_per_channel: u16,
    /// Maximum redirects per request
    pub redirect_limit: u16,
    /// Window within which repeated connection failures escalate to fatal
    pub stream_error_window: u16,
    /// Size of the job manager worker pool
    pub worker_threads: usize,
    /// Highest stream id value the allocator may reach
    pub sid_ceiling: u16,
    /// Resolution of the timeout sweeps, in seconds
    pub timeout_resolution: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_window: 120,
            connection_retry: 5,
            request_timeout: 300,
            stream_timeout: 60,
            sub_streams_per_channel: 1,
            redirect_limit: 5,
            stream_error_window: 1800,
            worker_threads: 3,
            sid_ceiling: 0xFFFF,
            timeout_resolution: 1,
        }
    }
}

impl Config {
    /// Create a config with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_window(mut self, seconds: u16) -> Self {
        self.connection_window = seconds;
        self
    }

    pub fn with_connection_retry(mut self, retries: u16) -> Self {
        self.connection_retry = retries.max(1);
        self
    }

    pub fn with_request_timeout(mut self, seconds: u16) -> Self {
        self.request_timeout = seconds;
        self
    }

    pub fn with_stream_timeout(mut self, seconds: u16) -> Self {
        self.stream_timeout = seconds;
        self
    }

    pub fn with_sub_streams(mut self, count: u16) -> Self {
        self.sub_streams_per_channel = count.max(1);
        self
    }

    pub fn with_redirect_limit(mut self, limit: u16) -> Self {
        self.redirect_limit = limit;
        self
    }

    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    pub fn with_sid_ceiling(mut self, ceiling: u16) -> Self {
        self.sid_ceiling = ceiling;
        self
    }

    pub(crate) fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout as u64)
    }

    pub(crate) fn stream_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.stream_timeout as u64)
    }

    pub(crate) fn connection_window_duration(&self) -> Duration {
        Duration::from_secs(self.connection_window as u64)
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! An asynchronous XRootD client post-master.
//!
//! The post-master is the transport and dispatch layer of an XRootD client:
//! it owns one channel per endpoint, allocates stream identifiers for
//! outgoing requests, pumps the sockets, schedules timeouts, and drives the
//! XRootD response state machine (redirect, wait, partial, error) until a
//! final status can be delivered to the caller.

/// The client runtime: post-master, channels, streams and their services
pub mod app;
/// Execution status and the error taxonomy
pub mod status;
/// XRootD URL parsing
pub mod url;
/// The XRootD wire layer: buffers, messages, headers and response bodies
pub mod xrd;

pub mod prelude {
    //! Everything needed to talk to an XRootD cluster.
    pub use super::{
        app::{
            channel::{Channel, Listeners, MessageListener},
            handler::XRootDMsgHandler,
            inqueue::{InQueue, MsgHandler, StreamEvent, ACTION_NOP, ACTION_REMOVE, ACTION_TAKE},
            job::{Job, JobManager},
            outqueue::{OutMessage, OutQueue},
            poller::{Poller, SocketHandler},
            postmaster::PostMaster,
            sid::SidManager,
            socket::Socket,
            stream::{Stream, StreamState},
            task::{Task, TaskManager},
            transport::{ProtocolInfo, ResponseClass, TransportHandler, TransportQuery, XRootDTransport},
            worker::{respond_channel, RespondWorker, ResponseHandler},
            Config,
        },
        status::{ErrorCode, Status, StatusKind, XrdResult},
        url::Url,
        xrd::{
            body::{ErrorInfo, RedirectInfo, WaitInfo},
            buffer::Buffer,
            header::{RequestCode, ResponseHeader, ResponseStatus},
            info::{AnyObject, LocationInfo, StatInfo},
            message::Message,
        },
    };
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The poller: socket readiness and per-direction deadlines are watched by
//! one small task per registered socket, but every handler event is funneled
//! through a single dispatch loop. Handler callbacks are therefore fully
//! serialized across all sockets, the way a single event thread would run
//! them; a watcher re-arms only after its event has been consumed.

use crate::{
    app::socket::Socket,
    status::{ErrorCode, Status, XrdResult},
};
use async_trait::async_trait;
use futures::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::Interest,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

/// The socket became readable.
pub const READ_READY: u8 = 0x01;
/// No data arrived within the read deadline.
pub const READ_TIMEOUT: u8 = 0x02;
/// The socket became writable.
pub const WRITE_READY: u8 = 0x04;
/// Pending data could not be written within the write deadline.
pub const WRITE_TIMEOUT: u8 = 0x08;

/// Receiver of socket events.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Handle an event mask for the given sub-stream.
    async fn event(self: Arc<Self>, events: u8, substream: u16);
}

#[derive(Debug, Clone, Copy, Default)]
struct IoInterest {
    read: bool,
    write: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    closed: bool,
}

struct EventDispatch {
    handler: Arc<dyn SocketHandler>,
    events: u8,
    substream: u16,
    done: oneshot::Sender<()>,
}

struct Entry {
    interest: IoInterest,
    ctl: watch::Sender<IoInterest>,
    watcher: JoinHandle<()>,
}

/// Multiplexes socket readiness into handler events.
pub struct Poller {
    sockets: Mutex<HashMap<u64, Entry>>,
    dispatch: Mutex<Option<mpsc::UnboundedSender<EventDispatch>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    /// Create a stopped poller.
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(None),
            dispatcher: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the event dispatch loop and accept socket registrations.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            log::error!("The poller is already running");
            return false;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<EventDispatch>();
        self.dispatch.lock().expect("poller poisoned").replace(tx);
        self.dispatcher
            .lock()
            .expect("poller poisoned")
            .replace(tokio::spawn(async move {
                // every handler callback in the poller runs here, one at
                // a time, regardless of which socket produced it
                while let Some(dispatch) = rx.recv().await {
                    let EventDispatch {
                        handler,
                        events,
                        substream,
                        done,
                    } = dispatch;
                    handler.event(events, substream).await;
                    let _ = done.send(());
                }
                log::debug!("Poller event loop done");
            }));
        true
    }

    /// Deregister every socket, join the watchers and the dispatch loop.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            log::error!("The poller is not running");
            return false;
        }
        let drained: Vec<Entry> = {
            let mut sockets = self.sockets.lock().expect("poller poisoned");
            sockets.drain().map(|(_, e)| e).collect()
        };
        let mut watchers = Vec::new();
        for mut entry in drained {
            entry.interest.closed = true;
            let _ = entry.ctl.send(entry.interest);
            watchers.push(entry.watcher);
        }
        // the queue closes once the poller's sender and every watcher's
        // clone are gone; the dispatcher drains what is left and exits
        drop(self.dispatch.lock().expect("poller poisoned").take());
        join_all(watchers).await;
        let dispatcher = self.dispatcher.lock().expect("poller poisoned").take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        true
    }

    /// Register a socket. Notifications start disabled.
    pub fn add_socket(
        &self,
        socket: Arc<Socket>,
        handler: Arc<dyn SocketHandler>,
        substream: u16,
    ) -> XrdResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Status::error(ErrorCode::Uninitialized));
        }
        let dispatch = match self.dispatch.lock().expect("poller poisoned").as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Status::error(ErrorCode::Uninitialized)),
        };
        let mut sockets = self.sockets.lock().expect("poller poisoned");
        if sockets.contains_key(&socket.id()) {
            return Err(Status::error(ErrorCode::InvalidOp));
        }
        let interest = IoInterest::default();
        let (ctl, ctl_rx) = watch::channel(interest);
        let id = socket.id();
        log::debug!("Adding socket {} ({}) to the poller", id, socket.name());
        let watcher = tokio::spawn(drive(socket, handler, substream, ctl_rx, dispatch));
        sockets.insert(
            id,
            Entry {
                interest,
                ctl,
                watcher,
            },
        );
        Ok(())
    }

    /// Deregister a socket. Its watcher winds down on its own.
    pub fn remove_socket(&self, socket_id: u64) {
        let entry = {
            let mut sockets = self.sockets.lock().expect("poller poisoned");
            sockets.remove(&socket_id)
        };
        if let Some(mut entry) = entry {
            log::debug!("Removing socket {} from the poller", socket_id);
            entry.interest.closed = true;
            let _ = entry.ctl.send(entry.interest);
        }
    }

    /// Whether the socket is registered.
    pub fn is_registered(&self, socket_id: u64) -> bool {
        self.sockets.lock().expect("poller poisoned").contains_key(&socket_id)
    }

    /// Turn read notifications on or off, with an optional idle deadline.
    pub fn enable_read(&self, socket_id: u64, enable: bool, timeout: Option<Duration>) -> XrdResult<()> {
        self.update(socket_id, |interest| {
            interest.read = enable;
            interest.read_deadline = match (enable, timeout) {
                (true, Some(t)) => Some(Instant::now() + t),
                _ => None,
            };
        })
    }

    /// Turn write notifications on or off, with an optional deadline.
    pub fn enable_write(&self, socket_id: u64, enable: bool, timeout: Option<Duration>) -> XrdResult<()> {
        self.update(socket_id, |interest| {
            interest.write = enable;
            interest.write_deadline = match (enable, timeout) {
                (true, Some(t)) => Some(Instant::now() + t),
                _ => None,
            };
        })
    }

    fn update(&self, socket_id: u64, f: impl FnOnce(&mut IoInterest)) -> XrdResult<()> {
        let mut sockets = self.sockets.lock().expect("poller poisoned");
        match sockets.get_mut(&socket_id) {
            Some(entry) => {
                f(&mut entry.interest);
                entry
                    .ctl
                    .send(entry.interest)
                    .map_err(|_| Status::error(ErrorCode::PollerError))
            }
            None => Err(Status::error(ErrorCode::PollerError)),
        }
    }
}

/// Watch one socket for readiness and deadlines. Detected events are queued
/// for the dispatch loop; the watcher re-arms only after the handler has
/// consumed the event, so readiness cannot be reported twice.
async fn drive(
    socket: Arc<Socket>,
    handler: Arc<dyn SocketHandler>,
    substream: u16,
    mut ctl: watch::Receiver<IoInterest>,
    dispatch: mpsc::UnboundedSender<EventDispatch>,
) {
    loop {
        let interest = *ctl.borrow_and_update();
        if interest.closed {
            break;
        }
        if !interest.read && !interest.write {
            if ctl.changed().await.is_err() {
                break;
            }
            continue;
        }
        let io_interest = match (interest.read, interest.write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            _ => unreachable!(),
        };
        let far = Instant::now() + Duration::from_secs(3600 * 24 * 365);
        let read_deadline = interest.read_deadline.unwrap_or(far);
        let write_deadline = interest.write_deadline.unwrap_or(far);
        let events: u8 = tokio::select! {
            ready = socket.ready(io_interest) => {
                let mut events = 0u8;
                match ready {
                    Ok(ready) => {
                        if interest.read && (ready.is_readable() || ready.is_read_closed()) {
                            events |= READ_READY;
                        }
                        if interest.write && (ready.is_writable() || ready.is_write_closed()) {
                            events |= WRITE_READY;
                        }
                    }
                    // surface the failure through the read path
                    Err(_) => events |= READ_READY,
                }
                events
            }
            _ = ctl.changed() => 0,
            _ = tokio::time::sleep_until(read_deadline.into()), if interest.read_deadline.is_some() => {
                READ_TIMEOUT
            }
            _ = tokio::time::sleep_until(write_deadline.into()), if interest.write_deadline.is_some() => {
                WRITE_TIMEOUT
            }
        };
        if events == 0 {
            continue;
        }
        let (done, ack) = oneshot::channel();
        if dispatch
            .send(EventDispatch {
                handler: handler.clone(),
                events,
                substream,
                done,
            })
            .is_err()
        {
            break;
        }
        let _ = ack.await;
    }
    log::debug!("Poller watcher for socket {} done", socket.id());
}

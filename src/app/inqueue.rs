// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The in-queue: the per-stream table of pending incoming-message handlers
//! keyed by stream id. Arriving responses are examined under the queue lock
//! and processed on a job manager worker; responses that arrive before
//! their handler registered are parked and replayed on registration.

use crate::{
    app::{
        job::{Job, JobManager},
        sid::SidManager,
    },
    status::{ErrorCode, Status},
    xrd::message::Message,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

/// No action requested by `examine`.
pub const ACTION_NOP: u8 = 0x00;
/// The handler claims the message; processing is scheduled on a worker.
pub const ACTION_TAKE: u8 = 0x01;
/// The handler asks to be unregistered.
pub const ACTION_REMOVE: u8 = 0x02;

/// Event other than a message arrival, delivered to registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream was declared broken
    Broken,
    /// The handler's deadline passed
    Timeout,
}

/// Capability of an in-flight request handler.
#[async_trait]
pub trait MsgHandler: Send + Sync + 'static {
    /// The stream id this handler waits for.
    fn sid(&self) -> u16;

    /// Look at an arriving message and decide what to do with it. Called
    /// under the in-queue lock; must not block.
    fn examine(&self, msg: &Message) -> u8;

    /// Process a claimed message. Runs on a job manager worker.
    async fn process(self: Arc<Self>, msg: Message);

    /// Handle a stream event. The returned action bits may ask for removal.
    async fn on_stream_event(&self, event: StreamEvent, substream: u16, status: Status) -> u8;

    /// The outgoing side is done with the message: either it was handed to
    /// the socket (an Ok status) or sending failed.
    async fn on_status_ready(&self, msg: Message, status: Status);
}

struct ProcessJob {
    handler: Arc<dyn MsgHandler>,
    msg: Message,
}

#[async_trait]
impl Job for ProcessJob {
    async fn run(self: Box<Self>) {
        let ProcessJob { handler, msg } = *self;
        handler.process(msg).await;
    }
}

#[derive(Default)]
struct InQueueInner {
    handlers: HashMap<u16, (Arc<dyn MsgHandler>, Instant)>,
    orphans: HashMap<u16, Vec<Message>>,
}

/// A synchronized queue for incoming messages.
pub struct InQueue {
    inner: Mutex<InQueueInner>,
    sid_mgr: Arc<SidManager>,
    jobs: Arc<JobManager>,
}

impl InQueue {
    /// Create an in-queue bound to the stream's id allocator and the shared
    /// worker pool.
    pub fn new(sid_mgr: Arc<SidManager>, jobs: Arc<JobManager>) -> Self {
        Self {
            inner: Mutex::new(InQueueInner::default()),
            sid_mgr,
            jobs,
        }
    }

    /// Route an arriving message. If a handler is registered for the stream
    /// id it is examined; a claimed message is processed on a worker, and a
    /// handler asking for removal without claiming drops the message. With
    /// no handler the message is parked, unless its stream id belongs to a
    /// timed out request, in which case it is dropped and the id freed.
    pub fn add_message(&self, msg: Message) {
        let sid = msg.response_sid();
        let mut dispatch: Option<Arc<dyn MsgHandler>> = None;
        {
            let mut inner = self.inner.lock().expect("in-queue poisoned");
            let registered = inner.handlers.get(&sid).map(|(h, _)| h.clone());
            match registered {
                Some(handler) => {
                    let action = handler.examine(&msg);
                    if action & (ACTION_TAKE | ACTION_REMOVE) != 0 {
                        inner.handlers.remove(&sid);
                    }
                    if action & ACTION_TAKE != 0 {
                        dispatch = Some(handler);
                    } else if action & ACTION_REMOVE != 0 {
                        // unregistered without claiming, the message is dead
                        log::debug!("Dropping unclaimed response for stream id {}", sid);
                        return;
                    } else {
                        inner.orphans.entry(sid).or_default().push(msg);
                        return;
                    }
                }
                None => {
                    if self.sid_mgr.is_timed_out(sid) {
                        log::debug!("Dropping late response for timed out stream id {}", sid);
                        self.sid_mgr.release_timed_out(sid);
                        return;
                    }
                    inner.orphans.entry(sid).or_default().push(msg);
                    return;
                }
            }
        }
        if let Some(handler) = dispatch {
            self.schedule(handler, msg);
        }
    }

    /// Register a handler with an expiration time. Messages that arrived
    /// early are replayed through `examine` in arrival order; if one of
    /// them is claimed it is dispatched instead of registering.
    pub fn add_message_handler(&self, handler: Arc<dyn MsgHandler>, expires: Instant) {
        let sid = handler.sid();
        let mut dispatch: Option<Message> = None;
        {
            let mut inner = self.inner.lock().expect("in-queue poisoned");
            let mut orphans = inner.orphans.remove(&sid).unwrap_or_default();
            let mut register = true;
            let mut taken = None;
            for (i, msg) in orphans.iter().enumerate() {
                let action = handler.examine(msg);
                if action & ACTION_TAKE != 0 {
                    taken = Some(i);
                    register = false;
                    break;
                }
                if action & ACTION_REMOVE != 0 {
                    register = false;
                    break;
                }
            }
            if let Some(i) = taken {
                dispatch = Some(orphans.remove(i));
            }
            if !orphans.is_empty() {
                inner.orphans.insert(sid, orphans);
            }
            if register {
                inner.handlers.insert(sid, (handler.clone(), expires));
            }
        }
        if let Some(msg) = dispatch {
            self.schedule(handler, msg);
        }
    }

    /// Unregister the handler waiting for the given stream id.
    pub fn remove_message_handler(&self, sid: u16) {
        self.inner.lock().expect("in-queue poisoned").handlers.remove(&sid);
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.lock().expect("in-queue poisoned").handlers.len()
    }

    /// Notify every handler of a stream event. A handler is removed when it
    /// asks to be; on a broken stream a handler whose request is still
    /// waiting in an out-queue may decline removal and ride out the
    /// reconnect.
    pub async fn report_stream_event(&self, event: StreamEvent, substream: u16, status: Status) {
        let handlers: Vec<(u16, Arc<dyn MsgHandler>)> = {
            let mut inner = self.inner.lock().expect("in-queue poisoned");
            if event == StreamEvent::Broken {
                inner.orphans.clear();
            }
            inner.handlers.iter().map(|(sid, (h, _))| (*sid, h.clone())).collect()
        };
        for (sid, handler) in handlers {
            let action = handler.on_stream_event(event, substream, status).await;
            if action & ACTION_REMOVE != 0 {
                let mut inner = self.inner.lock().expect("in-queue poisoned");
                if let Some((registered, _)) = inner.handlers.get(&sid) {
                    if Arc::ptr_eq(registered, &handler) {
                        inner.handlers.remove(&sid);
                    }
                }
            }
        }
    }

    /// Remove every handler whose deadline passed and fire its timeout
    /// event with an expired-operation error.
    pub async fn report_timeout(&self, now: Instant) {
        let expired: Vec<Arc<dyn MsgHandler>> = {
            let mut inner = self.inner.lock().expect("in-queue poisoned");
            let sids: Vec<u16> = inner
                .handlers
                .iter()
                .filter(|(_, (_, expires))| *expires <= now)
                .map(|(sid, _)| *sid)
                .collect();
            sids.into_iter()
                .filter_map(|sid| inner.handlers.remove(&sid).map(|(h, _)| h))
                .collect()
        };
        for handler in expired {
            handler
                .on_stream_event(StreamEvent::Timeout, 0, Status::error(ErrorCode::OperationExpired))
                .await;
        }
    }

    fn schedule(&self, handler: Arc<dyn MsgHandler>, msg: Message) {
        if let Err(e) = self.jobs.queue(Box::new(ProcessJob { handler, msg })) {
            log::error!("Unable to schedule message processing: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrd::header::ResponseHeader;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn response(sid: u16, status: u16, body: &[u8]) -> Message {
        let header: [u8; 8] = ResponseHeader {
            sid,
            status,
            dlen: body.len() as u32,
        }
        .into();
        Message::from_wire(header, body.to_vec())
    }

    #[derive(Default)]
    struct Probe {
        sid: u16,
        processed: AtomicUsize,
        events: AtomicUsize,
    }

    struct ProbeHandler {
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl MsgHandler for ProbeHandler {
        fn sid(&self) -> u16 {
            self.probe.sid
        }

        fn examine(&self, msg: &Message) -> u8 {
            if msg.response_sid() == self.probe.sid {
                ACTION_TAKE | ACTION_REMOVE
            } else {
                ACTION_NOP
            }
        }

        async fn process(self: Arc<Self>, _msg: Message) {
            self.probe.processed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_stream_event(&self, _event: StreamEvent, _substream: u16, _status: Status) -> u8 {
            self.probe.events.fetch_add(1, Ordering::SeqCst);
            ACTION_REMOVE
        }

        async fn on_status_ready(&self, _msg: Message, _status: Status) {}
    }

    fn queue() -> (InQueue, Arc<JobManager>, Arc<SidManager>) {
        let jobs = Arc::new(JobManager::new());
        jobs.start(1);
        let sid_mgr = Arc::new(SidManager::default());
        (InQueue::new(sid_mgr.clone(), jobs.clone()), jobs, sid_mgr)
    }

    #[tokio::test]
    async fn matches_response_to_handler() {
        let (q, jobs, _) = queue();
        let probe = Arc::new(Probe {
            sid: 1,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() + Duration::from_secs(5),
        );
        q.add_message(response(1, 0, b"HELLO"));
        jobs.stop().await;
        assert_eq!(probe.processed.load(Ordering::SeqCst), 1);
        assert_eq!(q.handler_count(), 0);
    }

    #[tokio::test]
    async fn orphan_is_drained_on_late_registration() {
        let (q, jobs, _) = queue();
        q.add_message(response(2, 0, b"EARLY"));
        let probe = Arc::new(Probe {
            sid: 2,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() + Duration::from_secs(5),
        );
        jobs.stop().await;
        assert_eq!(probe.processed.load(Ordering::SeqCst), 1);
        assert_eq!(q.handler_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_sid_is_dropped_and_freed() {
        let (q, _jobs, sid_mgr) = queue();
        let sid = u16::from_be_bytes(sid_mgr.allocate_sid().unwrap());
        sid_mgr.time_out_sid(sid);
        q.add_message(response(sid, 0, b"LATE"));
        assert!(!sid_mgr.is_timed_out(sid));
        assert_eq!(sid_mgr.allocated_count(), 0);
        // the message must not be parked for replay
        let probe = Arc::new(Probe {
            sid,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(q.handler_count(), 1);
    }

    struct RejectingHandler {
        sid: u16,
    }

    #[async_trait]
    impl MsgHandler for RejectingHandler {
        fn sid(&self) -> u16 {
            self.sid
        }

        fn examine(&self, _msg: &Message) -> u8 {
            ACTION_REMOVE
        }

        async fn process(self: Arc<Self>, _msg: Message) {}

        async fn on_stream_event(&self, _event: StreamEvent, _substream: u16, _status: Status) -> u8 {
            ACTION_REMOVE
        }

        async fn on_status_ready(&self, _msg: Message, _status: Status) {}
    }

    #[tokio::test]
    async fn remove_without_take_drops_the_message() {
        let (q, jobs, _) = queue();
        q.add_message_handler(
            Arc::new(RejectingHandler { sid: 3 }),
            Instant::now() + Duration::from_secs(5),
        );
        q.add_message(response(3, 0, b"DEAD"));
        assert_eq!(q.handler_count(), 0);
        // the message must not be parked for a later registration
        let probe = Arc::new(Probe {
            sid: 3,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(q.handler_count(), 1);
        jobs.stop().await;
        assert_eq!(probe.processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_sweep_fires_events() {
        let (q, _jobs, _) = queue();
        let probe = Arc::new(Probe {
            sid: 4,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() - Duration::from_secs(1),
        );
        q.report_timeout(Instant::now()).await;
        assert_eq!(probe.events.load(Ordering::SeqCst), 1);
        assert_eq!(q.handler_count(), 0);
    }

    #[tokio::test]
    async fn broken_stream_clears_everything() {
        let (q, _jobs, _) = queue();
        let probe = Arc::new(Probe {
            sid: 5,
            ..Default::default()
        });
        q.add_message_handler(
            Arc::new(ProbeHandler { probe: probe.clone() }),
            Instant::now() + Duration::from_secs(5),
        );
        q.report_stream_event(StreamEvent::Broken, 0, Status::error(ErrorCode::StreamDisconnect))
            .await;
        assert_eq!(probe.events.load(Ordering::SeqCst), 1);
        assert_eq!(q.handler_count(), 0);
    }
}

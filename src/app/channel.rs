// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! One channel per host-id. The channel owns the endpoint's stream,
//! forwards send and query calls, and keeps the listener registry for
//! unsolicited push messages.

use crate::{
    app::{
        inqueue::{InQueue, MsgHandler},
        job::JobManager,
        poller::Poller,
        sid::SidManager,
        stream::Stream,
        task::TaskManager,
        transport::{TransportHandler, TransportQuery},
        Config,
    },
    status::{ErrorCode, Status, XrdResult},
    url::Url,
    xrd::{buffer::Buffer, info::AnyObject, message::Message},
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

/// Receiver of unsolicited push messages.
pub trait MessageListener: Send + Sync + 'static {
    /// Look at a push message. Return true to consume it.
    fn on_message(&self, msg: &Message) -> bool;
}

/// Registry of push listeners for one channel.
#[derive(Default)]
pub struct Listeners {
    entries: Mutex<Vec<(Arc<dyn MessageListener>, Option<Instant>)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, optionally with an expiration time.
    pub fn add(&self, listener: Arc<dyn MessageListener>, expires: Option<Instant>) {
        self.entries.lock().expect("listeners poisoned").push((listener, expires));
    }

    /// Remove a previously registered listener.
    pub fn remove(&self, listener: &Arc<dyn MessageListener>) {
        self.entries
            .lock()
            .expect("listeners poisoned")
            .retain(|(l, _)| !Arc::ptr_eq(l, listener));
    }

    /// Offer a push message to the listeners in registration order until
    /// one consumes it.
    pub fn dispatch(&self, msg: Message) {
        let snapshot: Vec<Arc<dyn MessageListener>> = self
            .entries
            .lock()
            .expect("listeners poisoned")
            .iter()
            .map(|(l, _)| l.clone())
            .collect();
        for listener in snapshot {
            if listener.on_message(&msg) {
                return;
            }
        }
        log::debug!("Dropping unclaimed push message: {}", msg);
    }

    /// Drop listeners whose expiration passed.
    pub fn sweep(&self, now: Instant) {
        self.entries
            .lock()
            .expect("listeners poisoned")
            .retain(|(_, expires)| expires.map(|e| e > now).unwrap_or(true));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("listeners poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FilterListener {
    filter: Box<dyn Fn(&Message) -> bool + Send + Sync>,
    tx: Mutex<Option<oneshot::Sender<Message>>>,
}

impl MessageListener for FilterListener {
    fn on_message(&self, msg: &Message) -> bool {
        if !(self.filter)(msg) {
            return false;
        }
        match self.tx.lock().expect("filter listener poisoned").take() {
            Some(tx) => tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }
}

/// Per host-id forwarder owning exactly one stream.
pub struct Channel {
    url: Url,
    stream: Arc<Stream>,
    listeners: Arc<Listeners>,
}

impl Channel {
    /// Create a channel for the URL's endpoint.
    pub fn new(
        url: &Url,
        config: Config,
        transport: Arc<dyn TransportHandler>,
        poller: Arc<Poller>,
        tasks: Arc<TaskManager>,
        jobs: Arc<JobManager>,
    ) -> Self {
        log::debug!("Creating new channel to {}", url.host_id());
        let listeners = Arc::new(Listeners::new());
        let stream = Stream::new(
            url.clone(),
            config,
            transport,
            poller,
            tasks,
            jobs,
            listeners.clone(),
        );
        Self {
            url: url.clone(),
            stream,
            listeners,
        }
    }

    /// The host id this channel serves.
    pub fn host_id(&self) -> String {
        self.url.host_id()
    }

    /// The channel's stream.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// The stream id allocator of the channel's stream.
    pub fn sid_manager(&self) -> Arc<SidManager> {
        self.stream.sid_manager()
    }

    /// The in-queue of the channel's stream.
    pub fn in_queue(&self) -> Arc<InQueue> {
        self.stream.in_queue()
    }

    /// Send a message: register the handler under the stream id already
    /// stamped into the message, then queue the message for the pumps.
    pub async fn send(&self, msg: Message, handler: Arc<dyn MsgHandler>, expires: Instant) -> XrdResult<()> {
        let stateful = msg.request_code().map(|c| c.is_stateful()).unwrap_or(false);
        self.stream.send(msg, handler, expires, stateful).await
    }

    /// Answer a capability query.
    pub fn query_transport(&self, query: TransportQuery) -> XrdResult<AnyObject> {
        match query {
            TransportQuery::SidManager => Ok(AnyObject::SidManager(self.stream.sid_manager())),
            TransportQuery::ProtocolVersion => Ok(AnyObject::Buffer(Buffer::from_bytes(
                self.stream.protocol_info().version.to_be_bytes().to_vec(),
            ))),
            TransportQuery::ServerFlags => Ok(AnyObject::Buffer(Buffer::from_bytes(
                self.stream.protocol_info().flags.to_be_bytes().to_vec(),
            ))),
        }
    }

    /// Register a push listener.
    pub fn receive(&self, listener: Arc<dyn MessageListener>, timeout: Option<Duration>) {
        let expires = timeout.map(|t| Instant::now() + t);
        self.listeners.add(listener, expires);
    }

    /// Remove a push listener.
    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.remove(listener);
    }

    /// Wait for a push message matching the filter.
    pub async fn receive_filtered(
        &self,
        filter: Box<dyn Fn(&Message) -> bool + Send + Sync>,
        timeout: Duration,
    ) -> XrdResult<Message> {
        let (tx, rx) = oneshot::channel();
        let listener: Arc<dyn MessageListener> = Arc::new(FilterListener {
            filter,
            tx: Mutex::new(Some(tx)),
        });
        self.listeners.add(listener.clone(), Some(Instant::now() + timeout));
        let result = tokio::time::timeout(timeout, rx).await;
        self.listeners.remove(&listener);
        match result {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(Status::error(ErrorCode::Internal)),
            Err(_) => Err(Status::error(ErrorCode::OperationExpired)),
        }
    }

    /// Fail everything owned by this channel.
    pub async fn shutdown(&self, status: Status) {
        self.stream.shutdown(status).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrd::header::{RequestCode, ResponseHeader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn push_msg() -> Message {
        let header: [u8; 8] = ResponseHeader {
            sid: 0,
            status: 4001,
            dlen: 4,
        }
        .into();
        Message::from_wire(header, b"evt!".to_vec())
    }

    struct CountingListener {
        hits: Arc<AtomicUsize>,
        consume: bool,
    }

    impl MessageListener for CountingListener {
        fn on_message(&self, _msg: &Message) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.consume
        }
    }

    #[test]
    fn dispatch_stops_at_the_consumer() {
        let listeners = Listeners::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        listeners.add(
            Arc::new(CountingListener {
                hits: first.clone(),
                consume: true,
            }),
            None,
        );
        listeners.add(
            Arc::new(CountingListener {
                hits: second.clone(),
                consume: true,
            }),
            None,
        );
        listeners.dispatch(push_msg());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sweep_drops_expired_listeners() {
        let listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        listeners.add(
            Arc::new(CountingListener {
                hits,
                consume: false,
            }),
            Some(Instant::now() - Duration::from_secs(1)),
        );
        assert_eq!(listeners.len(), 1);
        listeners.sweep(Instant::now());
        assert!(listeners.is_empty());
    }

    #[test]
    fn stateful_flag_follows_the_request_code() {
        assert!(Message::request(RequestCode::Open, "/f")
            .request_code()
            .unwrap()
            .is_stateful());
        assert!(!Message::request(RequestCode::Locate, "/f")
            .request_code()
            .unwrap()
            .is_stateful());
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The post-master facade. It owns the host-id to channel map and the
//! shared background services, allocates a stream id for every outgoing
//! request and wraps the caller's response handler into the dispatch state
//! machine.

use crate::{
    app::{
        channel::{Channel, MessageListener},
        handler::XRootDMsgHandler,
        inqueue::{InQueue, MsgHandler},
        job::JobManager,
        poller::Poller,
        sid::SidManager,
        task::TaskManager,
        transport::{TransportHandler, TransportQuery, XRootDTransport},
        worker::{respond_channel, ResponseHandler},
        Config,
    },
    status::{ErrorCode, Status, XrdResult},
    url::Url,
    xrd::{
        info::AnyObject,
        message::{next_virtual_req_id, Message},
    },
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

pub(crate) struct PostMasterInner {
    config: Config,
    transport: Arc<dyn TransportHandler>,
    poller: Arc<Poller>,
    tasks: Arc<TaskManager>,
    jobs: Arc<JobManager>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    initialized: AtomicBool,
    running: AtomicBool,
}

impl PostMasterInner {
    /// Look the channel up, creating it lazily.
    pub(crate) fn channel(&self, url: &Url) -> XrdResult<Arc<Channel>> {
        if !url.is_valid() {
            return Err(Status::error(ErrorCode::InvalidAddr));
        }
        let mut channels = self.channels.lock().expect("channel map poisoned");
        let key = url.host_id();
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }
        let channel = Arc::new(Channel::new(
            url,
            self.config.clone(),
            self.transport.clone(),
            self.poller.clone(),
            self.tasks.clone(),
            self.jobs.clone(),
        ));
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn TransportHandler> {
        &self.transport
    }

    pub(crate) fn sid_manager_for(&self, url: &Url) -> XrdResult<Arc<SidManager>> {
        Ok(self.channel(url)?.sid_manager())
    }

    pub(crate) fn in_queue_for(&self, url: &Url) -> XrdResult<Arc<InQueue>> {
        Ok(self.channel(url)?.in_queue())
    }

    /// Submit a message whose handler is already built and whose stream id
    /// is already stamped; used for first sends, redirects and wait
    /// resumes alike.
    pub(crate) async fn send_registered(
        &self,
        url: &Url,
        msg: Message,
        handler: Arc<dyn MsgHandler>,
        expires: Instant,
    ) -> XrdResult<()> {
        self.channel(url)?.send(msg, handler, expires).await
    }
}

/// The top level facade of the client runtime.
#[derive(Clone)]
pub struct PostMaster {
    inner: Arc<PostMasterInner>,
}

impl Default for PostMaster {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl PostMaster {
    /// Create a post-master with the given configuration. The background
    /// services exist but do not run until `start`.
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, Arc::new(XRootDTransport::default()))
    }

    /// Create a post-master with a custom transport.
    pub fn with_transport(config: Config, transport: Arc<dyn TransportHandler>) -> Self {
        Self {
            inner: Arc::new(PostMasterInner {
                config,
                transport,
                poller: Arc::new(Poller::new()),
                tasks: Arc::new(TaskManager::new()),
                jobs: Arc::new(JobManager::new()),
                channels: Mutex::new(HashMap::new()),
                initialized: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Prepare the post-master for use.
    pub fn initialize(&self) -> bool {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            log::error!("The post master is already initialized");
            return false;
        }
        true
    }

    /// Start the poller, the task manager and the worker pool.
    pub fn start(&self) -> bool {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            log::error!("The post master is not initialized");
            return false;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            log::error!("The post master is already running");
            return false;
        }
        if !self.inner.poller.start() {
            self.inner.running.store(false, Ordering::SeqCst);
            return false;
        }
        if !self.inner.tasks.start() {
            self.inner.running.store(false, Ordering::SeqCst);
            return false;
        }
        if !self.inner.jobs.start(self.inner.config.worker_threads) {
            self.inner.running.store(false, Ordering::SeqCst);
            return false;
        }
        log::debug!("Post master started");
        true
    }

    /// Stop the background services. Outstanding handlers are not failed;
    /// use `finalize` for that.
    pub async fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            log::error!("The post master is not running");
            return false;
        }
        let poller = self.inner.poller.stop().await;
        let tasks = self.inner.tasks.stop().await;
        self.inner.jobs.stop().await;
        log::debug!("Post master stopped");
        poller && tasks
    }

    /// Fail every outstanding request and drop the channels.
    pub async fn finalize(&self) -> bool {
        let channels: Vec<Arc<Channel>> = {
            let mut map = self.inner.channels.lock().expect("channel map poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.shutdown(Status::error(ErrorCode::StreamDisconnect)).await;
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        true
    }

    /// Tear every channel down and abandon its socket state; meant to be
    /// called in a child process after a fork. Session ids are drawn from a
    /// process-wide monotonic counter, so no message of an old incarnation
    /// can be taken for one of the new.
    pub async fn reinitialize(&self) -> XrdResult<()> {
        let channels: Vec<Arc<Channel>> = {
            let mut map = self.inner.channels.lock().expect("channel map poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.shutdown(Status::error(ErrorCode::InvalidSession)).await;
        }
        Ok(())
    }

    /// Send a message asynchronously. The response handler is invoked
    /// exactly once, on a worker, with the final status.
    pub async fn send(
        &self,
        url: &Url,
        msg: Message,
        handler: Box<dyn ResponseHandler>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(Status::error(ErrorCode::Uninitialized));
        }
        let channel = self.inner.channel(url)?;
        let sid_mgr = channel.sid_manager();
        let sid = match sid_mgr.allocate_sid() {
            Ok(sid) => sid,
            Err(status) => {
                log::error!("[{}] Unable to allocate stream id", url.host_id());
                return Err(status);
            }
        };
        let mut msg = msg;
        msg.set_request_sid(sid);
        if msg.virtual_req_id() == 0 {
            msg.set_virtual_req_id(next_virtual_req_id());
        }
        let expires =
            Instant::now() + timeout.unwrap_or_else(|| self.inner.config.request_timeout_duration());
        let request_code = msg.request_code();
        let msg_handler = XRootDMsgHandler::new(
            handler,
            url.clone(),
            Arc::downgrade(&self.inner),
            sid_mgr.clone(),
            u16::from_be_bytes(sid),
            request_code,
            self.inner.config.redirect_limit,
            expires,
            self.inner.jobs.clone(),
            self.inner.tasks.clone(),
            msg.virtual_req_id(),
        );
        let msg_handler: Arc<dyn MsgHandler> = msg_handler;
        if let Err(status) = channel.send(msg, msg_handler, expires).await {
            sid_mgr.release_sid(u16::from_be_bytes(sid));
            return Err(status);
        }
        Ok(())
    }

    /// Send a message and wait for the outcome. Returns the typed payload
    /// on success, the delivered status otherwise.
    pub async fn send_recv(
        &self,
        url: &Url,
        msg: Message,
        timeout: Option<Duration>,
    ) -> XrdResult<AnyObject> {
        let (worker, rx) = respond_channel();
        self.send(url, msg, worker, timeout).await?;
        match rx.await {
            Ok((status, response)) => {
                if status.is_ok() {
                    Ok(response)
                } else {
                    Err(status)
                }
            }
            Err(_) => Err(Status::error(ErrorCode::Internal)),
        }
    }

    /// Register a listener for unsolicited push messages from the URL's
    /// endpoint, optionally bounded in time.
    pub fn receive(
        &self,
        url: &Url,
        listener: Arc<dyn MessageListener>,
        timeout: Option<Duration>,
    ) -> XrdResult<()> {
        self.inner.channel(url)?.receive(listener, timeout);
        Ok(())
    }

    /// Wait for a push message from the URL's endpoint matching the filter.
    pub async fn receive_filtered(
        &self,
        url: &Url,
        filter: Box<dyn Fn(&Message) -> bool + Send + Sync>,
        timeout: Duration,
    ) -> XrdResult<Message> {
        self.inner.channel(url)?.receive_filtered(filter, timeout).await
    }

    /// Answer a capability query for the URL's channel.
    pub fn query_transport(&self, url: &Url, query: TransportQuery) -> XrdResult<AnyObject> {
        self.inner.channel(url)?.query_transport(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle() {
        let pm = PostMaster::new(Config::default().with_worker_threads(1));
        assert!(pm.initialize());
        assert!(!pm.initialize());
        assert!(pm.start());
        assert!(!pm.start());
        assert!(pm.stop().await);
        assert!(!pm.stop().await);
        assert!(pm.finalize().await);
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let pm = PostMaster::new(Config::default());
        assert!(!pm.start());
    }

    #[tokio::test]
    async fn send_requires_running_services() {
        let pm = PostMaster::new(Config::default());
        let url = Url::parse("root://localhost//x").unwrap();
        let err = pm
            .send(
                &url,
                Message::request(crate::xrd::header::RequestCode::Stat, "/x"),
                Box::new(|_status: Status, _response: AnyObject| {}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Uninitialized);
    }

    #[tokio::test]
    async fn channels_are_shared_by_host_id() {
        let pm = PostMaster::new(Config::default());
        let a = Url::parse("root://u@localhost:1094//a").unwrap();
        let b = Url::parse("root://u@localhost:1094//b?x=1").unwrap();
        let chan_a = pm.inner.channel(&a).unwrap();
        let chan_b = pm.inner.channel(&b).unwrap();
        assert!(Arc::ptr_eq(&chan_a, &chan_b));
        let c = Url::parse("root://other@localhost:1094//a").unwrap();
        let chan_c = pm.inner.channel(&c).unwrap();
        assert!(!Arc::ptr_eq(&chan_a, &chan_c));
    }

    #[tokio::test]
    async fn query_transport_returns_the_sid_manager() {
        let pm = PostMaster::new(Config::default());
        let url = Url::parse("root://localhost//x").unwrap();
        let obj = pm.query_transport(&url, TransportQuery::SidManager).unwrap();
        match obj {
            AnyObject::SidManager(mgr) => {
                assert_eq!(mgr.allocated_count(), 0);
            }
            _ => panic!("expected a sid manager"),
        }
    }
}

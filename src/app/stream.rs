// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-endpoint stream: connection state machine, read framer and write
//! pump over one or more parallel socket legs. All legs feed one in-queue;
//! each leg has its own out-queue. Requests queued on a disconnected stream
//! trigger a connect; on failure the stream breaks, fails its stateful
//! entries and holds the rest for replay.

use crate::{
    app::{
        channel::Listeners,
        inqueue::{InQueue, MsgHandler, StreamEvent},
        job::JobManager,
        next_session_id,
        outqueue::OutQueue,
        poller::{Poller, SocketHandler, READ_READY, READ_TIMEOUT, WRITE_READY, WRITE_TIMEOUT},
        sid::SidManager,
        socket::Socket,
        task::{Task, TaskManager},
        transport::{ProtocolInfo, ResponseClass, TransportHandler},
        Config,
    },
    status::{ErrorCode, Status, XrdResult},
    url::Url,
    xrd::{header::RESPONSE_HEADER_LEN, message::Message},
};
use async_trait::async_trait;
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

/// Connection state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No socket
    Disconnected,
    /// A connect is in flight
    Connecting,
    /// The greeting exchange is running
    HandShaking,
    /// Ready for traffic
    Connected,
    /// The current session failed; cleanup pending
    Broken,
}

struct StateInner {
    state: StreamState,
    protocol: ProtocolInfo,
    failures: u16,
    window_start: Option<Instant>,
}

#[derive(Default)]
struct ReadFramer {
    header: [u8; RESPONSE_HEADER_LEN],
    header_fill: usize,
    body: Vec<u8>,
    body_fill: usize,
    body_len: Option<usize>,
}

enum FramerStep {
    Message(Message),
    Blocked,
    Closed,
    Invalid,
    Failed(i32),
}

impl ReadFramer {
    fn reset(&mut self) {
        self.header_fill = 0;
        self.body = Vec::new();
        self.body_fill = 0;
        self.body_len = None;
    }

    /// Read until a complete frame is assembled or the socket blocks.
    fn pump(&mut self, socket: &Socket, transport: &dyn TransportHandler) -> FramerStep {
        loop {
            if self.header_fill < RESPONSE_HEADER_LEN {
                match socket.try_read(&mut self.header[self.header_fill..]) {
                    Ok(0) => return FramerStep::Closed,
                    Ok(n) => {
                        self.header_fill += n;
                        if self.header_fill < RESPONSE_HEADER_LEN {
                            continue;
                        }
                        match transport.body_size(&self.header) {
                            Ok(dlen) => {
                                self.body_len = Some(dlen as usize);
                                self.body = vec![0; dlen as usize];
                                self.body_fill = 0;
                            }
                            Err(_) => return FramerStep::Invalid,
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FramerStep::Blocked,
                    Err(e) => return FramerStep::Failed(e.raw_os_error().unwrap_or(0)),
                }
            }
            let body_len = self.body_len.unwrap_or(0);
            if self.body_fill < body_len {
                match socket.try_read(&mut self.body[self.body_fill..]) {
                    Ok(0) => return FramerStep::Closed,
                    Ok(n) => {
                        self.body_fill += n;
                        if self.body_fill < body_len {
                            continue;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return FramerStep::Blocked,
                    Err(e) => return FramerStep::Failed(e.raw_os_error().unwrap_or(0)),
                }
            }
            let msg = Message::from_wire(self.header, std::mem::take(&mut self.body));
            self.reset();
            return FramerStep::Message(msg);
        }
    }
}

#[derive(Default)]
struct WriteState {
    buf: Vec<u8>,
    cursor: usize,
}

impl WriteState {
    fn reset(&mut self) {
        self.buf = Vec::new();
        self.cursor = 0;
    }

    fn is_done(&self) -> bool {
        self.cursor >= self.buf.len()
    }
}

enum WriteStep {
    /// The next message was marshalled into the write buffer and its
    /// ownership goes back to the handler
    Staged(Message, Arc<dyn MsgHandler>),
    /// Bytes went out, keep pumping
    Progress,
    /// The message could not be marshalled
    Rejected(Message, Arc<dyn MsgHandler>, Status),
    /// Nothing left to write
    Idle,
    /// The socket is full
    Blocked,
    /// The socket failed
    Failed(Status),
}

struct SubStream {
    socket: Mutex<Option<Arc<Socket>>>,
    out: Mutex<OutQueue>,
    framer: Mutex<ReadFramer>,
    write: Mutex<WriteState>,
}

impl SubStream {
    fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            out: Mutex::new(OutQueue::new()),
            framer: Mutex::new(ReadFramer::default()),
            write: Mutex::new(WriteState::default()),
        }
    }
}

/// A per-endpoint byte stream with N parallel socket legs.
pub struct Stream {
    url: Url,
    config: Config,
    transport: Arc<dyn TransportHandler>,
    poller: Arc<Poller>,
    sid_mgr: Arc<SidManager>,
    in_queue: Arc<InQueue>,
    listeners: Arc<Listeners>,
    session: AtomicU64,
    state: Mutex<StateInner>,
    substreams: Vec<SubStream>,
}

impl Stream {
    /// Create a disconnected stream and register its timeout sweep.
    pub fn new(
        url: Url,
        config: Config,
        transport: Arc<dyn TransportHandler>,
        poller: Arc<Poller>,
        tasks: Arc<TaskManager>,
        jobs: Arc<JobManager>,
        listeners: Arc<Listeners>,
    ) -> Arc<Self> {
        let sid_mgr = Arc::new(SidManager::new(config.sid_ceiling));
        let in_queue = Arc::new(InQueue::new(sid_mgr.clone(), jobs));
        let legs = config.sub_streams_per_channel.max(1) as usize;
        let resolution = Duration::from_secs(config.timeout_resolution.max(1) as u64);
        let stream = Arc::new(Self {
            url,
            config,
            transport,
            poller,
            sid_mgr,
            in_queue,
            listeners,
            session: AtomicU64::new(next_session_id()),
            state: Mutex::new(StateInner {
                state: StreamState::Disconnected,
                protocol: ProtocolInfo::default(),
                failures: 0,
                window_start: None,
            }),
            substreams: (0..legs).map(|_| SubStream::new()).collect(),
        });
        tasks.register_task(
            Arc::new(SweepTask {
                stream: Arc::downgrade(&stream),
            }),
            Instant::now() + resolution,
        );
        stream
    }

    /// The stream id allocator shared with the dispatch handlers.
    pub fn sid_manager(&self) -> Arc<SidManager> {
        self.sid_mgr.clone()
    }

    /// The table of pending incoming-message handlers.
    pub fn in_queue(&self) -> Arc<InQueue> {
        self.in_queue.clone()
    }

    /// The current session incarnation.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Current connection state.
    pub fn state(&self) -> StreamState {
        self.state.lock().expect("stream poisoned").state
    }

    /// Protocol info negotiated during the last handshake.
    pub fn protocol_info(&self) -> ProtocolInfo {
        self.state.lock().expect("stream poisoned").protocol
    }

    /// Queue a message for sending. The handler must already carry the
    /// stream id stamped into the message; it is registered for the reply
    /// before the message can hit the wire.
    pub async fn send(
        self: &Arc<Self>,
        msg: Message,
        handler: Arc<dyn MsgHandler>,
        expires: Instant,
        stateful: bool,
    ) -> XrdResult<()> {
        let leg = self
            .transport
            .multiplex_substream(&msg, self.substreams.len() as u16) as usize;
        let leg = leg.min(self.substreams.len() - 1);
        log::debug!("[{}] Queueing {} on leg {}", self.url.host_id(), msg, leg);
        self.in_queue.add_message_handler(handler.clone(), expires);
        {
            let mut out = self.substreams[leg].out.lock().expect("stream poisoned");
            out.push_back(msg, handler, expires, stateful);
        }
        self.enable_link(leg)
    }

    /// Kick the connection machinery, or enable write notifications when
    /// already connected.
    fn enable_link(self: &Arc<Self>, leg: usize) -> XrdResult<()> {
        let mut state = self.state.lock().expect("stream poisoned");
        match state.state {
            StreamState::Connected => {
                drop(state);
                let socket = self.substreams[leg].socket.lock().expect("stream poisoned").clone();
                if let Some(socket) = socket {
                    // a failure here means the leg is tearing down; the
                    // timeout sweep bounds the queued request
                    if let Err(status) = self.poller.enable_write(
                        socket.id(),
                        true,
                        Some(self.config.stream_timeout_duration()),
                    ) {
                        log::debug!("[{}] Unable to enable write: {}", self.url.host_id(), status);
                    }
                }
                Ok(())
            }
            StreamState::Connecting | StreamState::HandShaking | StreamState::Broken => Ok(()),
            StreamState::Disconnected => {
                state.state = StreamState::Connecting;
                drop(state);
                let stream = self.clone();
                tokio::spawn(async move {
                    stream.run_connect().await;
                });
                Ok(())
            }
        }
    }

    async fn run_connect(self: Arc<Self>) {
        let retries = self.config.connection_retry.max(1);
        let mut attempt = 0;
        let status = loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(sockets) => {
                    self.on_connected(sockets);
                    return;
                }
                Err(status) => {
                    log::error!(
                        "[{}] Connection attempt {} failed: {}",
                        self.url.host_id(),
                        attempt,
                        status
                    );
                    if status.is_fatal() || attempt >= retries {
                        break status;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        self.on_connect_failure(status).await;
    }

    async fn try_connect(&self) -> XrdResult<Vec<Arc<Socket>>> {
        let mut sockets = Vec::with_capacity(self.substreams.len());
        for _ in 0..self.substreams.len() {
            let mut tcp = Socket::connect(&self.url, self.config.connection_window_duration()).await?;
            {
                self.state.lock().expect("stream poisoned").state = StreamState::HandShaking;
            }
            let info = self.transport.hand_shake(&mut tcp, &self.url).await?;
            {
                self.state.lock().expect("stream poisoned").protocol = info;
            }
            sockets.push(Arc::new(Socket::new(tcp)));
        }
        Ok(sockets)
    }

    fn on_connected(self: &Arc<Self>, sockets: Vec<Arc<Socket>>) {
        self.session.store(next_session_id(), Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("stream poisoned");
            state.state = StreamState::Connected;
            state.failures = 0;
            state.window_start = None;
        }
        for (leg, socket) in sockets.into_iter().enumerate() {
            let ss = &self.substreams[leg];
            {
                *ss.socket.lock().expect("stream poisoned") = Some(socket.clone());
                ss.framer.lock().expect("stream poisoned").reset();
                ss.write.lock().expect("stream poisoned").reset();
            }
            let handler: Arc<dyn SocketHandler> = self.clone();
            if let Err(status) = self.poller.add_socket(socket.clone(), handler, leg as u16) {
                log::error!("[{}] Unable to register leg {}: {}", self.url.host_id(), leg, status);
                continue;
            }
            let _ = self
                .poller
                .enable_read(socket.id(), true, Some(self.config.stream_timeout_duration()));
            let pending = !ss.out.lock().expect("stream poisoned").is_empty();
            if pending {
                let _ = self
                    .poller
                    .enable_write(socket.id(), true, Some(self.config.stream_timeout_duration()));
            }
        }
        log::info!("[{}] Stream connected", self.url.host_id());
    }

    async fn on_connect_failure(&self, status: Status) {
        let status = self.escalate(status);
        {
            self.state.lock().expect("stream poisoned").state = StreamState::Disconnected;
        }
        log::error!("[{}] Unable to connect: {}", self.url.host_id(), status);
        self.in_queue
            .report_stream_event(StreamEvent::Broken, 0, status)
            .await;
        for ss in &self.substreams {
            let mut failed = OutQueue::new();
            {
                ss.out.lock().expect("stream poisoned").grab_items(&mut failed);
            }
            failed.report(status).await;
        }
    }

    /// Repeated connection failures within the error window turn into a
    /// fatal status, which disables further retries for the waiting
    /// requests.
    fn escalate(&self, status: Status) -> Status {
        let mut state = self.state.lock().expect("stream poisoned");
        let now = Instant::now();
        let window = Duration::from_secs(self.config.stream_error_window as u64);
        match state.window_start {
            Some(start) if now.duration_since(start) <= window => state.failures += 1,
            _ => {
                state.window_start = Some(now);
                state.failures = 1;
            }
        }
        if state.failures > self.config.connection_retry {
            Status::fatal(ErrorCode::ConnectionError).with_errno(status.errno)
        } else {
            status
        }
    }

    async fn on_readable(self: &Arc<Self>, leg: usize) {
        let ss = &self.substreams[leg];
        let socket = match ss.socket.lock().expect("stream poisoned").clone() {
            Some(socket) => socket,
            None => return,
        };
        loop {
            let step = {
                let mut framer = ss.framer.lock().expect("stream poisoned");
                framer.pump(&socket, self.transport.as_ref())
            };
            match step {
                FramerStep::Message(msg) => self.route(msg, leg),
                FramerStep::Blocked => {
                    let _ = self
                        .poller
                        .enable_read(socket.id(), true, Some(self.config.stream_timeout_duration()));
                    return;
                }
                FramerStep::Closed => {
                    self.on_fatal_error(Status::error(ErrorCode::SocketDisconnected), leg)
                        .await;
                    return;
                }
                FramerStep::Invalid => {
                    self.on_fatal_error(Status::error(ErrorCode::InvalidMessage), leg).await;
                    return;
                }
                FramerStep::Failed(errno) => {
                    self.on_fatal_error(Status::error(ErrorCode::SocketError).with_errno(errno), leg)
                        .await;
                    return;
                }
            }
        }
    }

    fn route(&self, mut msg: Message, leg: usize) {
        msg.set_session_id(self.session.load(Ordering::SeqCst));
        match self.transport.classify(&msg) {
            ResponseClass::Async => {
                log::trace!("[{}] Push message on leg {}", self.url.host_id(), leg);
                self.listeners.dispatch(msg);
            }
            _ => self.in_queue.add_message(msg),
        }
    }

    async fn on_writable(self: &Arc<Self>, leg: usize) {
        let ss = &self.substreams[leg];
        let socket = match ss.socket.lock().expect("stream poisoned").clone() {
            Some(socket) => socket,
            None => return,
        };
        loop {
            match self.write_step(ss, &socket) {
                WriteStep::Staged(msg, handler) => {
                    handler.on_status_ready(msg, Status::ok()).await;
                }
                WriteStep::Progress => {}
                WriteStep::Rejected(msg, handler, status) => {
                    handler.on_status_ready(msg, status).await;
                }
                WriteStep::Idle => {
                    let _ = self.poller.enable_write(socket.id(), false, None);
                    return;
                }
                WriteStep::Blocked => {
                    let _ = self
                        .poller
                        .enable_write(socket.id(), true, Some(self.config.stream_timeout_duration()));
                    return;
                }
                WriteStep::Failed(status) => {
                    self.on_fatal_error(status, leg).await;
                    return;
                }
            }
        }
    }

    fn write_step(&self, ss: &SubStream, socket: &Socket) -> WriteStep {
        let mut write = ss.write.lock().expect("stream poisoned");
        if write.is_done() {
            let entry = ss.out.lock().expect("stream poisoned").pop_front();
            return match entry {
                None => WriteStep::Idle,
                Some(entry) => {
                    let mut msg = entry.msg;
                    if let Err(status) = self.transport.marshall_request(&mut msg) {
                        return WriteStep::Rejected(msg, entry.handler, status);
                    }
                    msg.set_session_id(self.session.load(Ordering::SeqCst));
                    write.buf = msg.as_slice().to_vec();
                    write.cursor = 0;
                    log::debug!("[{}] Sending {}", self.url.host_id(), msg);
                    WriteStep::Staged(msg, entry.handler)
                }
            };
        }
        match socket.try_write(&write.buf[write.cursor..]) {
            Ok(0) => WriteStep::Failed(Status::error(ErrorCode::SocketDisconnected)),
            Ok(n) => {
                write.cursor += n;
                WriteStep::Progress
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteStep::Blocked,
            Err(e) => WriteStep::Failed(
                Status::error(ErrorCode::SocketError).with_errno(e.raw_os_error().unwrap_or(0)),
            ),
        }
    }

    async fn on_read_timeout(self: &Arc<Self>, leg: usize) {
        let active = self.in_queue.handler_count() > 0
            || self.substreams.iter().any(|ss| {
                !ss.out.lock().expect("stream poisoned").is_empty()
                    || !ss.write.lock().expect("stream poisoned").is_done()
            });
        if active {
            self.on_fatal_error(Status::error(ErrorCode::SocketTimeout), leg).await;
            return;
        }
        // idle stream, rearm the deadline
        let socket = self.substreams[leg].socket.lock().expect("stream poisoned").clone();
        if let Some(socket) = socket {
            let _ = self
                .poller
                .enable_read(socket.id(), true, Some(self.config.stream_timeout_duration()));
        }
    }

    async fn on_write_timeout(self: &Arc<Self>, leg: usize) {
        let ss = &self.substreams[leg];
        let pending = !ss.write.lock().expect("stream poisoned").is_done()
            || !ss.out.lock().expect("stream poisoned").is_empty();
        if pending {
            self.on_fatal_error(Status::error(ErrorCode::SocketTimeout), leg).await;
            return;
        }
        let socket = ss.socket.lock().expect("stream poisoned").clone();
        if let Some(socket) = socket {
            let _ = self.poller.enable_write(socket.id(), false, None);
        }
    }

    /// Tear the current session down: fail in-flight handlers, fail the
    /// stateful queue entries, hold the rest for replay and reconnect if
    /// anything is waiting.
    async fn on_fatal_error(self: &Arc<Self>, status: Status, leg: usize) {
        {
            let mut state = self.state.lock().expect("stream poisoned");
            if !matches!(state.state, StreamState::Connected | StreamState::HandShaking) {
                return;
            }
            state.state = StreamState::Broken;
        }
        log::error!("[{}] Stream broken on leg {}: {}", self.url.host_id(), leg, status);
        for ss in &self.substreams {
            let socket = ss.socket.lock().expect("stream poisoned").take();
            if let Some(socket) = socket {
                self.poller.remove_socket(socket.id());
            }
            ss.framer.lock().expect("stream poisoned").reset();
            ss.write.lock().expect("stream poisoned").reset();
        }
        self.in_queue
            .report_stream_event(
                StreamEvent::Broken,
                leg as u16,
                Status::error(ErrorCode::StreamDisconnect).with_errno(status.errno),
            )
            .await;
        let mut stateful = OutQueue::new();
        for ss in &self.substreams {
            ss.out.lock().expect("stream poisoned").grab_stateful(&mut stateful);
        }
        stateful.report(Status::error(ErrorCode::StreamDisconnect)).await;
        self.session.store(next_session_id(), Ordering::SeqCst);
        {
            self.state.lock().expect("stream poisoned").state = StreamState::Disconnected;
        }
        let pending = self
            .substreams
            .iter()
            .any(|ss| !ss.out.lock().expect("stream poisoned").is_empty());
        if pending {
            log::info!("[{}] Replaying queued requests, reconnecting", self.url.host_id());
            let _ = self.enable_link(0);
        }
    }

    /// Fail everything and drop the session, used at finalize time.
    pub async fn shutdown(self: &Arc<Self>, status: Status) {
        {
            self.state.lock().expect("stream poisoned").state = StreamState::Broken;
        }
        for ss in &self.substreams {
            let socket = ss.socket.lock().expect("stream poisoned").take();
            if let Some(socket) = socket {
                self.poller.remove_socket(socket.id());
            }
            ss.framer.lock().expect("stream poisoned").reset();
            ss.write.lock().expect("stream poisoned").reset();
        }
        self.in_queue
            .report_stream_event(StreamEvent::Broken, 0, status)
            .await;
        for ss in &self.substreams {
            let mut failed = OutQueue::new();
            {
                ss.out.lock().expect("stream poisoned").grab_items(&mut failed);
            }
            failed.report(status).await;
        }
        {
            self.state.lock().expect("stream poisoned").state = StreamState::Disconnected;
        }
    }

    async fn sweep(&self, now: Instant) {
        self.in_queue.report_timeout(now).await;
        for ss in &self.substreams {
            let mut expired = OutQueue::new();
            {
                ss.out.lock().expect("stream poisoned").grab_expired(&mut expired, now);
            }
            if !expired.is_empty() {
                expired.report(Status::error(ErrorCode::OperationExpired)).await;
            }
        }
        self.listeners.sweep(now);
    }
}

#[async_trait]
impl SocketHandler for Stream {
    async fn event(self: Arc<Self>, events: u8, substream: u16) {
        let leg = substream as usize;
        if leg >= self.substreams.len() {
            return;
        }
        if events & READ_READY != 0 {
            self.on_readable(leg).await;
        }
        if events & WRITE_READY != 0 {
            self.on_writable(leg).await;
        }
        if events & READ_TIMEOUT != 0 {
            self.on_read_timeout(leg).await;
        }
        if events & WRITE_TIMEOUT != 0 {
            self.on_write_timeout(leg).await;
        }
    }
}

struct SweepTask {
    stream: Weak<Stream>,
}

#[async_trait]
impl Task for SweepTask {
    fn name(&self) -> &str {
        "timeout sweep"
    }

    async fn run(&self, now: Instant) -> Option<Instant> {
        let stream = self.stream.upgrade()?;
        stream.sweep(now).await;
        Some(now + Duration::from_secs(stream.config.timeout_resolution.max(1) as u64))
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The dispatch state machine for one logical request. The handler owns the
//! request message while it is in flight, classifies every reply, drives
//! redirects and server waits, reassembles partial responses and finally
//! delivers a typed result to the user callback, exactly once.

use crate::{
    app::{
        inqueue::{MsgHandler, StreamEvent, ACTION_NOP, ACTION_REMOVE, ACTION_TAKE},
        job::JobManager,
        postmaster::PostMasterInner,
        sid::SidManager,
        task::{Task, TaskManager},
        worker::{DeliverJob, ResponseHandler},
    },
    status::{ErrorCode, Status, XrdResult},
    url::Url,
    xrd::{
        body::{ErrorInfo, RedirectInfo, WaitInfo},
        buffer::Buffer,
        header::{RequestCode, ResponseStatus},
        info::{AnyObject, LocationInfo, StatInfo},
        message::Message,
    },
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

struct HandlerInner {
    url: Url,
    sid: u16,
    sid_mgr: Arc<SidManager>,
    request: Option<Message>,
    request_code: Option<RequestCode>,
    user: Option<Box<dyn ResponseHandler>>,
    partials: Vec<Message>,
    redirects: u16,
    delivered: bool,
    sid_resolved: bool,
}

/// Shepherds one request from submission to delivery.
pub struct XRootDMsgHandler {
    post_master: Weak<PostMasterInner>,
    jobs: Arc<JobManager>,
    tasks: Arc<TaskManager>,
    redirect_limit: u16,
    expires: Instant,
    virtual_req_id: u64,
    inner: Mutex<HandlerInner>,
}

impl XRootDMsgHandler {
    /// Create a handler for a request whose stream id is already stamped.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user: Box<dyn ResponseHandler>,
        url: Url,
        post_master: Weak<PostMasterInner>,
        sid_mgr: Arc<SidManager>,
        sid: u16,
        request_code: Option<RequestCode>,
        redirect_limit: u16,
        expires: Instant,
        jobs: Arc<JobManager>,
        tasks: Arc<TaskManager>,
        virtual_req_id: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            post_master,
            jobs,
            tasks,
            redirect_limit,
            expires,
            virtual_req_id,
            inner: Mutex::new(HandlerInner {
                url,
                sid,
                sid_mgr,
                request: None,
                request_code,
                user: Some(user),
                partials: Vec::new(),
                redirects: 0,
                delivered: false,
                sid_resolved: false,
            }),
        })
    }

    /// The request deadline. It survives redirects and waits unchanged.
    pub fn expires(&self) -> Instant {
        self.expires
    }

    /// Hand the final outcome to the user callback on a worker, releasing
    /// the stream id. Terminal timeouts park the id instead of freeing it.
    fn deliver(&self, status: Status, response: AnyObject, timed_out: bool) {
        let user = {
            let mut inner = self.inner.lock().expect("msg handler poisoned");
            if inner.delivered {
                return;
            }
            inner.delivered = true;
            if !inner.sid_resolved {
                inner.sid_resolved = true;
                if timed_out {
                    inner.sid_mgr.time_out_sid(inner.sid);
                } else {
                    inner.sid_mgr.release_sid(inner.sid);
                }
            }
            inner.partials.clear();
            inner.request = None;
            log::debug!(
                "[{}] Delivering {} for vreq {}",
                inner.url.host_id(),
                status,
                self.virtual_req_id
            );
            inner.user.take()
        };
        if let Some(user) = user {
            let job = DeliverJob {
                user,
                status,
                response,
            };
            if self.jobs.queue(Box::new(job)).is_err() {
                log::error!("Unable to queue response delivery for vreq {}", self.virtual_req_id);
            }
        }
    }

    fn handle_final(&self, msg: Message) {
        let (code, body) = {
            let inner = self.inner.lock().expect("msg handler poisoned");
            let mut body = Vec::new();
            for partial in &inner.partials {
                body.extend_from_slice(partial.response_body());
            }
            body.extend_from_slice(msg.response_body());
            (inner.request_code, body)
        };
        match parse_response(code, body) {
            Ok(response) => self.deliver(Status::ok(), response, false),
            Err(status) => self.deliver(status, AnyObject::None, false),
        }
    }

    async fn handle_partial(self: &Arc<Self>, msg: Message) {
        {
            let mut inner = self.inner.lock().expect("msg handler poisoned");
            inner.partials.push(msg);
        }
        self.reregister().await;
    }

    fn handle_error_response(&self, msg: Message) {
        match ErrorInfo::decode(msg.response_body()) {
            Ok(info) => {
                log::debug!(
                    "Server error for vreq {}: [{}] {}",
                    self.virtual_req_id,
                    info.errnum,
                    info.message
                );
                self.deliver(
                    Status::error(ErrorCode::ErrorResponse).with_errno(info.errnum),
                    AnyObject::None,
                    false,
                );
            }
            Err(status) => self.deliver(status, AnyObject::None, false),
        }
    }

    fn handle_wait(self: &Arc<Self>, msg: Message) {
        let info = match WaitInfo::decode(msg.response_body()) {
            Ok(info) => info,
            Err(status) => {
                self.deliver(status, AnyObject::None, false);
                return;
            }
        };
        let resume = Instant::now() + Duration::from_secs(info.seconds as u64);
        if resume >= self.expires {
            self.deliver(Status::error(ErrorCode::OperationExpired), AnyObject::None, false);
            return;
        }
        log::debug!(
            "Server asked vreq {} to wait {} seconds: {}",
            self.virtual_req_id,
            info.seconds,
            info.message
        );
        self.tasks.register_task(
            Arc::new(WaitTask {
                handler: self.clone(),
            }),
            resume,
        );
    }

    async fn handle_wait_resp(self: &Arc<Self>) {
        // the server will resend unsolicited, stay registered
        self.reregister().await;
    }

    async fn handle_redirect(self: &Arc<Self>, msg: Message) {
        let step: XrdResult<(Message, Url, Arc<PostMasterInner>)> = {
            let mut inner = self.inner.lock().expect("msg handler poisoned");
            inner.redirects += 1;
            if inner.redirects > self.redirect_limit {
                Err(Status::fatal(ErrorCode::RedirectLimit))
            } else {
                self.rewrite_request_redirect(&mut inner, &msg)
            }
        };
        match step {
            Ok((request, url, pm)) => {
                log::info!(
                    "Redirecting vreq {} to {}",
                    self.virtual_req_id,
                    url.host_id()
                );
                if let Err(status) = pm
                    .send_registered(&url, request, self.clone(), self.expires)
                    .await
                {
                    self.deliver(status, AnyObject::None, false);
                }
            }
            Err(status) => self.deliver(status, AnyObject::None, false),
        }
    }

    /// Move the request to the redirect target: release the answered stream
    /// id, allocate a fresh one on the new endpoint's stream, merge the
    /// redirect CGI into the request path and restamp the header.
    fn rewrite_request_redirect(
        &self,
        inner: &mut HandlerInner,
        msg: &Message,
    ) -> XrdResult<(Message, Url, Arc<PostMasterInner>)> {
        let info = RedirectInfo::decode(msg.response_body())?;
        let mut url = inner.url.clone();
        url.set_host(&info.host, info.port);
        if !url.is_valid() {
            return Err(Status::error(ErrorCode::InvalidRedirectUrl));
        }
        let pm = self
            .post_master
            .upgrade()
            .ok_or_else(|| Status::error(ErrorCode::InvalidOp))?;
        // the old endpoint answered, so its id goes back as a normal release
        inner.sid_mgr.release_sid(inner.sid);
        inner.sid_resolved = true;
        let sid_mgr = pm.sid_manager_for(&url)?;
        let sid = sid_mgr.allocate_sid()?;
        let mut request = match inner.request.take() {
            Some(request) => request,
            None => {
                sid_mgr.release_sid(u16::from_be_bytes(sid));
                return Err(Status::error(ErrorCode::Internal));
            }
        };
        pm.transport().unmarshall_request(&mut request)?;
        request.set_request_sid(sid);
        if !info.cgi.is_empty() {
            let merges = request
                .request_code()
                .map(|c| c.carries_path())
                .unwrap_or(false);
            if merges {
                if let Some(path) = request.request_path() {
                    let separator = if path.contains('?') { '&' } else { '?' };
                    request.set_request_path(&format!("{}{}{}", path, separator, info.cgi));
                }
            }
        }
        inner.sid = u16::from_be_bytes(sid);
        inner.sid_mgr = sid_mgr;
        inner.sid_resolved = false;
        inner.url = url.clone();
        inner.partials.clear();
        Ok((request, url, pm))
    }

    /// Re-register this handler in the in-queue of its current endpoint.
    async fn reregister(self: &Arc<Self>) {
        let url = {
            self.inner.lock().expect("msg handler poisoned").url.clone()
        };
        match self.post_master.upgrade() {
            Some(pm) => match pm.in_queue_for(&url) {
                Ok(queue) => {
                    let handler: Arc<dyn MsgHandler> = self.clone();
                    queue.add_message_handler(handler, self.expires);
                }
                Err(status) => self.deliver(status, AnyObject::None, false),
            },
            None => self.deliver(Status::error(ErrorCode::InvalidOp), AnyObject::None, false),
        }
    }

    /// Resume after a server wait: resubmit the request to the current
    /// endpoint with the original deadline.
    pub async fn wait_done(self: Arc<Self>, now: Instant) {
        if now >= self.expires {
            self.deliver(Status::error(ErrorCode::OperationExpired), AnyObject::None, false);
            return;
        }
        let step: XrdResult<(Message, Url, Arc<PostMasterInner>)> = {
            let mut inner = self.inner.lock().expect("msg handler poisoned");
            if inner.delivered {
                return;
            }
            let pm = self
                .post_master
                .upgrade()
                .ok_or_else(|| Status::error(ErrorCode::InvalidOp));
            match (pm, inner.request.take()) {
                (Ok(pm), Some(request)) => Ok((request, inner.url.clone(), pm)),
                (Err(status), _) => Err(status),
                (_, None) => Err(Status::error(ErrorCode::Internal)),
            }
        };
        match step {
            Ok((request, url, pm)) => {
                if let Err(status) = pm
                    .send_registered(&url, request, self.clone(), self.expires)
                    .await
                {
                    self.deliver(status, AnyObject::None, false);
                }
            }
            Err(status) => self.deliver(status, AnyObject::None, false),
        }
    }
}

#[async_trait]
impl MsgHandler for XRootDMsgHandler {
    fn sid(&self) -> u16 {
        self.inner.lock().expect("msg handler poisoned").sid
    }

    fn examine(&self, msg: &Message) -> u8 {
        let inner = self.inner.lock().expect("msg handler poisoned");
        if inner.delivered {
            return ACTION_REMOVE;
        }
        match msg.response_status() {
            // async pushes are never matched by stream id
            Some(ResponseStatus::Attn) => ACTION_NOP,
            _ if msg.response_sid() != inner.sid => ACTION_NOP,
            Some(ResponseStatus::OkSoFar)
            | Some(ResponseStatus::Wait)
            | Some(ResponseStatus::WaitResp) => ACTION_TAKE,
            _ => ACTION_TAKE | ACTION_REMOVE,
        }
    }

    async fn process(self: Arc<Self>, msg: Message) {
        match msg.response_status() {
            Some(ResponseStatus::Ok) => self.handle_final(msg),
            Some(ResponseStatus::OkSoFar) => self.handle_partial(msg).await,
            Some(ResponseStatus::Error) => self.handle_error_response(msg),
            Some(ResponseStatus::Redirect) => self.handle_redirect(msg).await,
            Some(ResponseStatus::Wait) => self.handle_wait(msg),
            Some(ResponseStatus::WaitResp) => self.handle_wait_resp().await,
            Some(ResponseStatus::Attn) | Some(ResponseStatus::AuthMore) | None => {
                self.deliver(Status::error(ErrorCode::InvalidResponse), AnyObject::None, false)
            }
        }
    }

    async fn on_stream_event(&self, event: StreamEvent, _substream: u16, status: Status) -> u8 {
        match event {
            StreamEvent::Broken => {
                // a request that never reached the socket is still queued
                // for replay; its fate is decided by the out-queue
                let replayable = {
                    let inner = self.inner.lock().expect("msg handler poisoned");
                    !inner.delivered && inner.request.is_none()
                };
                if replayable {
                    return ACTION_NOP;
                }
                let status = if status.is_error() {
                    status
                } else {
                    Status::error(ErrorCode::StreamDisconnect)
                };
                self.deliver(status, AnyObject::None, false);
            }
            StreamEvent::Timeout => {
                self.deliver(Status::error(ErrorCode::OperationExpired), AnyObject::None, true);
            }
        }
        ACTION_REMOVE
    }

    async fn on_status_ready(&self, msg: Message, status: Status) {
        if status.is_ok() {
            let mut inner = self.inner.lock().expect("msg handler poisoned");
            if !inner.delivered {
                inner.request = Some(msg);
            }
            return;
        }
        self.deliver(status, AnyObject::None, false);
    }
}

struct WaitTask {
    handler: Arc<XRootDMsgHandler>,
}

#[async_trait]
impl Task for WaitTask {
    fn name(&self) -> &str {
        "wait resume"
    }

    async fn run(&self, now: Instant) -> Option<Instant> {
        self.handler.clone().wait_done(now).await;
        None
    }
}

/// Turn a successful response body into the typed payload for the request.
fn parse_response(code: Option<RequestCode>, body: Vec<u8>) -> XrdResult<AnyObject> {
    match code {
        Some(RequestCode::Locate) => {
            let text = String::from_utf8_lossy(&body);
            Ok(AnyObject::Locations(LocationInfo::parse(&text)?))
        }
        Some(RequestCode::Stat) => {
            let text = String::from_utf8_lossy(&body);
            Ok(AnyObject::Stat(StatInfo::parse(&text)?))
        }
        Some(RequestCode::DirList) => {
            let text = String::from_utf8_lossy(&body);
            Ok(AnyObject::Strings(
                text.split('\n')
                    .map(|l| l.trim_end_matches('\0').to_string())
                    .filter(|l| !l.is_empty())
                    .collect(),
            ))
        }
        _ => {
            if body.is_empty() {
                Ok(AnyObject::None)
            } else {
                Ok(AnyObject::Buffer(Buffer::from_bytes(body)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dispatches_by_request_code() {
        let locations = parse_response(
            Some(RequestCode::Locate),
            b"Sr disk7.cern.ch:1094".to_vec(),
        )
        .unwrap();
        assert!(matches!(locations, AnyObject::Locations(_)));

        let stat = parse_response(Some(RequestCode::Stat), b"id 100 0 0".to_vec()).unwrap();
        assert!(matches!(stat, AnyObject::Stat(_)));

        let listing =
            parse_response(Some(RequestCode::DirList), b"a.root\nb.root\n".to_vec()).unwrap();
        assert!(matches!(listing, AnyObject::Strings(v) if v.len() == 2));

        let raw = parse_response(Some(RequestCode::Read), b"HELLO".to_vec()).unwrap();
        assert_eq!(raw.as_buffer().unwrap().as_slice(), b"HELLO");

        let empty = parse_response(Some(RequestCode::Rm), Vec::new()).unwrap();
        assert!(empty.is_none());
    }
}

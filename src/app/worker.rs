// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! User facing response callbacks. A response handler is consumed exactly
//! once, on a job manager worker, with the final status and the typed
//! payload. The respond worker bridges the callback onto a oneshot channel
//! for the synchronous send path.

use crate::{app::job::Job, status::Status, xrd::info::AnyObject};
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Receives the outcome of one request.
pub trait ResponseHandler: Send + 'static {
    /// Called exactly once with the final status. On success the payload
    /// holds the typed response, otherwise it is empty.
    fn handle_response(self: Box<Self>, status: Status, response: AnyObject);
}

impl<F> ResponseHandler for F
where
    F: FnOnce(Status, AnyObject) + Send + 'static,
{
    fn handle_response(self: Box<Self>, status: Status, response: AnyObject) {
        (*self)(status, response)
    }
}

/// A response handler which forwards the outcome over a oneshot channel.
pub struct RespondWorker {
    tx: oneshot::Sender<(Status, AnyObject)>,
}

impl ResponseHandler for RespondWorker {
    fn handle_response(self: Box<Self>, status: Status, response: AnyObject) {
        if self.tx.send((status, response)).is_err() {
            log::debug!("Response receiver dropped before delivery");
        }
    }
}

/// Create a respond worker and the receiving end of its channel.
pub fn respond_channel() -> (Box<RespondWorker>, oneshot::Receiver<(Status, AnyObject)>) {
    let (tx, rx) = oneshot::channel();
    (Box::new(RespondWorker { tx }), rx)
}

/// The job that runs a user callback on a worker.
pub(crate) struct DeliverJob {
    pub(crate) user: Box<dyn ResponseHandler>,
    pub(crate) status: Status,
    pub(crate) response: AnyObject,
}

#[async_trait]
impl Job for DeliverJob {
    async fn run(self: Box<Self>) {
        let DeliverJob {
            user,
            status,
            response,
        } = *self;
        user.handle_response(status, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app::job::JobManager, status::ErrorCode};

    #[tokio::test]
    async fn respond_worker_bridges_the_callback() {
        let (worker, rx) = respond_channel();
        worker.handle_response(Status::error(ErrorCode::NotFound), AnyObject::None);
        let (status, response) = rx.await.unwrap();
        assert_eq!(status.code, ErrorCode::NotFound);
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn deliver_job_consumes_the_handler() {
        let jobs = JobManager::new();
        jobs.start(1);
        let (worker, rx) = respond_channel();
        jobs.queue(Box::new(DeliverJob {
            user: worker,
            status: Status::ok(),
            response: AnyObject::Strings(vec!["a".to_string()]),
        }))
        .unwrap();
        let (status, response) = rx.await.unwrap();
        assert!(status.is_ok());
        assert!(matches!(response, AnyObject::Strings(v) if v == vec!["a".to_string()]));
        jobs.stop().await;
    }
}

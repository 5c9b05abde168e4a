// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The out-queue: ordered outgoing messages, each with its handler, a
//! deadline and a stateful flag. On disconnect the stateful subset is
//! extracted and failed while the rest is held for replay.

use crate::{app::inqueue::MsgHandler, status::Status, xrd::message::Message};
use std::{collections::VecDeque, sync::Arc, time::Instant};

/// One queued outgoing message.
pub struct OutMessage {
    /// The message to put on the wire
    pub msg: Message,
    /// Handler shepherding the request
    pub handler: Arc<dyn MsgHandler>,
    /// Deadline of the request
    pub expires: Instant,
    /// Whether the operation depends on server-side state
    pub stateful: bool,
}

/// FIFO of outgoing messages.
#[derive(Default)]
pub struct OutQueue {
    messages: VecDeque<OutMessage>,
}

impl OutQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the back of the queue.
    pub fn push_back(&mut self, msg: Message, handler: Arc<dyn MsgHandler>, expires: Instant, stateful: bool) {
        self.messages.push_back(OutMessage {
            msg,
            handler,
            expires,
            stateful,
        });
    }

    /// Add a message to the front of the queue.
    pub fn push_front(&mut self, msg: Message, handler: Arc<dyn MsgHandler>, expires: Instant, stateful: bool) {
        self.messages.push_front(OutMessage {
            msg,
            handler,
            expires,
            stateful,
        });
    }

    /// Take the message at the front of the queue.
    pub fn pop_front(&mut self) -> Option<OutMessage> {
        self.messages.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Move the entries whose deadline passed into another queue.
    pub fn grab_expired(&mut self, other: &mut OutQueue, now: Instant) {
        let mut keep = VecDeque::with_capacity(self.messages.len());
        for entry in self.messages.drain(..) {
            if entry.expires <= now {
                other.messages.push_back(entry);
            } else {
                keep.push_back(entry);
            }
        }
        self.messages = keep;
    }

    /// Move the stateful entries into another queue.
    pub fn grab_stateful(&mut self, other: &mut OutQueue) {
        let mut keep = VecDeque::with_capacity(self.messages.len());
        for entry in self.messages.drain(..) {
            if entry.stateful {
                other.messages.push_back(entry);
            } else {
                keep.push_back(entry);
            }
        }
        self.messages = keep;
    }

    /// Move every entry into another queue, preserving order.
    pub fn grab_items(&mut self, other: &mut OutQueue) {
        other.messages.extend(self.messages.drain(..));
    }

    /// Drain the queue, reporting the given status to every handler. Each
    /// message is handed back to its handler.
    pub async fn report(&mut self, status: Status) {
        while let Some(entry) = self.messages.pop_front() {
            entry.handler.on_status_ready(entry.msg, status).await;
        }
    }
}

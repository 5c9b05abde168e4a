// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Stream id allocation. Every stream owns one allocator; an id is handed
//! out to exactly one in-flight request at a time and recycled on release.
//! Ids whose request timed out are parked separately so a late reply can be
//! recognized and discarded instead of being routed to a fresh request.

use crate::status::{ErrorCode, Status, XrdResult};
use std::{
    collections::HashSet,
    sync::Mutex,
};

/// Allocates and recycles the 16 bit stream ids of one stream.
#[derive(Debug)]
pub struct SidManager {
    inner: Mutex<SidInner>,
    ceiling_limit: u16,
}

#[derive(Debug)]
struct SidInner {
    ceiling: u16,
    free: Vec<u16>,
    timed_out: HashSet<u16>,
}

impl Default for SidManager {
    fn default() -> Self {
        Self::new(0xFFFF)
    }
}

impl SidManager {
    /// Create an allocator that fails once `ceiling_limit` would be reached.
    pub fn new(ceiling_limit: u16) -> Self {
        Self {
            inner: Mutex::new(SidInner {
                ceiling: 1,
                free: Vec::new(),
                timed_out: HashSet::new(),
            }),
            ceiling_limit: ceiling_limit.max(2),
        }
    }

    /// Allocate a stream id, as two big-endian bytes ready for the request
    /// header. Recycled ids are preferred over advancing the ceiling.
    pub fn allocate_sid(&self) -> XrdResult<[u8; 2]> {
        let mut inner = self.inner.lock().expect("sid manager poisoned");
        let sid = match inner.free.pop() {
            Some(sid) => sid,
            None => {
                if inner.ceiling >= self.ceiling_limit {
                    return Err(Status::error(ErrorCode::NoMoreFreeSids));
                }
                let sid = inner.ceiling;
                inner.ceiling += 1;
                sid
            }
        };
        Ok(sid.to_be_bytes())
    }

    /// Return a stream id to the free pool.
    pub fn release_sid(&self, sid: u16) {
        let mut inner = self.inner.lock().expect("sid manager poisoned");
        inner.timed_out.remove(&sid);
        inner.free.push(sid);
    }

    /// Park a stream id whose request timed out.
    pub fn time_out_sid(&self, sid: u16) {
        let mut inner = self.inner.lock().expect("sid manager poisoned");
        inner.timed_out.insert(sid);
    }

    /// Whether the id belongs to a timed out request.
    pub fn is_timed_out(&self, sid: u16) -> bool {
        self.inner.lock().expect("sid manager poisoned").timed_out.contains(&sid)
    }

    /// Free a parked id after its late reply has been seen and discarded.
    pub fn release_timed_out(&self, sid: u16) {
        let mut inner = self.inner.lock().expect("sid manager poisoned");
        if inner.timed_out.remove(&sid) {
            inner.free.push(sid);
        }
    }

    /// Free every parked id.
    pub fn release_all_timed_out(&self) {
        let mut inner = self.inner.lock().expect("sid manager poisoned");
        let parked: Vec<u16> = inner.timed_out.drain().collect();
        inner.free.extend(parked);
    }

    /// Number of ids currently held by in-flight requests.
    pub fn allocated_count(&self) -> u16 {
        let inner = self.inner.lock().expect("sid manager poisoned");
        inner.ceiling - 1 - inner.free.len() as u16 - inner.timed_out.len() as u16
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Typed response payloads. The post-master hands results to user callbacks
//! as an [`AnyObject`], a tagged union over the small set of payload shapes
//! the protocol can produce.

use crate::{
    app::sid::SidManager,
    status::{ErrorCode, Status, XrdResult},
    xrd::buffer::Buffer,
};
use std::sync::Arc;

/// A typed response payload.
#[derive(Debug, Clone)]
pub enum AnyObject {
    /// No payload
    None,
    /// Locations of a resource, from kXR_locate
    Locations(LocationInfo),
    /// Object or filesystem metadata, from kXR_stat
    Stat(StatInfo),
    /// Raw response bytes
    Buffer(Buffer),
    /// A list of entries, from kXR_dirlist
    Strings(Vec<String>),
    /// The stream id allocator of a channel, from a transport query
    SidManager(Arc<SidManager>),
}

impl AnyObject {
    pub fn is_none(&self) -> bool {
        matches!(self, AnyObject::None)
    }

    /// The payload as raw bytes, if it carries any.
    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            AnyObject::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

/// Type of a single location entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationType {
    /// A manager that is online
    ManagerOnline,
    /// A manager that is pending
    ManagerPending,
    /// A data server that is online
    ServerOnline,
    /// A data server that is pending
    ServerPending,
}

/// Access mode offered by a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Read only
    Read,
    /// Read and write
    ReadWrite,
}

/// One entry of a locate response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// The `host:port` address of the location
    pub address: String,
    /// Node type
    pub location_type: LocationType,
    /// Access mode
    pub access: AccessType,
}

/// The parsed body of a kXR_locate response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationInfo {
    locations: Vec<Location>,
}

impl LocationInfo {
    /// Parse the space separated location list sent by the server. Each
    /// entry is a node type character, an access character, and an address.
    pub fn parse(data: &str) -> XrdResult<Self> {
        let mut locations = Vec::new();
        for entry in data.split(' ').filter(|e| !e.is_empty()) {
            if let Some(location) = Self::parse_entry(entry) {
                locations.push(location);
            }
        }
        if locations.is_empty() {
            return Err(Status::error(ErrorCode::InvalidResponse));
        }
        Ok(Self { locations })
    }

    fn parse_entry(entry: &str) -> Option<Location> {
        let mut chars = entry.chars();
        let location_type = match chars.next()? {
            'M' => LocationType::ManagerOnline,
            'm' => LocationType::ManagerPending,
            'S' => LocationType::ServerOnline,
            's' => LocationType::ServerPending,
            _ => return None,
        };
        let access = match chars.next()? {
            'r' => AccessType::Read,
            'w' => AccessType::ReadWrite,
            _ => return None,
        };
        let address: String = chars.collect();
        if !address.contains(':') {
            return None;
        }
        Some(Location {
            address,
            location_type,
            access,
        })
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }
}

/// The parsed body of a kXR_stat response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatInfo {
    /// Metadata of a single object
    Object {
        /// Server supplied object id
        id: String,
        /// Size in bytes
        size: u64,
        /// Status flag bits
        flags: u32,
        /// Modification time, seconds since the epoch
        mod_time: u64,
    },
    /// Metadata of a virtual file system
    Vfs {
        /// Number of read/write nodes
        nodes_rw: u64,
        /// Largest free chunk in the rw space, in MB
        free_rw: u64,
        /// Utilization of the rw space, percent
        utilization_rw: u8,
        /// Number of staging nodes
        nodes_staging: u64,
        /// Largest free chunk in the staging space, in MB
        free_staging: u64,
        /// Utilization of the staging space, percent
        utilization_staging: u8,
    },
}

impl StatInfo {
    /// Parse the space separated stat response. Four words describe an
    /// object, six words a virtual file system.
    pub fn parse(data: &str) -> XrdResult<Self> {
        let chunks: Vec<&str> = data.trim_end_matches('\0').split(' ').filter(|c| !c.is_empty()).collect();
        let invalid = Status::error(ErrorCode::InvalidResponse);
        match chunks.len() {
            4 => Ok(StatInfo::Object {
                id: chunks[0].to_string(),
                size: chunks[1].parse().map_err(|_| invalid)?,
                flags: chunks[2].parse().map_err(|_| invalid)?,
                mod_time: chunks[3].parse().map_err(|_| invalid)?,
            }),
            6 => Ok(StatInfo::Vfs {
                nodes_rw: chunks[0].parse().map_err(|_| invalid)?,
                free_rw: chunks[1].parse().map_err(|_| invalid)?,
                utilization_rw: chunks[2].parse().map_err(|_| invalid)?,
                nodes_staging: chunks[3].parse().map_err(|_| invalid)?,
                free_staging: chunks[4].parse().map_err(|_| invalid)?,
                utilization_staging: chunks[5].parse().map_err(|_| invalid)?,
            }),
            _ => Err(invalid),
        }
    }
}

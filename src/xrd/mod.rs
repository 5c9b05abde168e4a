// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The XRootD wire layer: binary buffers, the message envelope, the fixed
//! request/response headers and the response bodies the dispatch state
//! machine needs to understand.

/// Redirect, wait and error response bodies
pub mod body;
/// Growable binary blob with an append cursor
pub mod buffer;
/// Fixed wire headers and the kXR_* codes
pub mod header;
/// Typed response payloads handed to user callbacks
pub mod info;
/// The message envelope
pub mod message;

pub use body::*;
pub use buffer::*;
pub use header::*;
pub use info::*;
pub use message::*;

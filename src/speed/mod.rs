//! Outbound HTTP surface towards speed nodes.

mod client;

pub use client::{RawResponse, RealtimeEntry, RepoMeta, Sibling, SpeedClient};

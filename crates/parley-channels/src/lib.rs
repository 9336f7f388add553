//! Channel sources for parley
//!
//! This crate provides the concrete repositories the pipeline resolves
//! channels and routing configurations from: an operator-fed channel list,
//! `ChannelRouting` definition files, and a remote routing API.

pub mod api;
pub mod document;
pub mod file;
pub mod operator;

// Re-export main types
pub use api::{ApiChannelRepository, ApiChannelRoutingRepository};
pub use document::{CHANNEL_ROUTING_KIND, ChannelRoutingDocument};
pub use file::FileBasedChannelRoutingRepository;
pub use operator::OperatorChannelRepository;

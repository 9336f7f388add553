//! A2A (Agent-to-Agent) dispatch for parley
//!
//! Turns are handed to agents as A2A tasks over HTTP:
//! - POST /a2a/tasks      - Submit a task
//! - GET  /a2a/tasks/:id  - Poll task status

pub mod client;
pub mod protocol;

pub use client::HttpAgentClient;
pub use protocol::{TaskMessage, TaskRequest, TaskResponse, TaskStatus};

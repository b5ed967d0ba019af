//! Core engine for the quill coding assistant.
//!
//! The pieces fit together like this: the presentation layer calls
//! [`agent::Agent::run`], which streams completions from a [`provider`]
//! adapter, accumulates them into persisted [`message`]s, and dispatches
//! model-issued tool calls into the [`tools`] surface. Mutating tools block
//! on the [`permission`] broker; every store change is fanned out through
//! the [`pubsub`] bus so observers stay eventually consistent without
//! touching the stores directly.

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod lsp;
pub mod message;
pub mod models;
pub mod permission;
pub mod provider;
pub mod pubsub;
pub mod storage;
pub mod tools;

pub use error::QuillError;

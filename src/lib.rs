#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod data;
pub mod graft;
pub mod outline;
pub mod reddit;
pub mod resolve;
pub mod session;
pub mod tree;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
pub use graft::{graft, Batch, ReplyRecord};
pub use resolve::{populate, resolve, Resolution, TreeError};
pub use session::{CommentTreeSession, ExpandOutcome, SessionError, SessionEvent, SessionState};
pub use tree::{
    Anchor, CommentId, CommentNode, Forest, ForestSnapshot, NodeId, ParentRef, Payload,
    Placeholder, PlaceholderId, PlaceholderSlot,
};

//! Event model and topic validation
//!
//! This module implements the event structure exchanged with local producers
//! and listeners, and the rules for splicing event types into broker topics.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

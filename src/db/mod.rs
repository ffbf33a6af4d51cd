//! Row-level operations on the three queue tables.
//!
//! Everything here takes a `&mut SqliteConnection` and leaves transaction
//! boundaries to the caller, so that several operations can be composed into
//! one atomic unit by [`crate::engine::QueueEngine`].

pub mod claim;
pub mod dead_letter;
pub mod message;
pub mod queue;
pub mod statements;

//! Wire-format data structures shared by outgoing and incoming activities.

pub mod context;
pub mod helpers;
pub mod public_key;
pub mod tombstone;
pub mod verification;

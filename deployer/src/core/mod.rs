//! Pure resolution logic for the deployer.
//!
//! Nothing in here touches the filesystem or spawns processes. Documents come
//! in through [`application::DocumentSource`] and values through
//! [`context::ResolutionContext`].

pub mod addons;
pub mod application;
pub mod context;
pub mod error;
pub mod outputs;
pub mod parameters;
pub mod types;
pub mod variables;

//! Compare a user's body pose against a reference performance, frame by
//! frame, offline or live.

pub mod annotate;
pub mod bridge;
pub mod compare;
pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod frame;
pub mod job;
pub mod pipeline;
pub mod pose;
pub mod registry;
pub mod render;
pub mod session;
pub mod transport;
pub mod video;

#[cfg(test)]
mod testing;

pub use error::Error;

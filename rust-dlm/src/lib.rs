//! rust-dlm library crate.
//!
//! Job orchestration and process supervision for user-submitted media
//! downloads: a durable job store, a concurrency-gated queue, a supervisor
//! for the external downloader binary, and a history projection. The
//! graphical shell links against this crate and consumes its broadcast
//! channels.

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod parser;
pub mod queue;
pub mod resolver;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod updater;

pub use error::{Error, Result};

//! Aid: buffered, deduplicating file persistence for image-board downloads.
//!
//! Producers hand `(path, bytes)` pairs to a [`BufferedWriter`](io::BufferedWriter),
//! which writes them on a background thread, skips anything its
//! [`DuplicateFilter`](io::DuplicateFilter) already knows and drains completely on shutdown.

pub mod config;
pub mod database;
pub mod io;
pub mod logger;
pub mod program;

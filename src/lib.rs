//! Download orchestration for remote video/audio streams.
//!
//! [`downloader::manager::DownloadManager`] is the entry point: it resolves
//! metadata through a cache and a pooled HTTP session, picks a format under a
//! quality ceiling, transfers it in retried chunks and hands the result to the
//! muxing and subtitle collaborators in [`processing`].

pub mod config;
pub mod downloader;
pub mod errors;
pub mod processing;
pub mod utils;

pub use config::AppConfig;
pub use downloader::manager::{Collaborators, DownloadManager};
pub use errors::{AppError, ErrorKind, Result};

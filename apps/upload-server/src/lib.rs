//! Chunked upload server: configuration, request handling and process wiring.

pub mod app;
pub mod config;
pub mod handler;

pub use app::{Running, run, start};
pub use config::Config;
pub use handler::UploadHandler;

// ABOUTME: Library side of the chatwire command-line tools
// ABOUTME: File-backed storage, transcript replay and offline field validation

pub mod file_storage;
pub mod replay;
pub mod validate;

pub use chatwire_core::{config, paths};

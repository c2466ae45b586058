#![forbid(unsafe_code)]

// VibeCall library - SFU session and media-object orchestration

pub mod client;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod registry;
pub mod signaling;

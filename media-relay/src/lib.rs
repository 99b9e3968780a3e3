//! media-relay library crate.
//!
//! A bounded acquisition queue driving yt-dlp and ffmpeg, a normalizer for
//! their progress output, an event fan-out to observers and remote playback
//! on a VLC player.

pub mod artifacts;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod playback;
pub mod progress;
pub mod service;
pub mod store;
pub mod tools;

pub use config::AppConfig;
pub use error::{Error, ErrorCategory, Result};
pub use service::{RelayService, ToolSet};

//! ffpilot - Supervised FFmpeg Transcoding Driver
//!
//! A Rust library for driving ffmpeg transcoding runs as supervised child
//! processes: declarative command construction, live progress parsing,
//! stall detection, piped-output fan-out, and media inspection via ffprobe.

pub mod cli;
pub mod config;
pub mod error;
pub mod probe;
pub mod transcode;

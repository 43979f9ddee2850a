//! Encoding engine adapters

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_args, build_ffmpeg_command, display_command, EncodeError, ProgressParser,
};

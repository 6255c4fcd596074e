//! Encoding modules for TransAV1

pub mod attempt;
pub mod ffmpeg;

pub use attempt::{
    EncodeAttempt, EncodeResult, Encoder, ExitClass, LAUNCH_ERROR_EXIT_CODE, SIGNAL_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use ffmpeg::{
    build_command, build_ffmpeg_args, is_fatal_line, tokenize_options, EngineConfig, FfmpegEngine,
};

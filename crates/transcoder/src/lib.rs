//! TransAV1
//!
//! Batch AV1 conversion: supervised ffmpeg runs with primary and fallback
//! encoders, failure markers for idempotent re-runs, and atomic publishing
//! of finished outputs.

pub mod batch;
pub mod encode;
pub mod fsops;
pub mod item;
pub mod marker;
pub mod priority;
pub mod restart;
pub mod scan;
pub mod scratch;
pub mod startup;

pub use transav1_config as config;
pub use transav1_config::Config;
pub use batch::{
    clear_destination, prepare_destination, BatchDriver, BatchError, BatchSummary, RunPaths,
    MAX_LISTED_ERRORS,
};
pub use encode::{
    build_ffmpeg_args, tokenize_options, EncodeAttempt, EncodeResult, Encoder, EngineConfig,
    ExitClass, FfmpegEngine,
};
pub use item::{
    AttemptPlan, EncodeFailure, ItemOutcome, ItemProcessor, ProcessingError, ProcessingItem,
    SkipReason, Tier,
};
pub use marker::{MarkerKind, MAX_MARKER_CONTENT};
pub use priority::LaunchStrategy;
pub use restart::{clean_destination, RestartReport};
pub use scan::{classify, output_path, scan_source, FileKind, ScanResult};
pub use scratch::ScratchArea;
pub use startup::{resolve_ffmpeg, run_startup_checks, StartupError};

//! ffmpeg execution engine.
//!
//! Builds the ffmpeg invocation from a fixed skeleton, launches it with the
//! configured priority, drains stdout and stderr on their own tasks, and
//! enforces the attempt deadline. Every outcome is returned as an
//! [`EncodeResult`]; nothing in here decides whether to retry.

use crate::config::{Config, PriorityLevel};
use crate::encode::attempt::{EncodeAttempt, EncodeResult, Encoder, ExitClass, SIGNAL_EXIT_CODE};
use crate::priority::{self, LaunchStrategy};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Audio is always re-encoded to AAC.
pub const AUDIO_CODEC: &str = "aac";

/// stderr lines containing any of these are always surfaced.
const FATAL_KEYWORDS: &[&str] = &["error", "fatal"];

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Settings the engine needs from the run configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resolved ffmpeg executable
    pub ffmpeg_path: PathBuf,
    pub priority: PriorityLevel,
    /// Wait between spawn and priority change where that happens post-start
    pub priority_delay: Duration,
    /// Raises ffmpeg's log level and forwards every output line
    pub debug: bool,
}

impl EngineConfig {
    pub fn from_config(config: &Config, ffmpeg_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            priority: config.process.priority,
            priority_delay: config.priority_delay(),
            debug: config.logging.debug,
        }
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// How waiting on the process ended.
#[derive(Debug)]
enum WaitOutcome {
    Exited(Option<i32>),
    DeadlineExpired(Duration),
    WaitFailed(std::io::Error),
}

/// Split an option string on whitespace.
///
/// There is no quoting: `-metadata title="a b"` becomes three tokens.
pub fn tokenize_options(options: &str) -> Vec<&str> {
    options.split_whitespace().collect()
}

/// Build the ffmpeg argument list for one attempt.
///
/// Layout: `-hide_banner <-stats|-nostats> -i <input> -c:v <encoder> -c:a aac -y
/// [options...] -loglevel <error|fatal> <output>`
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    attempt: &EncodeAttempt,
    debug: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    args.push("-hide_banner".into());
    args.push(OsString::from(if debug { "-stats" } else { "-nostats" }));
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args.push("-c:v".into());
    args.push(attempt.encoder_id.as_str().into());
    args.push("-c:a".into());
    args.push(AUDIO_CODEC.into());
    args.push("-y".into());

    args.extend(tokenize_options(&attempt.encoder_options).into_iter().map(OsString::from));

    args.push("-loglevel".into());
    args.push(OsString::from(if debug { "error" } else { "fatal" }));

    args.push(output.as_os_str().to_owned());
    args
}

/// Assemble the process command for a launch strategy.
pub fn build_command(program: &Path, args: &[OsString], strategy: &LaunchStrategy) -> Command {
    let prefix = strategy.launcher_prefix();
    let mut cmd = match prefix.split_first() {
        Some((launcher, launcher_args)) => {
            let mut cmd = Command::new(launcher);
            cmd.args(launcher_args).arg(program);
            cmd
        }
        None => Command::new(program),
    };
    cmd.args(args);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

/// Whether a stderr line should be surfaced outside debug mode.
pub fn is_fatal_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    FATAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// Supervises ffmpeg processes.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    config: EngineConfig,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run one attempt to completion.
    ///
    /// Returns only after the process has exited (or been killed) and both
    /// output streams have been drained to EOF.
    pub async fn run(&self, input: &Path, output: &Path, attempt: &EncodeAttempt) -> EncodeResult {
        let encoder = attempt.encoder_id.as_str();

        // `nice` would happily spawn and then fail on a missing binary, so
        // check before anything is launched.
        let program = match which::which(&self.config.ffmpeg_path) {
            Ok(path) => path,
            Err(e) => {
                return EncodeResult::launch_error(format!(
                    "ffmpeg ({}) is not runnable at {}: {}",
                    encoder,
                    self.config.ffmpeg_path.display(),
                    e
                ))
            }
        };

        let args = build_ffmpeg_args(input, output, attempt, self.config.debug);
        let strategy = LaunchStrategy::for_current_platform(self.config.priority);
        let mut cmd = build_command(&program, &args, &strategy);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            "ffmpeg start ({}): {} -> {}",
            encoder,
            display_name(input),
            display_name(output)
        );
        debug!("Command ({}): {:?}", encoder, cmd.as_std());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return EncodeResult::launch_error(format!(
                    "ffmpeg ({}) failed to start: {}",
                    encoder, e
                ))
            }
        };

        let started = Instant::now();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return EncodeResult::launch_error(format!(
                "ffmpeg ({}) output pipes were not created",
                encoder
            ));
        };

        let sink = Arc::new(Mutex::new(String::new()));
        let stderr_task = tokio::spawn(drain_stream(
            stderr,
            OutputStream::Stderr,
            Arc::clone(&sink),
            encoder.to_string(),
            self.config.debug,
        ));
        let stdout_task = tokio::spawn(drain_stream(
            stdout,
            OutputStream::Stdout,
            Arc::clone(&sink),
            encoder.to_string(),
            self.config.debug,
        ));

        if let LaunchStrategy::PriorityAfterStart { level } = strategy {
            // The process needs a moment to come up before its priority class
            // can be changed. This delay makes that likely, not certain.
            tokio::time::sleep(self.config.priority_delay).await;
            match child.id() {
                Some(pid) => priority::apply_after_start(pid, level),
                None => debug!("ffmpeg ({}) exited before its priority was set", encoder),
            }
        }

        let outcome = wait_with_deadline(&mut child, attempt.deadline, started).await;
        stop_if_running(&mut child, &outcome, encoder).await;

        let mut stream_error: Option<String> = None;
        for (stream, task) in [
            (OutputStream::Stderr, stderr_task),
            (OutputStream::Stdout, stdout_task),
        ] {
            let failure = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("reading ffmpeg {} failed: {}", stream.as_str(), e)),
                Err(e) => Some(format!("ffmpeg {} reader stopped: {}", stream.as_str(), e)),
            };
            if let Some(message) = failure {
                warn!("ffmpeg ({}): {}", encoder, message);
                stream_error.get_or_insert(message);
            }
        }

        let captured_output = take_output(&sink);
        let (exit_class, detail) = classify(outcome, stream_error);

        match exit_class {
            ExitClass::Success => {
                debug!("ffmpeg ({}) finished (exit code 0)", encoder);
                if self.config.debug && !captured_output.trim().is_empty() {
                    debug!(
                        "ffmpeg ({}) output on success:\n{}",
                        encoder,
                        captured_output.trim()
                    );
                }
            }
            other => debug!("ffmpeg ({}) finished: {}", encoder, other),
        }

        EncodeResult {
            exit_class,
            captured_output,
            detail,
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEngine {
    async fn encode(&self, input: &Path, output: &Path, attempt: &EncodeAttempt) -> EncodeResult {
        self.run(input, output, attempt).await
    }
}

/// Wait for `child`, giving up `deadline` after `started`.
async fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Duration>,
    started: Instant,
) -> WaitOutcome {
    let waited = match deadline {
        Some(limit) => match tokio::time::timeout_at(started + limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => return WaitOutcome::DeadlineExpired(limit),
        },
        None => child.wait().await,
    };

    match waited {
        Ok(status) => WaitOutcome::Exited(status.code()),
        Err(e) => WaitOutcome::WaitFailed(e),
    }
}

/// Kill the process when the wait did not see it exit, so the drains reach EOF.
async fn stop_if_running(child: &mut Child, outcome: &WaitOutcome, encoder: &str) {
    match outcome {
        WaitOutcome::DeadlineExpired(limit) => warn!(
            "ffmpeg ({}) exceeded its {}s deadline, killing it",
            encoder,
            limit.as_secs()
        ),
        WaitOutcome::WaitFailed(e) => warn!(
            "Waiting for ffmpeg ({}) failed, killing it: {}",
            encoder, e
        ),
        WaitOutcome::Exited(_) => return,
    }
    if let Err(e) = child.kill().await {
        debug!("Kill of ffmpeg ({}) failed, it may already be gone: {}", encoder, e);
    }
}

/// Map how the wait ended, plus any drain failure, onto an exit class.
///
/// A drain failure only decides the class when the process gave no exit
/// code of its own.
fn classify(outcome: WaitOutcome, stream_error: Option<String>) -> (ExitClass, Option<String>) {
    match outcome {
        WaitOutcome::DeadlineExpired(limit) => (
            ExitClass::TimedOut,
            Some(format!("timed out after {}s", limit.as_secs())),
        ),
        WaitOutcome::Exited(Some(0)) => (ExitClass::Success, None),
        WaitOutcome::Exited(Some(code)) => (ExitClass::NonZeroExit(code), stream_error),
        WaitOutcome::Exited(None) => match stream_error {
            Some(message) => (ExitClass::StreamError, Some(message)),
            None => (ExitClass::NonZeroExit(SIGNAL_EXIT_CODE), None),
        },
        WaitOutcome::WaitFailed(e) => (
            ExitClass::StreamError,
            Some(format!("waiting for ffmpeg failed: {}", e)),
        ),
    }
}

/// Read `reader` to EOF line by line, appending to `sink`.
async fn drain_stream<R>(
    reader: R,
    stream: OutputStream,
    sink: Arc<Mutex<String>>,
    encoder: String,
    debug: bool,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(|c| c == '\n' || c == '\r');

        {
            let mut buffer = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            buffer.push_str(line);
            buffer.push('\n');
        }

        match stream {
            OutputStream::Stderr if is_fatal_line(line) => {
                warn!("ffmpeg stderr ({}): {}", encoder, line)
            }
            _ if debug => debug!("ffmpeg {} ({}): {}", stream.as_str(), encoder, line),
            _ => {}
        }
    }
}

fn take_output(sink: &Arc<Mutex<String>>) -> String {
    let mut buffer = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *buffer)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn args_as_strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/.-]{1,40}").unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_args_completeness(
            input in path_strategy(),
            output in path_strategy(),
            encoder in "[a-z0-9_]{1,16}",
            options in prop::collection::vec("-[a-z]{1,6}", 0..6),
            debug in proptest::bool::ANY,
        ) {
            let attempt = EncodeAttempt::new(encoder.clone(), options.join("  "), None);
            let args = args_as_strings(&build_ffmpeg_args(
                Path::new(&input),
                Path::new(&output),
                &attempt,
                debug,
            ));

            prop_assert_eq!(&args[0], "-hide_banner");
            prop_assert_eq!(&args[1], if debug { "-stats" } else { "-nostats" });
            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert!(has_flag_with_value(&args, "-c:v", &encoder));
            prop_assert!(has_flag_with_value(&args, "-c:a", "aac"));
            prop_assert!(args.contains(&"-y".to_string()));
            let expected_loglevel = if debug { "error" } else { "fatal" };
            prop_assert!(has_flag_with_value(&args, "-loglevel", expected_loglevel));
            prop_assert_eq!(args.last().unwrap(), &output);

            // Options sit between -y and -loglevel, one token each
            let y = args.iter().position(|a| a == "-y").unwrap();
            let loglevel = args.iter().rposition(|a| a == "-loglevel").unwrap();
            prop_assert_eq!(&args[y + 1..loglevel], &options[..]);
        }

        #[test]
        fn prop_tokenize_matches_split_whitespace(options in "[a-z0-9 \t-]{0,60}") {
            let tokens = tokenize_options(&options);
            prop_assert!(tokens.iter().all(|t| !t.is_empty() && !t.contains(char::is_whitespace)));
            prop_assert_eq!(tokens.join(" "), options.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }

    #[test]
    fn test_tokenize_has_no_quote_support() {
        let tokens = tokenize_options(r#"-metadata title="a b""#);
        assert_eq!(tokens, vec!["-metadata", "title=\"a", "b\""]);
    }

    #[test]
    fn test_empty_options_add_nothing() {
        let attempt = EncodeAttempt::new("libsvtav1", "   ", None);
        let args = args_as_strings(&build_ffmpeg_args(
            Path::new("/in.mp4"),
            Path::new("/out.mp4"),
            &attempt,
            false,
        ));
        let y = args.iter().position(|a| a == "-y").unwrap();
        assert_eq!(args[y + 1], "-loglevel");
    }

    #[test]
    fn test_nice_command_wraps_program() {
        let cmd = build_command(
            Path::new("/opt/ffmpeg/ffmpeg"),
            &[OsString::from("-hide_banner")],
            &LaunchStrategy::NiceLauncher { niceness: 10 },
        );
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "nice");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-n", "10", "/opt/ffmpeg/ffmpeg", "-hide_banner"]);
    }

    #[test]
    fn test_direct_command_has_no_launcher() {
        let cmd = build_command(
            Path::new("/opt/ffmpeg/ffmpeg"),
            &[OsString::from("-y")],
            &LaunchStrategy::Unmanaged,
        );
        assert_eq!(cmd.as_std().get_program(), "/opt/ffmpeg/ffmpeg");
    }

    #[test]
    fn test_fatal_line_detection() {
        assert!(is_fatal_line("Error while opening encoder"));
        assert!(is_fatal_line("[fatal] something"));
        assert!(!is_fatal_line("frame=  100 fps= 25"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(WaitOutcome::Exited(Some(0)), None).0, ExitClass::Success);
        assert_eq!(
            classify(WaitOutcome::Exited(Some(0)), Some("x".into())).0,
            ExitClass::Success
        );
        assert_eq!(
            classify(WaitOutcome::Exited(Some(1)), Some("x".into())).0,
            ExitClass::NonZeroExit(1)
        );
        assert_eq!(
            classify(WaitOutcome::Exited(None), None).0,
            ExitClass::NonZeroExit(SIGNAL_EXIT_CODE)
        );
        assert_eq!(
            classify(WaitOutcome::Exited(None), Some("pipe".into())).0,
            ExitClass::StreamError
        );
        assert_eq!(
            classify(WaitOutcome::DeadlineExpired(Duration::from_secs(3)), None).0,
            ExitClass::TimedOut
        );
        assert_eq!(
            classify(
                WaitOutcome::WaitFailed(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
                None
            )
            .0,
            ExitClass::StreamError
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = FfmpegEngine::new(EngineConfig {
            ffmpeg_path: dir.path().join("no-such-ffmpeg"),
            priority: PriorityLevel::Normal,
            priority_delay: Duration::from_millis(0),
            debug: false,
        });
        let attempt = EncodeAttempt::new("libsvtav1", "", None);
        let result = engine
            .run(&dir.path().join("in.mp4"), &dir.path().join("out.mp4"), &attempt)
            .await;
        assert_eq!(result.exit_class, ExitClass::LaunchError);
        assert!(result.captured_output.is_empty());
        assert!(result.detail.is_some());
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;
        use tempfile::TempDir;

        fn fake_ffmpeg(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn engine(ffmpeg_path: PathBuf, debug: bool) -> FfmpegEngine {
            FfmpegEngine::new(EngineConfig {
                ffmpeg_path,
                priority: PriorityLevel::Normal,
                priority_delay: Duration::from_millis(0),
                debug,
            })
        }

        #[tokio::test]
        async fn test_success_captures_both_streams() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "echo \"out line\"\necho \"err line\" >&2\nexit 0");
            let attempt = EncodeAttempt::new("enc_hw", "", None);

            let result = engine(ffmpeg, true)
                .run(&dir.path().join("in.mp4"), &dir.path().join("out.mp4"), &attempt)
                .await;

            assert_eq!(result.exit_class, ExitClass::Success);
            assert!(result.captured_output.contains("out line"));
            assert!(result.captured_output.contains("err line"));
        }

        #[tokio::test]
        async fn test_nonzero_exit_keeps_code_and_output() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "echo \"Error: no device\" >&2\nexit 3");
            let attempt = EncodeAttempt::new("enc_hw", "-cq 25", None);

            let result = engine(ffmpeg, false)
                .run(&dir.path().join("in.mp4"), &dir.path().join("out.mp4"), &attempt)
                .await;

            assert_eq!(result.exit_class, ExitClass::NonZeroExit(3));
            assert!(result.diagnostic().contains("Error: no device"));
        }

        #[tokio::test]
        async fn test_deadline_kills_process() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "echo started >&2\nexec sleep 30");
            let attempt = EncodeAttempt::new("enc_hw", "", Some(Duration::from_millis(300)));

            let started = Instant::now();
            let result = engine(ffmpeg, false)
                .run(&dir.path().join("in.mp4"), &dir.path().join("out.mp4"), &attempt)
                .await;

            assert_eq!(result.exit_class, ExitClass::TimedOut);
            assert_eq!(result.exit_class.code(), crate::encode::TIMEOUT_EXIT_CODE);
            assert!(result.captured_output.contains("started"));
            assert!(started.elapsed() < Duration::from_secs(20));
        }

        fn spawn_sleeper() -> Child {
            Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .unwrap()
        }

        #[tokio::test]
        async fn test_deadline_counts_from_spawn() {
            let mut child = spawn_sleeper();
            let spawned = tokio::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(300)).await;

            let waiting = Instant::now();
            let outcome =
                wait_with_deadline(&mut child, Some(Duration::from_millis(200)), spawned).await;

            assert!(matches!(outcome, WaitOutcome::DeadlineExpired(_)));
            assert!(waiting.elapsed() < Duration::from_millis(150));
            child.kill().await.unwrap();
        }

        #[tokio::test]
        async fn test_failed_wait_kills_process() {
            let mut child = spawn_sleeper();
            let outcome = WaitOutcome::WaitFailed(std::io::Error::new(std::io::ErrorKind::Other, "wait interrupted"));

            stop_if_running(&mut child, &outcome, "enc_hw").await;

            let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status.code(), None);
        }

        #[tokio::test]
        async fn test_exited_process_is_left_alone() {
            let mut child = Command::new("true").spawn().unwrap();
            let status = child.wait().await.unwrap();
            let outcome = WaitOutcome::Exited(status.code());

            stop_if_running(&mut child, &outcome, "enc_hw").await;

            assert_eq!(child.try_wait().unwrap().and_then(|s| s.code()), Some(0));
        }

        #[tokio::test]
        async fn test_arguments_reach_the_encoder() {
            let dir = TempDir::new().unwrap();
            let ffmpeg = fake_ffmpeg(&dir, "echo \"$@\"\nexit 0");
            let attempt = EncodeAttempt::new("enc_cpu", "-crf 28 -preset 7", None);

            let result = engine(ffmpeg, false)
                .run(&dir.path().join("in.mp4"), &dir.path().join("out.mp4"), &attempt)
                .await;

            assert!(result.is_success());
            assert!(result.captured_output.contains("-c:v enc_cpu -c:a aac -y -crf 28 -preset 7 -loglevel fatal"));
        }
    }
}

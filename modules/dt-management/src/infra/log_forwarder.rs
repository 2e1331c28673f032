//! Forwarding of runtime output (child process pipes, container logs) into `tracing`.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Number of leading tokens searched for a level marker.
const LEVEL_SCAN_TOKENS: usize = 4;

/// Origin of a forwarded line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Container,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Container => "container",
        })
    }
}

/// Detects the level of a runtime log line.
///
/// Handles JSON lines with a `level` field and plain lines where the level appears among
/// the first few tokens, optionally bracketed:
///
/// ```text
/// 2024-05-01 12:00:00.123 [main] INFO  d.f.i.f.s.Service - FAAAST service is running
/// [WARN] asset connection not reachable
/// ```
///
/// Unrecognized lines are logged at INFO.
fn detect_log_level(line: &str) -> Level {
    detect_json_level(line)
        .or_else(|| detect_plain_level(line))
        .unwrap_or(Level::INFO)
}

fn parse_level(token: &str) -> Option<Level> {
    let token = token.trim_matches(|c| c == '[' || c == ']' || c == ':');
    match token.to_ascii_uppercase().as_str() {
        "ERROR" | "SEVERE" | "FATAL" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

fn detect_plain_level(line: &str) -> Option<Level> {
    line.split_whitespace()
        .take(LEVEL_SCAN_TOKENS)
        .find_map(parse_level)
}

fn detect_json_level(line: &str) -> Option<Level> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') || !trimmed.contains("\"level\"") {
        return None;
    }
    let v: Value = serde_json::from_str(trimmed).ok()?;
    parse_level(v.get("level")?.as_str()?)
}

/// Emits one line at its detected level with the owning module attached.
pub fn forward_line(module: &str, stream: StreamKind, line: &str) {
    match detect_log_level(line) {
        Level::ERROR => tracing::error!(dt_module = %module, stream = %stream, "{line}"),
        Level::WARN => tracing::warn!(dt_module = %module, stream = %stream, "{line}"),
        Level::INFO => tracing::info!(dt_module = %module, stream = %stream, "{line}"),
        Level::DEBUG => tracing::debug!(dt_module = %module, stream = %stream, "{line}"),
        Level::TRACE => tracing::trace!(dt_module = %module, stream = %stream, "{line}"),
    }
}

/// Spawns a task forwarding every line of `stream` until EOF or cancellation.
pub fn spawn_stream_forwarder<S>(
    stream: S,
    module: String,
    cancel: CancellationToken,
    kind: StreamKind,
) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                result = lines.next_line() => match result {
                    Ok(Some(line)) => forward_line(&module, kind, &line),
                    Ok(None) => {
                        tracing::debug!(dt_module = %module, stream = %kind, "runtime output closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(dt_module = %module, stream = %kind, error = %e, "runtime output read error");
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn detects_logback_style_levels() {
        assert_eq!(
            detect_log_level("2024-05-01 12:00:00.123 [main] INFO  d.f.Service - running"),
            Level::INFO
        );
        assert_eq!(
            detect_log_level("2024-05-01 12:00:00.123 [pool-1] WARN  d.f.Mqtt - reconnecting"),
            Level::WARN
        );
        assert_eq!(detect_log_level("[ERROR] failed to load model"), Level::ERROR);
        assert_eq!(detect_log_level("SEVERE: out of memory"), Level::ERROR);
    }

    #[test]
    fn detects_json_levels() {
        assert_eq!(
            detect_log_level(r#"{"timestamp":"2024-05-01T12:00:00Z","level":"debug","message":"x"}"#),
            Level::DEBUG
        );
        assert_eq!(detect_log_level(r#"{"level":"nope"}"#), Level::INFO);
    }

    #[test]
    fn level_must_appear_early() {
        assert_eq!(
            detect_log_level("the runtime said that an ERROR happened"),
            Level::INFO
        );
        assert_eq!(detect_log_level(""), Level::INFO);
    }

    #[test]
    #[tracing_test::traced_test]
    fn forwarded_lines_carry_module_and_stream() {
        forward_line("robot", StreamKind::Stderr, "[WARN] asset unreachable");
        assert!(logs_contain("asset unreachable"));
        assert!(logs_contain("dt_module=robot"));
        assert!(logs_contain("stream=stderr"));
    }

    #[tokio::test]
    async fn forwarder_stops_at_eof_and_on_cancel() {
        let input: &[u8] = b"first\nsecond\n";
        spawn_stream_forwarder(input, "robot".to_owned(), CancellationToken::new(), StreamKind::Stdout)
            .await
            .unwrap();

        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = spawn_stream_forwarder(reader, "robot".to_owned(), cancel.clone(), StreamKind::Stdout);
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Server console logs
//!
//! `LogSource` is the boundary the API reads logs through. The docker
//! implementation shells out to `docker logs`. Docker keeps a container's
//! stdout and stderr apart; both are merged back into one console, in the
//! order the lines were written.

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::docker::classify_failure;
use super::supervisor::SupervisorError;

#[derive(Error, Debug)]
pub enum LogError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Log stream error for '{0}': {1}")]
    Io(String, std::io::Error),
}

/// Lines as they are written
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, LogError>> + Send>>;

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Last `lines` lines of a server's log
    async fn tail(&self, name: &str, lines: usize) -> Result<Vec<String>, LogError>;

    /// New lines from now on
    async fn subscribe(&self, name: &str) -> Result<LogStream, LogError>;
}

/// Generate `docker logs` arguments
pub fn generate_logs_args(name: &str, follow: bool, tail: Option<usize>, timestamps: bool) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if follow {
        args.push("--follow".to_string());
    }
    if timestamps {
        args.push("--timestamps".to_string());
    }
    if let Some(n) = tail {
        args.push("--tail".to_string());
        args.push(n.to_string());
    }
    args.push(name.to_string());
    args
}

/// Split a `--timestamps` line into its time and message
fn split_timestamp(line: &str) -> Option<(DateTime<FixedOffset>, &str)> {
    let (stamp, message) = line.split_once(' ')?;
    DateTime::parse_from_rfc3339(stamp).ok().map(|at| (at, message))
}

/// Lines of one stream with their time. A line without a timestamp belongs
/// to the line before it.
fn timed_lines(output: &str) -> Vec<(Option<DateTime<FixedOffset>>, String)> {
    let mut last = None;
    output
        .lines()
        .map(|line| match split_timestamp(line) {
            Some((at, message)) => {
                last = Some(at);
                (last, message.to_string())
            }
            None => (last, line.to_string()),
        })
        .collect()
}

/// Interleave timestamped stdout and stderr the way `2>&1` would and keep
/// the last `lines`. On equal times stdout goes first.
pub fn merge_streams(stdout: &str, stderr: &str, lines: usize) -> Vec<String> {
    let mut merged = timed_lines(stdout);
    merged.extend(timed_lines(stderr));
    merged.sort_by_key(|(at, _)| *at);
    let skip = merged.len().saturating_sub(lines);
    merged.into_iter().skip(skip).map(|(_, line)| line).collect()
}

fn line_stream<R>(reader: R, name: String) -> LogStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = BufReader::new(reader).lines();
    Box::pin(stream::unfold((lines, name), |(mut lines, name)| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), (lines, name))),
            Ok(None) => None,
            Err(e) => Some((Err(LogError::Io(name.clone(), e)), (lines, name))),
        }
    }))
}

pub struct DockerLogs {
    docker_binary: String,
}

impl DockerLogs {
    pub fn new(docker_binary: impl Into<String>) -> Self {
        Self {
            docker_binary: docker_binary.into(),
        }
    }
}

#[async_trait]
impl LogSource for DockerLogs {
    async fn tail(&self, name: &str, lines: usize) -> Result<Vec<String>, LogError> {
        let output = Command::new(&self.docker_binary)
            .args(generate_logs_args(name, false, Some(lines), true))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SupervisorError::Unavailable(format!("failed to run docker logs: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(name, &stderr).into());
        }

        // `--tail` applies per stream, so up to twice `lines` come back
        Ok(merge_streams(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            lines,
        ))
    }

    async fn subscribe(&self, name: &str) -> Result<LogStream, LogError> {
        let mut child = Command::new(&self.docker_binary)
            .args(generate_logs_args(name, true, Some(0), false))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Unavailable(format!("failed to run docker logs: {}", e)))?;

        let not_captured = |stream: &str| {
            LogError::Io(name.to_string(), std::io::Error::other(format!("{} not captured", stream)))
        };
        let stdout = child.stdout.take().ok_or_else(|| not_captured("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| not_captured("stderr"))?;
        let merged = stream::select(
            line_stream(stdout, name.to_string()),
            line_stream(stderr, name.to_string()),
        );

        // The child rides along in the stream state so it dies with the stream
        let stream = stream::unfold((merged, child), |(mut merged, child)| async move {
            merged.next().await.map(|line| (line, (merged, child)))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Serves a fixed set of lines
    #[derive(Default)]
    pub struct StaticLogs {
        pub lines: Vec<String>,
    }

    #[async_trait]
    impl LogSource for StaticLogs {
        async fn tail(&self, _name: &str, lines: usize) -> Result<Vec<String>, LogError> {
            let skip = self.lines.len().saturating_sub(lines);
            Ok(self.lines[skip..].to_vec())
        }

        async fn subscribe(&self, _name: &str) -> Result<LogStream, LogError> {
            let lines: Vec<Result<String, LogError>> = self.lines.iter().cloned().map(Ok).collect();
            Ok(Box::pin(stream::iter(lines)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_generate_logs_args() {
        assert_eq!(
            generate_logs_args("srv", true, Some(0), false),
            vec!["logs", "--follow", "--tail", "0", "srv"]
        );
        assert_eq!(
            generate_logs_args("srv", false, Some(5), true),
            vec!["logs", "--timestamps", "--tail", "5", "srv"]
        );
        assert_eq!(generate_logs_args("srv", false, None, false), vec!["logs", "srv"]);
    }

    #[test]
    fn test_merge_streams_interleaves_by_time() {
        let stdout = "2025-01-01T00:00:00.000000001Z boot\n\
                      2025-01-01T00:00:02Z ready\n\
                      continued\n";
        let stderr = "2025-01-01T00:00:01.5Z warning: low memory\n\
                      2025-01-01T00:00:02Z error: mod missing\n";

        assert_eq!(
            merge_streams(stdout, stderr, 10),
            vec![
                "boot",
                "warning: low memory",
                "ready",
                "continued",
                "error: mod missing"
            ]
        );
        assert_eq!(
            merge_streams(stdout, stderr, 2),
            vec!["continued", "error: mod missing"]
        );
        assert!(merge_streams("", "", 5).is_empty());
    }

    #[tokio::test]
    async fn test_static_logs() {
        let logs = mock::StaticLogs {
            lines: vec!["one".into(), "two".into(), "three".into()],
        };
        assert_eq!(logs.tail("srv", 2).await.unwrap(), vec!["two", "three"]);
        let streamed: Vec<String> = logs
            .subscribe("srv")
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(streamed.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_docker_is_unavailable() {
        let logs = DockerLogs::new("/nonexistent/docker");
        assert!(matches!(
            logs.tail("srv", 10).await,
            Err(LogError::Supervisor(SupervisorError::Unavailable(_)))
        ));
    }
}

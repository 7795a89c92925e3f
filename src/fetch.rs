//! Fetches pages from inside a container's network namespace
//!
//! The internal hostnames are only resolvable from within the cluster network,
//! so the HTTP request is made by `curl` running inside a cluster container.

use crate::exec::{command_line, ExecError, ShellExecutor};
use crate::runtime::ContainerRuntime;
use hyper::body::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Slack between curl's own --max-time and the executor timeout
const EXEC_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Errors from fetching through a container
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{0}")]
    Command(String),
}

/// Time limits enforced by the in-container HTTP client
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub connect_timeout: Duration,
    pub max_time: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_time: Duration::from_secs(30),
        }
    }
}

/// Runs HTTP fetches inside containers
#[derive(Clone)]
pub struct UpstreamFetcher {
    shell: Arc<dyn ShellExecutor>,
    runtime_command: String,
    limits: FetchLimits,
}

impl UpstreamFetcher {
    pub fn new(runtime: &ContainerRuntime, limits: FetchLimits) -> Self {
        Self {
            shell: Arc::clone(runtime.shell()),
            runtime_command: runtime.command().to_string(),
            limits,
        }
    }

    /// Command line executing curl inside `container`, with headers in the output
    pub fn fetch_command(&self, container: &str, internal_url: &str) -> String {
        let connect_timeout = self.limits.connect_timeout.as_secs().max(1).to_string();
        let max_time = self.limits.max_time.as_secs().max(1).to_string();
        command_line([
            self.runtime_command.as_str(),
            "exec",
            container,
            "curl",
            "-sS",
            "-i",
            "--connect-timeout",
            connect_timeout.as_str(),
            "--max-time",
            max_time.as_str(),
            internal_url,
        ])
    }

    /// Fetch `internal_url` from inside `container` and return the raw response bytes
    pub async fn fetch(&self, container: &str, internal_url: &str) -> Result<Bytes, FetchError> {
        let command = self.fetch_command(container, internal_url);
        let timeout = self.limits.max_time.saturating_add(EXEC_TIMEOUT_SLACK);

        let output = self.shell.run(&command, timeout).await?;
        if !output.success() {
            return Err(FetchError::Command(output.diagnostic()));
        }

        debug!(container, url = internal_url, bytes = output.stdout.len(), "Upstream fetch complete");
        Ok(output.stdout)
    }
}

/// Build the internal URL for a target and a request path (with query)
pub fn internal_url(target: &str, path_and_query: &str) -> String {
    if path_and_query.starts_with('/') {
        format!("http://{}{}", target, path_and_query)
    } else {
        format!("http://{}/{}", target, path_and_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    struct RecordingShell {
        output: CommandOutput,
        calls: Mutex<Vec<(String, Duration)>>,
    }

    impl ShellExecutor for RecordingShell {
        fn run<'a>(
            &'a self,
            command_line: &'a str,
            timeout: Duration,
        ) -> BoxFuture<'a, Result<CommandOutput, ExecError>> {
            self.calls.lock().push((command_line.to_string(), timeout));
            let output = self.output.clone();
            Box::pin(async move { Ok(output) })
        }
    }

    fn fetcher(output: CommandOutput) -> (UpstreamFetcher, Arc<RecordingShell>) {
        let shell = Arc::new(RecordingShell {
            output,
            calls: Mutex::new(Vec::new()),
        });
        let runtime = ContainerRuntime::new(shell.clone(), "docker", "yb", Duration::from_secs(5));
        (UpstreamFetcher::new(&runtime, FetchLimits::default()), shell)
    }

    #[test]
    fn test_internal_url() {
        assert_eq!(internal_url("yb-demo-node1:7000", "/"), "http://yb-demo-node1:7000/");
        assert_eq!(
            internal_url("yb-demo-node1:7000", "/tablets?raw=1"),
            "http://yb-demo-node1:7000/tablets?raw=1"
        );
        assert_eq!(internal_url("n:1", "x"), "http://n:1/x");
    }

    #[test]
    fn test_fetch_command_escapes_url() {
        let (fetcher, _) = fetcher(CommandOutput::ok(""));
        let url = "http://yb-demo-node1:7000/a?x=$(reboot)&y='1'";
        let command = fetcher.fetch_command("yb-demo-node1", url);

        let words = shell_words::split(&command).unwrap();
        assert_eq!(
            words,
            vec![
                "docker",
                "exec",
                "yb-demo-node1",
                "curl",
                "-sS",
                "-i",
                "--connect-timeout",
                "5",
                "--max-time",
                "30",
                url,
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_returns_raw_stdout() {
        let raw: &'static [u8] = b"HTTP/1.1 200 OK\r\n\r\n\x00\xff\xfe";
        let (fetcher, shell) = fetcher(CommandOutput::ok(Bytes::from_static(raw)));

        let bytes = fetcher
            .fetch("yb-demo-node1", "http://yb-demo-node1:7000/")
            .await
            .unwrap();

        assert_eq!(&bytes[..], raw);
        let calls = shell.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_huge_max_time_saturates_executor_timeout() {
        let shell = Arc::new(RecordingShell {
            output: CommandOutput::ok("HTTP/1.1 200 OK\r\n\r\nok"),
            calls: Mutex::new(Vec::new()),
        });
        let runtime = ContainerRuntime::new(shell.clone(), "docker", "yb", Duration::from_secs(5));
        let limits = FetchLimits {
            connect_timeout: Duration::from_secs(5),
            max_time: Duration::MAX,
        };
        let fetcher = UpstreamFetcher::new(&runtime, limits);

        fetcher
            .fetch("yb-demo-node1", "http://yb-demo-node1:7000/")
            .await
            .unwrap();
        assert_eq!(shell.calls.lock()[0].1, Duration::MAX);
    }

    #[tokio::test]
    async fn test_fetch_surfaces_stderr() {
        let (fetcher, _) = fetcher(CommandOutput::failed(
            7,
            "curl: (7) Failed to connect to yb-demo-node1 port 7000\n",
        ));

        let err = fetcher
            .fetch("yb-demo-node1", "http://yb-demo-node1:7000/")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "curl: (7) Failed to connect to yb-demo-node1 port 7000"
        );
    }
}

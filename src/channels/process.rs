//! External process bridge
//!
//! Some transports live in a separate program (a CLI bridge such as
//! `signal-cli`, or an independently packaged plugin). The bridge spawns the
//! program, exchanges newline-delimited JSON over stdin/stdout and terminates
//! it with a bounded grace period before force-killing it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{ChannelCapability, DisplayContent, InboundSink, OutboundMessage, Transport};
use crate::{Error, Result};

/// Default grace period before a bridged process is killed
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Buffer size for lines read from the process
const LINE_BUFFER: usize = 256;

/// How to launch a bridged process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program name (looked up on `PATH`) or path
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Time allowed for a clean exit after stdin is closed
    pub grace: Duration,
}

impl ProcessConfig {
    /// Launch `program` with no arguments
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the grace period
    #[must_use]
    pub const fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Resolve the program to an executable path
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingDependency`] if the program cannot be found
    pub fn resolve(&self) -> Result<PathBuf> {
        let has_separator = self.program.components().count() > 1;
        if has_separator {
            if self.program.is_file() {
                return Ok(self.program.clone());
            }
            return Err(Error::MissingDependency(format!(
                "{} does not exist",
                self.program.display()
            )));
        }

        which::which(&self.program).map_err(|_| {
            Error::MissingDependency(format!("{} not found on PATH", self.program.display()))
        })
    }
}

struct Running {
    child: Child,
    reader: JoinHandle<()>,
}

/// A running (or stopped) external process speaking JSON lines
pub struct ProcessBridge {
    config: ProcessConfig,
    running: Mutex<Option<Running>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl ProcessBridge {
    /// Create a bridge; nothing is spawned until [`ProcessBridge::spawn`]
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch configuration
    #[must_use]
    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Spawn the process and return a stream of JSON values it prints
    ///
    /// Lines that are not JSON are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the program is missing or fails to spawn
    pub async fn spawn(&self) -> Result<mpsc::Receiver<serde_json::Value>> {
        let program = self.config.resolve()?;

        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {e}", program.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("child stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("child stdin unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = program_name(&program);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(program = %name, "{line}");
                }
            });
        }

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let name = program_name(&program);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(line) {
                            Ok(value) => {
                                if tx.send(value).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(program = %name, error = %e, "skipping non-JSON line");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(program = %name, "process closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(program = %name, error = %e, "failed reading process output");
                        break;
                    }
                }
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.running.lock().await = Some(Running { child, reader });

        tracing::info!(program = %program.display(), "process bridge started");
        Ok(rx)
    }

    /// Write one JSON value as a line to the process
    ///
    /// # Errors
    ///
    /// Returns error if the process is not running or the write fails
    pub async fn send(&self, value: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| Error::Process("process not running".to_string()))?;
        pipe.write_all(&line).await?;
        pipe.flush().await?;
        Ok(())
    }

    /// Whether a process is currently attached
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Terminate the process
    ///
    /// Closes stdin and waits up to the grace period for a clean exit, then
    /// kills it. Always returns; a no-op if nothing is running.
    pub async fn terminate(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };

        // Closing stdin is the polite shutdown signal for line-based bridges
        self.stdin.lock().await.take();

        match tokio::time::timeout(self.config.grace, running.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(program = %self.config.program.display(), %status, "process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.config.program.display(), error = %e, "failed waiting for process");
            }
            Err(_) => {
                tracing::warn!(
                    program = %self.config.program.display(),
                    grace = ?self.config.grace,
                    "process ignored shutdown, killing"
                );
                if let Err(e) = running.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill process");
                }
            }
        }

        running.reader.abort();
    }
}

fn program_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Event printed by a bridged channel program
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A message received by the program's transport
    Inbound {
        sender_id: String,
        #[serde(default)]
        sender_label: Option<String>,
        text: String,
        #[serde(default)]
        thread_id: Option<String>,
    },
    /// The program finished its own startup
    Ready,
    /// A log line to surface through the gateway's logging
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

/// Command written to a bridged channel program
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Configure {
        instance: &'a str,
        settings: &'a serde_json::Map<String, serde_json::Value>,
    },
    Send {
        thread_id: Option<&'a str>,
        text: &'a str,
    },
    Display {
        thread_id: Option<&'a str>,
        content_type: &'a str,
        content: &'a serde_json::Value,
    },
}

/// Channel transport implemented by an external program
///
/// The program receives a `configure` command on startup, then `send` and
/// `display` commands; it prints `inbound` events for received messages.
/// Replies to inbound messages arrive as ordinary `send` commands.
pub struct ProcessTransport {
    bridge: Arc<ProcessBridge>,
    settings: serde_json::Map<String, serde_json::Value>,
    canvas: bool,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTransport {
    /// Create a transport around a process configuration
    #[must_use]
    pub fn new(config: ProcessConfig, settings: serde_json::Map<String, serde_json::Value>) -> Self {
        let canvas = settings
            .get("canvas")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Self {
            bridge: Arc::new(ProcessBridge::new(config)),
            settings,
            canvas,
            pump: std::sync::Mutex::new(None),
        }
    }

    /// The underlying bridge
    #[must_use]
    pub fn bridge(&self) -> &ProcessBridge {
        &self.bridge
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn capabilities(&self) -> Vec<ChannelCapability> {
        if self.canvas {
            vec![ChannelCapability::Canvas]
        } else {
            Vec::new()
        }
    }

    async fn open(&self, inbound: InboundSink) -> Result<()> {
        let mut events = self.bridge.spawn().await?;
        self.bridge
            .send(&serde_json::to_value(BridgeCommand::Configure {
                instance: inbound.instance(),
                settings: &self.settings,
            })?)
            .await?;

        let bridge = Arc::clone(&self.bridge);
        let pump = tokio::spawn(async move {
            while let Some(value) = events.recv().await {
                let event = match serde_json::from_value::<BridgeEvent>(value) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!(channel = %inbound.instance(), error = %e, "ignoring unknown bridge event");
                        continue;
                    }
                };

                match event {
                    BridgeEvent::Inbound {
                        sender_id,
                        sender_label,
                        text,
                        thread_id,
                    } => {
                        let label = sender_label.unwrap_or_else(|| sender_id.clone());
                        let message = inbound.message(sender_id, label, text, thread_id);
                        let reply_thread = message
                            .thread_id
                            .clone()
                            .unwrap_or_else(|| message.sender_id.clone());
                        let reply = inbound.dispatch(message);
                        let bridge = Arc::clone(&bridge);
                        inbound.spawn_reply(reply, move |text| async move {
                            let command = BridgeCommand::Send {
                                thread_id: Some(&reply_thread),
                                text: &text,
                            };
                            bridge.send(&serde_json::to_value(command)?).await
                        });
                    }
                    BridgeEvent::Ready => {
                        tracing::info!(channel = %inbound.instance(), "bridged channel ready");
                    }
                    BridgeEvent::Log { level, message } => match level.as_deref() {
                        Some("error") => tracing::error!(channel = %inbound.instance(), "{message}"),
                        Some("warn") => tracing::warn!(channel = %inbound.instance(), "{message}"),
                        _ => tracing::debug!(channel = %inbound.instance(), "{message}"),
                    },
                }
            }
            tracing::debug!(channel = %inbound.instance(), "bridge event stream ended");
        });

        *self.pump.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pump);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.bridge.terminate().await;
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let command = BridgeCommand::Send {
            thread_id: message.thread_id.as_deref(),
            text: &message.text,
        };
        self.bridge
            .send(&serde_json::to_value(command)?)
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    async fn render(&self, content: &DisplayContent, message: &OutboundMessage) -> Result<()> {
        let command = BridgeCommand::Display {
            thread_id: message.thread_id.as_deref(),
            content_type: &content.content_type,
            content: &content.content,
        };
        self.bridge
            .send(&serde_json::to_value(command)?)
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_missing_dependency() {
        let config = ProcessConfig::new("definitely-not-a-real-binary-7f3a");
        let err = config.resolve().unwrap_err();
        assert!(err.is_missing_dependency());

        let config = ProcessConfig::new("/nonexistent/dir/bridge");
        assert!(config.resolve().unwrap_err().is_missing_dependency());
    }

    #[test]
    fn bridge_event_parsing() {
        let event: BridgeEvent = serde_json::from_str(
            r#"{"type":"inbound","sender_id":"u1","text":"hello","thread_id":"t9"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BridgeEvent::Inbound {
                sender_id: "u1".to_string(),
                sender_label: None,
                text: "hello".to_string(),
                thread_id: Some("t9".to_string()),
            }
        );

        let event: BridgeEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(event, BridgeEvent::Ready);
    }

    #[test]
    fn commands_are_tagged() {
        let value = serde_json::to_value(BridgeCommand::Send {
            thread_id: None,
            text: "hi",
        })
        .unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["text"], "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_echo_and_terminate() {
        // `cat` echoes our lines back, which exercises both pipes
        let bridge = ProcessBridge::new(ProcessConfig::new("cat").grace(Duration::from_secs(2)));
        let mut rx = bridge.spawn().await.unwrap();
        assert!(bridge.is_running().await);

        bridge.send(&serde_json::json!({"type": "ready"})).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed["type"], "ready");

        bridge.terminate().await;
        assert!(!bridge.is_running().await);
        assert!(bridge.send(&serde_json::json!({})).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_process_is_killed() {
        // `sleep` ignores stdin closing, so terminate must fall back to kill
        let bridge = ProcessBridge::new(
            ProcessConfig::new("sleep")
                .args(["30"])
                .grace(Duration::from_millis(200)),
        );
        let _rx = bridge.spawn().await.unwrap();

        let started = std::time::Instant::now();
        bridge.terminate().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!bridge.is_running().await);
    }

    #[tokio::test]
    async fn terminate_without_spawn_is_noop() {
        let bridge = ProcessBridge::new(ProcessConfig::new("cat"));
        bridge.terminate().await;
        assert!(!bridge.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bridged_inbound_is_answered_through_the_process() {
        use futures::FutureExt;

        use crate::channels::{ChannelType, InboundMessage, ReplyFuture};

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reply.json");
        let script = format!(
            r#"read configure; echo '{{"type":"inbound","sender_id":"u1","text":"hi"}}'; read reply; printf '%s' "$reply" > '{}'"#,
            out.display()
        );
        let transport = ProcessTransport::new(
            ProcessConfig::new("sh").args(["-c", script.as_str()]),
            serde_json::Map::new(),
        );
        let sink = InboundSink::new(
            ChannelType::new("bridged"),
            "bridged",
            Arc::new(|m: InboundMessage| -> ReplyFuture {
                futures::future::ready(Some(format!("echo: {}", m.text))).boxed()
            }),
        );
        transport.open(sink).await.unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(raw) = tokio::fs::read_to_string(&out).await {
                    if !raw.is_empty() {
                        break raw;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let reply: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(reply["type"], "send");
        assert_eq!(reply["thread_id"], "u1");
        assert_eq!(reply["text"], "echo: hi");
        transport.close().await.unwrap();
    }
}

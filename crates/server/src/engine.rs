//! AI engine collaborator: text in, text out.
//!
//! Sessions only see the `Engine` trait. `EchoEngine` stands in when no
//! model is configured; `CommandEngine` pipes each turn through an external
//! program (stdin → stdout).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{EngineConfig, EngineKind};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine failed to start: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine timed out after {0}s")]
    Timeout(u64),

    #[error("engine exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("engine produced non-UTF-8 output")]
    InvalidOutput,

    #[error("engine task aborted: {0}")]
    Aborted(String),
}

pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn process<'a>(&'a self, input: &'a str) -> BoxFuture<'a, Result<String, EngineError>>;
}

/// Build the engine named by the config.
pub fn from_config(config: &EngineConfig) -> Arc<dyn Engine> {
    match (&config.kind, &config.command) {
        (EngineKind::Command, Some(program)) => Arc::new(CommandEngine::new(
            program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )),
        _ => Arc::new(EchoEngine),
    }
}

/// Returns its input. Used when no model is wired up.
pub struct EchoEngine;

impl Engine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn process<'a>(&'a self, input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move { Ok(input.to_string()) })
    }
}

pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    async fn run(&self, input: &str) -> Result<String, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            // A program that exits without reading its input is judged by its exit status.
            if let Err(e) = written {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EngineError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| EngineError::InvalidOutput)?;
        Ok(stdout.trim_end().to_string())
    }
}

impl Engine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn process<'a>(&'a self, input: &'a str) -> BoxFuture<'a, Result<String, EngineError>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.run(input)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_input() {
        assert_eq!(EchoEngine.process("hello").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn command_engine_pipes_through_program() {
        let engine = CommandEngine::new(
            "tr".into(),
            vec!["a-z".into(), "A-Z".into()],
            Duration::from_secs(5),
        );
        assert_eq!(engine.process("hello\n").await.unwrap(), "HELLO");
    }

    #[tokio::test]
    async fn failing_program_is_an_engine_error() {
        let engine = CommandEngine::new(
            "sh".into(),
            vec!["-c".into(), "echo boom >&2; exit 3".into()],
            Duration::from_secs(5),
        );
        match engine.process("x").await {
            Err(EngineError::Exited { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let engine = CommandEngine::new(
            "/nonexistent/svakla-engine".into(),
            Vec::new(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            engine.process("x").await,
            Err(EngineError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let engine = CommandEngine::new(
            "sleep".into(),
            vec!["5".into()],
            Duration::from_millis(100),
        );
        assert!(matches!(
            engine.process("").await,
            Err(EngineError::Timeout(_))
        ));
    }

    #[test]
    fn config_selects_engine() {
        let echo = from_config(&EngineConfig::default());
        assert_eq!(echo.name(), "echo");

        let command = from_config(&EngineConfig {
            kind: EngineKind::Command,
            command: Some("cat".into()),
            ..Default::default()
        });
        assert_eq!(command.name(), "cat");
    }
}

//! Line-delimited stdio transport.
//!
//! Spawns the wrapped tool server as a child process and mediates the line
//! stream in both directions: every parent line is decided before it reaches
//! the child, every child line is recorded before it reaches the parent, and
//! child stderr passes through verbatim. The loop is a state machine driven
//! by transport events.

use crate::decision::{DecisionCore, Outcome};
use quill_core::{QuillError, Result};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Subject attributed to stdio callers; the local transport has no bearer
/// credentials.
const STDIO_SUBJECT: &str = "anonymous";

/// Events driving the relay loop.
#[derive(Debug)]
enum RelayEvent {
    /// One line from the parent (the agent).
    Parent(String),
    /// Parent input closed.
    ParentClosed,
    /// One line from the child (the tool server).
    Child(String),
    /// Child stdout closed.
    ChildClosed,
}

/// Spawn `command` and relay between the parent's stdio and the child.
pub async fn run(core: Arc<DecisionCore>, command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| QuillError::Config("empty child command".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| QuillError::Transport(format!("failed to spawn '{program}': {e}")))?;

    info!(%program, "Wrapped tool server started");

    let child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| QuillError::Transport("child stdin unavailable".to_string()))?;
    let child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| QuillError::Transport("child stdout unavailable".to_string()))?;

    let result = relay_streams(
        core,
        tokio::io::stdin(),
        tokio::io::stdout(),
        child_stdout,
        child_stdin,
    )
    .await;

    shutdown_child(&mut child).await;
    result
}

/// The transport-agnostic relay loop, generic over the four streams so tests
/// can drive it without a terminal.
pub async fn relay_streams<PI, PO, CI, CO>(
    core: Arc<DecisionCore>,
    parent_in: PI,
    mut parent_out: PO,
    child_out: CI,
    mut child_in: CO,
) -> Result<()>
where
    PI: AsyncRead + Unpin + Send + 'static,
    PO: AsyncWrite + Unpin,
    CI: AsyncRead + Unpin + Send + 'static,
    CO: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<RelayEvent>(64);

    // Parent reader task
    let parent_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(parent_in).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if parent_tx.send(RelayEvent::Parent(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = parent_tx.send(RelayEvent::ParentClosed).await;
                    return;
                }
                Err(e) => {
                    warn!("Parent read error: {e}");
                    let _ = parent_tx.send(RelayEvent::ParentClosed).await;
                    return;
                }
            }
        }
    });

    // Child reader task
    let child_tx = tx;
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_out).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if child_tx.send(RelayEvent::Child(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = child_tx.send(RelayEvent::ChildClosed).await;
                    return;
                }
                Err(e) => {
                    warn!("Child read error: {e}");
                    let _ = child_tx.send(RelayEvent::ChildClosed).await;
                    return;
                }
            }
        }
    });

    while let Some(event) = rx.recv().await {
        match event {
            RelayEvent::Parent(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match core.decide(&line, STDIO_SUBJECT).await {
                    Outcome::Forward => {
                        write_line(&mut child_in, &line).await?;
                    }
                    Outcome::Deny { response } => {
                        debug!("Returning synthesized denial on stdio");
                        write_line(&mut parent_out, &response).await?;
                    }
                }
            }
            RelayEvent::ParentClosed => {
                // Close the child's stdin so it can wind down; keep
                // draining its remaining output until ChildClosed.
                child_in.shutdown().await.ok();
            }
            RelayEvent::Child(line) => {
                core.record_response(&line).await;
                write_line(&mut parent_out, &line).await?;
            }
            RelayEvent::ChildClosed => {
                info!("Wrapped tool server closed its output");
                break;
            }
        }
    }

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| QuillError::Transport(format!("write failed: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| QuillError::Transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| QuillError::Transport(format!("flush failed: {e}")))?;
    Ok(())
}

async fn shutdown_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!(%status, "Wrapped tool server exited");
        }
        _ => {
            // Give the child a moment after stdin closed, then stop it.
            let wait = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
            match wait {
                Ok(Ok(status)) => info!(%status, "Wrapped tool server exited"),
                _ => {
                    warn!("Wrapped tool server did not exit; killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

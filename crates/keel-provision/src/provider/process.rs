//! Helpers for the external CLIs providers drive (kind, eksctl, aws)

use std::collections::VecDeque;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::debug;

use keel_common::{Error, Result};

/// Lines of stderr kept for the error message of a failed command
const ERROR_TAIL_LINES: usize = 20;

fn describe(program: &str, args: &[&str]) -> String {
    format!("{} {}", program, args.join(" "))
}

/// Run a command to completion and return its stdout
pub(crate) async fn run_capture(program: &str, args: &[&str]) -> Result<String> {
    let command_line = describe(program, args);
    debug!(command = %command_line, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::io(format!("spawn {}", command_line), e))?;

    if !output.status.success() {
        return Err(Error::internal_with_context(
            command_line,
            format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A running command whose stderr is consumed line by line
///
/// The child is killed if this is dropped before [`finish`](Self::finish),
/// which is what happens when provisioning is interrupted.
pub(crate) struct StreamingCommand {
    command_line: String,
    child: Child,
    lines: Option<Lines<BufReader<ChildStderr>>>,
    tail: VecDeque<String>,
}

impl StreamingCommand {
    pub(crate) async fn spawn(program: &str, args: &[&str], stdin: Option<&str>) -> Result<Self> {
        let command_line = describe(program, args);
        debug!(command = %command_line, "starting");
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("spawn {}", command_line), e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::io(format!("write stdin of {}", command_line), e))?;
        }

        let lines = child
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines());
        Ok(Self {
            command_line,
            child,
            lines,
            tail: VecDeque::with_capacity(ERROR_TAIL_LINES),
        })
    }

    /// Next non-empty output line, or `None` once output ends
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| Error::io(format!("read output of {}", self.command_line), e))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if self.tail.len() == ERROR_TAIL_LINES {
                        self.tail.pop_front();
                    }
                    self.tail.push_back(line.clone());
                    return Ok(Some(line));
                }
                None => return Ok(None),
            }
        }
    }

    /// Wait for exit; a non-zero status is an error quoting the last lines
    pub(crate) async fn finish(mut self) -> Result<()> {
        while self.next_line().await?.is_some() {}
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::io(format!("wait for {}", self.command_line), e))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::internal_with_context(
                self.command_line,
                format!(
                    "exited with {}: {}",
                    status,
                    Vec::from(self.tail).join("\n")
                ),
            ))
        }
    }
}

//! Blocking client for the `oracle-ls serve` front end.

// Shared across test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::oracle::mock_oracle_path;

/// Command for the `oracle-ls` binary using the mock oracle and an isolated
/// config directory.
pub fn oracle_ls_command(config_home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_oracle-ls"));
    cmd.env("XDG_CONFIG_HOME", config_home)
        .arg("--oracle")
        .arg(mock_oracle_path());
    cmd
}

/// Talks to `oracle-ls serve` over its stdio, one JSON object per line.
pub struct FrontEndClient {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<Value>,
    /// Notifications read while waiting for a response.
    notifications: VecDeque<Value>,
    next_id: i64,
}

impl FrontEndClient {
    pub fn spawn(config_home: &Path, extra_args: &[&str]) -> Self {
        let mut child = oracle_ls_command(config_home)
            .args(extra_args)
            .arg("serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn oracle-ls binary");

        let stdin = child.stdin.take().expect("Failed to get stdin");
        let stdout = child.stdout.take().expect("Failed to get stdout");

        Self {
            child,
            stdin: Some(stdin),
            lines: spawn_reader(stdout),
            notifications: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn send_request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.write(&json!({ "id": id, "method": method, "params": params }));

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let message = self
                .next_message(deadline)
                .unwrap_or_else(|| panic!("No response to {} (id {})", method, id));
            if message.get("id") == Some(&json!(id)) {
                return message;
            }
            self.notifications.push_back(message);
        }
    }

    pub fn send_notification(&mut self, method: &str, params: Value) {
        self.write(&json!({ "method": method, "params": params }));
    }

    pub fn send_raw(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().expect("stdin open");
        writeln!(stdin, "{}", line).expect("Failed to write request");
        stdin.flush().expect("Failed to flush stdin");
    }

    /// Wait for the next notification with `method`.
    pub fn wait_for_notification(&mut self, method: &str, timeout: Duration) -> Option<Value> {
        if let Some(position) = self
            .notifications
            .iter()
            .position(|n| n["method"] == method)
        {
            return self.notifications.remove(position);
        }
        let deadline = Instant::now() + timeout;
        while let Some(message) = self.next_message(deadline) {
            if message["method"] == method {
                return Some(message);
            }
            self.notifications.push_back(message);
        }
        None
    }

    /// Read one line that is not an awaited response.
    pub fn next_raw_message(&mut self, timeout: Duration) -> Option<Value> {
        self.next_message(Instant::now() + timeout)
    }

    /// Send `shutdown` and wait for the process to exit.
    pub fn shutdown(mut self) -> ExitStatus {
        let response = self.send_request("shutdown", Value::Null);
        assert!(response["result"].is_null(), "shutdown failed: {}", response);
        self.stdin.take();
        self.child.wait().expect("oracle-ls should exit")
    }

    fn write(&mut self, message: &Value) {
        self.send_raw(&message.to_string());
    }

    fn next_message(&mut self, deadline: Instant) -> Option<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.lines.recv_timeout(remaining).ok()
    }
}

impl Drop for FrontEndClient {
    fn drop(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_reader(stdout: ChildStdout) -> mpsc::Receiver<Value> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(&line)
                .unwrap_or_else(|e| panic!("Invalid JSON from oracle-ls: {} ({})", line, e));
            if tx.send(value).is_err() {
                break;
            }
        }
    });
    rx
}

//! Remote Executor — one authenticated shell session per host.
//!
//! The engine only talks to the [`RemoteShell`]/[`RemoteSession`] traits; the
//! production implementation drives SSH via russh (password or private-key
//! auth, bounded connect timeout, line-buffered stdout/stderr streaming).
//! Tests inject a scripted mock instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use thiserror::Error;

use crate::domain::types::{AuthSecret, Node};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("authentication failed for {user}@{addr}")]
    Auth { user: String, addr: String },
    #[error("remote execution failed: {0}")]
    Exec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Callback receiving complete output lines as they arrive.
pub type OutputSink<'a> = &'a (dyn Fn(OutputStream, &str) + Send + Sync);

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(
        &self,
        node: &Node,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ShellError>;
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Run a command, optionally streaming output lines, and wait for exit.
    async fn run(
        &mut self,
        command: &str,
        sink: Option<OutputSink<'_>>,
    ) -> Result<ExecResult, ShellError>;

    async fn close(&mut self);
}

/// russh-backed [`RemoteShell`].
pub struct SshShell;

struct AcceptAllHostKeys;

#[async_trait]
impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    // Target hosts are freshly provisioned machines the caller supplied
    // credentials for; there is no prior known_hosts entry to pin.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(
        &self,
        node: &Node,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ShellError> {
        let config = Arc::new(client::Config::default());
        let connect_err = |reason: String| ShellError::Connect {
            addr: node.ip.clone(),
            reason,
        };

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(config, (node.ip.as_str(), 22), AcceptAllHostKeys),
        )
        .await
        .map_err(|_| connect_err("connect timeout".into()))?
        .map_err(|e| connect_err(e.to_string()))?;

        let authenticated = match &node.auth_secret {
            AuthSecret::Password(password) => handle
                .authenticate_password(&node.username, password)
                .await
                .map_err(|e| connect_err(e.to_string()))?,
            AuthSecret::PrivateKey(pem) => {
                let keypair = russh_keys::decode_secret_key(pem, None)
                    .map_err(|e| connect_err(format!("invalid private key: {e}")))?;
                handle
                    .authenticate_publickey(&node.username, Arc::new(keypair))
                    .await
                    .map_err(|e| connect_err(e.to_string()))?
            }
        };

        if !authenticated {
            return Err(ShellError::Auth {
                user: node.username.clone(),
                addr: node.ip.clone(),
            });
        }

        Ok(Box::new(SshSession { handle }))
    }
}

pub struct SshSession {
    handle: Handle<AcceptAllHostKeys>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(
        &mut self,
        command: &str,
        sink: Option<OutputSink<'_>>,
    ) -> Result<ExecResult, ShellError> {
        let exec_err = |e: russh::Error| ShellError::Exec(e.to_string());

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(exec_err)?;
        channel.exec(true, command).await.map_err(exec_err)?;

        let mut result = ExecResult::default();
        let mut stdout_partial = String::new();
        let mut stderr_partial = String::new();

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    let chunk = String::from_utf8_lossy(data);
                    result.stdout.push_str(&chunk);
                    emit_lines(&mut stdout_partial, &chunk, OutputStream::Stdout, sink);
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    let chunk = String::from_utf8_lossy(data);
                    result.stderr.push_str(&chunk);
                    emit_lines(&mut stderr_partial, &chunk, OutputStream::Stderr, sink);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    result.exit_code = exit_status as i32;
                }
                _ => {}
            }
        }

        // Trailing output without a final newline still gets delivered.
        if let Some(sink) = sink {
            if !stdout_partial.is_empty() {
                sink(OutputStream::Stdout, &stdout_partial);
            }
            if !stderr_partial.is_empty() {
                sink(OutputStream::Stderr, &stderr_partial);
            }
        }

        Ok(result)
    }

    async fn close(&mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Buffer a chunk and hand complete lines to the sink.
fn emit_lines(partial: &mut String, chunk: &str, stream: OutputStream, sink: Option<OutputSink<'_>>) {
    let Some(sink) = sink else {
        return;
    };
    partial.push_str(chunk);
    while let Some(pos) = partial.find('\n') {
        let line: String = partial.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']);
        if !line.is_empty() {
            sink(stream, line);
        }
    }
}

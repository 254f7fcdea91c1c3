// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! libssh2-backed sessions.
//!
//! libssh2 is blocking, so every call runs on tokio's blocking pool. One
//! session serves a whole operation; each command gets its own channel and
//! runs through `bash -lc`.

use std::io::{self, ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostwright_core::credentials::Credential;
use hostwright_core::session::{CommandOutput, RemoteSession, SessionConnector, SshTarget};
use hostwright_core::step::shell_quote;
use hostwright_core::{CoreError, Result};
use ssh2::Session;
use tracing::{debug, instrument};

/// libssh2 timeout code.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Sleep between polls when neither output stream has data.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Opens [`Ssh2Session`]s.
#[derive(Debug, Clone)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
}

impl Ssh2Connector {
    /// Connector giving TCP connect, handshake and auth `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn millis(duration: Duration) -> u32 {
    // 0 disables the libssh2 timeout; keep at least 1ms.
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX).max(1)
}

fn connection_error(target: &SshTarget, reason: impl std::fmt::Display) -> CoreError {
    CoreError::Connection {
        host: format!("{}:{}", target.host, target.port),
        reason: reason.to_string(),
    }
}

fn open(target: &SshTarget, credential: &Credential, timeout: Duration) -> Result<Session> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connection_error(target, format!("resolve failed: {e}")))?
        .next()
        .ok_or_else(|| connection_error(target, "host resolved to no address"))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| connection_error(target, format!("connect failed: {e}")))?;

    let mut session = Session::new().map_err(|e| connection_error(target, e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(timeout));
    session
        .handshake()
        .map_err(|e| connection_error(target, format!("handshake failed: {e}")))?;

    session
        .userauth_pubkey_memory(
            &target.user,
            credential.public_key.as_deref(),
            &credential.private_key,
            credential.passphrase.as_deref(),
        )
        .map_err(|e| connection_error(target, format!("public key authentication failed: {e}")))?;
    if !session.authenticated() {
        return Err(connection_error(target, "authentication failed"));
    }
    Ok(session)
}

#[async_trait]
impl SessionConnector for Ssh2Connector {
    #[instrument(skip_all, fields(host = %target.host, port = target.port, user = %target.user))]
    async fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn RemoteSession>> {
        let owned_target = target.clone();
        let credential = credential.clone();
        let timeout = self.connect_timeout;

        let session = tokio::task::spawn_blocking(move || {
            open(&owned_target, &credential, timeout)
        })
        .await
        .map_err(|e| connection_error(target, format!("connect task failed: {e}")))??;

        debug!("SSH session established");
        Ok(Box::new(Ssh2Session {
            session: Arc::new(session),
            target: target.clone(),
        }))
    }
}

/// An authenticated libssh2 session.
pub struct Ssh2Session {
    session: Arc<Session>,
    target: SshTarget,
}

impl std::fmt::Debug for Ssh2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Session")
            .field("target", &self.target)
            .finish()
    }
}

fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
}

/// Read once from `reader` unless it already hit EOF. Returns whether
/// anything happened.
fn pump(
    reader: &mut impl Read,
    sink: &mut Vec<u8>,
    eof: &mut bool,
    buf: &mut [u8],
) -> io::Result<bool> {
    if *eof {
        return Ok(false);
    }
    match reader.read(buf) {
        Ok(0) => {
            *eof = true;
            Ok(true)
        }
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Drain stdout and stderr together from non-blocking readers.
///
/// A command that fills its stderr window blocks until stderr is read, so
/// neither stream may be read to EOF before the other.
fn read_output(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    deadline: Instant,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (mut out_eof, mut err_eof) = (false, false);
    let mut buf = [0u8; 16 * 1024];

    while !(out_eof && err_eof) {
        let read_out = pump(stdout, &mut out, &mut out_eof, &mut buf)?;
        let read_err = pump(stderr, &mut err, &mut err_eof, &mut buf)?;
        if !read_out && !read_err {
            if Instant::now() >= deadline {
                return Err(io::Error::new(ErrorKind::TimedOut, "command output timed out"));
            }
            std::thread::sleep(IDLE_POLL);
        }
    }
    Ok((out, err))
}

fn run(session: &Session, command: &str, timeout: Duration) -> Result<CommandOutput> {
    let timed_out = || CoreError::Timeout {
        after_secs: timeout.as_secs(),
    };
    let ssh_err = |e: ssh2::Error| {
        if is_timeout(&e) {
            timed_out()
        } else {
            CoreError::Connection {
                host: "session".to_string(),
                reason: e.to_string(),
            }
        }
    };
    let io_err = |e: io::Error| {
        if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) {
            timed_out()
        } else {
            CoreError::Connection {
                host: "session".to_string(),
                reason: e.to_string(),
            }
        }
    };

    let deadline = Instant::now() + timeout;
    session.set_timeout(millis(timeout));
    let mut channel = session.channel_session().map_err(ssh_err)?;
    channel
        .exec(&format!("bash -lc {}", shell_quote(command)))
        .map_err(ssh_err)?;

    session.set_blocking(false);
    let output = read_output(&mut channel.stream(0), &mut channel.stderr(), deadline);
    session.set_blocking(true);
    let (stdout, stderr) = output.map_err(io_err)?;

    channel.wait_close().map_err(ssh_err)?;
    let exit_code = channel.exit_status().map_err(ssh_err)?;

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        let output = tokio::task::spawn_blocking(move || run(&session, &command, timeout))
            .await
            .map_err(|e| connection_error(&self.target, format!("command task failed: {e}")))??;

        debug!(
            host = %self.target.host,
            exit_code = output.exit_code,
            "Remote command finished"
        );
        Ok(output)
    }
}

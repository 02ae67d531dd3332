//! Authenticated SSH session probe.
//!
//! libssh2 is blocking, so each probe runs on the blocking pool with socket and
//! per-call timeouts set. The async wrapper adds an outer deadline; when it
//! fires the blocking side is left to run into its own timeouts and close the
//! socket instead of being torn down mid-handshake.

use crate::inventory::{Credentials, DeviceAddress};
use crate::probe::{
    duration_ms, extract_uptime, truncate_utf8, CommandReport, ProbeKind, ProbeOutcome, ProbeResult,
};
use ssh2::{ErrorCode, Session};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::{task, time};
use tracing::{debug, warn};

const KIND: ProbeKind = ProbeKind::CredentialedSession;

// libssh2 error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const GUARD_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionProbe {
    pub device_id: String,
    pub address: DeviceAddress,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub command: Option<String>,
    pub max_output_bytes: usize,
}

pub async fn probe_session(probe: SessionProbe) -> ProbeResult {
    let device_id = probe.device_id.clone();
    let guard = guard_budget(&probe);
    let handle = task::spawn_blocking(move || run_blocking(&probe));

    match time::timeout(guard, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            warn!(device = %device_id, error = %join_err, "session probe task failed");
            ProbeResult::error(&device_id, KIND, format!("session probe task failed: {join_err}"))
        }
        Err(_elapsed) => {
            warn!(device = %device_id, "session probe exceeded its deadline");
            ProbeResult::timeout(
                &device_id,
                KIND,
                format!("session not ready within {} ms", guard.as_millis()),
            )
        }
    }
}

/// connect + handshake + auth, plus exec + read when a command is set; each step gets `timeout`.
fn guard_budget(probe: &SessionProbe) -> Duration {
    let steps = if probe.command.is_some() { 5 } else { 3 };
    probe.timeout * steps + GUARD_SLACK
}

/// Disconnects on drop so every exit path releases the socket.
struct ClosingSession(Session);

impl Deref for ClosingSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.0
    }
}

impl DerefMut for ClosingSession {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.0
    }
}

impl Drop for ClosingSession {
    fn drop(&mut self) {
        let _ = self.0.disconnect(None, "probe complete", None);
    }
}

fn run_blocking(probe: &SessionProbe) -> ProbeResult {
    let id = probe.device_id.as_str();
    let start = Instant::now();

    let stream = match connect(&probe.address, probe.timeout) {
        Ok(stream) => stream,
        Err(err) => {
            debug!(device = %id, address = %probe.address, error = %err, "ssh connect failed");
            return ProbeResult::unreachable(id, KIND, err.to_string());
        }
    };
    let _ = stream.set_read_timeout(Some(probe.timeout));
    let _ = stream.set_write_timeout(Some(probe.timeout));

    let mut session = match Session::new() {
        Ok(session) => ClosingSession(session),
        Err(err) => {
            return ProbeResult::error(id, KIND, format!("ssh session init failed: {err}"));
        }
    };
    session.set_tcp_stream(stream);
    session.set_timeout(timeout_ms(probe.timeout));

    let handshake_start = Instant::now();
    if let Err(err) = session.handshake() {
        let outcome = if handshake_start.elapsed() >= probe.timeout {
            ProbeOutcome::Timeout
        } else {
            handshake_error_outcome(session_code(&err))
        };
        let detail = format!("ssh handshake failed: {}", err.message());
        debug!(device = %id, outcome = outcome.as_str(), error = %err, "ssh handshake failed");
        return failed(id, outcome, detail);
    }
    let handshake_latency = start.elapsed();

    let username = probe.credentials.username.as_str();
    match authenticate(&session, &probe.credentials) {
        Ok(()) if session.authenticated() => {}
        Ok(()) => {
            return ProbeResult::auth_failed(
                id,
                KIND,
                handshake_latency,
                format!("server did not complete authentication for '{username}'"),
            );
        }
        Err(err) => {
            let outcome = auth_error_outcome(session_code(&err));
            let detail = format!("authentication for '{username}' failed: {}", err.message());
            debug!(device = %id, outcome = outcome.as_str(), error = %err, "ssh auth failed");
            return match outcome {
                ProbeOutcome::AuthFailed => {
                    ProbeResult::auth_failed(id, KIND, handshake_latency, detail)
                }
                other => failed(id, other, detail),
            };
        }
    }
    let latency = start.elapsed();

    let Some(command) = probe.command.as_deref() else {
        let banner = session.banner().unwrap_or("unknown banner");
        return ProbeResult::success(
            id,
            KIND,
            latency,
            format!("authenticated as '{username}' ({banner})"),
        );
    };

    session.set_timeout(timeout_ms(probe.timeout));
    let command_start = Instant::now();
    let output = exec_command(&session, command, probe.max_output_bytes);
    command_result(id, latency, command, output, command_start.elapsed())
}

/// Login already succeeded, so the device stays `success` whatever the command does;
/// a failed command only shows up in the report and the detail.
fn command_result(
    id: &str,
    latency: Duration,
    command: &str,
    output: Result<String, CommandError>,
    elapsed: Duration,
) -> ProbeResult {
    let command_ms = duration_ms(elapsed);
    match output {
        Ok(output) => {
            debug!(
                device = %id,
                command_ms = command_ms as u64,
                bytes = output.len(),
                "diagnostic command finished"
            );
            let report = CommandReport {
                command: command.to_string(),
                duration_ms: command_ms,
                uptime: extract_uptime(&output),
                error: None,
            };
            ProbeResult::success(id, KIND, latency, output).with_command(report)
        }
        Err(err) => {
            let reason = if err.is_timeout() {
                format!("command '{command}' timed out: {err}")
            } else {
                format!("command '{command}' failed: {err}")
            };
            debug!(device = %id, command_ms = command_ms as u64, reason = %reason, "diagnostic command did not finish");
            let report = CommandReport {
                command: command.to_string(),
                duration_ms: command_ms,
                uptime: None,
                error: Some(reason.clone()),
            };
            ProbeResult::success(id, KIND, latency, format!("authenticated; {reason}"))
                .with_command(report)
        }
    }
}

fn failed(id: &str, outcome: ProbeOutcome, detail: String) -> ProbeResult {
    match outcome {
        ProbeOutcome::Timeout => ProbeResult::timeout(id, KIND, detail),
        ProbeOutcome::Unreachable => ProbeResult::unreachable(id, KIND, detail),
        _ => ProbeResult::error(id, KIND, detail),
    }
}

fn connect(address: &DeviceAddress, timeout: Duration) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(|err| io::Error::new(err.kind(), format!("resolve {}: {err}", address.host)))?
        .collect();

    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} resolved to no addresses", address.host),
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

fn authenticate(session: &Session, creds: &Credentials) -> Result<(), ssh2::Error> {
    if let Some(key) = &creds.key_path {
        return session.userauth_pubkey_file(
            &creds.username,
            None,
            key,
            creds.key_passphrase.as_deref(),
        );
    }
    session.userauth_password(&creds.username, creds.password.as_deref().unwrap_or_default())
}

#[derive(Debug, Error)]
enum CommandError {
    #[error("{}", .0.message())]
    Ssh(ssh2::Error),
    #[error(transparent)]
    Io(io::Error),
}

impl CommandError {
    fn is_timeout(&self) -> bool {
        match self {
            Self::Ssh(err) => is_timeout_code(session_code(err)),
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
        }
    }
}

fn exec_command(session: &Session, command: &str, max_bytes: usize) -> Result<String, CommandError> {
    let mut channel = session.channel_session().map_err(CommandError::Ssh)?;
    channel.exec(command).map_err(CommandError::Ssh)?;

    let mut buf = Vec::new();
    Read::by_ref(&mut channel)
        .take(max_bytes as u64)
        .read_to_end(&mut buf)
        .map_err(CommandError::Io)?;

    let _ = channel.close();
    let _ = channel.wait_close();

    Ok(truncate_utf8(
        String::from_utf8_lossy(&buf).into_owned(),
        max_bytes,
    ))
}

fn session_code(err: &ssh2::Error) -> i32 {
    match err.code() {
        ErrorCode::Session(code) => code,
        ErrorCode::SFTP(_) => 0,
    }
}

fn is_timeout_code(code: i32) -> bool {
    code == LIBSSH2_ERROR_TIMEOUT || code == LIBSSH2_ERROR_SOCKET_TIMEOUT
}

fn is_socket_code(code: i32) -> bool {
    matches!(
        code,
        LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV
    )
}

fn handshake_error_outcome(code: i32) -> ProbeOutcome {
    if is_timeout_code(code) {
        ProbeOutcome::Timeout
    } else if is_socket_code(code) {
        ProbeOutcome::Unreachable
    } else {
        ProbeOutcome::Error
    }
}

/// Anything after a completed handshake that is not a transport failure means the
/// device answered and refused us.
fn auth_error_outcome(code: i32) -> ProbeOutcome {
    if is_timeout_code(code) {
        ProbeOutcome::Timeout
    } else if is_socket_code(code) {
        ProbeOutcome::Unreachable
    } else {
        ProbeOutcome::AuthFailed
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
    const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
    const LIBSSH2_ERROR_KEX_FAILURE: i32 = -5;

    fn probe_for(port: u16, timeout: Duration) -> SessionProbe {
        SessionProbe {
            device_id: "sw1".to_string(),
            address: DeviceAddress::parse(&format!("127.0.0.1:{port}")).unwrap(),
            credentials: Credentials {
                username: "admin".to_string(),
                password: Some("wrong".to_string()),
                key_path: None,
                key_passphrase: None,
            },
            timeout,
            command: None,
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = probe_session(probe_for(port, Duration::from_secs(2))).await;
        assert_eq!(result.outcome, ProbeOutcome::Unreachable);
        assert_eq!(result.kind, ProbeKind::CredentialedSession);
        assert!(result.latency_ms.is_none());
    }

    #[tokio::test]
    async fn silent_server_times_out_without_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let started = Instant::now();
        let result = probe_session(probe_for(port, Duration::from_millis(300))).await;
        holder.abort();

        assert_eq!(result.outcome, ProbeOutcome::Timeout, "{}", result.detail);
        assert!(result.latency_ms.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn rejected_credentials_are_auth_failed_not_unreachable() {
        assert_eq!(
            auth_error_outcome(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            ProbeOutcome::AuthFailed
        );
        assert_eq!(
            auth_error_outcome(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED),
            ProbeOutcome::AuthFailed
        );
        assert_eq!(auth_error_outcome(LIBSSH2_ERROR_TIMEOUT), ProbeOutcome::Timeout);
        assert_eq!(
            auth_error_outcome(LIBSSH2_ERROR_SOCKET_DISCONNECT),
            ProbeOutcome::Unreachable
        );
    }

    #[test]
    fn handshake_failures_split_by_cause() {
        assert_eq!(handshake_error_outcome(LIBSSH2_ERROR_TIMEOUT), ProbeOutcome::Timeout);
        assert_eq!(
            handshake_error_outcome(LIBSSH2_ERROR_SOCKET_RECV),
            ProbeOutcome::Unreachable
        );
        assert_eq!(
            handshake_error_outcome(LIBSSH2_ERROR_KEX_FAILURE),
            ProbeOutcome::Error
        );
    }

    #[test]
    fn failed_command_keeps_the_session_successful() {
        let timed_out = CommandError::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        let result = command_result(
            "sw1",
            Duration::from_millis(40),
            "show version",
            Err(timed_out),
            Duration::from_millis(300),
        );

        assert_eq!(result.outcome, ProbeOutcome::Success);
        assert_eq!(result.latency_ms, Some(40.0));
        assert!(result.detail.contains("timed out"), "{}", result.detail);
        let report = result.command.unwrap();
        assert_eq!(report.duration_ms, 300.0);
        assert!(report.error.unwrap().contains("show version"));
        assert!(report.uptime.is_none());
    }

    #[test]
    fn command_output_is_timed_and_parsed() {
        let result = command_result(
            "r1",
            Duration::from_millis(25),
            "show version",
            Ok("IOS XE\nr1 uptime is 5 days, 3 hours".to_string()),
            Duration::from_millis(120),
        );

        assert_eq!(result.outcome, ProbeOutcome::Success);
        assert_eq!(result.latency_ms, Some(25.0));
        let report = result.command.unwrap();
        assert_eq!(report.duration_ms, 120.0);
        assert_eq!(report.uptime.as_deref(), Some("r1 uptime is 5 days, 3 hours"));
        assert!(report.error.is_none());
    }

    #[test]
    fn guard_covers_command_step() {
        let mut probe = probe_for(22, Duration::from_secs(2));
        assert_eq!(guard_budget(&probe), Duration::from_secs(7));
        probe.command = Some("show version".to_string());
        assert_eq!(guard_budget(&probe), Duration::from_secs(11));
    }
}

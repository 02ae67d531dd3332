use crate::inventory::DeviceAddress;
use crate::probe::{ProbeKind, ProbeResult};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Extra time granted to the `ping` process beyond its own reply deadline.
const PING_PROCESS_SLACK: Duration = Duration::from_millis(500);

/// Single TCP connect. Refusal, network errors and timeouts all count as unreachable.
pub async fn probe_tcp(device_id: &str, address: &DeviceAddress, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let target = address.socket_target();

    match time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(_stream)) => {
            let latency = start.elapsed();
            ProbeResult::success(
                device_id,
                ProbeKind::TcpReachability,
                latency,
                format!("connected to {target}"),
            )
        }
        Ok(Err(err)) => {
            debug!(device = %device_id, address = %target, error = %err, "tcp probe failed");
            ProbeResult::unreachable(device_id, ProbeKind::TcpReachability, err.to_string())
        }
        Err(_elapsed) => {
            debug!(device = %device_id, address = %target, "tcp probe timeout");
            ProbeResult::unreachable(
                device_id,
                ProbeKind::TcpReachability,
                format!("connect timed out after {} ms", timeout.as_millis()),
            )
        }
    }
}

/// ICMP echo through the system `ping` binary, which carries the privileges raw sockets need.
///
/// A missing binary or a permission failure yields `outcome=error`; no reply yields
/// `outcome=unreachable`.
pub async fn probe_ping(device_id: &str, host: &str, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let mut cmd = ping_command(host, timeout);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match time::timeout(timeout + PING_PROCESS_SLACK, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
            return ProbeResult::error(
                device_id,
                ProbeKind::Ping,
                "ping binary not found; ICMP probing unavailable".to_string(),
            );
        }
        Ok(Err(err)) if err.kind() == ErrorKind::PermissionDenied => {
            return ProbeResult::error(
                device_id,
                ProbeKind::Ping,
                format!("ICMP not permitted: {err}"),
            );
        }
        Ok(Err(err)) => {
            return ProbeResult::error(device_id, ProbeKind::Ping, format!("ping failed: {err}"));
        }
        Err(_elapsed) => {
            return ProbeResult::unreachable(
                device_id,
                ProbeKind::Ping,
                format!("no echo reply within {} ms", timeout.as_millis()),
            );
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if output.status.success() {
        let latency = parse_ping_rtt_ms(&stdout)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
            .unwrap_or_else(|| start.elapsed());
        return ProbeResult::success(
            device_id,
            ProbeKind::Ping,
            latency,
            last_line(&stdout).to_string(),
        );
    }

    if is_permission_failure(&stderr) || is_permission_failure(&stdout) {
        return ProbeResult::error(
            device_id,
            ProbeKind::Ping,
            format!("ICMP not permitted: {}", last_line(&stderr)),
        );
    }

    let reason = if stderr.trim().is_empty() {
        last_line(&stdout)
    } else {
        last_line(&stderr)
    };
    debug!(device = %device_id, host = %host, reason = %reason, "ping probe failed");
    ProbeResult::unreachable(device_id, ProbeKind::Ping, reason.to_string())
}

#[cfg(target_os = "windows")]
fn ping_command(host: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    cmd.arg("-n")
        .arg("1")
        .arg("-w")
        .arg(timeout.as_millis().max(1).to_string())
        .arg(host);
    cmd
}

#[cfg(target_os = "macos")]
fn ping_command(host: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    cmd.arg("-n")
        .arg("-c")
        .arg("1")
        .arg("-t")
        .arg(timeout_secs_ceil(timeout).to_string())
        .arg(host);
    cmd
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn ping_command(host: &str, timeout: Duration) -> Command {
    let mut cmd = Command::new("ping");
    cmd.arg("-n")
        .arg("-c")
        .arg("1")
        .arg("-W")
        .arg(timeout_secs_ceil(timeout).to_string())
        .arg(host);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn timeout_secs_ceil(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Extracts the round-trip time from `time=12.3 ms`, `time=12ms` or `time<1ms`.
fn parse_ping_rtt_ms(stdout: &str) -> Option<f64> {
    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        let Some(idx) = lower.find("time=").or_else(|| lower.find("time<")) else {
            continue;
        };
        let rest = &lower[idx + 5..];
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(ms) = number.parse::<f64>() {
            return Some(ms);
        }
    }
    None
}

fn is_permission_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("must be root")
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_reports_latency_for_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = DeviceAddress::parse(&format!("127.0.0.1:{port}")).unwrap();

        let result = probe_tcp("r1", &addr, Duration::from_secs(2)).await;
        assert_eq!(result.outcome, ProbeOutcome::Success);
        assert_eq!(result.kind, ProbeKind::TcpReachability);
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn tcp_probe_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let addr = DeviceAddress::parse(&format!("127.0.0.1:{port}")).unwrap();

        let result = probe_tcp("r1", &addr, Duration::from_secs(2)).await;
        assert_eq!(result.outcome, ProbeOutcome::Unreachable);
        assert!(result.latency_ms.is_none());
        assert!(!result.detail.is_empty());
    }

    #[test]
    fn parses_rtt_from_common_ping_formats() {
        let linux = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.\n64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms\n";
        assert_eq!(parse_ping_rtt_ms(linux), Some(0.045));

        let windows = "Reply from 10.0.0.1: bytes=32 time=12ms TTL=64";
        assert_eq!(parse_ping_rtt_ms(windows), Some(12.0));

        let sub_ms = "Reply from 10.0.0.1: bytes=32 time<1ms TTL=128";
        assert_eq!(parse_ping_rtt_ms(sub_ms), Some(1.0));

        assert_eq!(parse_ping_rtt_ms("Request timed out."), None);
    }

    #[test]
    fn detects_permission_failures() {
        assert!(is_permission_failure("ping: socket: Operation not permitted"));
        assert!(!is_permission_failure("1 packets transmitted, 0 received"));
    }
}

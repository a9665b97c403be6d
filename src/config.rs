//! CLI argument parsing and bind-specification syntax.
//!
//! A bind specification is `bindHost:bindPort::targetHost:targetPort`.
//! Malformed specs and out-of-range ports are fatal before any socket is
//! opened. Every tunable is also reachable through a `PORTBRIDGE_*`
//! environment variable.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::fmt;
use std::time::Duration;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// A `host:port` endpoint, kept unresolved so name resolution happens at
/// bind/connect time the way the OS sees it then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid host:port pair: {}", s))?;
        if host.is_empty() || host.contains(':') {
            return Err(format!("Invalid host:port pair: {}", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("Invalid port {} in {}", port, s))?;
        if port == 0 {
            return Err(format!("Invalid port 0 in {}", s));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One forwarding rule: listen on `bind`, relay to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub bind: HostPort,
    pub target: HostPort,
}

impl Binding {
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split("::").collect();
        if parts.len() != 2 {
            return Err(format!(
                "Invalid binding '{}': expected bindHost:bindPort::targetHost:targetPort",
                s
            ));
        }
        Ok(Self {
            bind: HostPort::parse(parts[0])?,
            target: HostPort::parse(parts[1])?,
        })
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.bind, self.target)
    }
}

/// CLI arguments for the port forwarder
///
/// Supports environment variables with PORTBRIDGE_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Layer-4 TCP/UDP port forwarder")]
pub struct CliArgs {
    /// Forwarding rules: bindHost:bindPort::targetHost:targetPort
    #[arg(required = true, value_name = "BIND::TARGET", value_parser = Binding::parse)]
    pub bindings: Vec<Binding>,

    /// Only enable TCP forwarding
    #[arg(short = 't', long, env = "PORTBRIDGE_TCP", default_value_t = false)]
    pub tcp: bool,

    /// Only enable UDP forwarding
    #[arg(short = 'u', long, env = "PORTBRIDGE_UDP", default_value_t = false)]
    pub udp: bool,

    /// Log level: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "PORTBRIDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Include timestamps in log output
    #[arg(long, env = "PORTBRIDGE_LOG_TIMESTAMPS", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_timestamps: bool,

    /// Interval between periodic status reports (e.g., "30s", "2m")
    #[arg(long, env = "PORTBRIDGE_STATS_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub stats_interval: Duration,

    // ==================== Performance Tuning ====================
    /// Per-flow buffer size for TCP transfer in bytes (min 1024)
    #[arg(long, env = "PORTBRIDGE_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Receive buffer for UDP datagrams in bytes (min 100000, above the
    /// 65535-byte datagram limit so no datagram is ever truncated)
    #[arg(long, env = "PORTBRIDGE_UDP_BUFFER_SIZE", default_value_t = 100_000, help_heading = "Performance")]
    pub udp_buffer_size: usize,

    /// TCP connect timeout to the target (default: 5s)
    #[arg(long, env = "PORTBRIDGE_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Close a UDP session after this long without traffic (default: 1h)
    #[arg(long, env = "PORTBRIDGE_IDLE_TIMEOUT", default_value = "1h", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// How often idle UDP sessions are checked for eviction (default: 5s)
    #[arg(long, env = "PORTBRIDGE_IDLE_CHECK_INTERVAL", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_check_interval: Duration,

    /// Maximum tracked UDP client flows. The session table holds two entries
    /// per flow, so internal capacity is double this value.
    #[arg(long, env = "PORTBRIDGE_CONN_TRACK_MAX", default_value_t = 10_000, help_heading = "Performance")]
    pub conn_track_max: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 1024 {
            return Err(anyhow!("buffer_size must be at least 1024 bytes"));
        }
        if self.udp_buffer_size < 100_000 {
            return Err(anyhow!(
                "udp_buffer_size must be at least 100000 bytes (max UDP datagram is 65535) or data might be lost"
            ));
        }
        if self.conn_track_max == 0 {
            return Err(anyhow!("conn_track_max must be greater than 0"));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats_interval must be greater than 0"));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle_timeout must be greater than 0"));
        }
        if self.idle_check_interval.is_zero() {
            return Err(anyhow!("idle_check_interval must be greater than 0"));
        }
        Ok(())
    }

    /// Whether the TCP engine should run. Selecting neither protocol runs both.
    pub fn tcp_enabled(&self) -> bool {
        self.tcp || !self.udp
    }

    /// Whether the UDP engine should run.
    pub fn udp_enabled(&self) -> bool {
        self.udp || !self.tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["portbridge", "127.0.0.1:15001::127.0.0.1:15002"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_binding_parse_valid() {
        let b = Binding::parse("127.0.0.1:8080::example.com:443").unwrap();
        assert_eq!(b.bind.host, "127.0.0.1");
        assert_eq!(b.bind.port, 8080);
        assert_eq!(b.target.host, "example.com");
        assert_eq!(b.target.port, 443);
        assert_eq!(b.to_string(), "127.0.0.1:8080::example.com:443");
    }

    #[test]
    fn test_binding_parse_missing_separator() {
        assert!(Binding::parse("127.0.0.1:8080:example.com:443").is_err());
    }

    #[test]
    fn test_binding_parse_too_many_separators() {
        assert!(Binding::parse("a:1::b:2::c:3").is_err());
    }

    #[test]
    fn test_host_port_rejects_bad_port() {
        assert!(HostPort::parse("host:0").is_err());
        assert!(HostPort::parse("host:65536").is_err());
        assert!(HostPort::parse("host:notaport").is_err());
        assert!(HostPort::parse("hostonly").is_err());
        assert!(HostPort::parse(":443").is_err());
    }

    #[test]
    fn test_host_port_accepts_port_range_bounds() {
        assert_eq!(HostPort::parse("h:1").unwrap().port, 1);
        assert_eq!(HostPort::parse("h:65535").unwrap().port, 65535);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = args(&[]);
        assert_eq!(cli.buffer_size, 32 * 1024);
        assert_eq!(cli.udp_buffer_size, 100_000);
        assert_eq!(cli.stats_interval, Duration::from_secs(30));
        assert_eq!(cli.idle_timeout, Duration::from_secs(3600));
        assert_eq!(cli.idle_check_interval, Duration::from_secs(5));
        assert_eq!(cli.conn_track_max, 10_000);
        assert!(cli.tcp_enabled());
        assert!(cli.udp_enabled());
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_protocol_selection() {
        let tcp_only = args(&["--tcp"]);
        assert!(tcp_only.tcp_enabled());
        assert!(!tcp_only.udp_enabled());

        let udp_only = args(&["--udp"]);
        assert!(!udp_only.tcp_enabled());
        assert!(udp_only.udp_enabled());
    }

    #[test]
    fn test_cli_rejects_bad_binding() {
        assert!(CliArgs::try_parse_from(["portbridge", "nonsense"]).is_err());
        assert!(CliArgs::try_parse_from(["portbridge"]).is_err());
    }

    #[test]
    fn test_validate_buffer_minimums() {
        let cli = args(&["--buffer-size", "512"]);
        assert!(cli.validate().is_err());

        let cli = args(&["--udp-buffer-size", "65536"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_duration_parsing_forms() {
        let cli = args(&["--idle-timeout", "90"]);
        assert_eq!(cli.idle_timeout, Duration::from_secs(90));
        let cli = args(&["--idle-timeout", "2m"]);
        assert_eq!(cli.idle_timeout, Duration::from_secs(120));
    }
}

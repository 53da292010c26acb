use std::time::Duration;

use clap::Parser;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 9999;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// IP address the server binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,

    /// Port to listen on. A value that is not a valid port falls back to 9999.
    #[arg(long, env = "PORT")]
    pub port: Option<String>,

    /// Seconds between liveness sweeps.
    #[arg(long, default_value_t = 10)]
    pub sweep_interval_secs: u64,
}

impl Cli {
    pub fn port(&self) -> u16 {
        resolve_port(self.port.as_deref())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Parses `raw` as a port, silently using [`DEFAULT_PORT`] when it is
/// missing or malformed.
pub fn resolve_port(raw: Option<&str>) -> u16 {
    let Some(raw) = raw else {
        return DEFAULT_PORT;
    };
    match raw.trim().parse() {
        Ok(port) => port,
        Err(err) => {
            debug!(value = raw, error = %err, "ignoring invalid port");
            DEFAULT_PORT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_falls_back_to_the_default() {
        assert_eq!(resolve_port(None), 9999);
        assert_eq!(resolve_port(Some("not-a-port")), 9999);
        assert_eq!(resolve_port(Some("70000")), 9999);
        assert_eq!(resolve_port(Some(" 8080 ")), 8080);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "sum-server",
            "--ip",
            "0.0.0.0",
            "--port",
            "4000",
            "--sweep-interval-secs",
            "2",
        ])
        .expect("valid flags");
        assert_eq!(cli.ip, "0.0.0.0");
        assert_eq!(cli.port(), 4000);
        assert_eq!(cli.sweep_interval(), Duration::from_secs(2));
    }
}

//! Gateway and runner configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::framer::FramerKind;
use crate::resolve::DEFAULT_REMOTE_PORT;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stream transport listen address.
    pub listen: SocketAddr,
    /// HTTP ingress, health and metrics.
    pub http_listen: SocketAddr,
    /// Port of bare-name functions.
    pub default_port: u16,
    pub call_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REMOTE_PORT)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            default_port: DEFAULT_REMOTE_PORT,
            call_timeout: None,
        }
    }
}

impl GatewayConfig {
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    pub fn with_http_listen(mut self, addr: SocketAddr) -> Self {
        self.http_listen = addr;
        self
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// How the runner executes its program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunnerMode {
    /// One process per call, output streamed.
    #[default]
    Exec,
    /// One process per call, output released only on success.
    Buffered,
    /// One warm process, calls delimited by a framer.
    Afterburn(FramerKind),
}

impl RunnerMode {
    /// Afterburn wins over buffering when both are requested.
    pub fn select(framer: Option<FramerKind>, buffered: bool) -> Self {
        match (framer, buffered) {
            (Some(kind), _) => Self::Afterburn(kind),
            (None, true) => Self::Buffered,
            (None, false) => Self::Exec,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub mode: RunnerMode,
    /// Stream transport listen address.
    pub listen: SocketAddr,
    pub http_listen: SocketAddr,
    pub call_timeout: Option<Duration>,
    /// Input beyond this many bytes is not passed to the program.
    pub read_limit: Option<u64>,
}

impl RunnerConfig {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            mode: RunnerMode::default(),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REMOTE_PORT)),
            http_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            call_timeout: None,
            read_limit: None,
        }
    }

    pub fn with_mode(mut self, mode: RunnerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    pub fn with_http_listen(mut self, addr: SocketAddr) -> Self {
        self.http_listen = addr;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_read_limit(mut self, limit: Option<u64>) -> Self {
        self.read_limit = limit;
        self
    }
}

/// Parse `250ms`, `30s`, `5m`, `1h`; a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit {other:?} in {s:?}")),
    }
}

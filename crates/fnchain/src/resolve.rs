//! Chain expressions and their resolution to network endpoints.
//!
//! An identifier is either a bare function name, resolved through an
//! [`EndpointResolver`], or a `scheme://host[:port]` URI. `grpc://` and bare
//! names use the stream transport; `http://` posts to a plain HTTP endpoint.

use std::fmt;

use crate::error::CallError;
use crate::options::CallOptions;
use crate::wire::CallHeader;

/// Port of a remote function's stream transport when none is given.
pub const DEFAULT_REMOTE_PORT: u16 = 2424;
/// Port of an `http://` hop when none is given.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub identifier: String,
    pub options: CallOptions,
}

impl Hop {
    pub fn new(identifier: impl Into<String>, options: CallOptions) -> Self {
        Self {
            identifier: identifier.into(),
            options,
        }
    }
}

/// Ordered hops of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainExpression {
    hops: Vec<Hop>,
}

impl ChainExpression {
    /// Parse `name [opt...] ( | name [opt...] )*`.
    ///
    /// Options are whitespace-separated `key=value` or `flag` tokens.
    pub fn parse(expr: &str) -> Result<Self, CallError> {
        let mut hops = Vec::new();
        for (i, segment) in expr.split('|').enumerate() {
            let mut tokens = segment.split_whitespace();
            let Some(identifier) = tokens.next() else {
                return Err(CallError::Malformed(format!("hop {i} of {expr:?} is empty")));
            };
            hops.push(Hop::new(identifier, CallOptions::parse(tokens)));
        }
        Ok(Self { hops })
    }

    /// Pair identifiers with their option sets; the counts must match.
    pub fn from_parts(chain: Vec<String>, options: Vec<CallOptions>) -> Result<Self, CallError> {
        let header = CallHeader::new(chain, options);
        header.validate()?;
        Ok(Self::from_header(header))
    }

    fn from_header(header: CallHeader) -> Self {
        let hops = header
            .chain
            .into_iter()
            .zip(header.options)
            .map(|(identifier, options)| Hop::new(identifier, options))
            .collect();
        Self { hops }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Wire header carrying this expression.
    pub fn to_header(&self) -> CallHeader {
        let (chain, options) = self
            .hops
            .iter()
            .map(|h| (h.identifier.clone(), h.options.clone()))
            .unzip();
        CallHeader::new(chain, options)
    }
}

impl TryFrom<&CallHeader> for ChainExpression {
    type Error = CallError;

    fn try_from(header: &CallHeader) -> Result<Self, Self::Error> {
        header.validate()?;
        Ok(Self::from_header(header.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Duplex stream transport to a function runner.
    Remote,
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("grpc"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// A hop resolved to a concrete endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub options: CallOptions,
}

impl HostConfig {
    /// `host:port`, the name used in logs and metrics.
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.host, self.port)
    }

    /// Key identifying the endpoint across calls.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.transport, self.endpoint())
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Maps a bare function identifier to its host and default port.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, function_id: &str) -> Result<(String, u16), CallError>;
}

/// Functions are reachable under their own name (container DNS).
#[derive(Debug, Clone, Copy)]
pub struct NameResolver {
    default_port: u16,
}

impl NameResolver {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_PORT)
    }
}

impl EndpointResolver for NameResolver {
    fn resolve(&self, function_id: &str) -> Result<(String, u16), CallError> {
        Ok((function_id.to_string(), self.default_port))
    }
}

/// Resolve every hop of `expr`, failing on the first bad identifier.
pub fn resolve_chain(
    expr: &ChainExpression,
    resolver: &dyn EndpointResolver,
) -> Result<Vec<HostConfig>, CallError> {
    if expr.is_empty() {
        return Err(CallError::EmptyChain);
    }
    expr.hops().iter().map(|hop| resolve_hop(hop, resolver)).collect()
}

pub fn resolve_hop(hop: &Hop, resolver: &dyn EndpointResolver) -> Result<HostConfig, CallError> {
    let id = hop.identifier.trim();
    let (transport, host, port) = match id.split_once("://") {
        None => {
            let (name, port) = split_authority(id)?;
            let (host, default_port) = resolver.resolve(name)?;
            (Transport::Remote, host, port.unwrap_or(default_port))
        }
        Some((scheme, rest)) => {
            let transport = match scheme.to_ascii_lowercase().as_str() {
                "grpc" => Transport::Remote,
                "http" => Transport::Http,
                other => {
                    return Err(CallError::Config(format!(
                        "no such transport {other:?} in {id:?}"
                    )));
                }
            };
            let authority = rest.split(['/', '?']).next().unwrap_or_default();
            let (host, port) = split_authority(authority)?;
            let default_port = match transport {
                Transport::Remote => resolver.resolve(host)?.1,
                Transport::Http => DEFAULT_HTTP_PORT,
            };
            (transport, host.to_string(), port.unwrap_or(default_port))
        }
    };
    if host.is_empty() {
        return Err(CallError::Malformed(format!("identifier {id:?} has no host")));
    }
    Ok(HostConfig {
        transport,
        host,
        port,
        options: hop.options.clone(),
    })
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn split_authority(authority: &str) -> Result<(&str, Option<u16>), CallError> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(CallError::Malformed(format!("unterminated IPv6 host in {authority:?}")));
        };
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(CallError::Malformed(format!("unexpected {after:?} after host"))),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = port
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| CallError::Malformed(format!("invalid port {p:?} in {authority:?}")))
        })
        .transpose()?;
    Ok((host, port))
}

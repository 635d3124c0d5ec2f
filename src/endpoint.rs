//! Endpoint text handling for foreign and external logical names.

use std::fmt;
use std::str::FromStr;

/// Errors produced when endpoint text cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint text was empty after trimming.
    #[error("empty endpoint")]
    Empty,
    /// The text after the final `:` is not a valid port number.
    #[error("invalid port in endpoint ({0})")]
    BadPort(String),
    /// The host part contains characters outside the host alphabet.
    #[error("invalid host in endpoint ({0})")]
    BadHost(String),
}

/// A `host[:port]` endpoint as it appears inside foreign and external
/// logical names.
///
/// The canonical URL text ([`Endpoint::url`]) is what gets embedded in a
/// canonical logical name: the lowercased host, followed by `:port` when a
/// port is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
}

fn valid_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
}

impl Endpoint {
    /// Builds an endpoint from an already-split host and optional port.
    pub fn new(host: &str, port: Option<u16>) -> Result<Self, EndpointError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(EndpointError::Empty);
        }
        if !host.chars().all(valid_host_char) {
            return Err(EndpointError::BadHost(host.to_string()));
        }
        Ok(Self { host: host.to_ascii_lowercase(), port })
    }

    /// Host name or address text, lowercased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, when one was given.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Canonical URL text embedded in canonical logical names.
    pub fn url(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port =
                    port.parse::<u16>().map_err(|_| EndpointError::BadPort(s.to_string()))?;
                Self::new(host, Some(port))
            }
            None => Self::new(s, None),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

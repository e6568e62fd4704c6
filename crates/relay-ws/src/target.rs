//! Connection targets parsed from `protocol://host[:port]/path[?query]`.

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::Error;

/// Where a connection goes and how: scheme security, host, port and the
/// request target sent in the upgrade request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    secure: bool,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl Target {
    /// Parse a `ws`, `wss`, `http` or `https` URL.
    pub fn parse(input: &str) -> Result<Target, Error> {
        let url = Url::parse(input)?;
        let secure = match url.scheme() {
            "wss" | "https" => true,
            "ws" | "http" => false,
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };

        // IPv6 literals are stored without brackets so they resolve directly.
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::MissingHost),
        };
        if host.is_empty() {
            return Err(Error::MissingHost);
        }

        let port = url.port().unwrap_or_else(|| default_port(secure));
        let path = match url.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };

        Ok(Target {
            secure,
            host,
            port,
            path,
            query: url.query().map(str::to_string),
        })
    }

    /// True for `wss` and `https`.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus query, as written in the request line.
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Value of the `Host` header. The port is only included when it is not
    /// the scheme's default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port(self.secure) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

fn default_port(secure: bool) -> u16 {
    if secure {
        443
    } else {
        80
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(
            f,
            "{}://{}{}",
            scheme,
            self.host_header(),
            self.request_target()
        )
    }
}

//! Connection URI parser and builder
//!
//! Parses the compact `scheme://credential@host:port?params#remarks` form
//! used by server lists, independent of any platform URI type.
//!
//! ```text
//! vless://3f1c...@de1.example.net:443?type=ws&security=tls&path=%2Fws#Frankfurt+1
//! └─┬─┘   └──┬──┘ └──────┬──────┘ └┬┘ └─────────────┬────────────┘ └────┬────┘
//! scheme credential     host    port           params               remarks
//! ```
//!
//! Query values and remarks are form-decoded (`+` is a space). The credential
//! is kept verbatim. Repeated query keys keep their first value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded;

/// Remarks used when a URI carries no fragment
pub const DEFAULT_REMARKS: &str = "VLESS Config";

/// URI parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("URI is empty")]
    Empty,

    #[error("Missing scheme separator")]
    MissingScheme,

    #[error("Missing credential (user info)")]
    MissingCredential,

    #[error("Missing host")]
    MissingHost,

    #[error("Missing port")]
    MissingPort,

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Parsed connection URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    /// Lower-cased scheme
    pub scheme: String,
    /// User-info segment (the proxy credential)
    pub credential: String,
    /// Host without IPv6 brackets
    pub host: String,
    /// Server port, always positive
    pub port: u16,
    /// Decoded query parameters, sorted by key
    pub params: BTreeMap<String, String>,
    /// Decoded fragment
    pub remarks: Option<String>,
}

impl ConnectionUri {
    /// Parse a connection URI
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UriError::Empty);
        }

        let (scheme, rest) = input.split_once("://").ok_or(UriError::MissingScheme)?;
        if scheme.is_empty() {
            return Err(UriError::MissingScheme);
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((head, frag)) => (head, Some(frag)),
            None => (rest, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((head, q)) => (head, Some(q)),
            None => (rest, None),
        };

        // Anything after the authority is a path we do not use
        let authority = rest.split('/').next().unwrap_or_default();

        let (credential, host_port) = authority
            .rsplit_once('@')
            .ok_or(UriError::MissingCredential)?;
        if credential.is_empty() {
            return Err(UriError::MissingCredential);
        }

        let (host, port) = split_host_port(host_port)?;

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            credential: credential.to_string(),
            host,
            port,
            params,
            remarks: fragment.map(decode_component),
        })
    }

    /// Query parameter by key
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Query parameter with a fallback
    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).unwrap_or(default)
    }

    /// Display name from the fragment, or the default remarks
    pub fn display_name(&self) -> &str {
        self.remarks.as_deref().unwrap_or(DEFAULT_REMARKS)
    }

    /// Build the canonical URI string
    ///
    /// Parameters are emitted in key order, so equal URIs always
    /// serialize identically.
    pub fn to_uri(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let mut out = format!("{}://{}@{}:{}", self.scheme, self.credential, host, self.port);

        if !self.params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            out.push('?');
            out.push_str(&query);
        }

        if let Some(ref remarks) = self.remarks {
            out.push('#');
            out.extend(form_urlencoded::byte_serialize(remarks.as_bytes()));
        }

        out
    }
}

impl FromStr for ConnectionUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

/// Split `host:port`, `[v6]:port` or a bare host
fn split_host_port(host_port: &str) -> Result<(String, u16), UriError> {
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or(UriError::MissingHost)?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p),
            None if after.is_empty() => None,
            None => return Err(UriError::InvalidPort(after.to_string())),
        };
        (host, port)
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };

    if host.is_empty() {
        return Err(UriError::MissingHost);
    }

    let port = match port {
        None | Some("") => return Err(UriError::MissingPort),
        Some(p) => p,
    };

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(UriError::InvalidPort(port.to_string())),
        Ok(n) => Ok((host.to_string(), n)),
    }
}

/// Form-decode a single component (no `&`/`=` splitting)
fn decode_component(raw: &str) -> String {
    let escaped = raw.replace('&', "%26").replace('=', "%3D");
    form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

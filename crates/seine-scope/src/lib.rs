//! Scope-cookie parsing for Seine searches.
//!
//! A scope cookie is a signed, time-limited authorization token naming the
//! servers a client may search. Cookies arrive as a concatenation of PEM-like
//! blocks; each block base64-encodes a `Key: value` header section followed by
//! a blank line and an opaque scope-data body. The client treats the cookie
//! contents as opaque beyond the header: the full block is replayed verbatim
//! to each server at connection setup, and the server enforces the signature
//! and expiry.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

pub const BEGIN_COOKIE: &str = "-----BEGIN OPENDIAMOND SCOPECOOKIE-----";
pub const END_COOKIE: &str = "-----END OPENDIAMOND SCOPECOOKIE-----";

/// The one cookie revision this client understands.
pub const COOKIE_VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, ScopeError>;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("malformed scope cookie: {0}")]
    BadCookie(String),
    #[error("unsupported scope cookie version {0}")]
    UnsupportedVersion(u32),
    #[error("scope cookie body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// One parsed authorization record. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCookie {
    version: u32,
    serial: String,
    expires: String,
    servers: Vec<String>,
    data: String,
    raw: String,
}

impl ScopeCookie {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// UUID-shaped serial from the cookie header.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Expiry timestamp, kept verbatim. Expiry is enforced by the server
    /// (status `COOKIE_EXPIRED`), not client-side.
    pub fn expires(&self) -> &str {
        &self.expires
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Opaque scope-data body (everything after the header's blank line).
    pub fn data(&self) -> &str {
        &self.data
    }

    /// The complete original block, delimiters included. This is the payload
    /// replayed to servers at connection setup.
    pub fn encoded(&self) -> &str {
        &self.raw
    }

    /// Parse every cookie block out of a concatenated textual blob.
    pub fn parse_all(blob: &str) -> Result<Vec<ScopeCookie>> {
        let mut cookies = Vec::new();
        let mut rest = blob;
        loop {
            let Some(begin) = rest.find(BEGIN_COOKIE) else {
                break;
            };
            let after_begin = &rest[begin + BEGIN_COOKIE.len()..];
            let end = after_begin.find(END_COOKIE).ok_or_else(|| {
                ScopeError::BadCookie("BEGIN delimiter without matching END".to_string())
            })?;

            let body64 = &after_begin[..end];
            let raw = format!("{BEGIN_COOKIE}{body64}{END_COOKIE}\n");
            cookies.push(Self::parse_block(body64, raw)?);

            rest = &after_begin[end + END_COOKIE.len()..];
        }
        if cookies.is_empty() {
            return Err(ScopeError::BadCookie(
                "no scope cookie blocks found".to_string(),
            ));
        }
        Ok(cookies)
    }

    fn parse_block(body64: &str, raw: String) -> Result<ScopeCookie> {
        let stripped: String = body64.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = BASE64.decode(stripped.as_bytes())?;
        let text = String::from_utf8(decoded)
            .map_err(|_| ScopeError::BadCookie("cookie body is not UTF-8".to_string()))?;

        // Header is `Key: value` lines up to the first blank line; the rest is
        // the opaque scope-data body. Cookie generators emit either LF or
        // CRLF line endings.
        let (header, data) = match text
            .split_once("\n\n")
            .or_else(|| text.split_once("\r\n\r\n"))
        {
            Some((header, data)) => (header, data),
            None => (text.as_str(), ""),
        };

        let mut version = None;
        let mut serial = None;
        let mut expires = None;
        let mut servers: Option<Vec<String>> = None;

        for line in header.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                ScopeError::BadCookie(format!("header line without ':': {line:?}"))
            })?;
            let value = value.trim();
            let slot: &mut Option<_> = match key {
                "Version" => {
                    let parsed = value.parse::<u32>().map_err(|_| {
                        ScopeError::BadCookie(format!("bad Version value {value:?}"))
                    })?;
                    if version.replace(parsed).is_some() {
                        return Err(ScopeError::BadCookie("duplicate Version header".to_string()));
                    }
                    continue;
                }
                "Serial" => &mut serial,
                "Expires" => &mut expires,
                "Servers" => {
                    let list: Vec<String> = value
                        .split([';', ','])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    if servers.replace(list).is_some() {
                        return Err(ScopeError::BadCookie("duplicate Servers header".to_string()));
                    }
                    continue;
                }
                // Unknown headers (e.g. the signature block) are preserved in
                // `raw` but not interpreted.
                _ => continue,
            };
            if slot.replace(value.to_string()).is_some() {
                return Err(ScopeError::BadCookie(format!("duplicate {key} header")));
            }
        }

        let version =
            version.ok_or_else(|| ScopeError::BadCookie("missing Version header".to_string()))?;
        if version != COOKIE_VERSION {
            return Err(ScopeError::UnsupportedVersion(version));
        }
        let serial =
            serial.ok_or_else(|| ScopeError::BadCookie("missing Serial header".to_string()))?;
        let expires =
            expires.ok_or_else(|| ScopeError::BadCookie("missing Expires header".to_string()))?;
        let servers =
            servers.ok_or_else(|| ScopeError::BadCookie("missing Servers header".to_string()))?;
        if servers.is_empty() {
            return Err(ScopeError::BadCookie("empty Servers header".to_string()));
        }

        Ok(ScopeCookie {
            version,
            serial,
            expires,
            servers,
            data: data.to_string(),
            raw,
        })
    }
}

/// Hostname → ordered cookies authorizing that host. Built once per search;
/// immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieMap {
    by_host: BTreeMap<String, Vec<ScopeCookie>>,
}

impl CookieMap {
    /// Parse a concatenated cookie blob. The host set is the union of every
    /// block's `Servers` list; a host named by several cookies keeps them all,
    /// in input order.
    pub fn from_blob(blob: &str) -> Result<Self> {
        Ok(Self::from_cookies(ScopeCookie::parse_all(blob)?))
    }

    pub fn from_cookies(cookies: Vec<ScopeCookie>) -> Self {
        let mut by_host: BTreeMap<String, Vec<ScopeCookie>> = BTreeMap::new();
        for cookie in cookies {
            for host in cookie.servers() {
                by_host.entry(host.clone()).or_default().push(cookie.clone());
            }
        }
        Self { by_host }
    }

    /// Route every cookie through one proxy host, regardless of the hosts the
    /// cookies themselves name.
    pub fn proxied(&self, proxy_host: &str) -> Self {
        let mut all: Vec<ScopeCookie> = Vec::new();
        for cookies in self.by_host.values() {
            for cookie in cookies {
                if !all.contains(cookie) {
                    all.push(cookie.clone());
                }
            }
        }
        let mut by_host = BTreeMap::new();
        by_host.insert(proxy_host.to_string(), all);
        Self { by_host }
    }

    /// Hosts in deterministic (sorted) order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.by_host.keys().map(String::as_str)
    }

    pub fn cookies_for(&self, host: &str) -> &[ScopeCookie] {
        self.by_host.get(host).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

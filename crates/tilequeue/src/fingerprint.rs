use core::fmt;
use http::HeaderMap;
use http::header::{COOKIE, USER_AGENT};
use std::net::SocketAddr;
use std::sync::Arc;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const MISSING: &str = "-";

/// String identifying one client.
///
/// Built from the forwarded address (or the peer address when the request did
/// not come through another proxy), the user-agent and the cookie header.
/// Two browsers behind the same NAT therefore get separate budgets as long as
/// they differ in either of the last two.
///
/// Cloning is cheap; the dispatcher clones the fingerprint into every command
/// it sends to the scheduler.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Builds a fingerprint from its raw parts.
    ///
    /// `forwarded_for` wins over `remote_addr`; any missing part renders as
    /// `-`.
    pub fn from_parts(
        forwarded_for: Option<&str>,
        remote_addr: Option<SocketAddr>,
        user_agent: Option<&str>,
        cookie: Option<&str>,
    ) -> Self {
        let remote = remote_addr.map(|addr| addr.ip().to_string());
        let addr = forwarded_for
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or(remote.as_deref())
            .unwrap_or(MISSING);
        let user_agent = user_agent.unwrap_or(MISSING);
        let cookie = cookie.unwrap_or(MISSING);
        Self(format!("{addr}-{user_agent}-{cookie}").into())
    }

    /// Builds a fingerprint from request headers and the peer address.
    ///
    /// Header values that are not valid visible ASCII are treated as missing.
    pub fn from_headers(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        Self::from_parts(
            headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()),
            remote_addr,
            headers.get(USER_AGENT).and_then(|v| v.to_str().ok()),
            headers.get(COOKIE).and_then(|v| v.to_str().ok()),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fingerprint").field(&&*self.0).finish()
    }
}

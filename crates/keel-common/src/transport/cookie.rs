//! Session credential cookies.

/// Name of the cookie carrying the session token.
pub const TOKEN_COOKIE: &str = "token";

const EXPIRES_NEVER: &str = "Fri, 01 Jan 2100 00:00:00 GMT";
const EXPIRES_PAST: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Parses a `Cookie` header into `(name, value)` pairs.
pub fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Extracts the session token from a `Cookie` header.
pub fn token_from_header(header: &str) -> Option<String> {
    parse_cookies(header)
        .into_iter()
        .find(|(name, value)| name == TOKEN_COOKIE && !value.is_empty() && value != "deleted")
        .map(|(_, value)| value)
}

/// Host without the port, as used for the cookie `Domain`.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

/// `Set-Cookie` value issuing `token`.
pub fn session_cookie(token: &str, host: &str) -> String {
    format!(
        "{}={}; Expires={}; Path=/; Domain={}; HttpOnly",
        TOKEN_COOKIE,
        token,
        EXPIRES_NEVER,
        host_without_port(host)
    )
}

/// `Set-Cookie` value revoking the session cookie.
pub fn delete_cookie(host: &str) -> String {
    format!(
        "{}=deleted; Expires={}; Path=/; Domain={}",
        TOKEN_COOKIE,
        EXPIRES_PAST,
        host_without_port(host)
    )
}

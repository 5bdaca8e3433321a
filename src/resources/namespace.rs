//! Virtual-URI namespace derivation.
//!
//! A tab's namespace is derived from the host (and explicit port) of its
//! URL, so every tab on `http://localhost:3000` shares
//! `browser://tab-localhost-3000/`.

// ============================================================================
// Imports
// ============================================================================

use url::Url;

// ============================================================================
// Constants
// ============================================================================

/// URI scheme of virtual resources.
pub const RESOURCE_SCHEME: &str = "browser";

/// Prefix of every namespace.
const NAMESPACE_PREFIX: &str = "tab-";

/// Separator replacing every run of non-alphanumeric characters.
const DELIMITER: char = '-';

/// Namespace key for URLs without a host (`about:blank`, `file://`).
const LOCAL_KEY: &str = "local";

/// Namespace key for input that does not parse as a URL.
const UNKNOWN_KEY: &str = "unknown";

// ============================================================================
// Functions
// ============================================================================

/// Derives the namespace (`tab-<host>[-<port>]`) for `url`.
///
/// ```ignore
/// assert_eq!(namespace_for("http://localhost:3000/app"), "tab-localhost-3000");
/// assert_eq!(namespace_for("https://my.site.dev"), "tab-my-site-dev");
/// ```
#[must_use]
pub fn namespace_for(url: &str) -> String {
    let key = match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{host}{DELIMITER}{port}"),
                None => host.to_string(),
            },
            None => LOCAL_KEY.to_string(),
        },
        Err(_) => UNKNOWN_KEY.to_string(),
    };

    let normalized = normalize(&key);
    if normalized.is_empty() {
        format!("{NAMESPACE_PREFIX}{UNKNOWN_KEY}")
    } else {
        format!("{NAMESPACE_PREFIX}{normalized}")
    }
}

/// Returns the namespace root URI for `url`, with a trailing slash.
#[must_use]
pub fn base_uri(url: &str) -> String {
    base_uri_for_namespace(&namespace_for(url))
}

/// Returns the namespace root URI for an already derived namespace.
#[inline]
#[must_use]
pub fn base_uri_for_namespace(namespace: &str) -> String {
    format!("{RESOURCE_SCHEME}://{namespace}/")
}

/// Lowercases and collapses separator runs into a single delimiter.
fn normalize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut pending_delimiter = false;

    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_delimiter && !out.is_empty() {
                out.push(DELIMITER);
            }
            pending_delimiter = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_delimiter = true;
        }
    }

    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_port() {
        assert_eq!(namespace_for("http://localhost:3000"), "tab-localhost-3000");
        assert_eq!(base_uri("http://localhost:3000"), "browser://tab-localhost-3000/");
    }

    #[test]
    fn test_default_port_omitted() {
        assert_eq!(namespace_for("https://example.com/path?q=1"), "tab-example-com");
        assert_eq!(namespace_for("http://example.com:80/"), "tab-example-com");
    }

    #[test]
    fn test_separator_runs_collapse() {
        assert_eq!(namespace_for("http://my--app.local.dev:8080"), "tab-my-app-local-dev-8080");
        assert_eq!(namespace_for("http://127.0.0.1:5173"), "tab-127-0-0-1-5173");
        assert_eq!(namespace_for("http://[::1]:4000"), "tab-1-4000");
    }

    #[test]
    fn test_stable_across_paths() {
        assert_eq!(
            namespace_for("http://localhost:3000/a"),
            namespace_for("http://localhost:3000/b#x")
        );
    }

    #[test]
    fn test_hostless_and_invalid() {
        assert_eq!(namespace_for("about:blank"), "tab-local");
        assert_eq!(namespace_for("not a url"), "tab-unknown");
        assert_eq!(namespace_for(""), "tab-unknown");
    }
}

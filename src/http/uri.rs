//! Richer URI model for collaborators that manipulate URIs (redirects, auth
//! realms, relative-path computation) rather than just reading the request line.
//!
//! [`crate::Url`] remains the zero-copy view over the request-line target; this
//! module is the owned, structured counterpart used when a URI needs to be
//! taken apart, completed with defaults, joined, or made relative to another.

use crate::errors::ErrorKind;

/// A parsed, structured URI: scheme, host, port, path, extension, reference
/// (fragment), and query, plus the `secure`/`web_sockets` flags derived from
/// the scheme.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Uri {
    scheme: Option<String>,
    host: Option<String>,
    port: u16,
    path: String,
    ext: Option<String>,
    reference: Option<String>,
    query: Option<String>,
    secure: bool,
    web_sockets: bool,
}

impl Uri {
    /// Parses a URI string into its components.
    ///
    /// Accepts both absolute URIs (`http://host:port/path?query#ref`) and
    /// path-only references (`/path?query#ref`). Ported from the scheme/
    /// host/port/path/reference/query splitting grammar of `httpCreateUri`.
    pub fn parse(src: &str) -> Result<Self, ErrorKind> {
        if src.is_empty() {
            return Err(ErrorKind::InvalidUrl);
        }

        let mut rest = src;
        let (mut scheme, mut host, mut port, mut secure, mut web_sockets) =
            (None, None, 0u16, false, false);

        if let Some(i) = rest.find("://") {
            let scheme_str = &rest[..i];
            let (s, ws) = match scheme_str {
                "https" => (true, false),
                "wss" => (true, true),
                "http" => (false, false),
                "ws" => (false, true),
                _ => return Err(ErrorKind::InvalidUrl),
            };
            secure = s;
            web_sockets = ws;
            scheme = Some(scheme_str.to_owned());
            rest = &rest[i + 3..];

            let authority_end = rest.find('/').unwrap_or(rest.len());
            let authority = &rest[..authority_end];
            rest = &rest[authority_end..];

            if authority.is_empty() {
                return Err(ErrorKind::InvalidUrl);
            }

            if let Some(bracket_end) = authority.strip_prefix('[').and_then(|s| s.find(']')) {
                host = Some(authority[1..=bracket_end].to_owned());
                let after = &authority[bracket_end + 2..];
                if let Some(p) = after.strip_prefix(':') {
                    port = p.parse().map_err(|_| ErrorKind::InvalidUrl)?;
                }
            } else if let Some((h, p)) = authority.split_once(':') {
                host = Some(h.to_owned());
                port = p.parse().map_err(|_| ErrorKind::InvalidUrl)?;
            } else {
                host = Some(authority.to_owned());
            }
        }

        if rest.is_empty() {
            rest = "/";
        }

        let (path_and_query, reference) = match rest.find('#') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_owned())),
            None => (rest, None),
        };
        let (path, query) = match path_and_query.find('?') {
            Some(i) => (
                &path_and_query[..i],
                Some(path_and_query[i + 1..].to_owned()),
            ),
            None => (path_and_query, None),
        };

        let ext = last_path_segment(path)
            .and_then(|seg| seg.rfind('.').map(|i| seg[i + 1..].to_owned()))
            .filter(|e| !e.is_empty());

        Ok(Self {
            scheme,
            host,
            port,
            path: path.to_owned(),
            ext,
            reference,
            query,
            secure,
            web_sockets,
        })
    }

    /// Fills in missing scheme/host/port with the supplied defaults, mirroring
    /// `HTTP_COMPLETE_URI`: `path` defaults to `/`, `scheme` to `http`, `host`
    /// to `localhost`, `port` to the scheme's default port.
    pub fn complete(mut self, default_host: &str) -> Self {
        if self.path.is_empty() {
            self.path = "/".to_owned();
        }
        if self.scheme.is_none() {
            self.scheme = Some("http".to_owned());
        }
        if self.host.is_none() {
            self.host = Some(default_host.to_owned());
        }
        if self.port == 0 {
            self.port = default_port(self.scheme.as_deref(), self.secure);
        }
        self
    }

    /// Collapses `//`, resolves `.`/`..` segments, and clamps `..` at the
    /// root, exactly as `httpNormalizeUriPath` does. Leaves a leading `/`
    /// in place iff the input path was absolute.
    pub fn normalize_path(path: &str) -> String {
        let absolute = path.starts_with('/');
        let mut segments: Vec<&str> = Vec::new();

        for seg in path.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            if seg == ".." {
                if segments.is_empty() {
                    continue;
                }
                segments.pop();
                continue;
            }
            segments.push(seg);
        }

        let joined = segments.join("/");
        if absolute {
            format!("/{joined}")
        } else if joined.is_empty() {
            ".".to_owned()
        } else {
            joined
        }
    }

    /// Joins `other` onto this URI's path. If `other` starts with `/` it
    /// replaces the path outright; otherwise it's appended after a `/`
    /// separator (unless the current path already ends with one), per
    /// `httpJoinUriPath`.
    pub fn join(&self, other: &str) -> String {
        if other.starts_with('/') {
            return Self::normalize_path(other);
        }
        let mut joined = self.path.clone();
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(other);
        Self::normalize_path(&joined)
    }

    /// Resolves `other` against this URI, carrying scheme/host/port forward
    /// when `other` doesn't set them, and joining paths relative to this
    /// URI's directory (trimming the last path segment first), per
    /// `httpResolveUri`.
    pub fn resolve(&self, other: &Uri) -> Uri {
        let path = if other.path.starts_with('/') {
            Self::normalize_path(&other.path)
        } else {
            let dir = trim_to_dirname(&self.path);
            let mut joined = dir.to_owned();
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined.push_str(&other.path);
            Self::normalize_path(&joined)
        };

        Uri {
            scheme: other.scheme.clone().or_else(|| self.scheme.clone()),
            host: other.host.clone().or_else(|| self.host.clone()),
            port: if other.port != 0 { other.port } else { self.port },
            path,
            ext: other.ext.clone(),
            reference: other.reference.clone(),
            query: other.query.clone(),
            secure: if other.scheme.is_some() {
                other.secure
            } else {
                self.secure
            },
            web_sockets: if other.scheme.is_some() {
                other.web_sockets
            } else {
                self.web_sockets
            },
        }
    }

    /// Computes the minimal `../`-prefixed path from `self` (the base) to
    /// `target`, matching `httpGetRelativeUri`'s common-prefix walk.
    pub fn relative(&self, target: &Uri) -> String {
        let base_segments: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        let target_segments: Vec<&str> =
            target.path.split('/').filter(|s| !s.is_empty()).collect();

        let base_dir_segments = base_segments.len().saturating_sub(1);

        let common = base_segments
            .iter()
            .zip(target_segments.iter())
            .take(base_dir_segments)
            .take_while(|(a, b)| a == b)
            .count();

        let up_count = base_dir_segments - common;
        let mut out = "../".repeat(up_count);
        out.push_str(&target_segments[common..].join("/"));
        if out.is_empty() {
            out.push('.');
        }
        out
    }

    /// Reconstructs the URI's string form, wrapping IPv6 hosts in brackets
    /// and eliding the port when it matches the scheme's default, per
    /// `httpFormatUri`.
    pub fn format(&self) -> String {
        let mut out = String::new();

        if let (Some(scheme), Some(host)) = (&self.scheme, &self.host) {
            out.push_str(scheme);
            out.push_str("://");
            if host.contains(':') {
                out.push('[');
                out.push_str(host);
                out.push(']');
            } else {
                out.push_str(host);
            }
            if self.port != 0 && self.port != default_port(self.scheme.as_deref(), self.secure) {
                out.push(':');
                out.push_str(&self.port.to_string());
            }
        }
        out.push_str(&self.path);
        if let Some(q) = &self.query {
            out.push('?');
            out.push_str(q);
        }
        if let Some(r) = &self.reference {
            out.push('#');
            out.push_str(r);
        }
        out
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn ext(&self) -> Option<&str> {
        self.ext.as_deref()
    }
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }
    pub fn is_secure(&self) -> bool {
        self.secure
    }
    pub fn is_web_socket(&self) -> bool {
        self.web_sockets
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

fn default_port(scheme: Option<&str>, secure: bool) -> u16 {
    match scheme {
        Some("https") | Some("wss") => 443,
        Some("http") | Some("ws") => 80,
        _ if secure => 443,
        _ => 80,
    }
}

fn last_path_segment(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

fn trim_to_dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_absolute() {
        let uri = Uri::parse("https://example.com:8443/a/b.txt?x=1#frag").unwrap();
        assert_eq!(uri.scheme(), Some("https"));
        assert_eq!(uri.host(), Some("example.com"));
        assert_eq!(uri.port(), 8443);
        assert_eq!(uri.path(), "/a/b.txt");
        assert_eq!(uri.ext(), Some("txt"));
        assert_eq!(uri.query(), Some("x=1"));
        assert_eq!(uri.reference(), Some("frag"));
        assert!(uri.is_secure());
        assert!(!uri.is_web_socket());
    }

    #[test]
    fn parse_path_only() {
        let uri = Uri::parse("/a/b/c").unwrap();
        assert_eq!(uri.scheme(), None);
        assert_eq!(uri.path(), "/a/b/c");
    }

    #[test]
    fn parse_web_socket_scheme() {
        let uri = Uri::parse("ws://localhost/chat").unwrap();
        assert!(uri.is_web_socket());
        assert!(!uri.is_secure());
    }

    #[test]
    fn complete_fills_defaults() {
        let uri = Uri::parse("/a").unwrap().complete("localhost");
        assert_eq!(uri.scheme(), Some("http"));
        assert_eq!(uri.host(), Some("localhost"));
        assert_eq!(uri.port(), 80);
    }

    #[test]
    fn normalize_path_collapses_dots_and_slashes() {
        assert_eq!(Uri::normalize_path("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(Uri::normalize_path("/../a"), "/a");
        assert_eq!(Uri::normalize_path("a/b/.."), "a");
    }

    #[test]
    fn join_replaces_on_absolute_other() {
        let base = Uri::parse("/a/b").unwrap();
        assert_eq!(base.join("/x/y"), "/x/y");
        assert_eq!(base.join("c"), "/a/b/c");
    }

    #[test]
    fn resolve_carries_scheme_and_trims_dirname() {
        let base = Uri::parse("https://host/a/b/index.html").unwrap();
        let other = Uri::parse("c.html").unwrap();
        let resolved = base.resolve(&other);
        assert_eq!(resolved.scheme(), Some("https"));
        assert_eq!(resolved.host(), Some("host"));
        assert_eq!(resolved.path(), "/a/b/c.html");
    }

    #[test]
    fn relative_computes_minimal_prefix() {
        let base = Uri::parse("/a/b/c/page.html").unwrap();
        let target = Uri::parse("/a/b/other/target.html").unwrap();
        assert_eq!(base.relative(&target), "../other/target.html");
    }

    #[test]
    fn relative_same_dir_has_no_prefix() {
        let base = Uri::parse("/a/b/page.html").unwrap();
        let target = Uri::parse("/a/b/target.html").unwrap();
        assert_eq!(base.relative(&target), "target.html");
    }

    #[test]
    fn format_elides_default_port() {
        let uri = Uri::parse("http://host:80/a").unwrap();
        assert_eq!(uri.format(), "http://host/a");
    }

    #[test]
    fn format_wraps_ipv6_host() {
        let uri = Uri::parse("http://[::1]:8080/a").unwrap();
        assert_eq!(uri.format(), "http://[::1]:8080/a");
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(Uri::parse(""), Err(ErrorKind::InvalidUrl));
    }
}

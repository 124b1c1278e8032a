//! HTTP Basic and Digest authentication (RFC 2617).
//!
//! Ported from `auth.c`/`authFilter.c`'s per-route auth config plus its
//! decode/verify pipeline: `decodeDigestDetails` (quoted key=value parsing
//! with backslash-unescaping), `createDigestNonce`/`parseDigestNonce`
//! (`secret:etag:realm:hexTime`, opaque base64), and `calcDigest`
//! (HA1/HA2/response, qop-dependent combination). `pam` is intentionally not
//! implemented as a store — only `internal` (an in-memory `Users`/`Roles`
//! map) is shipped; session storage is left to a caller-supplied
//! [`SessionStore`].

use crate::limits::AuthLimits;
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Qop::Auth),
            "auth-int" => Some(Qop::AuthInt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// HA1 (`MD5(user:realm:pass)`), stored instead of the plaintext
    /// password, matching the source's support for pre-hashed passwords.
    pub ha1: String,
    pub roles: HashSet<String>,
}

/// Pluggable credential backend. `internal` is the only store this crate
/// ships; a PAM-backed store is out of scope.
pub trait AuthStore: Sync + Send + 'static {
    fn find(&self, username: &str) -> Option<&User>;
}

#[derive(Debug, Default)]
pub struct InternalStore {
    users: HashMap<String, User>,
}

impl InternalStore {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    pub fn add_user(&mut self, name: &str, ha1: &str, roles: &[&str]) {
        self.users.insert(
            name.to_string(),
            User {
                name: name.to_string(),
                ha1: ha1.to_string(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
            },
        );
    }
}

impl AuthStore for InternalStore {
    fn find(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }
}

/// A bumpable session-invalidation token. Incrementing `version` on an
/// `Auth` invalidates every session authenticated under an older version,
/// exactly as `httpAuthenticate` treats `HTTP_SESSION_AUTHVER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct AuthVersion(pub u64);

/// Per-route authentication configuration.
pub struct Auth<S: AuthStore> {
    pub scheme: AuthScheme,
    pub realm: String,
    pub qop: Qop,
    pub version: AuthVersion,
    pub store: S,
    limits: AuthLimits,
}

/// Cached per-connection session: username plus the `AuthVersion` it was
/// authenticated under. Storage for this value is supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub authver: AuthVersion,
}

/// Caller-supplied session cache. No concrete backend ships with this
/// crate; an in-memory `HashMap` or an external cache are equally valid.
pub trait SessionStore: Sync + Send + 'static {
    fn get(&self, key: &str) -> Option<Session>;
    fn set(&self, key: &str, session: Session);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader,
    MalformedHeader,
    UnknownUser,
    WrongScheme,
    NonceMismatch,
    NonceStale,
    QopMismatch,
    BadResponse,
}

impl<S: AuthStore> Auth<S> {
    pub fn new(scheme: AuthScheme, realm: impl Into<String>, qop: Qop, store: S) -> Self {
        Self {
            scheme,
            realm: realm.into(),
            qop,
            version: AuthVersion::default(),
            store,
            limits: AuthLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: AuthLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Checks a cached session against `self.version`, returning `None` if
    /// it was authenticated under a now-superseded version.
    pub fn validate_session(&self, session: &Session) -> Option<&User> {
        if session.authver != self.version {
            return None;
        }
        self.store.find(&session.username)
    }

    /// Builds the `WWW-Authenticate` challenge header value for a 401
    /// response, mirroring `formatAuthResponse`'s Basic/Digest branches.
    pub fn challenge(&self, secret: &str, etag: &str) -> String {
        match self.scheme {
            AuthScheme::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthScheme::Digest => {
                let nonce = create_digest_nonce(secret, etag, &self.realm);
                let opaque = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    etag.as_bytes(),
                );
                format!(
                    "Digest realm=\"{}\", qop=\"{}\", nonce=\"{}\", opaque=\"{}\", algorithm=\"MD5\", stale=\"FALSE\"",
                    self.realm,
                    self.qop.as_str(),
                    nonce,
                    opaque,
                )
            }
        }
    }

    /// Verifies an `Authorization` header value against a request method and
    /// URI, returning the authenticated user.
    pub fn authenticate(
        &self,
        header: &str,
        method: &str,
        uri: &str,
        secret: &str,
        etag: &str,
    ) -> Result<&User, AuthError> {
        match self.scheme {
            AuthScheme::Basic => self.authenticate_basic(header),
            AuthScheme::Digest => self.authenticate_digest(header, method, uri, secret, etag),
        }
    }

    fn authenticate_basic(&self, header: &str) -> Result<&User, AuthError> {
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or(AuthError::WrongScheme)?;
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|_| AuthError::MalformedHeader)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedHeader)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(AuthError::MalformedHeader)?;

        let user = self.store.find(username).ok_or(AuthError::UnknownUser)?;
        let expected_ha1 = ha1(username, &self.realm, password);
        if constant_time_eq(&expected_ha1, &user.ha1) {
            Ok(user)
        } else {
            Err(AuthError::BadResponse)
        }
    }

    fn authenticate_digest(
        &self,
        header: &str,
        method: &str,
        uri: &str,
        secret: &str,
        etag: &str,
    ) -> Result<&User, AuthError> {
        if header.len() > self.limits.max_header_size {
            return Err(AuthError::MalformedHeader);
        }
        let details = decode_digest_details(header)?;

        let qop = details
            .qop
            .as_deref()
            .map(Qop::parse)
            .unwrap_or(Some(self.qop));
        if qop != Some(self.qop) {
            return Err(AuthError::QopMismatch);
        }
        if self.qop != Qop::Auth || details.qop.is_some() {
            if details.cnonce.is_none() || details.nc.is_none() {
                return Err(AuthError::MalformedHeader);
            }
        }

        let (nonce_secret, nonce_etag, nonce_realm, when) = parse_digest_nonce(&details.nonce)
            .ok_or(AuthError::MalformedHeader)?;
        if nonce_secret != secret || nonce_etag != etag || nonce_realm != self.realm {
            return Err(AuthError::NonceMismatch);
        }
        if is_stale(when, self.limits.nonce_lifetime) {
            return Err(AuthError::NonceStale);
        }

        let user = self
            .store
            .find(&details.username)
            .ok_or(AuthError::UnknownUser)?;

        let expected = calc_digest(
            &user.ha1,
            &self.realm,
            uri,
            &details.nonce,
            self.qop.as_str(),
            details.nc.as_deref().unwrap_or(""),
            details.cnonce.as_deref().unwrap_or(""),
            method,
        );

        if constant_time_eq(&expected, &details.response) {
            Ok(user)
        } else {
            Err(AuthError::BadResponse)
        }
    }
}

struct DigestDetails {
    username: String,
    response: String,
    nonce: String,
    nc: Option<String>,
    cnonce: Option<String>,
    qop: Option<String>,
}

/// Parses the quoted `key="value"` (or bare `key=value`) pairs of a Digest
/// `Authorization` header, with backslash-unescaping inside quoted values.
/// Ported from `decodeDigestDetails`.
fn decode_digest_details(header: &str) -> Result<DigestDetails, AuthError> {
    let rest = header
        .strip_prefix("Digest ")
        .ok_or(AuthError::WrongScheme)?;

    let mut username = None;
    let mut response = None;
    let mut nonce = None;
    let mut nc = None;
    let mut cnonce = None;
    let mut qop = None;

    for pair in split_digest_pairs(rest) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());

        match key {
            "username" => username = Some(value),
            "response" => response = Some(value),
            "nonce" => nonce = Some(value),
            "nc" => nc = Some(value),
            "cnonce" => cnonce = Some(value),
            "qop" => qop = Some(value),
            _ => {}
        }
    }

    Ok(DigestDetails {
        username: username.ok_or(AuthError::MalformedHeader)?,
        response: response.ok_or(AuthError::MalformedHeader)?,
        nonce: nonce.ok_or(AuthError::MalformedHeader)?,
        nc,
        cnonce,
        qop,
    })
}

/// Splits on top-level commas, respecting quoted sections so a comma inside
/// a quoted value (or an escaped quote) doesn't end the field early.
fn split_digest_pairs(input: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let bytes = input.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                fields.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(input[start..].trim());
    fields
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// `secret:etag:realm:hexTime`, matching `createDigestNonce`.
fn create_digest_nonce(secret: &str, etag: &str, realm: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{secret}:{etag}:{realm}:{now:x}")
}

/// Reverses [`create_digest_nonce`], returning `(secret, etag, realm, when)`.
fn parse_digest_nonce(nonce: &str) -> Option<(&str, &str, &str, u64)> {
    let mut parts = nonce.splitn(4, ':');
    let secret = parts.next()?;
    let etag = parts.next()?;
    let realm = parts.next()?;
    let when = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((secret, etag, realm, when))
}

fn is_stale(when: u64, lifetime: Duration) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.saturating_sub(when) > lifetime.as_secs()
}

/// `HA1 = MD5(user:realm:pass)`.
fn ha1(username: &str, realm: &str, password: &str) -> String {
    hex_md5(format!("{username}:{realm}:{password}").as_bytes())
}

/// `HA2 = MD5(method:uri)`; `response = MD5(HA1:nonce:HA2)`, or
/// `MD5(HA1:nonce:nc:cnonce:qop:HA2)` when qop is in play. Ported from
/// `calcDigest`.
fn calc_digest(
    ha1: &str,
    _realm: &str,
    uri: &str,
    nonce: &str,
    qop: &str,
    nc: &str,
    cnonce: &str,
    method: &str,
) -> String {
    let ha2 = hex_md5(format!("{method}:{uri}").as_bytes());

    let combined = if qop == "auth" || qop == "auth-int" {
        format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}")
    } else {
        format!("{ha1}:{nonce}:{ha2}")
    };
    hex_md5(combined.as_bytes())
}

fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_alice() -> InternalStore {
        let mut store = InternalStore::new();
        store.add_user("alice", &ha1("alice", "test-realm", "wonderland"), &["user"]);
        store
    }

    #[test]
    fn basic_auth_accepts_correct_credentials() {
        let auth = Auth::new(AuthScheme::Basic, "test-realm", Qop::Auth, store_with_alice());
        let header = format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:wonderland")
        );

        let user = auth
            .authenticate(&header, "GET", "/", "secret", "etag1")
            .unwrap();
        assert_eq!(user.name, "alice");
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let auth = Auth::new(AuthScheme::Basic, "test-realm", Qop::Auth, store_with_alice());
        let header = format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:wrong")
        );

        assert_eq!(
            auth.authenticate(&header, "GET", "/", "secret", "etag1"),
            Err(AuthError::BadResponse)
        );
    }

    #[test]
    fn digest_round_trip_through_challenge_and_response() {
        let auth = Auth::new(AuthScheme::Digest, "test-realm", Qop::Auth, store_with_alice());
        let secret = "serversecret";
        let etag = "etag1";

        let challenge = auth.challenge(secret, etag);
        let nonce_start = challenge.find("nonce=\"").unwrap() + "nonce=\"".len();
        let nonce_end = challenge[nonce_start..].find('"').unwrap() + nonce_start;
        let nonce = &challenge[nonce_start..nonce_end];

        let user_ha1 = ha1("alice", "test-realm", "wonderland");
        let response = calc_digest(&user_ha1, "test-realm", "/resource", nonce, "auth", "00000001", "abcd1234", "GET");

        let header = format!(
            "Digest username=\"alice\", realm=\"test-realm\", nonce=\"{nonce}\", uri=\"/resource\", \
             qop=auth, nc=00000001, cnonce=\"abcd1234\", response=\"{response}\""
        );

        let user = auth
            .authenticate(&header, "GET", "/resource", secret, etag)
            .unwrap();
        assert_eq!(user.name, "alice");
    }

    #[test]
    fn digest_rejects_nonce_from_a_different_secret() {
        let auth = Auth::new(AuthScheme::Digest, "test-realm", Qop::Auth, store_with_alice());
        let nonce = create_digest_nonce("other-secret", "etag1", "test-realm");
        let user_ha1 = ha1("alice", "test-realm", "wonderland");
        let response = calc_digest(&user_ha1, "test-realm", "/resource", &nonce, "auth", "00000001", "abcd1234", "GET");

        let header = format!(
            "Digest username=\"alice\", realm=\"test-realm\", nonce=\"{nonce}\", uri=\"/resource\", \
             qop=auth, nc=00000001, cnonce=\"abcd1234\", response=\"{response}\""
        );

        assert_eq!(
            auth.authenticate(&header, "GET", "/resource", "serversecret", "etag1"),
            Err(AuthError::NonceMismatch)
        );
    }

    #[test]
    fn digest_rejects_stale_nonce() {
        let auth = Auth::new(AuthScheme::Digest, "test-realm", Qop::Auth, store_with_alice())
            .with_limits(AuthLimits {
                nonce_lifetime: Duration::from_secs(0),
                ..AuthLimits::default()
            });
        let nonce = create_digest_nonce("serversecret", "etag1", "test-realm");
        std::thread::sleep(Duration::from_millis(1100));

        let user_ha1 = ha1("alice", "test-realm", "wonderland");
        let response = calc_digest(&user_ha1, "test-realm", "/resource", &nonce, "auth", "00000001", "abcd1234", "GET");
        let header = format!(
            "Digest username=\"alice\", realm=\"test-realm\", nonce=\"{nonce}\", uri=\"/resource\", \
             qop=auth, nc=00000001, cnonce=\"abcd1234\", response=\"{response}\""
        );

        assert_eq!(
            auth.authenticate(&header, "GET", "/resource", "serversecret", "etag1"),
            Err(AuthError::NonceStale)
        );
    }

    #[test]
    fn session_invalidated_by_version_bump() {
        let mut auth = Auth::new(AuthScheme::Basic, "test-realm", Qop::Auth, store_with_alice());
        let session = Session {
            username: "alice".to_string(),
            authver: auth.version,
        };
        assert!(auth.validate_session(&session).is_some());

        auth.version = AuthVersion(auth.version.0 + 1);
        assert!(auth.validate_session(&session).is_none());
    }

    #[test]
    fn split_digest_pairs_respects_quoted_commas() {
        let fields = split_digest_pairs(r#"a="x,y", b="z""#);
        assert_eq!(fields, vec![r#"a="x,y""#, r#"b="z""#]);
    }
}

//! Bearer credential extraction and identity verification.
//!
//! Credentials may arrive either as an `Authorization: Bearer <token>` header
//! or as a `?token=` query parameter (browsers can't set headers on WebSocket
//! upgrades). When both are present the header wins.
//!
//! Verification is synchronous and happens before any WebSocket upgrade
//! completes, so a rejected client never gets a socket.

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditKind, AuditLog};
use crate::state::AppState;

/// The authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: u64,
    pub username: String,
}

/// Resolves a bearer credential to a principal.
///
/// Called once per upgrade or request; implementations handle their own
/// caching if they need any.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Option<Principal>;
}

/// Single-operator verifier backed by the configured API key.
pub struct ApiKeyVerifier {
    key: String,
    principal: Principal,
}

impl ApiKeyVerifier {
    pub fn new(key: impl Into<String>, principal: Principal) -> Self {
        Self {
            key: key.into(),
            principal,
        }
    }
}

impl IdentityVerifier for ApiKeyVerifier {
    fn verify(&self, credential: &str) -> Option<Principal> {
        constant_time_eq(self.key.as_bytes(), credential.as_bytes()).then(|| self.principal.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Header,
    Query,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Query => "query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull a bearer credential from the request.
///
/// The `Authorization` header takes precedence over `?token=`. A malformed
/// header (not `Bearer ...`) is ignored rather than treated as a credential,
/// so the query parameter can still be used.
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Option<Credential> {
    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = from_header {
        return Some(Credential {
            token: token.to_string(),
            source: CredentialSource::Header,
        });
    }

    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
        .map(|token| Credential {
            token,
            source: CredentialSource::Query,
        })
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No credential supplied (`401`).
    Missing,
    /// Credential supplied but not accepted (`403`).
    Invalid,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Missing => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing bearer credential"})),
            )
                .into_response(),
            Self::Invalid => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "Invalid credential"})),
            )
                .into_response(),
        }
    }
}

/// Extract, verify, and audit a credential for the resource at `target`.
///
/// No retries: a failed attempt is recorded once and returned.
pub async fn authenticate(
    verifier: &dyn IdentityVerifier,
    audit: &AuditLog,
    headers: &HeaderMap,
    uri: &Uri,
    target: &str,
) -> Result<Principal, AuthRejection> {
    let Some(credential) = extract_credential(headers, uri) else {
        audit
            .record(
                AuditKind::AuthFailure,
                format!("{target}: missing credential"),
                None,
            )
            .await;
        return Err(AuthRejection::Missing);
    };

    match verifier.verify(&credential.token) {
        Some(principal) => {
            audit
                .record(
                    AuditKind::AuthSuccess,
                    format!("{target}: {} authenticated", principal.username),
                    Some(json!({
                        "userId": principal.id,
                        "source": credential.source.as_str(),
                    })),
                )
                .await;
            Ok(principal)
        }
        None => {
            audit
                .record(
                    AuditKind::AuthFailure,
                    format!("{target}: invalid credential"),
                    Some(json!({ "source": credential.source.as_str() })),
                )
                .await;
            Err(AuthRejection::Invalid)
        }
    }
}

/// Axum middleware guarding the REST routes.
///
/// - `401 Unauthorized` — no credential
/// - `403 Forbidden` — credential rejected by the verifier
pub async fn require_bearer(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let target = request.uri().path().to_string();
    match authenticate(
        state.verifier.as_ref(),
        &state.audit,
        request.headers(),
        request.uri(),
        &target,
    )
    .await
    {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn operator() -> Principal {
        Principal {
            id: 1,
            username: "operator".into(),
        }
    }

    fn headers_with(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn header_wins_over_query() {
        let uri: Uri = "/ws/shell?token=from-query".parse().unwrap();
        let cred = extract_credential(&headers_with("Bearer from-header"), &uri).unwrap();
        assert_eq!(cred.token, "from-header");
        assert_eq!(cred.source, CredentialSource::Header);
    }

    #[test]
    fn query_used_when_header_absent_or_malformed() {
        let uri: Uri = "/ws/shell?token=abc%20def".parse().unwrap();
        let cred = extract_credential(&HeaderMap::new(), &uri).unwrap();
        assert_eq!(cred.token, "abc def");
        assert_eq!(cred.source, CredentialSource::Query);

        let cred = extract_credential(&headers_with("Basic xyz"), &uri).unwrap();
        assert_eq!(cred.source, CredentialSource::Query);
    }

    #[test]
    fn nothing_extracted_without_credential() {
        let uri: Uri = "/ws/shell?other=1".parse().unwrap();
        assert!(extract_credential(&HeaderMap::new(), &uri).is_none());
        let uri: Uri = "/ws/shell?token=".parse().unwrap();
        assert!(extract_credential(&headers_with("Bearer "), &uri).is_none());
    }

    #[test]
    fn api_key_verifier_accepts_only_exact_key() {
        let v = ApiKeyVerifier::new("secret", operator());
        assert_eq!(v.verify("secret"), Some(operator()));
        assert_eq!(v.verify("secre"), None);
        assert_eq!(v.verify("secret2"), None);
        assert_eq!(v.verify(""), None);
    }

    #[tokio::test]
    async fn authenticate_audits_each_attempt() {
        let v = ApiKeyVerifier::new("secret", operator());
        let audit = AuditLog::default();
        let uri: Uri = "/ws/shell".parse().unwrap();

        let missing = authenticate(&v, &audit, &HeaderMap::new(), &uri, "shell").await;
        assert_eq!(missing, Err(AuthRejection::Missing));

        let bad = authenticate(&v, &audit, &headers_with("Bearer nope"), &uri, "shell").await;
        assert_eq!(bad, Err(AuthRejection::Invalid));

        let ok = authenticate(&v, &audit, &headers_with("Bearer secret"), &uri, "shell").await;
        assert_eq!(ok, Ok(operator()));

        let kinds: Vec<_> = audit
            .read_since(0, 10)
            .await
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AuditKind::AuthFailure,
                AuditKind::AuthFailure,
                AuditKind::AuthSuccess
            ]
        );
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}

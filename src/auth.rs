//! Bearer-token authentication and role checks.
//!
//! Tokens are HS256 JWTs whose `sub` is the numeric user id and whose custom `role` claim is
//! `USER` or `ADMIN`. The signing key is decoded from a base64 secret at startup.
//! [`require_bearer`] validates `Authorization: Bearer <token>`, checks the user still exists,
//! and injects an [`AuthContext`] for handlers; failures return 401.

use crate::config::ConfigError;
use crate::error::QueueError;
use crate::store::OrderStore;
use crate::types::{Role, UserId};
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MIN_KEY_BYTES: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    iat: i64,
    exp: i64,
}

/// Authenticated caller. Injected by [`require_bearer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub role: Role,
}

/// Returns `Ok(())` if the caller holds `role`. Use in handlers: `require_role(&ctx, Role::Admin)?`.
pub fn require_role(ctx: &AuthContext, role: Role) -> Result<(), QueueError> {
    if ctx.role == role {
        Ok(())
    } else {
        Err(QueueError::Forbidden(role.as_str()))
    }
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime_secs: u64,
}

impl JwtService {
    pub fn from_base64_secret(secret: &str, lifetime_secs: u64) -> Result<Self, ConfigError> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(secret.trim())
            .map_err(|e| ConfigError::Invalid {
                name: "JWT_SECRET",
                value: "<redacted>".into(),
                reason: e.to_string(),
            })?;
        if key.len() < MIN_KEY_BYTES {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                value: "<redacted>".into(),
                reason: format!("decodes to {} bytes, need at least {}", key.len(), MIN_KEY_BYTES),
            });
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(&key),
            decoding_key: DecodingKey::from_secret(&key),
            lifetime_secs,
        })
    }

    /// Signs a token for `user` valid for the configured lifetime from now.
    pub fn issue(&self, user: UserId, role: Role) -> Result<String, QueueError> {
        self.issue_at(user, role, Utc::now())
    }

    /// Signs a token as if issued at `issued_at`.
    pub fn issue_at(&self, user: UserId, role: Role, issued_at: DateTime<Utc>) -> Result<String, QueueError> {
        let iat = issued_at.timestamp();
        let claims = Claims {
            sub: user.0.to_string(),
            role: role.as_str().to_string(),
            iat,
            exp: iat + self.lifetime_secs as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| QueueError::Internal(format!("token signing failed: {e}")))
    }

    /// Validates a raw credential. Missing or malformed → `Unauthenticated`;
    /// bad signature or expired → `InvalidCredential`.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<AuthContext, QueueError> {
        let token = credential
            .filter(|t| !t.is_empty())
            .ok_or_else(|| QueueError::Unauthenticated("missing bearer token".into()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| match e.kind() {
            JwtErrorKind::ExpiredSignature => QueueError::InvalidCredential("token expired".into()),
            JwtErrorKind::InvalidSignature
            | JwtErrorKind::ImmatureSignature
            | JwtErrorKind::InvalidAlgorithm => QueueError::InvalidCredential(e.to_string()),
            _ => QueueError::Unauthenticated(format!("malformed token: {e}")),
        })?;

        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| QueueError::Unauthenticated("malformed subject".into()))?;
        let role = Role::from_str(&data.claims.role)
            .ok_or_else(|| QueueError::Unauthenticated(format!("unknown role {:?}", data.claims.role)))?;
        Ok(AuthContext { user_id, role })
    }
}

/// Returns the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = value.get(..7)?;
    if prefix.eq_ignore_ascii_case("bearer ") {
        value.get(7..).map(str::trim)
    } else {
        None
    }
}

/// State for [`require_bearer`]: the token service and the user table it resolves against.
#[derive(Clone)]
pub struct Authenticator {
    pub jwt: Arc<JwtService>,
    pub store: Arc<OrderStore>,
}

/// Auth middleware: requires a valid bearer token for a known user and injects
/// [`AuthContext`]; otherwise returns 401 in the standard error shape.
pub async fn require_bearer(mut req: Request<Body>, next: Next, auth: Authenticator) -> Response {
    let ctx = match auth.jwt.authenticate(bearer_token(req.headers())) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::debug!("request rejected path={} reason={}", req.uri().path(), e);
            return e.into_response();
        }
    };

    let store = auth.store.clone();
    let lookup = tokio::task::spawn_blocking(move || store.read(|t| t.get_user(ctx.user_id))).await;
    match lookup {
        Ok(Ok(Some(_))) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Ok(Ok(None)) => QueueError::Unauthenticated(format!("unknown user {}", ctx.user_id)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => QueueError::Internal(format!("user lookup task failed: {e}")).into_response(),
    }
}

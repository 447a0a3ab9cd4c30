//! Agent admission tokens.
//!
//! Tokens are HS256 JWS over a single claim: `{ "token": "<VERIFY_TOKEN>" }`,
//! signed with the edge's `SECRET_KEY`.  No expiry is issued or required;
//! revocation is done by rotating the secret.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Must equal the configured `VERIFY_TOKEN`.
    pub token: String,
}

/// Sign a fresh agent token.
pub fn sign_token(secret: &str, verify_token: &str) -> Result<String, jsonwebtoken::errors::Error> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &Claims { token: verify_token.to_owned() },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Check signature and the verification claim.  Any failure is a plain
/// `false`: callers reject with one uniform message, never leaking why.
pub fn verify_token(secret: &str, verify_token: &str, raw: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    match jsonwebtoken::decode::<Claims>(
        raw,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data.claims.token == verify_token,
        Err(_) => false,
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

// ---------------------------------------------------------------------------
// Token issuer endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GeneratorParams {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// `GET /tunnel_jwt_generator?username=U&password=P`
///
/// 404 when issuer credentials are not configured, 401 on a credential
/// mismatch, otherwise 200 with the signed token as the body.
pub async fn jwt_generator_handler(
    State(state): State<AppState>,
    Query(params): Query<GeneratorParams>,
) -> Response {
    let Some(issuer) = &state.config.issuer else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if params.username != issuer.username || params.password != issuer.password {
        return (StatusCode::UNAUTHORIZED, "Forbidden").into_response();
    }
    match sign_token(&state.config.secret_key, &state.config.verify_token) {
        Ok(token) => (StatusCode::OK, token).into_response(),
        Err(e) => {
            warn!(error = %e, "token signing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

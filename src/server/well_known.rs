//! Discovery endpoints under `/.well-known`.

use axum::{extract::State, Json};

use crate::crypto::Jwks;

use super::AppState;

/// `GET /.well-known/jwks.json` — the RS256 public keys for verifying
/// internal JWTs.
pub async fn jwks(State(state): State<AppState>) -> Json<Jwks> {
    Json(state.issuer.jwks().clone())
}

//! Browser session state carried in the `gafaelfawr` cookie.
//!
//! The cookie payload is a sealed JSON blob holding the session token's
//! wire form, the CSRF state of an in-progress login, and the return URL
//! to finish on. A malformed, expired, or undecryptable cookie is treated
//! as the absence of a session; no error ever surfaces to the browser.

use std::time::Duration;

use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};

use crate::crypto::Sealer;
use crate::models::Token;
use crate::Result;

/// Name of the session cookie.
pub const COOKIE_NAME: &str = "gafaelfawr";

/// Decrypted contents of the session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// The session token, once authenticated
    pub token: Option<Token>,
    /// CSRF state of an in-progress login
    pub csrf: Option<String>,
    /// Where to send the browser once login completes
    pub return_url: Option<String>,
}

/// Serialized form of the cookie payload. The token travels as its wire
/// string so the layout stays stable across releases.
#[derive(Serialize, Deserialize)]
struct SessionPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_url: Option<String>,
}

impl SessionState {
    /// Seal this state into a cookie value.
    ///
    /// # Errors
    ///
    /// Returns an error only if sealing itself fails.
    pub fn to_cookie_value(&self, sealer: &Sealer) -> Result<String> {
        let payload = SessionPayload {
            token: self.token.as_ref().map(Token::to_string),
            state: self.csrf.clone(),
            return_url: self.return_url.clone(),
        };
        sealer.seal(&serde_json::to_vec(&payload)?)
    }

    /// Decode a cookie value, treating every failure as no session.
    #[must_use]
    pub fn from_cookie_value(sealer: &Sealer, value: &str, max_age: Duration) -> Self {
        let Ok(raw) = sealer.open(value, max_age) else {
            return Self::default();
        };
        let Ok(payload) = serde_json::from_slice::<SessionPayload>(&raw) else {
            return Self::default();
        };
        Self {
            token: payload.token.and_then(|w| w.parse().ok()),
            csrf: payload.state,
            return_url: payload.return_url,
        }
    }
}

/// Build the session cookie with the required attributes.
#[must_use]
pub fn session_cookie(value: String, max_age: Duration) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, value))
        .secure(true)
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time_duration(max_age))
        .build()
}

/// Build a cookie that clears the session.
#[must_use]
pub fn clear_session_cookie() -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, ""))
        .secure(true)
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}

fn time_duration(d: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn make_sealer() -> Sealer {
        let key: [u8; 32] = rand::rng().random();
        Sealer::new(&key).unwrap()
    }

    #[test]
    fn state_round_trips_through_cookie_value() {
        // GIVEN: a full session state
        let sealer = make_sealer();
        let state = SessionState {
            token: Some(Token::generate()),
            csrf: Some("some-state".to_string()),
            return_url: Some("https://example.com/foo".to_string()),
        };

        // WHEN: sealed and decoded
        let value = state.to_cookie_value(&sealer).unwrap();
        let decoded =
            SessionState::from_cookie_value(&sealer, &value, Duration::from_secs(60));

        // THEN: everything survives
        assert_eq!(decoded, state);
    }

    #[test]
    fn bad_cookie_is_treated_as_no_session() {
        let sealer = make_sealer();
        for bad in ["", "garbage", "bm90LXNlYWxlZA"] {
            let state =
                SessionState::from_cookie_value(&sealer, bad, Duration::from_secs(60));
            assert_eq!(state, SessionState::default());
        }
    }

    #[test]
    fn cookie_from_wrong_key_is_no_session() {
        let state = SessionState {
            token: Some(Token::generate()),
            csrf: None,
            return_url: None,
        };
        let value = state.to_cookie_value(&make_sealer()).unwrap();
        let decoded = SessionState::from_cookie_value(
            &make_sealer(),
            &value,
            Duration::from_secs(60),
        );
        assert_eq!(decoded, SessionState::default());
    }

    #[test]
    fn cookie_attributes_match_contract() {
        let cookie = session_cookie("value".to_string(), Duration::from_secs(3600));
        assert_eq!(cookie.name(), "gafaelfawr");
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(3600)));
    }
}

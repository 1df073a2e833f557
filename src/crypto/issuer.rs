//! Internal JWT issuance — RS256 signing and the published JWKS.
//!
//! One RSA private key signs every internal JWT. The JWT is a derivable
//! signed envelope around an `internal` token: it is never persisted, the
//! underlying token row is the authoritative record. The matching public
//! key is served at `/.well-known/jwks.json` so downstream services can
//! verify signatures without calling back.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    traits::PublicKeyParts,
    RsaPrivateKey,
};
use serde::{Deserialize, Serialize};

use crate::config::IssuerConfig;
use crate::models::TokenData;
use crate::{Error, Result};

/// Size of generated RSA keys in bits.
const GENERATED_KEY_BITS: usize = 2048;

/// Claims carried by an internal JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalClaims {
    /// Issuer
    pub iss: String,
    /// Audience (the deployment's internal audience)
    pub aud: String,
    /// Username
    pub sub: String,
    /// Space-separated scope set
    pub scope: String,
    /// Key of the backing internal token
    pub jti: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expires-at (unix seconds)
    pub exp: i64,
}

/// Published JWKS document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// Public keys
    pub keys: Vec<Jwk>,
}

/// One RSA public key in JWK form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `RSA`
    pub kty: String,
    /// Algorithm, always `RS256`
    pub alg: String,
    /// Key use, always `sig`
    #[serde(rename = "use")]
    pub key_use: String,
    /// Key ID matching JWT headers
    pub kid: String,
    /// Modulus, base64url
    pub n: String,
    /// Exponent, base64url
    pub e: String,
}

/// RS256 signer for internal JWTs.
pub struct Issuer {
    iss: String,
    aud_internal: String,
    key_id: String,
    encoding_key: EncodingKey,
    jwks: Jwks,
}

impl Issuer {
    /// Build an issuer from resolved configuration.
    ///
    /// Accepts the private key in PKCS#8 or PKCS#1 PEM form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the PEM does not parse as an RSA
    /// private key.
    pub fn from_config(config: &IssuerConfig) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(&config.key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&config.key_pem))
            .map_err(|e| Error::Config(format!("Invalid issuer key: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_pem(config.key_pem.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid issuer key: {e}")))?;

        Ok(Self {
            jwks: build_jwks(&private, &config.key_id),
            iss: config.iss.clone(),
            aud_internal: config.aud_internal.clone(),
            key_id: config.key_id.clone(),
            encoding_key,
        })
    }

    /// Generate a fresh issuer with a new RSA key.
    ///
    /// Used when bootstrapping a deployment without an existing key, and
    /// by the test suite. Returns the issuer and the PKCS#8 PEM of the
    /// generated private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if key generation fails.
    pub fn generate(iss: &str, aud_internal: &str, key_id: &str) -> Result<(Self, String)> {
        let mut rng = rsa::rand_core::OsRng;
        let private = RsaPrivateKey::new(&mut rng, GENERATED_KEY_BITS)
            .map_err(|e| Error::Internal(format!("RSA key generation failed: {e}")))?;
        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Internal(format!("RSA key encoding failed: {e}")))?
            .to_string();
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())?;

        let issuer = Self {
            jwks: build_jwks(&private, key_id),
            iss: iss.to_string(),
            aud_internal: aud_internal.to_string(),
            key_id: key_id.to_string(),
            encoding_key,
        };
        Ok((issuer, pem))
    }

    /// Sign an internal JWT for a freshly-minted internal token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the token carries no expiration
    /// (internal tokens always do) or signing fails.
    pub fn issue_internal_jwt(&self, data: &TokenData) -> Result<String> {
        let exp = data
            .expires
            .ok_or_else(|| Error::Internal("Internal token without expiration".to_string()))?;

        let claims = InternalClaims {
            iss: self.iss.clone(),
            aud: self.aud_internal.clone(),
            sub: data.username.clone(),
            scope: data.scopes.join(" "),
            jti: data.token.key.clone(),
            iat: data.created.timestamp(),
            exp: exp.timestamp(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }

    /// The published JWKS document.
    #[must_use]
    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }
}

/// Build the JWKS document from the private key's public half.
fn build_jwks(private: &RsaPrivateKey, key_id: &str) -> Jwks {
    let public = private.to_public_key();
    Jwks {
        keys: vec![Jwk {
            kty: "RSA".to_string(),
            alg: "RS256".to_string(),
            key_use: "sig".to_string(),
            kid: key_id.to_string(),
            n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{current_datetime, Token, TokenType};
    use chrono::Duration;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn make_data(expires_in: Duration) -> TokenData {
        TokenData {
            token: Token::generate(),
            username: "alice".to_string(),
            token_type: TokenType::Internal,
            scopes: vec!["read:all".to_string(), "user:token".to_string()],
            created: current_datetime(),
            expires: Some(current_datetime() + expires_in),
            name: None,
            email: Some("alice@example.com".to_string()),
            uid: Some(4100),
            groups: Vec::new(),
        }
    }

    fn validation(aud: &str, iss: &str) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_audience(&[aud]);
        validation.set_issuer(&[iss]);
        validation
    }

    #[test]
    fn issued_jwt_verifies_against_published_jwks() {
        // GIVEN: an issuer and an internal token
        let (issuer, _) =
            Issuer::generate("https://example.com", "https://example.com/api", "some-kid")
                .unwrap();
        let data = make_data(Duration::minutes(15));

        // WHEN: a JWT is issued and verified with the JWKS components
        let jwt = issuer.issue_internal_jwt(&data).unwrap();
        let jwk = &issuer.jwks().keys[0];
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let decoded = decode::<InternalClaims>(
            &jwt,
            &key,
            &validation("https://example.com/api", "https://example.com"),
        )
        .unwrap();

        // THEN: the claims round-trip and the kid is advertised
        assert_eq!(decoded.claims.sub, "alice");
        assert_eq!(decoded.claims.jti, data.token.key);
        assert_eq!(decoded.claims.scope, "read:all user:token");
        assert_eq!(decoded.header.kid.as_deref(), Some("some-kid"));
    }

    #[test]
    fn expired_jwt_fails_verification() {
        // GIVEN: a token that expired a minute ago
        let (issuer, _) =
            Issuer::generate("https://example.com", "https://example.com/api", "kid").unwrap();
        let data = make_data(Duration::minutes(-1));

        // WHEN: issued and verified
        let jwt = issuer.issue_internal_jwt(&data).unwrap();
        let jwk = &issuer.jwks().keys[0];
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let result = decode::<InternalClaims>(
            &jwt,
            &key,
            &validation("https://example.com/api", "https://example.com"),
        );

        // THEN: verification rejects it
        assert!(result.is_err());
    }

    #[test]
    fn generated_pem_round_trips_through_config() {
        // GIVEN: a generated key PEM
        let (_, pem) = Issuer::generate("iss", "aud", "kid").unwrap();

        // WHEN: fed back through from_config
        let config = IssuerConfig {
            iss: "https://example.com".to_string(),
            aud: "https://example.com".to_string(),
            aud_internal: "https://example.com/api".to_string(),
            key_id: "kid2".to_string(),
            key_pem: pem,
            lifetime: std::time::Duration::from_secs(3600),
        };
        let issuer = Issuer::from_config(&config).unwrap();

        // THEN: the issuer is usable
        let jwt = issuer.issue_internal_jwt(&make_data(Duration::minutes(5))).unwrap();
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[test]
    fn jwt_without_expiration_is_refused() {
        let (issuer, _) = Issuer::generate("iss", "aud", "kid").unwrap();
        let mut data = make_data(Duration::minutes(5));
        data.expires = None;
        assert!(issuer.issue_internal_jwt(&data).is_err());
    }
}

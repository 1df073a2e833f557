//! Cryptographic building blocks: authenticated symmetric sealing for
//! cookies and cached records, and RS256 signing for internal JWTs.

mod issuer;
mod seal;

pub use issuer::{InternalClaims, Issuer, Jwk, Jwks};
pub use seal::Sealer;

//! Signed, expiring session tokens.
//!
//! Tokens are HS256 JWTs carrying the user's id, role and email. Verification is
//! purely cryptographic and temporal: the store is never consulted, so a user
//! removed after login stays valid until the token expires.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    db::{Role, User},
    error::ChatError,
};

/// Default lifetime of an issued token.
pub const DEFAULT_TTL: Duration = Duration::hours(8);

/// Identity decoded from a verified token. Lives as long as the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaim {
    pub id: i64,
    pub role: Role,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaim {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Why a token was refused. Only used to pick a close code and for logs;
/// callers outside the transport see [`ChatError::Unauthorized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Expired,
    Invalid,
}

impl From<Rejection> for ChatError {
    fn from(_: Rejection) -> Self {
        ChatError::Unauthorized
    }
}

#[derive(Clone)]
pub struct SessionCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionCodec {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Codec over a fresh random 256-bit secret. Tokens do not survive a restart.
    pub fn ephemeral(ttl: Duration) -> Self {
        let secret: [u8; 32] = rand::rng().random();
        Self::new(&secret, ttl)
    }

    pub fn issue(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claim = SessionClaim {
            id: user.id,
            role: user.role,
            email: user.email.clone(),
            iat: now,
            exp: now + self.ttl.whole_seconds(),
        };

        jsonwebtoken::encode(&Header::default(), &claim, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaim, Rejection> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.leeway = 0;

        let claim = jsonwebtoken::decode::<SessionClaim>(token, &self.decoding, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => Rejection::Expired,
                _ => Rejection::Invalid,
            })?
            .claims;

        // jsonwebtoken accepts exp == now
        if claim.exp <= OffsetDateTime::now_utc().unix_timestamp() {
            return Err(Rejection::Expired);
        }

        Ok(claim)
    }
}

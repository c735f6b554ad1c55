//! Bearer tokens: login with a configured credential, HS256 JWTs after that.

use crate::config::User;
use crate::error::{Error, Result};
use crate::state::AppState;
use crate::util::constant_time_eq;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const ISSUER_TAG: &str = "stargate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    pub server: String,
    /// Issue time in milliseconds.
    pub timestamp: u64,
    pub exp: u64,
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

fn now() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

impl TokenKeys {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        let now = now();
        let claims = Claims {
            id: user.id.clone(),
            username: user.name.clone(),
            server: ISSUER_TAG.to_string(),
            timestamp: now.as_millis() as u64,
            exp: now.as_secs() + self.ttl_secs,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(data.claims)
    }
}

/// Find the user whose access token or password equals `credential`.
pub fn find_by_credential<'a>(users: &'a [User], credential: &str) -> Option<&'a User> {
    let matches = |stored: &Option<String>| {
        stored
            .as_deref()
            .is_some_and(|s| constant_time_eq(s.as_bytes(), credential.as_bytes()))
    };
    users
        .iter()
        .find(|user| matches(&user.access_token) || matches(&user.password))
}

/// The configured user behind a valid `Authorization: Bearer` header.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthorized("malformed authorization header".into()))?;
        let claims = state.tokens.verify(token)?;
        let user = state
            .config
            .find_user(&claims.id)
            .ok_or_else(|| Error::Unauthorized("unknown user".into()))?;
        Ok(AuthUser(user.clone()))
    }
}

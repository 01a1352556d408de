//! Credential checks, bearer token issue/verify, and login lockout.
//!
//! Tokens are HS256 JWTs binding the username, granted scopes, and the
//! issuing client IP, with a bounded lifetime. Revocation is by expiry
//! only.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::AuthSettings;
use crate::error::{PipelineError, Result};
use crate::util::rate_limit::RateLimiter;

pub const SCOPE_LOGS_WRITE: &str = "logs:write";
pub const SCOPE_LOGS_READ: &str = "logs:read";
pub const SCOPE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username.
    pub sub: String,
    pub scopes: Vec<String>,
    /// Client IP the token was issued to.
    pub client_ip: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub disabled: bool,
    pub scopes: Vec<String>,
    pub password_hash: String,
}

/// Backing store for user records. The in-memory implementation below
/// seeds a development admin; production deployments supply their own.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, username: &str) -> Result<Option<User>>;
}

pub struct MemoryUserStore {
    users: HashMap<String, User>,
}

impl MemoryUserStore {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect(),
        }
    }

    /// Development store with a single admin/admin account.
    pub fn with_default_admin() -> Self {
        let hash = bcrypt::hash("admin", bcrypt::DEFAULT_COST).expect("bcrypt hash");
        Self::new(vec![User {
            username: "admin".to_string(),
            disabled: false,
            scopes: vec![
                SCOPE_LOGS_WRITE.to_string(),
                SCOPE_LOGS_READ.to_string(),
                SCOPE_ADMIN.to_string(),
            ],
            password_hash: hash,
        }])
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.get(username).cloned())
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

pub struct AuthManager {
    settings: AuthSettings,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    store: Box<dyn UserStore>,
}

impl AuthManager {
    pub fn new(settings: AuthSettings, store: Box<dyn UserStore>) -> Result<Self> {
        let algorithm = match settings.jwt_algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(PipelineError::config(format!(
                    "unsupported JWT algorithm: {}",
                    other
                )))
            }
        };
        Ok(Self {
            encoding_key: EncodingKey::from_secret(settings.jwt_secret.as_ref()),
            decoding_key: DecodingKey::from_secret(settings.jwt_secret.as_ref()),
            algorithm,
            settings,
            store,
        })
    }

    /// Validate credentials and mint a token bound to `client_ip`.
    ///
    /// Failures increment a per-username counter with a 15-minute TTL;
    /// once the counter reaches the limit, further attempts are rejected
    /// with a rate-limit error until it expires, correct password or not.
    pub async fn login(
        &self,
        limiter: &RateLimiter,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<TokenResponse> {
        let counter_key = format!("failed_login:{}", username);
        let failures = limiter.peek(&counter_key).await.unwrap_or(0);
        if failures >= self.settings.failed_login_max as u64 {
            tracing::warn!(username, "login locked out after repeated failures");
            return Err(PipelineError::rate_limit(
                "Too many failed login attempts",
                self.settings.failed_login_window_secs,
            ));
        }

        let user = self.store.get_user(username).await?;
        // bcrypt::verify is constant-time on the hash comparison; verify
        // against a fixed dummy hash when the user is unknown so the
        // timing does not reveal which usernames exist.
        const DUMMY_HASH: &str = "$2b$12$C6UzMDM.H6dfI/f/IKcEeO7ZBpE1bs1uxuPdGeOBHbHEPO3Rs0Sce";
        let (hash, known) = match &user {
            Some(u) => (u.password_hash.as_str(), true),
            None => (DUMMY_HASH, false),
        };
        let password_ok = bcrypt::verify(password, hash).unwrap_or(false);

        let user = match (known, password_ok) {
            (true, true) => user.unwrap(),
            _ => {
                let count = limiter
                    .bump(&counter_key, self.settings.failed_login_window_secs)
                    .await
                    .unwrap_or(0);
                tracing::info!(username, failures = count, "failed login attempt");
                return Err(PipelineError::authentication("Invalid credentials"));
            }
        };

        if user.disabled {
            return Err(PipelineError::authentication("Account is disabled"));
        }

        let _ = limiter.clear(&counter_key).await;

        let now = Utc::now();
        let expires_in = self.settings.access_token_expire_minutes * 60;
        let claims = Claims {
            sub: user.username.clone(),
            scopes: user.scopes.clone(),
            client_ip: client_ip.to_string(),
            exp: (now + Duration::seconds(expires_in)).timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| PipelineError::internal(format!("failed to encode token: {}", e)))?;

        tracing::info!(username = %user.username, "issued access token");
        Ok(TokenResponse {
            access_token: token,
            token_type: "bearer".to_string(),
            expires_in,
        })
    }

    /// Decode and validate signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(self.algorithm);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| PipelineError::authentication(format!("invalid token: {}", e)))?;
        Ok(data.claims)
    }

    /// Extract the bearer token and verify it, then assert the required
    /// scopes are all granted.
    pub fn authorize(&self, headers: &HeaderMap, required_scopes: &[&str]) -> Result<Claims> {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| PipelineError::authentication("missing bearer token"))?;
        let claims = self.verify(token)?;
        for scope in required_scopes {
            if !claims.scopes.iter().any(|s| s == scope) {
                return Err(PipelineError::authorization(format!(
                    "missing required scope: {}",
                    scope
                )));
            }
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "unit-test-secret".to_string(),
            jwt_algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            failed_login_max: 5,
            failed_login_window_secs: 900,
            login_rate_times: 5,
            login_rate_seconds: 60,
        }
    }

    fn manager_with_user(username: &str, password: &str) -> AuthManager {
        let hash = bcrypt::hash(password, 4).unwrap();
        let store = MemoryUserStore::new(vec![User {
            username: username.to_string(),
            disabled: false,
            scopes: vec![SCOPE_LOGS_WRITE.to_string()],
            password_hash: hash,
        }]);
        AuthManager::new(test_settings(), Box::new(store)).unwrap()
    }

    #[tokio::test]
    async fn login_then_verify_roundtrip() {
        let manager = manager_with_user("carol", "s3cret");
        let limiter = RateLimiter::new(None);
        let token = manager
            .login(&limiter, "carol", "s3cret", "10.1.2.3")
            .await
            .unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.expires_in, 30 * 60);

        let claims = manager.verify(&token.access_token).unwrap();
        assert_eq!(claims.sub, "carol");
        assert_eq!(claims.client_ip, "10.1.2.3");
        assert!(claims.scopes.contains(&SCOPE_LOGS_WRITE.to_string()));
    }

    #[tokio::test]
    async fn lockout_after_five_failures() {
        let manager = manager_with_user("dave", "hunter2");
        let limiter = RateLimiter::new(None);

        for _ in 0..5 {
            let err = manager
                .login(&limiter, "dave", "wrong", "127.0.0.1")
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::AuthenticationError(_)));
        }
        // Sixth attempt is rejected as rate-limited even with the
        // correct password.
        let err = manager
            .login(&limiter, "dave", "hunter2", "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitError { .. }));
    }

    #[tokio::test]
    async fn success_clears_failure_streak() {
        let manager = manager_with_user("erin", "pw");
        let limiter = RateLimiter::new(None);
        for _ in 0..3 {
            let _ = manager.login(&limiter, "erin", "nope", "::1").await;
        }
        assert!(manager.login(&limiter, "erin", "pw", "::1").await.is_ok());
        assert_eq!(limiter.peek("failed_login:erin").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn authorize_checks_scopes() {
        let manager = manager_with_user("frank", "pw");
        let limiter = RateLimiter::new(None);
        let token = manager
            .login(&limiter, "frank", "pw", "127.0.0.1")
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token.access_token).parse().unwrap(),
        );
        assert!(manager.authorize(&headers, &[SCOPE_LOGS_WRITE]).is_ok());
        let err = manager.authorize(&headers, &[SCOPE_ADMIN]).unwrap_err();
        assert!(matches!(err, PipelineError::AuthorizationError(_)));
    }

    #[test]
    fn verify_rejects_garbage() {
        let manager = manager_with_user("gina", "pw");
        assert!(manager.verify("not-a-token").is_err());
    }
}

/// Authentication and authorization: JWT access tokens carrying `Role`,
/// argon2 password hashing, and refresh-token rotation backed by
/// `agentd_core::Store`'s `user_sessions` table.
use crate::config::AuthConfig;
use crate::errors::{DaemonError, DaemonResult};
use agentd_core::{Role, Store, UserSession};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// JWT claims for the short-lived access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthManager {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        AuthManager {
            config,
            encoding_key,
            decoding_key,
        }
    }

    pub fn hash_password(&self, password: &str) -> DaemonResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| DaemonError::Internal(format!("password hash failed: {e}")))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn generate_access_token(
        &self,
        user_id: Uuid,
        role: Role,
    ) -> DaemonResult<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.config.access_token_expiry_secs as i64);
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| DaemonError::Internal(format!("token generation failed: {e}")))?;
        Ok((token, exp))
    }

    pub fn verify_access_token(&self, token: &str) -> DaemonResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| DaemonError::InvalidCredentials)
    }

    /// Mints a fresh opaque refresh token, persists a session row keyed by
    /// its SHA-256 (deterministic, so `Store::get_active_session_by_hash`
    /// can look it up directly — unlike the salted argon2 hash used for
    /// passwords, a refresh token is already high-entropy and only needs a
    /// fast, collision-resistant lookup key).
    pub async fn issue_refresh_token(
        &self,
        store: &Store,
        user_id: Uuid,
    ) -> DaemonResult<(String, DateTime<Utc>)> {
        let raw = format!("{}.{}", Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.refresh_token_expiry_secs as i64);
        store
            .create_session(&UserSession {
                id: Uuid::new_v4(),
                user_id,
                refresh_token_hash: hash_token(&raw),
                issued_at: now,
                expires_at,
                revoked_at: None,
            })
            .await?;
        Ok((raw, expires_at))
    }

    /// Validates a presented refresh token and rotates it: the old session
    /// is revoked and a new one issued in the same call, so a stolen refresh
    /// token is only usable once before the legitimate client's next refresh
    /// invalidates it too.
    pub async fn rotate_refresh_token(
        &self,
        store: &Store,
        presented: &str,
    ) -> DaemonResult<(Uuid, String, DateTime<Utc>)> {
        let session = store
            .get_active_session_by_hash(&hash_token(presented))
            .await?
            .ok_or(DaemonError::InvalidCredentials)?;
        if session.expires_at < Utc::now() {
            return Err(DaemonError::InvalidCredentials);
        }
        store.revoke_session(session.id).await?;
        let (token, expires_at) = self.issue_refresh_token(store, session.user_id).await?;
        Ok((session.user_id, token, expires_at))
    }
}

fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".to_string(),
            access_token_expiry_secs: 900,
            refresh_token_expiry_secs: 3600,
        }
    }

    #[test]
    fn password_roundtrips_through_hash_and_verify() {
        let auth = AuthManager::new(test_config());
        let hash = auth.hash_password("correct horse battery staple").unwrap();
        assert!(auth.verify_password("correct horse battery staple", &hash));
        assert!(!auth.verify_password("wrong password", &hash));
    }

    #[test]
    fn access_token_roundtrips_claims() {
        let auth = AuthManager::new(test_config());
        let user_id = Uuid::new_v4();
        let (token, _) = auth.generate_access_token(user_id, Role::Operator).unwrap();
        let claims = auth.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, Role::Operator);
    }

    #[tokio::test]
    async fn refresh_token_rotation_invalidates_the_old_token() {
        let auth = AuthManager::new(test_config());
        let store = Store::connect_in_memory().await.unwrap();
        let user_id = Uuid::new_v4();

        let (first, _) = auth.issue_refresh_token(&store, user_id).await.unwrap();
        let (rotated_user, second, _) = auth.rotate_refresh_token(&store, &first).await.unwrap();
        assert_eq!(rotated_user, user_id);

        assert!(auth.rotate_refresh_token(&store, &first).await.is_err());
        assert!(auth.rotate_refresh_token(&store, &second).await.is_ok());
    }
}

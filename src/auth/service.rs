//! Login, refresh rotation, and logout against the store.

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::db::{store, Store, StoreError, User};

use super::jwt::{JwtError, JwtService};
use super::password::verify_password;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Administrator privileges required")]
    NotAdmin,

    #[error("Token is invalid, expired, or revoked")]
    InvalidToken,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Jwt(#[from] JwtError),
}

/// An issued access/refresh pair plus the authenticated user.
#[derive(Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

/// Authentication service for the orchestrator API. Only administrators may
/// hold a session here; customer accounts exist in the shared user table but
/// are rejected at login and refresh.
#[derive(Clone)]
pub struct AuthService {
    store: Store,
    jwt: JwtService,
}

impl AuthService {
    pub fn new(store: Store, jwt: JwtService) -> Self {
        Self { store, jwt }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let user = self
            .store
            .get_user_by_email(email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_admin() {
            return Err(AuthError::NotAdmin);
        }

        info!(user_id = user.id, "Administrator logged in");
        self.issue_pair(user).await
    }

    /// Rotate a refresh token: the presented token is revoked and a fresh
    /// pair is issued. A revoked or already-rotated token is rejected.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let user_id = self
            .jwt
            .verify_refresh_token(refresh_token)
            .map_err(|_| AuthError::InvalidToken)?;

        let token_hash = store::hash_token(refresh_token);
        let persisted = self
            .store
            .get_auth_token_by_hash(&token_hash)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if !persisted.is_active() || persisted.user_id != user_id {
            return Err(AuthError::InvalidToken);
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        // A user demoted after login loses refresh access too
        if !user.is_admin() {
            return Err(AuthError::NotAdmin);
        }

        self.store.revoke_auth_token(&token_hash).await?;
        self.issue_pair(user).await
    }

    /// Revoke the presented refresh token.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let token_hash = store::hash_token(refresh_token);
        self.store.revoke_auth_token(&token_hash).await?;
        Ok(())
    }

    /// Resolve the user behind a valid access token.
    pub async fn authenticate(&self, access_token: &str) -> Result<User, AuthError> {
        let user_id = self
            .jwt
            .verify_access_token(access_token)
            .map_err(|_| AuthError::InvalidToken)?;

        self.store
            .get_user(user_id)
            .await?
            .ok_or(AuthError::InvalidToken)
    }

    async fn issue_pair(&self, user: User) -> Result<TokenPair, AuthError> {
        let access_token = self.jwt.issue_access_token(user.id)?;
        let refresh_token = self.jwt.issue_refresh_token(user.id)?;

        let expires_at = Utc::now() + self.jwt.refresh_ttl();
        self.store
            .insert_auth_token(user.id, &store::hash_token(&refresh_token), expires_at)
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::db::UserRole;

    async fn setup() -> (AuthService, Store) {
        let store = Store::in_memory().await.unwrap();
        let jwt = JwtService::new("test-secret", 60, 60 * 24).unwrap();
        (AuthService::new(store.clone(), jwt), store)
    }

    async fn seed_admin(store: &Store) -> User {
        let hash = hash_password("correct horse").unwrap();
        store
            .create_user("Admin", "admin@example.com", &hash, UserRole::Admin)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_success() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let pair = auth.login("admin@example.com", "correct horse").await.unwrap();
        assert!(pair.user.is_admin());

        let me = auth.authenticate(&pair.access_token).await.unwrap();
        assert_eq!(me.email, "admin@example.com");
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let err = auth.login("admin@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_login_rejects_customer() {
        let (auth, store) = setup().await;
        let hash = hash_password("pw").unwrap();
        store
            .create_user("Customer", "c@example.com", &hash, UserRole::Customer)
            .await
            .unwrap();

        let err = auth.login("c@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::NotAdmin));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_rejects_reuse() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let pair = auth.login("admin@example.com", "correct horse").await.unwrap();
        let rotated = auth.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);

        // The rotated-away token must no longer be accepted
        let err = auth.refresh(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));

        // The new token still works
        auth.refresh(&rotated.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_revokes_refresh_token() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let pair = auth.login("admin@example.com", "correct horse").await.unwrap();
        auth.logout(&pair.refresh_token).await.unwrap();

        let err = auth.refresh(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_access_token_rejected_for_refresh() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let pair = auth.login("admin@example.com", "correct horse").await.unwrap();
        let err = auth.refresh(&pair.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_for_access() {
        let (auth, store) = setup().await;
        seed_admin(&store).await;

        let pair = auth.login("admin@example.com", "correct horse").await.unwrap();
        let err = auth.authenticate(&pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }
}

// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The authentication service: issues signed enrollment tokens and keeps the
//! token blocklist. Token lifetimes are capped by the `max_auth_validity`
//! property of the target user group.

use morphocommon::{
    crypto::signatures::{
        SigningKey, VerifyingKey,
        signable::{Signable, Verifiable},
    },
    errors::AccessDeniedError,
    messages::auth::{
        AsaToken, AsaTokenRequest, AsaTokenResponse, TokenBlocklistEntry, TokenClaims,
        TokenKeyType,
    },
    ticketing::AccessMode,
    time::{Duration, TimeStamp},
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, instrument};

use crate::{access_manager::storage::Storage, errors::StorageError};

const BLOCKLIST_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS token_blocklist (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    user_group TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
";

/// Default token lifetime when the target group does not cap it.
fn default_token_validity() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    AccessDenied(#[from] AccessDeniedError),
    /// Token signature failed verification.
    #[error("token signature invalid")]
    SignatureInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("token not yet valid")]
    TokenNotYetValid,
    /// Unrecoverable implementation error
    #[error("Library Error")]
    LibraryError,
}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

pub struct AuthService {
    signing_key: SigningKey<TokenKeyType>,
    /// The Access Manager ledger, consulted for user-group membership and
    /// token validity caps.
    directory: Storage,
    pool: SqlitePool,
}

impl AuthService {
    pub async fn new(
        signing_key: SigningKey<TokenKeyType>,
        directory: Storage,
        pool: SqlitePool,
    ) -> Result<Self, AuthError> {
        sqlx::raw_sql(BLOCKLIST_SCHEMA).execute(&pool).await?;
        Ok(Self {
            signing_key,
            directory,
            pool,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey<TokenKeyType> {
        self.signing_key.verifying_key()
    }

    /// Issue a token for `subject` in `group`. The subject must be a member
    /// of the group; the expiration is capped by the group's
    /// `max_auth_validity`.
    #[instrument(level = "info", skip_all, fields(subject = %request.subject, group = %request.group))]
    pub async fn issue_token(
        &self,
        request: &AsaTokenRequest,
    ) -> Result<AsaTokenResponse, AuthError> {
        let now = TimeStamp::now();
        if !self
            .directory
            .user_in_group(&request.subject, &request.group, now)
            .await?
        {
            return Err(AccessDeniedError::new(
                request.group.clone(),
                AccessMode::Access,
                format!("user {:?}", request.subject),
            )
            .into());
        }

        let group = self
            .directory
            .find_user_group(&request.group, now)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user group {:?}", request.group)))?;
        let cap = group
            .max_auth_validity_secs
            .map(Duration::seconds)
            .unwrap_or_else(default_token_validity);
        let expires_at = request.expiration_time.min(now + cap);

        let claims = TokenClaims {
            subject: request.subject.clone(),
            group: request.group.clone(),
            issued_at: now,
            expires_at,
        };
        let token = claims.sign(&self.signing_key).map_err(|_| AuthError::LibraryError)?;
        Ok(AsaTokenResponse { token })
    }

    /// Validate a presented token: signature, validity window, blocklist.
    pub async fn validate_token(&self, token: &AsaToken) -> Result<TokenClaims, AuthError> {
        let claims = token
            .clone()
            .verify(&self.signing_key.verifying_key())
            .map_err(|_| AuthError::SignatureInvalid)?;

        let now = TimeStamp::now();
        if now < claims.issued_at {
            return Err(AuthError::TokenNotYetValid);
        }
        if now > claims.expires_at {
            return Err(AuthError::TokenExpired);
        }

        if self.is_blocked(&claims).await? {
            return Err(AccessDeniedError::new(
                claims.group.clone(),
                AccessMode::Access,
                format!("token for {:?}", claims.subject),
            )
            .into());
        }
        Ok(claims)
    }

    async fn is_blocked(&self, claims: &TokenClaims) -> Result<bool, AuthError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS hits FROM token_blocklist
             WHERE subject = ?1 AND user_group = ?2 AND issued_at = ?3",
        )
        .bind(&claims.subject)
        .bind(&claims.group)
        .bind(claims.issued_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("hits")? > 0)
    }

    pub async fn blocklist(&self) -> Result<Vec<TokenBlocklistEntry>, AuthError> {
        let rows = sqlx::query(
            "SELECT subject, user_group, issued_at FROM token_blocklist ORDER BY seqno",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(TokenBlocklistEntry {
                    subject: row.try_get("subject")?,
                    group: row.try_get("user_group")?,
                    issued_at: row.try_get("issued_at")?,
                })
            })
            .collect()
    }

    pub async fn block(&self, entry: &TokenBlocklistEntry) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO token_blocklist (subject, user_group, issued_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&entry.subject)
        .bind(&entry.group)
        .bind(entry.issued_at)
        .bind(TimeStamp::now())
        .execute(&self.pool)
        .await?;
        info!(subject = %entry.subject, group = %entry.group, "token blocklist entry added");
        Ok(())
    }

    pub async fn unblock(&self, entry: &TokenBlocklistEntry) -> Result<(), AuthError> {
        sqlx::query(
            "DELETE FROM token_blocklist
             WHERE subject = ?1 AND user_group = ?2 AND issued_at = ?3",
        )
        .bind(&entry.subject)
        .bind(&entry.group)
        .bind(entry.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> AuthService {
        let directory = Storage::new_in_memory().await.unwrap();
        directory.create_user("bob").await.unwrap();
        directory
            .create_user_group("ResearchAssessor", None)
            .await
            .unwrap();
        directory
            .add_user_to_group("bob", "ResearchAssessor")
            .await
            .unwrap();
        let signing_key = SigningKey::generate().unwrap();
        AuthService::new(signing_key, directory.clone(), directory.raw_pool().clone())
            .await
            .unwrap()
    }

    fn request() -> AsaTokenRequest {
        AsaTokenRequest {
            subject: "bob".to_owned(),
            group: "ResearchAssessor".to_owned(),
            expiration_time: TimeStamp::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn issue_and_validate() {
        let service = service().await;
        let response = service.issue_token(&request()).await.unwrap();
        let claims = service.validate_token(&response.token).await.unwrap();
        assert_eq!(claims.subject, "bob");
    }

    #[tokio::test]
    async fn non_member_is_refused() {
        let service = service().await;
        let result = service
            .issue_token(&AsaTokenRequest {
                subject: "mallory".to_owned(),
                group: "ResearchAssessor".to_owned(),
                expiration_time: TimeStamp::now() + Duration::hours(1),
            })
            .await;
        assert!(matches!(result, Err(AuthError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn blocklist_blocks_and_unblocks() {
        let service = service().await;
        let response = service.issue_token(&request()).await.unwrap();
        let claims = response.token.unverified_claims().clone();

        let entry = TokenBlocklistEntry {
            subject: claims.subject.clone(),
            group: claims.group.clone(),
            issued_at: claims.issued_at,
        };
        service.block(&entry).await.unwrap();
        assert!(matches!(
            service.validate_token(&response.token).await,
            Err(AuthError::AccessDenied(_))
        ));

        service.unblock(&entry).await.unwrap();
        assert!(service.validate_token(&response.token).await.is_ok());
    }

    #[tokio::test]
    async fn group_validity_caps_expiration() {
        let directory = Storage::new_in_memory().await.unwrap();
        directory.create_user("carol").await.unwrap();
        directory
            .create_user_group("ShortLived", Some(60))
            .await
            .unwrap();
        directory
            .add_user_to_group("carol", "ShortLived")
            .await
            .unwrap();
        let service = AuthService::new(
            SigningKey::generate().unwrap(),
            directory.clone(),
            directory.raw_pool().clone(),
        )
        .await
        .unwrap();

        let response = service
            .issue_token(&AsaTokenRequest {
                subject: "carol".to_owned(),
                group: "ShortLived".to_owned(),
                expiration_time: TimeStamp::now() + Duration::hours(12),
            })
            .await
            .unwrap();
        let claims = response.token.unverified_claims();
        assert!(claims.expires_at <= claims.issued_at + Duration::seconds(61));
    }
}

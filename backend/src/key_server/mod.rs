// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The Key Server party. It holds the master private keys and assembles the
//! per-user-group enrollment keys; it never sees a reshuffle secret and can
//! therefore not link pseudonyms across domains.

use std::sync::Arc;

use morphocommon::{
    crypto::transcryption::{EnrollmentKeys, KeyServerSecrets},
    messages::auth::AsaToken,
};
use thiserror::Error;
use tracing::{info, instrument};

use crate::auth_service::{AuthError, AuthService};

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub struct KeyServer {
    secrets: KeyServerSecrets,
    auth: Arc<AuthService>,
}

impl KeyServer {
    pub fn new(secrets: KeyServerSecrets, auth: Arc<AuthService>) -> Self {
        Self { secrets, auth }
    }

    /// Enroll the holder of a valid token: hand out the data and pseudonym
    /// decryption keys of the token's user group.
    #[instrument(level = "info", skip_all)]
    pub async fn enroll(&self, token: &AsaToken) -> Result<EnrollmentKeys, EnrollmentError> {
        let claims = self.auth.validate_token(token).await?;
        info!(subject = %claims.subject, group = %claims.group, "enrolling client");
        Ok(self.secrets.enroll(&claims.group))
    }
}

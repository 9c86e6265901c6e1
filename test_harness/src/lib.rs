// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process party constellation for the end-to-end tests: all four server
//! parties wired together over in-memory SQLite and an in-memory page store.

use std::sync::Arc;

use morphobackend::{
    access_manager::{AccessManager, storage::Storage},
    auth_service::AuthService,
    key_server::KeyServer,
    storage_facility::{StorageFacility, page_store::MemoryPageStore},
    transcryptor::Transcryptor,
};
use morphocommon::{
    crypto::{signatures::SigningKey, transcryption::SystemKeys},
    identifiers::UserIdentity,
    messages::auth::{AsaToken, AsaTokenRequest},
    ticketing::{TicketVerifyingKeys, default_ticket_validity},
    time::{Duration, TimeStamp},
};
use morphocoreclient::{Client, SystemPublicInfo};
use sqlx::sqlite::SqlitePoolOptions;

/// Initialise tracing for tests. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Constellation {
    pub access_manager: Arc<AccessManager>,
    pub transcryptor: Arc<Transcryptor>,
    pub storage_facility: Arc<StorageFacility>,
    pub key_server: Arc<KeyServer>,
    pub auth_service: Arc<AuthService>,
    pub public: SystemPublicInfo,
}

impl Constellation {
    /// Run the setup ceremony and start all four parties in-process.
    pub async fn start() -> Self {
        let keys = SystemKeys::generate().expect("setup ceremony");

        let am_signing_key = SigningKey::generate().expect("access manager signing key");
        let ts_signing_key = SigningKey::generate().expect("transcryptor signing key");
        let token_signing_key = SigningKey::generate().expect("token signing key");
        let roots = TicketVerifyingKeys {
            access_manager: am_signing_key.verifying_key(),
            transcryptor: ts_signing_key.verifying_key(),
        };
        let validity = default_ticket_validity();

        let transcryptor = Arc::new(Transcryptor::new(
            keys.transcryptor,
            ts_signing_key,
            roots.clone(),
            validity,
        ));

        let sf_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("storage facility database");
        let storage_facility = Arc::new(
            StorageFacility::new(
                sf_pool,
                Arc::new(MemoryPageStore::new()),
                keys.storage_facility,
                roots.clone(),
                validity,
            )
            .await
            .expect("storage facility"),
        );

        let storage = Storage::new_in_memory().await.expect("access manager ledger");
        let auth_service = Arc::new(
            AuthService::new(
                token_signing_key,
                storage.clone(),
                storage.raw_pool().clone(),
            )
            .await
            .expect("auth service"),
        );
        let key_server = Arc::new(KeyServer::new(keys.key_server, Arc::clone(&auth_service)));

        let access_manager = Arc::new(AccessManager::new(
            storage,
            keys.access_manager,
            keys.master_pseudonym_key,
            am_signing_key,
            roots.clone(),
            validity,
            Arc::clone(&transcryptor),
            Arc::clone(&storage_facility),
        ));

        let public = SystemPublicInfo {
            master_pseudonym_key: keys.master_pseudonym_key,
            master_data_key: keys.master_data_key,
            roots,
        };

        Self {
            access_manager,
            transcryptor,
            storage_facility,
            key_server,
            auth_service,
            public,
        }
    }

    pub fn storage(&self) -> &Storage {
        self.access_manager.storage()
    }

    /// Create the user and group (if missing) and make the user a member.
    pub async fn provision_user(&self, user: &str, group: &str) {
        let storage = self.storage();
        let now = TimeStamp::now();
        if storage
            .find_internal_user_id(user, now)
            .await
            .expect("user lookup")
            .is_none()
        {
            storage.create_user(user).await.expect("create user");
        }
        if storage
            .find_user_group(group, now)
            .await
            .expect("group lookup")
            .is_none()
        {
            storage
                .create_user_group(group, None)
                .await
                .expect("create user group");
        }
        if !storage
            .user_in_group(user, group, TimeStamp::now())
            .await
            .expect("membership lookup")
        {
            storage
                .add_user_to_group(user, group)
                .await
                .expect("group membership");
        }
    }

    pub async fn issue_token(&self, user: &str, group: &str) -> AsaToken {
        self.auth_service
            .issue_token(&AsaTokenRequest {
                subject: user.to_owned(),
                group: group.to_owned(),
                expiration_time: TimeStamp::now() + Duration::hours(1),
            })
            .await
            .expect("token issuance")
            .token
    }

    /// Provision, token-issue and enroll a client in one step.
    pub async fn enroll_client(&self, user: &str, group: &str) -> Client {
        self.provision_user(user, group).await;
        let token = self.issue_token(user, group).await;
        Client::enroll(
            UserIdentity::new(user, group),
            &token,
            self.public.clone(),
            &self.key_server,
            Arc::clone(&self.access_manager),
            Arc::clone(&self.storage_facility),
        )
        .await
        .expect("client enrollment")
    }
}

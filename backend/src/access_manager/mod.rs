// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The Access Manager party: authoritative ledger of columns, groups,
//! memberships, rules and users; issuer of tickets; first hop of every
//! transcryption.

pub mod records;
pub mod storage;
mod structure_metadata;
pub mod users;

use std::collections::BTreeMap;
use std::sync::Arc;

use morphocommon::{
    crypto::{
        elgamal::{ElgamalCiphertext, ElgamalPublicKey},
        signatures::{SigningKey, signable::Signable},
        transcryption::{AccessManagerSecrets, CellBinding, PseudonymDomain},
    },
    errors::AccessDeniedError,
    identifiers::{LocalPseudonym, PolymorphicPseudonym, UserIdentity},
    messages::access_manager::{
        BlindMode, ColumnAccessRequest, ColumnAccessResponse, ColumnGroupAccess,
        ColumnNameMappingAction, ColumnNameMappingRequest, ColumnNameMappingResponse,
        EncryptionKeyRequest, EncryptionKeyResponse, ParticipantGroupAccessRequest,
        ParticipantGroupAccessResponse, SetStructureMetadataRequest, StructureMetadataRequest,
        StructureMetadataResponse, UserMutation, UserMutationRequest, UserQuery,
        UserQueryResponse,
    },
    ticketing::{
        AccessMode, IndexedTicket, PseudonymEntry, SignedTicket, Ticket, TicketError,
        TicketRequest, TicketSigner, TicketVerifyingKeys, TicketKeyType,
    },
    time::{Duration, TimeStamp},
};
use thiserror::Error;
use tracing::{info, instrument};

use crate::{
    errors::StorageError,
    storage_facility::{SfError, StorageFacility},
    transcryptor::{
        IssuanceContext, SignedIssuanceContext, TranscryptionError, Transcryptor,
    },
};

use storage::Storage;

/// Grants that exist without an explicit access-rule record, surfaced when
/// `include_implicit` is requested.
const IMPLICIT_COLUMN_ACCESS: &[(&str, &[AccessMode])] = &[(
    "DataAdministrator",
    &[AccessMode::ReadMeta, AccessMode::Enumerate],
)];
const IMPLICIT_PARTICIPANT_ACCESS: &[(&str, &[AccessMode])] =
    &[("DataAdministrator", &[AccessMode::Enumerate])];

/// The user group allowed to administer the ledger.
const ADMIN_USER_GROUP: &str = "DataAdministrator";

#[derive(Debug, Error)]
pub enum AmError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    AccessDenied(#[from] AccessDeniedError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Transcryption(#[from] TranscryptionError),
    #[error(transparent)]
    StorageFacility(#[from] SfError),
    /// The request is malformed beyond what access rules can answer for.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Unrecoverable implementation error
    #[error("Library Error")]
    LibraryError,
}

impl From<morphocommon::LibraryError> for AmError {
    fn from(_: morphocommon::LibraryError) -> Self {
        Self::LibraryError
    }
}

pub struct AccessManager {
    storage: Storage,
    secrets: AccessManagerSecrets,
    master_pseudonym_key: ElgamalPublicKey,
    signing_key: SigningKey<TicketKeyType>,
    roots: TicketVerifyingKeys,
    ticket_validity: Duration,
    transcryptor: Arc<Transcryptor>,
    storage_facility: Arc<StorageFacility>,
}

impl AccessManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        secrets: AccessManagerSecrets,
        master_pseudonym_key: ElgamalPublicKey,
        signing_key: SigningKey<TicketKeyType>,
        roots: TicketVerifyingKeys,
        ticket_validity: Duration,
        transcryptor: Arc<Transcryptor>,
        storage_facility: Arc<StorageFacility>,
    ) -> Self {
        Self {
            storage,
            secrets,
            master_pseudonym_key,
            signing_key,
            roots,
            ticket_validity,
            transcryptor,
            storage_facility,
        }
    }

    /// The ledger handle, for administration that bypasses the message
    /// surface (initial provisioning, tests).
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn master_pseudonym_key(&self) -> &ElgamalPublicKey {
        &self.master_pseudonym_key
    }

    // === Ticket issuance ===

    /// Issue a ticket for the authenticated requester, or refuse with the
    /// first missing grant. No partial tickets are ever produced.
    #[instrument(level = "info", skip_all, fields(user = %identity, modes = ?request.modes))]
    pub async fn request_ticket(
        &self,
        identity: &UserIdentity,
        request: &TicketRequest,
    ) -> Result<IndexedTicket, AmError> {
        let now = TimeStamp::now();

        // Expand column groups and assemble the final column vector:
        // explicit columns first, then group members.
        for column in &request.columns {
            if !self.storage.has_column(column, now).await? {
                return Err(StorageError::NotFound(format!("column {column:?}")).into());
            }
        }
        let expansion = self
            .storage
            .expand_column_groups(&request.column_groups, now)
            .await?;

        let mut columns: Vec<String> = Vec::new();
        let mut column_group_indices: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for column in &request.columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        for group in &request.column_groups {
            let mut indices = Vec::new();
            if let Some(members) = expansion.get(group) {
                for column in members {
                    let index = match columns.iter().position(|c| c == column) {
                        Some(index) => index,
                        None => {
                            columns.push(column.clone());
                            columns.len() - 1
                        }
                    };
                    indices.push(index as u32);
                }
            }
            column_group_indices.insert(group.clone(), indices);
        }

        // Authorisation: every requested (target, mode) pair needs a
        // current access rule.
        self.check_column_access(identity, request, &columns, now)
            .await?;
        for group in &request.participant_groups {
            if !self.storage.has_participant_group(group, now).await? {
                return Err(StorageError::NotFound(format!("participant group {group:?}")).into());
            }
            if !self
                .storage
                .has_participant_group_access_rule(
                    group,
                    &identity.user_group,
                    AccessMode::Access.as_str(),
                    now,
                )
                .await?
            {
                return Err(AccessDeniedError::new(
                    identity.user_group.clone(),
                    AccessMode::Access,
                    group.clone(),
                )
                .into());
            }
        }

        // Resolve participant groups to their members' polymorphic
        // pseudonyms via the registry.
        let mut pps: Vec<PolymorphicPseudonym> = request.pps.clone();
        let mut participant_group_indices: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for group in &request.participant_groups {
            let mut indices = Vec::new();
            for lp in self
                .storage
                .participant_group_participants(group, now)
                .await?
            {
                let pp = self.storage.polymorphic_pseudonym(&lp).await?;
                indices.push(pps.len() as u32);
                pps.push(pp);
            }
            participant_group_indices.insert(group.clone(), indices);
        }

        // Transcrypt every pseudonym to its per-party representations.
        let context = self.sign_issuance_context(identity, request, &columns, now)?;
        let entries = self
            .transcrypt_pseudonym_entries(&context, identity, &pps, request.include_access_group_pseudonyms)
            .await?;

        let ticket = Ticket {
            issued_at: now,
            user: identity.user.clone(),
            user_group: identity.user_group.clone(),
            modes: request.modes.clone(),
            columns,
            pseudonyms: entries,
        };
        let signed = SignedTicket::sign(ticket, TicketSigner::AccessManager, &self.signing_key)?;
        let signed = self.transcryptor.countersign_ticket(signed)?;
        info!(pseudonyms = signed.unvalidated().pseudonyms.len(), "ticket issued");

        Ok(IndexedTicket {
            ticket: signed,
            column_groups: column_group_indices,
            participant_groups: participant_group_indices,
        })
    }

    async fn check_column_access(
        &self,
        identity: &UserIdentity,
        request: &TicketRequest,
        columns: &[String],
        now: TimeStamp,
    ) -> Result<(), AmError> {
        for mode in &request.modes {
            for group in &request.column_groups {
                if !self
                    .storage
                    .has_column_group_access_rule(
                        group,
                        &identity.user_group,
                        mode.as_str(),
                        now,
                    )
                    .await?
                {
                    return Err(AccessDeniedError::new(
                        identity.user_group.clone(),
                        *mode,
                        group.clone(),
                    )
                    .into());
                }
            }
            // An explicit column is authorised through any group containing
            // it; group-derived columns are covered by the group's own rule.
            for column in columns {
                if !request.columns.contains(column) {
                    continue;
                }
                let mut granted = false;
                for group in self.storage.groups_of_column(column, now).await? {
                    if self
                        .storage
                        .has_column_group_access_rule(
                            &group,
                            &identity.user_group,
                            mode.as_str(),
                            now,
                        )
                        .await?
                    {
                        granted = true;
                        break;
                    }
                }
                if !granted {
                    return Err(AccessDeniedError::new(
                        identity.user_group.clone(),
                        *mode,
                        column.clone(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    fn sign_issuance_context(
        &self,
        identity: &UserIdentity,
        request: &TicketRequest,
        columns: &[String],
        now: TimeStamp,
    ) -> Result<SignedIssuanceContext, AmError> {
        IssuanceContext {
            user: identity.user.clone(),
            user_group: identity.user_group.clone(),
            modes: request.modes.clone(),
            columns: columns.to_vec(),
            timestamp: now,
        }
        .sign(&self.signing_key)
        .map_err(|_| AmError::LibraryError)
    }

    /// Run the two-hop transcryption chain for every pseudonym and every
    /// needed domain, decrypting the Access Manager and Storage Facility
    /// representations at their endpoints.
    async fn transcrypt_pseudonym_entries(
        &self,
        context: &SignedIssuanceContext,
        identity: &UserIdentity,
        pps: &[PolymorphicPseudonym],
        include_access_group: bool,
    ) -> Result<Vec<PseudonymEntry>, AmError> {
        let ciphertexts: Vec<ElgamalCiphertext> =
            pps.iter().map(|pp| *pp.ciphertext()).collect();

        let am_hops = self.hop_all(&ciphertexts, &PseudonymDomain::AccessManager)?;
        let am_encrypted =
            self.transcryptor
                .transcrypt_pseudonyms(context, &am_hops, &PseudonymDomain::AccessManager)?;

        let sf_hops = self.hop_all(&ciphertexts, &PseudonymDomain::StorageFacility)?;
        let sf_encrypted = self.transcryptor.transcrypt_pseudonyms(
            context,
            &sf_hops,
            &PseudonymDomain::StorageFacility,
        )?;
        let sf_pseudonyms = self
            .storage_facility
            .register_pseudonyms(context, &sf_encrypted)?;

        let ag_encrypted = if include_access_group {
            let domain = PseudonymDomain::AccessGroup(identity.user_group.clone());
            let ag_hops = self.hop_all(&ciphertexts, &domain)?;
            Some(
                self.transcryptor
                    .transcrypt_pseudonyms(context, &ag_hops, &domain)?,
            )
        } else {
            None
        };

        let mut entries = Vec::with_capacity(pps.len());
        for (index, pp) in pps.iter().enumerate() {
            let lp_am = LocalPseudonym::from_element(
                am_encrypted[index].decrypt(&self.secrets.pseudonym_decryption_key),
            );
            // First sight of a participant registers its pseudonym pair.
            self.storage.store_participant(&lp_am, pp).await?;
            entries.push(PseudonymEntry {
                polymorphic: *pp,
                access_manager: lp_am,
                storage_facility: sf_pseudonyms[index],
                access_group: ag_encrypted
                    .as_ref()
                    .map(|encrypted| {
                        morphocommon::identifiers::EncryptedLocalPseudonym::from_ciphertext(
                            encrypted[index],
                        )
                    }),
            });
        }
        Ok(entries)
    }

    fn hop_all(
        &self,
        ciphertexts: &[ElgamalCiphertext],
        domain: &PseudonymDomain,
    ) -> Result<Vec<ElgamalCiphertext>, AmError> {
        ciphertexts
            .iter()
            .map(|ciphertext| {
                self.secrets
                    .hop
                    .pseudonym_hop(ciphertext, domain)
                    .map_err(|_| AmError::LibraryError)
            })
            .collect()
    }

    // === Data-key transcryption ===

    /// Apply this party's blinding hop to every entry, then hand the batch
    /// to the Transcryptor for its hop.
    #[instrument(level = "debug", skip_all, fields(entries = request.entries.len()))]
    pub async fn handle_encryption_key_request(
        &self,
        request: &EncryptionKeyRequest,
    ) -> Result<EncryptionKeyResponse, AmError> {
        let ticket = request.ticket.open(&self.roots, self.ticket_validity)?;

        let mut hopped = Vec::with_capacity(request.entries.len());
        for entry in &request.entries {
            let required = match entry.blind_mode {
                BlindMode::Blind => AccessMode::Write,
                BlindMode::Unblind => AccessMode::Read,
            };
            if !ticket.grants_mode(required) {
                return Err(TicketError::NotCovered {
                    mode: required,
                    subject: entry.metadata.tag.clone(),
                }
                .into());
            }
            if ticket.column_index(&entry.metadata.tag).is_none() {
                return Err(TicketError::NotCovered {
                    mode: required,
                    subject: entry.metadata.tag.clone(),
                }
                .into());
            }
            let pseudonym = ticket.pseudonym(entry.pseudonym_index as usize)?;
            let cell = CellBinding {
                column: &entry.metadata.tag,
                pseudonym: &pseudonym.storage_facility,
                blinding_timestamp: entry.metadata.blinding_timestamp,
            };
            let result = match entry.blind_mode {
                BlindMode::Blind => self
                    .secrets
                    .hop
                    .data_key_blind(&entry.polymorph_encryption_key, &cell)?,
                BlindMode::Unblind => self.secrets.hop.data_key_unblind(
                    &entry.polymorph_encryption_key,
                    &cell,
                    &ticket.user_group,
                )?,
            };
            hopped.push((entry.clone(), result));
        }

        let keys = self
            .transcryptor
            .transcrypt_data_keys(&request.ticket, &hopped)?;
        Ok(EncryptionKeyResponse { keys })
    }

    // === Access overviews ===

    #[instrument(level = "debug", skip_all, fields(user = %identity))]
    pub async fn column_access(
        &self,
        identity: &UserIdentity,
        request: &ColumnAccessRequest,
    ) -> Result<ColumnAccessResponse, AmError> {
        let now = TimeStamp::now();
        let memberships = self.storage.column_group_columns(now).await?;

        let mut column_groups: BTreeMap<String, ColumnGroupAccess> = BTreeMap::new();
        for rule in self.storage.column_group_access_rules(now).await? {
            if rule.user_group != identity.user_group {
                continue;
            }
            let Ok(mode) = rule.mode.parse::<AccessMode>() else {
                continue;
            };
            let entry = column_groups
                .entry(rule.column_group.clone())
                .or_insert_with(|| ColumnGroupAccess {
                    modes: Vec::new(),
                    columns: Vec::new(),
                });
            if !entry.modes.contains(&mode) {
                entry.modes.push(mode);
            }
        }

        if request.include_implicit {
            for (user_group, modes) in IMPLICIT_COLUMN_ACCESS {
                if *user_group != identity.user_group {
                    continue;
                }
                for group in self.storage.column_groups(now).await? {
                    let entry = column_groups.entry(group).or_insert_with(|| {
                        ColumnGroupAccess {
                            modes: Vec::new(),
                            columns: Vec::new(),
                        }
                    });
                    for mode in *modes {
                        if !entry.modes.contains(mode) {
                            entry.modes.push(*mode);
                        }
                    }
                }
            }
        }

        if !request.require_modes.is_empty() {
            column_groups.retain(|_, access| {
                request
                    .require_modes
                    .iter()
                    .all(|mode| access.modes.contains(mode))
            });
        }

        let mut all_columns = Vec::new();
        for (group, access) in column_groups.iter_mut() {
            access.modes.sort();
            access.columns = memberships
                .iter()
                .filter(|(g, _)| g == group)
                .map(|(_, c)| c.clone())
                .collect();
            access.columns.sort();
            for column in &access.columns {
                if !all_columns.contains(column) {
                    all_columns.push(column.clone());
                }
            }
        }
        all_columns.sort();

        Ok(ColumnAccessResponse {
            column_groups,
            columns: all_columns,
        })
    }

    #[instrument(level = "debug", skip_all, fields(user = %identity))]
    pub async fn participant_group_access(
        &self,
        identity: &UserIdentity,
        request: &ParticipantGroupAccessRequest,
    ) -> Result<ParticipantGroupAccessResponse, AmError> {
        let now = TimeStamp::now();
        let mut groups: BTreeMap<String, Vec<AccessMode>> = BTreeMap::new();
        for rule in self.storage.participant_group_access_rules(now).await? {
            if rule.user_group != identity.user_group {
                continue;
            }
            let Ok(mode) = rule.mode.parse::<AccessMode>() else {
                continue;
            };
            let modes = groups.entry(rule.participant_group.clone()).or_default();
            if !modes.contains(&mode) {
                modes.push(mode);
            }
        }

        if request.include_implicit {
            for (user_group, implicit_modes) in IMPLICIT_PARTICIPANT_ACCESS {
                if *user_group != identity.user_group {
                    continue;
                }
                for group in self.storage.participant_groups(now).await? {
                    let modes = groups.entry(group).or_default();
                    for mode in *implicit_modes {
                        if !modes.contains(mode) {
                            modes.push(*mode);
                        }
                    }
                }
            }
        }

        for modes in groups.values_mut() {
            modes.sort();
        }
        Ok(ParticipantGroupAccessResponse { groups })
    }

    // === Administration ===

    fn require_admin(&self, identity: &UserIdentity, subject: &str) -> Result<(), AmError> {
        if identity.user_group == ADMIN_USER_GROUP {
            Ok(())
        } else {
            Err(AccessDeniedError::new(
                identity.user_group.clone(),
                AccessMode::Write,
                subject.to_owned(),
            )
            .into())
        }
    }

    pub async fn handle_column_name_mapping(
        &self,
        identity: &UserIdentity,
        request: &ColumnNameMappingRequest,
    ) -> Result<ColumnNameMappingResponse, AmError> {
        let original = || {
            request
                .original
                .clone()
                .ok_or_else(|| AmError::InvalidRequest("missing original column name".to_owned()))
        };
        let mapping = || -> Result<morphocommon::messages::access_manager::ColumnNameMapping, AmError> {
            Ok(morphocommon::messages::access_manager::ColumnNameMapping {
                original: original()?,
                mapped: request.mapped.clone().ok_or_else(|| {
                    AmError::InvalidRequest("missing mapped column name".to_owned())
                })?,
            })
        };

        let mappings = match request.action {
            ColumnNameMappingAction::ReadAll => self.storage.all_column_name_mappings().await?,
            ColumnNameMappingAction::Read => {
                let original = original()?;
                self.storage
                    .column_name_mapping(&original)
                    .await?
                    .into_iter()
                    .collect()
            }
            ColumnNameMappingAction::Create => {
                self.require_admin(identity, "column name mappings")?;
                let mapping = mapping()?;
                self.storage.create_column_name_mapping(&mapping).await?;
                vec![mapping]
            }
            ColumnNameMappingAction::Update => {
                self.require_admin(identity, "column name mappings")?;
                let mapping = mapping()?;
                self.storage.update_column_name_mapping(&mapping).await?;
                vec![mapping]
            }
            ColumnNameMappingAction::Delete => {
                self.require_admin(identity, "column name mappings")?;
                let original = original()?;
                self.storage.delete_column_name_mapping(&original).await?;
                Vec::new()
            }
        };
        Ok(ColumnNameMappingResponse { mappings })
    }

    pub async fn get_structure_metadata(
        &self,
        request: &StructureMetadataRequest,
    ) -> Result<StructureMetadataResponse, AmError> {
        let entries = self
            .storage
            .structure_metadata(
                TimeStamp::now(),
                request.subject_type,
                &request.subjects,
                &request.keys,
            )
            .await?;
        Ok(StructureMetadataResponse { entries })
    }

    pub async fn set_structure_metadata(
        &self,
        identity: &UserIdentity,
        request: &SetStructureMetadataRequest,
    ) -> Result<(), AmError> {
        self.require_admin(identity, "structure metadata")?;
        for entry in &request.entries {
            self.storage
                .set_structure_metadata(
                    request.subject_type,
                    &entry.subject_key.subject,
                    &entry.subject_key.key,
                    &entry.value,
                )
                .await?;
        }
        for subject_key in &request.keys_to_remove {
            self.storage
                .remove_structure_metadata(
                    request.subject_type,
                    &subject_key.subject,
                    &subject_key.key,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn handle_user_mutation(
        &self,
        identity: &UserIdentity,
        request: &UserMutationRequest,
    ) -> Result<(), AmError> {
        self.require_admin(identity, "users")?;
        for mutation in &request.mutations {
            match mutation {
                UserMutation::CreateUser { identifier } => {
                    self.storage.create_user(identifier).await?;
                }
                UserMutation::RemoveUser { identifier } => {
                    self.storage.remove_user(identifier).await?;
                }
                UserMutation::AddIdentifier {
                    user,
                    new_identifier,
                } => {
                    self.storage
                        .add_identifier_for_user(user, new_identifier)
                        .await?;
                }
                UserMutation::RemoveIdentifier { identifier } => {
                    self.storage.remove_identifier_for_user(identifier).await?;
                }
                UserMutation::SetPrimaryIdentifier { identifier } => {
                    self.storage.set_primary_identifier(identifier).await?;
                }
                UserMutation::SetDisplayIdentifier { identifier } => {
                    self.storage.set_display_identifier(identifier).await?;
                }
                UserMutation::CreateUserGroup {
                    name,
                    max_auth_validity_secs,
                } => {
                    self.storage
                        .create_user_group(name, *max_auth_validity_secs)
                        .await?;
                }
                UserMutation::ModifyUserGroup {
                    name,
                    max_auth_validity_secs,
                } => {
                    self.storage
                        .modify_user_group(name, *max_auth_validity_secs)
                        .await?;
                }
                UserMutation::RemoveUserGroup { name } => {
                    self.storage.remove_user_group(name).await?;
                }
                UserMutation::AddUserToGroup { user, group } => {
                    self.storage.add_user_to_group(user, group).await?;
                }
                UserMutation::RemoveUserFromGroup { user, group } => {
                    self.storage.remove_user_from_group(user, group).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn handle_user_query(&self, query: &UserQuery) -> Result<UserQueryResponse, AmError> {
        Ok(self.storage.execute_user_query(query).await?)
    }

    pub async fn find_user(&self, identifiers: &[String]) -> Result<Option<i64>, AmError> {
        let now = TimeStamp::now();
        for identifier in identifiers {
            if let Some(id) = self.storage.find_internal_user_id(identifier, now).await? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}

// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages of the Access Manager: key transcryption, access overviews,
//! column name mappings, structure metadata and user administration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    crypto::elgamal::ElgamalCiphertext,
    messages::storage::Metadata,
    ticketing::{AccessMode, SignedTicket},
    time::TimeStamp,
};

/// Whether a data key is being bound to its cell (at store time) or released
/// toward the requester (at retrieval time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlindMode {
    Blind,
    Unblind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequestEntry {
    pub metadata: Metadata,
    pub polymorph_encryption_key: ElgamalCiphertext,
    pub blind_mode: BlindMode,
    pub pseudonym_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyRequest {
    pub ticket: SignedTicket,
    pub entries: Vec<KeyRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyResponse {
    pub keys: Vec<ElgamalCiphertext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnAccessRequest {
    pub include_implicit: bool,
    /// Only report column groups granting all of these modes. Empty means
    /// no filtering.
    pub require_modes: Vec<AccessMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGroupAccess {
    pub modes: Vec<AccessMode>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnAccessResponse {
    pub column_groups: BTreeMap<String, ColumnGroupAccess>,
    /// Union of the columns of all reported groups.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantGroupAccessRequest {
    pub include_implicit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantGroupAccessResponse {
    pub groups: BTreeMap<String, Vec<AccessMode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnNameMappingAction {
    Read,
    ReadAll,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNameMapping {
    pub original: String,
    pub mapped: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnNameMappingRequest {
    pub action: ColumnNameMappingAction,
    pub original: Option<String>,
    pub mapped: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnNameMappingResponse {
    pub mappings: Vec<ColumnNameMapping>,
}

/// Subjects structure metadata can be attached to. Users and user groups are
/// identified by internal id so that metadata survives renames; the other
/// subjects are identified by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureMetadataSubjectType {
    Column,
    ColumnGroup,
    ParticipantGroup,
    User,
    UserGroup,
}

impl StructureMetadataSubjectType {
    /// Whether subjects of this type are resolved to an internal id before
    /// a metadata record is written.
    pub fn has_internal_id(&self) -> bool {
        matches!(
            self,
            StructureMetadataSubjectType::User | StructureMetadataSubjectType::UserGroup
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StructureMetadataSubjectType::Column => "column",
            StructureMetadataSubjectType::ColumnGroup => "column-group",
            StructureMetadataSubjectType::ParticipantGroup => "participant-group",
            StructureMetadataSubjectType::User => "user",
            StructureMetadataSubjectType::UserGroup => "user-group",
        }
    }
}

impl std::fmt::Display for StructureMetadataSubjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `(metadata_group, subkey)` pair. An empty subkey in a read filter acts
/// as a wildcard over the group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructureMetadataKey {
    pub metadata_group: String,
    pub subkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureMetadataSubjectKey {
    pub subject: String,
    pub key: StructureMetadataKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureMetadataEntry {
    pub subject_key: StructureMetadataSubjectKey,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureMetadataRequest {
    pub subject_type: StructureMetadataSubjectType,
    /// Names of subjects to include. Leave empty to include all subjects.
    pub subjects: Vec<String>,
    /// Metadata keys to include. A key with an empty subkey matches every
    /// subkey of its group.
    pub keys: Vec<StructureMetadataKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureMetadataResponse {
    pub entries: Vec<StructureMetadataEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStructureMetadataRequest {
    pub subject_type: StructureMetadataSubjectType,
    pub entries: Vec<StructureMetadataEntry>,
    pub keys_to_remove: Vec<StructureMetadataSubjectKey>,
}

/// One administrative change to the user model. Each mutation appends
/// exactly one generation of ledger rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UserMutation {
    CreateUser {
        identifier: String,
    },
    RemoveUser {
        identifier: String,
    },
    AddIdentifier {
        user: String,
        new_identifier: String,
    },
    RemoveIdentifier {
        identifier: String,
    },
    SetPrimaryIdentifier {
        identifier: String,
    },
    SetDisplayIdentifier {
        identifier: String,
    },
    CreateUserGroup {
        name: String,
        max_auth_validity_secs: Option<i64>,
    },
    ModifyUserGroup {
        name: String,
        max_auth_validity_secs: Option<i64>,
    },
    RemoveUserGroup {
        name: String,
    },
    AddUserToGroup {
        user: String,
        group: String,
    },
    RemoveUserFromGroup {
        user: String,
        group: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMutationRequest {
    pub mutations: Vec<UserMutation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserQuery {
    /// Point in time to query; `None` means now.
    pub at: Option<TimeStamp>,
    pub group_filter: Option<String>,
    pub user_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentifierInfo {
    pub identifier: String,
    pub is_primary: bool,
    pub is_display: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueriedUser {
    pub internal_id: i64,
    pub identifiers: Vec<UserIdentifierInfo>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueriedUserGroup {
    pub name: String,
    pub max_auth_validity_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQueryResponse {
    pub users: Vec<QueriedUser>,
    pub groups: Vec<QueriedUserGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindUserRequest {
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindUserResponse {
    pub internal_id: Option<i64>,
}

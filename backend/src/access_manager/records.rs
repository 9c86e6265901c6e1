// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The record families of the Access Manager ledger. Every row carries the
//! shared bookkeeping fields (`seqno`, `checksum_nonce`, `timestamp`,
//! `tombstone`) plus the family-specific natural key and values; every
//! record contributes one u64 to its family's checksum chain.

use morphocommon::{
    crypto::hash::hash_parts,
    identifiers::LocalPseudonym,
    time::TimeStamp,
};
use rand::RngCore as _;

pub(super) const CHECKSUM_NONCE_SIZE: usize = 16;

/// Shared bookkeeping fields of every ledger row. `seqno` is assigned by the
/// database on append and strictly increases per family.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub seqno: i64,
    pub checksum_nonce: Vec<u8>,
    pub timestamp: TimeStamp,
    pub tombstone: bool,
}

impl RecordMeta {
    /// Bookkeeping for a fresh append. The seqno is a placeholder until the
    /// database assigns the real one.
    pub(super) fn fresh(tombstone: bool) -> Self {
        let mut checksum_nonce = vec![0u8; CHECKSUM_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut checksum_nonce);
        Self {
            seqno: 0,
            checksum_nonce,
            timestamp: TimeStamp::now(),
            tombstone,
        }
    }
}

fn record_checksum(table: &str, meta: &RecordMeta, fields: &[&[u8]]) -> u64 {
    let mut parts: Vec<&[u8]> = vec![meta.checksum_nonce.as_slice()];
    parts.extend_from_slice(fields);
    let tombstone = [meta.tombstone as u8];
    parts.push(&tombstone);
    let digest = hash_parts(table, &parts);
    let mut folded = [0u8; 8];
    folded.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(folded)
}

macro_rules! named_record {
    ($record:ident, $table:literal) => {
        #[derive(Debug, Clone)]
        pub struct $record {
            pub meta: RecordMeta,
            pub name: String,
        }

        impl $record {
            pub fn checksum(&self) -> u64 {
                record_checksum($table, &self.meta, &[self.name.as_bytes()])
            }
        }
    };
}

named_record!(ColumnRecord, "columns");
named_record!(ColumnGroupRecord, "column_groups");
named_record!(ParticipantGroupRecord, "participant_groups");

#[derive(Debug, Clone)]
pub struct ColumnGroupColumnRecord {
    pub meta: RecordMeta,
    pub column_group: String,
    pub column: String,
}

impl ColumnGroupColumnRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "column_group_columns",
            &self.meta,
            &[self.column_group.as_bytes(), self.column.as_bytes()],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ColumnGroupAccessRuleRecord {
    pub meta: RecordMeta,
    pub column_group: String,
    pub user_group: String,
    pub mode: String,
}

impl ColumnGroupAccessRuleRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "column_group_access_rules",
            &self.meta,
            &[
                self.column_group.as_bytes(),
                self.user_group.as_bytes(),
                self.mode.as_bytes(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantGroupParticipantRecord {
    pub meta: RecordMeta,
    pub participant_group: String,
    pub local_pseudonym: LocalPseudonym,
}

impl ParticipantGroupParticipantRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "participant_group_participants",
            &self.meta,
            &[
                self.participant_group.as_bytes(),
                &self.local_pseudonym.pack(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantGroupAccessRuleRecord {
    pub meta: RecordMeta,
    pub participant_group: String,
    pub user_group: String,
    pub mode: String,
}

impl ParticipantGroupAccessRuleRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "participant_group_access_rules",
            &self.meta,
            &[
                self.participant_group.as_bytes(),
                self.user_group.as_bytes(),
                self.mode.as_bytes(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ColumnNameMappingRecord {
    pub meta: RecordMeta,
    pub original: String,
    pub mapped: String,
}

impl ColumnNameMappingRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "column_name_mappings",
            &self.meta,
            &[self.original.as_bytes(), self.mapped.as_bytes()],
        )
    }
}

/// One participant known to the Access Manager: its stable local pseudonym
/// and one (rerandomised) polymorphic pseudonym to resolve group members
/// from.
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub meta: RecordMeta,
    pub local_pseudonym: LocalPseudonym,
    /// Codec-encoded polymorphic pseudonym.
    pub polymorphic_pseudonym: Vec<u8>,
}

impl ParticipantRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "participants",
            &self.meta,
            &[&self.local_pseudonym.pack(), &self.polymorphic_pseudonym],
        )
    }
}

#[derive(Debug, Clone)]
pub struct UserIdRecord {
    pub meta: RecordMeta,
    pub internal_user_id: i64,
    pub identifier: String,
    pub is_primary: bool,
    pub is_display: bool,
}

impl UserIdRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "user_ids",
            &self.meta,
            &[
                &self.internal_user_id.to_be_bytes(),
                self.identifier.as_bytes(),
                &[self.is_primary as u8],
                &[self.is_display as u8],
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct UserGroupRecord {
    pub meta: RecordMeta,
    pub user_group_id: i64,
    pub name: String,
    pub max_auth_validity_secs: Option<i64>,
}

impl UserGroupRecord {
    pub fn checksum(&self) -> u64 {
        let validity = self.max_auth_validity_secs.unwrap_or(-1).to_be_bytes();
        record_checksum(
            "user_groups",
            &self.meta,
            &[
                &self.user_group_id.to_be_bytes(),
                self.name.as_bytes(),
                &validity,
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct UserGroupUserRecord {
    pub meta: RecordMeta,
    pub internal_user_id: i64,
    pub user_group_id: i64,
}

impl UserGroupUserRecord {
    pub fn checksum(&self) -> u64 {
        record_checksum(
            "user_group_users",
            &self.meta,
            &[
                &self.internal_user_id.to_be_bytes(),
                &self.user_group_id.to_be_bytes(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct StructureMetadataRecord {
    pub meta: RecordMeta,
    pub subject_type: String,
    /// Subject name; for subjects with an internal id this is the name used
    /// when the entry was first created.
    pub subject: String,
    pub internal_subject_id: Option<i64>,
    pub metadata_group: String,
    pub subkey: String,
    pub value: Vec<u8>,
}

impl StructureMetadataRecord {
    pub fn checksum(&self) -> u64 {
        let internal = self.internal_subject_id.unwrap_or(-1).to_be_bytes();
        record_checksum(
            "structure_metadata",
            &self.meta,
            &[
                self.subject_type.as_bytes(),
                self.subject.as_bytes(),
                &internal,
                self.metadata_group.as_bytes(),
                self.subkey.as_bytes(),
                &self.value,
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use morphocommon::crypto::group::GroupElement;

    use super::*;

    #[test]
    fn checksum_covers_tombstone_flag() {
        let meta = RecordMeta::fresh(false);
        let record = ColumnRecord {
            meta: meta.clone(),
            name: "ParticipantInfo".to_owned(),
        };
        let mut tombstoned = record.clone();
        tombstoned.meta.tombstone = true;
        assert_ne!(record.checksum(), tombstoned.checksum());
    }

    #[test]
    fn checksum_covers_fields_and_nonce() {
        let record = ColumnRecord {
            meta: RecordMeta::fresh(false),
            name: "ParticipantInfo".to_owned(),
        };
        let mut renamed = record.clone();
        renamed.name = "OtherColumn".to_owned();
        assert_ne!(record.checksum(), renamed.checksum());

        // A fresh nonce changes the checksum even for identical fields.
        let other_nonce = ColumnRecord {
            meta: RecordMeta::fresh(false),
            name: "ParticipantInfo".to_owned(),
        };
        assert_ne!(record.checksum(), other_nonce.checksum());
    }

    #[test]
    fn families_are_domain_separated() {
        let meta = RecordMeta::fresh(false);
        let column = ColumnRecord {
            meta: meta.clone(),
            name: "Name".to_owned(),
        };
        let group = ColumnGroupRecord {
            meta,
            name: "Name".to_owned(),
        };
        assert_ne!(column.checksum(), group.checksum());
    }

    #[test]
    fn participant_record_checksum_is_stable() {
        let lp = LocalPseudonym::from_element(GroupElement::hash(b"p"));
        let record = ParticipantGroupParticipantRecord {
            meta: RecordMeta::fresh(false),
            participant_group: "G".to_owned(),
            local_pseudonym: lp,
        };
        assert_eq!(record.checksum(), record.checksum());
    }
}

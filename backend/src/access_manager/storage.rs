// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The append-only ledger of the Access Manager. Every write appends a row;
//! nothing is ever updated in place. The "current" state at a time `t` is a
//! projection: per natural key, the newest row with `timestamp <= t`, which
//! must not be a tombstone.

use std::collections::{BTreeMap, BTreeSet};

use morphocommon::{
    codec,
    identifiers::{LocalPseudonym, PolymorphicPseudonym},
    messages::access_manager::ColumnNameMapping,
    time::TimeStamp,
};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqlitePoolOptions, SqliteRow},
};
use tracing::info;

use crate::errors::StorageError;

use super::records::{
    ColumnGroupAccessRuleRecord, ColumnGroupColumnRecord, ColumnGroupRecord,
    ColumnNameMappingRecord, ColumnRecord, ParticipantGroupAccessRuleRecord,
    ParticipantGroupParticipantRecord, ParticipantGroupRecord, ParticipantRecord, RecordMeta,
    StructureMetadataRecord, UserGroupRecord, UserGroupUserRecord, UserIdRecord,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS columns (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS column_groups (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS column_group_columns (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    column_group TEXT NOT NULL,
    column_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS column_group_access_rules (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    column_group TEXT NOT NULL,
    user_group TEXT NOT NULL,
    mode TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participant_groups (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participant_group_participants (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    participant_group TEXT NOT NULL,
    local_pseudonym BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS participant_group_access_rules (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    participant_group TEXT NOT NULL,
    user_group TEXT NOT NULL,
    mode TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS column_name_mappings (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    original TEXT NOT NULL,
    mapped TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    local_pseudonym BLOB NOT NULL,
    polymorphic_pseudonym BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS user_ids (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    internal_user_id INTEGER NOT NULL,
    identifier TEXT NOT NULL,
    is_primary INTEGER NOT NULL,
    is_display INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS user_groups (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    user_group_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    max_auth_validity_secs INTEGER
);
CREATE TABLE IF NOT EXISTS user_group_users (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    internal_user_id INTEGER NOT NULL,
    user_group_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS structure_metadata (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum_nonce BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    subject_type TEXT NOT NULL,
    subject TEXT NOT NULL,
    internal_subject_id INTEGER,
    metadata_group TEXT NOT NULL,
    subkey TEXT NOT NULL,
    value BLOB NOT NULL
);
";

/// Names of the checksum chains, one per record family.
pub const CHECKSUM_CHAINS: [&str; 13] = [
    "columns",
    "column_groups",
    "column_group_columns",
    "column_group_access_rules",
    "participant_groups",
    "participant_group_participants",
    "participant_group_access_rules",
    "column_name_mappings",
    "participants",
    "user_ids",
    "user_groups",
    "user_group_users",
    "structure_metadata",
];

/// Hex-prefix length of the user-facing short pseudonym derived from a local
/// pseudonym.
pub const SHORT_PSEUDONYM_PREFIX_LEN: usize = 16;

/// Handle to the Access Manager ledger. Writes are serialised through the
/// single connection of the pool; readers observe committed snapshots.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

pub(super) fn meta_from_row(row: &SqliteRow) -> Result<RecordMeta, StorageError> {
    Ok(RecordMeta {
        seqno: row.try_get("seqno")?,
        checksum_nonce: row.try_get("checksum_nonce")?,
        timestamp: row.try_get("timestamp")?,
        tombstone: row.try_get("tombstone")?,
    })
}

impl Storage {
    pub async fn new_in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn open(path: &str) -> Result<Self, StorageError> {
        Self::connect(&format!("sqlite://{path}?mode=rwc")).await
    }

    async fn connect(url: &str) -> Result<Self, StorageError> {
        // A single connection keeps the append-only writes serialised (and
        // keeps an in-memory database alive).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!("Access Manager ledger ready");
        Ok(Self { pool })
    }

    pub(super) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Direct pool access for harness-level tests that need to tamper with
    /// rows.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn raw_pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === Columns ===

    pub async fn has_column(&self, name: &str, at: TimeStamp) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM columns WHERE name = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn create_column(&self, name: &str) -> Result<(), StorageError> {
        if self.has_column(name, TimeStamp::now()).await? {
            return Err(StorageError::Conflict(format!("column {name:?}")));
        }
        self.append_named("columns", name, false).await
    }

    /// Tombstone a column and every group membership and access rule that
    /// refers to it.
    pub async fn remove_column(&self, name: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_column(name, now).await? {
            return Err(StorageError::NotFound(format!("column {name:?}")));
        }
        self.append_named("columns", name, true).await?;
        for (group, column) in self.column_group_columns(now).await? {
            if column == name {
                self.append_column_group_column(&group, &column, true).await?;
            }
        }
        Ok(())
    }

    pub async fn columns(&self, at: TimeStamp) -> Result<BTreeSet<String>, StorageError> {
        self.current_names("columns", at).await
    }

    // === Column groups ===

    pub async fn has_column_group(&self, name: &str, at: TimeStamp) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM column_groups WHERE name = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn create_column_group(&self, name: &str) -> Result<(), StorageError> {
        if self.has_column_group(name, TimeStamp::now()).await? {
            return Err(StorageError::Conflict(format!("column group {name:?}")));
        }
        self.append_named("column_groups", name, false).await
    }

    /// Tombstone a column group. Without `force` the group must have no
    /// member columns and no access rules.
    pub async fn remove_column_group(&self, name: &str, force: bool) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_column_group(name, now).await? {
            return Err(StorageError::NotFound(format!("column group {name:?}")));
        }
        let members: Vec<_> = self
            .column_group_columns(now)
            .await?
            .into_iter()
            .filter(|(group, _)| group == name)
            .collect();
        let rules: Vec<_> = self
            .column_group_access_rules(now)
            .await?
            .into_iter()
            .filter(|rule| rule.column_group == name)
            .collect();
        if !force && (!members.is_empty() || !rules.is_empty()) {
            return Err(StorageError::Conflict(format!(
                "column group {name:?} still has members or access rules"
            )));
        }
        self.append_named("column_groups", name, true).await?;
        for (group, column) in members {
            self.append_column_group_column(&group, &column, true).await?;
        }
        for rule in rules {
            self.append_column_group_access_rule(
                &rule.column_group,
                &rule.user_group,
                &rule.mode,
                true,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn column_groups(&self, at: TimeStamp) -> Result<BTreeSet<String>, StorageError> {
        self.current_names("column_groups", at).await
    }

    // === Column group membership ===

    pub async fn has_column_in_group(
        &self,
        column: &str,
        group: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM column_group_columns
             WHERE column_group = ?1 AND column_name = ?2 AND timestamp <= ?3
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(group)
        .bind(column)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn add_column_to_group(&self, column: &str, group: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_column(column, now).await? {
            return Err(StorageError::NotFound(format!("column {column:?}")));
        }
        if !self.has_column_group(group, now).await? {
            return Err(StorageError::NotFound(format!("column group {group:?}")));
        }
        if self.has_column_in_group(column, group, now).await? {
            return Err(StorageError::Conflict(format!(
                "column {column:?} in group {group:?}"
            )));
        }
        self.append_column_group_column(group, column, false).await
    }

    pub async fn remove_column_from_group(
        &self,
        column: &str,
        group: &str,
    ) -> Result<(), StorageError> {
        if !self
            .has_column_in_group(column, group, TimeStamp::now())
            .await?
        {
            return Err(StorageError::NotFound(format!(
                "column {column:?} in group {group:?}"
            )));
        }
        self.append_column_group_column(group, column, true).await
    }

    /// All current `(column_group, column)` memberships at `at`.
    pub async fn column_group_columns(
        &self,
        at: TimeStamp,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let rows = sqlx::query(
            "SELECT column_group, column_name FROM column_group_columns c
             WHERE timestamp <= ?1 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM column_group_columns c2
                            WHERE c2.column_group = c.column_group
                              AND c2.column_name = c.column_name
                              AND c2.timestamp <= ?1)",
        )
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("column_group")?,
                    row.try_get::<String, _>("column_name")?,
                ))
            })
            .collect()
    }

    // === Column group access rules ===

    pub async fn has_column_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM column_group_access_rules
             WHERE column_group = ?1 AND user_group = ?2 AND mode = ?3 AND timestamp <= ?4
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(group)
        .bind(user_group)
        .bind(mode)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn create_column_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_column_group(group, now).await? {
            return Err(StorageError::NotFound(format!("column group {group:?}")));
        }
        if self
            .has_column_group_access_rule(group, user_group, mode, now)
            .await?
        {
            return Err(StorageError::Conflict(format!(
                "access rule ({group:?}, {user_group:?}, {mode:?})"
            )));
        }
        self.append_column_group_access_rule(group, user_group, mode, false)
            .await
    }

    pub async fn remove_column_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
    ) -> Result<(), StorageError> {
        if !self
            .has_column_group_access_rule(group, user_group, mode, TimeStamp::now())
            .await?
        {
            return Err(StorageError::NotFound(format!(
                "access rule ({group:?}, {user_group:?}, {mode:?})"
            )));
        }
        self.append_column_group_access_rule(group, user_group, mode, true)
            .await
    }

    pub async fn column_group_access_rules(
        &self,
        at: TimeStamp,
    ) -> Result<Vec<ColumnGroupAccessRuleRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM column_group_access_rules r
             WHERE timestamp <= ?1 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM column_group_access_rules r2
                            WHERE r2.column_group = r.column_group
                              AND r2.user_group = r.user_group
                              AND r2.mode = r.mode
                              AND r2.timestamp <= ?1)",
        )
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ColumnGroupAccessRuleRecord {
                    meta: meta_from_row(row)?,
                    column_group: row.try_get("column_group")?,
                    user_group: row.try_get("user_group")?,
                    mode: row.try_get("mode")?,
                })
            })
            .collect()
    }

    // === Participant groups ===

    pub async fn has_participant_group(
        &self,
        name: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM participant_groups WHERE name = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn create_participant_group(&self, name: &str) -> Result<(), StorageError> {
        if self.has_participant_group(name, TimeStamp::now()).await? {
            return Err(StorageError::Conflict(format!("participant group {name:?}")));
        }
        self.append_named("participant_groups", name, false).await
    }

    pub async fn remove_participant_group(
        &self,
        name: &str,
        force: bool,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_participant_group(name, now).await? {
            return Err(StorageError::NotFound(format!("participant group {name:?}")));
        }
        let members = self.participant_group_participants(name, now).await?;
        let rules: Vec<_> = self
            .participant_group_access_rules(now)
            .await?
            .into_iter()
            .filter(|rule| rule.participant_group == name)
            .collect();
        if !force && (!members.is_empty() || !rules.is_empty()) {
            return Err(StorageError::Conflict(format!(
                "participant group {name:?} still has members or access rules"
            )));
        }
        self.append_named("participant_groups", name, true).await?;
        for lp in members {
            self.append_participant_group_participant(name, &lp, true)
                .await?;
        }
        for rule in rules {
            self.append_participant_group_access_rule(
                &rule.participant_group,
                &rule.user_group,
                &rule.mode,
                true,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn participant_groups(&self, at: TimeStamp) -> Result<BTreeSet<String>, StorageError> {
        self.current_names("participant_groups", at).await
    }

    // === Participant group membership ===

    pub async fn has_participant_in_group(
        &self,
        lp: &LocalPseudonym,
        group: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM participant_group_participants
             WHERE participant_group = ?1 AND local_pseudonym = ?2 AND timestamp <= ?3
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(group)
        .bind(lp)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn add_participant_to_group(
        &self,
        lp: &LocalPseudonym,
        group: &str,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_participant_group(group, now).await? {
            return Err(StorageError::NotFound(format!("participant group {group:?}")));
        }
        if self.has_participant_in_group(lp, group, now).await? {
            return Err(StorageError::Conflict(format!(
                "participant in group {group:?}"
            )));
        }
        self.append_participant_group_participant(group, lp, false)
            .await
    }

    pub async fn remove_participant_from_group(
        &self,
        lp: &LocalPseudonym,
        group: &str,
    ) -> Result<(), StorageError> {
        if !self
            .has_participant_in_group(lp, group, TimeStamp::now())
            .await?
        {
            return Err(StorageError::NotFound(format!(
                "participant in group {group:?}"
            )));
        }
        self.append_participant_group_participant(group, lp, true)
            .await
    }

    /// Current members of one participant group at `at`.
    pub async fn participant_group_participants(
        &self,
        group: &str,
        at: TimeStamp,
    ) -> Result<Vec<LocalPseudonym>, StorageError> {
        let rows = sqlx::query(
            "SELECT local_pseudonym FROM participant_group_participants p
             WHERE participant_group = ?1 AND timestamp <= ?2 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM participant_group_participants p2
                            WHERE p2.participant_group = p.participant_group
                              AND p2.local_pseudonym = p.local_pseudonym
                              AND p2.timestamp <= ?2)",
        )
        .bind(group)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<LocalPseudonym, _>("local_pseudonym")?))
            .collect()
    }

    // === Participant group access rules ===

    pub async fn has_participant_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM participant_group_access_rules
             WHERE participant_group = ?1 AND user_group = ?2 AND mode = ?3 AND timestamp <= ?4
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(group)
        .bind(user_group)
        .bind(mode)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    pub async fn create_participant_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.has_participant_group(group, now).await? {
            return Err(StorageError::NotFound(format!("participant group {group:?}")));
        }
        if self
            .has_participant_group_access_rule(group, user_group, mode, now)
            .await?
        {
            return Err(StorageError::Conflict(format!(
                "access rule ({group:?}, {user_group:?}, {mode:?})"
            )));
        }
        self.append_participant_group_access_rule(group, user_group, mode, false)
            .await
    }

    pub async fn remove_participant_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
    ) -> Result<(), StorageError> {
        if !self
            .has_participant_group_access_rule(group, user_group, mode, TimeStamp::now())
            .await?
        {
            return Err(StorageError::NotFound(format!(
                "access rule ({group:?}, {user_group:?}, {mode:?})"
            )));
        }
        self.append_participant_group_access_rule(group, user_group, mode, true)
            .await
    }

    pub async fn participant_group_access_rules(
        &self,
        at: TimeStamp,
    ) -> Result<Vec<ParticipantGroupAccessRuleRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM participant_group_access_rules r
             WHERE timestamp <= ?1 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM participant_group_access_rules r2
                            WHERE r2.participant_group = r.participant_group
                              AND r2.user_group = r.user_group
                              AND r2.mode = r.mode
                              AND r2.timestamp <= ?1)",
        )
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ParticipantGroupAccessRuleRecord {
                    meta: meta_from_row(row)?,
                    participant_group: row.try_get("participant_group")?,
                    user_group: row.try_get("user_group")?,
                    mode: row.try_get("mode")?,
                })
            })
            .collect()
    }

    // === Column name mappings ===

    pub async fn column_name_mapping(
        &self,
        original: &str,
    ) -> Result<Option<ColumnNameMapping>, StorageError> {
        let row = sqlx::query(
            "SELECT mapped, tombstone FROM column_name_mappings
             WHERE original = ?1 ORDER BY seqno DESC LIMIT 1",
        )
        .bind(original)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) if !row.try_get::<bool, _>("tombstone")? => Ok(Some(ColumnNameMapping {
                original: original.to_owned(),
                mapped: row.try_get("mapped")?,
            })),
            _ => Ok(None),
        }
    }

    pub async fn all_column_name_mappings(&self) -> Result<Vec<ColumnNameMapping>, StorageError> {
        let rows = sqlx::query(
            "SELECT original, mapped FROM column_name_mappings m
             WHERE tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM column_name_mappings m2
                            WHERE m2.original = m.original)",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ColumnNameMapping {
                    original: row.try_get("original")?,
                    mapped: row.try_get("mapped")?,
                })
            })
            .collect()
    }

    pub async fn create_column_name_mapping(
        &self,
        mapping: &ColumnNameMapping,
    ) -> Result<(), StorageError> {
        if self.column_name_mapping(&mapping.original).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "column name mapping for {:?}",
                mapping.original
            )));
        }
        // 1:1 aliasing: the mapped name must not be in use either.
        let in_use = self
            .all_column_name_mappings()
            .await?
            .into_iter()
            .any(|existing| existing.mapped == mapping.mapped);
        if in_use {
            return Err(StorageError::Conflict(format!(
                "column name mapping onto {:?}",
                mapping.mapped
            )));
        }
        self.append_column_name_mapping(&mapping.original, &mapping.mapped, false)
            .await
    }

    pub async fn update_column_name_mapping(
        &self,
        mapping: &ColumnNameMapping,
    ) -> Result<(), StorageError> {
        if self.column_name_mapping(&mapping.original).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "column name mapping for {:?}",
                mapping.original
            )));
        }
        self.append_column_name_mapping(&mapping.original, &mapping.mapped, false)
            .await
    }

    pub async fn delete_column_name_mapping(&self, original: &str) -> Result<(), StorageError> {
        let Some(current) = self.column_name_mapping(original).await? else {
            return Err(StorageError::NotFound(format!(
                "column name mapping for {original:?}"
            )));
        };
        self.append_column_name_mapping(original, &current.mapped, true)
            .await
    }

    // === Participant registry ===

    pub async fn has_local_pseudonym(&self, lp: &LocalPseudonym) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM participants WHERE local_pseudonym = ?1
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(lp)
        .fetch_optional(&self.pool)
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    /// Register a participant on first sight. The short-pseudonym prefix of
    /// the local pseudonym must not collide with an already-registered
    /// participant.
    pub async fn store_participant(
        &self,
        lp: &LocalPseudonym,
        pp: &PolymorphicPseudonym,
    ) -> Result<(), StorageError> {
        if self.has_local_pseudonym(lp).await? {
            return Ok(());
        }
        let prefix = &lp.hex()[..SHORT_PSEUDONYM_PREFIX_LEN];
        for known in self.local_pseudonyms().await? {
            if &known.hex()[..SHORT_PSEUDONYM_PREFIX_LEN] == prefix {
                return Err(StorageError::Conflict(format!(
                    "short pseudonym prefix {prefix}"
                )));
            }
        }
        let record = ParticipantRecord {
            meta: RecordMeta::fresh(false),
            local_pseudonym: *lp,
            polymorphic_pseudonym: codec::to_vec(pp)?,
        };
        sqlx::query(
            "INSERT INTO participants
             (checksum_nonce, timestamp, tombstone, local_pseudonym, polymorphic_pseudonym)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&record.meta.checksum_nonce)
        .bind(record.meta.timestamp)
        .bind(record.meta.tombstone)
        .bind(&record.local_pseudonym)
        .bind(&record.polymorphic_pseudonym)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn local_pseudonyms(&self) -> Result<Vec<LocalPseudonym>, StorageError> {
        let rows = sqlx::query(
            "SELECT local_pseudonym FROM participants p
             WHERE tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM participants p2
                            WHERE p2.local_pseudonym = p.local_pseudonym)",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<LocalPseudonym, _>("local_pseudonym")?))
            .collect()
    }

    pub async fn polymorphic_pseudonym(
        &self,
        lp: &LocalPseudonym,
    ) -> Result<PolymorphicPseudonym, StorageError> {
        let row = sqlx::query(
            "SELECT polymorphic_pseudonym, tombstone FROM participants
             WHERE local_pseudonym = ?1 ORDER BY seqno DESC LIMIT 1",
        )
        .bind(lp)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(StorageError::NotFound("participant".to_owned()));
        };
        if row.try_get::<bool, _>("tombstone")? {
            return Err(StorageError::NotFound("participant".to_owned()));
        }
        let bytes: Vec<u8> = row.try_get("polymorphic_pseudonym")?;
        Ok(codec::from_slice(&bytes)?)
    }

    // === Checksum chains ===

    pub fn checksum_chain_names(&self) -> Vec<String> {
        CHECKSUM_CHAINS.iter().map(|s| s.to_string()).collect()
    }

    /// Compute the running checksum of one chain over every row with
    /// `seqno <= max_checkpoint` (or all rows if unset). Returns the
    /// checksum and the checkpoint actually covered.
    pub async fn compute_checksum(
        &self,
        chain: &str,
        max_checkpoint: Option<u64>,
    ) -> Result<(u64, u64), StorageError> {
        if !CHECKSUM_CHAINS.contains(&chain) {
            return Err(StorageError::NotFound(format!("checksum chain {chain:?}")));
        }
        let limit = max_checkpoint.map(|cp| cp as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT * FROM {chain} WHERE seqno <= ?1 ORDER BY seqno"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut checksum = 0u64;
        let mut checkpoint = 0u64;
        for row in &rows {
            let meta = meta_from_row(row)?;
            checkpoint = checkpoint.max(meta.seqno as u64);
            checksum ^= self.row_checksum(chain, row, meta)?;
        }
        Ok((checksum, checkpoint))
    }

    fn row_checksum(
        &self,
        chain: &str,
        row: &SqliteRow,
        meta: RecordMeta,
    ) -> Result<u64, StorageError> {
        let checksum = match chain {
            "columns" => ColumnRecord {
                meta,
                name: row.try_get("name")?,
            }
            .checksum(),
            "column_groups" => ColumnGroupRecord {
                meta,
                name: row.try_get("name")?,
            }
            .checksum(),
            "column_group_columns" => ColumnGroupColumnRecord {
                meta,
                column_group: row.try_get("column_group")?,
                column: row.try_get("column_name")?,
            }
            .checksum(),
            "column_group_access_rules" => ColumnGroupAccessRuleRecord {
                meta,
                column_group: row.try_get("column_group")?,
                user_group: row.try_get("user_group")?,
                mode: row.try_get("mode")?,
            }
            .checksum(),
            "participant_groups" => ParticipantGroupRecord {
                meta,
                name: row.try_get("name")?,
            }
            .checksum(),
            "participant_group_participants" => ParticipantGroupParticipantRecord {
                meta,
                participant_group: row.try_get("participant_group")?,
                local_pseudonym: row.try_get("local_pseudonym")?,
            }
            .checksum(),
            "participant_group_access_rules" => ParticipantGroupAccessRuleRecord {
                meta,
                participant_group: row.try_get("participant_group")?,
                user_group: row.try_get("user_group")?,
                mode: row.try_get("mode")?,
            }
            .checksum(),
            "column_name_mappings" => ColumnNameMappingRecord {
                meta,
                original: row.try_get("original")?,
                mapped: row.try_get("mapped")?,
            }
            .checksum(),
            "participants" => ParticipantRecord {
                meta,
                local_pseudonym: row.try_get("local_pseudonym")?,
                polymorphic_pseudonym: row.try_get("polymorphic_pseudonym")?,
            }
            .checksum(),
            "user_ids" => UserIdRecord {
                meta,
                internal_user_id: row.try_get("internal_user_id")?,
                identifier: row.try_get("identifier")?,
                is_primary: row.try_get("is_primary")?,
                is_display: row.try_get("is_display")?,
            }
            .checksum(),
            "user_groups" => UserGroupRecord {
                meta,
                user_group_id: row.try_get("user_group_id")?,
                name: row.try_get("name")?,
                max_auth_validity_secs: row.try_get("max_auth_validity_secs")?,
            }
            .checksum(),
            "user_group_users" => UserGroupUserRecord {
                meta,
                internal_user_id: row.try_get("internal_user_id")?,
                user_group_id: row.try_get("user_group_id")?,
            }
            .checksum(),
            "structure_metadata" => StructureMetadataRecord {
                meta,
                subject_type: row.try_get("subject_type")?,
                subject: row.try_get("subject")?,
                internal_subject_id: row.try_get("internal_subject_id")?,
                metadata_group: row.try_get("metadata_group")?,
                subkey: row.try_get("subkey")?,
                value: row.try_get("value")?,
            }
            .checksum(),
            _ => return Err(StorageError::NotFound(format!("checksum chain {chain:?}"))),
        };
        Ok(checksum)
    }

    // === Append helpers ===

    async fn append_named(
        &self,
        table: &'static str,
        name: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(&format!(
            "INSERT INTO {table} (checksum_nonce, timestamp, tombstone, name)
             VALUES (?1, ?2, ?3, ?4)"
        ))
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_column_group_column(
        &self,
        group: &str,
        column: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO column_group_columns
             (checksum_nonce, timestamp, tombstone, column_group, column_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(group)
        .bind(column)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_column_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO column_group_access_rules
             (checksum_nonce, timestamp, tombstone, column_group, user_group, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(group)
        .bind(user_group)
        .bind(mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_participant_group_participant(
        &self,
        group: &str,
        lp: &LocalPseudonym,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO participant_group_participants
             (checksum_nonce, timestamp, tombstone, participant_group, local_pseudonym)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(group)
        .bind(lp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_participant_group_access_rule(
        &self,
        group: &str,
        user_group: &str,
        mode: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO participant_group_access_rules
             (checksum_nonce, timestamp, tombstone, participant_group, user_group, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(group)
        .bind(user_group)
        .bind(mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_column_name_mapping(
        &self,
        original: &str,
        mapped: &str,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO column_name_mappings
             (checksum_nonce, timestamp, tombstone, original, mapped)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(original)
        .bind(mapped)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_names(
        &self,
        table: &'static str,
        at: TimeStamp,
    ) -> Result<BTreeSet<String>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT name FROM {table} t
             WHERE timestamp <= ?1 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM {table} t2
                            WHERE t2.name = t.name AND t2.timestamp <= ?1)"
        ))
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("name")?))
            .collect()
    }

    /// Expand the given column groups into their member columns at `at`,
    /// keyed by group name, with each group's columns sorted by name. The
    /// caller decides the overall ordering (ticket issuance walks the
    /// requested groups in request order).
    pub async fn expand_column_groups(
        &self,
        groups: &[String],
        at: TimeStamp,
    ) -> Result<BTreeMap<String, Vec<String>>, StorageError> {
        let mut expansion = BTreeMap::new();
        let memberships = self.column_group_columns(at).await?;
        for group in groups {
            if !self.has_column_group(group, at).await? {
                return Err(StorageError::NotFound(format!("column group {group:?}")));
            }
            let mut columns: Vec<String> = memberships
                .iter()
                .filter(|(g, _)| g == group)
                .map(|(_, c)| c.clone())
                .collect();
            columns.sort();
            expansion.insert(group.clone(), columns);
        }
        Ok(expansion)
    }

    /// The column groups containing `column` at `at`.
    pub async fn groups_of_column(
        &self,
        column: &str,
        at: TimeStamp,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .column_group_columns(at)
            .await?
            .into_iter()
            .filter(|(_, c)| c == column)
            .map(|(g, _)| g)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use morphocommon::crypto::{elgamal::ElgamalPrivateKey, group::GroupElement};
    use morphocommon::identifiers::ParticipantIdentifier;

    async fn storage() -> Storage {
        Storage::new_in_memory().await.unwrap()
    }

    fn lp(seed: &[u8]) -> LocalPseudonym {
        LocalPseudonym::from_element(GroupElement::hash(seed))
    }

    #[tokio::test]
    async fn column_lifecycle() {
        let storage = storage().await;
        storage.create_column("ParticipantInfo").await.unwrap();
        assert!(storage
            .has_column("ParticipantInfo", TimeStamp::now())
            .await
            .unwrap());

        // Creating again conflicts.
        assert!(matches!(
            storage.create_column("ParticipantInfo").await,
            Err(StorageError::Conflict(_))
        ));

        storage.remove_column("ParticipantInfo").await.unwrap();
        assert!(!storage
            .has_column("ParticipantInfo", TimeStamp::now())
            .await
            .unwrap());

        // Recreating after removal works; the ledger keeps all three rows.
        storage.create_column("ParticipantInfo").await.unwrap();
        assert!(storage
            .has_column("ParticipantInfo", TimeStamp::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn current_state_is_a_snapshot_per_timestamp() {
        let storage = storage().await;
        storage.create_column("A").await.unwrap();
        let before_removal = TimeStamp::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage.remove_column("A").await.unwrap();

        assert!(storage.has_column("A", before_removal).await.unwrap());
        assert!(!storage.has_column("A", TimeStamp::now()).await.unwrap());
    }

    #[tokio::test]
    async fn removing_a_column_cascades_to_memberships() {
        let storage = storage().await;
        storage.create_column("A").await.unwrap();
        storage.create_column_group("G").await.unwrap();
        storage.add_column_to_group("A", "G").await.unwrap();

        storage.remove_column("A").await.unwrap();
        assert!(!storage
            .has_column_in_group("A", "G", TimeStamp::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn removing_a_group_without_force_requires_it_to_be_empty() {
        let storage = storage().await;
        storage.create_column("A").await.unwrap();
        storage.create_column_group("G").await.unwrap();
        storage.add_column_to_group("A", "G").await.unwrap();

        assert!(matches!(
            storage.remove_column_group("G", false).await,
            Err(StorageError::Conflict(_))
        ));
        storage.remove_column_group("G", true).await.unwrap();
        assert!(!storage
            .has_column_group("G", TimeStamp::now())
            .await
            .unwrap());
        assert!(!storage
            .has_column_in_group("A", "G", TimeStamp::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn checksum_is_idempotent_and_checkpointed() {
        let storage = storage().await;
        storage.create_column("A").await.unwrap();
        storage.create_column("B").await.unwrap();

        let (c1, cp1) = storage.compute_checksum("columns", None).await.unwrap();
        let (c2, cp2) = storage.compute_checksum("columns", None).await.unwrap();
        assert_eq!((c1, cp1), (c2, cp2));
        assert_eq!(cp1, 2);

        // A further append changes the checksum but not the one computed at
        // the old checkpoint.
        storage.create_column("C").await.unwrap();
        let (c3, cp3) = storage.compute_checksum("columns", None).await.unwrap();
        assert_ne!(c1, c3);
        assert_eq!(cp3, 3);
        let (c4, _) = storage
            .compute_checksum("columns", Some(cp1))
            .await
            .unwrap();
        assert_eq!(c1, c4);
    }

    #[tokio::test]
    async fn checksum_detects_tampering() {
        let storage = storage().await;
        storage.create_column("A").await.unwrap();
        let (before, checkpoint) = storage.compute_checksum("columns", None).await.unwrap();

        // Physically edit the row behind the ledger's back.
        sqlx::query("UPDATE columns SET name = 'Z' WHERE seqno = 1")
            .execute(storage.raw_pool())
            .await
            .unwrap();

        let (after, _) = storage.compute_checksum("columns", None).await.unwrap();
        assert_ne!(before, after);

        // A checkpoint below the tampered row is unaffected.
        let (empty, _) = storage
            .compute_checksum("columns", Some(checkpoint - 1))
            .await
            .unwrap();
        assert_eq!(empty, 0);
    }

    #[tokio::test]
    async fn participant_registry_roundtrip() {
        let storage = storage().await;
        let master = ElgamalPrivateKey::random();
        let pp = ParticipantIdentifier::new("Alice").polymorphic(&master.public_key());

        let lp_a = lp(b"alice");
        storage.store_participant(&lp_a, &pp).await.unwrap();
        // Re-registering the same participant is a no-op.
        storage.store_participant(&lp_a, &pp).await.unwrap();
        assert!(storage.has_local_pseudonym(&lp_a).await.unwrap());
        assert_eq!(
            storage.local_pseudonyms().await.unwrap(),
            vec![lp_a]
        );

        let stored = storage.polymorphic_pseudonym(&lp_a).await.unwrap();
        assert_eq!(stored, pp);
    }

    #[tokio::test]
    async fn group_membership_snapshot() {
        let storage = storage().await;
        storage.create_participant_group("G").await.unwrap();
        let member = lp(b"member");
        storage.add_participant_to_group(&member, "G").await.unwrap();
        let t0 = TimeStamp::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        storage
            .remove_participant_from_group(&member, "G")
            .await
            .unwrap();

        assert_eq!(
            storage.participant_group_participants("G", t0).await.unwrap(),
            vec![member]
        );
        assert!(storage
            .participant_group_participants("G", TimeStamp::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn column_name_mappings_are_one_to_one() {
        let storage = storage().await;
        let mapping = ColumnNameMapping {
            original: "old".to_owned(),
            mapped: "new".to_owned(),
        };
        storage.create_column_name_mapping(&mapping).await.unwrap();
        assert!(matches!(
            storage.create_column_name_mapping(&mapping).await,
            Err(StorageError::Conflict(_))
        ));
        let onto_same = ColumnNameMapping {
            original: "other".to_owned(),
            mapped: "new".to_owned(),
        };
        assert!(matches!(
            storage.create_column_name_mapping(&onto_same).await,
            Err(StorageError::Conflict(_))
        ));

        storage.delete_column_name_mapping("old").await.unwrap();
        assert!(storage.column_name_mapping("old").await.unwrap().is_none());
    }
}

// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structure metadata: free-form `(metadata_group, subkey) → value` entries
//! attached to columns, column groups, participant groups, users and user
//! groups. Users and user groups are addressed by internal id underneath, so
//! their metadata survives identifier renames.

use morphocommon::{
    messages::access_manager::{
        StructureMetadataEntry, StructureMetadataKey, StructureMetadataSubjectKey,
        StructureMetadataSubjectType,
    },
    time::TimeStamp,
};
use sqlx::Row;

use crate::errors::StorageError;

use super::{records::RecordMeta, storage::Storage};

impl Storage {
    /// Resolve the internal id of a subject, for the subject types that have
    /// one.
    async fn internal_subject_id(
        &self,
        subject_type: StructureMetadataSubjectType,
        subject: &str,
        at: TimeStamp,
    ) -> Result<Option<i64>, StorageError> {
        match subject_type {
            StructureMetadataSubjectType::User => self.find_internal_user_id(subject, at).await,
            StructureMetadataSubjectType::UserGroup => Ok(self
                .find_user_group(subject, at)
                .await?
                .map(|group| group.user_group_id)),
            _ => Ok(None),
        }
    }

    async fn subject_exists(
        &self,
        subject_type: StructureMetadataSubjectType,
        subject: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        match subject_type {
            StructureMetadataSubjectType::Column => self.has_column(subject, at).await,
            StructureMetadataSubjectType::ColumnGroup => self.has_column_group(subject, at).await,
            StructureMetadataSubjectType::ParticipantGroup => {
                self.has_participant_group(subject, at).await
            }
            StructureMetadataSubjectType::User => {
                Ok(self.find_internal_user_id(subject, at).await?.is_some())
            }
            StructureMetadataSubjectType::UserGroup => {
                Ok(self.find_user_group(subject, at).await?.is_some())
            }
        }
    }

    /// Create or overwrite a metadata entry.
    pub async fn set_structure_metadata(
        &self,
        subject_type: StructureMetadataSubjectType,
        subject: &str,
        key: &StructureMetadataKey,
        value: &[u8],
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        if !self.subject_exists(subject_type, subject, now).await? {
            return Err(StorageError::NotFound(format!(
                "{subject_type} {subject:?}"
            )));
        }
        if key.metadata_group.is_empty() || key.subkey.is_empty() {
            return Err(StorageError::Conflict(
                "metadata keys must have a non-empty group and subkey".to_owned(),
            ));
        }
        let internal_subject_id = self.internal_subject_id(subject_type, subject, now).await?;
        // For subjects addressed by internal id, follow-up records must keep
        // the subject name of the first record so the natural key stays
        // stable across renames.
        let subject_name = match internal_subject_id {
            Some(id) => self
                .recorded_subject_name(subject_type, id)
                .await?
                .unwrap_or_else(|| subject.to_owned()),
            None => subject.to_owned(),
        };
        self.append_structure_metadata(
            subject_type,
            &subject_name,
            internal_subject_id,
            key,
            value,
            false,
        )
        .await
    }

    /// Remove a metadata entry. The tombstone row repeats the identifying
    /// fields of the entry it supersedes.
    pub async fn remove_structure_metadata(
        &self,
        subject_type: StructureMetadataSubjectType,
        subject: &str,
        key: &StructureMetadataKey,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_subject_id = self.internal_subject_id(subject_type, subject, now).await?;
        let current = self
            .structure_metadata(now, subject_type, &[subject.to_owned()], &[key.clone()])
            .await?;
        let Some(entry) = current.first() else {
            return Err(StorageError::NotFound(format!(
                "metadata {}:{} on {subject_type} {subject:?}",
                key.metadata_group, key.subkey
            )));
        };
        let subject_name = match internal_subject_id {
            Some(id) => self
                .recorded_subject_name(subject_type, id)
                .await?
                .unwrap_or_else(|| subject.to_owned()),
            None => subject.to_owned(),
        };
        self.append_structure_metadata(
            subject_type,
            &subject_name,
            internal_subject_id,
            key,
            &entry.value,
            true,
        )
        .await
    }

    /// Read (filtered) metadata of one subject type at `at`. An empty
    /// `subjects` filter matches all subjects, an empty `keys` filter all
    /// keys, and a key with an empty subkey every subkey of its group.
    pub async fn structure_metadata(
        &self,
        at: TimeStamp,
        subject_type: StructureMetadataSubjectType,
        subjects: &[String],
        keys: &[StructureMetadataKey],
    ) -> Result<Vec<StructureMetadataEntry>, StorageError> {
        // Resolve filter subjects to internal ids where applicable.
        let mut internal_filter = Vec::new();
        if subject_type.has_internal_id() {
            for subject in subjects {
                if let Some(id) = self.internal_subject_id(subject_type, subject, at).await? {
                    internal_filter.push(id);
                }
            }
        }

        let rows = sqlx::query(
            "SELECT * FROM structure_metadata m
             WHERE subject_type = ?1 AND timestamp <= ?2 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM structure_metadata m2
                            WHERE m2.subject_type = m.subject_type
                              AND m2.subject = m.subject
                              AND (m2.internal_subject_id IS m.internal_subject_id)
                              AND m2.metadata_group = m.metadata_group
                              AND m2.subkey = m.subkey
                              AND m2.timestamp <= ?2)",
        )
        .bind(subject_type.as_str())
        .bind(at)
        .fetch_all(self.pool())
        .await?;

        let mut entries = Vec::new();
        for row in &rows {
            let subject: String = row.try_get("subject")?;
            let internal_subject_id: Option<i64> = row.try_get("internal_subject_id")?;
            let key = StructureMetadataKey {
                metadata_group: row.try_get("metadata_group")?,
                subkey: row.try_get("subkey")?,
            };

            let subject_matches = if subjects.is_empty() {
                true
            } else if let Some(id) = internal_subject_id {
                internal_filter.contains(&id)
            } else {
                subjects.contains(&subject)
            };
            if !subject_matches {
                continue;
            }

            let key_matches = keys.is_empty()
                || keys.iter().any(|filter| {
                    filter.metadata_group == key.metadata_group
                        && (filter.subkey.is_empty() || filter.subkey == key.subkey)
                });
            if !key_matches {
                continue;
            }

            // Report subjects with an internal id under a current name.
            let reported_subject = match internal_subject_id {
                Some(id) => self
                    .current_subject_name(subject_type, id, at)
                    .await?
                    .unwrap_or(subject),
                None => subject,
            };
            entries.push(StructureMetadataEntry {
                subject_key: StructureMetadataSubjectKey {
                    subject: reported_subject,
                    key,
                },
                value: row.try_get("value")?,
            });
        }
        Ok(entries)
    }

    /// The subject name used by existing metadata records of this internal
    /// id, if any.
    async fn recorded_subject_name(
        &self,
        subject_type: StructureMetadataSubjectType,
        internal_subject_id: i64,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT subject FROM structure_metadata
             WHERE subject_type = ?1 AND internal_subject_id = ?2
             ORDER BY seqno LIMIT 1",
        )
        .bind(subject_type.as_str())
        .bind(internal_subject_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| Ok(row.try_get("subject")?)).transpose()
    }

    async fn current_subject_name(
        &self,
        subject_type: StructureMetadataSubjectType,
        internal_subject_id: i64,
        at: TimeStamp,
    ) -> Result<Option<String>, StorageError> {
        match subject_type {
            StructureMetadataSubjectType::User => {
                let identifiers = self.identifiers_for_user(internal_subject_id, at).await?;
                Ok(identifiers
                    .iter()
                    .find(|info| info.is_primary)
                    .or_else(|| identifiers.first())
                    .map(|info| info.identifier.clone()))
            }
            StructureMetadataSubjectType::UserGroup => {
                self.user_group_name(internal_subject_id, at).await
            }
            _ => Ok(None),
        }
    }

    async fn append_structure_metadata(
        &self,
        subject_type: StructureMetadataSubjectType,
        subject: &str,
        internal_subject_id: Option<i64>,
        key: &StructureMetadataKey,
        value: &[u8],
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO structure_metadata
             (checksum_nonce, timestamp, tombstone, subject_type, subject, internal_subject_id,
              metadata_group, subkey, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(subject_type.as_str())
        .bind(subject)
        .bind(internal_subject_id)
        .bind(key.metadata_group.as_str())
        .bind(key.subkey.as_str())
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        Storage::new_in_memory().await.unwrap()
    }

    fn key(group: &str, subkey: &str) -> StructureMetadataKey {
        StructureMetadataKey {
            metadata_group: group.to_owned(),
            subkey: subkey.to_owned(),
        }
    }

    #[tokio::test]
    async fn set_get_remove_roundtrip() {
        let storage = storage().await;
        storage.create_column("C").await.unwrap();
        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::Column,
                "C",
                &key("castor", "slug"),
                b"study-1",
            )
            .await
            .unwrap();

        let entries = storage
            .structure_metadata(TimeStamp::now(), StructureMetadataSubjectType::Column, &[], &[])
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"study-1");

        storage
            .remove_structure_metadata(
                StructureMetadataSubjectType::Column,
                "C",
                &key("castor", "slug"),
            )
            .await
            .unwrap();
        let entries = storage
            .structure_metadata(TimeStamp::now(), StructureMetadataSubjectType::Column, &[], &[])
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn empty_subkey_filter_is_a_wildcard() {
        let storage = storage().await;
        storage.create_column("C").await.unwrap();
        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::Column,
                "C",
                &key("g", "a"),
                b"1",
            )
            .await
            .unwrap();
        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::Column,
                "C",
                &key("g", "b"),
                b"2",
            )
            .await
            .unwrap();
        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::Column,
                "C",
                &key("other", "a"),
                b"3",
            )
            .await
            .unwrap();

        let entries = storage
            .structure_metadata(
                TimeStamp::now(),
                StructureMetadataSubjectType::Column,
                &[],
                &[key("g", "")],
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn user_metadata_survives_identifier_rename() {
        let storage = storage().await;
        storage.create_user("JohnSmith").await.unwrap();
        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::User,
                "JohnSmith",
                &key("foo", "bar"),
                b"hello",
            )
            .await
            .unwrap();

        storage
            .add_identifier_for_user("JohnSmith", "JohnS")
            .await
            .unwrap();
        storage.remove_identifier_for_user("JohnSmith").await.unwrap();

        // Still readable under the new identifier, and updatable.
        let entries = storage
            .structure_metadata(
                TimeStamp::now(),
                StructureMetadataSubjectType::User,
                &["JohnS".to_owned()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"hello");

        storage
            .set_structure_metadata(
                StructureMetadataSubjectType::User,
                "JohnS",
                &key("foo", "bar"),
                b"helloAgain",
            )
            .await
            .unwrap();
        let entries = storage
            .structure_metadata(
                TimeStamp::now(),
                StructureMetadataSubjectType::User,
                &["JohnS".to_owned()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"helloAgain");
    }

    #[tokio::test]
    async fn metadata_for_unknown_subject_fails() {
        let storage = storage().await;
        let result = storage
            .set_structure_metadata(
                StructureMetadataSubjectType::Column,
                "missing",
                &key("g", "k"),
                b"v",
            )
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}

// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The user model of the Access Manager ledger. A user is an internal
//! numeric id plus one or more string identifiers; at most one identifier is
//! flagged primary and at most one display. Internal ids are stable across
//! identifier renames and are never reused.

use morphocommon::{
    messages::access_manager::{QueriedUser, QueriedUserGroup, UserIdentifierInfo, UserQuery,
        UserQueryResponse},
    time::TimeStamp,
};
use sqlx::Row;

use crate::errors::StorageError;

use super::{records::RecordMeta, storage::Storage};

#[derive(Debug, Clone)]
pub struct UserGroupInfo {
    pub user_group_id: i64,
    pub name: String,
    pub max_auth_validity_secs: Option<i64>,
}

impl Storage {
    // === Users and identifiers ===

    async fn next_id(&self, table: &str, column: &str) -> Result<i64, StorageError> {
        // Ids are never reused, so the maximum over all rows (tombstoned or
        // not) is the watermark.
        let row = sqlx::query(&format!("SELECT MAX({column}) AS watermark FROM {table}"))
            .fetch_one(self.pool())
            .await?;
        let watermark: Option<i64> = row.try_get("watermark")?;
        Ok(watermark.unwrap_or(0) + 1)
    }

    /// Create a user with `identifier` as its primary identifier. Returns
    /// the new internal user id.
    pub async fn create_user(&self, identifier: &str) -> Result<i64, StorageError> {
        if self
            .find_internal_user_id(identifier, TimeStamp::now())
            .await?
            .is_some()
        {
            return Err(StorageError::Conflict(format!("user {identifier:?}")));
        }
        let internal_user_id = self.next_id("user_ids", "internal_user_id").await?;
        self.append_user_id(internal_user_id, identifier, true, true, false)
            .await?;
        Ok(internal_user_id)
    }

    /// Tombstone every identifier and group membership of the user.
    pub async fn remove_user(&self, identifier: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(identifier, now).await?;
        for info in self.identifiers_for_user(internal_user_id, now).await? {
            self.append_user_id(
                internal_user_id,
                &info.identifier,
                info.is_primary,
                info.is_display,
                true,
            )
            .await?;
        }
        for group_id in self.group_ids_for_user(internal_user_id, now).await? {
            self.append_user_group_user(internal_user_id, group_id, true)
                .await?;
        }
        Ok(())
    }

    pub async fn add_identifier_for_user(
        &self,
        existing_identifier: &str,
        new_identifier: &str,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(existing_identifier, now).await?;
        if self.find_internal_user_id(new_identifier, now).await?.is_some() {
            return Err(StorageError::Conflict(format!("user id {new_identifier:?}")));
        }
        self.append_user_id(internal_user_id, new_identifier, false, false, false)
            .await
    }

    pub async fn remove_identifier_for_user(&self, identifier: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(identifier, now).await?;
        let infos = self.identifiers_for_user(internal_user_id, now).await?;
        if infos.len() == 1 {
            return Err(StorageError::Conflict(format!(
                "cannot remove the last identifier {identifier:?}"
            )));
        }
        let info = infos
            .into_iter()
            .find(|info| info.identifier == identifier)
            .ok_or_else(|| StorageError::NotFound(format!("user id {identifier:?}")))?;
        self.append_user_id(
            internal_user_id,
            &info.identifier,
            info.is_primary,
            info.is_display,
            true,
        )
        .await
    }

    /// Flag `identifier` as the user's primary identifier, unflagging any
    /// prior primary. At most one identifier is primary at any time.
    pub async fn set_primary_identifier(&self, identifier: &str) -> Result<(), StorageError> {
        self.set_flag(identifier, true).await
    }

    /// Flag `identifier` as the user's display identifier, unflagging any
    /// prior display identifier.
    pub async fn set_display_identifier(&self, identifier: &str) -> Result<(), StorageError> {
        self.set_flag(identifier, false).await
    }

    async fn set_flag(&self, identifier: &str, primary: bool) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(identifier, now).await?;
        for info in self.identifiers_for_user(internal_user_id, now).await? {
            let currently_set = if primary { info.is_primary } else { info.is_display };
            let should_be_set = info.identifier == identifier;
            if currently_set == should_be_set {
                continue;
            }
            let (is_primary, is_display) = if primary {
                (should_be_set, info.is_display)
            } else {
                (info.is_primary, should_be_set)
            };
            self.append_user_id(
                internal_user_id,
                &info.identifier,
                is_primary,
                is_display,
                false,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn find_internal_user_id(
        &self,
        identifier: &str,
        at: TimeStamp,
    ) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query(
            "SELECT internal_user_id, tombstone FROM user_ids
             WHERE identifier = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(identifier)
        .bind(at)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) if !row.try_get::<bool, _>("tombstone")? => {
                Ok(Some(row.try_get("internal_user_id")?))
            }
            _ => Ok(None),
        }
    }

    async fn internal_user_id(&self, identifier: &str, at: TimeStamp) -> Result<i64, StorageError> {
        self.find_internal_user_id(identifier, at)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {identifier:?}")))
    }

    pub async fn identifiers_for_user(
        &self,
        internal_user_id: i64,
        at: TimeStamp,
    ) -> Result<Vec<UserIdentifierInfo>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM user_ids u
             WHERE internal_user_id = ?1 AND timestamp <= ?2 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM user_ids u2
                            WHERE u2.internal_user_id = u.internal_user_id
                              AND u2.identifier = u.identifier
                              AND u2.timestamp <= ?2)",
        )
        .bind(internal_user_id)
        .bind(at)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(UserIdentifierInfo {
                    identifier: row.try_get("identifier")?,
                    is_primary: row.try_get("is_primary")?,
                    is_display: row.try_get("is_display")?,
                })
            })
            .collect()
    }

    // === User groups ===

    pub async fn find_user_group(
        &self,
        name: &str,
        at: TimeStamp,
    ) -> Result<Option<UserGroupInfo>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM user_groups
             WHERE name = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(name)
        .bind(at)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) if !row.try_get::<bool, _>("tombstone")? => Ok(Some(UserGroupInfo {
                user_group_id: row.try_get("user_group_id")?,
                name: row.try_get("name")?,
                max_auth_validity_secs: row.try_get("max_auth_validity_secs")?,
            })),
            _ => Ok(None),
        }
    }

    pub async fn create_user_group(
        &self,
        name: &str,
        max_auth_validity_secs: Option<i64>,
    ) -> Result<i64, StorageError> {
        if self.find_user_group(name, TimeStamp::now()).await?.is_some() {
            return Err(StorageError::Conflict(format!("user group {name:?}")));
        }
        let user_group_id = self.next_id("user_groups", "user_group_id").await?;
        self.append_user_group(user_group_id, name, max_auth_validity_secs, false)
            .await?;
        Ok(user_group_id)
    }

    pub async fn modify_user_group(
        &self,
        name: &str,
        max_auth_validity_secs: Option<i64>,
    ) -> Result<(), StorageError> {
        let group = self
            .find_user_group(name, TimeStamp::now())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user group {name:?}")))?;
        self.append_user_group(group.user_group_id, name, max_auth_validity_secs, false)
            .await
    }

    pub async fn remove_user_group(&self, name: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let group = self
            .find_user_group(name, now)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user group {name:?}")))?;
        self.append_user_group(
            group.user_group_id,
            name,
            group.max_auth_validity_secs,
            true,
        )
        .await?;
        // Cascade memberships.
        for user_id in self.user_ids_in_group(group.user_group_id, now).await? {
            self.append_user_group_user(user_id, group.user_group_id, true)
                .await?;
        }
        Ok(())
    }

    pub async fn add_user_to_group(&self, identifier: &str, group: &str) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(identifier, now).await?;
        let group = self
            .find_user_group(group, now)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user group {group:?}")))?;
        if self
            .user_membership(internal_user_id, group.user_group_id, now)
            .await?
        {
            return Err(StorageError::Conflict(format!(
                "user {identifier:?} in group {:?}",
                group.name
            )));
        }
        self.append_user_group_user(internal_user_id, group.user_group_id, false)
            .await
    }

    pub async fn remove_user_from_group(
        &self,
        identifier: &str,
        group: &str,
    ) -> Result<(), StorageError> {
        let now = TimeStamp::now();
        let internal_user_id = self.internal_user_id(identifier, now).await?;
        let group = self
            .find_user_group(group, now)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user group {group:?}")))?;
        if !self
            .user_membership(internal_user_id, group.user_group_id, now)
            .await?
        {
            return Err(StorageError::NotFound(format!(
                "user {identifier:?} in group {:?}",
                group.name
            )));
        }
        self.append_user_group_user(internal_user_id, group.user_group_id, true)
            .await
    }

    pub async fn user_in_group(
        &self,
        identifier: &str,
        group: &str,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let Some(internal_user_id) = self.find_internal_user_id(identifier, at).await? else {
            return Ok(false);
        };
        let Some(group) = self.find_user_group(group, at).await? else {
            return Ok(false);
        };
        self.user_membership(internal_user_id, group.user_group_id, at)
            .await
    }

    async fn user_membership(
        &self,
        internal_user_id: i64,
        user_group_id: i64,
        at: TimeStamp,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT tombstone FROM user_group_users
             WHERE internal_user_id = ?1 AND user_group_id = ?2 AND timestamp <= ?3
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(internal_user_id)
        .bind(user_group_id)
        .bind(at)
        .fetch_optional(self.pool())
        .await?;
        Ok(matches!(row, Some(row) if !row.try_get::<bool, _>("tombstone")?))
    }

    async fn group_ids_for_user(
        &self,
        internal_user_id: i64,
        at: TimeStamp,
    ) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query(
            "SELECT user_group_id FROM user_group_users m
             WHERE internal_user_id = ?1 AND timestamp <= ?2 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM user_group_users m2
                            WHERE m2.internal_user_id = m.internal_user_id
                              AND m2.user_group_id = m.user_group_id
                              AND m2.timestamp <= ?2)",
        )
        .bind(internal_user_id)
        .bind(at)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<i64, _>("user_group_id")?))
            .collect()
    }

    async fn user_ids_in_group(
        &self,
        user_group_id: i64,
        at: TimeStamp,
    ) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query(
            "SELECT internal_user_id FROM user_group_users m
             WHERE user_group_id = ?1 AND timestamp <= ?2 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM user_group_users m2
                            WHERE m2.internal_user_id = m.internal_user_id
                              AND m2.user_group_id = m.user_group_id
                              AND m2.timestamp <= ?2)",
        )
        .bind(user_group_id)
        .bind(at)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<i64, _>("internal_user_id")?))
            .collect()
    }

    pub async fn user_group_name(
        &self,
        user_group_id: i64,
        at: TimeStamp,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            "SELECT name, tombstone FROM user_groups
             WHERE user_group_id = ?1 AND timestamp <= ?2
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(user_group_id)
        .bind(at)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some(row) if !row.try_get::<bool, _>("tombstone")? => Ok(Some(row.try_get("name")?)),
            _ => Ok(None),
        }
    }

    pub async fn user_groups(&self, at: TimeStamp) -> Result<Vec<UserGroupInfo>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM user_groups g
             WHERE timestamp <= ?1 AND tombstone = 0
               AND seqno = (SELECT MAX(seqno) FROM user_groups g2
                            WHERE g2.user_group_id = g.user_group_id
                              AND g2.timestamp <= ?1)",
        )
        .bind(at)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(UserGroupInfo {
                    user_group_id: row.try_get("user_group_id")?,
                    name: row.try_get("name")?,
                    max_auth_validity_secs: row.try_get("max_auth_validity_secs")?,
                })
            })
            .collect()
    }

    async fn all_internal_user_ids(&self, at: TimeStamp) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT internal_user_id FROM user_ids u
             WHERE timestamp <= ?1
               AND EXISTS (SELECT 1 FROM user_ids u2
                           WHERE u2.internal_user_id = u.internal_user_id
                             AND u2.timestamp <= ?1 AND u2.tombstone = 0
                             AND u2.seqno = (SELECT MAX(seqno) FROM user_ids u3
                                             WHERE u3.internal_user_id = u2.internal_user_id
                                               AND u3.identifier = u2.identifier
                                               AND u3.timestamp <= ?1))",
        )
        .bind(at)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<i64, _>("internal_user_id")?))
            .collect()
    }

    /// Answer a user query: users with their identifiers and group
    /// memberships, plus the matching groups.
    pub async fn execute_user_query(
        &self,
        query: &UserQuery,
    ) -> Result<UserQueryResponse, StorageError> {
        let at = query.at.unwrap_or_else(TimeStamp::now);

        let mut users = Vec::new();
        for internal_id in self.all_internal_user_ids(at).await? {
            let identifiers = self.identifiers_for_user(internal_id, at).await?;
            if let Some(filter) = &query.user_filter {
                if !identifiers.iter().any(|info| &info.identifier == filter) {
                    continue;
                }
            }
            let mut groups = Vec::new();
            for group_id in self.group_ids_for_user(internal_id, at).await? {
                if let Some(name) = self.user_group_name(group_id, at).await? {
                    groups.push(name);
                }
            }
            groups.sort();
            if let Some(filter) = &query.group_filter {
                if !groups.contains(filter) {
                    continue;
                }
            }
            users.push(QueriedUser {
                internal_id,
                identifiers,
                groups,
            });
        }

        let mut groups: Vec<QueriedUserGroup> = self
            .user_groups(at)
            .await?
            .into_iter()
            .filter(|group| match &query.group_filter {
                Some(filter) => &group.name == filter,
                None => true,
            })
            .map(|group| QueriedUserGroup {
                name: group.name,
                max_auth_validity_secs: group.max_auth_validity_secs,
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(UserQueryResponse { users, groups })
    }

    // === Append helpers ===

    async fn append_user_id(
        &self,
        internal_user_id: i64,
        identifier: &str,
        is_primary: bool,
        is_display: bool,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO user_ids
             (checksum_nonce, timestamp, tombstone, internal_user_id, identifier, is_primary, is_display)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(internal_user_id)
        .bind(identifier)
        .bind(is_primary)
        .bind(is_display)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn append_user_group(
        &self,
        user_group_id: i64,
        name: &str,
        max_auth_validity_secs: Option<i64>,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO user_groups
             (checksum_nonce, timestamp, tombstone, user_group_id, name, max_auth_validity_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(user_group_id)
        .bind(name)
        .bind(max_auth_validity_secs)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn append_user_group_user(
        &self,
        internal_user_id: i64,
        user_group_id: i64,
        tombstone: bool,
    ) -> Result<(), StorageError> {
        let meta = RecordMeta::fresh(tombstone);
        sqlx::query(
            "INSERT INTO user_group_users
             (checksum_nonce, timestamp, tombstone, internal_user_id, user_group_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&meta.checksum_nonce)
        .bind(meta.timestamp)
        .bind(meta.tombstone)
        .bind(internal_user_id)
        .bind(user_group_id)
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

    #[tokio::test]
    async fn user_lifecycle_and_stable_internal_id() {
        let storage = storage().await;
        let id = storage.create_user("JohnSmith").await.unwrap();

        storage
            .add_identifier_for_user("JohnSmith", "JohnS")
            .await
            .unwrap();
        storage.remove_identifier_for_user("JohnSmith").await.unwrap();

        // The internal id survives the rename.
        let at = TimeStamp::now();
        assert_eq!(storage.find_internal_user_id("JohnS", at).await.unwrap(), Some(id));
        assert_eq!(
            storage.find_internal_user_id("JohnSmith", at).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn at_most_one_primary_identifier() {
        let storage = storage().await;
        storage.create_user("alice").await.unwrap();
        storage
            .add_identifier_for_user("alice", "alice@example.com")
            .await
            .unwrap();
        storage
            .set_primary_identifier("alice@example.com")
            .await
            .unwrap();

        let id = storage
            .find_internal_user_id("alice", TimeStamp::now())
            .await
            .unwrap()
            .unwrap();
        let infos = storage
            .identifiers_for_user(id, TimeStamp::now())
            .await
            .unwrap();
        let primaries: Vec<_> = infos.iter().filter(|info| info.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].identifier, "alice@example.com");
    }

    #[tokio::test]
    async fn group_membership() {
        let storage = storage().await;
        storage.create_user("bob").await.unwrap();
        storage
            .create_user_group("ResearchAssessor", Some(3600))
            .await
            .unwrap();
        storage
            .add_user_to_group("bob", "ResearchAssessor")
            .await
            .unwrap();
        assert!(storage
            .user_in_group("bob", "ResearchAssessor", TimeStamp::now())
            .await
            .unwrap());

        storage
            .remove_user_from_group("bob", "ResearchAssessor")
            .await
            .unwrap();
        assert!(!storage
            .user_in_group("bob", "ResearchAssessor", TimeStamp::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn user_query_filters() {
        let storage = storage().await;
        storage.create_user("alice").await.unwrap();
        storage.create_user("bob").await.unwrap();
        storage.create_user_group("G", None).await.unwrap();
        storage.add_user_to_group("alice", "G").await.unwrap();

        let response = storage
            .execute_user_query(&UserQuery {
                at: None,
                group_filter: Some("G".to_owned()),
                user_filter: None,
            })
            .await
            .unwrap();
        assert_eq!(response.users.len(), 1);
        assert_eq!(response.users[0].identifiers[0].identifier, "alice");
        assert_eq!(response.groups.len(), 1);
    }

    #[tokio::test]
    async fn cannot_remove_last_identifier() {
        let storage = storage().await;
        storage.create_user("solo").await.unwrap();
        assert!(matches!(
            storage.remove_identifier_for_user("solo").await,
            Err(StorageError::Conflict(_))
        ));
    }
}

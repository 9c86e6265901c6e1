// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error kinds shared between the server parties and the client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ticketing::AccessMode;

/// Authorisation failure carrying the exact missing grant.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("user group {user_group} lacks {mode} on {subject}")]
pub struct AccessDeniedError {
    pub user_group: String,
    pub mode: AccessMode,
    pub subject: String,
}

impl AccessDeniedError {
    pub fn new(
        user_group: impl Into<String>,
        mode: AccessMode,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            user_group: user_group.into(),
            mode,
            subject: subject.into(),
        }
    }
}

/// Cooperative cancellation fired before the operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct CancelledError;

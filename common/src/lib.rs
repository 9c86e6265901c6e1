// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common data model used by the server parties and the client.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
pub mod crypto;
pub mod errors;
pub mod identifiers;
pub mod messages;
pub mod ticketing;
pub mod time;

/// Unrecoverable error in this implementation.
#[derive(Debug, Error, Serialize, Deserialize)]
pub struct LibraryError;

impl LibraryError {
    pub fn unexpected_crypto_error(_error: &str) -> Self {
        LibraryError {}
    }
}

impl Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

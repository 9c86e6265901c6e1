// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side protocol logic: enrollment, pseudonym generation, ticket
//! requests and the cell envelope (client-side page encryption). The server
//! parties only ever see ciphertext payloads and pseudonymised identifiers.

pub mod client;
pub(crate) mod envelope;

pub use client::{CellWrite, Client, ClientError, PlainExtra, RetrievedCell, SystemPublicInfo};

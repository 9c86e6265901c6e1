// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

#![deny(unreachable_pub)]

pub mod access_manager;
pub mod auth_service;
pub mod errors;
pub mod key_server;
pub mod storage_facility;
pub mod transcryptor;

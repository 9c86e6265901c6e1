// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed request and response messages exchanged with the server parties,
//! split per receiving service. Framing and transport are interchangeable;
//! every message serializes through the versioned [`crate::codec`].

pub mod access_manager;
pub mod auth;
pub mod storage;

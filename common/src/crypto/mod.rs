// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cryptographic primitives of the pseudonymisation core: the Ristretto
//! group, ElGamal with the rerandomise/reshuffle/rekey rewriting operations,
//! transcryption key shares, AEAD for payload pages, KDFs and signatures.

pub mod ear;
pub mod errors;
pub mod group;
pub mod elgamal;
pub mod hash;
pub mod kdf;
pub mod secrets;
pub mod signatures;
pub mod transcryption;

pub use hash::Hash;

// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key material of the pseudonymisation protocol.
//!
//! A setup ceremony ([`SystemKeys::generate`]) expands two master secrets
//! into the per-party shares. The master secrets themselves are discarded
//! after the ceremony; no online party ever holds them. The two hop parties
//! (Access Manager and Transcryptor) receive reshuffle, rekey and blinding
//! seeds; the endpoint parties receive only the decryption key of their own
//! pseudonym domain; the Key Server receives the master private keys plus
//! the rekey seeds it needs to assemble enrollment keys.

use serde::{Deserialize, Serialize};

use crate::{
    LibraryError,
    identifiers::LocalPseudonym,
    time::TimeStamp,
};

use super::{
    elgamal::{ElgamalCiphertext, ElgamalPrivateKey, ElgamalPublicKey},
    group::{GroupElement, GroupScalar},
    kdf::expand,
    secrets::Secret,
};

const SEED_SIZE: usize = 32;

/// The pseudonym domain a transcryption is targeted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PseudonymDomain {
    AccessManager,
    StorageFacility,
    /// The domain of one user group; its local pseudonyms are decryptable
    /// with the enrolled pseudonym key of that group's members.
    AccessGroup(String),
}

impl PseudonymDomain {
    fn context(&self) -> Vec<u8> {
        match self {
            PseudonymDomain::AccessManager => b"access manager".to_vec(),
            PseudonymDomain::StorageFacility => b"storage facility".to_vec(),
            PseudonymDomain::AccessGroup(group) => {
                let mut context = b"access group:".to_vec();
                context.extend_from_slice(group.as_bytes());
                context
            }
        }
    }
}

fn derive_scalar(seed: &Secret<SEED_SIZE>, label: &str, context: &[&[u8]]) -> GroupScalar {
    // Expansion only fails for oversized output lengths, which 64 is not.
    let wide: [u8; 64] = expand(seed.secret(), label, context)
        .unwrap_or_else(|_| unreachable!("HKDF expansion of 64 bytes cannot fail"));
    GroupScalar::from_wide_bytes(&wide)
}

/// Rekey seeds of one hop party. Factors derived from these change which key
/// a ciphertext is addressed to; they carry no pseudonym-shuffling power.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeySeeds {
    pseudonym_seed: Secret<SEED_SIZE>,
    data_seed: Secret<SEED_SIZE>,
}

impl RekeySeeds {
    /// Rekey factor toward the pseudonym decryption key of `domain`.
    pub fn pseudonym_factor(&self, domain: &PseudonymDomain) -> GroupScalar {
        derive_scalar(&self.pseudonym_seed, "pseudonym rekey", &[&domain.context()])
    }

    /// Rekey factor toward the enrolled data key of `user_group`.
    pub fn data_factor(&self, user_group: &str) -> GroupScalar {
        derive_scalar(&self.data_seed, "data rekey", &[user_group.as_bytes()])
    }
}

/// The binding of a data key to one cell. Blinding factors are derived from
/// these inputs, so a stored key only unblinds correctly for the exact cell
/// it was stored for.
#[derive(Debug, Clone, Copy)]
pub struct CellBinding<'a> {
    pub column: &'a str,
    pub pseudonym: &'a LocalPseudonym,
    pub blinding_timestamp: TimeStamp,
}

impl CellBinding<'_> {
    fn context(&self) -> [Vec<u8>; 3] {
        [
            self.column.as_bytes().to_vec(),
            self.pseudonym.pack().to_vec(),
            self.blinding_timestamp.as_millis().to_be_bytes().to_vec(),
        ]
    }
}

/// The full secret share set of one hop party (Access Manager or
/// Transcryptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopSecrets {
    reshuffle_seed: Secret<SEED_SIZE>,
    blinding_seed: Secret<SEED_SIZE>,
    rekey: RekeySeeds,
}

impl HopSecrets {
    /// Reshuffle factor of this hop for `domain`. The product of the hop
    /// parties' factors maps an identifier element to its local pseudonym.
    pub fn reshuffle_factor(&self, domain: &PseudonymDomain) -> GroupScalar {
        derive_scalar(&self.reshuffle_seed, "reshuffle", &[&domain.context()])
    }

    fn blinding_factor(&self, cell: &CellBinding) -> GroupScalar {
        let context = cell.context();
        derive_scalar(
            &self.blinding_seed,
            "cell key blinding",
            &[&context[0], &context[1], &context[2]],
        )
    }

    pub fn rekey(&self) -> &RekeySeeds {
        &self.rekey
    }

    /// One transcryption hop of a polymorphic pseudonym toward `domain`:
    /// reshuffle, rekey and rerandomise in one step.
    pub fn pseudonym_hop(
        &self,
        ciphertext: &ElgamalCiphertext,
        domain: &PseudonymDomain,
    ) -> Result<ElgamalCiphertext, LibraryError> {
        ciphertext
            .rsk(
                &self.reshuffle_factor(domain),
                &self.rekey.pseudonym_factor(domain),
            )
            .map_err(|_| LibraryError {})
    }

    /// One blinding hop of a data key at store time. The key stays addressed
    /// to the master data key but is scaled by this hop's cell-bound factor.
    pub fn data_key_blind(
        &self,
        ciphertext: &ElgamalCiphertext,
        cell: &CellBinding,
    ) -> Result<ElgamalCiphertext, LibraryError> {
        ciphertext
            .rsk(&self.blinding_factor(cell), &GroupScalar::ONE)
            .map_err(|_| LibraryError {})
    }

    /// One unblinding hop of a data key at retrieval time: removes this
    /// hop's cell-bound factor and rekeys toward the enrolled data key of
    /// the requesting user group.
    pub fn data_key_unblind(
        &self,
        ciphertext: &ElgamalCiphertext,
        cell: &CellBinding,
        user_group: &str,
    ) -> Result<ElgamalCiphertext, LibraryError> {
        let inverse = self
            .blinding_factor(cell)
            .invert()
            .map_err(|_| LibraryError {})?;
        ciphertext
            .rsk(&inverse, &self.rekey.data_factor(user_group))
            .map_err(|_| LibraryError {})
    }
}

/// Secrets of the Access Manager party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessManagerSecrets {
    pub hop: HopSecrets,
    /// Decryption key of the Access Manager pseudonym domain.
    pub pseudonym_decryption_key: ElgamalPrivateKey,
}

/// Secrets of the Transcryptor party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscryptorSecrets {
    pub hop: HopSecrets,
}

/// Secrets of the Storage Facility party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFacilitySecrets {
    /// Decryption key of the Storage Facility pseudonym domain.
    pub pseudonym_decryption_key: ElgamalPrivateKey,
}

/// Secrets of the Key Server party: the master private keys plus the rekey
/// seeds needed to assemble enrollment keys. The Key Server holds no
/// reshuffle seeds and therefore cannot link pseudonyms across domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyServerSecrets {
    master_pseudonym_key: ElgamalPrivateKey,
    master_data_key: ElgamalPrivateKey,
    access_manager_rekey: RekeySeeds,
    transcryptor_rekey: RekeySeeds,
}

/// The private keys a client receives on enrollment, scoped to its user
/// group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentKeys {
    /// Decrypts data keys unblinded toward the user group.
    pub data_key: ElgamalPrivateKey,
    /// Decrypts access-group local pseudonyms of the user group.
    pub pseudonym_key: ElgamalPrivateKey,
}

impl KeyServerSecrets {
    /// Assemble the enrollment keys of one user group from the master keys
    /// and both hop parties' rekey factors.
    pub fn enroll(&self, user_group: &str) -> EnrollmentKeys {
        let domain = PseudonymDomain::AccessGroup(user_group.to_owned());
        let pseudonym_scalar = *self.master_pseudonym_key.scalar()
            * self.access_manager_rekey.pseudonym_factor(&domain)
            * self.transcryptor_rekey.pseudonym_factor(&domain);
        let data_scalar = *self.master_data_key.scalar()
            * self.access_manager_rekey.data_factor(user_group)
            * self.transcryptor_rekey.data_factor(user_group);
        EnrollmentKeys {
            data_key: ElgamalPrivateKey::from_scalar(data_scalar),
            pseudonym_key: ElgamalPrivateKey::from_scalar(pseudonym_scalar),
        }
    }
}

/// All key material produced by the setup ceremony. Constructed once,
/// split into its party shares, then dropped.
#[derive(Debug)]
pub struct SystemKeys {
    pub master_pseudonym_key: ElgamalPublicKey,
    pub master_data_key: ElgamalPublicKey,
    pub access_manager: AccessManagerSecrets,
    pub transcryptor: TranscryptorSecrets,
    pub storage_facility: StorageFacilitySecrets,
    pub key_server: KeyServerSecrets,
}

fn derive_seed(
    master: &Secret<SEED_SIZE>,
    label: &str,
    party: &str,
) -> Result<Secret<SEED_SIZE>, LibraryError> {
    let bytes: [u8; SEED_SIZE] = expand(master.secret(), label, &[party.as_bytes()])?;
    Ok(Secret::from(bytes))
}

impl SystemKeys {
    /// Run the setup ceremony: expand fresh master secrets into the party
    /// shares. The master secrets do not outlive this function.
    pub fn generate() -> Result<Self, LibraryError> {
        let pseudonym_master = Secret::random().map_err(|_| LibraryError {})?;
        let data_master = Secret::random().map_err(|_| LibraryError {})?;

        let master_pseudonym_key =
            ElgamalPrivateKey::from_scalar(derive_scalar(&pseudonym_master, "master key", &[]));
        let master_data_key =
            ElgamalPrivateKey::from_scalar(derive_scalar(&data_master, "master key", &[]));

        let hop_secrets = |party: &str| -> Result<HopSecrets, LibraryError> {
            Ok(HopSecrets {
                reshuffle_seed: derive_seed(&pseudonym_master, "reshuffle seed", party)?,
                blinding_seed: derive_seed(&data_master, "blinding seed", party)?,
                rekey: RekeySeeds {
                    pseudonym_seed: derive_seed(&pseudonym_master, "rekey seed", party)?,
                    data_seed: derive_seed(&data_master, "rekey seed", party)?,
                },
            })
        };
        let am_hop = hop_secrets("access manager")?;
        let ts_hop = hop_secrets("transcryptor")?;

        // Endpoint decryption keys: the master pseudonym key rekeyed through
        // both hops toward the endpoint's own domain.
        let endpoint_key = |domain: &PseudonymDomain| {
            ElgamalPrivateKey::from_scalar(
                *master_pseudonym_key.scalar()
                    * am_hop.rekey.pseudonym_factor(domain)
                    * ts_hop.rekey.pseudonym_factor(domain),
            )
        };
        let am_pseudonym_key = endpoint_key(&PseudonymDomain::AccessManager);
        let sf_pseudonym_key = endpoint_key(&PseudonymDomain::StorageFacility);

        Ok(Self {
            master_pseudonym_key: master_pseudonym_key.public_key(),
            master_data_key: master_data_key.public_key(),
            key_server: KeyServerSecrets {
                master_pseudonym_key,
                master_data_key,
                access_manager_rekey: am_hop.rekey.clone(),
                transcryptor_rekey: ts_hop.rekey.clone(),
            },
            access_manager: AccessManagerSecrets {
                hop: am_hop,
                pseudonym_decryption_key: am_pseudonym_key,
            },
            transcryptor: TranscryptorSecrets { hop: ts_hop },
            storage_facility: StorageFacilitySecrets {
                pseudonym_decryption_key: sf_pseudonym_key,
            },
        })
    }
}

/// A fresh per-cell data key and its encryption under the master data key.
pub struct DataKey {
    element: GroupElement,
}

impl DataKey {
    pub fn random() -> Self {
        Self {
            element: GroupElement::base_mult(&GroupScalar::random()),
        }
    }

    pub fn from_element(element: GroupElement) -> Self {
        Self { element }
    }

    /// Input key material for the derivation of page and metadata keys.
    pub fn ikm(&self) -> [u8; 32] {
        self.element.pack()
    }

    pub fn encrypt(&self, master_data_key: &ElgamalPublicKey) -> ElgamalCiphertext {
        ElgamalCiphertext::encrypt(&self.element, master_data_key)
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataKey([[REDACTED]])")
    }
}

#[cfg(test)]
mod tests {
    use crate::identifiers::ParticipantIdentifier;

    use super::*;

    fn transcrypt(
        keys: &SystemKeys,
        pp: &ElgamalCiphertext,
        domain: &PseudonymDomain,
    ) -> ElgamalCiphertext {
        let after_am = keys.access_manager.hop.pseudonym_hop(pp, domain).unwrap();
        keys.transcryptor
            .hop
            .pseudonym_hop(&after_am, domain)
            .unwrap()
    }

    #[test]
    fn local_pseudonyms_are_deterministic() {
        let keys = SystemKeys::generate().unwrap();
        let id = ParticipantIdentifier::new("Alice");

        let pp1 = id.polymorphic(&keys.master_pseudonym_key);
        let pp2 = id.polymorphic(&keys.master_pseudonym_key);
        assert_ne!(pp1, pp2);

        let domain = PseudonymDomain::AccessManager;
        let lp1 = transcrypt(&keys, pp1.ciphertext(), &domain)
            .decrypt(&keys.access_manager.pseudonym_decryption_key);
        let lp2 = transcrypt(&keys, pp2.ciphertext(), &domain)
            .decrypt(&keys.access_manager.pseudonym_decryption_key);
        assert_eq!(lp1, lp2);
    }

    #[test]
    fn local_pseudonyms_differ_across_parties() {
        let keys = SystemKeys::generate().unwrap();
        let pp = ParticipantIdentifier::new("Alice").polymorphic(&keys.master_pseudonym_key);

        let lp_am = transcrypt(&keys, pp.ciphertext(), &PseudonymDomain::AccessManager)
            .decrypt(&keys.access_manager.pseudonym_decryption_key);
        let lp_sf = transcrypt(&keys, pp.ciphertext(), &PseudonymDomain::StorageFacility)
            .decrypt(&keys.storage_facility.pseudonym_decryption_key);
        assert_ne!(lp_am, lp_sf);
    }

    #[test]
    fn access_group_pseudonyms_decrypt_with_enrollment_key() {
        let keys = SystemKeys::generate().unwrap();
        let pp = ParticipantIdentifier::new("Alice").polymorphic(&keys.master_pseudonym_key);

        let domain = PseudonymDomain::AccessGroup("ResearchAssessor".to_owned());
        let enc = transcrypt(&keys, pp.ciphertext(), &domain);
        let enrollment = keys.key_server.enroll("ResearchAssessor");
        let lp1 = enc.decrypt(&enrollment.pseudonym_key);

        // A second transcryption of a fresh pseudonym gives the same result.
        let pp2 = ParticipantIdentifier::new("Alice").polymorphic(&keys.master_pseudonym_key);
        let lp2 =
            transcrypt(&keys, pp2.ciphertext(), &domain).decrypt(&enrollment.pseudonym_key);
        assert_eq!(lp1, lp2);
    }

    #[test]
    fn data_key_blind_unblind_roundtrip() {
        let keys = SystemKeys::generate().unwrap();
        let data_key = DataKey::random();
        let encrypted = data_key.encrypt(&keys.master_data_key);

        let lp = LocalPseudonym::from_element(GroupElement::hash(b"participant at sf"));
        let cell = CellBinding {
            column: "ParticipantInfo",
            pseudonym: &lp,
            blinding_timestamp: TimeStamp::now(),
        };

        let blinded = keys
            .access_manager
            .hop
            .data_key_blind(&encrypted, &cell)
            .unwrap();
        let blinded = keys
            .transcryptor
            .hop
            .data_key_blind(&blinded, &cell)
            .unwrap();

        let unblinded = keys
            .access_manager
            .hop
            .data_key_unblind(&blinded, &cell, "ResearchAssessor")
            .unwrap();
        let unblinded = keys
            .transcryptor
            .hop
            .data_key_unblind(&unblinded, &cell, "ResearchAssessor")
            .unwrap();

        let enrollment = keys.key_server.enroll("ResearchAssessor");
        let recovered = unblinded.decrypt(&enrollment.data_key);
        assert_eq!(recovered.pack(), data_key.ikm());
    }

    #[test]
    fn unblinding_for_a_different_cell_yields_a_different_key() {
        let keys = SystemKeys::generate().unwrap();
        let data_key = DataKey::random();
        let encrypted = data_key.encrypt(&keys.master_data_key);

        let lp = LocalPseudonym::from_element(GroupElement::hash(b"participant at sf"));
        let ts = TimeStamp::now();
        let cell = CellBinding {
            column: "ParticipantInfo",
            pseudonym: &lp,
            blinding_timestamp: ts,
        };
        let other_cell = CellBinding {
            column: "OtherColumn",
            pseudonym: &lp,
            blinding_timestamp: ts,
        };

        let blinded = keys
            .access_manager
            .hop
            .data_key_blind(&encrypted, &cell)
            .unwrap();
        let blinded = keys
            .transcryptor
            .hop
            .data_key_blind(&blinded, &cell)
            .unwrap();

        let unblinded = keys
            .access_manager
            .hop
            .data_key_unblind(&blinded, &other_cell, "ResearchAssessor")
            .unwrap();
        let unblinded = keys
            .transcryptor
            .hop
            .data_key_unblind(&unblinded, &other_cell, "ResearchAssessor")
            .unwrap();

        let enrollment = keys.key_server.enroll("ResearchAssessor");
        let recovered = unblinded.decrypt(&enrollment.data_key);
        assert_ne!(recovered.pack(), data_key.ikm());
    }
}

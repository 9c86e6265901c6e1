// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages of the authentication service: token issuance and the token
//! blocklist.

use serde::{Deserialize, Serialize};

use crate::{
    codec,
    crypto::signatures::signable::{
        Signable, Signature, SignedStruct, Verifiable, VerifiedStruct,
    },
    time::TimeStamp,
};

/// Marker type for token signature keys.
#[derive(Debug, Clone)]
pub struct TokenKeyType;

const TOKEN_SIGN_LABEL: &str = "AsaToken";

/// The signed content of an enrollment token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    pub group: String,
    pub issued_at: TimeStamp,
    pub expires_at: TimeStamp,
}

/// A signed enrollment token. Presented to the Key Server on enrollment;
/// checked against the blocklist by the issuing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsaToken {
    claims: TokenClaims,
    signature: Signature<TokenKeyType>,
}

impl AsaToken {
    /// The claims before signature verification. Blocklist matching uses
    /// this; trust decisions go through [`Verifiable::verify`].
    pub fn unverified_claims(&self) -> &TokenClaims {
        &self.claims
    }
}

impl SignedStruct<TokenClaims, TokenKeyType> for AsaToken {
    fn from_payload(payload: TokenClaims, signature: Signature<TokenKeyType>) -> Self {
        Self {
            claims: payload,
            signature,
        }
    }
}

impl Signable for TokenClaims {
    type SignedOutput = AsaToken;
    type KeyType = TokenKeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
        codec::to_vec(self)
    }

    fn label(&self) -> &str {
        TOKEN_SIGN_LABEL
    }
}

impl Verifiable for AsaToken {
    type VerifiedStruct = TokenClaims;
    type KeyType = TokenKeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
        codec::to_vec(&self.claims)
    }

    fn signature(&self) -> &Signature<TokenKeyType> {
        &self.signature
    }

    fn label(&self) -> &str {
        TOKEN_SIGN_LABEL
    }
}

impl VerifiedStruct for AsaToken {
    fn into_verified(self) -> TokenClaims {
        self.claims
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsaTokenRequest {
    pub subject: String,
    pub group: String,
    pub expiration_time: TimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsaTokenResponse {
    pub token: AsaToken,
}

/// A blocklist entry invalidating every token with matching claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBlocklistEntry {
    pub subject: String,
    pub group: String,
    pub issued_at: TimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TokenBlocklistMutation {
    Create(TokenBlocklistEntry),
    Remove(TokenBlocklistEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBlocklistResponse {
    pub entries: Vec<TokenBlocklistEntry>,
}

#[cfg(test)]
mod tests {
    use crate::{crypto::signatures::SigningKey, time::Duration};

    use super::*;

    #[test]
    fn token_sign_verify_roundtrip() {
        let key = SigningKey::<TokenKeyType>::generate().unwrap();
        let claims = TokenClaims {
            subject: "bob".to_owned(),
            group: "ResearchAssessor".to_owned(),
            issued_at: TimeStamp::now(),
            expires_at: TimeStamp::now() + Duration::hours(1),
        };
        let token = claims.clone().sign(&key).unwrap();
        let verified = token.verify(&key.verifying_key()).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let key = SigningKey::<TokenKeyType>::generate().unwrap();
        let claims = TokenClaims {
            subject: "bob".to_owned(),
            group: "ResearchAssessor".to_owned(),
            issued_at: TimeStamp::now(),
            expires_at: TimeStamp::now() + Duration::hours(1),
        };
        let mut token = claims.sign(&key).unwrap();
        token.claims.group = "DataAdministrator".to_owned();
        assert!(token.verify(&key.verifying_key()).is_err());
    }
}

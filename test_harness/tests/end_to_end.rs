// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios driving the full constellation: enrollment, ticket
//! issuance, transcryption, storage and retrieval.

use std::collections::BTreeMap;

use morpho_test_harness::{Constellation, init_test_tracing};
use morphobackend::{access_manager::AmError, auth_service::AuthError, key_server::EnrollmentError};
use morphocommon::{
    identifiers::ParticipantIdentifier,
    messages::auth::TokenBlocklistEntry,
    ticketing::{AccessMode, TicketRequest},
};
use morphocoreclient::{CellWrite, Client, PlainExtra};

const COLUMN: &str = "ParticipantInfo";
const COLUMN_GROUP: &str = "StudyData";
const USER_GROUP: &str = "ResearchAssessor";

/// Seed the ledger with one column in one group and full data rules for the
/// assessor group.
async fn seed_study(constellation: &Constellation) {
    let storage = constellation.storage();
    storage.create_column(COLUMN).await.unwrap();
    storage.create_column_group(COLUMN_GROUP).await.unwrap();
    storage.add_column_to_group(COLUMN, COLUMN_GROUP).await.unwrap();
    for mode in [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::ReadMeta,
        AccessMode::WriteMeta,
    ] {
        storage
            .create_column_group_access_rule(COLUMN_GROUP, USER_GROUP, mode.as_str())
            .await
            .unwrap();
    }
}

fn file_extension(value: &str) -> BTreeMap<String, PlainExtra> {
    let mut extras = BTreeMap::new();
    extras.insert(
        "fileExtension".to_owned(),
        PlainExtra {
            value: value.as_bytes().to_vec(),
            stored_encrypted: true,
            bound_to_cell: false,
            known_by_access_manager: false,
        },
    );
    extras
}

async fn write_ticket(client: &Client, pps: Vec<morphocommon::identifiers::PolymorphicPseudonym>)
    -> morphocommon::ticketing::IndexedTicket
{
    client
        .request_ticket(&TicketRequest {
            pps,
            participant_groups: vec![],
            columns: vec![COLUMN.to_owned()],
            column_groups: vec![],
            modes: vec![
                AccessMode::Read,
                AccessMode::Write,
                AccessMode::WriteMeta,
            ],
            include_access_group_pseudonyms: false,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn store_and_retrieve_roundtrip() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    let ids = client
        .store_data(
            ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: b"hello".to_vec(),
                extras: file_extension(".txt"),
            }],
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, ids[0]);
    assert_eq!(entries[0].file_size, 5);

    let cell = client.retrieve_data(ticket, &entries[0]).await.unwrap();
    assert_eq!(cell.payload, b"hello");
    assert_eq!(cell.extras["fileExtension"], b".txt");
}

#[tokio::test]
async fn unauthorised_column_is_refused_with_the_missing_grant() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;
    // A column outside any group the assessors have rules for.
    constellation
        .storage()
        .create_column("SecretColumn")
        .await
        .unwrap();

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));

    let result = client
        .request_ticket(&TicketRequest {
            pps: vec![pp],
            participant_groups: vec![],
            columns: vec!["SecretColumn".to_owned()],
            column_groups: vec![],
            modes: vec![AccessMode::Read],
            include_access_group_pseudonyms: false,
        })
        .await;

    match result {
        Err(morphocoreclient::ClientError::AccessManager(AmError::AccessDenied(denied))) => {
            assert_eq!(denied.user_group, USER_GROUP);
            assert_eq!(denied.mode, AccessMode::Read);
            assert_eq!(denied.subject, "SecretColumn");
        }
        other => panic!("expected access denied, got {other:?}"),
    }
}

#[tokio::test]
async fn checksum_chain_detects_physical_tampering() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;
    let storage = constellation.storage();

    let (checksum, checkpoint) = storage.compute_checksum("columns", None).await.unwrap();

    sqlx::query("UPDATE columns SET name = 'Mallory' WHERE seqno = 1")
        .execute(storage.raw_pool())
        .await
        .unwrap();

    let (tampered, _) = storage.compute_checksum("columns", None).await.unwrap();
    assert_ne!(checksum, tampered);

    // Checkpoints below the tampered row are unaffected.
    let (below, _) = storage
        .compute_checksum("columns", Some(checkpoint - 1))
        .await
        .unwrap();
    assert_eq!(below, 0);
}

#[tokio::test]
async fn participant_group_resolution_is_a_snapshot() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;
    let storage = constellation.storage();

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("P"));

    // First ticket registers the participant with the Access Manager.
    let first = write_ticket(&client, vec![pp]).await;
    client
        .store_data(
            &first.ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: b"cell".to_vec(),
                extras: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();
    let lp = storage.local_pseudonyms().await.unwrap()[0];

    storage.create_participant_group("Cohort").await.unwrap();
    storage
        .create_participant_group_access_rule("Cohort", USER_GROUP, AccessMode::Access.as_str())
        .await
        .unwrap();
    storage.add_participant_to_group(&lp, "Cohort").await.unwrap();

    let group_request = TicketRequest {
        pps: vec![],
        participant_groups: vec!["Cohort".to_owned()],
        columns: vec![COLUMN.to_owned()],
        column_groups: vec![],
        modes: vec![AccessMode::Read],
        include_access_group_pseudonyms: false,
    };

    // Issued while P is a member: resolves to P.
    let issued_before = client.request_ticket(&group_request).await.unwrap();
    assert_eq!(issued_before.ticket.unvalidated().pseudonyms.len(), 1);
    assert_eq!(issued_before.participant_groups["Cohort"], vec![0]);

    storage
        .remove_participant_from_group(&lp, "Cohort")
        .await
        .unwrap();

    // The earlier ticket still authorises reads of P's cells.
    let entries = client
        .enumerate_data(&issued_before.ticket, None, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let cell = client
        .retrieve_data(&issued_before.ticket, &entries[0])
        .await
        .unwrap();
    assert_eq!(cell.payload, b"cell");

    // A fresh request no longer includes P.
    let issued_after = client.request_ticket(&group_request).await.unwrap();
    assert_eq!(issued_after.ticket.unvalidated().pseudonyms.len(), 0);
}

#[tokio::test]
async fn metadata_only_update_preserves_payload() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    client
        .store_data(
            ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: b"v1".to_vec(),
                extras: file_extension(".txt"),
            }],
        )
        .await
        .unwrap();

    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    let updated_id = client
        .update_metadata(ticket, &entries[0], &file_extension(".csv"))
        .await
        .unwrap();
    assert_ne!(updated_id, entries[0].id);

    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, updated_id);

    let cell = client.retrieve_data(ticket, &entries[0]).await.unwrap();
    assert_eq!(cell.payload, b"v1");
    assert_eq!(cell.extras["fileExtension"], b".csv");
}

#[tokio::test]
async fn blocklisted_token_is_rejected_until_unblocked() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;
    constellation.provision_user("bob", USER_GROUP).await;

    let token = constellation.issue_token("bob", USER_GROUP).await;
    let claims = token.unverified_claims().clone();
    let entry = TokenBlocklistEntry {
        subject: claims.subject.clone(),
        group: claims.group.clone(),
        issued_at: claims.issued_at,
    };
    constellation.auth_service.block(&entry).await.unwrap();

    let refused = constellation.key_server.enroll(&token).await;
    assert!(matches!(
        refused,
        Err(EnrollmentError::Auth(AuthError::AccessDenied(_)))
    ));

    constellation.auth_service.unblock(&entry).await.unwrap();
    assert!(constellation.key_server.enroll(&token).await.is_ok());
}

#[tokio::test]
async fn deletion_tombstones_the_cell() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    client
        .store_data(
            ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: b"doomed".to_vec(),
                extras: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();

    let response = client
        .delete_data(
            ticket,
            vec![morphocommon::messages::storage::DataRequestEntry {
                column_index: 0,
                pseudonym_index: 0,
            }],
        )
        .await
        .unwrap();
    assert_eq!(response.entries.len(), 1);

    assert!(client
        .enumerate_data(ticket, None, None)
        .await
        .unwrap()
        .is_empty());

    // The ledger history still shows both generations.
    let history = client.data_history(ticket, None, None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|entry| entry.tombstone));
}

#[tokio::test]
async fn replacing_a_cell_keeps_one_current_version() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    for payload in [b"one".as_slice(), b"two".as_slice()] {
        client
            .store_data(
                ticket,
                &[CellWrite {
                    column_index: 0,
                    pseudonym_index: 0,
                    payload: payload.to_vec(),
                    extras: BTreeMap::new(),
                }],
            )
            .await
            .unwrap();
    }

    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    assert_eq!(entries.len(), 1);
    let cell = client.retrieve_data(ticket, &entries[0]).await.unwrap();
    assert_eq!(cell.payload, b"two");
}

#[tokio::test]
async fn access_group_pseudonyms_are_stable_for_the_requester() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let identifier = ParticipantIdentifier::new("Alice");

    let request = |pp| TicketRequest {
        pps: vec![pp],
        participant_groups: vec![],
        columns: vec![COLUMN.to_owned()],
        column_groups: vec![],
        modes: vec![AccessMode::Read],
        include_access_group_pseudonyms: true,
    };

    // Two tickets from two distinct polymorphic pseudonyms of the same
    // participant decrypt to the same access-group pseudonym.
    let first = client
        .request_ticket(&request(client.polymorphic_pseudonym(&identifier)))
        .await
        .unwrap();
    let second = client
        .request_ticket(&request(client.polymorphic_pseudonym(&identifier)))
        .await
        .unwrap();

    let lp_first = client
        .access_group_pseudonym(first.ticket.unvalidated(), 0)
        .unwrap();
    let lp_second = client
        .access_group_pseudonym(second.ticket.unvalidated(), 0)
        .unwrap();
    assert_eq!(lp_first, lp_second);
}

#[tokio::test]
async fn large_payloads_are_paged() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 241) as u8).collect();
    client
        .store_data(
            ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: payload.clone(),
                extras: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();

    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    assert_eq!(entries[0].file_size as usize, payload.len());
    let cell = client.retrieve_data(ticket, &entries[0]).await.unwrap();
    assert_eq!(cell.payload, payload);
}

#[tokio::test]
async fn column_access_overview_reports_granted_groups() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let response = client
        .column_access(&morphocommon::messages::access_manager::ColumnAccessRequest {
            include_implicit: false,
            require_modes: vec![AccessMode::Read],
        })
        .await
        .unwrap();

    assert!(response.column_groups.contains_key(COLUMN_GROUP));
    assert_eq!(response.columns, vec![COLUMN.to_owned()]);
}

#[tokio::test]
async fn tickets_observe_rule_changes_only_at_issuance() {
    init_test_tracing();
    let constellation = Constellation::start().await;
    seed_study(&constellation).await;
    let storage = constellation.storage();

    let client = constellation.enroll_client("alice", USER_GROUP).await;
    let pp = client.polymorphic_pseudonym(&ParticipantIdentifier::new("Alice"));
    let indexed = write_ticket(&client, vec![pp]).await;
    let ticket = &indexed.ticket;

    client
        .store_data(
            ticket,
            &[CellWrite {
                column_index: 0,
                pseudonym_index: 0,
                payload: b"still here".to_vec(),
                extras: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();

    // Revoke the rules after issuance.
    for mode in [AccessMode::Read, AccessMode::Write, AccessMode::WriteMeta] {
        storage
            .remove_column_group_access_rule(COLUMN_GROUP, USER_GROUP, mode.as_str())
            .await
            .unwrap();
    }

    // The in-flight ticket still works.
    let entries = client.enumerate_data(ticket, None, None).await.unwrap();
    let cell = client.retrieve_data(ticket, &entries[0]).await.unwrap();
    assert_eq!(cell.payload, b"still here");

    // A fresh ticket request is now refused.
    let refused = client
        .request_ticket(&TicketRequest {
            pps: vec![],
            participant_groups: vec![],
            columns: vec![COLUMN.to_owned()],
            column_groups: vec![],
            modes: vec![AccessMode::Read],
            include_access_group_pseudonyms: false,
        })
        .await;
    assert!(matches!(
        refused,
        Err(morphocoreclient::ClientError::AccessManager(
            AmError::AccessDenied(_)
        ))
    ));
}

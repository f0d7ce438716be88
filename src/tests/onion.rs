//! Batched onion decode: replay detection and cross-restart idempotence.

use super::test_utils::*;
use crate::onion::{DecodeHopIteratorRequest, OnionProcessor, SphinxError};
use crate::store::Store;
use crate::types::ShortChannelId;
use crate::wire::FailureCode;
use std::sync::Arc;

fn request(seed: u8, rhash: crate::types::Hash256) -> DecodeHopIteratorRequest {
    DecodeHopIteratorRequest {
        onion_blob: test_onion_blob(seed),
        rhash,
        incoming_cltv: 800_100,
        incoming_amount: 100_000,
        blinding_point: None,
    }
}

fn relay_processor(store: Store) -> OnionProcessor<Store> {
    OnionProcessor::new(
        Arc::new(MockSphinxRouter::new(ScriptedHop::Relay {
            next_hop: ShortChannelId::from_u64(42),
            amount: 99_000,
            outgoing_cltv: 800_060,
        })),
        Arc::new(NoopBlindingProcessor),
        store,
    )
}

#[tokio::test]
async fn test_batch_decode_success() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = relay_processor(store);

    let rhash = gen_rand_sha256_hash();
    let responses = processor
        .decode_hop_iterators(b"batch-0", vec![request(1, rhash), request(2, rhash)])
        .await;

    assert_eq!(responses.len(), 2);
    for response in &responses {
        assert_eq!(response.fail_code, None);
        let iterator = response.hop_iterator.as_ref().expect("iterator");
        assert!(!iterator.is_final_hop());
        let payload = iterator.hop_payload().expect("payload");
        assert_eq!(payload.next_hop(), Some(ShortChannelId::from_u64(42)));
        assert_eq!(payload.amt_to_forward(), Some(99_000));
    }
}

#[tokio::test]
async fn test_replay_within_batch() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = relay_processor(store);

    // Two requests with identical ciphertext: exactly one is processed, the
    // other fails with a temporary channel failure.
    let rhash = gen_rand_sha256_hash();
    let responses = processor
        .decode_hop_iterators(b"batch-replay", vec![request(7, rhash), request(7, rhash)])
        .await;

    assert_eq!(responses[0].fail_code, None);
    assert!(responses[0].hop_iterator.is_some());
    assert_eq!(
        responses[1].fail_code,
        Some(FailureCode::TemporaryChannelFailure)
    );
    assert!(responses[1].hop_iterator.is_none());
}

#[tokio::test]
async fn test_replay_across_batches() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = relay_processor(store);

    let rhash = gen_rand_sha256_hash();
    let responses = processor
        .decode_hop_iterators(b"batch-a", vec![request(9, rhash)])
        .await;
    assert_eq!(responses[0].fail_code, None);

    // The same packet in a later batch is a replay.
    let responses = processor
        .decode_hop_iterators(b"batch-b", vec![request(9, rhash)])
        .await;
    assert_eq!(
        responses[0].fail_code,
        Some(FailureCode::TemporaryChannelFailure)
    );
}

#[tokio::test]
async fn test_same_batch_id_is_idempotent() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let rhash = gen_rand_sha256_hash();

    let first_codes: Vec<_> = {
        let store = Store::new(dir.path()).expect("open store");
        let processor = relay_processor(store);
        processor
            .decode_hop_iterators(b"batch-x", vec![request(3, rhash), request(3, rhash)])
            .await
            .iter()
            .map(|r| r.fail_code)
            .collect()
    };

    // The same batch id with identical request ordering, as a link replays
    // after a restart, must produce identical results.
    let store = Store::new(dir.path()).expect("reopen store");
    let processor = relay_processor(store);
    let second_codes: Vec<_> = processor
        .decode_hop_iterators(b"batch-x", vec![request(3, rhash), request(3, rhash)])
        .await
        .iter()
        .map(|r| r.fail_code)
        .collect();

    assert_eq!(first_codes, second_codes);
    assert_eq!(first_codes[0], None);
    assert_eq!(first_codes[1], Some(FailureCode::TemporaryChannelFailure));
}

#[tokio::test]
async fn test_decode_failures_keep_specific_codes() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = OnionProcessor::new(
        Arc::new(FailingSphinxRouter(SphinxError::InvalidHmac)),
        Arc::new(NoopBlindingProcessor),
        store,
    );

    let rhash = gen_rand_sha256_hash();
    let mut bad_version = request(1, rhash);
    bad_version.onion_blob[0] = 9;

    let responses = processor
        .decode_hop_iterators(b"batch-f", vec![bad_version, request(2, rhash)])
        .await;

    assert_eq!(
        responses[0].fail_code,
        Some(FailureCode::InvalidOnionVersion)
    );
    assert_eq!(responses[1].fail_code, Some(FailureCode::InvalidOnionHmac));
}

#[tokio::test]
async fn test_reconstruct_bypasses_replay_log() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = relay_processor(store);

    let rhash = gen_rand_sha256_hash();
    let responses = processor
        .decode_hop_iterators(b"batch-r", vec![request(5, rhash)])
        .await;
    assert_eq!(responses[0].fail_code, None);

    // Contract resolution re-derives the payload of an already-seen packet;
    // no replay failure applies.
    let iterator = processor
        .reconstruct_hop_iterator(&test_onion_blob(5), rhash, None)
        .expect("reconstruct");
    let payload = iterator.hop_payload().expect("payload");
    assert_eq!(payload.next_hop(), Some(ShortChannelId::from_u64(42)));
}

#[tokio::test]
async fn test_extract_error_encrypter() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(dir.path()).expect("open store");
    let processor = relay_processor(store);

    let key = gen_rand_pubkey();
    let encrypter = processor.extract_error_encrypter(&key).expect("encrypter");
    assert_eq!(encrypter.ephemeral_key(), key);

    let reason = b"temporary channel failure".to_vec();
    let blob = encrypter.encrypt_first_hop(&reason);
    assert_ne!(blob, reason);
    assert_eq!(encrypter.reencrypt(&blob), reason);
}

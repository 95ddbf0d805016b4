//! Property-based tests for persistence operations
//!
//! Tests for:
//! - Codec: roundtrip for every suite, tamper detection, key isolation
//! - Validator: never panics, sentinels always rejected
//! - Store: load is total over arbitrary stored payloads

use super::codec::{CipherSuite, Codec, Envelope};
use super::kv::{KeyValueStore, MemoryStore};
use super::store::{LoadOptions, LoadSource, PersistentStore, StoreCore};
use super::validator::{classify, Classification};
use proptest::prelude::*;
use std::sync::Arc;

fn suite() -> impl Strategy<Value = CipherSuite> {
    prop_oneof![
        Just(CipherSuite::Aes256Gcm),
        Just(CipherSuite::ChaCha20Poly1305)
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// CODEC PROPERTY TESTS
// ============================================================================

proptest! {
    /// Property: decrypt(encrypt(p)) == p for every suite
    #[test]
    fn codec_roundtrip_preserves_data(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        key_byte in any::<u8>(),
        suite in suite(),
    ) {
        let codec = Codec::new(&[key_byte; 32]).unwrap().with_suite(suite);

        let envelope = codec.encrypt(&data).unwrap();
        prop_assert_eq!(envelope.version, suite.version() as u8);
        prop_assert_eq!(codec.decrypt(&envelope).unwrap(), data);
    }

    /// Property: flipping any single byte of the serialized envelope is
    /// detected
    #[test]
    fn codec_detects_any_single_byte_flip(
        data in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let codec = Codec::new(&[9u8; 32]).unwrap();
        let mut bytes = codec.encrypt(&data).unwrap().to_bytes();
        let i = position.index(bytes.len());
        bytes[i] ^= mask;

        let opened = Envelope::from_bytes(&bytes).and_then(|e| codec.decrypt(&e));
        prop_assert!(opened.is_err(), "tampered envelope at byte {} must not open", i);
    }

    /// Property: a value sealed under one key never opens under another
    #[test]
    fn codec_key_isolation(
        data in prop::collection::vec(any::<u8>(), 0..512),
        a in any::<u8>(),
        b in any::<u8>(),
    ) {
        prop_assume!(a != b);
        let sealed = Codec::new(&[a; 32]).unwrap().encrypt(&data).unwrap();

        prop_assert!(Codec::new(&[b; 32]).unwrap().decrypt(&sealed).is_err());
    }
}

// ============================================================================
// VALIDATOR PROPERTY TESTS
// ============================================================================

proptest! {
    /// Property: classification is total
    #[test]
    fn validator_never_panics(raw in ".*") {
        let _ = classify(Some(&raw));
    }

    /// Property: anything carrying a control character is rejected
    #[test]
    fn validator_rejects_control_characters(
        prefix in "[a-z]{0,8}",
        control in 0u8..0x20,
    ) {
        prop_assume!(!matches!(control, b'\t' | b'\n' | b'\r'));
        let raw = format!("\"{}{}\"", prefix, control as char);

        prop_assert!(matches!(classify(Some(&raw)), Classification::Corrupted(_)));
    }
}

// ============================================================================
// STORE PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: load never fails, whatever is stored under the key
    #[test]
    fn load_is_total(raw in ".{0,256}") {
        let rt = runtime();
        let outcome = rt.block_on(async {
            let kv = MemoryStore::new();
            kv.set("numbers", &raw).await.unwrap();
            let core = StoreCore::new(
                "numbers",
                Arc::new(kv),
                Arc::new(Codec::new(&[3u8; 32]).unwrap()),
                LoadOptions::default(),
                tokio::runtime::Handle::current(),
            );
            PersistentStore::from_core(core, vec![0u32]).load_with_report().await
        });

        match outcome.source {
            LoadSource::Default => prop_assert_eq!(outcome.value, vec![0u32]),
            LoadSource::Migrated => {
                let legacy: Vec<u32> = serde_json::from_str(&raw).unwrap();
                prop_assert_eq!(outcome.value, legacy);
            }
            other => prop_assert!(false, "unexpected source {:?}", other),
        }
    }

    /// Property: the last saved value is the one loaded
    #[test]
    fn last_save_wins(values in prop::collection::vec(any::<u32>(), 1..16)) {
        let rt = runtime();
        let loaded = rt.block_on(async {
            let core = StoreCore::new(
                "last",
                Arc::new(MemoryStore::new()),
                Arc::new(Codec::new(&[5u8; 32]).unwrap()),
                LoadOptions::default(),
                tokio::runtime::Handle::current(),
            );
            let store = PersistentStore::from_core(core, 0u32);

            let pending: Vec<_> = values.iter().map(|v| store.save(v)).collect();
            for write in pending.into_iter().rev() {
                write.await.unwrap();
            }
            store.load().await
        });

        prop_assert_eq!(Some(&loaded), values.last());
    }
}

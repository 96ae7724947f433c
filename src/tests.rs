use std::sync::Arc;
use std::time::Duration;

use crate::bond::{BondError, BondManager, BondRecordStore, BondState, Peripheral};
use crate::challenge::{AuthError, ChallengeEngine, RejectReason, ResponseMode, SimulatedPeripheral, SimulatedRadio};
use crate::config::BondConfig;
use crate::random::OsRandom;
use crate::storage::{MemoryStorage, SealedFileStorage, SecureStorage, StorageError, StorageOp};

const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Manager and engine sharing one store, talking to peripherals over a simulated radio
struct Harness {
    manager: BondManager,
    engine: ChallengeEngine,
    radio: Arc<SimulatedRadio>,
}

impl Harness {
    fn new(storage: Arc<dyn SecureStorage>) -> Self {
        init_logging();
        let config = BondConfig::default();
        let store = Arc::new(BondRecordStore::new(storage, &config));
        let radio = Arc::new(SimulatedRadio::new());
        let engine = ChallengeEngine::new(store.clone(), Arc::new(OsRandom), radio.clone(), config.clone()).unwrap();
        Self {
            manager: BondManager::new(store, config).unwrap(),
            engine,
            radio,
        }
    }

    async fn pair(&self, peripheral: Arc<SimulatedPeripheral>) -> Result<(), BondError> {
        self.radio.connect(peripheral.clone());
        self.manager.begin_bonding(peripheral.as_ref()).await?;
        self.manager
            .complete_bonding(peripheral.id(), &peripheral.fingerprint(), &peripheral.public_key())
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_bond_authenticate_replay_revoke() {
    let h = Harness::new(Arc::new(MemoryStorage::new()));
    let tag = Arc::new(SimulatedPeripheral::generate(DEVICE).with_name("Kettle"));
    h.pair(tag.clone()).await.unwrap();

    let bond = h.manager.load_bond(DEVICE).await.unwrap().unwrap();
    assert_eq!(bond.pubkey_fingerprint.unwrap().to_string(), tag.fingerprint());
    assert_eq!(bond.device_name.as_deref(), Some("Kettle"));

    assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());

    tag.set_mode(ResponseMode::Replay);
    assert_eq!(
        h.engine.authenticate(DEVICE).await.unwrap().reject_reason(),
        Some(RejectReason::NonceReplay)
    );

    h.manager.revoke_bond(DEVICE).await.unwrap();
    assert_eq!(h.manager.load_bond(DEVICE).await.unwrap(), None);

    tag.set_mode(ResponseMode::Honest);
    assert_eq!(
        h.engine.authenticate(DEVICE).await.unwrap().reject_reason(),
        Some(RejectReason::NoBond)
    );
}

#[tokio::test]
async fn test_empty_fingerprint_persists_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let h = Harness::new(storage.clone());
    let tag = SimulatedPeripheral::generate(DEVICE);

    h.manager.begin_bonding(&tag).await.unwrap();
    let err = h.manager.complete_bonding(DEVICE, "", &tag.public_key()).await.unwrap_err();
    assert!(matches!(err, BondError::InvalidFingerprint(_)));
    assert!(storage.is_empty());
    assert_eq!(h.manager.load_bond(DEVICE).await.unwrap(), None);
}

#[tokio::test]
async fn test_cancelled_prompt_leaves_device_unbonded() {
    let storage = Arc::new(MemoryStorage::new());
    let h = Harness::new(storage.clone());
    storage.fail_next(StorageOp::Put, StorageError::UserCancelled);

    let err = h.pair(Arc::new(SimulatedPeripheral::generate(DEVICE))).await.unwrap_err();
    assert_eq!(err, BondError::PersistenceFailed(StorageError::UserCancelled));
    assert_eq!(h.manager.bond_state(DEVICE).await.unwrap(), BondState::Unbonded);
    assert_eq!(
        h.engine.authenticate(DEVICE).await.unwrap().reject_reason(),
        Some(RejectReason::NoBond)
    );
}

#[tokio::test]
async fn test_swapped_peripheral_forces_revocation() {
    let h = Harness::new(Arc::new(MemoryStorage::new()));
    let original = Arc::new(SimulatedPeripheral::generate(DEVICE));
    h.pair(original.clone()).await.unwrap();
    assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());

    // same address, new key
    let replacement = Arc::new(SimulatedPeripheral::generate(DEVICE));
    h.pair(replacement.clone()).await.unwrap();

    let bond = h.manager.load_bond(DEVICE).await.unwrap().unwrap();
    assert_eq!(bond.pubkey_fingerprint.unwrap().to_string(), replacement.fingerprint());
    assert!(bond.nonce_history.is_empty());
    assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());

    // the old key no longer passes
    h.radio.connect(original);
    assert_eq!(
        h.engine.authenticate(DEVICE).await.unwrap().reject_reason(),
        Some(RejectReason::BadSignature)
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_session_per_device() {
    let h = Harness::new(Arc::new(MemoryStorage::new()));
    let slow = Arc::new(SimulatedPeripheral::generate(DEVICE).with_latency(Duration::from_millis(200)));
    let other = Arc::new(SimulatedPeripheral::generate("11:22:33:44:55:66").with_latency(Duration::from_millis(200)));
    h.pair(slow).await.unwrap();
    h.pair(other).await.unwrap();

    let (first, second, independent) = futures::join!(
        h.engine.authenticate(DEVICE),
        async {
            tokio::task::yield_now().await;
            h.engine.authenticate(DEVICE).await
        },
        h.engine.authenticate("11:22:33:44:55:66"),
    );
    assert!(first.unwrap().is_authenticated());
    assert_eq!(second, Err(AuthError::SessionInProgress(DEVICE.into())));
    assert!(independent.unwrap().is_authenticated());
}

#[tokio::test]
async fn test_concurrent_ceremonies_conflict() {
    let h = Harness::new(Arc::new(MemoryStorage::new()));
    let tag = SimulatedPeripheral::generate(DEVICE);

    let (a, b) = futures::join!(h.manager.begin_bonding(&tag), h.manager.begin_bonding(&tag));
    assert!(a.is_ok() ^ b.is_ok());
    assert!(matches!(
        a.err().or(b.err()),
        Some(BondError::SessionInProgress(_))
    ));
}

#[tokio::test]
async fn test_cancelled_authentication_releases_session() {
    let h = Harness::new(Arc::new(MemoryStorage::new()));
    let tag = Arc::new(SimulatedPeripheral::generate(DEVICE));
    h.pair(tag.clone()).await.unwrap();
    tag.set_mode(ResponseMode::Silent);

    let attempt = tokio::time::timeout(Duration::from_millis(20), h.engine.authenticate(DEVICE)).await;
    assert!(attempt.is_err());
    assert!(!h.engine.session_active(DEVICE));

    tag.set_mode(ResponseMode::Honest);
    assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());
    let bond = h.manager.load_bond(DEVICE).await.unwrap().unwrap();
    assert_eq!(bond.nonce_history.len(), 1);
}

#[tokio::test]
async fn test_bonds_survive_restart_on_disk() {
    init_logging();
    let dir = std::env::temp_dir().join(format!("peribond-restart-{}", uuid::Uuid::new_v4()));
    let tag = Arc::new(SimulatedPeripheral::generate(DEVICE));

    {
        let storage = SealedFileStorage::open_with_local_key(&dir).await.unwrap();
        let h = Harness::new(Arc::new(storage));
        h.pair(tag.clone()).await.unwrap();
        assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());
    }

    let storage = SealedFileStorage::open_with_local_key(&dir).await.unwrap();
    let h = Harness::new(Arc::new(storage));
    h.radio.connect(tag);
    let bond = h.manager.load_bond(DEVICE).await.unwrap().unwrap();
    assert_eq!(bond.nonce_history.len(), 1);
    assert_eq!(h.manager.list_bonds().await.unwrap().len(), 1);
    assert!(h.engine.authenticate(DEVICE).await.unwrap().is_authenticated());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_pairing_from_spawned_tasks() {
    init_logging();
    let dir = std::env::temp_dir().join(format!("peribond-parallel-{}", uuid::Uuid::new_v4()));
    let storage = SealedFileStorage::open_with_local_key(&dir).await.unwrap();
    let h = Arc::new(Harness::new(Arc::new(storage)));

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let h = h.clone();
            tokio::spawn(async move {
                let tag = Arc::new(SimulatedPeripheral::generate(format!("AA:BB:CC:DD:EE:{:02X}", i)));
                h.pair(tag.clone()).await.unwrap();
                h.engine.authenticate(tag.id()).await.unwrap().is_authenticated()
            })
        })
        .collect();
    for authenticated in futures::future::join_all(tasks).await {
        assert!(authenticated.unwrap());
    }

    let mut ids: Vec<String> = h
        .manager
        .list_bonds()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.device_id)
        .collect();
    ids.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("AA:BB:CC:DD:EE:{:02X}", i)).collect();
    assert_eq!(ids, expected);

    let _ = std::fs::remove_dir_all(&dir);
}

//! Clone operations driven across the bridge, with the host owning the port.

use std::{sync::Arc, time::Duration};

use radio_clone_bridge::BridgedRuntime;
use radio_clone_core::{
    CloneContext, CloneError, CloneEvent, CloneTiming, CloneTransport, MemoryRow, ProgressStore,
    ToneMode,
};
use radio_clone_engine::{DeviceFamily, FamilyRegistry};
use radio_clone_serial::{Faults, SimCommand, SimulatedRadio, TransportOwner};

fn memory() -> Vec<u8> {
    let mut memory = vec![0xFF; 128];
    memory[..0x10].copy_from_slice(&[0x42; 0x10]);
    memory[0x10..0x20].copy_from_slice(&[
        0x00, 0x20, 0x65, 0x14, 0x00, 0x20, 0x65, 0x14, 0xFF, 0xFF, 0xFF, 0xFF, 0x08, 0x01,
        0x02, 0x03,
    ]);
    memory
}

async fn start() -> (BridgedRuntime, SimulatedRadio, Arc<ProgressStore>) {
    let family = DeviceFamily::p3107();
    let radio = SimulatedRadio::new(&family.program_command, b"P3107\x01\x00\x00", memory());
    let owner = TransportOwner::new(radio.clone());
    owner.open(family.baud_rate).await.unwrap();

    let progress = ProgressStore::shared();
    let runtime = BridgedRuntime::start(
        Arc::new(owner),
        Arc::new(FamilyRegistry::builtin()),
        CloneContext::new(CloneTiming::fast()),
        Arc::clone(&progress),
    );
    (runtime, radio, progress)
}

async fn wait_finished(progress: &ProgressStore) -> Vec<CloneEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let history = progress.get_history();
            if history
                .iter()
                .any(|e| matches!(e, CloneEvent::Finished { .. }))
            {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_download_over_bridge() {
    let (runtime, radio, progress) = start().await;
    let client = runtime.client();
    let key = DeviceFamily::p3107().key;

    let summary = client.download(&key).await.unwrap();
    assert_eq!(summary.size, 128);
    assert_eq!(summary.rows, vec![MemoryRow::new(1, 146_520_000)]);
    assert_eq!(radio.count(|c| matches!(c, SimCommand::Read(_))), 16);
    assert_eq!(radio.count(|c| *c == SimCommand::Exit), 1);

    let image = client.export_image(&key).await.unwrap();
    assert_eq!(image.bytes(), memory().as_slice());

    let history = wait_finished(&progress).await;
    assert!(history.contains(&CloneEvent::Status {
        message: "Cloning from radio".into(),
        current: 16,
        max: 16,
    }));
    assert_eq!(history.last(), Some(&CloneEvent::Finished { ok: true }));
}

#[tokio::test]
async fn test_upload_over_bridge() {
    let (runtime, radio, _) = start().await;
    let client = runtime.client();
    let key = DeviceFamily::p3107().key;
    client.download(&key).await.unwrap();

    let edit = MemoryRow {
        tone_mode: ToneMode::Tsql,
        c_tone: 1000,
        ..MemoryRow::new(4, 446_000_000)
    };
    let summary = client
        .upload(&key, vec![MemoryRow::new(1, 146_520_000), edit.clone()])
        .await
        .unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(
        client.cached_rows(&key).await.unwrap(),
        vec![MemoryRow::new(1, 146_520_000), edit.clone()]
    );

    let summary = client.upload(&key, vec![edit.clone()]).await.unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(client.cached_rows(&key).await.unwrap(), vec![edit]);
    assert_eq!(&radio.memory()[..0x10], &[0x42; 0x10]);
}

#[tokio::test]
async fn test_engine_errors_keep_their_kind() {
    let (runtime, radio, progress) = start().await;
    let client = runtime.client();
    let key = DeviceFamily::p3107().key;

    let err = client
        .upload(&key, vec![MemoryRow::new(1, 146_520_000)])
        .await
        .unwrap_err();
    assert!(matches!(&err, CloneError::NoCachedImage(_)));
    assert!(err.to_string().starts_with("No cached radio image"));
    assert!(!err.is_retryable());

    radio.set_faults(Faults {
        stall_read_at: Some(0x0020),
        ..Faults::default()
    });
    let err = client.download(&key).await.unwrap_err();
    assert!(matches!(err, CloneError::BlockReadFailed { address: 0x0020 }));
    assert_eq!(err.to_string(), "Failed to read block at 0x0020");
    assert!(err.is_retryable());
    assert_eq!(radio.count(|c| *c == SimCommand::Exit), 1);
    assert_eq!(
        wait_finished(&progress).await.last(),
        Some(&CloneEvent::Finished { ok: false })
    );
}

#[tokio::test]
async fn test_refused_enter_is_retryable_on_host() {
    let (runtime, radio, _) = start().await;
    let client = runtime.client();
    radio.set_faults(Faults {
        refuse_enter: true,
        ..Faults::default()
    });

    let err = client.download(&DeviceFamily::p3107().key).await.unwrap_err();
    assert!(matches!(err, CloneError::ProtocolRefused(_)), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(err.hint(), CloneError::ProtocolRefused(String::new()).hint());
}

#[tokio::test]
async fn test_closed_port_reaches_host_as_not_connected() {
    let family = DeviceFamily::p3107();
    let radio = SimulatedRadio::new(&family.program_command, b"P3107\x01\x00\x00", memory());
    let runtime = BridgedRuntime::start(
        Arc::new(TransportOwner::new(radio.clone())),
        Arc::new(FamilyRegistry::builtin()),
        CloneContext::new(CloneTiming::fast()),
        ProgressStore::shared(),
    );

    let err = runtime.client().download(&family.key).await.unwrap_err();
    assert!(matches!(err, CloneError::NotConnected), "{err:?}");
    assert!(err.is_retryable());
    assert!(radio.commands().is_empty());
}

#[tokio::test]
async fn test_restore_and_families() {
    let (runtime, radio, _) = start().await;
    let client = runtime.client();
    let key = DeviceFamily::p3107().key;

    let families = client.families().await.unwrap();
    assert_eq!(families.len(), 1);
    assert_eq!(families[0].key, key);

    let mut backup = memory();
    backup[0x30..0x34].copy_from_slice(&[0x00, 0x00, 0x60, 0x44]);
    backup[0x34..0x38].copy_from_slice(&[0x00, 0x00, 0x60, 0x44]);
    assert_eq!(client.import_image(&key, backup.clone()).await.unwrap(), 128);
    assert!(radio.commands().is_empty());

    client.upload_image(&key, backup.clone()).await.unwrap();
    assert_eq!(radio.memory(), backup);
}

#[tokio::test]
async fn test_shutdown_fails_later_calls() {
    let (mut runtime, radio, _) = start().await;
    let client = runtime.client();
    runtime.shutdown();

    let err = client.download(&DeviceFamily::p3107().key).await.unwrap_err();
    assert_eq!(err.to_string(), "bridge closed");
    assert!(radio.commands().is_empty());
}

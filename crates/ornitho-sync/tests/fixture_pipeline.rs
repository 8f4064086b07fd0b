use std::path::{Path, PathBuf};

use ornitho_adapters::{OrnithoListingSource, TableNameLookup};
use ornitho_core::SentState;
use ornitho_storage::{PolitenessDelay, SightingStore};
use ornitho_sync::{ReconcilePolicy, RecordingNotifier, SyncConfig, SyncPipeline};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_pipeline(state_file: &Path, policy: ReconcilePolicy) -> SyncPipeline {
    let root = workspace_root();
    let config = SyncConfig {
        state_file: state_file.to_path_buf(),
        policy,
        politeness: PolitenessDelay::disabled(),
        ..Default::default()
    };
    let source = OrnithoListingSource::fixtures(root.join("fixtures/ornitho/listing"), 10);
    let names = TableNameLookup::from_yaml_file(root.join("names.yaml")).expect("names.yaml");
    SyncPipeline::from_parts(config, Box::new(source), Box::new(names))
}

#[tokio::test]
async fn cursor_policy_notifies_once_and_stops_early_next_time() {
    let dir = tempdir().expect("tempdir");
    let state_file = dir.path().join("last_sent.json");

    let mut first = RecordingNotifier::default();
    let summary = fixture_pipeline(&state_file, ReconcilePolicy::default())
        .run_once(&mut first)
        .await
        .expect("first run");
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.notified, 3);
    assert_eq!(
        first.sent.iter().map(|s| s.location.as_str()).collect::<Vec<_>>(),
        vec![
            "Sant Cugat del Vallès (VOC)",
            "Delta de l'Ebre - Riet Vell (MON)",
            "Aiguamolls de l'Empordà (AES)",
        ]
    );
    // Split across the page boundary, merged back into one sighting.
    assert_eq!(
        first.sent[1].species,
        vec![
            "12 Flamenc (Phoenicopterus roseus) - Greater Flamingo".to_string(),
            "4 Bec d'alena (Recurvirostra avosetta) - Pied Avocet".to_string(),
        ]
    );
    assert_eq!(first.sent[2].species[1], "Ànec collverd");

    let stored = SightingStore::new(&state_file).load().await.expect("load");
    assert_eq!(stored, SentState::Cursor(first.sent[0].clone()));

    let mut second = RecordingNotifier::default();
    let summary = fixture_pipeline(&state_file, ReconcilePolicy::default())
        .run_once(&mut second)
        .await
        .expect("second run");
    assert!(second.sent.is_empty());
    assert_eq!(summary.pages_fetched, 1);
    assert!(!summary.state_saved);
}

#[tokio::test]
async fn cursor_bound_limits_pages_read() {
    let dir = tempdir().expect("tempdir");
    let state_file = dir.path().join("last_sent.json");
    let mut notifier = RecordingNotifier::default();
    let summary = fixture_pipeline(
        &state_file,
        ReconcilePolicy::SingleCursor { max_notifications: 1 },
    )
    .run_once(&mut notifier)
    .await
    .expect("run");
    assert_eq!(notifier.sent.len(), 1);
    assert_eq!(summary.pages_fetched, 1);
}

#[tokio::test]
async fn full_set_policy_is_idempotent_across_runs() {
    let dir = tempdir().expect("tempdir");
    let state_file = dir.path().join("sent.json");

    let mut first = RecordingNotifier::default();
    fixture_pipeline(&state_file, ReconcilePolicy::FullSet)
        .run_once(&mut first)
        .await
        .expect("first run");
    assert_eq!(first.sent.len(), 3);
    assert_eq!(
        first.sent[2].species,
        vec![
            "1 Cigonya blanca (Ciconia ciconia) - White Stork".to_string(),
            "Ànec collverd".to_string(),
        ]
    );

    let stored = SightingStore::new(&state_file).load().await.expect("load");
    assert_eq!(stored.history().len(), 3);

    let mut second = RecordingNotifier::default();
    let summary = fixture_pipeline(&state_file, ReconcilePolicy::FullSet)
        .run_once(&mut second)
        .await
        .expect("second run");
    assert!(second.sent.is_empty());
    assert_eq!(summary.observed, 3);
    assert_eq!(summary.pages_fetched, 2);
}

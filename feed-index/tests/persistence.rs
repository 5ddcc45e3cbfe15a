//! Restart tests against SlateDB on the local filesystem.
#![cfg(feature = "slatedb")]

use std::sync::Arc;

use common::StorageConfig;
use common::storage::config::{LocalObjectStoreConfig, ObjectStoreConfig, SlateDbStorageConfig};
use feed_index::{
    Config, IndexDefinition, IndexOptions, Indexer, KeyComponent, LogId, MemoryLogSource,
    SubscribeOptions,
};
use serde_json::json;
use tempfile::TempDir;

fn local_config(dir: &TempDir) -> Config {
    Config {
        storage: StorageConfig::SlateDb(SlateDbStorageConfig {
            path: "feed-index".to_string(),
            object_store: ObjectStoreConfig::Local(LocalObjectStoreConfig {
                path: dir.path().to_string_lossy().to_string(),
            }),
            settings_path: None,
        }),
        ..Default::default()
    }
}

async fn open_indexer(dir: &TempDir, source: Arc<MemoryLogSource>) -> Indexer {
    let indexer = Indexer::open_with_config(local_config(dir), source)
        .await
        .expect("Failed to create indexer");
    indexer
        .define_index("kind", IndexDefinition::fields(["kind"]), IndexOptions::default())
        .unwrap();
    indexer.open().await.expect("Failed to open indexer");
    indexer.wait_for_sync().await.expect("Failed to sync");
    indexer
}

#[tokio::test]
async fn should_resume_from_persisted_cursor_after_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let source = Arc::new(MemoryLogSource::new());
    for i in 0..4 {
        source.append("feed", json!({ "kind": "post", "i": i }));
    }

    let first = open_indexer(&temp_dir, source.clone()).await;
    let numeric_id = first.cursor(&LogId::from("feed")).unwrap().numeric_id;
    first.close().await;

    source.append("feed", json!({ "kind": "post", "i": 4 }));
    let second = open_indexer(&temp_dir, source.clone()).await;

    let cursor = second.cursor(&LogId::from("feed")).unwrap();
    assert_eq!(cursor.numeric_id, numeric_id);
    assert_eq!(cursor.next_sequence, 5);

    let records = second
        .read("kind", &[KeyComponent::from("post")], SubscribeOptions::default())
        .await
        .unwrap()
        .collect_records()
        .await
        .unwrap();
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    second.close().await;
}

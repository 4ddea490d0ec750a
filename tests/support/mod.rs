#![allow(dead_code)]

use marketchat::common::models::UserProfile;
use marketchat::server::attachments::LocalBlobStore;
use marketchat::server::config::ServerConfig;
use marketchat::server::database::Database;
use marketchat::server::feed::{ChangeBus, Subscription};
use marketchat::server::identity::SqliteIdentity;
use marketchat::server::service::ChatService;
use marketchat::server::sqlite_store::SqliteStore;
use marketchat::server::store::ChatStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Harness {
    pub service: Arc<ChatService>,
    pub identity: Arc<SqliteIdentity>,
    pub store: Arc<SqliteStore>,
    pub blob_root: PathBuf,
}

pub fn profile(user_id: &str, name: &str) -> UserProfile {
    UserProfile {
        user_id: user_id.to_string(),
        name: name.to_string(),
        avatar_url: Some(format!("http://cdn.test/{}.png", user_id)),
        is_verified: user_id == "u1",
    }
}

pub fn test_config(blob_root: &PathBuf, store_timeout: Duration) -> ServerConfig {
    ServerConfig {
        blob_root: blob_root.to_string_lossy().into_owned(),
        blob_public_url: "http://blobs.test/".to_string(),
        store_timeout,
        ..ServerConfig::default()
    }
}

/// In-memory store with users u1, u2 and u3 registered.
pub async fn harness() -> Harness {
    harness_with(Duration::from_secs(5), |store| store).await
}

/// Same as `harness`, but the service talks to the store through `wrap`.
pub async fn harness_with<F>(store_timeout: Duration, wrap: F) -> Harness
where
    F: FnOnce(Arc<dyn ChatStore>) -> Arc<dyn ChatStore>,
{
    let db = Database::in_memory().await.expect("in-memory database");
    let blob_root = std::env::temp_dir().join(format!("marketchat-test-{}", Uuid::new_v4()));
    build(db, blob_root, store_timeout, wrap).await
}

/// Store backed by a real SQLite file under the harness' temp directory.
pub async fn file_harness(store_timeout: Duration) -> Harness {
    let blob_root = std::env::temp_dir().join(format!("marketchat-test-{}", Uuid::new_v4()));
    let url = format!("sqlite:{}", blob_root.join("marketchat.db").display());
    let db = Database::connect(&url, Duration::from_secs(5)).await.expect("file database");
    db.migrate().await.expect("migrations");
    build(db, blob_root, store_timeout, |store| store).await
}

async fn build<F>(db: Database, blob_root: PathBuf, store_timeout: Duration, wrap: F) -> Harness
where
    F: FnOnce(Arc<dyn ChatStore>) -> Arc<dyn ChatStore>,
{
    let db = Arc::new(db);
    let store = Arc::new(SqliteStore::new(db.clone()));
    let identity = Arc::new(SqliteIdentity::new(db));
    for (id, name) in [("u1", "Ugo"), ("u2", "Vera"), ("u3", "Zeno")] {
        identity.upsert_profile(&profile(id, name)).await.expect("seed profile");
    }

    let config = test_config(&blob_root, store_timeout);
    let blobs = Arc::new(LocalBlobStore::new(&blob_root, &config.blob_public_url).expect("blob store"));
    let shared: Arc<dyn ChatStore> = store.clone();
    let service = Arc::new(ChatService::new(
        wrap(shared),
        identity.clone(),
        blobs,
        ChangeBus::new(),
        &config,
    ));

    Harness { service, identity, store, blob_root }
}

/// Waits for the first snapshot satisfying `pred`, failing the test after a few seconds.
pub async fn next_matching<T, P>(subscription: &mut Subscription<T>, pred: P) -> T
where
    P: Fn(&T) -> bool,
{
    let wait = async {
        loop {
            match subscription.next().await {
                Some(snapshot) if pred(&snapshot) => return snapshot,
                Some(_) => continue,
                None => panic!("subscription ended while waiting for a snapshot"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for snapshot")
}

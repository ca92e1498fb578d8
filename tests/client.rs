//! Tests for `SyncClient` against a live server.

use agentation::client::SyncClient;
use agentation::config::Config;
use agentation::models::{AnnotationFields, AnnotationPatch};
use agentation::server::serve;
use agentation::store::memory::InMemoryStore;
use agentation::store::AnnotationStore;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Starts a server whose configured port equals its real port, so the
/// discovered `apiUrl` points back at it.
async fn start() -> (String, Arc<InMemoryStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = Config::default();
    config.server.bind = format!("127.0.0.1:{}", port);

    let store = Arc::new(InMemoryStore::new());
    let dyn_store: Arc<dyn AnnotationStore> = store.clone();
    tokio::spawn(async move {
        serve(listener, &config, dyn_store, None).await.unwrap();
    });
    (format!("http://127.0.0.1:{}", port), store)
}

fn fields(location: &str, comment: &str) -> AnnotationFields {
    AnnotationFields {
        source_location: Some(location.to_string()),
        comment: Some(comment.to_string()),
        element: None,
    }
}

#[tokio::test]
async fn test_discovery_is_cached() {
    let (origin, _store) = start().await;
    let client = SyncClient::new(&origin, "/api");
    assert!(client.cached_base_url().is_none());

    let port = origin.rsplit(':').next().unwrap();
    let expected = format!("http://localhost:{}", port);
    assert_eq!(client.base_url().await, expected);
    assert_eq!(client.cached_base_url(), Some(expected.as_str()));
}

#[tokio::test]
async fn test_discovery_failure_falls_back_without_caching() {
    // Nothing listens on this port once the listener is dropped.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let origin = format!("http://127.0.0.1:{}", port);
    let client = SyncClient::new(&origin, "/api");

    assert_eq!(client.base_url().await, origin);
    assert!(client.cached_base_url().is_none());
    assert!(client.list().await.is_err());
}

#[tokio::test]
async fn test_client_crud_roundtrip() {
    let (origin, store) = start().await;
    let client = SyncClient::new(&origin, "/api");

    let created = client
        .create(None, &fields("App.tsx:10:2", "fix spacing"))
        .await
        .unwrap();
    assert!(!created.id.is_empty());
    assert_eq!(store.list().await.unwrap(), vec![created.clone()]);

    let with_id = client
        .create(Some("mine"), &fields("Nav.tsx:3:4", "align"))
        .await
        .unwrap();
    assert_eq!(with_id.id, "mine");

    let updated = client
        .update(
            &created.id,
            &AnnotationPatch {
                source_location: None,
                comment: Some("fixed".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.annotation.comment.as_deref(), Some("fixed"));
    assert_eq!(updated.annotation.source_location.as_deref(), Some("App.tsx:10:2"));

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 2);

    client.delete(&created.id).await.unwrap();
    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "mine");

    let err = client.delete("missing").await.unwrap_err();
    assert!(err.to_string().contains("404"));
}

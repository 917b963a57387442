//! Lazy loading and multi-get coalescing tests

mod common;

use common::{spawn_node, VellumState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;
use vellum::DocumentStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct User {
    name: String,
}

async fn single_node_store(state: &std::sync::Arc<VellumState>) -> DocumentStore {
    let url = spawn_node(state.clone()).await;
    state.set_topology(vec![url.clone()]);
    DocumentStore::new(vec![url], "db").expect("store")
}

/// N pending lazy loads are flushed as exactly one multi-get
#[tokio::test]
async fn test_lazy_queue_flushes_as_one_round_trip() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));
    state.put_doc("users/2", json!({"name": "grace"}));
    state.put_doc("users/3", json!({"name": "edsger"}));

    let mut session = store.open_session();
    let a = session.lazily_load::<User>("users/1");
    let b = session.lazily_load::<User>("users/2");
    let c = session.lazily_load::<User>("users/3");
    assert!(!a.is_materialized());
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 0);

    // Evaluating any one handle settles the whole queue.
    let first = a.value(&mut session).await.unwrap().unwrap();
    assert_eq!(first.name, "ada");
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 1);
    assert_eq!(session.number_of_requests(), 1);

    assert!(b.is_materialized());
    assert!(c.is_materialized());
    let second = b.value(&mut session).await.unwrap().unwrap();
    let third = c.value(&mut session).await.unwrap().unwrap();
    assert_eq!(second.name, "grace");
    assert_eq!(third.name, "edsger");

    // Everything was materialized by the single batch.
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 1);
    assert_eq!(session.number_of_requests(), 1);
}

/// Lazily loaded documents enter regular session tracking
#[tokio::test]
async fn test_lazy_results_are_tracked() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    let mut session = store.open_session();
    let lazy = session.lazily_load::<User>("users/1");
    let _ = lazy.value(&mut session).await.unwrap();
    assert!(session.is_loaded("users/1"));

    // An eager load of the same id now resolves locally.
    let requests = session.number_of_requests();
    let eager: Option<User> = session.load("users/1").await.unwrap();
    assert!(eager.is_some());
    assert_eq!(session.number_of_requests(), requests);
}

/// Missing ids materialize as None and are remembered as missing
#[tokio::test]
async fn test_lazy_missing_document() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    let mut session = store.open_session();
    let present = session.lazily_load::<User>("users/1");
    let absent = session.lazily_load::<User>("users/404");

    assert!(present.value(&mut session).await.unwrap().is_some());
    assert!(absent.value(&mut session).await.unwrap().is_none());

    // The miss is session state now; re-registering resolves immediately.
    let again = session.lazily_load::<User>("users/404");
    assert!(again.is_materialized());
}

/// Inner multi-get items revalidate through the shared HTTP cache
#[tokio::test]
async fn test_lazy_revalidates_per_item() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    let mut first = store.open_session();
    let lazy = first.lazily_load::<User>("users/1");
    let _ = lazy.value(&mut first).await.unwrap();

    // Same lazy load through a fresh session: the inner request carries
    // If-None-Match and the server answers an inner 304.
    let mut second = store.open_session();
    let again = second.lazily_load::<User>("users/1");
    let user = again.value(&mut second).await.unwrap().unwrap();
    assert_eq!(user.name, "ada");
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 2);
    // The second batch revalidated instead of re-fetching the body.
    assert_eq!(state.inner_not_modified.load(Ordering::SeqCst), 1);
}

/// A 304 whose cache entry vanished mid-flight gets its own retry round
#[tokio::test]
async fn test_evicted_revalidation_is_retried() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    // Prime the per-item cache entry through a first lazy load.
    let mut primer = store.open_session();
    let warm = primer.lazily_load::<User>("users/1");
    let _ = warm.value(&mut primer).await.unwrap();
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 1);

    let cache = store.request_executor(None).cache().clone();
    let key = "/databases/db/docs?id=users/1";
    assert!(cache.get(key).is_some());

    // Delay the batch response and evict the entry while it is in flight:
    // the request goes out with If-None-Match, the 304 comes back to an
    // empty cache, and the item must be re-fetched in a second round.
    state.multi_get_delay_ms.store(100, Ordering::SeqCst);
    let evictor = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cache.invalidate(key);
    });

    let mut session = store.open_session();
    let lazy = session.lazily_load::<User>("users/1");
    let user = lazy.value(&mut session).await.unwrap().unwrap();
    assert_eq!(user.name, "ada");
    evictor.await.unwrap();

    // Round one answered 304 against the evicted entry, round two refetched.
    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 3);
    assert_eq!(state.inner_not_modified.load(Ordering::SeqCst), 1);
    assert_eq!(session.number_of_requests(), 2);
}

/// Eager and lazy reads share cache entries for the same document
#[tokio::test]
async fn test_eager_and_lazy_loads_share_cache_entries() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    // Eager load fills the cache.
    let mut eager = store.open_session();
    let _: Option<User> = eager.load("users/1").await.unwrap();
    assert_eq!(state.docs_served.load(Ordering::SeqCst), 1);

    // A lazy load through a fresh session revalidates against that entry.
    let mut lazy_session = store.open_session();
    let lazy = lazy_session.lazily_load::<User>("users/1");
    let user = lazy.value(&mut lazy_session).await.unwrap().unwrap();
    assert_eq!(user.name, "ada");
    assert_eq!(state.inner_not_modified.load(Ordering::SeqCst), 1);
    assert_eq!(state.docs_served.load(Ordering::SeqCst), 1);
}

/// An empty or locally resolvable queue causes no traffic at all
#[tokio::test]
async fn test_local_queue_never_touches_network() {
    let state = VellumState::new();
    let store = single_node_store(&state).await;
    state.put_doc("users/1", json!({"name": "ada"}));

    let mut session = store.open_session();
    let _: Option<User> = session.load("users/1").await.unwrap();
    let requests = session.number_of_requests();

    // Tracked id: resolves at registration time.
    let lazy = session.lazily_load::<User>("users/1");
    assert!(lazy.is_materialized());
    session.execute_all_pending_lazy_operations().await.unwrap();

    assert_eq!(state.multi_gets.load(Ordering::SeqCst), 0);
    assert_eq!(session.number_of_requests(), requests);
}

//! Integration Tests for Sync Module
//!
//! Covers:
//! - Full sync passes against an HTTP server (mockito)
//! - Queue ordering, exclusive drain and retry exhaustion end to end
//! - Conflict detection boundaries
//! - Storage failures and corrupted records during a pass

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::db::{self, Database, KeyValueStore, MemoryStore, SharedStore};
    use crate::sync::fake::FakeApi;
    use chrono::{Duration, TimeZone, Utc};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::sync::Arc;

    fn test_config(api_base_url: &str) -> EngineConfig {
        EngineConfig {
            api_base_url: api_base_url.to_string(),
            client_id: "integration".to_string(),
            probe_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn http_coordinator(url: &str, storage: SharedStore, clock: ManualClock) -> SyncCoordinator {
        let config = test_config(url);
        let api = Arc::new(HttpRemoteApi::new(&config).unwrap());
        SyncCoordinator::new(storage, Arc::new(clock), api, &config)
    }

    fn fake_coordinator() -> (SyncCoordinator, Arc<FakeApi>, ManualClock, Arc<MemoryStore>) {
        let api = Arc::new(FakeApi::new());
        let clock = ManualClock::default();
        let storage = Arc::new(MemoryStore::new());
        let coordinator = SyncCoordinator::new(
            storage.clone(),
            Arc::new(clock.clone()),
            api.clone(),
            &test_config("http://localhost:1"),
        );
        (coordinator, api, clock, storage)
    }

    // ========================================================================
    // HTTP Sync Passes (with mockito)
    // ========================================================================

    #[tokio::test]
    async fn test_http_pass_creates_pushes_and_flags_conflicts() {
        let mut server = Server::new_async().await;
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t1);
        let storage: SharedStore = Arc::new(Database::in_memory().unwrap());
        let coordinator = http_coordinator(&server.url(), storage, clock);

        coordinator.write("notes", "new", json!({"id": "new", "title": "created offline"}));
        coordinator.write("notes", "old", json!({"id": "old", "title": "edited offline"}));
        coordinator.write("notes", "hot", json!({"id": "hot", "title": "edited offline"}));

        // Absent on the server: created
        let _fetch_new = server
            .mock("GET", "/api/notes/new")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/api/notes")
            .match_body(Matcher::PartialJson(json!({"id": "new"})))
            .with_status(201)
            .with_body(r#"{"id": "new"}"#)
            .create_async()
            .await;

        // Server copy older than the local write: pushed
        let _fetch_old = server
            .mock("GET", "/api/notes/old")
            .with_status(200)
            .with_body(r#"{"id": "old", "title": "server", "updated_at": "2024-05-01T11:00:00Z"}"#)
            .create_async()
            .await;
        let push = server
            .mock("PUT", "/api/notes/old")
            .match_body(Matcher::PartialJson(json!({"title": "edited offline"})))
            .with_status(200)
            .with_body(r#"{"id": "old", "title": "edited offline", "updated_at": "2024-05-01T12:00:01Z"}"#)
            .create_async()
            .await;

        // Server copy newer than the local write: conflict, no write
        let _fetch_hot = server
            .mock("GET", "/api/notes/hot")
            .with_status(200)
            .with_body(r#"{"id": "hot", "title": "server", "updated_at": "2024-05-01T13:00:00Z"}"#)
            .create_async()
            .await;
        let no_write_hot = server
            .mock("PUT", "/api/notes/hot")
            .expect(0)
            .create_async()
            .await;

        let result = coordinator.synchronize().await;

        assert_eq!(result.synced, 2);
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(coordinator.store().len(), 1);
        assert!(coordinator.store().get("notes", "hot").is_some());

        let conflicts = coordinator.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].id, "hot");
        assert_eq!(conflicts[0].server_payload["title"], "server");

        create.assert_async().await;
        push.assert_async().await;
        no_write_hot.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_server_error_keeps_entry_for_next_pass() {
        let mut server = Server::new_async().await;
        let storage: SharedStore = Arc::new(MemoryStore::new());
        let coordinator = http_coordinator(&server.url(), storage.clone(), ManualClock::default());
        coordinator.write("notes", "1", json!({"title": "x"}));

        let _fetch = server
            .mock("GET", "/api/notes/1")
            .with_status(404)
            .create_async()
            .await;
        let _create = server
            .mock("POST", "/api/notes")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let result = coordinator.synchronize().await;
        assert_eq!((result.synced, result.errors), (0, 1));
        assert_eq!(coordinator.store().len(), 1);

        // Entry still persisted for the next process too
        let raw = storage.load(db::OFFLINE_DATA_KEY).unwrap().unwrap();
        assert!(raw.contains("notes/1"));
    }

    #[tokio::test]
    async fn test_http_force_sync_probes_health() {
        let mut server = Server::new_async().await;
        let coordinator = http_coordinator(&server.url(), Arc::new(MemoryStore::new()), ManualClock::default());

        let down = server
            .mock("GET", "/api/health")
            .with_status(503)
            .create_async()
            .await;
        assert!(matches!(coordinator.force_sync().await, Err(SyncError::Offline)));
        down.remove_async().await;

        let _up = server
            .mock("GET", "/api/health")
            .with_status(200)
            .create_async()
            .await;
        let result = coordinator.force_sync().await.unwrap();
        assert!(result.is_success());
        assert!(coordinator.state().is_reachable);
    }

    #[tokio::test]
    async fn test_http_client_wins_resolution() {
        let mut server = Server::new_async().await;
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let coordinator = http_coordinator(&server.url(), Arc::new(MemoryStore::new()), ManualClock::new(t1));
        coordinator.write("notes", "1", json!({"id": "1", "title": "mine"}));

        let fetch = server
            .mock("GET", "/api/notes/1")
            .with_status(200)
            .with_body(r#"{"id": "1", "title": "theirs", "updated_at": "2024-05-01T12:30:00Z"}"#)
            .expect(2)
            .create_async()
            .await;
        let push = server
            .mock("PUT", "/api/notes/1")
            .match_body(Matcher::PartialJson(json!({"id": "1", "title": "mine"})))
            .with_status(200)
            .with_body(r#"{"id": "1", "title": "mine", "updated_at": "2024-05-01T12:31:00Z"}"#)
            .expect(2)
            .create_async()
            .await;

        assert_eq!(coordinator.synchronize().await.conflicts, 1);
        assert!(
            coordinator
                .resolve_conflict("1", "notes", ConflictStrategy::ClientWins, None)
                .await
        );

        // Resolved record is stamped past the server marker: no repeated conflict
        let result = coordinator.synchronize().await;
        assert_eq!((result.synced, result.conflicts), (1, 0));
        assert!(coordinator.store().is_empty());

        fetch.assert_async().await;
        push.assert_async().await;
    }

    // ========================================================================
    // Queue Properties
    // ========================================================================

    #[tokio::test]
    async fn test_scenario_low_high_medium_drains_high_medium_low() {
        let (coordinator, api, _clock, _storage) = fake_coordinator();
        let queue = coordinator.queue();

        queue.enqueue(TaskKind::CustomAction { action: "A".into() }, json!({}), Priority::Low, 3);
        queue.enqueue(TaskKind::CustomAction { action: "B".into() }, json!({}), Priority::High, 3);
        queue.enqueue(TaskKind::CustomAction { action: "C".into() }, json!({}), Priority::Medium, 3);

        let result = queue.drain().await;
        assert_eq!((result.processed, result.failed), (3, 0));
        assert_eq!(
            api.calls(),
            vec!["POST /api/actions/B", "POST /api/actions/C", "POST /api/actions/A"]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_priority_tier() {
        let (coordinator, api, _clock, _storage) = fake_coordinator();
        let queue = coordinator.queue();

        // Same instant: insertion order decides
        for name in ["first", "second", "third"] {
            queue.enqueue(TaskKind::CustomAction { action: name.into() }, json!({}), Priority::Medium, 3);
        }
        queue.enqueue(TaskKind::CustomAction { action: "urgent".into() }, json!({}), Priority::High, 3);

        queue.drain().await;
        assert_eq!(
            api.calls(),
            vec![
                "POST /api/actions/urgent",
                "POST /api/actions/first",
                "POST /api/actions/second",
                "POST /api/actions/third",
            ]
        );
    }

    #[tokio::test]
    async fn test_overlapping_drains_yield_one_result() {
        let (coordinator, api, _clock, _storage) = fake_coordinator();
        api.set_write_delay(std::time::Duration::from_millis(50));
        let queue = coordinator.queue().clone();
        for i in 0..3 {
            queue.enqueue(TaskKind::CustomAction { action: format!("a{}", i) }, json!({}), Priority::Low, 3);
        }

        let other = queue.clone();
        let (a, b) = tokio::join!(queue.drain(), async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            other.drain().await
        });

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.processed == 3).count(), 1);
        let idle = results.iter().find(|r| r.skipped).unwrap();
        assert_eq!((idle.processed, idle.failed), (0, 0));
        assert_eq!(api.write_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_counts_in_pass_failed() {
        let (coordinator, api, clock, _storage) = fake_coordinator();
        api.set_fail_writes(true);
        coordinator.queue().enqueue(
            TaskKind::Delete { resource_type: "notes".into(), id: "1".into() },
            json!(null),
            Priority::High,
            2,
        );

        let mut failed = 0;
        for _ in 0..5 {
            failed += coordinator.synchronize().await.failed;
            clock.advance(Duration::hours(1));
        }

        assert_eq!(api.write_count(), 3);
        assert_eq!(failed, 1);
        assert_eq!(coordinator.queue().dead_letters().len(), 1);
        assert_eq!(coordinator.state().pending_task_count, 0);
    }

    // ========================================================================
    // Conflict Detection
    // ========================================================================

    #[tokio::test]
    async fn test_conflict_iff_server_strictly_newer() {
        let (coordinator, api, clock, _storage) = fake_coordinator();
        let t1 = clock.now();

        coordinator.write("notes", "newer", json!({"v": 1}));
        coordinator.write("notes", "same", json!({"v": 1}));
        coordinator.write("notes", "older", json!({"v": 1}));
        api.put_record("notes", "newer", json!({"updated_at": (t1 + Duration::milliseconds(1)).to_rfc3339()}));
        api.put_record("notes", "same", json!({"updated_at": t1.timestamp_millis()}));
        api.put_record("notes", "older", json!({"updated_at": (t1 - Duration::minutes(1)).to_rfc3339()}));

        let result = coordinator.synchronize().await;
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.synced, 2);
        assert_eq!(coordinator.conflicts()[0].id, "newer");
    }

    #[tokio::test]
    async fn test_server_record_without_marker_is_pushed() {
        let (coordinator, api, _clock, _storage) = fake_coordinator();
        coordinator.write("notes", "1", json!({"v": 2}));
        api.put_record("notes", "1", json!({"v": 1}));

        let result = coordinator.synchronize().await;
        assert_eq!((result.synced, result.conflicts), (1, 0));
        assert_eq!(api.record("notes", "1"), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_merge_resolution_end_to_end() {
        let (coordinator, api, clock, _storage) = fake_coordinator();
        let later = clock.now() + Duration::seconds(5);
        coordinator.write("profiles", "me", json!({"name": "local", "preferences": {"lang": "tr"}}));
        api.put_record(
            "profiles",
            "me",
            json!({"name": "server", "preferences": {"lang": "en"}, "updated_at": later.to_rfc3339()}),
        );

        coordinator.synchronize().await;
        assert!(coordinator.resolve_conflict("me", "profiles", ConflictStrategy::Merge, None).await);

        let merged = api.record("profiles", "me").unwrap();
        assert_eq!(merged["name"], "server");
        assert_eq!(merged["preferences"], json!({"lang": "tr"}));

        let result = coordinator.synchronize().await;
        assert_eq!((result.synced, result.conflicts), (1, 0));
    }

    // ========================================================================
    // Error Scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_corrupted_entry_discarded_rest_of_pass_continues() {
        let (coordinator, api, clock, storage) = fake_coordinator();
        coordinator.write("notes", "good", json!({"body": "fine"}));
        coordinator.write("notes", "bad", json!({"body": "original"}));

        let raw = storage.load(db::OFFLINE_DATA_KEY).unwrap().unwrap();
        storage.put_raw(db::OFFLINE_DATA_KEY, &raw.replace("original", "flipped"));

        // Fresh process over the same storage
        let reopened = SyncCoordinator::new(
            storage.clone(),
            Arc::new(clock),
            api.clone(),
            &test_config("http://localhost:1"),
        );
        let result = reopened.synchronize().await;

        assert_eq!(result.discarded, 1);
        assert_eq!(result.synced, 1);
        assert!(reopened.store().is_empty());
        assert!(api.record("notes", "bad").is_none());
    }

    #[tokio::test]
    async fn test_storage_unavailable_sync_still_works() {
        let (coordinator, api, _clock, storage) = fake_coordinator();
        storage.set_unavailable(true);

        coordinator.write("notes", "1", json!({"id": "1"}));
        coordinator.queue().enqueue(
            TaskKind::CustomAction { action: "ping".into() },
            json!({}),
            Priority::Low,
            1,
        );

        let result = coordinator.synchronize().await;
        assert_eq!(result.synced, 2);
        assert!(result.is_success());
        assert!(api.record("notes", "1").is_some());
        assert!(storage.load(db::TASK_QUEUE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_counts_error_and_keeps_entry() {
        let (coordinator, api, _clock, _storage) = fake_coordinator();
        coordinator.write("notes", "1", json!({"id": "1"}));
        api.set_fail_fetches(true);

        let result = coordinator.synchronize().await;
        assert_eq!((result.synced, result.errors), (0, 1));
        assert_eq!(coordinator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_state_subscription_sees_pass() {
        let (coordinator, _api, _clock, _storage) = fake_coordinator();
        let mut receiver = coordinator.subscribe();
        coordinator.write("notes", "1", json!({}));

        coordinator.synchronize().await;
        assert!(receiver.has_changed().unwrap());
        let state = receiver.borrow_and_update().clone();
        assert!(!state.sync_in_progress);
        assert!(state.last_sync_at.is_some());
    }
}

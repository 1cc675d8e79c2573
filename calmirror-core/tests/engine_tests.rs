mod common;

use calmirror_core::{
    Event, EventPage, MirrorError, ServiceError, SyncStateStore, Visibility,
};
use chrono::{Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use common::*;

fn sources() -> Vec<String> {
    vec![SOURCE.to_string()]
}

/// An event someone created directly in the target, without a tag.
fn untagged(id: &str, summary: &str, day: u32, hour: u32, updated_year: i32) -> Event {
    let updated = Utc.with_ymd_and_hms(updated_year, 1, 1, 0, 0, 0).unwrap();
    Event {
        ical_uid: Some(format!("{id}-native")),
        created: Some(updated),
        updated: Some(updated),
        ..source_event(id, summary, day, hour)
    }
}

#[tokio::test]
async fn test_new_event_gets_one_tagged_mirror() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(
        vec![source_event("E1", "Planning", 10, 10)],
        Some("tok1"),
    )));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let mirrors = target.tagged("src1:E1");
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].summary, "Planning");
    assert_eq!(target.events().len(), 1);
    assert_eq!(report.counts(), (1, 0, 0));
    assert_eq!(state.cursor(SOURCE), Some("tok1"));

    // No cursor yet: a two-week window, deletions included.
    let query = &source.queries()[0];
    assert_eq!(query.sync_token, None);
    assert!(query.show_deleted);
    let (min, max) = (query.time_min.unwrap(), query.time_max.unwrap());
    assert_eq!(max - min, Duration::days(14));
}

#[tokio::test]
async fn test_second_observation_changes_nothing() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    let event = source_event("E1", "Planning", 10, 10);
    source.push(Ok(page(vec![event.clone()], Some("tok1"))));
    source.push(Ok(page(vec![event], Some("tok2"))));

    let engine = engine(&source, &target);
    let mut state = SyncStateStore::in_memory();
    engine.run(&sources(), &mut state).await.unwrap();
    let report = engine.run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.mutations(), (1, 0, 0));
    assert_eq!(report.unchanged(), 1);
    assert_eq!(source.queries()[1].sync_token.as_deref(), Some("tok1"));
    assert_eq!(state.cursor(SOURCE), Some("tok2"));
}

#[tokio::test]
async fn test_changed_event_patches_its_mirror() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    let mut event = source_event("E1", "Planning", 10, 10);
    source.push(Ok(page(vec![event.clone()], Some("tok1"))));
    event.summary = "Planning (moved)".to_string();
    event.visibility = Some(Visibility::Private);
    source.push(Ok(page(vec![event], Some("tok2"))));

    let engine = engine(&source, &target);
    let mut state = SyncStateStore::in_memory();
    engine.run(&sources(), &mut state).await.unwrap();
    let report = engine.run(&sources(), &mut state).await.unwrap();

    let mirrors = target.tagged("src1:E1");
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].summary, "Planning (moved)");
    assert_eq!(mirrors[0].visibility, Some(Visibility::Private));
    assert_eq!(report.counts(), (0, 1, 0));
}

#[tokio::test]
async fn test_untitled_event_is_mirrored_as_busy() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(vec![source_event("E1", "", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.tagged("src1:E1")[0].summary, "(busy)");
}

#[tokio::test]
async fn test_cancellation_deletes_mirror() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));
    source.push(Ok(page(vec![cancelled("E1")], Some("tok2"))));

    let engine = engine(&source, &target);
    let mut state = SyncStateStore::in_memory();
    engine.run(&sources(), &mut state).await.unwrap();
    let report = engine.run(&sources(), &mut state).await.unwrap();

    assert!(target.events().is_empty());
    assert_eq!(target.mutations(), (1, 0, 1));
    assert_eq!(report.counts(), (0, 0, 1));
}

#[tokio::test]
async fn test_cancellation_without_mirror_is_a_no_op() {
    let source = ScriptedSource::new();
    let bystander = untagged("X1", "Lunch", 10, 12, 2024);
    let target = FakeTarget::with_events(vec![bystander.clone()]);
    source.push(Ok(page(vec![cancelled("E9")], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.mutations(), (0, 0, 0));
    assert_eq!(target.events(), vec![bystander]);
    assert_eq!(report.sources[0].ignored, 1);
}

#[tokio::test]
async fn test_stale_cursor_falls_back_to_window() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Err(ServiceError::CursorInvalidated));
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("fresh"))));

    let mut state = SyncStateStore::in_memory();
    state.set_cursor(SOURCE, "old");
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let queries = source.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].sync_token.as_deref(), Some("old"));
    assert_eq!(queries[1].sync_token, None);
    let (min, max) = (queries[1].time_min.unwrap(), queries[1].time_max.unwrap());
    assert_eq!(max - min, Duration::days(14));
    assert_eq!(state.cursor(SOURCE), Some("fresh"));
    assert_eq!(report.sources[0].cursor_resets, 1);
    assert_eq!(target.tagged("src1:E1").len(), 1);
}

#[tokio::test]
async fn test_rejected_window_listing_aborts() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Err(ServiceError::CursorInvalidated));

    let mut state = SyncStateStore::in_memory();
    let result = engine(&source, &target).run(&sources(), &mut state).await;

    assert!(matches!(
        result,
        Err(MirrorError::Service(ServiceError::CursorInvalidated))
    ));
    assert_eq!(source.queries().len(), 1);
}

#[tokio::test]
async fn test_cursor_not_advanced_when_a_later_page_fails() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(EventPage {
        items: vec![source_event("E1", "Planning", 10, 10)],
        next_page_token: Some("p2".to_string()),
        next_sync_token: None,
    }));
    source.push(Err(ServiceError::Transient("503 backend error".into())));

    let mut state = SyncStateStore::in_memory();
    state.set_cursor(SOURCE, "old");
    let result = engine(&source, &target).run(&sources(), &mut state).await;

    assert!(result.is_err());
    assert_eq!(state.cursor(SOURCE), Some("old"));
    assert_eq!(source.queries()[1].page_token.as_deref(), Some("p2"));
    assert_eq!(source.queries()[1].sync_token.as_deref(), Some("old"));
    // Work done on the first page stands.
    assert_eq!(target.tagged("src1:E1").len(), 1);
}

#[tokio::test]
async fn test_cursor_persisted_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::load(&path, true);
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let reloaded = SyncStateStore::load(&path, true);
    assert_eq!(reloaded.cursor(SOURCE), Some("tok1"));
}

#[tokio::test]
async fn test_uid_match_is_tagged_instead_of_duplicated() {
    let source = ScriptedSource::new();
    let existing = Event {
        id: "t1".to_string(),
        ..source_event("E1", "Planning", 10, 10)
    };
    let target = FakeTarget::with_events(vec![existing]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let (inserts, patches, deletes) = target.mutations();
    assert_eq!((inserts, deletes), (0, 0));
    assert_eq!(patches, 1, "only the tag backfill is needed");
    assert_eq!(target.event("t1").unwrap().origin.as_deref(), Some("src1:E1"));
}

#[tokio::test]
async fn test_uid_match_owned_by_another_origin_is_left_alone() {
    let source = ScriptedSource::new();
    let foreign = Event {
        id: "t1".to_string(),
        origin: Some("src2:E1".to_string()),
        ..source_event("E1", "Planning", 10, 10)
    };
    let target = FakeTarget::with_events(vec![foreign.clone()]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.event("t1").unwrap(), foreign);
    assert_eq!(target.tagged("src1:E1").len(), 1);
}

#[tokio::test]
async fn test_fresher_untagged_duplicate_is_adopted() {
    let source = ScriptedSource::new();
    let target = FakeTarget::with_events(vec![untagged("d1", "planning ", 10, 10, 2025)]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.mutations(), (0, 1, 0));
    let adopted = target.event("d1").unwrap();
    assert_eq!(adopted.origin.as_deref(), Some("src1:E1"));
    assert_eq!(adopted.summary, "Planning");
    assert_eq!(report.sources[0].adopted, 1);
}

#[tokio::test]
async fn test_older_duplicates_are_replaced_by_a_fresh_mirror() {
    let source = ScriptedSource::new();
    let target = FakeTarget::with_events(vec![
        untagged("d1", "Planning", 10, 10, 2020),
        untagged("d2", "Planning", 10, 10, 2021),
    ]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert!(target.event("d1").is_none());
    assert!(target.event("d2").is_none());
    assert_eq!(target.events().len(), 1);
    assert_eq!(target.tagged("src1:E1").len(), 1);
    assert_eq!(report.sources[0].duplicates_removed, 2);
    assert_eq!(report.sources[0].created, 1);
}

#[tokio::test]
async fn test_freshest_duplicate_survives_and_the_rest_go() {
    let source = ScriptedSource::new();
    let target = FakeTarget::with_events(vec![
        untagged("d1", "Planning", 10, 10, 2020),
        untagged("d2", "Planning", 10, 10, 2026),
    ]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let events = target.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "d2");
    assert_eq!(events[0].origin.as_deref(), Some("src1:E1"));
    assert_eq!(target.mutations(), (0, 1, 1));
}

#[tokio::test]
async fn test_title_match_at_a_different_time_is_not_a_duplicate() {
    let source = ScriptedSource::new();
    let target = FakeTarget::with_events(vec![untagged("d1", "Planning", 10, 14, 2026)]);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.events().len(), 2);
    assert_eq!(target.event("d1").unwrap().origin, None);
}

#[tokio::test]
async fn test_duplicate_conflict_on_insert_is_swallowed() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    target.fail_next_insert(ServiceError::Conflict("duplicate".into()), None);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert!(target.events().is_empty());
    assert_eq!(report.sources[0].ignored, 1);
    assert_eq!(state.cursor(SOURCE), Some("tok1"));
}

#[tokio::test]
async fn test_mirror_created_by_a_racing_writer_is_patched() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    let racing = Event {
        id: "r1".to_string(),
        summary: "stale".to_string(),
        origin: Some("src1:E1".to_string()),
        ..source_event("R", "stale", 10, 10)
    };
    target.fail_next_insert(ServiceError::Transient("503".into()), Some(racing));
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    let mirrors = target.tagged("src1:E1");
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].id, "r1");
    assert_eq!(mirrors[0].summary, "Planning");
    assert_eq!(target.mutations(), (0, 1, 0));
}

#[tokio::test]
async fn test_unexplained_insert_failure_aborts_the_source() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    target.fail_next_insert(ServiceError::Fatal("Invalid start time".into()), None);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let result = engine(&source, &target).run(&sources(), &mut state).await;

    assert!(matches!(result, Err(MirrorError::Service(ServiceError::Fatal(_)))));
    assert_eq!(state.cursor(SOURCE), None);
}

#[tokio::test]
async fn test_transient_insert_failure_without_a_racing_mirror_aborts() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    target.fail_next_insert(ServiceError::Transient("503 backend error".into()), None);
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let result = engine(&source, &target).run(&sources(), &mut state).await;

    assert!(matches!(
        result,
        Err(MirrorError::Service(ServiceError::Transient(_)))
    ));
    assert_eq!(state.cursor(SOURCE), None);
    assert!(target.events().is_empty());
}

#[tokio::test]
async fn test_failed_tag_backfill_still_updates_the_uid_match() {
    let source = ScriptedSource::new();
    let existing = Event {
        id: "t1".to_string(),
        ..source_event("E1", "Planning", 10, 10)
    };
    let target = FakeTarget::with_events(vec![existing]);
    target.fail_next_patch(ServiceError::Transient("503".into()));
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.mutations(), (0, 1, 0));
    assert_eq!(target.event("t1").unwrap().origin.as_deref(), Some("src1:E1"));
    assert_eq!(report.sources[0].updated, 1);
    assert_eq!(state.cursor(SOURCE), Some("tok1"));
}

#[tokio::test]
async fn test_failed_title_search_counts_as_no_duplicates() {
    let source = ScriptedSource::new();
    let target = FakeTarget::with_events(vec![untagged("d1", "Planning", 10, 10, 2025)]);
    target.fail_next_search(ServiceError::Transient("503".into()));
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(report.sources[0].created, 1);
    assert_eq!(target.mutations(), (1, 0, 0));
    assert_eq!(target.event("d1").unwrap().origin, None);
    assert_eq!(target.tagged("src1:E1").len(), 1);
}

#[tokio::test]
async fn test_uid_match_prefers_the_same_instance() {
    let source = ScriptedSource::new();
    let instance = |id: &str, day: u32| Event {
        id: id.to_string(),
        ical_uid: Some("S1@google.com".to_string()),
        original_start: Some(calmirror_core::EventTime::instant(at(day, 10))),
        ..source_event("S1", "Standup", day, 10)
    };
    let target = FakeTarget::with_events(vec![instance("t10", 10), instance("t11", 11)]);
    source.push(Ok(page(vec![instance("S1_20240111", 11)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(
        target.event("t11").unwrap().origin.as_deref(),
        Some("src1:S1:2024-01-11T10:00:00Z")
    );
    assert_eq!(target.event("t10").unwrap().origin, None);
    assert_eq!(target.mutations().0, 0);
}

#[tokio::test]
async fn test_multiple_tagged_mirrors_update_the_oldest() {
    let source = ScriptedSource::new();
    let tagged = |id: &str, year: i32| Event {
        id: id.to_string(),
        origin: Some("src1:E1".to_string()),
        created: Some(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()),
        ..source_event("E1", "Planning", 10, 10)
    };
    let target = FakeTarget::with_events(vec![tagged("newer", 2021), tagged("older", 2020)]);
    source.push(Ok(page(vec![source_event("E1", "Renamed", 10, 10)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.event("older").unwrap().summary, "Renamed");
    assert_eq!(target.event("newer").unwrap().summary, "Planning");
    assert_eq!(target.mutations(), (0, 1, 0));
}

#[tokio::test]
async fn test_recurring_exceptions_get_distinct_mirrors() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    let exception = |day: u32| Event {
        id: format!("S1_202401{day:02}"),
        ical_uid: Some("S1@google.com".to_string()),
        original_start: Some(calmirror_core::EventTime::instant(at(day, 10))),
        ..source_event("S1", "Standup", day, 11)
    };
    source.push(Ok(page(vec![exception(10), exception(11)], Some("tok1"))));

    let mut state = SyncStateStore::in_memory();
    engine(&source, &target).run(&sources(), &mut state).await.unwrap();

    assert_eq!(target.tagged("src1:S1:2024-01-10T10:00:00Z").len(), 1);
    assert_eq!(target.tagged("src1:S1:2024-01-11T10:00:00Z").len(), 1);
    assert_eq!(target.events().len(), 2);
}

#[tokio::test]
async fn test_sources_are_processed_in_order_once() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(vec![source_event("A1", "One", 10, 10)], Some("a"))));
    source.push(Ok(page(vec![source_event("B1", "Two", 11, 10)], Some("b"))));

    let ids = vec!["calA".to_string(), "calB".to_string(), "calA".to_string()];
    let mut state = SyncStateStore::in_memory();
    let report = engine(&source, &target).run(&ids, &mut state).await.unwrap();

    assert_eq!(report.sources.len(), 2);
    assert_eq!(source.queries().len(), 2);
    assert_eq!(target.tagged("calA:A1").len(), 1);
    assert_eq!(target.tagged("calB:B1").len(), 1);
    assert_eq!(state.cursor("calA"), Some("a"));
    assert_eq!(state.cursor("calB"), Some("b"));
}

#[tokio::test]
async fn test_canonical_sources_resolve_aliases() {
    let source = ScriptedSource::with_aliases(&[("primary", "me@example.com")]);
    let target = FakeTarget::new();

    let configured = vec!["primary".to_string(), "unreachable".to_string()];
    let mappings = engine(&source, &target).canonical_sources(&configured).await;

    assert_eq!(mappings[0].canonical, "me@example.com");
    assert_eq!(mappings[1].canonical, "unreachable");
}

#[tokio::test]
async fn test_cancelled_run_stops_before_listing() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    source.push(Ok(page(vec![source_event("E1", "Planning", 10, 10)], Some("tok1"))));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = engine(&source, &target).with_cancellation(cancel);

    let mut state = SyncStateStore::in_memory();
    let report = engine.run(&sources(), &mut state).await.unwrap();

    assert!(report.cancelled);
    assert!(source.queries().is_empty());
    assert!(target.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pacing_pauses_every_ten_events() {
    let source = ScriptedSource::new();
    let target = FakeTarget::new();
    let events = (1..=21)
        .map(|i| source_event(&format!("E{i}"), &format!("Event {i}"), 10, 1))
        .collect();
    source.push(Ok(page(events, Some("tok1"))));

    let options = calmirror_core::EngineOptions {
        pace_delay: std::time::Duration::from_secs(1),
        ..options()
    };
    let engine = calmirror_core::ReconciliationEngine::new(source.clone(), target.clone(), TARGET, options);

    let started = tokio::time::Instant::now();
    let mut state = SyncStateStore::in_memory();
    engine.run(&sources(), &mut state).await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_secs(2));
    assert!(elapsed < std::time::Duration::from_secs(3));
    assert_eq!(target.events().len(), 21);
}

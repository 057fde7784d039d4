//! Tests for the events the cache reports to its tracer.

mod common;

use futures::executor::block_on;
use query_suspense::{
    FetchError, FetchKind, Operation, RemoveOutcome, SettleOutcome, SuspenseCache,
};
use serde_json::json;

use common::{user, MockQuery, RecordingTracer, TraceEvent, User};

#[test]
fn test_create_hit_and_dispose_events() {
    let tracer = RecordingTracer::default();
    let cache = SuspenseCache::builder().tracer(tracer.clone()).build();
    let get_user = Operation::<User>::new("GetUser");
    let mock = MockQuery::new();

    let first = cache
        .get_or_create(&get_user, &json!({"id": 1}), |_| mock.clone())
        .unwrap();
    let initial = first.promise().id();
    let second = cache
        .get_or_create(&get_user, &json!({"id": 1}), |_| mock.clone())
        .unwrap();
    first.dispose();
    second.dispose();

    let key = r#"GetUser{"id":1}"#.to_string();
    assert_eq!(
        tracer.take(),
        vec![
            TraceEvent::PromiseCreated(initial, FetchKind::Initial),
            TraceEvent::SubscriptionCreated(key.clone()),
            TraceEvent::Acquire(1),
            TraceEvent::CacheHit(key),
            TraceEvent::Acquire(2),
            TraceEvent::Dispose(1),
            TraceEvent::Dispose(0),
        ]
    );
}

#[test]
fn test_promise_settle_events() {
    let tracer = RecordingTracer::default();
    let cache = SuspenseCache::builder().tracer(tracer.clone()).build();
    let get_user = Operation::<User>::new("GetUser");
    let mock = MockQuery::new();

    let query = cache
        .get_or_create(&get_user, &json!({"id": 1}), |_| mock.clone())
        .unwrap();
    let initial = query.promise();
    mock.resolve(user("a"));
    block_on(initial.settled()).unwrap();
    tracer.take();

    let refetched = query.refetch(None);
    mock.reject(FetchError::new(anyhow::anyhow!("timeout")));
    block_on(refetched.settled()).unwrap_err();

    let events = tracer.take();
    assert_eq!(
        events,
        vec![
            TraceEvent::PromiseCreated(refetched.id(), FetchKind::Refetch),
            TraceEvent::PromiseSettled(
                refetched.id(),
                SettleOutcome::Rejected {
                    message: "timeout".to_string()
                }
            ),
        ]
    );
}

#[test]
fn test_delivery_and_double_dispose_events() {
    let tracer = RecordingTracer::default();
    let cache = SuspenseCache::builder().tracer(tracer.clone()).build();
    let get_user = Operation::<User>::new("GetUser");
    let mock = MockQuery::new();

    let query = cache
        .get_or_create(&get_user, &json!({"id": 1}), |_| mock.clone())
        .unwrap();
    let _handle = query.listen(|_: &query_suspense::QueryResult<User>| {});
    tracer.take();

    mock.emit(user("a"));
    mock.emit(user("a"));
    let subscription = query.subscription().clone();
    let token = query.token();
    query.dispose();
    subscription.dispose(token);

    assert_eq!(
        tracer.take(),
        vec![
            TraceEvent::ResultDelivered(1),
            TraceEvent::ResultSuppressed,
            TraceEvent::Dispose(0),
            TraceEvent::DoubleDispose,
        ]
    );
}

#[test]
fn test_remove_events() {
    let tracer = RecordingTracer::default();
    let cache = SuspenseCache::builder().tracer(tracer.clone()).build();
    let get_user = Operation::<User>::new("GetUser");

    cache.remove(&get_user, &json!({"id": 1})).unwrap();
    let query = cache
        .get_or_create(&get_user, &json!({"id": 1}), |_| MockQuery::new())
        .unwrap();
    cache.remove(&get_user, &json!({"id": 1})).unwrap();
    query.dispose();
    cache.remove(&get_user, &json!({"id": 1})).unwrap();

    let removals: Vec<_> = tracer
        .take()
        .into_iter()
        .filter_map(|event| match event {
            TraceEvent::Remove(outcome) => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(
        removals,
        vec![
            RemoveOutcome::NotFound,
            RemoveOutcome::StillObserved { ref_count: 1 },
            RemoveOutcome::Removed,
        ]
    );
}

#[test]
fn test_cached_result_reports_cached_promise() {
    let tracer = RecordingTracer::default();
    let cache = SuspenseCache::builder().tracer(tracer.clone()).build();
    let get_user = Operation::<User>::new("GetUser");

    let query = cache
        .get_or_create(&get_user, &(), |_| MockQuery::with_current(user("a")))
        .unwrap();

    assert_eq!(
        tracer.events()[0],
        TraceEvent::PromiseCreated(query.promise().id(), FetchKind::Cached)
    );
}

#[cfg(feature = "tracing")]
#[test]
fn test_tracing_tracer_builds() {
    let cache = SuspenseCache::builder()
        .tracer(query_suspense::TracingTracer)
        .build();
    let get_user = Operation::<User>::new("GetUser");
    let query = cache
        .get_or_create(&get_user, &(), |_| MockQuery::with_current(user("a")))
        .unwrap();
    assert!(query.dispose());
}

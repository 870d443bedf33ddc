//! Poll loop behaviour against the test store and loopback transport
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use pretty_assertions::assert_eq;
use tarry_common::{Transaction, TransactionMode, headers::names};
use tarry_delivery::{
    DelayedDeliveryError, DelayedDeliverySettings, DueDelayedMessagePoller, InMemoryTransport,
    MAX_OUTSTANDING_DISPATCHES,
};
use tarry_store::{DelayedMessageStore, TestDelayedMessageStore};
use tokio::sync::Semaphore;

use support::{
    CriticalErrors, ScriptedDispatcher, TIMEOUT, commit_stored, delayed, eventually,
    fast_settings, transport_with_queues,
};

const TIMEOUTS: &str = "orders.timeouts";
const ERRORS: &str = "error";

fn poller(
    store: &TestDelayedMessageStore,
    dispatcher: Arc<dyn tarry_delivery::Dispatcher>,
    settings: DelayedDeliverySettings,
    critical: &CriticalErrors,
) -> DueDelayedMessagePoller {
    let poller = DueDelayedMessagePoller::new(Arc::new(store.clone()), dispatcher, settings);
    poller
        .init(
            &critical.handler(),
            TransactionMode::SendsAtomicWithReceive,
            ERRORS,
            TIMEOUTS,
        )
        .expect("Failed to init poller");
    poller
}

fn loopback() -> InMemoryTransport {
    transport_with_queues(&["orders", ERRORS])
}

#[tokio::test]
async fn test_dispatches_due_message_and_removes_it() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    commit_stored(&store, delayed("a", "orders", Utc::now() - TimeDelta::seconds(1))).await;

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len("orders", 1, TIMEOUT)
        .await
        .expect("Message was not dispatched");
    store
        .wait_for_len(0, TIMEOUT)
        .await
        .expect("Message was not removed");
    poller.stop().await;

    let received = transport.drain("orders");
    assert_eq!(received[0].message_id, "a");
    assert_eq!(&*received[0].body, b"body of a");
    assert_eq!(received[0].headers["origin"], "a");
    assert!(critical.is_empty());
}

#[tokio::test]
async fn test_dispatches_every_due_message() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let now = Utc::now();
    commit_stored(&store, delayed("newer", "orders", now - TimeDelta::seconds(1))).await;
    commit_stored(&store, delayed("older", "orders", now - TimeDelta::seconds(10))).await;
    commit_stored(&store, delayed("future", "orders", now + TimeDelta::minutes(10))).await;

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len("orders", 2, TIMEOUT)
        .await
        .expect("Messages were not dispatched");
    store.wait_for_len(1, TIMEOUT).await.expect("Not removed");
    poller.stop().await;

    let mut ids: Vec<_> = transport
        .drain("orders")
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["newer", "older"]);
    assert!(store.get("future").is_some());
}

#[tokio::test]
async fn test_empty_store_sleeps_without_dispatching() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    eventually(|| store.next_calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.fetch_calls(), 1);
    assert_eq!(store.next_calls(), 1);
    assert_eq!(transport.len("orders"), 0);
    poller.stop().await;
}

#[tokio::test]
async fn test_signal_wakes_sleeping_loop() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");
    eventually(|| store.next_calls() == 1).await;

    // Stored behind the loop's back; it stays asleep until signalled.
    let due = Utc::now();
    commit_stored(&store, delayed("a", "orders", due)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.len("orders"), 0);

    assert!(poller.signal(due));
    transport
        .wait_for_len("orders", 1, TIMEOUT)
        .await
        .expect("Signal did not wake the loop");
    poller.stop().await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_signals_coalesce_into_one_wake() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");
    eventually(|| store.fetch_calls() == 1).await;

    // No await between signals, so the loop cannot consume any of them yet.
    let queued: Vec<bool> = (0..5).map(|_| poller.signal(Utc::now())).collect();
    assert_eq!(queued, vec![true, false, false, false, false]);

    eventually(|| store.fetch_calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.fetch_calls(), 2);
    poller.stop().await;
}

#[tokio::test]
async fn test_signal_beyond_max_sleep_is_ignored() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let poller = poller(&store, Arc::new(transport), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");
    eventually(|| store.fetch_calls() == 1).await;

    assert!(!poller.signal(Utc::now() + TimeDelta::minutes(10)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.fetch_calls(), 1);
    poller.stop().await;
}

#[tokio::test]
async fn test_sleeps_until_next_due_time() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    commit_stored(
        &store,
        delayed("soon", "orders", Utc::now() + TimeDelta::milliseconds(300)),
    )
    .await;

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len("orders", 1, TIMEOUT)
        .await
        .expect("Loop did not wake at the next due time");
    poller.stop().await;
}

#[tokio::test]
async fn test_second_remove_returns_false() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let message = delayed("a", "orders", Utc::now());
    commit_stored(&store, message.clone()).await;

    let poller = poller(&store, Arc::new(transport.clone()), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");
    store.wait_for_len(0, TIMEOUT).await.expect("Not removed");
    poller.stop().await;

    let tx = Transaction::begin();
    assert!(!store.remove(&message, &tx).await.expect("Remove must not fail"));
    tx.commit().await.unwrap();
    assert_eq!(transport.len("orders"), 1);
}

#[tokio::test]
async fn test_retry_then_dead_letter() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let retries = 2;
    let settings = DelayedDeliverySettings {
        number_of_retries: retries,
        ..fast_settings()
    };
    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()).failing(u32::MAX));

    commit_stored(&store, delayed("poison", "orders", Utc::now())).await;

    let poller = poller(&store, dispatcher.clone(), settings, &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len(ERRORS, 1, TIMEOUT)
        .await
        .expect("Message was not dead-lettered");
    store.wait_for_len(0, TIMEOUT).await.expect("Not removed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    poller.stop().await;

    assert_eq!(dispatcher.attempts(), usize::try_from(retries + 1).unwrap());
    assert_eq!(transport.len("orders"), 0);

    let dead = transport.drain(ERRORS);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, "poison");
    assert_eq!(dead[0].headers["origin"], "poison");
    assert_eq!(dead[0].headers[names::EXCEPTION_TYPE], "transport");
    assert_eq!(dead[0].headers[names::FAILED_QUEUE], TIMEOUTS);
    assert!(dead[0].headers[names::EXCEPTION_MESSAGE].contains("scripted failure"));
    assert!(dead[0].headers.contains_key(names::TIME_OF_FAILURE));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()).failing(1));
    commit_stored(&store, delayed("a", "orders", Utc::now())).await;

    let poller = poller(&store, dispatcher.clone(), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len("orders", 1, TIMEOUT)
        .await
        .expect("Message was not retried");
    store.wait_for_len(0, TIMEOUT).await.expect("Not removed");
    poller.stop().await;

    assert_eq!(dispatcher.attempts(), 2);
    assert_eq!(transport.len(ERRORS), 0);
}

#[tokio::test]
async fn test_missing_destination_dead_letters_without_retry() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()));
    commit_stored(&store, delayed("lost", "nowhere", Utc::now())).await;

    let poller = poller(&store, dispatcher.clone(), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    transport
        .wait_for_len(ERRORS, 1, TIMEOUT)
        .await
        .expect("Message was not dead-lettered");
    poller.stop().await;

    assert_eq!(dispatcher.attempts(), 1);
    assert!(store.is_empty());
    let dead = transport.drain(ERRORS);
    assert_eq!(
        dead[0].headers[names::EXCEPTION_TYPE],
        "transport.queue-not-found"
    );
}

#[tokio::test]
async fn test_unroutable_message_backs_off_instead_of_spinning() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = transport_with_queues(&["orders"]);
    let critical = CriticalErrors::default();

    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()));
    commit_stored(&store, delayed("lost", "nowhere", Utc::now())).await;

    let poller = poller(
        &store,
        dispatcher.clone(),
        DelayedDeliverySettings::default(),
        &critical,
    );
    poller.start().expect("Failed to start poller");
    tokio::time::sleep(Duration::from_millis(500)).await;
    poller.stop().await;

    assert_eq!(dispatcher.attempts(), 1);
    assert!(store.fetch_calls() <= 3, "fetched {} times", store.fetch_calls());
    assert_eq!(store.get("lost").map(|m| m.number_of_retries), Some(0));
    assert_eq!(transport.len("orders"), 0);
}

#[tokio::test]
async fn test_dispatch_failures_trip_dispatch_breaker() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let settings = DelayedDeliverySettings {
        number_of_retries: u32::MAX,
        time_to_trigger_dispatch_circuit_breaker_secs: 1,
        delay_after_failure_ms: 10,
        ..DelayedDeliverySettings::default()
    };
    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()).failing(u32::MAX));
    commit_stored(&store, delayed("a", "orders", Utc::now())).await;

    let poller = poller(&store, dispatcher.clone(), settings, &critical);
    poller.start().expect("Failed to start poller");

    eventually(|| critical.breakers().contains(&"dispatch".to_string())).await;
    poller.stop().await;

    assert_eq!(critical.breakers(), vec!["dispatch".to_string()]);
    assert!(dispatcher.attempts() > 1);
    assert_eq!(transport.len(ERRORS), 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_fetch_failures_trip_fetch_breaker() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let settings = DelayedDeliverySettings {
        time_to_trigger_fetch_circuit_breaker_secs: 1,
        delay_after_failure_ms: 10,
        ..DelayedDeliverySettings::default()
    };
    store.fail_fetches(u32::MAX);

    let poller = poller(&store, Arc::new(transport.clone()), settings, &critical);
    poller.start().expect("Failed to start poller");

    eventually(|| critical.breakers().contains(&"fetch".to_string())).await;

    // The loop keeps going once the store recovers.
    store.fail_fetches(0);
    commit_stored(&store, delayed("a", "orders", Utc::now())).await;
    transport
        .wait_for_len("orders", 1, TIMEOUT)
        .await
        .expect("Loop did not recover");
    poller.stop().await;

    assert_eq!(critical.breakers(), vec!["fetch".to_string()]);
}

#[tokio::test]
async fn test_increment_failure_reaches_recoverability_breaker() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let settings = DelayedDeliverySettings {
        maximum_recoverability_failures_per_second: 0,
        ..fast_settings()
    };
    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()).failing(1));
    store.fail_increments(1);
    commit_stored(&store, delayed("a", "orders", Utc::now())).await;

    let poller = poller(&store, dispatcher, settings, &critical);
    poller.start().expect("Failed to start poller");

    eventually(|| critical.breakers().contains(&"recoverability".to_string())).await;
    poller.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outstanding_dispatches_are_bounded() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    for i in 0..6 {
        commit_stored(
            &store,
            delayed(&format!("m{i}"), "orders", Utc::now() - TimeDelta::seconds(i)),
        )
        .await;
    }

    let gate = Arc::new(Semaphore::new(0));
    let dispatcher = Arc::new(ScriptedDispatcher::new(transport.clone()).gated(Arc::clone(&gate)));
    let poller = poller(&store, dispatcher.clone(), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");

    eventually(|| dispatcher.in_flight() == MAX_OUTSTANDING_DISPATCHES).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.in_flight(), MAX_OUTSTANDING_DISPATCHES);
    assert_eq!(store.fetch_calls(), MAX_OUTSTANDING_DISPATCHES + 1);

    gate.add_permits(6);
    transport
        .wait_for_len("orders", 6, TIMEOUT)
        .await
        .expect("Messages were not dispatched");
    poller.stop().await;

    assert!(dispatcher.max_in_flight() <= MAX_OUTSTANDING_DISPATCHES);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_dispatch() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let dispatcher = Arc::new(
        ScriptedDispatcher::new(transport.clone()).with_delay(Duration::from_millis(200)),
    );
    commit_stored(&store, delayed("a", "orders", Utc::now())).await;

    let poller = poller(&store, dispatcher.clone(), fast_settings(), &critical);
    poller.start().expect("Failed to start poller");
    eventually(|| dispatcher.attempts() == 1).await;

    poller.stop().await;

    assert_eq!(transport.len("orders"), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let store = TestDelayedMessageStore::initialized()
        .await
        .expect("Failed to initialise store");
    let transport = loopback();
    let critical = CriticalErrors::default();

    let uninitialised =
        DueDelayedMessagePoller::new(Arc::new(store.clone()), Arc::new(transport.clone()), fast_settings());
    assert!(matches!(
        uninitialised.start(),
        Err(DelayedDeliveryError::NotInitialized(_))
    ));

    let poller = poller(&store, Arc::new(transport), fast_settings(), &critical);
    assert!(matches!(
        poller.init(&critical.handler(), TransactionMode::None, ERRORS, TIMEOUTS),
        Err(DelayedDeliveryError::AlreadyInitialized(_))
    ));

    poller.start().expect("Failed to start poller");
    assert!(matches!(
        poller.start(),
        Err(DelayedDeliveryError::AlreadyInitialized(_))
    ));
    poller.stop().await;
}

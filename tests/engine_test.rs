//! Integration tests for the queue engine invariants
//!
//! Exercises the full service stack (admission, presence, dispatch,
//! ledger, events) the way concurrent clients would.

use queueless::domain::error::QueueError;
use queueless::domain::token::TokenState;
use queueless::domain::types::{GeoPoint, Service, ServiceStatus};
use queueless::infra::{Config, Metrics};
use queueless::io::events::EventHub;
use queueless::services::{
    AdmissionController, CallDispatcher, PresenceVerifier, TokenLedger,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

struct Engine {
    admission: AdmissionController,
    verifier: Arc<PresenceVerifier>,
    dispatcher: CallDispatcher,
    ledger: Arc<TokenLedger>,
    events: Arc<EventHub>,
}

fn engine() -> Engine {
    engine_with(Config::default())
}

fn engine_with(config: Config) -> Engine {
    let metrics = Arc::new(Metrics::new());
    let events = Arc::new(EventHub::new(1024));
    let ledger = Arc::new(TokenLedger::new(&config, events.clone(), metrics.clone()));
    Engine {
        admission: AdmissionController::new(ledger.clone(), metrics.clone()),
        verifier: Arc::new(PresenceVerifier::new(ledger.clone(), metrics.clone())),
        dispatcher: CallDispatcher::new(ledger.clone(), metrics),
        ledger,
        events,
    }
}

/// Service anchored at (0,0), radius 50 m, opened for joins
fn open_service(engine: &Engine) -> Service {
    let service = engine.ledger.create_service("Anchor Desk", 0.0, 0.0, 50.0);
    engine.ledger.set_service_status(service.id, ServiceStatus::Open).unwrap()
}

/// Roughly `meters` north of (0,0)
fn point_north(meters: f64) -> GeoPoint {
    GeoPoint::new(meters / 111_120.0, 0.0)
}

#[test]
fn concurrent_joins_get_unique_increasing_numbers() {
    let engine = Arc::new(engine());
    let service = open_service(&engine);

    let threads = 8;
    let joins_per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..joins_per_thread)
                    .map(|i| {
                        engine
                            .admission
                            .join(service.id, &format!("device-{t}-{i}"), None)
                            .unwrap()
                            .token_number
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut numbers: Vec<u64> =
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    numbers.sort_unstable();

    let total = (threads * joins_per_thread) as u64;
    assert_eq!(numbers.len() as u64, total);
    let unique: HashSet<u64> = numbers.iter().copied().collect();
    assert_eq!(unique.len() as u64, total, "token numbers must never be duplicated");
    assert_eq!(numbers.first(), Some(&1));
    assert_eq!(numbers.last(), Some(&total));
}

#[test]
fn concurrent_joins_by_one_user_share_a_token() {
    let engine = Arc::new(engine());
    let service = open_service(&engine);

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.admission.join(service.id, "device-shared", None).unwrap().id
            })
        })
        .collect();

    let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1, "one user must never hold two active tokens");
    assert_eq!(engine.ledger.active_tokens(service.id).unwrap().len(), 1);
}

#[test]
fn verify_scenario_inside_and_outside_radius() {
    let engine = engine();
    let service = open_service(&engine);

    // Four joiners: the first is promoted to NEAR, the fourth has three
    // ahead and stays WAITING
    let front = engine.admission.join(service.id, "device-0", None).unwrap();
    for i in 1..3 {
        engine.admission.join(service.id, &format!("device-{i}"), None).unwrap();
    }
    let back = engine.admission.join(service.id, "device-3", None).unwrap();
    assert_eq!(engine.ledger.token(back.id).unwrap().state, TokenState::Waiting);

    // 10 m away, radius 50 m: confirmed
    let outcome = engine.verifier.verify(front.id, point_north(10.0)).unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.token.state, TokenState::Confirmed);

    // 500 m away: rejected, state unchanged from its pre-CONFIRMING value
    let outcome = engine.verifier.verify(back.id, point_north(500.0)).unwrap();
    assert!(!outcome.accepted);
    assert_eq!(engine.ledger.token(back.id).unwrap().state, TokenState::Waiting);
}

#[test]
fn concurrent_verifies_confirm_exactly_once() {
    let engine = Arc::new(engine());
    let service = open_service(&engine);
    let mut rx = engine.events.subscribe(service.id);
    let token = engine.admission.join(service.id, "device-1", None).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let verifier = engine.verifier.clone();
            let barrier = barrier.clone();
            let token_id = token.id;
            thread::spawn(move || {
                barrier.wait();
                verifier.verify(token_id, point_north(10.0))
            })
        })
        .collect();

    let mut accepted = 0;
    let mut guarded = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(outcome) => {
                assert!(outcome.accepted);
                accepted += 1;
            }
            Err(QueueError::AlreadyVerifying) => guarded += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(accepted >= 1);
    assert_eq!(accepted + guarded, 4);
    assert_eq!(engine.ledger.token(token.id).unwrap().state, TokenState::Confirmed);

    // Exactly one committed transition into CONFIRMED
    let mut confirmed_events = 0;
    while let Ok(event) = rx.try_recv() {
        if event.new_state == TokenState::Confirmed {
            confirmed_events += 1;
        }
    }
    assert_eq!(confirmed_events, 1, "no double side effects on concurrent verify");
}

#[test]
fn concurrent_call_next_yields_distinct_tokens() {
    let engine = Arc::new(engine());
    let service = open_service(&engine);
    let counter_a = engine.ledger.add_counter(service.id, "Counter 1").unwrap();
    let counter_b = engine.ledger.add_counter(service.id, "Counter 2").unwrap();

    engine.admission.join(service.id, "device-1", None).unwrap();
    engine.admission.join(service.id, "device-2", None).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [counter_a.id, counter_b.id]
        .into_iter()
        .map(|counter_id| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.dispatcher.call_next(service.id, counter_id).unwrap()
            })
        })
        .collect();

    let called: Vec<_> =
        handles.into_iter().map(|h| h.join().unwrap().expect("two eligible tokens")).collect();
    assert_ne!(called[0].id, called[1].id, "two counters must never receive the same token");
}

#[test]
fn call_next_on_empty_service_mutates_nothing() {
    let engine = engine();
    let service = open_service(&engine);
    let counter = engine.ledger.add_counter(service.id, "Counter 1").unwrap();

    assert!(engine.dispatcher.call_next(service.id, counter.id).unwrap().is_none());
    assert!(engine.ledger.assignment(counter.id).is_none());
    assert!(engine.ledger.active_tokens(service.id).unwrap().is_empty());
}

#[test]
fn confirmed_presence_jumps_ahead_of_waiting() {
    let engine = engine_with(Config::default().with_near_threshold(0));
    let service = open_service(&engine);
    let counter = engine.ledger.add_counter(service.id, "Counter 1").unwrap();

    let first = engine.admission.join(service.id, "device-1", None).unwrap();
    let second = engine.admission.join(service.id, "device-2", None).unwrap();

    // Only #2 proves presence
    let outcome = engine.verifier.verify(second.id, point_north(5.0)).unwrap();
    assert!(outcome.accepted);

    let called = engine.dispatcher.call_next(service.id, counter.id).unwrap().unwrap();
    assert_eq!(called.id, second.id, "CONFIRMED must beat WAITING despite a higher number");

    engine.dispatcher.cancel(called.id).unwrap();
    let called = engine.dispatcher.call_next(service.id, counter.id).unwrap().unwrap();
    assert_eq!(called.id, first.id);
}

#[test]
fn closing_a_service_blocks_joins_but_not_progress() {
    let engine = engine();
    let service = open_service(&engine);
    let counter = engine.ledger.add_counter(service.id, "Counter 1").unwrap();
    let token = engine.admission.join(service.id, "device-1", None).unwrap();

    engine.dispatcher.toggle_service(service.id, ServiceStatus::Closed).unwrap();

    let err = engine.admission.join(service.id, "device-2", None).unwrap_err();
    assert_eq!(err, QueueError::ServiceClosed);

    // The existing token still verifies and gets called
    let outcome = engine.verifier.verify(token.id, point_north(10.0)).unwrap();
    assert!(outcome.accepted);
    let called = engine.dispatcher.call_next(service.id, counter.id).unwrap().unwrap();
    assert_eq!(called.id, token.id);
}

#[tokio::test]
async fn event_stream_matches_commit_order() {
    let engine = engine();
    let service = open_service(&engine);
    let counter = engine.ledger.add_counter(service.id, "Counter 1").unwrap();
    let mut rx = engine.events.subscribe(service.id);

    let token = engine.admission.join(service.id, "device-1", None).unwrap();
    engine.verifier.verify(token.id, point_north(10.0)).unwrap();
    let called = engine.dispatcher.call_next(service.id, counter.id).unwrap().unwrap();
    engine.dispatcher.complete_arrival(token.id, &called.entry_code).unwrap();
    engine.dispatcher.complete_service(token.id, &called.exit_code).unwrap();

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.token.id, token.id);
        states.push((event.old_state, event.new_state));
    }

    assert_eq!(
        states,
        vec![
            (None, TokenState::Waiting),
            (Some(TokenState::Waiting), TokenState::Near),
            (Some(TokenState::Near), TokenState::Confirming),
            (Some(TokenState::Confirming), TokenState::Confirmed),
            (Some(TokenState::Confirmed), TokenState::Called),
            (Some(TokenState::Called), TokenState::Serving),
            (Some(TokenState::Serving), TokenState::Done),
        ]
    );
}

#[test]
fn expired_sweep_only_touches_unconfirmed_waiters() {
    let engine = engine();
    let service = open_service(&engine);
    let counter = engine.ledger.add_counter(service.id, "Counter 1").unwrap();

    let waiter = engine.admission.join(service.id, "device-1", None).unwrap();
    let second = engine.admission.join(service.id, "device-2", None).unwrap();
    engine.verifier.verify(second.id, point_north(10.0)).unwrap();
    // CONFIRMED #2 is called first and then never shows up
    let called = engine.dispatcher.call_next(service.id, counter.id).unwrap().unwrap();
    assert_eq!(called.id, second.id);
    let third = engine.admission.join(service.id, "device-3", None).unwrap();
    engine.verifier.verify(third.id, point_north(10.0)).unwrap();

    // Sweep from far in the future: the no-show is missed, the waiter
    // expires, the confirmed token is untouched
    let later = chrono::Utc::now() + chrono::Duration::seconds(100_000);
    let outcome = engine.ledger.sweep(
        later,
        std::time::Duration::from_secs(120),
        std::time::Duration::from_secs(7200),
    );

    assert_eq!(outcome.missed, 1);
    assert_eq!(outcome.expired, 1);
    assert_eq!(engine.ledger.token(called.id).unwrap().state, TokenState::Missed);
    assert_eq!(engine.ledger.token(waiter.id).unwrap().state, TokenState::Expired);
    assert_eq!(engine.ledger.token(third.id).unwrap().state, TokenState::Confirmed);
    assert!(engine.ledger.assignment(counter.id).is_none());
}

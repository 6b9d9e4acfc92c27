//! End-to-end runs of booking sagas on an in-memory log.

mod common;

use std::sync::Arc;

use common::{Recorder, engine, fast_retry, outcomes};
use saga_core::ActionKind::{Compensation, Forward};
use saga_engine::{
    ActionError, MemoryStepLog, SagaDefinition, SagaStatus, StepDefinition, StepState,
};
use serde_json::json;

fn booking(recorder: &Recorder, hotel: StepDefinition) -> SagaDefinition {
    SagaDefinition::builder("booking")
        .step(
            StepDefinition::new("book_flight", recorder.ok("book_flight"))
                .with_compensation(recorder.ok("book_flight")),
        )
        .step(hotel)
        .step(
            StepDefinition::new("book_car", recorder.ok("book_car"))
                .with_compensation(recorder.ok("book_car")),
        )
        .build()
        .expect("valid definition")
}

#[tokio::test]
async fn permanent_failure_compensates_only_prior_steps() {
    let log = Arc::new(MemoryStepLog::new());
    let engine = engine(&log);
    let recorder = Recorder::default();
    engine
        .register(booking(
            &recorder,
            StepDefinition::new(
                "book_hotel",
                recorder.failing("book_hotel", ActionError::permanent("no rooms")),
            )
            .with_compensation(recorder.ok("book_hotel")),
        ))
        .expect("registers");

    let id = engine
        .create_saga("booking", json!({"customer": "ada"}))
        .await
        .expect("created");
    let report = engine.wait(id).await.expect("finishes");

    assert_eq!(report.status(), SagaStatus::Compensated);
    assert_eq!(
        outcomes(&log, id).await,
        vec![
            (0, Forward, "success"),
            (1, Forward, "failure"),
            (0, Compensation, "success"),
        ]
    );
    assert_eq!(recorder.compensations(), vec!["book_flight"]);
    assert_eq!(recorder.count("book_hotel", Forward), 1);
    assert_eq!(recorder.count("book_car", Forward), 0);
    assert_eq!(report.steps()[1].state, StepState::Failed);
    assert_eq!(report.compensated_steps(), vec!["book_flight"]);
    assert_eq!(
        report.last_error(),
        Some("permanent action error: no rooms")
    );
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let log = Arc::new(MemoryStepLog::new());
    let engine = engine(&log);
    let recorder = Recorder::default();
    engine
        .register(booking(
            &recorder,
            StepDefinition::new(
                "book_hotel",
                recorder.scripted(
                    "book_hotel",
                    vec![
                        ActionError::transient("timeout talking to hotel"),
                        ActionError::transient("timeout talking to hotel"),
                    ],
                ),
            )
            .with_retry(fast_retry(3)),
        ))
        .expect("registers");

    let id = engine
        .create_saga("booking", json!({}))
        .await
        .expect("created");
    let report = engine.wait(id).await.expect("finishes");

    assert_eq!(report.status(), SagaStatus::Completed);
    let hotel: Vec<_> = outcomes(&log, id)
        .await
        .into_iter()
        .filter(|(index, kind, _)| *index == 1 && *kind == Forward)
        .map(|(_, _, outcome)| outcome)
        .collect();
    assert_eq!(hotel, vec!["failure", "failure", "success"]);
    assert_eq!(recorder.count("book_car", Forward), 1);
    assert_eq!(report.steps()[1].attempts, 3);

    let tokens: Vec<_> = recorder
        .calls()
        .into_iter()
        .filter(|c| c.step == "book_hotel")
        .map(|c| (c.attempt, c.token))
        .collect();
    let expected = format!("{id}:1:forward");
    assert_eq!(
        tokens,
        vec![
            (1, expected.clone()),
            (2, expected.clone()),
            (3, expected)
        ]
    );
}

#[tokio::test]
async fn exhausted_compensation_fails_the_saga() {
    let log = Arc::new(MemoryStepLog::new());
    let engine = engine(&log);
    let recorder = Recorder::default();
    let definition = SagaDefinition::builder("booking")
        .step(
            StepDefinition::new("book_flight", recorder.ok("book_flight"))
                .with_compensation(recorder.ok("book_flight")),
        )
        .step(
            StepDefinition::new("book_hotel", recorder.ok("book_hotel"))
                .with_compensation(
                    recorder.failing("book_hotel", ActionError::transient("hotel api down")),
                )
                .with_compensation_retry(fast_retry(4)),
        )
        .step(StepDefinition::new(
            "book_car",
            recorder.failing("book_car", ActionError::permanent("no cars")),
        ))
        .build()
        .expect("valid definition");
    engine.register(definition).expect("registers");

    let id = engine
        .create_saga("booking", json!({}))
        .await
        .expect("created");
    let report = engine.wait(id).await.expect("finishes");

    assert_eq!(report.status(), SagaStatus::Failed);
    assert_eq!(recorder.count("book_hotel", Compensation), 4);
    assert_eq!(recorder.compensations(), vec!["book_hotel", "book_flight"]);
    assert_eq!(report.uncompensated_steps(), vec!["book_hotel"]);
    let failures = report.compensation_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].step, "book_hotel");
    assert_eq!(failures[0].attempts, 4);
    assert!(failures[0].reason.contains("hotel api down"));
    assert_eq!(report.steps()[1].state, StepState::CompensationFailed);
}

#[tokio::test]
async fn successful_saga_records_one_success_per_step() {
    let log = Arc::new(MemoryStepLog::new());
    let engine = engine(&log);
    let recorder = Recorder::default();
    engine
        .register(booking(
            &recorder,
            StepDefinition::new(
                "book_hotel",
                recorder.scripted("book_hotel", vec![ActionError::transient("busy")]),
            ),
        ))
        .expect("registers");

    let id = engine
        .create_saga("booking", json!({}))
        .await
        .expect("created");
    let report = engine.wait(id).await.expect("finishes");

    assert_eq!(report.status(), SagaStatus::Completed);
    for index in 0..3 {
        let successes = outcomes(&log, id)
            .await
            .into_iter()
            .filter(|o| *o == (index, Forward, "success"))
            .count();
        assert_eq!(successes, 1, "step {index}");
    }
    assert_eq!(
        report.result(),
        Some(&json!({"step": "book_car", "token": format!("{id}:2:forward")}))
    );
    assert!(recorder.compensations().is_empty());
}

#[tokio::test]
async fn failure_at_each_step_compensates_exactly_the_steps_before_it() {
    let names = ["reserve", "charge", "ship", "notify"];
    for failing in 0..names.len() {
        let log = Arc::new(MemoryStepLog::new());
        let engine = engine(&log);
        let recorder = Recorder::default();
        let mut steps = names.iter().enumerate().map(|(index, name)| {
            let forward = if index == failing {
                recorder.failing(name, ActionError::permanent("rejected"))
            } else {
                recorder.ok(name)
            };
            StepDefinition::new(*name, forward).with_compensation(recorder.ok(name))
        });
        let first = steps.next().expect("four steps");
        let definition = steps
            .fold(SagaDefinition::builder("order").step(first), |builder, step| {
                builder.step(step)
            })
            .build()
            .expect("valid definition");
        engine.register(definition).expect("registers");

        let id = engine
            .create_saga("order", json!({}))
            .await
            .expect("created");
        let report = engine.wait(id).await.expect("finishes");

        let expected: Vec<_> = names[..failing].iter().rev().map(ToString::to_string).collect();
        assert_eq!(report.status(), SagaStatus::Compensated);
        assert_eq!(recorder.compensations(), expected, "failing step {failing}");
        for later in &names[failing + 1..] {
            assert_eq!(recorder.count(later, Forward), 0);
        }
    }
}

#[tokio::test]
async fn steps_without_compensation_record_a_noop() {
    let log = Arc::new(MemoryStepLog::new());
    let engine = engine(&log);
    let recorder = Recorder::default();
    let definition = SagaDefinition::builder("quote")
        .step(StepDefinition::new("lookup", recorder.ok("lookup")))
        .step(
            StepDefinition::new("hold", recorder.ok("hold"))
                .with_compensation(recorder.ok("hold")),
        )
        .step(StepDefinition::new(
            "confirm",
            recorder.failing("confirm", ActionError::permanent("expired")),
        ))
        .build()
        .expect("valid definition");
    engine.register(definition).expect("registers");

    let id = engine
        .create_saga("quote", json!({}))
        .await
        .expect("created");
    let report = engine.wait(id).await.expect("finishes");

    assert_eq!(report.status(), SagaStatus::Compensated);
    let compensation: Vec<_> = outcomes(&log, id)
        .await
        .into_iter()
        .filter(|(_, kind, _)| *kind == Compensation)
        .collect();
    assert_eq!(
        compensation,
        vec![(1, Compensation, "success"), (0, Compensation, "skipped")]
    );
    assert_eq!(recorder.compensations(), vec!["hold"]);
}

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentsync_protocol::{Event, Message, PatchOp, Role};
use agentsync_runtime::{
    AdapterError, AgentOutput, EventListener, ListenerFuture, RunEnvelope, RunRequest, RunStatus,
    RunTimeouts, RuntimeConfig, STATE_DELTA_REJECTED_EVENT,
};
use agentsync_store::ThreadStore;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{
    error_code, memory_store, names, orchestrator, text_message, ScriptedAdapter, StepScript,
};

#[tokio::test(flavor = "current_thread")]
async fn hello_run_persists_one_finalized_assistant_message() {
    let store = memory_store();
    let mut events = vec![Event::RunStarted {
        thread_id: "ignored".to_owned(),
        run_id: "ignored".to_owned(),
        parent_run_id: None,
    }];
    events.extend(text_message("m1", &["Hi", " there"]));
    events.push(Event::RunFinished {
        thread_id: "ignored".to_owned(),
        run_id: "ignored".to_owned(),
        result: None,
    });
    let adapter = ScriptedAdapter::new(vec![StepScript::events(events)]);
    let orchestrator = orchestrator(RuntimeConfig::default(), store.clone(), adapter.clone());

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1").with_message(Message::user("u1", "hello")))
        .expect("dispatch");
    let mut envelopes = Vec::new();
    while let Some(envelope) = handle.next().await {
        envelopes.push(envelope);
    }

    let events: Vec<Event> = envelopes.iter().map(|envelope| envelope.event.clone()).collect();
    assert_eq!(
        names(&events),
        vec![
            "RUN_STARTED",
            "TEXT_MESSAGE_START",
            "TEXT_MESSAGE_CONTENT",
            "TEXT_MESSAGE_CONTENT",
            "TEXT_MESSAGE_END",
            "RUN_FINISHED",
        ]
    );
    let seqs: Vec<u64> = envelopes.iter().map(|envelope| envelope.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        events[0],
        Event::RunStarted {
            thread_id: "t1".to_owned(),
            run_id: handle.run_id().to_owned(),
            parent_run_id: None,
        }
    );

    let thread = store.get("t1").expect("thread");
    assert_eq!(
        thread.messages,
        vec![Message::user("u1", "hello"), Message::assistant("m1", "Hi there")]
    );
    assert_eq!(adapter.inputs()[0].messages, vec![Message::user("u1", "hello")]);
    assert_eq!(
        orchestrator.run_status(handle.run_id()),
        Some(RunStatus::Finished)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn network_failure_mid_message_errors_without_persisting_partials() {
    let store = memory_store();
    let mut items: Vec<Result<AgentOutput, AdapterError>> = text_message("m0", &["complete"])
        .into_iter()
        .map(|event| Ok(event.into()))
        .collect();
    items.push(Ok(Event::TextMessageStart {
        message_id: "m1".to_owned(),
        role: Role::Assistant,
    }
    .into()));
    items.push(Ok(Event::TextMessageContent {
        message_id: "m1".to_owned(),
        delta: "Hi".to_owned(),
    }
    .into()));
    items.push(Err(AdapterError::Network("connection reset".to_owned())));
    let adapter = ScriptedAdapter::new(vec![StepScript::new(items)]);
    let orchestrator = orchestrator(RuntimeConfig::default(), store.clone(), adapter);

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1").with_message(Message::user("u1", "hello")))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;

    assert_eq!(events.last().map(Event::name), Some("RUN_ERROR"));
    assert_eq!(error_code(&events).as_deref(), Some("ADAPTER_ERROR"));
    let contents: Vec<String> = store
        .get("t1")
        .expect("thread")
        .messages
        .into_iter()
        .map(|message| message.content)
        .collect();
    assert_eq!(contents, vec!["hello".to_owned(), "complete".to_owned()]);
    assert_eq!(
        orchestrator.run_status(handle.run_id()),
        Some(RunStatus::Errored)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn agent_delta_after_local_merge_wins_by_receipt_order() {
    let store = memory_store();
    let adapter = ScriptedAdapter::new(vec![StepScript::events(vec![Event::StateDelta {
        delta: vec![PatchOp::replace("/status", json!("y"))],
    }])]);
    let orchestrator = orchestrator(RuntimeConfig::default(), store.clone(), adapter.clone());

    let merged = orchestrator
        .merge_local_state("t1", "default", &json!({"status": "x", "draft": true}))
        .await
        .expect("merge");
    assert_eq!(merged, json!({"status": "x", "draft": true}));

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;
    assert_eq!(
        names(&events),
        vec!["RUN_STARTED", "STATE_DELTA", "RUN_FINISHED"]
    );

    assert_eq!(
        adapter.inputs()[0].state,
        json!({"status": "x", "draft": true})
    );
    let expected = json!({"status": "y", "draft": true});
    assert_eq!(
        orchestrator
            .state_snapshot("t1", "default")
            .await
            .expect("state"),
        expected
    );
    assert_eq!(
        store.get("t1").expect("thread").agent_states.get("default"),
        Some(&expected)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn stored_state_matches_live_state_after_interleaved_writes() {
    const ROUNDS: usize = 20;
    let store = memory_store();
    let steps = (0..ROUNDS)
        .map(|round| {
            StepScript::events(
                (0..4)
                    .map(|n| Event::StateDelta {
                        delta: vec![PatchOp::add("/agent", json!(round * 10 + n))],
                    })
                    .collect(),
            )
        })
        .collect();
    let adapter = ScriptedAdapter::new(steps);
    let orchestrator = orchestrator(RuntimeConfig::default(), store.clone(), adapter);
    orchestrator
        .merge_local_state("t1", "default", &json!({"n": -1}))
        .await
        .expect("first merge");

    for round in 0..ROUNDS {
        let mut handle = orchestrator
            .dispatch(RunRequest::new("t1"))
            .expect("dispatch");
        let partials: Vec<_> = (0..16).map(|n| json!({ "n": n })).collect();
        let merges = futures::future::join_all(
            partials
                .iter()
                .map(|partial| orchestrator.merge_local_state("t1", "default", partial)),
        );
        let (events, merged) = tokio::join!(handle.collect_until_terminal(), merges);
        assert_eq!(events.last().map(Event::name), Some("RUN_FINISHED"));
        assert!(merged.iter().all(Result::is_ok));

        let live = orchestrator
            .state_snapshot("t1", "default")
            .await
            .expect("state");
        let stored = store
            .get("t1")
            .expect("thread")
            .agent_states
            .get("default")
            .cloned();
        assert_eq!(stored, Some(live), "round {round}");
    }
}

#[tokio::test(flavor = "current_thread")]
async fn request_state_is_merged_before_the_first_step() {
    let adapter = ScriptedAdapter::new(vec![StepScript::events(vec![Event::StateSnapshot {
        snapshot: json!({"items": []}),
    }])]);
    let orchestrator = orchestrator(RuntimeConfig::default(), memory_store(), adapter.clone());

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1").with_state(json!({"filter": "open"})))
        .expect("dispatch");
    handle.collect_until_terminal().await;

    assert_eq!(adapter.inputs()[0].state, json!({"filter": "open"}));
    assert_eq!(
        orchestrator
            .state_snapshot("t1", "default")
            .await
            .expect("state"),
        json!({"items": []})
    );
}

#[tokio::test(flavor = "current_thread")]
async fn rejected_delta_is_reported_and_the_run_continues() {
    let adapter = ScriptedAdapter::new(vec![StepScript::events(vec![
        Event::StateSnapshot {
            snapshot: json!({"count": 1}),
        },
        Event::StateDelta {
            delta: vec![
                PatchOp::replace("/count", json!(2)),
                PatchOp::remove("/missing"),
            ],
        },
        Event::StateDelta {
            delta: vec![PatchOp::add("/done", json!(true))],
        },
    ])]);
    let orchestrator = orchestrator(RuntimeConfig::default(), memory_store(), adapter);

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;

    assert_eq!(
        names(&events),
        vec![
            "RUN_STARTED",
            "STATE_SNAPSHOT",
            "CUSTOM",
            "STATE_DELTA",
            "RUN_FINISHED"
        ]
    );
    assert!(support::custom_value(&events, STATE_DELTA_REJECTED_EVENT).is_some());
    assert_eq!(
        orchestrator
            .state_snapshot("t1", "default")
            .await
            .expect("state"),
        json!({"count": 1, "done": true})
    );
    assert_eq!(orchestrator.metrics_snapshot().state_deltas_rejected, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_adapter_stream_is_a_protocol_error() {
    let adapter = ScriptedAdapter::new(vec![StepScript::events(vec![
        Event::TextMessageContent {
            message_id: "m1".to_owned(),
            delta: "orphan".to_owned(),
        },
    ])]);
    let orchestrator = orchestrator(RuntimeConfig::default(), memory_store(), adapter);

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;
    assert_eq!(names(&events), vec!["RUN_STARTED", "RUN_ERROR"]);
    assert_eq!(error_code(&events).as_deref(), Some("PROTOCOL_ERROR"));
}

#[tokio::test(flavor = "current_thread")]
async fn cancelling_a_running_run_emits_cancelled() {
    let store = memory_store();
    let adapter = ScriptedAdapter::new(vec![StepScript::events(vec![
        Event::TextMessageStart {
            message_id: "m1".to_owned(),
            role: Role::Assistant,
        },
        Event::TextMessageContent {
            message_id: "m1".to_owned(),
            delta: "thinking".to_owned(),
        },
    ])
    .hanging()]);
    let orchestrator = orchestrator(RuntimeConfig::default(), store.clone(), adapter);

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let started = handle
        .collect_until(|event| matches!(event, Event::TextMessageContent { .. }))
        .await;
    assert_eq!(started.len(), 3);
    assert_eq!(
        orchestrator.active_runs("t1"),
        vec![handle.run_id().to_owned()]
    );

    orchestrator.cancel(handle.run_id()).expect("cancel");
    let rest = handle.collect_until_terminal().await;
    assert_eq!(names(&rest), vec!["RUN_ERROR"]);
    assert_eq!(error_code(&rest).as_deref(), Some("CANCELLED"));
    assert!(store.get("t1").expect("thread").messages.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn silent_adapter_hits_the_chunk_timeout() {
    let adapter = ScriptedAdapter::new(vec![StepScript::new(Vec::new()).hanging()]);
    let config = RuntimeConfig::default().with_timeouts(
        RunTimeouts::default().with_adapter_chunk(Duration::from_millis(20)),
    );
    let orchestrator = orchestrator(config, memory_store(), adapter);

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;
    assert_eq!(error_code(&events).as_deref(), Some("TIMEOUT"));
}

#[derive(Default)]
struct Collecting {
    seen: Mutex<Vec<RunEnvelope>>,
}

impl EventListener for Collecting {
    fn on_event<'a>(&'a self, envelope: &'a RunEnvelope) -> ListenerFuture<'a> {
        Box::pin(async move {
            self.seen.lock().expect("seen lock").push(envelope.clone());
            Ok(())
        })
    }
}

#[tokio::test(flavor = "current_thread")]
async fn live_subscribers_and_listeners_see_every_envelope() {
    let adapter = ScriptedAdapter::new(vec![StepScript::events(text_message("m1", &["ok"]))]);
    let orchestrator = orchestrator(RuntimeConfig::default(), memory_store(), adapter);
    let listener = Arc::new(Collecting::default());
    orchestrator.add_listener(listener.clone());
    let mut live = orchestrator.subscribe_live();

    let mut handle = orchestrator
        .dispatch(RunRequest::new("t1"))
        .expect("dispatch");
    let events = handle.collect_until_terminal().await;
    assert_eq!(events.len(), 5);

    let mut live_seqs = Vec::new();
    while let Ok(envelope) = live.try_recv() {
        live_seqs.push(envelope.seq);
    }
    assert_eq!(live_seqs, vec![1, 2, 3, 4, 5]);

    for _ in 0..50 {
        if listener.seen.lock().expect("seen lock").len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let seen = listener.seen.lock().expect("seen lock").clone();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|envelope| envelope.run_id == handle.run_id()));

    let metrics = orchestrator.metrics_snapshot();
    assert_eq!(metrics.runs_started, 1);
    assert_eq!(metrics.runs_finished, 1);
    assert_eq!(metrics.active_runs, 0);
    assert_eq!(metrics.events_emitted, 5);
    assert_eq!(metrics.listener_write_count, 5);
}

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use agentsync_runtime::{
    AdapterError, AgentInput, AgentOutput, AgentStream, InterruptRequest, ResumeOutcome,
};
use futures::stream;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;

/// Replies with the latest user message, upper-cased.
struct Shout;

impl AgentAdapter for Shout {
    fn run(&self, input: AgentInput) -> AgentStream {
        let heard = input
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.to_uppercase())
            .unwrap_or_default();
        let message_id = format!("reply_{}", input.messages.len());
        let events = vec![
            Event::TextMessageStart {
                message_id: message_id.clone(),
                role: Role::Assistant,
            },
            Event::TextMessageContent {
                message_id: message_id.clone(),
                delta: heard,
            },
            Event::TextMessageEnd { message_id },
        ];
        Box::pin(stream::iter(
            events
                .into_iter()
                .map(|event| Ok::<_, AdapterError>(AgentOutput::Event(event))),
        ))
    }
}

struct Unreachable;

impl AgentAdapter for Unreachable {
    fn run(&self, _input: AgentInput) -> AgentStream {
        Box::pin(stream::iter(vec![Err(AdapterError::Network(
            "connection reset".to_owned(),
        ))]))
    }
}

/// Pauses on the first step, then answers once resumed.
struct AskFirst;

impl AgentAdapter for AskFirst {
    fn run(&self, input: AgentInput) -> AgentStream {
        if input.resume.is_some() {
            return Shout.run(input);
        }
        Box::pin(stream::iter(vec![Ok(AgentOutput::Interrupt(
            InterruptRequest {
                node_id: "confirm".to_owned(),
                value: json!({"question": "proceed?"}),
                state: None,
            },
        ))]))
    }
}

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn temp_store_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("agentsync_{label}_{nanos}"))
}

#[test]
fn env_overrides_select_a_store_dir() {
    let config = CopilotConfig::new()
        .with_env_overrides(lookup(&[
            (STORE_DIR_ENV, "/var/lib/agentsync"),
            ("AGENTSYNC_MAX_STEPS", "4"),
        ]))
        .expect("overrides");
    assert_eq!(
        config.store,
        StoreLocation::Dir(PathBuf::from("/var/lib/agentsync"))
    );
    assert_eq!(config.runtime.max_steps, 4);

    let config = CopilotConfig::new()
        .with_env_overrides(lookup(&[(STORE_DIR_ENV, "  ")]))
        .expect("blank dir");
    assert_eq!(config.store, StoreLocation::default());

    let err = CopilotConfig::new()
        .with_env_overrides(lookup(&[("AGENTSYNC_RUN_TIMEOUT_MS", "soon")]))
        .expect_err("bad number");
    assert!(matches!(err, RuntimeError::InvalidConfig(_)));
}

#[test]
fn relative_store_dir_is_resolved_against_cwd() {
    let config = CopilotConfig::new().with_store_dir("threads");
    let StoreLocation::Dir(dir) = &config.store else {
        panic!("expected a store dir");
    };
    assert!(dir.is_absolute());
    assert!(dir.ends_with("threads"));
}

#[test]
fn zero_capacity_memory_store_is_rejected() {
    let config = CopilotConfig::new().with_memory_store(Some(0));
    assert!(matches!(
        config.open_store(),
        Err(RuntimeError::InvalidConfig(_))
    ));
    assert!(CopilotConfig::new()
        .with_memory_store(Some(8))
        .open_store()
        .is_ok());
}

#[test]
fn interrupt_notice_needs_checkpoint_and_node() {
    let full = Event::custom(
        INTERRUPT_EVENT,
        json!({"checkpointId": "ckpt_1", "nodeId": "review", "value": null}),
    );
    assert_eq!(
        interrupt_notice(&full),
        Some(("ckpt_1".to_owned(), "review".to_owned()))
    );
    assert_eq!(
        interrupt_notice(&Event::custom(INTERRUPT_EVENT, json!({"nodeId": "x"}))),
        None
    );
    assert_eq!(
        interrupt_notice(&Event::custom("other", json!({"checkpointId": "c", "nodeId": "n"}))),
        None
    );
}

#[test]
fn reply_ignores_text_from_non_assistant_messages() {
    let events = vec![
        Event::TextMessageStart {
            message_id: "sys".to_owned(),
            role: Role::System,
        },
        Event::TextMessageContent {
            message_id: "sys".to_owned(),
            delta: "hidden".to_owned(),
        },
        Event::TextMessageEnd {
            message_id: "sys".to_owned(),
        },
        Event::TextMessageStart {
            message_id: "a1".to_owned(),
            role: Role::Assistant,
        },
        Event::TextMessageContent {
            message_id: "a1".to_owned(),
            delta: "shown".to_owned(),
        },
        Event::TextMessageEnd {
            message_id: "a1".to_owned(),
        },
        Event::RunFinished {
            thread_id: "t1".to_owned(),
            run_id: "run_1".to_owned(),
            result: Some(json!({"ok": true})),
        },
    ];
    let reply = fold_reply("run_1".to_owned(), events).expect("reply");
    assert_eq!(reply.text, "shown");
    assert_eq!(reply.result, Some(json!({"ok": true})));

    assert_eq!(
        fold_reply("run_2".to_owned(), Vec::new()),
        Err(AskError::Incomplete {
            run_id: "run_2".to_owned()
        })
    );
}

#[tokio::test(flavor = "current_thread")]
async fn ask_returns_the_assistant_text_and_keeps_history() {
    let copilot = Copilot::start_default(Arc::new(Shout)).expect("start");

    let reply = copilot.ask("t1", "hello there").await.expect("ask");
    assert_eq!(reply.text, "HELLO THERE");
    assert!(reply.run_id.starts_with("run_"));
    assert_eq!(reply.events.first().map(Event::name), Some("RUN_STARTED"));

    copilot.ask("t1", "again").await.expect("second ask");
    let thread = copilot.orchestrator().thread("t1").await.expect("thread");
    let contents: Vec<&str> = thread
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["hello there", "HELLO THERE", "again", "AGAIN"]);
}

#[tokio::test(flavor = "current_thread")]
async fn ask_surfaces_run_errors() {
    let copilot = Copilot::start_default(Arc::new(Unreachable)).expect("start");
    let err = copilot.ask("t1", "hi").await.expect_err("run error");
    let AskError::Run { code, message, .. } = err else {
        panic!("expected a run error, got {err:?}");
    };
    assert_eq!(code.as_deref(), Some("ADAPTER_ERROR"));
    assert!(message.contains("connection reset"));

    let err = copilot.ask("  ", "hi").await.expect_err("blank thread");
    assert!(matches!(
        err,
        AskError::Dispatch(RuntimeError::InvalidRequest(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn ask_reports_an_interrupt_that_can_be_resumed() {
    let copilot = Copilot::start_default(Arc::new(AskFirst)).expect("start");
    let err = copilot.ask("t1", "deploy").await.expect_err("paused");
    let AskError::Interrupted {
        run_id,
        checkpoint_id,
        node_id,
    } = err
    else {
        panic!("expected an interrupt, got {err:?}");
    };
    assert_eq!(node_id, "confirm");

    let mut live = copilot.orchestrator().subscribe_live();
    let outcome = copilot
        .orchestrator()
        .resume("t1", &checkpoint_id, json!({"proceed": true}))
        .await
        .expect("resume");
    assert!(matches!(
        outcome,
        ResumeOutcome::Resumed { run_id: ref resumed } if *resumed == run_id
    ));

    loop {
        let envelope = live.recv().await.expect("live event");
        if envelope.event.is_terminal() {
            assert_eq!(envelope.event.name(), "RUN_FINISHED");
            assert_eq!(envelope.run_id, run_id);
            break;
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn quick_ask_uses_a_fresh_thread() {
    let text = quick_ask(Arc::new(Shout), "ping").await.expect("quick ask");
    assert_eq!(text, "PING");
}

#[tokio::test(flavor = "current_thread")]
async fn store_dir_history_outlives_the_copilot() {
    let dir = temp_store_dir("copilot");
    let config = CopilotConfig::new().with_store_dir(&dir);

    let first = Copilot::start(config.clone(), Arc::new(Shout)).expect("start");
    first.ask("t1", "remember me").await.expect("ask");
    drop(first);

    let second = Copilot::start(config, Arc::new(Shout)).expect("restart");
    let thread = second.orchestrator().thread("t1").await.expect("thread");
    let roles: Vec<(Role, &str)> = thread
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect();
    assert_eq!(
        roles,
        vec![(Role::User, "remember me"), (Role::Assistant, "REMEMBER ME")]
    );

    let _ = std::fs::remove_dir_all(&dir);
}

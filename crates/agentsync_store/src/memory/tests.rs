use std::thread;

use agentsync_protocol::Role;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;

fn checkpoint(id: &str) -> Checkpoint {
    Checkpoint {
        checkpoint_id: id.to_owned(),
        run_id: "run_1".to_owned(),
        agent: "planner".to_owned(),
        node_id: "approve".to_owned(),
        value: json!({"question": "ok?"}),
        pending_state: json!({"draft": 1}),
        created_at_ms: 0,
    }
}

#[test]
fn unknown_thread_is_empty_not_an_error() {
    let store = MemoryThreadStore::new();
    let thread = store.get("never-seen").expect("get");
    assert_eq!(thread.id, "never-seen");
    assert!(thread.is_empty());
}

#[test]
fn messages_keep_append_order_and_reject_duplicate_ids() {
    let store = MemoryThreadStore::new();
    store
        .append_message("t1", Message::user("m1", "hello"))
        .expect("append m1");
    store
        .append_message("t1", Message::assistant("m2", "Hi there"))
        .expect("append m2");
    assert_eq!(
        store.append_message("t1", Message::user("m1", "again")),
        Err(StoreError::DuplicateMessage("m1".to_owned()))
    );

    let thread = store.get("t1").expect("get");
    let roles: Vec<Role> = thread.messages.iter().map(|message| message.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(thread.messages[1].content, "Hi there");
}

#[test]
fn upsert_state_and_delete() {
    let store = MemoryThreadStore::new();
    store
        .upsert_state("t1", "planner", json!({"step": 1}))
        .expect("upsert");
    store
        .upsert_state("t1", "planner", json!({"step": 2}))
        .expect("upsert again");
    assert_eq!(
        store.get("t1").expect("get").agent_states.get("planner"),
        Some(&json!({"step": 2}))
    );
    assert_eq!(store.delete("t1"), Ok(true));
    assert_eq!(store.delete("t1"), Ok(false));
    assert!(store.get("t1").expect("get after delete").is_empty());
}

#[test]
fn checkpoints_are_taken_once() {
    let store = MemoryThreadStore::new();
    store
        .save_checkpoint("t1", checkpoint("ckpt_1"))
        .expect("save");
    assert_eq!(
        store.get("t1").expect("get").checkpoint("ckpt_1"),
        Some(&checkpoint("ckpt_1"))
    );
    assert_eq!(
        store.take_checkpoint("t1", "ckpt_1"),
        Ok(checkpoint("ckpt_1"))
    );
    assert_eq!(
        store.take_checkpoint("t1", "ckpt_1"),
        Err(StoreError::CheckpointNotFound("ckpt_1".to_owned()))
    );
}

#[test]
fn eviction_drops_least_recently_active_thread() {
    let store = MemoryThreadStore::with_max_threads(2);
    store
        .append_message("a", Message::user("m1", "a"))
        .expect("a");
    store
        .append_message("b", Message::user("m1", "b"))
        .expect("b");
    // Touch `a` so `b` becomes the eviction candidate.
    store.get("a").expect("touch a");
    store
        .append_message("c", Message::user("m1", "c"))
        .expect("c");

    assert_eq!(
        store.list_thread_ids().expect("list"),
        vec!["a".to_owned(), "c".to_owned()]
    );
    assert_eq!(store.get("a").expect("a").messages.len(), 1);
}

#[test]
fn reading_unknown_threads_never_evicts() {
    let store = MemoryThreadStore::with_max_threads(1);
    store
        .append_message("real", Message::user("m1", "keep me"))
        .expect("append");

    assert!(store.get("typo").expect("get unknown").is_empty());
    assert_eq!(
        store.take_checkpoint("typo", "ckpt_1"),
        Err(StoreError::CheckpointNotFound("ckpt_1".to_owned()))
    );

    assert_eq!(store.list_thread_ids().expect("list"), vec!["real".to_owned()]);
    assert_eq!(store.get("real").expect("real").messages.len(), 1);
}

#[test]
fn concurrent_appends_to_one_thread_are_all_kept() {
    let store = Arc::new(MemoryThreadStore::new());
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for index in 0..50 {
                    store
                        .append_message("shared", Message::user(format!("w{worker}-{index}"), "x"))
                        .expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    let thread = store.get("shared").expect("get");
    assert_eq!(thread.messages.len(), 200);
    let first_worker: Vec<&str> = thread
        .messages
        .iter()
        .filter(|message| message.id.starts_with("w0-"))
        .map(|message| message.id.as_str())
        .collect();
    let expected: Vec<String> = (0..50).map(|index| format!("w0-{index}")).collect();
    assert_eq!(first_worker, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

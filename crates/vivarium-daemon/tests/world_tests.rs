//! End-to-end tests for the world simulation layer: VFS interception,
//! network mocking, chaos injection, and snapshot/restore.

mod common;

use serde_json::{json, Value};
use vivarium_core::protocol::SyscallOp;

use common::TestKernel;

async fn create_world(client: &mut common::Client, name: &str, config: Value) -> String {
    let response = client
        .call_ok(SyscallOp::WorldCreate, json!({"name": name, "config": config}))
        .await;
    response["world_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn vfs_interception_read_write() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let world_id = create_world(
        &mut client,
        "sim",
        json!({
            "virtual_filesystem": {
                "initial_files": {"/data/x": "hello"},
                "intercept_patterns": ["/**"]
            }
        }),
    )
    .await;

    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_id}))
        .await;

    let read = client
        .call_ok(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert_eq!(read["content"], "hello");
    assert_eq!(read["virtual"], true);
    assert_eq!(read["world"], json!(world_id));

    client
        .call_ok(SyscallOp::Write, json!({"path": "/data/x", "content": "bye"}))
        .await;
    let read = client
        .call_ok(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert_eq!(read["content"], "bye");

    // A miss stays virtual: the host filesystem is never consulted.
    let miss = client
        .call(SyscallOp::Read, json!({"path": "/etc/hostname"}))
        .await;
    assert_eq!(miss["success"], false);
    assert!(miss["error"]
        .as_str()
        .unwrap()
        .contains("virtual filesystem"));
}

#[tokio::test]
async fn worlds_are_isolated_from_each_other() {
    let kernel = TestKernel::start().await;
    let mut agent_a = kernel.client().await;
    let mut agent_b = kernel.client().await;

    let world_a = create_world(
        &mut agent_a,
        "wa",
        json!({"virtual_filesystem": {"initial_files": {"/data/x": "A"}}}),
    )
    .await;
    let world_b = create_world(
        &mut agent_a,
        "wb",
        json!({"virtual_filesystem": {"initial_files": {"/data/x": "B"}}}),
    )
    .await;

    agent_a
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_a}))
        .await;
    agent_b
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_b}))
        .await;

    agent_a
        .call_ok(SyscallOp::Write, json!({"path": "/data/x", "content": "A2"}))
        .await;

    let b_view = agent_b
        .call_ok(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert_eq!(b_view["content"], "B");

    // After leaving, agent A reads the host path rules again, not the
    // world's.
    agent_a.call_ok(SyscallOp::WorldLeave, json!({})).await;
    let host_read = agent_a
        .call(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert!(host_read.get("virtual").is_none());
}

#[tokio::test]
async fn join_rules_and_destroy_rules() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let first = create_world(&mut client, "first", json!({})).await;
    let second = create_world(&mut client, "second", json!({})).await;

    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": first}))
        .await;

    // Joining a second world fails until the agent leaves.
    let rejected = client
        .call(SyscallOp::WorldJoin, json!({"world_id": second}))
        .await;
    assert_eq!(rejected["success"], false);

    // Destroying an occupied world needs force.
    let rejected = client
        .call(SyscallOp::WorldDestroy, json!({"world_id": first}))
        .await;
    assert_eq!(rejected["success"], false);
    let forced = client
        .call_ok(
            SyscallOp::WorldDestroy,
            json!({"world_id": first, "force": true}),
        )
        .await;
    assert_eq!(forced["success"], true);

    // Force-destroy evicted the member; joining the other world now
    // works.
    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": second}))
        .await;

    let list = client.call_ok(SyscallOp::WorldList, json!({})).await;
    assert_eq!(list["count"], 1);
    assert_eq!(list["worlds"][0]["agent_count"], 1);
}

#[tokio::test]
async fn chaos_event_forces_read_failures() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let world_id = create_world(
        &mut client,
        "chaotic",
        json!({
            "virtual_filesystem": {"initial_files": {"/data/x": "ok"}},
            "chaos": {"enabled": true}
        }),
    )
    .await;
    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_id}))
        .await;

    // Healthy before the event.
    let read = client
        .call_ok(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert_eq!(read["content"], "ok");

    client
        .call_ok(
            SyscallOp::WorldEvent,
            json!({"world_id": world_id, "event_type": "disk_fail"}),
        )
        .await;

    let read = client.call(SyscallOp::Read, json!({"path": "/data/x"})).await;
    assert_eq!(read["success"], false);
    assert!(read["error"].as_str().unwrap().contains("chaos"));

    let state = client
        .call_ok(SyscallOp::WorldState, json!({"world_id": world_id}))
        .await;
    assert!(state["state"]["chaos_metrics"]["failures_injected"].as_u64().unwrap() >= 1);
    assert!(state["state"]["chaos_metrics"]["active_events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == "disk_fail"));
}

#[tokio::test]
async fn network_mock_intercepts_http() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let world_id = create_world(
        &mut client,
        "net",
        json!({
            "network": {
                "mode": "mock",
                "mock_responses": {
                    "https://api.example.com/*": {
                        "status": 200,
                        "body": "{\"ok\":true}",
                        "headers": {"content-type": "application/json"}
                    }
                },
                "fail_unmatched": true
            }
        }),
    )
    .await;
    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_id}))
        .await;

    let mocked = client
        .call_ok(SyscallOp::Http, json!({"url": "https://api.example.com/v1/users"}))
        .await;
    assert_eq!(mocked["mocked"], true);
    assert_eq!(mocked["status"], 200);
    assert_eq!(mocked["body"], "{\"ok\":true}");
    assert_eq!(mocked["world"], json!(world_id));

    // Unmatched URLs are answered 503 by the mock, not the network.
    let unmatched = client
        .call_ok(SyscallOp::Http, json!({"url": "https://other.example.net/"}))
        .await;
    assert_eq!(unmatched["mocked"], true);
    assert_eq!(unmatched["status"], 503);
}

#[tokio::test]
async fn snapshot_restore_round_trip() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let world_id = create_world(
        &mut client,
        "origin",
        json!({
            "virtual_filesystem": {"initial_files": {"/data/x": "v1"}},
            "network": {"mode": "mock", "fail_unmatched": true},
            "chaos": {"enabled": true}
        }),
    )
    .await;
    client
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": world_id}))
        .await;
    client
        .call_ok(SyscallOp::Write, json!({"path": "/data/x", "content": "v2"}))
        .await;

    let snapshot = client
        .call_ok(SyscallOp::WorldSnapshot, json!({"world_id": world_id}))
        .await;
    let document = snapshot["snapshot"].clone();
    assert_eq!(document["agents"].as_array().unwrap().len(), 1);

    let restored = client
        .call_ok(
            SyscallOp::WorldRestore,
            json!({"snapshot": document, "new_world_id": "copy"}),
        )
        .await;
    assert_eq!(restored["world_id"], "copy");

    let state = client
        .call_ok(SyscallOp::WorldState, json!({"world_id": "copy"}))
        .await;
    let state = &state["state"];
    // The member set is preserved as data; no processes are attached.
    assert_eq!(state["agent_count"], 1);
    assert_eq!(state["vfs_metrics"]["file_count"], 1);

    // The restored VFS carries the post-write content.
    let mut visitor = kernel.client().await;
    visitor.call_ok(SyscallOp::Hello, json!({})).await;
    // The original member still occupies its world; the visitor can
    // join the copy and read.
    visitor
        .call_ok(SyscallOp::WorldJoin, json!({"world_id": "copy"}))
        .await;
    let read = visitor
        .call_ok(SyscallOp::Read, json!({"path": "/data/x"}))
        .await;
    assert_eq!(read["content"], "v2");
}

#[tokio::test]
async fn world_state_for_unknown_world_fails() {
    let kernel = TestKernel::start().await;
    let mut client = kernel.client().await;

    let response = client
        .call(SyscallOp::WorldState, json!({"world_id": "nope"}))
        .await;
    assert_eq!(response["success"], false);

    let response = client.call(SyscallOp::WorldLeave, json!({})).await;
    assert_eq!(response["success"], false);
}

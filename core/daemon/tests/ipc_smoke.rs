mod common;

use common::{call, data, flows_dir, spawn_daemon, temp_home, wait_for};
use flowd_protocol::Method;
use serde_json::{json, Value};
use std::time::Duration;

#[test]
fn daemon_routes_events_and_drives_sessions() {
    let home = temp_home("flowd-smoke");
    if !common::can_bind_socket(home.path()) {
        eprintln!("Skipping smoke test: unix socket binding not permitted in this environment.");
        return;
    }
    let _guard = spawn_daemon(home.path());
    let socket = common::socket_path(home.path());

    let health = data(call(&socket, Method::GetHealth, None));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["triggers"], 0);

    let catalog = data(call(&socket, Method::GetActivityCatalog, None));
    let ids: Vec<&str> = catalog["activities"]
        .as_array()
        .expect("catalog activities")
        .iter()
        .filter_map(|activity| activity["id"].as_str())
        .collect();
    assert!(ids.contains(&"send_to_terminal"));
    assert!(ids.contains(&"webhook"));

    let config = json!({
        "version": 1,
        "triggers": [
            { "id": "Readme Edit", "event_type": "file_changed", "where": { "path": "readme.md" } },
            { "id": "coder paused", "event_type": "workflow_paused", "where": { "session.id": "coder" } }
        ],
        "bindings_by_trigger_id": {
            "Readme Edit": [ { "activity_id": "toast", "config": { "message": "readme changed" } } ],
            "coder paused": [ { "activity_id": "toast", "config": { "message": "coder needs you" } } ]
        }
    });
    let replaced = data(call(&socket, Method::ReplaceConfig, Some(config)));
    assert_eq!(replaced["replaced"], true);
    assert!(flows_dir(home.path()).join("readme-edit.flow.json").is_file());
    assert!(flows_dir(home.path()).join("coder-paused.flow.json").is_file());

    wait_for(Duration::from_secs(5), || {
        let config = data(call(&socket, Method::GetConfig, None));
        (config["triggers"].as_array().map(Vec::len) == Some(2)).then_some(())
    });

    let event = json!({ "fields": { "type": "file_changed", "path": "readme.md" } });
    let accepted = data(call(&socket, Method::Event, Some(event.clone())));
    assert_eq!(accepted["accepted"], true);
    let event_id = accepted["event_id"].as_str().expect("event id").to_string();
    let again = data(call(&socket, Method::Event, Some(event)));
    assert_eq!(again["event_id"].as_str(), Some(event_id.as_str()));

    wait_for(Duration::from_secs(5), || {
        let health = data(call(&socket, Method::GetHealth, None));
        (health["router"]["dispatches_started"] == 1).then_some(())
    });

    let started = data(call(
        &socket,
        Method::StartSession,
        Some(json!({ "session_id": "coder 2", "agent_id": "coder", "l1": "plan" })),
    ));
    assert_eq!(started["status"], "running");

    let signal = |payload: Value| {
        data(call(
            &socket,
            Method::SignalSession,
            Some(json!({ "session_id": "coder 2", "signal": payload })),
        ))
    };
    let status = || data(call(&socket, Method::GetSessionStatus, Some(json!({ "session_id": "coder 2" }))));

    signal(json!({ "signal": "bell", "context": "waiting for review" }));
    wait_for(Duration::from_secs(5), || (status()["status"] == "paused").then_some(()));

    // workflow_paused for "coder 2" matches the "coder" trigger.
    wait_for(Duration::from_secs(5), || {
        let health = data(call(&socket, Method::GetHealth, None));
        (health["router"]["dispatches_started"] == 2).then_some(())
    });

    signal(json!({ "signal": "resume", "action": "continue" }));
    wait_for(Duration::from_secs(5), || (status()["status"] == "running").then_some(()));

    signal(json!({ "signal": "terminate", "reason": "done" }));
    let result = wait_for(Duration::from_secs(5), || {
        let response = call(
            &socket,
            Method::GetSessionResult,
            Some(json!({ "session_id": "coder 2" })),
        );
        response.ok.then(|| response.data.unwrap_or(Value::Null))
    });
    assert_eq!(result["final_status"], "stopped");
    assert_eq!(result["event_count"], 3);

    let final_state = status();
    assert_eq!(final_state["bell_events"][0]["context"], "waiting for review");

    let bundle = data(call(&socket, Method::ExportBundle, None));
    assert_eq!(bundle["version"], 1);
    assert_eq!(bundle["flows"].as_array().map(Vec::len), Some(2));
}

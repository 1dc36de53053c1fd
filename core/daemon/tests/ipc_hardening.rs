mod common;

use common::{
    call, can_bind_socket, data, error_code, flows_dir, read_response, send_raw, socket_path,
    spawn_daemon, temp_home, wait_for,
};
use flowd_protocol::{Method, Request, PROTOCOL_VERSION};
use serde_json::json;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[test]
fn daemon_handles_malformed_payload_flood_without_losing_health() {
    let home = temp_home("flowd-malformed");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping malformed flood test: unix socket binding not permitted in this environment.");
        return;
    }
    let _guard = spawn_daemon(home.path());
    let socket = socket_path(home.path());

    for _ in 0..64 {
        let response = send_raw(&socket, b"{\"bad_json\": true\n");
        assert!(!response.ok, "malformed payload must be rejected");
        assert_eq!(error_code(&response), Some("invalid_json"));
    }

    let health = call(&socket, Method::GetHealth, None);
    assert!(health.ok, "daemon should remain healthy after malformed flood");
}

#[test]
fn daemon_rejects_protocol_mismatch_and_bad_params() {
    let home = temp_home("flowd-params");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping params test: unix socket binding not permitted in this environment.");
        return;
    }
    let _guard = spawn_daemon(home.path());
    let socket = socket_path(home.path());

    let mut stream = UnixStream::connect(&socket).expect("connect");
    let request = Request {
        protocol_version: PROTOCOL_VERSION + 1,
        method: Method::GetHealth,
        id: None,
        params: None,
    };
    serde_json::to_writer(&mut stream, &request).expect("serialize");
    stream.write_all(b"\n").expect("write");
    let response = read_response(&mut stream);
    assert_eq!(error_code(&response), Some("protocol_mismatch"));

    let response = call(&socket, Method::Event, None);
    assert_eq!(error_code(&response), Some("invalid_params"));

    let response = call(&socket, Method::Event, Some(json!({ "fields": { "path": "a" } })));
    assert_eq!(error_code(&response), Some("missing_field"));

    let response = call(
        &socket,
        Method::SignalSession,
        Some(json!({ "session_id": "ghost", "signal": { "signal": "terminate" } })),
    );
    assert_eq!(error_code(&response), Some("not_found"));

    let response = call(
        &socket,
        Method::StartSession,
        Some(json!({ "session_id": "s", "agent_id": "" })),
    );
    assert_eq!(error_code(&response), Some("missing_field"));
}

#[test]
fn invalid_config_is_rejected_without_touching_disk() {
    let home = temp_home("flowd-config");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping config test: unix socket binding not permitted in this environment.");
        return;
    }
    let _guard = spawn_daemon(home.path());
    let socket = socket_path(home.path());

    let duplicate = json!({
        "version": 1,
        "triggers": [
            { "id": "a", "event_type": "file_changed" },
            { "id": "a", "event_type": "config_changed" }
        ]
    });
    let response = call(&socket, Method::ReplaceConfig, Some(duplicate));
    assert_eq!(error_code(&response), Some("conflict"));

    let bad_version = json!({ "version": 7, "triggers": [] });
    let response = call(&socket, Method::ReplaceConfig, Some(bad_version));
    assert_eq!(error_code(&response), Some("bad_request"));

    let colliding = json!({
        "version": 1,
        "flows": [
            { "id": "Flow A", "event_type": "file_changed", "bindings": [] },
            { "id": "flow-a", "event_type": "file_changed", "bindings": [] }
        ]
    });
    let response = call(&socket, Method::ImportBundle, Some(colliding));
    assert_eq!(error_code(&response), Some("conflict"));

    let written = std::fs::read_dir(flows_dir(home.path()))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
}

#[test]
fn daemon_idle_connection_returns_read_timeout_error() {
    let home = temp_home("flowd-timeout");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping timeout test: unix socket binding not permitted in this environment.");
        return;
    }
    let _guard = spawn_daemon(home.path());
    let socket = socket_path(home.path());

    let mut idle = UnixStream::connect(&socket).expect("failed to connect idle stream");
    let response = read_response(&mut idle);
    assert!(!response.ok, "idle request should return an error");
    assert_eq!(error_code(&response), Some("read_timeout"));
}

#[test]
fn restart_recovers_config_and_closed_sessions() {
    let home = temp_home("flowd-restart");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping restart test: unix socket binding not permitted in this environment.");
        return;
    }
    let socket = socket_path(home.path());

    {
        let _guard = spawn_daemon(home.path());
        let bundle = json!({
            "version": 1,
            "flows": [
                {
                    "id": "deploy finished",
                    "event_type": "task-complete",
                    "where": { "session.id": "deployer" },
                    "bindings": [ { "activity_id": "toast", "config": { "message": "shipped" } } ]
                }
            ]
        });
        let imported = data(call(&socket, Method::ImportBundle, Some(bundle)));
        assert_eq!(imported["imported"], 1);

        data(call(
            &socket,
            Method::StartSession,
            Some(json!({ "session_id": "deployer", "agent_id": "ops" })),
        ));
        data(call(
            &socket,
            Method::SignalSession,
            Some(json!({
                "session_id": "deployer",
                "signal": { "signal": "update_task", "l1": "deploy", "l2": "canary" }
            })),
        ));
        data(call(
            &socket,
            Method::SignalSession,
            Some(json!({ "session_id": "deployer", "signal": { "signal": "resume", "action": "abort" } })),
        ));
        wait_for(Duration::from_secs(5), || {
            call(
                &socket,
                Method::GetSessionResult,
                Some(json!({ "session_id": "deployer" })),
            )
            .ok
            .then_some(())
        });
    }

    let _guard = spawn_daemon(home.path());
    let config = data(call(&socket, Method::GetConfig, None));
    assert_eq!(config["triggers"][0]["id"], "deploy finished");

    let status = data(call(
        &socket,
        Method::GetSessionStatus,
        Some(json!({ "session_id": "deployer" })),
    ));
    assert_eq!(status["status"], "stopped");
    assert_eq!(status["current_l1"], "deploy");

    let result = data(call(
        &socket,
        Method::GetSessionResult,
        Some(json!({ "session_id": "deployer" })),
    ));
    assert_eq!(result["event_count"], 2);
}

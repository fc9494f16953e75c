//! Lifecycle manager with real credential provisioning

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use robot_sim::credentials::{HttpCredentialProvisioner, CREDENTIAL_ENDPOINT};
use robot_sim::lifecycle::{LaunchRequest, LifecycleManager};
use robot_sim::registry::ExecutionRegistry;
use robot_sim::{SimConfig, StepMode};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REMOTE_SCRIPT: &str = r#"{
  "name": "Mail",
  "tests": [{"name": "T", "body": [
    {"type": "keyword", "name": "Authorize", "args": ["/home/ec2-user/robot/devdata/token.json"]}
  ]}]
}"#;

#[tokio::test]
async fn script_sees_provisioned_credentials_and_scope_is_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CREDENTIAL_ENDPOINT))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "fileName": "token.json", "data": { "t": 1 } }])),
        )
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let engine = tmp.path().join("engine.sh");
    // cwd is the workspace; capture the script and the scope contents
    fs::write(
        &engine,
        "#!/bin/sh\ncp \"$1\" seen_script.json\nls devdata/process_MAIL > seen_files.txt\n",
    )
    .unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = SimConfig::default();
    config.workspace = Some(ws.clone());
    config.engine.program = engine.display().to_string();
    let provisioner = HttpCredentialProvisioner::new(
        &server.uri(),
        None,
        ws.join("devdata"),
        Duration::from_secs(5),
    )
    .unwrap();
    let manager = LifecycleManager::new(&config, ExecutionRegistry::new(), Arc::new(provisioner));

    let script_path = manager.materializer().write("MAIL", REMOTE_SCRIPT).unwrap();
    let report = manager
        .spawn(LaunchRequest {
            script_path,
            process_key: "MAIL".into(),
            step_mode: StepMode::All,
            execution_id: "e-1".into(),
            connection_keys: vec!["gmail".into()],
        })
        .await
        .unwrap();
    assert_eq!(report.return_code, 0);

    let seen: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(ws.join("seen_script.json")).unwrap()).unwrap();
    let arg = seen["tests"][0]["body"][0]["args"][0].as_str().unwrap();
    let expected = format!("{}/devdata/process_MAIL/token.json", ws.display());
    assert_eq!(arg, expected);

    assert_eq!(
        fs::read_to_string(ws.join("seen_files.txt")).unwrap().trim(),
        "token.json"
    );
    assert!(!ws.join("devdata/process_MAIL").exists());
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn unreachable_backend_still_runs() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let engine = tmp.path().join("engine.sh");
    fs::write(&engine, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = SimConfig::default();
    config.workspace = Some(ws.clone());
    config.engine.program = engine.display().to_string();
    let provisioner = HttpCredentialProvisioner::new(
        "http://127.0.0.1:9",
        None,
        ws.join("devdata"),
        Duration::from_millis(300),
    )
    .unwrap();
    let manager = LifecycleManager::new(&config, ExecutionRegistry::new(), Arc::new(provisioner));

    let script_path = manager.materializer().write("K", REMOTE_SCRIPT).unwrap();
    let report = manager
        .spawn(LaunchRequest {
            script_path: script_path.clone(),
            process_key: "K".into(),
            step_mode: StepMode::Step,
            execution_id: "e-2".into(),
            connection_keys: vec!["gmail".into()],
        })
        .await
        .unwrap();
    assert_eq!(report.return_code, 0);

    // Not retargeted: the path still points at the shared devdata directory
    let text = fs::read_to_string(script_path).unwrap();
    assert!(text.contains(&format!("{}/devdata/token.json", ws.display())));
}

const BRIDGE: &str = env!("CARGO_BIN_EXE_robot-sim");

/// Config dir for the bridge: one quick connect attempt to a dead observer
fn bridge_config_home(root: &Path) -> std::path::PathBuf {
    let home = root.join("xdg");
    fs::create_dir_all(home.join("robot-sim")).unwrap();
    fs::write(
        home.join("robot-sim/config.toml"),
        "[reporting]\nreconnect_attempts = 1\nreconnect_delay_ms = 10\n",
    )
    .unwrap();
    home
}

fn offline_manager(ws: &Path, engine: &Path) -> LifecycleManager {
    let mut config = SimConfig::default();
    config.workspace = Some(ws.to_path_buf());
    config.engine.program = engine.display().to_string();
    config.reporting.ws_url = "http://127.0.0.1:9".to_string();
    let provisioner = HttpCredentialProvisioner::new(
        "http://127.0.0.1:9",
        None,
        ws.join("devdata"),
        Duration::from_millis(200),
    )
    .unwrap();
    LifecycleManager::new(&config, ExecutionRegistry::new(), Arc::new(provisioner))
        .with_bridge(BRIDGE)
}

fn launch_request(manager: &LifecycleManager, key: &str) -> LaunchRequest {
    let script_path = manager
        .materializer()
        .write(key, r#"{"name":"S","tests":[]}"#)
        .unwrap();
    LaunchRequest {
        script_path,
        process_key: key.to_string(),
        step_mode: StepMode::All,
        execution_id: format!("e-{key}"),
        connection_keys: vec![],
    }
}

#[tokio::test]
async fn failed_step_reported_through_bridge_ends_engine() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let home = bridge_config_home(tmp.path());
    let engine = tmp.path().join("engine.sh");
    // Drives the bridge the way the listener shim does and stops when the
    // reply stream ends early
    fs::write(
        &engine,
        format!(
            r#"#!/bin/sh
test -f probe_listener.py || exit 90
{{
  echo '{{"callback":"suite_start","name":"S"}}'
  echo '{{"callback":"keyword_start","name":"Click"}}'
  echo '{{"callback":"keyword_end","name":"Click","status":"FAIL"}}'
  echo '{{"callback":"keyword_start","name":"Never"}}'
}} | XDG_CONFIG_HOME={home} "$ROBOT_SIM_BRIDGE" listen > replies.txt
status=$?
[ "$status" -ne 0 ] && exit "$status"
touch reached_end
"#,
            home = home.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

    let manager = offline_manager(&ws, &engine);
    let report = manager.spawn(launch_request(&manager, "FAIL1")).await.unwrap();

    assert_eq!(report.return_code, 1);
    assert_eq!(fs::read_to_string(ws.join("replies.txt")).unwrap(), "ok\nok\n");
    assert!(!ws.join("reached_end").exists());
    assert!(manager.registry().is_empty());
}

fn python3_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

const FAKE_ROBOT: &str = r#"
import importlib
import sys

module, cls = sys.argv[3].rsplit(".", 1)
listener = getattr(importlib.import_module(module), cls)()
listener.start_suite("", {"source": sys.argv[1]})
listener.start_test("T", {"tags": ["smoke"]})
listener.start_keyword("BuiltIn.Log", {"kwname": "Log", "libname": "BuiltIn", "args": ["hi"]})
listener.log_message({"level": "INFO", "message": "hi"})
listener.end_keyword("BuiltIn.Log", {"kwname": "Log", "status": "PASS", "args": ["hi"]})
if sys.argv[4] == "fail":
    listener.start_keyword("Click", {"kwname": "Click", "args": []})
    listener.end_keyword("Click", {"kwname": "Click", "status": "FAIL", "args": []})
    open("after_fail.txt", "w").write("reached")
listener.end_test("T", {"status": "PASS", "message": ""})
listener.end_suite("", {"source": sys.argv[1], "status": "PASS"})
listener.close()
sys.exit(0)
"#;

fn python_engine(root: &Path, outcome: &str) -> std::path::PathBuf {
    let home = bridge_config_home(root);
    let robot = root.join("fake_robot.py");
    fs::write(&robot, FAKE_ROBOT).unwrap();
    let engine = root.join("engine.sh");
    fs::write(
        &engine,
        format!(
            "#!/bin/sh\nXDG_CONFIG_HOME={} exec python3 {} \"$@\" {}\n",
            home.display(),
            robot.display(),
            outcome
        ),
    )
    .unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
    engine
}

#[tokio::test]
async fn listener_shim_runs_protocol_and_aborts_engine_on_failure() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let engine = python_engine(tmp.path(), "fail");

    let manager = offline_manager(&ws, &engine);
    let report = manager.spawn(launch_request(&manager, "PY1")).await.unwrap();

    assert_eq!(report.return_code, 1);
    assert!(ws.join("probe_listener.py").is_file());
    assert!(!ws.join("after_fail.txt").exists());
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn listener_shim_passing_run_exits_cleanly() {
    if !python3_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    let engine = python_engine(tmp.path(), "pass");

    let manager = offline_manager(&ws, &engine);
    let report = manager.spawn(launch_request(&manager, "PY2")).await.unwrap();
    assert_eq!(report.return_code, 0);
}

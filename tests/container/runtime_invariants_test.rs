//! Docker runtime invariant tests.
//!
//! The Docker daemon is not assumed to exist in CI, so the deadline,
//! cancellation, and teardown guarantees are asserted against the adapter
//! source directly.

use std::fs;
use std::path::PathBuf;

use laforge::container::{EXIT_CODE_CANCELLED, EXIT_CODE_DEADLINE, EXIT_CODE_HOST_FAILURE};

fn docker_source() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/container/docker.rs");
    fs::read_to_string(&path).expect("docker source should load")
}

#[test]
fn synthetic_exit_codes_are_distinct() {
    assert_ne!(EXIT_CODE_DEADLINE, EXIT_CODE_CANCELLED);
    assert_ne!(EXIT_CODE_DEADLINE, EXIT_CODE_HOST_FAILURE);
    assert_ne!(EXIT_CODE_CANCELLED, EXIT_CODE_HOST_FAILURE);
    // Host-side failure must never collide with a plausible agent exit.
    assert!(EXIT_CODE_HOST_FAILURE < 0);
}

#[test]
fn deadline_expiry_force_stops_the_container() {
    let source = docker_source();
    assert!(source.contains("tokio::time::sleep(spec.deadline)"));
    assert!(source.contains("EXIT_CODE_DEADLINE"));
}

#[test]
fn cancellation_force_stops_the_container() {
    let source = docker_source();
    assert!(source.contains("cancel.cancelled()"));
    assert!(source.contains("EXIT_CODE_CANCELLED"));
}

#[test]
fn containers_are_force_removed_on_every_path() {
    let source = docker_source();
    assert!(source.contains("force: true"));
    assert!(source.contains("self.remove(&spec.name).await"));
}

#[test]
fn image_failures_are_distinguishable_from_agent_exits() {
    let source = docker_source();
    assert!(source.contains("ContainerError::Image"));
}

#[test]
fn output_capture_is_capped() {
    let source = docker_source();
    assert!(source.contains("max_output_bytes"));
    assert!(source.contains("[output truncated]"));
}

#[test]
fn containers_run_without_privilege_escalation() {
    let source = docker_source();
    assert!(source.contains("no-new-privileges:true"));
}

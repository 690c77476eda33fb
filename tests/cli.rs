use std::process::Command;

fn ibecho() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ibecho"))
}

#[test]
fn two_server_names_are_a_usage_error() {
    let output = ibecho()
        .args(["node1", "node2"])
        .env("RUST_LOG", "debug")
        .output()
        .expect("failed to run ibecho");

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    // Rejected before logging starts, so before any resource is touched.
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("opened device"), "{}", stderr);
    assert!(!stderr.contains("running as"), "{}", stderr);
}

#[test]
fn missing_config_file_is_reported() {
    let output = ibecho()
        .args(["--config", "/nonexistent/ibecho.toml"])
        .output()
        .expect("failed to run ibecho");

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot read config file"), "{}", stderr);
}

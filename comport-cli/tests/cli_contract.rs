//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

const MISSING_PORT: &str = "/dev/comport-test-missing-port";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("comport");
    cmd.env_remove("COMPORT_PORT")
        .env_remove("COMPORT_BAUD")
        .env_remove("COMPORT_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("comport"))
        .stdout(predicate::str::contains("Usage"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_includes_usage_examples() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Examples:"))
        .stdout(predicate::str::contains("terminal --timestamp"));
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("comport"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_options() {
    cli_cmd()
        .args(["send", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--hex"))
        .stdout(predicate::str::contains("--wait-ms"));
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("comport"))
        .stdout(predicate::str::contains("list-ports"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--install"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_send_data() {
    cli_cmd()
        .arg("send")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_bad_framing_values() {
    for args in [
        ["--parity", "sometimes"],
        ["--stop-bits", "3"],
        ["--data-bits", "9"],
        ["--flow", "psychic"],
    ] {
        cli_cmd()
            .args(["-p", MISSING_PORT, "status"])
            .args(args)
            .assert()
            .code(2);
    }
}

#[test]
fn exit_code_two_for_invalid_hex_payload() {
    cli_cmd()
        .args(["-p", MISSING_PORT, "send", "--hex", "4G"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid data"));
}

#[test]
fn exit_code_two_for_terminal_without_tty() {
    cli_cmd()
        .args(["-p", MISSING_PORT, "terminal"])
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("interactive"));
}

#[test]
fn exit_code_one_for_missing_device() {
    cli_cmd()
        .args(["-p", MISSING_PORT, "status"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"))
        .stderr(predicate::str::contains(MISSING_PORT));
}

#[test]
fn port_from_environment_variable_is_used() {
    cli_cmd()
        .env("COMPORT_PORT", MISSING_PORT)
        .args(["send", "hello"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(MISSING_PORT));
}

#[test]
fn port_from_config_file_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("custom.toml");
    fs::write(&config, format!("[port]\nname = \"{MISSING_PORT}\"\n")).expect("write config");

    cli_cmd()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains(MISSING_PORT));
}

#[test]
fn local_config_file_is_picked_up() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("comport.toml"),
        format!("[port]\nname = \"{MISSING_PORT}\"\nbaud = 9600\n"),
    )
    .expect("write comport.toml");

    cli_cmd()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains(MISSING_PORT));
}

#[test]
fn invalid_config_file_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("comport.toml"),
        "invalid toml [[[",
    )
    .expect("write invalid config");

    // The missing device, not the config, decides the outcome
    cli_cmd()
        .current_dir(dir.path())
        .args(["-p", MISSING_PORT, "status"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("TOML"));
}

#[test]
fn bad_data_bits_in_config_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("custom.toml");
    fs::write(&config, "[port]\ndata_bits = 12\n").expect("write config");

    cli_cmd()
        .arg("--config")
        .arg(&config)
        .args(["-p", MISSING_PORT, "status"])
        .assert()
        .code(2);
}

// ============================================================================
// Non-interactive mode
// ============================================================================

#[test]
fn non_interactive_flag_is_recognized() {
    cli_cmd()
        .arg("--non-interactive")
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn non_interactive_environment_variable_works() {
    cli_cmd()
        .env("COMPORT_NON_INTERACTIVE", "true")
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn non_interactive_without_port_never_prompts() {
    let dir = tempdir().expect("tempdir should be created");
    let empty = dir
        .path()
        .join("empty.toml");
    fs::write(&empty, "").expect("write config");

    // Depending on the host this finds zero, one or many ports; it must
    // finish without waiting for input either way.
    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("--non-interactive")
        .arg("--config")
        .arg(&empty)
        .arg("status")
        .write_stdin("")
        .timeout(std::time::Duration::from_secs(20))
        .output()
        .expect("command should execute");

    let code = output
        .status
        .code();
    assert!(matches!(code, Some(0..=2)), "unexpected exit: {code:?}");
    if code == Some(2) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("--port"), "{stderr}");
    }
}

// ============================================================================
// Output channels
// ============================================================================

#[test]
fn list_ports_json_is_clean() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    if output
        .status
        .success()
    {
        let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).expect("list-ports --json should print JSON");
        assert!(parsed.is_array(), "list-ports --json should return an array");
        assert!(
            output
                .stderr
                .is_empty(),
            "JSON output should not have stderr"
        );
    }
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(
        !stdout.contains("\x1b["),
        "Colors should be disabled in non-TTY mode"
    );
}

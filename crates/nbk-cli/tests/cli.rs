use std::io::Write;
use std::process::{Command, Stdio};

use predicates::prelude::*;

fn nbk() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("nbk"))
}

#[test]
fn help_lists_subcommands_and_flags() {
    let output = nbk().arg("--help").output().expect("run help");
    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in ["serve", "envelope", "--host-uri", "--kernel-name"] {
        assert!(text.contains(needle), "help output should contain '{needle}'");
    }
}

#[test]
fn envelope_normalizes_and_assigns_a_token() {
    let output = nbk()
        .args(["envelope", r#"{"commandType":"SubmitCode","command":{"code":"1"}}"#])
        .output()
        .expect("run envelope");
    assert!(output.status.success());
    let line = String::from_utf8_lossy(&output.stdout);
    let model: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(model["commandType"], "SubmitCode");
    assert_eq!(model["command"]["code"], "1");
    assert!(model["token"].as_str().is_some_and(|token| !token.is_empty()));
}

#[test]
fn envelope_rejects_garbage() {
    let output = nbk()
        .args(["envelope", "{\"neither\":true}"])
        .output()
        .expect("run envelope");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(predicate::str::contains("invalid envelope").eval(&stderr));
}

#[test]
fn serve_answers_commands_from_stdin() {
    let mut child = nbk()
        .args(["--host-uri", "kernel://test", "serve"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn serve");

    {
        let stdin = child.stdin.as_mut().expect("stdin");
        writeln!(
            stdin,
            r#"{{"commandType":"SendValue","token":"t1","command":{{"targetKernelName":"value","name":"x","formattedValue":{{"mimeType":"text/plain","value":"42"}}}}}}"#
        )
        .unwrap();
        writeln!(
            stdin,
            r#"{{"commandType":"RequestValue","token":"t2","command":{{"targetKernelName":"value","name":"x"}}}}"#
        )
        .unwrap();
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("wait for serve");
    assert!(output.status.success());
    let events: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(events[0]["eventType"], "KernelReady");
    assert_eq!(events[0]["routingSlip"][0], "kernel://test/");

    let produced = events
        .iter()
        .find(|event| event["eventType"] == "ValueProduced")
        .expect("ValueProduced");
    assert_eq!(produced["event"]["formattedValue"]["value"], "42");
    assert_eq!(produced["command"]["token"], "t2");

    let succeeded: Vec<_> = events
        .iter()
        .filter(|event| event["eventType"] == "CommandSucceeded")
        .map(|event| event["command"]["token"].clone())
        .collect();
    assert_eq!(succeeded, vec!["t1", "t2"]);
}

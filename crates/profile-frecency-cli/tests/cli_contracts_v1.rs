#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn pfr_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_pfr") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/pfr");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "profile-frecency-cli", "--bin", "pfr"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build pfr binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pfr-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn pfr_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(pfr_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run pfr command {:?}: {err}", args),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(ToString::to_string)
        .collect()
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn cleanup(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = db_path.as_os_str().to_owned();
        target.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(target));
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(pfr_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["rank", "select", "record", "show", "forget"] {
        assert!(
            stdout.contains(required),
            "missing subcommand {required} in help output:\n{stdout}"
        );
    }
}

#[test]
fn first_run_ranks_alphabetically() {
    let db = temp_db_path("first-run");
    let output = pfr_output(
        &db,
        &[
            "rank",
            "--candidate",
            "charlie",
            "--candidate",
            "alpha",
            "--candidate",
            "bravo",
        ],
    );

    assert_success(&output);
    assert_eq!(stdout_lines(&output), vec!["alpha", "bravo", "charlie"]);
    cleanup(&db);
}

#[test]
fn selection_moves_choice_to_front_and_prunes_stale_entries() {
    let db = temp_db_path("select");

    assert_success(&pfr_output(&db, &["record", "delta"]));
    assert_success(&pfr_output(
        &db,
        &[
            "select",
            "--candidate",
            "alpha",
            "--candidate",
            "bravo",
            "--candidate",
            "delta",
            "--choice",
            "bravo",
        ],
    ));

    let ranked = pfr_output(
        &db,
        &[
            "rank",
            "--candidate",
            "alpha",
            "--candidate",
            "bravo",
            "--candidate",
            "charlie",
            "--json",
        ],
    );
    assert_success(&ranked);
    let payload = stdout_json(&ranked);
    assert_eq!(payload["contract_version"], serde_json::json!("rank.v1"));
    assert_eq!(
        payload["ranked"],
        serde_json::json!(["bravo", "alpha", "charlie"])
    );
    assert_eq!(payload["stale"], serde_json::json!(["delta"]));

    assert_success(&pfr_output(
        &db,
        &["select", "--candidate", "alpha", "--candidate", "bravo", "--choice", "alpha"],
    ));

    let shown = pfr_output(&db, &["show", "--json"]);
    assert_success(&shown);
    let records = stdout_json(&shown);
    let identifiers: Vec<&str> = match records["records"].as_array() {
        Some(values) => values
            .iter()
            .filter_map(|record| record["identifier"].as_str())
            .collect(),
        None => panic!("records payload must contain an array"),
    };
    assert!(identifiers.contains(&"alpha"));
    assert!(identifiers.contains(&"bravo"));
    assert!(!identifiers.contains(&"delta"));

    cleanup(&db);
}

#[test]
fn store_keys_rank_independently() {
    let db = temp_db_path("store-keys");

    assert_success(&pfr_output(&db, &["--store-key", "regions", "record", "zeta"]));

    let profiles = pfr_output(&db, &["rank", "--candidate", "alpha", "--candidate", "zeta"]);
    assert_success(&profiles);
    assert_eq!(stdout_lines(&profiles), vec!["alpha", "zeta"]);

    let regions = pfr_output(
        &db,
        &[
            "--store-key",
            "regions",
            "rank",
            "--candidate",
            "alpha",
            "--candidate",
            "zeta",
        ],
    );
    assert_success(&regions);
    assert_eq!(stdout_lines(&regions), vec!["zeta", "alpha"]);

    cleanup(&db);
}

#[test]
fn corrupt_database_still_ranks_and_exits_zero() {
    let db = temp_db_path("corrupt");
    if let Err(err) = std::fs::write(&db, vec![0x5A_u8; 8192]) {
        panic!("failed to write corrupt fixture: {err}");
    }

    let output = pfr_output(&db, &["rank", "--candidate", "y", "--candidate", "x"]);
    assert_success(&output);
    assert_eq!(stdout_lines(&output), vec!["x", "y"]);

    let selected = pfr_output(
        &db,
        &["select", "--candidate", "y", "--candidate", "x", "--choice", "y"],
    );
    assert_success(&selected);

    let shown = pfr_output(&db, &["show"]);
    assert!(!shown.status.success());

    cleanup(&db);
}

#[test]
fn invalid_ruleset_falls_back_for_rank_and_is_reported_by_show() {
    let db = temp_db_path("ruleset");
    let ruleset = std::env::temp_dir().join(format!("pfr-ruleset-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&ruleset, r#"{"ruleset_version": 1}"#) {
        panic!("failed to write ruleset fixture: {err}");
    }

    let ruleset_arg = ruleset.to_string_lossy().to_string();
    let ranked = pfr_output(
        &db,
        &[
            "--ruleset",
            &ruleset_arg,
            "rank",
            "--candidate",
            "b",
            "--candidate",
            "a",
        ],
    );
    assert_success(&ranked);
    assert_eq!(stdout_lines(&ranked), vec!["a", "b"]);

    let shown = pfr_output(&db, &["--ruleset", &ruleset_arg, "show"]);
    assert!(!shown.status.success());
    let stderr = String::from_utf8_lossy(&shown.stderr);
    assert!(stderr.contains("ruleset"), "stderr={stderr}");

    let _ = std::fs::remove_file(&ruleset);
    cleanup(&db);
}

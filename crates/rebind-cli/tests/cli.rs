//! Runs the `rebind` binary against snapshot files

use pretty_assertions::assert_eq;
use rebind_store::{FormatUpgrade, SnapshotStore, CURRENT_FORMAT, LEGACY_FORMAT};
use rebind_test_utils::{payload, store_with, RecordBuilder};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const FACTORY: &[u8] = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.";
const NEW_FACTORY: &[u8] = b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01.";

const RULES: &str = r#"
[types]
defined = ["module1 NewFactory"]

[types.aliases]
"module1 Factory" = "module1 NewFactory"
"#;

fn snapshot(dir: &Path, records: Vec<(u64, Vec<u8>)>) -> PathBuf {
    let path = dir.join("store.json");
    SnapshotStore::create(&path, store_with(records)).unwrap();
    path
}

fn rebind(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rebind"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn renames_and_reports_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot(dir.path(), vec![(1, FACTORY.to_vec())]);
    let rules = dir.path().join("rules.toml");
    std::fs::write(&rules, RULES).unwrap();

    let output = rebind(&["-f", arg(&store), "-r", arg(&rules), "--json", "-q"]);
    assert!(output.status.success(), "{output:?}");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["rewritten"], 1);
    assert_eq!(report["committed"], 1);
    assert_eq!(
        report["implicit_rules"]["module1 Factory"],
        "module1 NewFactory"
    );

    let reopened = SnapshotStore::open(&store).unwrap();
    assert_eq!(payload(&reopened, 1), NEW_FACTORY.to_vec());
}

#[test]
fn dry_run_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot(dir.path(), vec![(1, FACTORY.to_vec())]);
    let rules = dir.path().join("rules.toml");
    std::fs::write(&rules, RULES).unwrap();
    let before = std::fs::read(&store).unwrap();

    let output = rebind(&["-f", arg(&store), "-r", arg(&rules), "-n"]);
    assert!(output.status.success(), "{output:?}");

    assert_eq!(std::fs::read(&store).unwrap(), before);
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("(dry run)"), "{stdout}");
    assert!(stdout.contains("module1 Factory -> module1 NewFactory"), "{stdout}");
}

#[test]
fn saves_implicit_renames() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot(dir.path(), vec![(1, FACTORY.to_vec())]);
    let rules = dir.path().join("rules.toml");
    std::fs::write(&rules, RULES).unwrap();
    let saved = dir.path().join("renames.toml");

    let output = rebind(&[
        "-f",
        arg(&store),
        "-r",
        arg(&rules),
        "-n",
        "-s",
        arg(&saved),
    ]);
    assert!(output.status.success(), "{output:?}");

    let text = std::fs::read_to_string(&saved).unwrap();
    let reloaded = rebind_core::RulesConfig::from_toml_str(&text).unwrap();
    assert_eq!(reloaded.renames.len(), 1);
    assert_eq!(
        reloaded.renames.values().next().unwrap().to_string(),
        "module1 NewFactory"
    );
}

#[test]
fn upgrade_rewrites_marker_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let record = RecordBuilder::legacy("module1", "Factory").build();
    let store = snapshot(dir.path(), vec![(1, record)]);
    assert_eq!(SnapshotStore::open(&store).unwrap().format_marker(), LEGACY_FORMAT);

    let output = rebind(&["-f", arg(&store), "--upgrade", "--json"]);
    assert!(output.status.success(), "{output:?}");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["format_upgraded"], true);
    let reopened = SnapshotStore::open(&store).unwrap();
    assert_eq!(reopened.format_marker(), CURRENT_FORMAT);
    assert_eq!(payload(&reopened, 1), FACTORY.to_vec());
}

#[test]
fn missing_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = rebind(&["-f", arg(&dir.path().join("absent.json"))]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn malformed_record_fails_and_keeps_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot(
        dir.path(),
        vec![(1, FACTORY.to_vec()), (2, b"\x80\x03K".to_vec())],
    );
    let before = std::fs::read(&store).unwrap();

    let output = rebind(&["-f", arg(&store), "--repickle-all"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Stopped processing, due to:"), "{stderr}");
    assert_eq!(std::fs::read(&store).unwrap(), before);
}

#[test]
fn bad_rules_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = snapshot(dir.path(), vec![(1, FACTORY.to_vec())]);
    let rules = dir.path().join("rules.toml");
    std::fs::write(&rules, "[renames]\n\"module1\" = 3\n").unwrap();

    let output = rebind(&["-f", arg(&store), "-r", arg(&rules)]);
    assert_eq!(output.status.code(), Some(1));
}

use assert_cmd::Command;
use std::fs;
use std::path::Path;

fn write_incomplete_run(root: &Path, name: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("run.log"), "UD: 1000 Gen: 2.0 Fit: 1.0 Orgs: 30\n").unwrap();
}

#[test]
fn writes_manifest_and_prints_summary() {
    let tmp = tempfile::tempdir().unwrap();
    write_incomplete_run(tmp.path(), "cond_3");

    let output = Command::cargo_bin("resub")
        .unwrap()
        .current_dir(tmp.path())
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("runs_scanned: 1"));
    assert!(stdout.contains("resubmit_seeds: 1"));
    let manifest = fs::read_to_string(tmp.path().join("run_list_resubmit")).unwrap();
    assert!(manifest.contains("3 cond"));
    assert!(tmp.path().join("extinct").exists());
}

#[test]
fn json_mode_emits_a_single_payload() {
    let tmp = tempfile::tempdir().unwrap();
    write_incomplete_run(tmp.path(), "cond_3");

    let output = Command::cargo_bin("resub")
        .unwrap()
        .current_dir(tmp.path())
        .arg("--json")
        .output()
        .unwrap();

    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["report"]["runs_scanned"], 1);
    assert_eq!(payload["report"]["resubmit_seed_count"], 1);
}

#[test]
fn checkpoint_flags_are_mutually_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("resub")
        .unwrap()
        .current_dir(tmp.path())
        .args(["-c", "-n"])
        .assert()
        .failure();
}

use resub_core::{
    parse_run_list, reconcile, resolve_scan_root, ReconcileOptions, SkipReason,
    MISSING_COMMAND_PLACEHOLDER,
};
use std::fs;
use std::path::{Path, PathBuf};

const COMPLETE: &str = "UD: 100000 Gen: 50.0 Fit: 1.0 Orgs: 500";
const INCOMPLETE: &str = "UD: 52000 Gen: 20.0 Fit: 1.0 Orgs: 480";
const EXTINCT: &str = "UD: 9000 Gen: 4.0 Fit: 0.0 Orgs: 0";

fn write_run(root: &Path, name: &str, last_line: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("run.log"), format!("booting world\n{}\n", last_line)).unwrap();
    dir
}

fn options_in(dir: &Path) -> ReconcileOptions {
    ReconcileOptions {
        manifest_path: dir.join("run_list_resubmit"),
        extinct_path: dir.join("extinct"),
        ..ReconcileOptions::default()
    }
}

#[test]
fn infers_missing_seeds_from_run_list() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    for seed in 1..=7 {
        write_run(root, &format!("baseline_{}", seed), COMPLETE);
    }
    write_run(root, "baseline_8", INCOMPLETE);
    let rl_path = root.join("run_list");
    fs::write(
        &rl_path,
        "set description exp\n\n1..10 baseline ./sim -c run.cfg -s $seed\n",
    )
    .unwrap();
    let mut options = options_in(root);
    options.infer_missing = true;
    options.run_list_path = Some(rl_path);

    let report = reconcile(root, &options).unwrap();

    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.starts_with("set description exp\n\n"));
    assert!(manifest.contains("8..10 baseline ./sim -c run.cfg -s $seed\n"));
    assert_eq!(report.inferred["baseline"], vec![9, 10]);
    assert_eq!(report.resubmit_seed_count, 3);
}

#[test]
fn extinct_runs_are_recorded_and_never_resubmitted() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_run(root, "cond_1", EXTINCT);
    write_run(root, "cond_2", INCOMPLETE);
    let options = options_in(root);

    let report = reconcile(root, &options).unwrap();

    assert_eq!(report.extinct, vec!["cond_1".to_string()]);
    assert_eq!(fs::read_to_string(&options.extinct_path).unwrap(), "cond_1\n");
    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains(&format!("2 cond {}\n", MISSING_COMMAND_PLACEHOLDER)));
    assert!(!manifest.contains(&format!("1 cond {}", MISSING_COMMAND_PLACEHOLDER)));
}

#[test]
fn malformed_log_is_resubmitted_not_extinct() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_run(root, "trunc_4", "segfault");
    let options = options_in(root);

    let report = reconcile(root, &options).unwrap();

    assert!(report.extinct.is_empty());
    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains("4 trunc"));
}

#[test]
fn checkpoint_restart_filters_and_promotes() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let with_ckpt = write_run(root, "a_1", INCOMPLETE);
    fs::write(with_ckpt.join("checkpoint_safe.blcr"), "ckpt").unwrap();
    write_run(root, "a_2", INCOMPLETE);
    let mut options = options_in(root);
    options.checkpoint_restart = true;

    let report = reconcile(root, &options).unwrap();

    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains(&format!("1 a {}\n", MISSING_COMMAND_PLACEHOLDER)));
    assert!(!manifest.contains(&format!("2 a {}", MISSING_COMMAND_PLACEHOLDER)));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].run, "a_2");
    assert_eq!(report.skipped[0].reason, SkipReason::MissingCheckpoint);
    assert_eq!(
        fs::read_to_string(with_ckpt.join("checkpoint.blcr")).unwrap(),
        "ckpt"
    );
}

#[test]
fn checkpoint_copy_failure_excludes_only_that_run() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let broken = write_run(root, "a_1", INCOMPLETE);
    // a directory in the safe-checkpoint slot makes the promotion copy fail
    fs::create_dir(broken.join("checkpoint_safe.blcr")).unwrap();
    let with_ckpt = write_run(root, "a_2", INCOMPLETE);
    fs::write(with_ckpt.join("checkpoint_safe.blcr"), "ckpt").unwrap();
    let mut options = options_in(root);
    options.checkpoint_restart = true;

    let report = reconcile(root, &options).unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].run, "a_1");
    assert_eq!(report.skipped[0].reason, SkipReason::CheckpointCopyFailed);
    assert_eq!(report.resubmit_seed_count, 1);
    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains(&format!("2 a {}\n", MISSING_COMMAND_PLACEHOLDER)));
    assert!(!manifest.contains(&format!("1 a {}", MISSING_COMMAND_PLACEHOLDER)));
}

#[test]
fn no_checkpoint_mode_is_the_inverse_filter() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let with_ckpt = write_run(root, "a_1", INCOMPLETE);
    fs::write(with_ckpt.join("checkpoint_safe.blcr"), "ckpt").unwrap();
    write_run(root, "a_2", INCOMPLETE);
    let mut options = options_in(root);
    options.no_checkpoint = true;

    let report = reconcile(root, &options).unwrap();

    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains(&format!("2 a {}\n", MISSING_COMMAND_PLACEHOLDER)));
    assert!(!manifest.contains(&format!("1 a {}", MISSING_COMMAND_PLACEHOLDER)));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].run, "a_1");
    assert_eq!(report.skipped[0].reason, SkipReason::HasCheckpoint);
    // the promoted checkpoint slot is untouched in this mode
    assert!(!with_ckpt.join("checkpoint.blcr").exists());
}

#[test]
fn run_list_conditions_without_directories_pass_through() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_run(root, "baseline_1", INCOMPLETE);
    let rl_path = root.join("run_list");
    fs::write(
        &rl_path,
        "set description exp\n\n1 baseline ./sim -s $seed\n1..5 ghost ./sim -x 9 -s $seed\n",
    )
    .unwrap();
    let mut options = options_in(root);
    options.compare_run_list = true;
    options.run_list_path = Some(rl_path);

    let report = reconcile(root, &options).unwrap();

    assert_eq!(report.missing_conditions, vec!["ghost".to_string()]);
    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains("1..5 ghost ./sim -x 9 -s $seed\n"));
}

#[test]
fn command_record_supplies_the_launch_command() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let dir = write_run(root, "c_5", INCOMPLETE);
    fs::write(
        dir.join("command.sh"),
        "#!/bin/bash\n./sim -c c.cfg -s 5 1> run.log 2> run.err &\n",
    )
    .unwrap();
    let options = options_in(root);

    reconcile(root, &options).unwrap();

    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.contains("5 c ./sim -c c.cfg -s $seed\n"));
}

#[test]
fn unreadable_run_list_falls_back_to_default_header() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_run(root, "b_1", INCOMPLETE);
    let mut options = options_in(root);
    options.run_list_path = Some(root.join("does_not_exist"));

    let report = reconcile(root, &options).unwrap();

    assert_eq!(report.runs_scanned, 1);
    let manifest = fs::read_to_string(&options.manifest_path).unwrap();
    assert!(manifest.starts_with("set description simulation_experiment\n"));
}

#[test]
fn backup_directories_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_run(root, "cond_1", INCOMPLETE);
    write_run(root, "cond_1_bak_2", INCOMPLETE);
    let options = options_in(root);

    let report = reconcile(root, &options).unwrap();

    assert_eq!(report.runs_scanned, 1);
}

#[test]
fn dest_dir_from_run_list_controls_the_scan_root() {
    let rl = parse_run_list("set dest_dir /data/runs\n\n");
    assert_eq!(
        resolve_scan_root(Path::new("."), Some(&rl)),
        PathBuf::from("/data/runs")
    );
    // an explicit root always wins
    assert_eq!(
        resolve_scan_root(Path::new("elsewhere"), Some(&rl)),
        PathBuf::from("elsewhere")
    );
}

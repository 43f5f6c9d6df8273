use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const RUN_LOG_FILE: &str = "run.log";
pub const COMMAND_RECORD_FILE: &str = "command.sh";
pub const CHECKPOINT_SAFE_FILE: &str = "checkpoint_safe.blcr";
pub const CHECKPOINT_ACTIVE_FILE: &str = "checkpoint.blcr";
pub const SEED_PLACEHOLDER: &str = "$seed";
pub const MISSING_COMMAND_PLACEHOLDER: &str =
    "COMMAND NOT FOUND - PLEASE FIX BEFORE RESUBMITTING";

const TELEMETRY_MARKER: &str = "UD:";
// Trailing tokens of a recorded command are the shell redirection into run.log.
const REDIRECT_TOKENS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionTarget {
    Updates(u64),
    Generations(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    Counted(u64),
    Unreadable,
}

impl Population {
    pub fn is_zero(self) -> bool {
        matches!(self, Population::Counted(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Parsed {
        updates: u64,
        generations: f64,
        population: Population,
    },
    Malformed,
}

pub fn parse_final_line(line: &str) -> Telemetry {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 6 || tokens[0] != TELEMETRY_MARKER {
        return Telemetry::Malformed;
    }
    let updates = match tokens[1].parse::<u64>() {
        Ok(v) => v,
        Err(_) => return Telemetry::Malformed,
    };
    let generations = match tokens[3].parse::<f64>() {
        Ok(v) => v,
        Err(_) => return Telemetry::Malformed,
    };
    let population = match tokens[tokens.len() - 1].parse::<u64>() {
        Ok(v) => Population::Counted(v),
        Err(_) => Population::Unreadable,
    };
    Telemetry::Parsed {
        updates,
        generations,
        population,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Incomplete,
    Extinct,
}

// A malformed line is never extinct: an unreadable log must stay a
// resubmission candidate.
pub fn classify(telemetry: Telemetry, target: CompletionTarget) -> RunStatus {
    let (updates, generations, population) = match telemetry {
        Telemetry::Malformed => return RunStatus::Incomplete,
        Telemetry::Parsed {
            updates,
            generations,
            population,
        } => (updates, generations, population),
    };
    let complete = match target {
        CompletionTarget::Updates(t) => updates == t,
        CompletionTarget::Generations(t) => generations >= t,
    };
    if complete {
        RunStatus::Complete
    } else if population.is_zero() {
        RunStatus::Extinct
    } else {
        RunStatus::Incomplete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedSpan {
    pub start: i64,
    pub end: i64,
}

impl SeedSpan {
    pub fn parse(token: &str) -> Option<SeedSpan> {
        if let Some((a, b)) = token.split_once("..") {
            let start = a.parse().ok()?;
            let end = b.parse().ok()?;
            if end < start {
                return None;
            }
            Some(SeedSpan { start, end })
        } else {
            let seed = token.parse().ok()?;
            Some(SeedSpan {
                start: seed,
                end: seed,
            })
        }
    }

    pub fn seeds(self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }

    pub fn count(self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }
}

impl fmt::Display for SeedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

pub fn compress_seeds(seeds: &BTreeSet<i64>) -> Vec<SeedSpan> {
    let mut spans = Vec::new();
    let mut iter = seeds.iter().copied();
    let Some(first) = iter.next() else {
        return spans;
    };
    let mut start = first;
    let mut prev = first;
    for seed in iter {
        if seed == prev + 1 {
            prev = seed;
            continue;
        }
        spans.push(SeedSpan { start, end: prev });
        start = seed;
        prev = seed;
    }
    spans.push(SeedSpan { start, end: prev });
    spans
}

#[derive(Debug, Clone)]
pub struct RunListEntry {
    // None for a line whose first field is not a seed span; the raw line
    // still rides along so compare mode can forward it verbatim.
    pub seeds: Option<SeedSpan>,
    pub name: String,
    pub command: String,
    pub raw: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunList {
    pub header: String,
    pub dest_dir: Option<String>,
    pub entries: Vec<RunListEntry>,
}

impl RunList {
    pub fn entry(&self, name: &str) -> Option<&RunListEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

pub fn load_run_list(path: &Path) -> Result<RunList> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading run list {}", path.display()))?;
    Ok(parse_run_list(&text))
}

pub fn parse_run_list(text: &str) -> RunList {
    let mut header = String::new();
    let mut in_header = true;
    let mut dest_dir = None;
    let mut entries = Vec::new();
    for line in text.lines() {
        if in_header {
            if line.trim().is_empty() {
                in_header = false;
            } else {
                header.push_str(line);
                header.push('\n');
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let (Some(first), Some(second)) = (fields.next(), fields.next()) else {
            continue;
        };
        if first == "set" {
            if second == "dest_dir" {
                if let Some(value) = fields.next() {
                    dest_dir = Some(value.to_string());
                }
            }
            continue;
        }
        let seeds = SeedSpan::parse(first);
        if seeds.is_none() {
            warn!(line = trimmed, "run list line has no parsable seed field, keeping raw only");
        }
        let command = fields.collect::<Vec<_>>().join(" ");
        entries.push(RunListEntry {
            seeds,
            name: second.to_string(),
            command,
            raw: line.to_string(),
        });
    }
    RunList {
        header,
        dest_dir,
        entries,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Condition {
    pub name: String,
    pub found_seeds: BTreeSet<i64>,
    pub seeds: BTreeSet<i64>,
    pub command: Option<String>,
}

pub fn split_run_name(dir_name: &str) -> Option<(String, i64)> {
    let (prefix, seed_token) = dir_name.rsplit_once('_')?;
    let seed = seed_token.parse::<i64>().ok()?;
    let name = prefix
        .trim_matches(|c| c == '.' || c == '/' || c == ' ')
        .to_string();
    if name.is_empty() {
        return None;
    }
    Some((name, seed))
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub target: CompletionTarget,
    pub expected_reps: usize,
    pub checkpoint_restart: bool,
    pub no_checkpoint: bool,
    pub infer_missing: bool,
    pub compare_run_list: bool,
    pub run_list_path: Option<PathBuf>,
    pub manifest_path: PathBuf,
    pub extinct_path: PathBuf,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            target: CompletionTarget::Updates(100_000),
            expected_reps: 10,
            checkpoint_restart: false,
            no_checkpoint: false,
            infer_missing: false,
            compare_run_list: false,
            run_list_path: None,
            manifest_path: PathBuf::from("run_list_resubmit"),
            extinct_path: PathBuf::from("extinct"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRun {
    pub run: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCheckpoint,
    HasCheckpoint,
    CheckpointCopyFailed,
}

#[derive(Debug, Clone)]
pub struct DiscoveredRun {
    pub dir: PathBuf,
    pub name: String,
}

pub fn discover_runs(root: &Path) -> Vec<DiscoveredRun> {
    let mut runs = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.contains("_bak") {
            continue;
        }
        if !entry.path().join(RUN_LOG_FILE).exists() {
            continue;
        }
        runs.push(DiscoveredRun {
            dir: entry.path().to_path_buf(),
            name: name.to_string(),
        });
    }
    runs
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub conditions: BTreeMap<String, Condition>,
    pub extinct: Vec<String>,
    pub skipped: Vec<SkippedRun>,
    pub runs_scanned: usize,
}

pub fn scan_runs(root: &Path, options: &ReconcileOptions) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    let runs = discover_runs(root);
    if runs.is_empty() {
        warn!(
            root = %root.display(),
            "no run directories found; is this dest_dir or its parent?"
        );
    }
    for run in runs {
        let Some((name, seed)) = split_run_name(&run.name) else {
            warn!(run = %run.name, "run directory has no trailing seed token, skipping");
            continue;
        };
        let log_path = run.dir.join(RUN_LOG_FILE);
        let log = fs::read_to_string(&log_path)
            .with_context(|| format!("reading {}", log_path.display()))?;
        let last_line = log.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        let telemetry = parse_final_line(last_line);
        if telemetry == Telemetry::Malformed {
            warn!(
                run = %run.name,
                line = last_line,
                "unparsable final log line, treating run as incomplete"
            );
        }
        outcome.runs_scanned += 1;
        let condition = outcome
            .conditions
            .entry(name.clone())
            .or_insert_with(|| Condition {
                name: name.clone(),
                ..Condition::default()
            });
        condition.found_seeds.insert(seed);
        if condition.command.is_none() {
            condition.command = read_command_record(&run.dir);
        }
        match classify(telemetry, options.target) {
            RunStatus::Complete => {}
            RunStatus::Extinct => outcome.extinct.push(run.name.clone()),
            RunStatus::Incomplete => {
                if let Some(reason) = checkpoint_exclusion(&run.dir, options) {
                    match reason {
                        SkipReason::MissingCheckpoint => {
                            warn!(run = %run.name, "not resubmitting: no checkpoint")
                        }
                        SkipReason::HasCheckpoint => {
                            warn!(run = %run.name, "not resubmitting: checkpoint present")
                        }
                        SkipReason::CheckpointCopyFailed => {}
                    }
                    outcome.skipped.push(SkippedRun {
                        run: run.name.clone(),
                        reason,
                    });
                } else {
                    info!(run = %run.name, "resubmitting");
                    condition.seeds.insert(seed);
                }
            }
        }
    }
    Ok(outcome)
}

fn checkpoint_exclusion(run_dir: &Path, options: &ReconcileOptions) -> Option<SkipReason> {
    let safe = run_dir.join(CHECKPOINT_SAFE_FILE);
    if options.checkpoint_restart {
        if !safe.exists() {
            return Some(SkipReason::MissingCheckpoint);
        }
        // Promote the safe checkpoint to the active slot; a copy failure
        // excludes this one run and never propagates upward.
        if let Err(e) = fs::copy(&safe, run_dir.join(CHECKPOINT_ACTIVE_FILE)) {
            warn!(
                run = %run_dir.display(),
                error = %e,
                "not resubmitting: checkpoint promotion failed"
            );
            return Some(SkipReason::CheckpointCopyFailed);
        }
        None
    } else if options.no_checkpoint && safe.exists() {
        Some(SkipReason::HasCheckpoint)
    } else {
        None
    }
}

fn read_command_record(run_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(run_dir.join(COMMAND_RECORD_FILE)).ok()?;
    let line = text.lines().nth(1)?;
    let mut tokens: Vec<String> = line.split_whitespace().map(|t| t.to_string()).collect();
    let seed_idx = tokens.iter().position(|t| t == "-s")?;
    if seed_idx + 1 >= tokens.len() {
        return None;
    }
    tokens[seed_idx + 1] = SEED_PLACEHOLDER.to_string();
    if tokens.len() <= REDIRECT_TOKENS {
        return None;
    }
    tokens.truncate(tokens.len() - REDIRECT_TOKENS);
    Some(tokens.join(" "))
}

#[derive(Debug, Default, Serialize)]
pub struct InferenceOutcome {
    pub inferred: BTreeMap<String, Vec<i64>>,
    pub failed: Vec<String>,
}

pub fn resolve_seed_sets(
    conditions: &mut BTreeMap<String, Condition>,
    options: &ReconcileOptions,
    run_list: Option<&RunList>,
) -> InferenceOutcome {
    let mut outcome = InferenceOutcome::default();
    let best_found: Option<Vec<i64>> = conditions
        .values()
        .max_by_key(|c| c.found_seeds.len())
        .map(|c| c.found_seeds.iter().copied().collect());
    for condition in conditions.values_mut() {
        if options.infer_missing && condition.found_seeds.len() < options.expected_reps {
            let Some((&lo, &hi)) = condition.found_seeds.first().zip(condition.found_seeds.last())
            else {
                continue;
            };
            let window = SeedSpan { start: lo, end: hi };
            let expected = if window.count() >= options.expected_reps {
                Some(window)
            } else if let Some(span) = run_list
                .and_then(|rl| rl.entry(&condition.name))
                .and_then(|e| e.seeds)
            {
                info!(
                    condition = %condition.name,
                    span = %span,
                    "inferring expected seeds from run list"
                );
                Some(span)
            } else if let Some(best) = best_found
                .as_ref()
                .filter(|b| b.len() >= options.expected_reps)
            {
                warn!(
                    condition = %condition.name,
                    "speculative inference: borrowing seed block from best-populated sibling"
                );
                Some(borrow_sibling_block(window, best, options.expected_reps as i64))
            } else {
                warn!(
                    condition = %condition.name,
                    "inference failed: no condition has the expected number of run directories"
                );
                outcome.failed.push(condition.name.clone());
                None
            };
            if let Some(expected) = expected {
                let added: Vec<i64> = expected
                    .seeds()
                    .filter(|s| !condition.found_seeds.contains(s))
                    .collect();
                if !added.is_empty() {
                    info!(condition = %condition.name, seeds = ?added, "inferred missing seeds");
                    condition.seeds.extend(added.iter().copied());
                    outcome.inferred.insert(condition.name.clone(), added);
                }
            }
        } else if condition.found_seeds.len() != options.expected_reps {
            warn!(
                condition = %condition.name,
                expected = options.expected_reps,
                found = condition.found_seeds.len(),
                "wrong number of reps found"
            );
        }
    }
    outcome
}

// Places a block of `reps` seeds congruent to the sibling block's position,
// on whichever side of the window needs the smaller shift. Best effort only.
fn borrow_sibling_block(window: SeedSpan, best: &[i64], reps: i64) -> SeedSpan {
    let bmin = best[0];
    let bmax = best[best.len() - 1];
    let above_start = window.end + 1 + (bmin - (window.end + 1)).rem_euclid(reps);
    let below_end = (window.start - 1) - ((window.start - 1) - bmax).rem_euclid(reps);
    let shift_above = (above_start - bmin).abs();
    let shift_below = (below_end - bmax).abs();
    if shift_below <= shift_above {
        SeedSpan {
            start: below_end - reps + 1,
            end: below_end,
        }
    } else {
        SeedSpan {
            start: above_start,
            end: above_start + reps - 1,
        }
    }
}

pub fn build_header(run_list: Option<&RunList>, scan_root: &Path, checkpoint_restart: bool) -> String {
    let mut header = match run_list {
        Some(rl) if !rl.header.is_empty() => rl.header.clone(),
        _ => default_header(scan_root),
    };
    if checkpoint_restart {
        header.push_str("set cpr 1\n");
    }
    header.push('\n');
    header
}

fn default_header(scan_root: &Path) -> String {
    format!(
        "set description simulation_experiment\nset walltime 4\nset mem_request 4\nset config_dir configs\nset dest_dir {}\n",
        scan_root.display()
    )
}

pub fn render_manifest(
    header: &str,
    conditions: &BTreeMap<String, Condition>,
    run_list: Option<&RunList>,
    compare: bool,
) -> (String, Vec<String>) {
    let mut out = String::from(header);
    for condition in conditions.values() {
        if condition.seeds.is_empty() {
            continue;
        }
        let command = condition
            .command
            .clone()
            .or_else(|| {
                run_list
                    .and_then(|rl| rl.entry(&condition.name))
                    .map(|e| e.command.clone())
            })
            .unwrap_or_else(|| MISSING_COMMAND_PLACEHOLDER.to_string());
        for span in compress_seeds(&condition.seeds) {
            out.push_str(&format!("{} {} {}\n", span, condition.name, command));
        }
    }
    let mut missing = Vec::new();
    if compare {
        if let Some(rl) = run_list {
            for entry in &rl.entries {
                if !conditions.contains_key(&entry.name) {
                    warn!(
                        condition = %entry.name,
                        "in run list but no results directories found, adding to resubmit list"
                    );
                    out.push_str(&entry.raw);
                    out.push('\n');
                    missing.push(entry.name.clone());
                }
            }
        } else {
            warn!("run list comparison requested but no run list provided");
        }
    }
    (out, missing)
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file =
        fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn resolve_scan_root(root: &Path, run_list: Option<&RunList>) -> PathBuf {
    if root != Path::new(".") {
        return root.to_path_buf();
    }
    let Some(dest_dir) = run_list.and_then(|rl| rl.dest_dir.as_deref()) else {
        return root.to_path_buf();
    };
    let dest = Path::new(dest_dir);
    if !dest.is_absolute() {
        // A relative dest_dir naming the cwd itself collapses to ".".
        let cwd_name = std::env::current_dir()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_os_string()));
        let dest_name = dest.file_name().map(|n| n.to_os_string());
        if cwd_name.is_some() && cwd_name == dest_name {
            return PathBuf::from(".");
        }
    }
    info!(dest_dir = %dest.display(), "using dest_dir from run list as scan root");
    dest.to_path_buf()
}

#[derive(Debug, Serialize)]
pub struct ReconcileReport {
    pub scan_root: PathBuf,
    pub runs_scanned: usize,
    pub condition_count: usize,
    pub resubmit_seed_count: usize,
    pub extinct: Vec<String>,
    pub skipped: Vec<SkippedRun>,
    pub missing_conditions: Vec<String>,
    pub inferred: BTreeMap<String, Vec<i64>>,
    pub inference_failed: Vec<String>,
    pub manifest_path: PathBuf,
    pub extinct_path: PathBuf,
}

pub fn reconcile(root: &Path, options: &ReconcileOptions) -> Result<ReconcileReport> {
    let run_list = match options.run_list_path.as_deref() {
        Some(path) => match load_run_list(path) {
            Ok(rl) => Some(rl),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "could not read run list, using default header"
                );
                None
            }
        },
        None => None,
    };
    let scan_root = resolve_scan_root(root, run_list.as_ref());
    let mut outcome = scan_runs(&scan_root, options)?;
    let inference = resolve_seed_sets(&mut outcome.conditions, options, run_list.as_ref());
    let header = build_header(run_list.as_ref(), &scan_root, options.checkpoint_restart);
    let (manifest, missing) = render_manifest(
        &header,
        &outcome.conditions,
        run_list.as_ref(),
        options.compare_run_list,
    );
    atomic_write(&options.manifest_path, &manifest)?;
    let mut extinct_text = outcome.extinct.join("\n");
    if !extinct_text.is_empty() {
        extinct_text.push('\n');
    }
    atomic_write(&options.extinct_path, &extinct_text)?;
    let resubmit_seed_count = outcome.conditions.values().map(|c| c.seeds.len()).sum();
    Ok(ReconcileReport {
        scan_root,
        runs_scanned: outcome.runs_scanned,
        condition_count: outcome.conditions.len(),
        resubmit_seed_count,
        extinct: outcome.extinct,
        skipped: outcome.skipped,
        missing_conditions: missing,
        inferred: inference.inferred,
        inference_failed: inference.failed,
        manifest_path: options.manifest_path.clone(),
        extinct_path: options.extinct_path.clone(),
    })
}

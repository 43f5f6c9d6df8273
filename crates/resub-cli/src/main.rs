use anyhow::Result;
use clap::Parser;
use resub_core::{reconcile, CompletionTarget, ReconcileOptions, ReconcileReport};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "resub",
    version,
    about = "Builds a resubmission run list for simulation runs that did not finish"
)]
struct Cli {
    /// Directory holding the per-run output directories
    #[arg(default_value = ".")]
    root: PathBuf,
    /// Number of updates each run should have reached
    #[arg(short = 'u', long, default_value_t = 100_000)]
    updates: u64,
    /// Judge completion by generations instead, against this target
    #[arg(short = 'g', long)]
    generations: Option<f64>,
    /// Expected number of seed replicates per condition
    #[arg(short = 'r', long, default_value_t = 10)]
    reps: usize,
    /// Only resubmit runs with a valid checkpoint, promoting it first
    #[arg(short = 'c', long, conflicts_with = "no_checkpoint")]
    checkpoint: bool,
    /// Only resubmit runs without a checkpoint (the ones -c would skip)
    #[arg(short = 'n', long)]
    no_checkpoint: bool,
    /// Use the expected rep count to infer runs that left no output at all
    #[arg(short = 'i', long)]
    infer_missing: bool,
    /// Check that every live run list condition has result directories
    #[arg(short = 't', long)]
    compare_run_list: bool,
    /// Reference run list (header source and expected seed ranges)
    #[arg(short = 'l', long)]
    run_list: Option<PathBuf>,
    /// Output manifest path
    #[arg(long, default_value = "run_list_resubmit")]
    out: PathBuf,
    /// Output path for naturally terminated (extinct) runs
    #[arg(long, default_value = "extinct")]
    extinct_out: PathBuf,
    /// Emit a single JSON payload instead of the text summary
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let options = ReconcileOptions {
        target: match cli.generations {
            Some(g) => CompletionTarget::Generations(g),
            None => CompletionTarget::Updates(cli.updates),
        },
        expected_reps: cli.reps,
        checkpoint_restart: cli.checkpoint,
        no_checkpoint: cli.no_checkpoint,
        infer_missing: cli.infer_missing,
        compare_run_list: cli.compare_run_list,
        run_list_path: cli.run_list.clone(),
        manifest_path: cli.out.clone(),
        extinct_path: cli.extinct_out.clone(),
    };
    match reconcile(&cli.root, &options) {
        Ok(report) => {
            if cli.json {
                emit_json(&report_to_json(&report));
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Err(err) => {
            if cli.json {
                emit_json(&json_error("reconcile_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &ReconcileReport) {
    println!("scan_root: {}", report.scan_root.display());
    println!("runs_scanned: {}", report.runs_scanned);
    println!("conditions: {}", report.condition_count);
    println!("resubmit_seeds: {}", report.resubmit_seed_count);
    println!("extinct: {}", report.extinct.len());
    println!("skipped: {}", report.skipped.len());
    for name in &report.missing_conditions {
        println!("missing_condition: {}", name);
    }
    for name in &report.inference_failed {
        println!("inference_failed: {}", name);
    }
    println!("manifest: {}", report.manifest_path.display());
    println!("extinct_list: {}", report.extinct_path.display());
}

fn report_to_json(report: &ReconcileReport) -> Value {
    json!({
        "ok": true,
        "command": "resub",
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "report": report,
    })
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

// river-schema-diff: compare two serialized service registries and report
// the changes that would break an old peer against the new registry.
//
// Exit codes: 0 = compatible, 1 = breaking changes found, 2 = bad input.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use river_schema_diff::diff;

#[derive(Parser)]
#[command(
    name = "river-schema-diff",
    about = "Offline compatibility checker for serialized service registries"
)]
struct Args {
    /// Registry document the deployed (old) peers were built against.
    old: PathBuf,
    /// Registry document of the new build.
    new: PathBuf,
    /// Emit the report as JSON instead of one line per breakage.
    #[arg(long)]
    json: bool,
}

fn load(path: &PathBuf) -> Result<serde_json::Value, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (old, new) = match (load(&args.old), load(&args.new)) {
        (Ok(old), Ok(new)) => (old, new),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let report = diff(&old, &new);
    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("failed to serialize report: {e}");
                return ExitCode::from(2);
            }
        }
    } else if report.is_empty() {
        println!("compatible: no breaking changes");
    } else {
        for breakage in &report {
            println!("{breakage}");
        }
        println!("{} breaking change(s)", report.len());
    }

    if report.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

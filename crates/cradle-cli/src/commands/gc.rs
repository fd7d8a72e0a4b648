//! Garbage collection of the variable directory.

use crate::commands::CommandError;
use cradle_runtime::garbage_collect_if_idle;
use std::path::Path;

pub fn run(variable_dir: &Path, json: bool) -> Result<(), CommandError> {
    match garbage_collect_if_idle(variable_dir)? {
        Some(report) => {
            if json {
                println!(
                    "{{\"examined\": {}, \"removed\": {}, \"kept\": {}}}",
                    report.examined,
                    report.removed.len(),
                    report.kept.len()
                );
            } else {
                println!(
                    "examined {} copies, removed {}, kept {}",
                    report.examined,
                    report.removed.len(),
                    report.kept.len()
                );
            }
        }
        None => {
            // Another process holds the directory; contention is a skip,
            // not an error.
            if json {
                println!("{{\"skipped\": true}}");
            } else {
                println!("variable directory is busy, skipping collection");
            }
        }
    }
    Ok(())
}

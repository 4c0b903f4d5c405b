//! CLI command implementations.

pub mod run;
pub mod select;

use crate::EventArgs;
use anyhow::{Context, Result};
use relay_core::Event;
use relay_core::event::changed_paths_from_diff;
use std::io::Read;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    match relay_config::load_workflow(path) {
        Ok(workflow) => {
            let steps: usize = workflow.jobs.iter().map(|j| j.steps.len()).sum();
            println!(
                "Workflow '{}' is valid ({} jobs, {} steps)",
                workflow.name,
                workflow.jobs.len(),
                steps
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error in {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

/// Build the event described by the command line.
pub fn build_event(args: &EventArgs) -> Result<Event> {
    let mut paths = args.paths.clone();

    if let Some(diff) = &args.diff {
        let text = if diff.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read diff from stdin")?;
            buf
        } else {
            std::fs::read_to_string(diff)
                .with_context(|| format!("Failed to read diff file: {}", diff.display()))?
        };
        paths.extend(changed_paths_from_diff(&text));
    }

    let mut event = Event::new(args.kind, args.branch.clone(), paths);
    if let Some(sha) = &args.sha {
        event = event.with_sha(sha.clone());
    }
    Ok(event)
}

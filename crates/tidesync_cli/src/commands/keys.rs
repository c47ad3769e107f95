//! Keys command implementation.

use super::open_existing;
use std::path::Path;

/// Runs the keys command.
pub fn run(
    dir: &Path,
    setup: &str,
    type_name: &str,
    pattern: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_existing(dir, setup)?;

    let keys = match pattern {
        Some(pattern) => backend
            .search(type_name, pattern)?
            .into_iter()
            .map(|row| row.key)
            .collect(),
        None => backend.keys(type_name)?,
    };

    tracing::debug!(type_name, count = keys.len(), "listed keys");
    for key in keys {
        println!("{key}");
    }

    Ok(())
}

//! JSON output
//!
//! Exports profile snapshots in JSON format for further analysis

use aperture_shared::types::profile::ProfileSnapshot;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::Result;

/// Write `snapshot` as pretty-printed JSON to `output_path`.
pub fn write_json(snapshot: &ProfileSnapshot, output_path: &Path) -> Result<()> {
    info!("Generating JSON output: {}", output_path.display());

    let file = File::create(output_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;

    info!("JSON output written to {}", output_path.display());
    Ok(())
}

/// Write several snapshots as one JSON array.
pub fn write_json_all(snapshots: &[ProfileSnapshot], output_path: &Path) -> Result<()> {
    info!(
        "Generating JSON output for {} profiles: {}",
        snapshots.len(),
        output_path.display()
    );

    let file = File::create(output_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshots)?;
    writer.flush()?;
    Ok(())
}

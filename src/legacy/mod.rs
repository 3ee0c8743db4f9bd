//! Legacy export ingestion: document recovery and record classification.

pub mod reader;
pub mod record;

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub use reader::{ExportItem, ExportReader, ReadStats, RejectedChunk};
pub use record::{LegacyItem, LegacyRecord, PathPrefixes, RecordKind};

/// Read buffer for export files; large exports are read in chunks of this size.
const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Open an export file for streaming. A missing file is fatal for the run.
pub fn open_export(path: &Path, probe_bytes: usize) -> Result<ExportReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("open legacy export {}", path.display()))?;
    Ok(ExportReader::with_probe_bytes(
        BufReader::with_capacity(READ_BUFFER_BYTES, file),
        probe_bytes,
    ))
}

/// Check every input up front so a run never starts with an input absent.
pub fn verify_sources(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        bail!("no legacy exports given");
    }
    for p in paths {
        if !p.is_file() {
            bail!("legacy export not found: {}", p.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn verify_sources_rejects_missing_and_empty() {
        assert!(verify_sources(&[]).is_err());
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = verify_sources(&[missing]).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn open_export_streams_documents_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let mut f = File::create(&path).unwrap();
        write!(f, r#"{{"path":"users","data":[]}}{{"path":"books","data":[]}}"#).unwrap();
        drop(f);

        verify_sources(&[path.clone()]).unwrap();
        let docs: Vec<_> = open_export(&path, 1024)
            .unwrap()
            .filter_map(|item| match item.unwrap() {
                ExportItem::Document(v) => Some(v),
                ExportItem::Rejected(_) => None,
            })
            .collect();
        assert_eq!(docs.len(), 2);
    }
}

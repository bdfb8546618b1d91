//! On-demand gzip tarballs of run data directories.
//!
//! The archive is produced at a temporary path and handed back as
//! bytes; nothing durable is created and the temp file is reclaimed
//! when the handle drops.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use cohort_core::Result;

/// Build a `.tar.gz` of `data_dir` and return its bytes.
///
/// Entries are rooted at `prefix` inside the archive (typically
/// `<study>-run-<id>`), so extraction yields a single directory.
pub fn archive_dir(data_dir: &Path, prefix: &str) -> Result<Vec<u8>> {
    let mut tmp = tempfile::tempfile()?;
    {
        let encoder = GzEncoder::new(&mut tmp, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(prefix, data_dir)?;
        let encoder = builder.into_inner()?;
        let _ = encoder.finish()?;
    }

    let _ = tmp.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    let _ = tmp.read_to_end(&mut bytes)?;
    info!(?data_dir, size = bytes.len(), "built run archive");
    Ok(bytes)
}

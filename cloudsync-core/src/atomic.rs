use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Replaces `target` with `contents` so readers see either the old or the new file.
///
/// The temporary file lives next to `target`; the final rename therefore never crosses
/// a filesystem boundary.
pub fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|err| err.error)?;
    Ok(())
}

//! Whole-file loading.

use crate::{PlatformError, Result};
use std::path::Path;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PlatformError {
    let path = path.display().to_string();
    move |source| PlatformError::Io { path, source }
}

/// Read a file into memory, e.g. a SPIR-V binary.
pub fn load_binary_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    tracing::debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vkh-platform-{}-{name}", std::process::id()))
    }

    #[test]
    fn binary_round_trip() {
        let path = scratch_path("bytes.bin");
        std::fs::write(&path, [0x03u8, 0x02, 0x23, 0x07, 0x00]).unwrap();

        let bytes = load_binary_file(&path).unwrap();
        assert_eq!(bytes, vec![0x03, 0x02, 0x23, 0x07, 0x00]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_reports_path() {
        let path = scratch_path("does-not-exist");
        let err = load_binary_file(&path).unwrap_err();
        assert!(matches!(err, PlatformError::Io { .. }));
        assert!(err.to_string().contains("does-not-exist"));
    }
}

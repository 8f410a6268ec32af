//! Common utilities shared across modules.

use std::io::Write;
use std::path::Path;

use chrono::{Local, Utc};
use sha2::{Digest, Sha256};

/// Get current UTC timestamp in milliseconds since UNIX_EPOCH.
pub fn get_utc_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Local timestamp in the format used by note frontmatter (`2024-05-01 14:03`).
pub fn note_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Hex encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `contents` to `path` so readers see either the old or the new file.
///
/// The data goes to a temp file in the same directory, is synced, and then
/// renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_utc_timestamp_ms() {
        let ts = get_utc_timestamp_ms();
        // Should be a reasonable Unix timestamp (after 2020)
        assert!(ts > 1_577_836_800_000, "Timestamp should be after 2020-01-01");
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("note.md");

        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

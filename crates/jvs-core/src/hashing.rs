//! Deterministic descriptor checksum and payload-tree root hash (spec.md §4.2).

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Canonicalize a descriptor JSON value for checksumming: drop
/// `descriptor_checksum` and `integrity_state`, sort keys, emit without
/// insignificant whitespace. `value` must already be an object.
pub fn canonicalize_descriptor_json(value: &serde_json::Value) -> Result<Vec<u8>> {
    let obj = value.as_object().ok_or_else(|| {
        Error::invalid_input("descriptor must serialize to a JSON object")
    })?;
    let mut sorted: BTreeMap<&String, &serde_json::Value> = BTreeMap::new();
    for (k, v) in obj {
        if k == "descriptor_checksum" || k == "integrity_state" {
            continue;
        }
        sorted.insert(k, v);
    }
    let canonical = serde_json::to_value(sorted).map_err(Error::from)?;
    serde_json::to_vec(&canonical).map_err(Error::from)
}

/// SHA-256 hex of the canonical descriptor form.
pub fn descriptor_checksum(value: &serde_json::Value) -> Result<String> {
    Ok(sha256_hex(&canonicalize_descriptor_json(value)?))
}

/// Walk `root` recursively and compute the deterministic payload tree hash
/// described in spec.md §4.2. `root` itself and any file literally named
/// `.READY` are excluded from the line set.
pub fn payload_root_hash(root: &Path) -> Result<String> {
    let mut lines = Vec::new();
    walk(root, root, &mut lines)?;
    lines.sort();
    let mut concat = String::new();
    for l in &lines {
        concat.push_str(l);
    }
    Ok(sha256_hex(concat.as_bytes()))
}

fn walk(root: &Path, dir: &Path, lines: &mut Vec<String>) -> Result<()> {
    let mut entries: Vec<_> =
        fs::read_dir(dir).map_err(|e| Error::io(dir, e))?.collect::<std::io::Result<_>>().map_err(|e| Error::io(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .expect("walked path is under root")
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&path).map_err(|e| Error::io(&path, e))?;
            let mode = symlink_mode(&path)?;
            let entry_hash = sha256_hex(target.to_string_lossy().as_bytes());
            lines.push(format!("symlink:{rel}:mode={mode:o}:{entry_hash}\n"));
        } else if file_type.is_dir() {
            let meta = fs::symlink_metadata(&path).map_err(|e| Error::io(&path, e))?;
            let mode = meta.permissions().mode() & 0o7777;
            let basename = path.file_name().unwrap_or_default().to_string_lossy();
            let entry_hash = sha256_hex(basename.as_bytes());
            lines.push(format!("dir:{rel}:mode={mode:o}:{entry_hash}\n"));
            walk(root, &path, lines)?;
        } else {
            if path.file_name().map(|n| n == ".READY").unwrap_or(false) {
                continue;
            }
            let meta = fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
            let mode = meta.permissions().mode() & 0o7777;
            let size = meta.len();
            let mod_nanos = mtime_nanos(&meta);
            let contents = fs::read(&path).map_err(|e| Error::io(&path, e))?;
            let entry_hash = sha256_hex(&contents);
            lines.push(format!(
                "file:{rel}:mode={mode:o},size={size},mod={mod_nanos}:{entry_hash}\n"
            ));
        }
    }
    Ok(())
}

fn symlink_mode(path: &Path) -> Result<u32> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
    Ok(meta.permissions().mode() & 0o7777)
}

fn mtime_nanos(meta: &fs::Metadata) -> i128 {
    meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn empty_tree_is_deterministic() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        assert_eq!(payload_root_hash(a.path()).unwrap(), payload_root_hash(b.path()).unwrap());
    }

    #[test]
    fn single_byte_change_changes_hash() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("a.txt");
        File::create(&file_path).unwrap().write_all(b"hi").unwrap();
        let h1 = payload_root_hash(dir.path()).unwrap();

        File::create(&file_path).unwrap().write_all(b"hj").unwrap();
        let h2 = payload_root_hash(dir.path()).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn ready_marker_excluded() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("a.txt")).unwrap().write_all(b"hi").unwrap();
        let without_ready = payload_root_hash(dir.path()).unwrap();

        File::create(dir.path().join(".READY")).unwrap();
        let with_ready = payload_root_hash(dir.path()).unwrap();
        assert_eq!(without_ready, with_ready);
    }

    #[test]
    fn descriptor_checksum_ignores_excluded_fields() {
        let v1 = serde_json::json!({
            "snapshot_id": "x",
            "descriptor_checksum": "aaa",
            "integrity_state": "unverified",
        });
        let v2 = serde_json::json!({
            "snapshot_id": "x",
            "descriptor_checksum": "bbb",
            "integrity_state": "verified",
        });
        assert_eq!(descriptor_checksum(&v1).unwrap(), descriptor_checksum(&v2).unwrap());
    }
}

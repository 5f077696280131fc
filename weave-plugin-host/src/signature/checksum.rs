//! SHA-256 checksums over package files

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use subtle::ConstantTimeEq;
use walkdir::WalkDir;

use super::SIGNATURE_FILE_NAME;

/// Lowercase hex SHA-256 of `data`
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare `data` against an expected hex checksum
///
/// Case-insensitive; the comparison runs in constant time.
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    let actual = compute_checksum(data);
    let expected = expected.to_ascii_lowercase();
    bool::from(actual.as_bytes().ct_eq(expected.as_bytes()))
}

/// Whether `path` may appear in a signed file listing
///
/// Control characters (newlines included) are never allowed.
pub fn is_valid_package_path(path: &str) -> bool {
    !path.is_empty() && !path.chars().any(char::is_control)
}

/// Relative, `/`-separated paths of every regular file under `root`
///
/// The top-level `signature.json` is excluded. Paths are sorted. A name with
/// a control character fails the walk with `InvalidData`.
pub fn collect_package_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name == SIGNATURE_FILE_NAME {
            continue;
        }
        if !is_valid_package_path(&name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("package path contains a control character: {:?}", name),
            ));
        }
        files.push(name);
    }

    files.sort();
    Ok(files)
}

/// Checksums for the given relative paths under `root`
pub fn compute_file_checksums(root: &Path, files: &[String]) -> io::Result<BTreeMap<String, String>> {
    files
        .iter()
        .map(|name| {
            let data = std::fs::read(root.join(name))?;
            Ok((name.clone(), compute_checksum(&data)))
        })
        .collect()
}

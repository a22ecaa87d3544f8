//! Blocking filesystem helpers for workspace snapshots. Callers run these on
//! the blocking pool.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use berth_types::Result;
use sha2::{Digest, Sha256};

/// Content digest of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub fingerprint: String,
    pub file_count: u64,
    pub byte_size: u64,
}

fn sorted_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| berth_types::BerthError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push((rel, entry.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// SHA-256 over every file's relative path and bytes, in path order.
pub fn digest_tree(root: &Path) -> Result<TreeDigest> {
    let mut hasher = Sha256::new();
    let mut file_count = 0u64;
    let mut byte_size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];

    for (rel, path) in sorted_files(root)? {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        let mut file = fs::File::open(&path)?;
        let mut len = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            len += n as u64;
        }
        hasher.update(len.to_le_bytes());
        file_count += 1;
        byte_size += len;
    }

    Ok(TreeDigest {
        fingerprint: hex::encode(hasher.finalize()),
        file_count,
        byte_size,
    })
}

/// Total size in bytes of the regular files under `root`.
pub fn tree_size(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Copy the tree at `src` into `dst`, creating `dst`. Symlinks are skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| berth_types::BerthError::Io(e.into()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove everything inside `dir` but keep the directory itself.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Replace the contents of `workspace` with the snapshot at `snapshot`.
pub fn restore_tree(snapshot: &Path, workspace: &Path) -> Result<()> {
    clear_dir(workspace)?;
    copy_tree(snapshot, workspace)
}

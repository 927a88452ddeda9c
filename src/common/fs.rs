//! 原子文件写入
//!
//! 写临时文件 → fsync → 重命名覆盖目标。任何一步失败，原文件保持不变。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Sibling temp path in the same directory, so the final rename stays on one filesystem.
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp_name = format!(".{}.{}.tmp", file_name, std::process::id());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Atomically replace `path` with `contents`.
///
/// Permissions of an existing target are carried over to the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    let result = write_and_rename(path, &tmp_path, contents);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_rename(path: &Path, tmp_path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp_path, meta.permissions())?;
    }

    fs::rename(tmp_path, path)?;

    // 目录项也需要落盘，否则断电后重命名可能丢失
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    debug!(path = %path.display(), bytes = contents.len(), "file written atomically");
    Ok(())
}

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Temp file next to `path` so the final rename never crosses filesystems.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

/// Replace `path` with `content` via write-to-temp + fsync + rename.
///
/// Readers observe either the previous file or the new one, never a prefix.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(path);
    let written = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()
    })();
    if let Err(error) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }

    if let Err(rename_error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(rename_error);
    }

    Ok(())
}

/// Byte-identical copy of `source` onto `target`, replaced atomically.
pub fn copy_atomic(source: &Path, target: &Path) -> io::Result<()> {
    let bytes = fs::read(source)?;
    write_atomic(target, &bytes)
}

/// Append one line to a log file, creating parents as needed.
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Fresh `<dir>/<stem>_<utc timestamp>.<ext>`; names sort chronologically.
pub fn timestamped_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let mut candidate = dir.join(format!("{stem}_{stamp}.{ext}"));
    let mut counter = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{stamp}_{counter}.{ext}"));
        counter += 1;
    }
    candidate
}

/// Files in `dir` named `<stem>_*.<ext>`, oldest first. A missing directory
/// is empty.
pub fn list_timestamped(dir: &Path, stem: &str, ext: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let prefix = format!("{stem}_");
    let suffix = format!(".{ext}");
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(&suffix))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Delete the oldest `<stem>_*.<ext>` files so at most `keep` remain.
pub fn prune_timestamped(dir: &Path, stem: &str, ext: &str, keep: usize) -> io::Result<usize> {
    let files = list_timestamped(dir, stem, ext)?;
    let excess = files.len().saturating_sub(keep);
    for path in &files[..excess] {
        fs::remove_file(path)?;
    }
    Ok(excess)
}

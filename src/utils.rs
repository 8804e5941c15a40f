use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProfusionError, Result};
use crate::NANOSECONDS_PER_SECOND;

/// What a case-insensitive directory lookup should accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// 在目录中按名称子串查找（忽略大小写）
///
/// Entries are visited in sorted order so the first match is stable across
/// platforms. Returns `Ok(None)` when nothing matches.
pub fn find_entry_ci(root: &Path, pattern: &str, kind: EntryKind) -> Result<Option<PathBuf>> {
    let pattern = pattern.to_lowercase();
    let mut entries: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    Ok(entries.into_iter().find(|path| {
        let kind_ok = match kind {
            EntryKind::File => path.is_file(),
            EntryKind::Dir => path.is_dir(),
        };
        kind_ok
            && path
                .file_name()
                .map(|name| name.to_string_lossy().to_lowercase().contains(&pattern))
                .unwrap_or(false)
    }))
}

/// Sorted paths in `dir` whose names match `file_pattern` (e.g. `*.rda`)
///
/// The directory part is escaped, so bundle names containing `[` or `*` are
/// matched literally.
pub fn glob_sorted(dir: &Path, file_pattern: &str) -> Result<Vec<PathBuf>> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = Path::new(&escaped).join(file_pattern);
    let pattern = pattern.to_string_lossy();

    let paths = glob::glob(&pattern)
        .map_err(|e| ProfusionError::NotFound(format!("invalid pattern {}: {}", pattern, e)))?;

    let mut found: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
    found.sort();
    Ok(found)
}

/// Splits a `key = value` line, trimming both sides
pub fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Lower-case extension of a path, if any
pub fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
}

/// 由高低 32 位拼出纳秒时间戳并换算成秒
///
/// The low word is reinterpreted as unsigned; the high word keeps its sign.
pub fn hi_lo_to_seconds(hi: i32, lo: i32) -> f64 {
    let nanos = ((hi as i64) << 32) + (lo as u32) as i64;
    nanos as f64 / NANOSECONDS_PER_SECOND
}

/// File name of a path as an owned string
pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("Number of Channels = 32"),
            Some(("Number of Channels", "32"))
        );
        assert_eq!(parse_key_value("  a=b  "), Some(("a", "b")));
        assert_eq!(parse_key_value("[Section]"), None);
    }

    #[test]
    fn test_hi_lo_to_seconds() {
        let secs = hi_lo_to_seconds(1, 500_000_000);
        assert!((secs - 4.794967296).abs() < 1e-12);

        // 低位为负数时按无符号处理
        let secs = hi_lo_to_seconds(0, -1);
        assert!((secs - 4.294967295).abs() < 1e-12);

        assert_eq!(hi_lo_to_seconds(0, 0), 0.0);
    }

    #[test]
    fn test_find_entry_ci() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("EegData")).unwrap();
        fs::write(dir.path().join("eegstudydb.MDB"), b"").unwrap();

        let data = find_entry_ci(dir.path(), "EEGData", EntryKind::Dir).unwrap();
        assert_eq!(data, Some(dir.path().join("EegData")));

        let db = find_entry_ci(dir.path(), "EEGStudyDB.mdb", EntryKind::File).unwrap();
        assert_eq!(db, Some(dir.path().join("eegstudydb.MDB")));

        // 类型不符时不匹配
        assert_eq!(find_entry_ci(dir.path(), "EEGData", EntryKind::File).unwrap(), None);
        assert_eq!(find_entry_ci(dir.path(), "missing", EntryKind::Dir).unwrap(), None);
    }

    #[test]
    fn test_glob_sorted_escapes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Export-#1[a]");
        fs::create_dir(&bundle).unwrap();
        fs::write(bundle.join("b.rda"), b"").unwrap();
        fs::write(bundle.join("a.rda"), b"").unwrap();
        fs::write(bundle.join("c.txt"), b"").unwrap();

        let found = glob_sorted(&bundle, "*.rda").unwrap();
        assert_eq!(found, vec![bundle.join("a.rda"), bundle.join("b.rda")]);
    }
}

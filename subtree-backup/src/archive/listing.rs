//! Human-readable listing uploaded next to each archive.

use crate::fs::FileSet;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::path::Path;

const RULE_WIDTH: usize = 80;

/// Render the `_files.txt` companion for a unit.
pub fn render_listing(source: &Path, files: &FileSet, generated_at: DateTime<Utc>) -> String {
    let rule = "-".repeat(RULE_WIDTH);
    let mut out = String::new();

    // Writing into a String cannot fail
    let _ = writeln!(out, "Files in: {}", source.display());
    let _ = writeln!(out, "Generated at: {}", generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "{}", rule);

    for entry in files.entries() {
        let _ = writeln!(out, "{} ({} bytes)", entry.relative_path, entry.size);
    }

    let total = files.total_bytes();
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Total files: {}", files.len());
    let _ = writeln!(
        out,
        "Total size: {} bytes ({:.2} GB)",
        total,
        total as f64 / (1024.0 * 1024.0 * 1024.0)
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileInfo, LogicalPath};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn entry(rel: &str, size: u64) -> FileInfo {
        FileInfo {
            relative_path: LogicalPath::normalize(rel).unwrap(),
            size,
            is_symlink: false,
        }
    }

    #[test]
    fn test_render_listing() {
        let files = FileSet::new(
            PathBuf::from("/data/a"),
            vec![entry("z.txt", 10), entry("b/c.bin", 2048)],
        );
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let text = render_listing(Path::new("/data/a"), &files, at);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Files in: /data/a");
        assert_eq!(lines[1], "Generated at: 2026-03-01 12:30:00 UTC");
        assert_eq!(lines[3], "b/c.bin (2048 bytes)");
        assert_eq!(lines[4], "z.txt (10 bytes)");
        assert_eq!(lines[6], "Total files: 2");
        assert_eq!(lines[7], "Total size: 2058 bytes (0.00 GB)");
    }

    #[test]
    fn test_empty_listing_has_totals() {
        let files = FileSet::new(PathBuf::from("/data"), Vec::new());
        let text = render_listing(Path::new("/data"), &files, Utc::now());
        assert!(text.contains("Total files: 0"));
    }
}

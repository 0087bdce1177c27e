//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce the workspace's
//! layering rules:
//! - `avatar-core` never depends on the WebSocket transport
//! - No blocking sleeps in production code
//! - No `unwrap()` / `expect()` outside tests
//! - No blocking file or process I/O inside async functions
//!
//! The helpers here find source files and cut them down to the part that
//! ships, so each rule only has to look at production lines.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under `dir` (relative to the workspace root), sorted
#[must_use]
pub fn rust_sources(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// 1-based line number
    pub number: usize,
    /// Line with any trailing `//` comment removed
    pub code: String,
    /// Original line, trimmed
    pub text: String,
}

/// Lines of `path` before its test module, comments stripped
///
/// Unreadable files yield nothing.
#[must_use]
pub fn production_section(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !is_test_gate(line))
        .map(|(idx, line)| SourceLine {
            number: idx + 1,
            code: strip_comment(line).to_string(),
            text: line.trim().to_string(),
        })
        .collect()
}

/// `#[cfg(test)]`, `#[cfg(all(test, unix))]` and friends
fn is_test_gate(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("#[cfg(") && line.contains("test")
}

fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the line at `idx` sits in an `async fn`
///
/// Scans back to the nearest function header; stops at `mod`/`impl`
/// boundaries.
#[must_use]
pub fn is_in_async_function(lines: &[SourceLine], idx: usize) -> bool {
    for line in lines[..idx].iter().rev() {
        let text = line.text.as_str();

        if text.contains("async fn ") {
            return true;
        }
        if text.contains("fn ") && !text.contains("async") {
            return false;
        }
        if text.starts_with("mod ") || (text.starts_with("impl") && text.contains('{')) {
            return false;
        }
    }
    false
}

/// Collect `file:line - text` for every production line matching `rule`
pub fn violations<F>(dirs: &[&str], mut rule: F) -> Vec<String>
where
    F: FnMut(&[SourceLine], usize) -> bool,
{
    let mut found = Vec::new();
    for dir in dirs {
        for path in rust_sources(dir) {
            let lines = production_section(&path);
            for idx in 0..lines.len() {
                if rule(&lines, idx) {
                    found.push(format!(
                        "{}:{} - {}",
                        path.display(),
                        lines[idx].number,
                        lines[idx].text
                    ));
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &str) -> Vec<SourceLine> {
        src.lines()
            .enumerate()
            .map(|(idx, line)| SourceLine {
                number: idx + 1,
                code: strip_comment(line).to_string(),
                text: line.trim().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1; // note"), "let x = 1; ");
        assert_eq!(strip_comment("/// doc"), "");
    }

    #[test]
    fn test_test_gates() {
        assert!(is_test_gate("#[cfg(test)]"));
        assert!(is_test_gate("    #[cfg(all(test, unix))]"));
        assert!(!is_test_gate("#[cfg(unix)]"));
    }

    #[test]
    fn test_async_detection() {
        let src = "async fn run() {\n    body();\n}\nfn sync() {\n    body();\n}";
        let parsed = lines(src);
        assert!(is_in_async_function(&parsed, 1));
        assert!(!is_in_async_function(&parsed, 4));
    }

    #[test]
    fn test_core_sources_found() {
        let files = rust_sources("avatar/core/src");
        assert!(files.iter().any(|p| p.ends_with("lib.rs")));
    }
}

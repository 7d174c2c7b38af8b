//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the stepio engine:
//! - No blocking `std::net` / `std::fs` calls inside async functions; the
//!   event loop is a single thread and one blocking call stalls every node
//! - No `.unwrap()` / `.expect()` in production code; per-connection
//!   failures are logged and contained, never panics
//!
//! The scanning is line-based, like a reviewer skimming the source. The
//! helpers here are shared by the tests under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_sources(dir: &str) -> Vec<PathBuf> {
    let path = workspace_root().join(dir);
    if !path.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Kind of function a line declares
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnDecl {
    /// `fn ...`
    Sync,
    /// `async fn ...`
    Async,
}

/// Recognise a function declaration, with or without visibility
#[must_use]
pub fn fn_decl(line: &str) -> Option<FnDecl> {
    let mut rest = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(FnDecl::Async)
    } else if rest.starts_with("fn ") || rest.starts_with("const fn ") {
        Some(FnDecl::Sync)
    } else {
        None
    }
}

/// The function enclosing line `idx`, found by scanning backwards
#[must_use]
pub fn enclosing_fn(lines: &[&str], idx: usize) -> Option<FnDecl> {
    (0..=idx).rev().find_map(|i| fn_decl(lines[i]))
}

/// Production lines of a file: `(line_number, code)` with comments removed
/// and everything from the first `#[cfg(test)]` on dropped
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);
        out.push((idx + 1, code.to_string()));
    }
    out
}

/// Read a file, empty on error
#[must_use]
pub fn read_source(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_decl() {
        assert_eq!(fn_decl("    pub async fn run(self) {"), Some(FnDecl::Async));
        assert_eq!(fn_decl("pub(crate) fn bind() {"), Some(FnDecl::Sync));
        assert_eq!(fn_decl("async fn drive("), Some(FnDecl::Async));
        assert_eq!(fn_decl("let f = fn_ptr;"), None);
    }

    #[test]
    fn test_enclosing_fn() {
        let lines = vec![
            "fn setup() {",
            "}",
            "async fn serve() {",
            "    let x = 1;",
        ];
        assert_eq!(enclosing_fn(&lines, 3), Some(FnDecl::Async));
        assert_eq!(enclosing_fn(&lines, 1), Some(FnDecl::Sync));
    }

    #[test]
    fn test_production_lines_stop_at_tests() {
        let content = "fn a() {}\n// note\nfn b() {} // trailing\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(content);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], (3, "fn b() {} ".to_string()));
    }
}

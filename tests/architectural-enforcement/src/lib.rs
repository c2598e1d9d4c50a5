//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls in production code outside backoff and rate-limit waits
//! - No unwrap() or expect() in production code
//!
//! These tests are designed to catch violations early in the development cycle.

use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Production Rust sources under `dir` (relative to the workspace root)
///
/// Panics if `dir` does not exist so a moved directory cannot silently
/// disable a check.
#[must_use]
pub fn rust_sources(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    assert!(root.exists(), "source directory {} is missing", root.display());

    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Lines of `content` that belong to production code: everything before the
/// `#[cfg(test)] mod tests` block, with line comments stripped. Yields
/// `(line_number, code)`.
pub fn production_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    let end = content
        .find("#[cfg(test)]\nmod tests")
        .unwrap_or(content.len());
    content[..end]
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
        .filter(|(_, code)| !code.trim().is_empty())
}

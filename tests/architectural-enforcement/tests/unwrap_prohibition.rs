//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: Production code propagates errors with `?` or handles them.
//! `unwrap()` and `expect()` are allowed only in tests and test fixtures.

use std::fs;

use architectural_enforcement::{production_lines, rust_sources};

#[test]
fn test_no_unwrap_in_production_code() {
    let mut violations = Vec::new();
    for dir in ["switchboard/core/src", "switchboard/daemon/src"] {
        for path in rust_sources(dir) {
            if path.ends_with("test_utils.rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (line_number, code) in production_lines(&content) {
                if code.contains(".unwrap()") || code.contains(".expect(") {
                    violations.push(format!("{}:{} - {}", path.display(), line_number, code.trim()));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "unwrap()/expect() in production code:\n{}",
        violations.join("\n")
    );
}

//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the broker and daemon MUST NOT call sleep
//! methods. Waiting happens on I/O, channels, intervals or deadlines.
//! **Exceptions**: retry backoff, rate-limit waits, test code and test
//! fixtures.

use std::fs;
use std::path::Path;

use architectural_enforcement::{production_lines, rust_sources};

/// Files allowed to sleep, and why
const ALLOWED: &[(&str, &str)] = &[
    ("resilience/retry.rs", "backoff between attempts"),
    ("resilience/rate_limit.rs", "waiting for a token up to max_wait"),
    ("client/test_utils.rs", "scripted latency in unit tests"),
];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();
    for dir in ["switchboard/core/src", "switchboard/daemon/src"] {
        for path in rust_sources(dir) {
            if is_allowed(&path) {
                continue;
            }
            check_file(&path, &mut violations);
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        for (file, reason) in ALLOWED {
            eprintln!("  - {file}: {reason}");
        }
        eprintln!("  - Periodic work using tokio::time::interval()");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn is_allowed(path: &Path) -> bool {
    let path = path.to_string_lossy();
    ALLOWED.iter().any(|(file, _)| path.ends_with(file))
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    for (line_number, code) in production_lines(&content) {
        if code.contains("::sleep(") || code.contains("sleep_until(") || code.contains(".sleep(") {
            violations.push(format!("{}:{} - {}", path.display(), line_number, code.trim()));
        }
    }
}

#[test]
fn test_detects_sleep_before_test_module_only() {
    let source = "fn a() {}\nasync fn b() { tokio::time::sleep(d).await; }\n#[cfg(test)]\nmod tests { fn c() { std::thread::sleep(d); } }\n";
    let hits: Vec<usize> = production_lines(source)
        .filter(|(_, code)| code.contains("::sleep("))
        .map(|(n, _)| n)
        .collect();
    assert_eq!(hits, vec![2]);
}

//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the status engine and daemon MUST NOT block the
//! runtime. Use `tokio::fs`, `tokio::net` and the async `reqwest` client.
//!
//! Blocking calls are tolerated in plain functions that run before the
//! runtime matters (config loading) and in test code.

use architectural_enforcement::{production_sources, FnContext};

const FORBIDDEN_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
];

const FORBIDDEN_EVERYWHERE: &[(&str, &str)] = &[("reqwest::blocking", "Blocking HTTP client")];

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (line_number, code) in file.production_lines() {
            for (pattern, label) in FORBIDDEN_EVERYWHERE {
                if code.contains(pattern) {
                    violations.push(format!(
                        "{}:{} - {label}: {}",
                        file.path.display(),
                        line_number,
                        code.trim()
                    ));
                }
            }
            if file.context(line_number - 1) != FnContext::Async {
                continue;
            }
            for (pattern, label) in FORBIDDEN_IN_ASYNC {
                if code.contains(pattern) {
                    violations.push(format!(
                        "{}:{} - {label}: {}",
                        file.path.display(),
                        line_number,
                        code.trim()
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in async production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - reqwest::Client::get(..).send().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

/// The session store must persist through tokio::fs
#[test]
fn test_session_store_uses_async_fs() {
    let store = production_sources()
        .into_iter()
        .find(|f| f.path.ends_with("session_store.rs"))
        .expect("session_store.rs not found");

    let uses_tokio_fs = store
        .production_lines()
        .any(|(_, code)| code.contains("tokio::fs::"));
    assert!(uses_tokio_fs, "session store should write with tokio::fs");
}

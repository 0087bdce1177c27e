//! Integration Test: Layering Rules
//!
//! **Policy**: `avatar-core` is transport-free domain logic; the daemon owns
//! the WebSocket. Production code in both crates never blocks the runtime
//! and never panics on a recoverable error.
//!
//! **Exceptions**: test modules (everything from the first `#[cfg(test)]` gate) and
//! blocking I/O in non-async functions (config loading, drop guards).

use std::fs;

use architectural_enforcement::{is_in_async_function, violations, workspace_root};

const PRODUCTION_DIRS: &[&str] = &["avatar/core/src", "avatar/daemon/src"];

fn report(kind: &str, found: &[String]) {
    if found.is_empty() {
        return;
    }
    eprintln!("\n{kind} found in production code:\n");
    for violation in found {
        eprintln!("  {violation}");
    }
    panic!("\nFound {} violation(s): {kind}", found.len());
}

#[test]
fn test_core_has_no_transport_dependency() {
    let manifest = fs::read_to_string(workspace_root().join("avatar/core/Cargo.toml")).unwrap();
    assert!(
        !manifest.contains("tungstenite"),
        "avatar-core must not depend on the WebSocket transport"
    );

    let found = violations(&["avatar/core/src"], |lines, idx| {
        lines[idx].code.contains("tungstenite")
    });
    report("WebSocket transport referenced from avatar-core", &found);
}

#[test]
fn test_no_blocking_sleep() {
    let found = violations(PRODUCTION_DIRS, |lines, idx| {
        lines[idx].code.contains("thread::sleep(")
    });
    report("Blocking sleep (use tokio::time)", &found);
}

#[test]
fn test_no_unwrap_or_expect() {
    let found = violations(PRODUCTION_DIRS, |lines, idx| {
        let code = &lines[idx].code;
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("unwrap()/expect() (propagate the error instead)", &found);
}

#[test]
fn test_no_blocking_io_in_async_functions() {
    let found = violations(PRODUCTION_DIRS, |lines, idx| {
        let code = &lines[idx].code;
        let blocking = code.contains("std::fs::")
            || code.contains("std::process::Command")
            || code.contains("reqwest::blocking");
        blocking && is_in_async_function(lines, idx)
    });
    report("Blocking I/O inside async fn (use tokio::fs / tokio::process)", &found);
}

#[test]
fn test_library_never_installs_subscriber() {
    let found = violations(&["avatar/core/src"], |lines, idx| {
        lines[idx].code.contains("tracing_subscriber")
    });
    report("Subscriber setup in avatar-core", &found);
}

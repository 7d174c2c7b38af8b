//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Code that runs on the event loop (any `async fn`) MUST NOT use
//! blocking I/O. The loop is one thread serving every node; a blocking call
//! there stalls all of them.
//! **Required**: `tokio::net`, `tokio::fs`, `tokio::io` inside async code.
//!
//! Blocking calls are fine in synchronous setup code (`Controller::create`
//! opens files and binds sockets before the loop starts) and in the node
//! simulator, which is not async at all.

use std::path::Path;

use architectural_enforcement::{enclosing_fn, production_lines, read_source, rust_sources, FnDecl};

const FORBIDDEN_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::thread::sleep", "Blocking sleep"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    (".read_to_string(", "Blocking read"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();
    for file in rust_sources("stepio/core/src") {
        check_file(&file, &mut violations);
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O inside async functions!\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }
        eprintln!("\n✅ REQUIRED inside async fn:");
        eprintln!("  - tokio::net::TcpStream / TcpListener");
        eprintln!("  - tokio::fs::File::from_std for files opened at create()");
        eprintln!("  - tokio::time::sleep().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in event-loop code.",
            violations.len()
        );
    }
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let content = read_source(path);
    let all_lines: Vec<&str> = content.lines().collect();

    for (line_number, code) in production_lines(&content) {
        if enclosing_fn(&all_lines, line_number - 1) != Some(FnDecl::Async) {
            continue;
        }
        for (pattern, what) in FORBIDDEN_IN_ASYNC {
            if code.contains(pattern) {
                violations.push(format!(
                    "{}:{} - {}: {}",
                    path.display(),
                    line_number,
                    what,
                    code.trim()
                ));
            }
        }
    }
}

#[test]
fn test_core_sources_are_scanned() {
    // Guard against the scan silently finding nothing after a move
    let files = rust_sources("stepio/core/src");
    assert!(
        files.iter().any(|f| f.ends_with("event_loop.rs")),
        "expected to scan the event loop, found {files:?}"
    );
}

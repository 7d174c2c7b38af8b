//! Integration Test: No Panicking Shortcuts in Production Code
//!
//! **Policy**: Production code in `stepio/core/src` MUST NOT call
//! `.unwrap()` or `.expect(..)`. A misbehaving node is logged and dropped;
//! it must never take the event loop, and with it every other node, down.
//! **Required**: propagate with `?`, or handle and log.
//!
//! Test modules (`#[cfg(test)]`) and doc comments are exempt.

use architectural_enforcement::{production_lines, read_source, rust_sources};

#[test]
fn test_no_unwrap_in_production_code() {
    let mut violations = Vec::new();

    for file in rust_sources("stepio/core/src") {
        let content = read_source(&file);
        for (line_number, code) in production_lines(&content) {
            if code.contains(".unwrap()") || code.contains(".expect(") {
                violations.push(format!(
                    "{}:{} - {}",
                    file.display(),
                    line_number,
                    code.trim()
                ));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls found in production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }
        eprintln!("\n✅ Use `?`, `unwrap_or`, or log and continue instead.");

        panic!(
            "\nFound {} unwrap/expect call(s) in production code.",
            violations.len()
        );
    }
}

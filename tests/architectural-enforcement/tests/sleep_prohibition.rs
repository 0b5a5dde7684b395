//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep to wait for work. Periodic tasks
//! (polling, the speaker countdown) use `tokio::time::interval`.
//!
//! **Exceptions**: one-shot timers listed in `ALLOWED_SLEEP`, and test code.

use architectural_enforcement::production_sources;

/// Files allowed a `tokio::time::sleep`, with the reason
const ALLOWED_SLEEP: &[(&str, &str)] = &[
    ("core/src/state/mod.rs", "notice expiry timer"),
    ("core/src/adapters/scripted.rs", "simulated feed latency"),
];

/// Test that production code does not contain sleep calls
#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        let allowed = ALLOWED_SLEEP
            .iter()
            .any(|(suffix, _)| file.path.ends_with(suffix));

        for (line_number, code) in file.production_lines() {
            if code.contains("thread::sleep") {
                violations.push(format!(
                    "{}:{} - Thread sleep blocks the runtime: {}",
                    file.path.display(),
                    line_number,
                    code.trim()
                ));
            }
            if code.contains("time::sleep(") && !allowed {
                violations.push(format!(
                    "{}:{} - Sleep outside a one-shot timer: {}",
                    file.path.display(),
                    line_number,
                    code.trim()
                ));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE:");
        for (file, reason) in ALLOWED_SLEEP {
            eprintln!("  - {file}: {reason}");
        }
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

/// Periodic loops must use intervals that skip missed ticks
#[test]
fn test_periodic_tasks_use_interval() {
    let sources = production_sources();
    for name in ["poller.rs", "speaker.rs"] {
        let file = sources
            .iter()
            .find(|f| f.path.ends_with(name))
            .unwrap_or_else(|| panic!("{name} not found"));
        let code: Vec<&str> = file.production_lines().map(|(_, c)| c).collect();
        assert!(
            code.iter().any(|c| c.contains("interval")),
            "{name} should drive its loop with tokio::time::interval"
        );
        assert!(
            code.iter().any(|c| c.contains("MissedTickBehavior::Skip")),
            "{name} should skip missed ticks"
        );
    }
}

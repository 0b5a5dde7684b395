//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the enforcement tests under `tests/`:
//! - No blocking I/O inside async code
//! - No sleeping in production code outside one-shot timers
//!
//! The scan is line based. Everything after a `#[cfg(test)]` module header
//! counts as test code, and the enclosing function is found by scanning
//! upwards for the nearest `fn` signature.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const SOURCE_ROOTS: &[&str] = &["showstatus/core/src", "showstatus/daemon/src"];

/// Workspace root, derived from this crate's manifest location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One Rust source file loaded for scanning
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// File contents split into lines
    pub lines: Vec<String>,
    /// Index of the first line of the `#[cfg(test)]` module, if any
    test_start: Option<usize>,
}

impl SourceFile {
    /// Build from in-memory lines
    #[must_use]
    pub fn from_lines(path: impl Into<PathBuf>, lines: &[&str]) -> Self {
        let lines: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
        let test_start = find_test_module(&lines);
        Self {
            path: path.into(),
            lines,
            test_start,
        }
    }

    /// Whether line `idx` is test-only code
    #[must_use]
    pub fn is_test_code(&self, idx: usize) -> bool {
        if self.test_start.is_some_and(|start| idx >= start) {
            return true;
        }
        self.enclosing_fn(idx)
            .is_some_and(|fn_idx| has_test_attribute(&self.lines, fn_idx))
    }

    /// Kind of function enclosing line `idx`
    #[must_use]
    pub fn context(&self, idx: usize) -> FnContext {
        for i in (0..idx).rev() {
            let line = self.lines[i].trim();
            if line.contains("async move {") || line.ends_with("async {") {
                return FnContext::Async;
            }
            if let Some(sig) = fn_signature(line) {
                return if sig.starts_with("async ") {
                    FnContext::Async
                } else {
                    FnContext::Sync
                };
            }
            if is_boundary(line) {
                break;
            }
        }
        FnContext::Module
    }

    /// Production lines as `(line number, code without trailing comment)`
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.is_test_code(*idx))
            .map(|(idx, line)| (idx + 1, strip_comment(line)))
    }

    fn enclosing_fn(&self, idx: usize) -> Option<usize> {
        (0..=idx)
            .rev()
            .find(|&i| fn_signature(self.lines[i].trim()).is_some())
    }
}

/// Where a line sits relative to function bodies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnContext {
    /// Inside an `async fn` or async block
    Async,
    /// Inside a plain `fn`
    Sync,
    /// Module level (imports, consts)
    Module,
}

/// Load every `.rs` file under the production source roots
///
/// # Panics
///
/// Panics if a source root is missing, so a moved crate cannot silently
/// turn the checks into no-ops.
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in SOURCE_ROOTS {
        let base = root.join(dir);
        assert!(base.is_dir(), "source root missing: {}", base.display());
        for entry in walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().collect();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            files.push(SourceFile::from_lines(relative, &lines));
        }
    }
    files
}

/// Drop a trailing `//` comment
#[must_use]
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// The signature text starting at `fn` / `async fn`, if `line` declares one
fn fn_signature(line: &str) -> Option<&str> {
    let mut rest = line;
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }
    (rest.starts_with("fn ") || rest.starts_with("async fn ")).then_some(rest)
}

fn is_boundary(line: &str) -> bool {
    line.starts_with("mod ")
        || line.starts_with("pub mod ")
        || (line.starts_with("impl") && line.ends_with('{'))
}

fn has_test_attribute(lines: &[String], fn_idx: usize) -> bool {
    for i in (0..fn_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if !line.starts_with("#[") && !line.starts_with("///") {
            return false;
        }
    }
    false
}

fn find_test_module(lines: &[String]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(idx, line)| {
        if line.trim() != "#[cfg(test)]" {
            return None;
        }
        let next = lines[idx + 1..].iter().map(|l| l.trim()).find(|l| !l.is_empty())?;
        next.starts_with("mod ").then_some(idx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_fn_detection() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "pub async fn load(&self) -> Result<()> {",
                "    let contents = std::fs::read_to_string(\"file.txt\")?;",
                "}",
            ],
        );
        assert_eq!(file.context(1), FnContext::Async);
    }

    #[test]
    fn test_pub_fn_is_sync() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "pub fn load_config() -> Result<()> {",
                "    let contents = std::fs::read_to_string(\"config.toml\")?;",
                "}",
            ],
        );
        assert_eq!(file.context(1), FnContext::Sync);
    }

    #[test]
    fn test_async_block_inside_sync_fn() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "pub fn post(self: &Arc<Self>) {",
                "    handle.spawn(async move {",
                "        std::fs::write(\"x\", \"y\");",
                "    });",
                "}",
            ],
        );
        assert_eq!(file.context(2), FnContext::Async);
    }

    #[test]
    fn test_cfg_test_module_is_test_code() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "fn real() {}",
                "",
                "#[cfg(test)]",
                "mod tests {",
                "    fn helper() { std::thread::sleep(d); }",
                "}",
            ],
        );
        assert!(!file.is_test_code(0));
        assert!(file.is_test_code(4));
        assert_eq!(file.production_lines().count(), 2);
    }

    #[test]
    fn test_test_attribute_outside_module() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "#[tokio::test(start_paused = true)]",
                "async fn test_countdown() {",
                "    tokio::time::sleep(d).await;",
                "}",
            ],
        );
        assert!(file.is_test_code(2));
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1; // std::fs::read"), "let x = 1; ");
    }
}

// Cache Key Templates
// Renders `${{ ... }}` expressions in cache keys into concrete keys

use super::CacheError;

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Values a key template can refer to
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    /// Root for `hashFiles` patterns
    pub workspace: &'a Path,
    /// Environment the step would run with
    pub env: &'a HashMap<String, String>,
    /// Name of the job rendering the key
    pub job: &'a str,
}

/// Render a key template.
///
/// Supported expressions: `hashFiles('glob', ...)`, `env.NAME`, `runner.os`,
/// `runner.arch` and `job`. Anything else is an error.
pub fn render_key(template: &str, ctx: &KeyContext<'_>) -> Result<String, CacheError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| {
            CacheError::Key(format!("unterminated expression in cache key '{}'", template))
        })?;

        rendered.push_str(&evaluate(after[..end].trim(), ctx)?);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);

    if rendered.trim().is_empty() {
        return Err(CacheError::Key(format!(
            "cache key '{}' renders to an empty string",
            template
        )));
    }

    Ok(rendered)
}

fn evaluate(expression: &str, ctx: &KeyContext<'_>) -> Result<String, CacheError> {
    if let Some(name) = expression.strip_prefix("env.") {
        return Ok(ctx.env.get(name).cloned().unwrap_or_default());
    }

    if let Some(args) = expression
        .strip_prefix("hashFiles(")
        .and_then(|a| a.strip_suffix(')'))
    {
        let patterns = parse_string_args(args)?;
        return hash_files(ctx.workspace, &patterns);
    }

    match expression {
        "runner.os" => Ok(runner_os().to_string()),
        "runner.arch" => Ok(runner_arch().to_string()),
        "job" => Ok(ctx.job.to_string()),
        _ => Err(CacheError::Key(format!(
            "unknown expression '{}' in cache key",
            expression
        ))),
    }
}

/// `'a', "b"` → `["a", "b"]`
fn parse_string_args(args: &str) -> Result<Vec<String>, CacheError> {
    let mut values = Vec::new();

    for raw in args.split(',') {
        let raw = raw.trim();
        let unquoted = raw
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .or_else(|| raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
            .ok_or_else(|| {
                CacheError::Key(format!("hashFiles expects quoted patterns, got '{}'", raw))
            })?;
        values.push(unquoted.to_string());
    }

    if values.iter().all(|v| v.is_empty()) {
        return Err(CacheError::Key("hashFiles needs at least one pattern".to_string()));
    }

    Ok(values)
}

/// SHA-256 over the sorted relative paths and contents of every matching
/// file; empty when nothing matches
pub fn hash_files(workspace: &Path, patterns: &[String]) -> Result<String, CacheError> {
    let root = glob::Pattern::escape(&workspace.to_string_lossy());
    let mut files: BTreeSet<PathBuf> = BTreeSet::new();

    for pattern in patterns.iter().filter(|p| !p.is_empty()) {
        let full = format!("{}/{}", root, pattern);
        let entries = glob::glob(&full)
            .map_err(|e| CacheError::Key(format!("invalid pattern '{}': {}", pattern, e)))?;

        for path in entries.flatten() {
            if path.is_file() {
                if let Ok(relative) = path.strip_prefix(workspace) {
                    files.insert(relative.to_path_buf());
                }
            }
        }
    }

    if files.is_empty() {
        return Ok(String::new());
    }

    let mut hasher = Sha256::new();
    for relative in &files {
        let contents = fs::read(workspace.join(relative))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&contents);
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

fn runner_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "X64",
        "x86" => "X86",
        "aarch64" => "ARM64",
        "arm" => "ARM",
        other => other,
    }
}

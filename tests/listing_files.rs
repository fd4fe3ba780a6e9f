//! Runs every `.lst` file under `tests/listings` and checks the
//! `; EXPECT-*:` directives it carries.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

/// Discovers all .lst files in a directory recursively
fn discover_listings(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(discover_listings(&path));
            } else if path.extension().and_then(|s| s.to_str()) == Some("lst") {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

#[derive(Default)]
struct Expectations {
    size: Option<u32>,
    hot: Option<Vec<u8>>,
    cold: Option<Vec<u8>>,
    labels: Vec<(String, u32)>,
    relocs: Option<usize>,
    error: Option<String>,
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    text.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| format!("bad hex byte '{b}'")))
        .collect()
}

fn parse_expectations(content: &str) -> Result<Expectations, String> {
    let mut exp = Expectations::default();
    for line in content.lines() {
        let Some(rest) = line.trim().strip_prefix("; EXPECT-") else {
            continue;
        };
        let (key, value) = rest
            .split_once(':')
            .ok_or_else(|| format!("malformed directive '{line}'"))?;
        let value = value.trim();
        match key {
            "SIZE" => exp.size = Some(value.parse().map_err(|_| format!("bad size '{value}'"))?),
            "HOT" => exp.hot = Some(parse_hex(value)?),
            "COLD" => exp.cold = Some(parse_hex(value)?),
            "LABEL" => {
                let (name, offset) = value
                    .split_once(' ')
                    .ok_or_else(|| format!("bad label directive '{value}'"))?;
                let offset = offset
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad label offset '{offset}'"))?;
                exp.labels.push((name.to_string(), offset));
            }
            "RELOCS" => {
                exp.relocs = Some(value.parse().map_err(|_| format!("bad count '{value}'"))?)
            }
            "ERROR" => exp.error = Some(value.to_string()),
            other => return Err(format!("unknown directive EXPECT-{other}")),
        }
    }
    Ok(exp)
}

fn run_listing(path: &Path) -> Result<(), String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let exp = parse_expectations(&content)?;

    let method = match (common::emit(&content), &exp.error) {
        (Ok(_), Some(want)) => return Err(format!("expected error containing '{want}'")),
        (Err(err), Some(want)) => {
            let msg = err.to_string();
            return if msg.contains(want.as_str()) {
                Ok(())
            } else {
                Err(format!("error '{msg}' does not mention '{want}'"))
            };
        }
        (Err(err), None) => return Err(format!("emission failed: {err}")),
        (Ok(method), None) => method,
    };
    let out = &method.output;

    if let Some(size) = exp.size {
        if out.code_size != size {
            return Err(format!("code size {} != {size}", out.code_size));
        }
    }
    if let Some(hot) = &exp.hot {
        if &out.hot != hot {
            return Err(format!("hot bytes {:02X?} != {hot:02X?}", out.hot));
        }
    }
    if let Some(cold) = &exp.cold {
        if &out.cold != cold {
            return Err(format!("cold bytes {:02X?} != {cold:02X?}", out.cold));
        }
    }
    for (name, offset) in &exp.labels {
        match method.label_offset(name) {
            Some(got) if got == *offset => {}
            got => return Err(format!("label {name} at {got:?}, expected {offset}")),
        }
    }
    if let Some(count) = exp.relocs {
        if out.relocations.len() != count {
            return Err(format!(
                "{} relocations, expected {count}",
                out.relocations.len()
            ));
        }
    }
    Ok(())
}

#[test]
fn run_listing_files() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/listings");
    let files = discover_listings(&dir);
    assert!(!files.is_empty(), "no listings found in {}", dir.display());

    let mut failures = Vec::new();
    for path in &files {
        if let Err(msg) = run_listing(path) {
            failures.push(format!("{}: {msg}", path.display()));
        }
    }
    assert!(
        failures.is_empty(),
        "{} of {} listings failed:\n{}",
        failures.len(),
        files.len(),
        failures.join("\n")
    );
}

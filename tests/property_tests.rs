//! Property-based tests for twlinst
//!
//! These tests verify:
//! - Marker trimming output and idempotence over generated template files
//! - Marker-free content is never rewritten
//! - Byte formatting unit selection

use proptest::prelude::*;
use std::fs;
use twlinst::byte_count_decimal;
use twlinst::markers::{Transform, apply_dir, transform};

// =============================================================================
// Generated template files
// =============================================================================

#[derive(Debug, Clone)]
enum Block {
    Plain(String),
    TrimLine(String),
    TrimSection(Vec<String>),
    KeptSection(Vec<String>),
}

fn plain_line() -> impl Strategy<Value = String> {
    "[a-z0-9 =;{}.]{0,24}"
}

fn block_strategy() -> impl Strategy<Value = Block> {
    prop_oneof![
        3 => plain_line().prop_map(Block::Plain),
        1 => plain_line().prop_map(Block::TrimLine),
        1 => prop::collection::vec(plain_line(), 0..5).prop_map(Block::TrimSection),
        1 => prop::collection::vec(plain_line(), 0..5).prop_map(Block::KeptSection),
    ]
}

/// Returns (file contents, lines expected to survive, whether anything is trimmed).
fn render(blocks: &[Block]) -> (String, String, bool) {
    let mut input = String::new();
    let mut kept = String::new();
    let mut trims = false;
    let mut push = |line: &str, keep: bool, out: &mut String| {
        input.push_str(line);
        input.push('\n');
        if keep {
            out.push_str(line);
            out.push('\n');
        }
    };
    for block in blocks {
        match block {
            Block::Plain(l) => push(l, true, &mut kept),
            Block::TrimLine(l) => {
                trims = true;
                push(&format!("{} # Line-marker: Trim on install", l), false, &mut kept);
            }
            Block::TrimSection(lines) => {
                trims = true;
                push("# Start-marker: Trim on install", false, &mut kept);
                for l in lines {
                    push(l, false, &mut kept);
                }
                push("# End-marker: Trim on install", false, &mut kept);
            }
            Block::KeptSection(lines) => {
                push("  # Start-marker: Docs", true, &mut kept);
                for l in lines {
                    push(l, true, &mut kept);
                }
                push("  # End-marker: Docs", true, &mut kept);
            }
        }
    }
    (input, kept, trims)
}

proptest! {
    /// Trimming keeps exactly the lines outside trim markers
    #[test]
    fn prop_trim_keeps_unmarked_lines(blocks in prop::collection::vec(block_strategy(), 0..12)) {
        let (input, kept, trims) = render(&blocks);
        let result = transform(&input).unwrap();
        if trims {
            prop_assert_eq!(result, Transform::Rewrite(kept));
        } else {
            prop_assert_eq!(result, Transform::Unchanged);
        }
    }

    /// A trimmed file needs no further trimming
    #[test]
    fn prop_trim_is_idempotent(blocks in prop::collection::vec(block_strategy(), 0..12)) {
        let (input, _, _) = render(&blocks);
        if let Transform::Rewrite(once) = transform(&input).unwrap() {
            prop_assert_eq!(transform(&once).unwrap(), Transform::Unchanged);
        }
    }

    /// Text without markers is left alone
    #[test]
    fn prop_marker_free_text_unchanged(text in "[^#]{0,200}") {
        prop_assert_eq!(transform(&text).unwrap(), Transform::Unchanged);
    }

    /// Larger byte counts never get a smaller unit
    #[test]
    fn prop_byte_units_monotonic(a in any::<u64>(), b in any::<u64>()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(unit_rank(&byte_count_decimal(lo)) <= unit_rank(&byte_count_decimal(hi)));
    }

    /// Values under 1000 are printed exactly
    #[test]
    fn prop_small_byte_counts_exact(n in 0u64..1000) {
        prop_assert_eq!(byte_count_decimal(n), format!("{} B", n));
    }
}

fn unit_rank(formatted: &str) -> usize {
    let unit = formatted.rsplit(' ').next().unwrap_or("");
    ["B", "kB", "MB", "GB", "TB", "PB", "EB"]
        .iter()
        .position(|u| *u == unit)
        .expect("known unit")
}

// =============================================================================
// File-level behaviour
// =============================================================================

#[test]
fn test_marker_free_file_keeps_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.nix");
    fs::write(&path, "{ ... }:\n{\n  # Start-marker: Docs\n  x = 1;\n  # End-marker: Docs\n}\n")
        .unwrap();
    let before = fs::metadata(&path).unwrap().modified().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    assert_eq!(apply_dir(dir.path()).unwrap(), 0);

    let after = fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_apply_dir_twice_changes_nothing_second_time() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("overlay.nix"),
        "a\n# Start-marker: Trim on install\nb\n# End-marker: Trim on install\nc\n",
    )
    .unwrap();
    fs::write(dir.path().join("dev.nix"), "# File-marker: Trim on install\n").unwrap();

    assert_eq!(apply_dir(dir.path()).unwrap(), 2);
    assert_eq!(apply_dir(dir.path()).unwrap(), 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("overlay.nix")).unwrap(),
        "a\nc\n"
    );
    assert!(!dir.path().join("dev.nix").exists());
}

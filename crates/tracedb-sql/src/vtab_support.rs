//! Shared `BestIndex`/`idxStr` plumbing for the `__intrinsic_rollup_tree`
//! and `__intrinsic_pivot` virtual tables (§4.8).
//!
//! Both modules expose the same shape of hidden filter columns (`__sort`,
//! `__expanded_ids`, `__collapsed_ids`, `__offset`, `__limit`, plus
//! rollup-only `__min_depth`/`__max_depth`), any subset of which may appear
//! as an equality constraint in a given query — unlike the table-valued
//! function convention, which always requires every argument. `idxStr`
//! therefore has to *record* which hidden columns were actually supplied
//! and at which `argv` position, mirroring `rollup_tree_operator.cc`'s
//! one-character-per-hidden-column encoding: an ASCII digit gives the
//! `argv` index (base-36, so up to 36 simultaneous constraints), `-` means
//! "not constrained this query".

use rusqlite::vtab::{IndexConstraintOp, IndexInfo};
use std::os::raw::c_int;

/// Walks every hidden column's usable equality constraint, assigns it the
/// next `argv` slot, and returns the `idxStr` encoding `filter` will later
/// decode. `hidden_start` is the zero-based column index of the first
/// hidden column; `hidden_count` is how many follow it contiguously.
pub fn encode_constraints(info: &mut IndexInfo, hidden_start: usize, hidden_count: usize) -> String {
    let mut argv_for_hidden: Vec<Option<c_int>> = vec![None; hidden_count];
    let mut next_argv: c_int = 1;
    for mut usage in info.constraints_and_usages() {
        let col = usage.constraint().column() as usize;
        if col < hidden_start || col >= hidden_start + hidden_count {
            continue;
        }
        if usage.constraint().operator() != IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ
            || !usage.constraint().usable()
        {
            continue;
        }
        let slot = col - hidden_start;
        if argv_for_hidden[slot].is_some() {
            continue; // a column constrained twice; first one wins
        }
        usage.set_argv_index(next_argv);
        usage.set_omit(true);
        argv_for_hidden[slot] = Some(next_argv);
        next_argv += 1;
    }
    argv_for_hidden
        .iter()
        .map(|slot| match slot {
            Some(argv) => std::char::from_digit(*argv as u32, 36).unwrap_or('-'),
            None => '-',
        })
        .collect()
}

/// Decodes an `idxStr` produced by [`encode_constraints`] into, for each
/// hidden column in order, the zero-based index into `filter`'s `args`
/// slice holding its value (or `None` if that hidden column was not
/// constrained this query).
pub fn decode_idx_str(idx_str: &str, hidden_count: usize) -> Vec<Option<usize>> {
    let chars: Vec<char> = idx_str.chars().collect();
    (0..hidden_count)
        .map(|i| {
            chars
                .get(i)
                .and_then(|c| c.to_digit(36))
                .map(|argv| argv as usize - 1)
        })
        .collect()
}

/// Strips one layer of matching `'...'` or `"..."` quoting from a
/// `CREATE VIRTUAL TABLE` positional argument, which SQLite passes through
/// as raw, un-dequoted byte text.
pub fn unquote_vtab_arg(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    let s = s.trim();
    let bytes = s.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"'))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_idx_str_maps_digits_to_argv_positions() {
        let decoded = decode_idx_str("-01", 3);
        assert_eq!(decoded, vec![None, Some(0), Some(1)]);
    }

    #[test]
    fn decode_idx_str_pads_missing_trailing_columns_as_unconstrained() {
        let decoded = decode_idx_str("0", 3);
        assert_eq!(decoded, vec![Some(0), None, None]);
    }

    #[test]
    fn unquote_vtab_arg_strips_single_quotes() {
        assert_eq!(unquote_vtab_arg(b"'src'"), "src");
    }

    #[test]
    fn unquote_vtab_arg_passes_through_bare_tokens() {
        assert_eq!(unquote_vtab_arg(b"src"), "src");
    }
}

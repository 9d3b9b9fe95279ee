//! `@@variable@@` template markers inside package files.
//!
//! The walker splits input into literal and substituted blocks. The lookup
//! callback decides what happens per marker: `Some(bytes)` replaces the
//! marker (possibly with nothing), `None` keeps the original marker text --
//! that is what checksumming uses to hash original bytes while still
//! collecting variable names.

use bytes::Bytes;

/// A variable name is a package name: `[A-Za-z0-9_]+`.
fn valid_variable(name: &[u8]) -> bool {
    !name.is_empty()
        && name
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

fn find_marker(data: &[u8], from: usize) -> Option<usize> {
    data[from..]
        .windows(2)
        .position(|w| w == b"@@")
        .map(|i| from + i)
}

/// Expand all markers in `input` through `lookup`. Returns the sequence of
/// blocks, alternating literals and substitutions; concatenating them gives
/// the expanded document.
pub fn expand<F>(input: &[u8], mut lookup: F) -> Vec<Bytes>
where
    F: FnMut(&str) -> Option<Bytes>,
{
    let mut blocks = Vec::new();
    let mut position = 0;

    while position < input.len() {
        let Some(start) = find_marker(input, position) else {
            blocks.push(Bytes::copy_from_slice(&input[position..]));
            break;
        };
        let Some(end) = find_marker(input, start + 2) else {
            // Unterminated marker: the rest is literal.
            blocks.push(Bytes::copy_from_slice(&input[position..]));
            break;
        };

        let name = &input[start + 2..end];
        if !valid_variable(name) {
            // Not a marker after all; emit through the first `@@` and keep
            // scanning right behind it.
            blocks.push(Bytes::copy_from_slice(&input[position..start + 2]));
            position = start + 2;
            continue;
        }

        let name = std::str::from_utf8(name).expect("alphanumeric ASCII");
        match lookup(name) {
            Some(replacement) => {
                if start > position {
                    blocks.push(Bytes::copy_from_slice(&input[position..start]));
                }
                if !replacement.is_empty() {
                    blocks.push(replacement);
                }
            }
            None => {
                // Keep the original text, marker included.
                blocks.push(Bytes::copy_from_slice(&input[position..end + 2]));
            }
        }
        position = end + 2;
    }

    blocks
}

/// Concatenate expanded blocks (mostly for tests and checksumming).
pub fn expand_to_vec<F>(input: &[u8], lookup: F) -> Vec<u8>
where
    F: FnMut(&str) -> Option<Bytes>,
{
    let blocks = expand(input, lookup);
    let mut out = Vec::with_capacity(input.len());
    for block in blocks {
        out.extend_from_slice(&block);
    }
    out
}

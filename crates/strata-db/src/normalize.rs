//! Canonical form of SQL text for hashing.
//!
//! The canonical form ignores case, whitespace and comments, so a migration
//! can be reformatted or annotated after it has been applied without being
//! reported as drifted. It is only ever hashed, never executed.

use sha2::{Digest, Sha256};

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    LineComment,
    BlockComment,
}

/// Canonicalize `sql` for hashing.
///
/// Line endings are unified and the text lower-cased; whitespace is dropped
/// entirely; `--` line comments and (nested) `/* */` block comments are
/// removed. A block comment left open at end of input is closed implicitly.
/// Semicolons at the very end of the result are dropped, so a trailing
/// terminator never changes the hash.
///
/// The result is a fixed point: `normalize(&normalize(x)) == normalize(x)`.
/// Where dropping a separator would fuse `- -` or `/ *` into a comment
/// opener, a single space is kept between them.
pub fn normalize(sql: &str) -> String {
    let text = sql.replace("\r\n", "\n").replace('\r', "\n").to_lowercase();

    let mut out = String::with_capacity(text.len());
    let mut state = State::Normal;
    let mut depth = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    depth = 1;
                }
                c if c.is_whitespace() => {}
                c => push_separated(&mut out, c),
            },
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => match c {
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    depth += 1;
                }
                '*' if chars.peek() == Some(&'/') => {
                    chars.next();
                    depth -= 1;
                    if depth == 0 {
                        state = State::Normal;
                    }
                }
                _ => {}
            },
        }
    }

    let kept = out.trim_end_matches(';').len();
    out.truncate(kept);
    out
}

/// Append `c`, keeping one space if it would otherwise open a comment
/// together with the previous character. Adjacent openers in the input are
/// always consumed as comments, so reaching here means they were separated.
fn push_separated(out: &mut String, c: char) {
    if matches!((out.chars().next_back(), c), (Some('-'), '-') | (Some('/'), '*')) {
        out.push(' ');
    }
    out.push(c);
}

/// Hex-encoded SHA-256 of the canonical form of `sql`.
pub fn content_hash(sql: &str) -> String {
    hash_normalized(&normalize(sql))
}

/// Hex-encoded SHA-256 of text that is already canonical.
pub fn hash_normalized(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

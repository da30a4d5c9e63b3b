//! SQL query fingerprinting.
//!
//! Semantically-equivalent queries must land in one metrics bucket, so the
//! subtarget stored for SQL-family records is a short digest of the query's
//! normalized form: literals replaced by `?`, comments stripped, whitespace
//! collapsed, lowercased. The original text is kept once per digest for
//! display.

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Normalize a query: string and numeric literals become `?`, comments are
/// dropped, whitespace collapses to single spaces, and everything is
/// lowercased.
pub fn fingerprint(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                consume_string(&mut chars, c);
                push(&mut out, &mut pending_space, '?');
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            c if c.is_whitespace() => pending_space = true,
            c if c.is_ascii_digit() && (pending_space || !ends_with_ident(&out)) => {
                // number literal, including decimals, exponents and hex
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '.' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                push(&mut out, &mut pending_space, '?');
            }
            c => {
                for lower in c.to_lowercase() {
                    push(&mut out, &mut pending_space, lower);
                }
            }
        }
    }

    out
}

/// Stable digest of a normalized query: first 8 bytes of its SHA-256,
/// upper-case hex.
pub fn digest(normalized: &str) -> String {
    let hash = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &hash[..8] {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

fn push(out: &mut String, pending_space: &mut bool, c: char) {
    if *pending_space {
        if !out.is_empty() {
            out.push(' ');
        }
        *pending_space = false;
    }
    out.push(c);
}

fn ends_with_ident(out: &str) -> bool {
    out.chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn consume_string(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, quote: char) {
    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == quote {
            // doubled quote is an escaped quote, not the end
            if chars.peek() == Some(&quote) {
                chars.next();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_literals_are_replaced() {
        assert_eq!(
            fingerprint("SELECT * FROM t WHERE id=1"),
            "select * from t where id=?"
        );
        assert_eq!(
            fingerprint("SELECT * FROM t WHERE id = 123 AND x = 4.5e2"),
            "select * from t where id = ? and x = ?"
        );
    }

    #[test]
    fn distinct_literals_share_a_digest() {
        let a = fingerprint("SELECT * FROM t WHERE id=1");
        let b = fingerprint("SELECT * FROM t WHERE id=2");
        assert_eq!(a, b);
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn string_literals_are_replaced() {
        assert_eq!(
            fingerprint("SELECT * FROM t WHERE name='O''Brien' AND city=\"NY\""),
            "select * from t where name=? and city=?"
        );
    }

    #[test]
    fn identifiers_with_digits_survive() {
        assert_eq!(
            fingerprint("SELECT c1 FROM t2 WHERE c1=7"),
            "select c1 from t2 where c1=?"
        );
    }

    #[test]
    fn whitespace_and_comments_collapse() {
        assert_eq!(
            fingerprint("SELECT *\n  FROM t -- trailing\n WHERE /* inline */ id=3"),
            "select * from t where id=?"
        );
    }

    #[test]
    fn bare_literals_after_keywords_are_replaced() {
        assert_eq!(fingerprint("SELECT 1"), "select ?");
        assert_eq!(
            fingerprint("SELECT * FROM t LIMIT 10"),
            "select * from t limit ?"
        );
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = digest("select ?");
        assert_eq!(d.len(), 16);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, digest("select ?"));
    }
}

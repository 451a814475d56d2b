//! ServerQuery escaping.
//!
//! Keys and values on the wire may not contain the protocol's separators, so
//! eleven characters travel as two-character escapes:
//!
//! | char | escape |
//! |------|--------|
//! | `\`  | `\\`   |
//! | `/`  | `\/`   |
//! | space | `\s`  |
//! | `\|` | `\p`   |
//! | BEL  | `\a`   |
//! | BS   | `\b`   |
//! | FF   | `\f`   |
//! | LF   | `\n`   |
//! | CR   | `\r`   |
//! | TAB  | `\t`   |
//! | VT   | `\v`   |

use tsq_core::QueryError;

/// `(raw, escape letter)` pairs.
const ESCAPES: [(char, char); 11] = [
    ('\\', '\\'),
    ('/', '/'),
    (' ', 's'),
    ('|', 'p'),
    ('\u{07}', 'a'),
    ('\u{08}', 'b'),
    ('\u{0C}', 'f'),
    ('\n', 'n'),
    ('\r', 'r'),
    ('\t', 't'),
    ('\u{0B}', 'v'),
];

fn escape_letter(raw: char) -> Option<char> {
    ESCAPES.iter().find(|(r, _)| *r == raw).map(|(_, e)| *e)
}

fn unescape_letter(letter: char) -> Option<char> {
    ESCAPES.iter().find(|(_, e)| *e == letter).map(|(r, _)| *r)
}

/// Escape `raw` for the wire.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match escape_letter(ch) {
            Some(letter) => {
                out.push('\\');
                out.push(letter);
            }
            None => out.push(ch),
        }
    }
    out
}

/// Reverse [`escape`].
///
/// Fails on an unknown escape letter or a trailing lone backslash.
pub fn unescape(escaped: &str) -> Result<String, QueryError> {
    if !escaped.contains('\\') {
        return Ok(escaped.to_string());
    }

    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(letter) = chars.next() else {
            return Err(QueryError::DecodeFailure(format!(
                "dangling escape at end of {escaped:?}"
            )));
        };
        match unescape_letter(letter) {
            Some(raw) => out.push(raw),
            None => {
                return Err(QueryError::DecodeFailure(format!(
                    "unknown escape sequence \\{letter} in {escaped:?}"
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn escapes_server_name() {
        assert_eq!(escape("TeamSpeak ]|[ Server"), r"TeamSpeak\s]\p[\sServer");
    }

    #[test]
    fn escapes_every_special_char() {
        let raw = "\\/ |\u{07}\u{08}\u{0C}\n\r\t\u{0B}";
        assert_eq!(escape(raw), r"\\\/\s\p\a\b\f\n\r\t\v");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(escape("serveradmin"), "serveradmin");
        assert_eq!(unescape("serveradmin").unwrap(), "serveradmin");
    }

    #[test]
    fn non_ascii_passes_through() {
        assert_eq!(escape("Grüße 🎧"), r"Grüße\s🎧");
        assert_eq!(unescape(r"Grüße\s🎧").unwrap(), "Grüße 🎧");
    }

    #[test]
    fn empty_string() {
        assert_eq!(escape(""), "");
        assert_eq!(unescape("").unwrap(), "");
    }

    #[test]
    fn adjacent_escapes() {
        assert_eq!(unescape(r"\s\s\p\\").unwrap(), "  |\\");
        assert_eq!(escape("  |\\"), r"\s\s\p\\");
    }

    #[test]
    fn unknown_escape_fails() {
        assert_matches!(unescape(r"bad\q"), Err(QueryError::DecodeFailure(msg)) if msg.contains(r"\q"));
    }

    #[test]
    fn dangling_backslash_fails() {
        assert_matches!(unescape("oops\\"), Err(QueryError::DecodeFailure(_)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn special_heavy() -> impl Strategy<Value = String> {
            proptest::collection::vec(
                prop_oneof![
                    Just('\\'),
                    Just('/'),
                    Just(' '),
                    Just('|'),
                    Just('\u{07}'),
                    Just('\u{08}'),
                    Just('\u{0C}'),
                    Just('\n'),
                    Just('\r'),
                    Just('\t'),
                    Just('\u{0B}'),
                    any::<char>(),
                ],
                0..48,
            )
            .prop_map(|chars| chars.into_iter().collect())
        }

        proptest! {
            #[test]
            fn unescape_inverts_escape(raw in special_heavy()) {
                prop_assert_eq!(unescape(&escape(&raw)).unwrap(), raw);
            }

            #[test]
            fn escape_inverts_unescape(raw in special_heavy()) {
                let escaped = escape(&raw);
                prop_assert_eq!(escape(&unescape(&escaped).unwrap()), escaped);
            }

            #[test]
            fn escaped_text_has_no_separators(raw in special_heavy()) {
                let escaped = escape(&raw);
                prop_assert!(!escaped.contains(' '));
                prop_assert!(!escaped.contains('|'));
                prop_assert!(!escaped.contains('\n'));
            }
        }
    }
}

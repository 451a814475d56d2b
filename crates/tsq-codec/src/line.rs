//! Parsing of a single protocol line into records.
//!
//! ```text
//! notifyclientleftview cfid=1 ctid=0 reasonid=8 reasonmsg=leaving clid=5
//! cid=1 pid=0 channel_name=Lobby|cid=2 pid=0 channel_name=AFK
//! error id=0 msg=ok
//! ```
//!
//! Segments are split on `|`, tokens on spaces, and each token on its first
//! `=`. The first token of the first segment names the command when it has
//! no `=`; any other bare token is a flag with an empty value.

use tsq_core::{QueryError, Record};

use crate::escape::{escape, unescape};

/// One parsed line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedLine {
    /// Leading bare token of the first segment, if any.
    pub command: Option<String>,
    /// One record per `|`-separated segment, in order. The command token is
    /// not part of the first record.
    pub records: Vec<Record>,
}

/// Parse a line (without its terminator).
pub fn parse_line(line: &str) -> Result<ParsedLine, QueryError> {
    let mut parsed = ParsedLine::default();

    for (segment_index, segment) in line.split('|').enumerate() {
        let mut record = Record::new();
        let tokens = segment.split(' ').filter(|t| !t.is_empty());

        for (token_index, token) in tokens.enumerate() {
            match token.split_once('=') {
                Some((key, value)) => record.insert(unescape(key)?, unescape(value)?),
                None if segment_index == 0 && token_index == 0 => {
                    parsed.command = Some(unescape(token)?);
                }
                None => record.insert(unescape(token)?, String::new()),
            }
        }
        parsed.records.push(record);
    }

    Ok(parsed)
}

/// Render a request as one wire line, without the terminator.
///
/// Flags gain a leading `-` when they do not already have one.
pub fn encode_request(request: &tsq_core::Request) -> String {
    let mut line = escape(request.command());
    for (key, value) in request.params() {
        line.push(' ');
        line.push_str(&escape(key));
        line.push('=');
        line.push_str(&escape(value));
    }
    for flag in request.flags() {
        line.push(' ');
        if !flag.starts_with('-') {
            line.push('-');
        }
        line.push_str(&escape(flag));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tsq_core::Request;

    #[test]
    fn status_line() {
        let parsed = parse_line(r"error id=256 msg=command\snot\sfound").unwrap();
        assert_eq!(parsed.command.as_deref(), Some("error"));
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].get("id"), Some("256"));
        assert_eq!(parsed.records[0].get("msg"), Some("command not found"));
    }

    #[test]
    fn data_line_with_segments() {
        let parsed = parse_line("cid=1 pid=0|cid=2 pid=0").unwrap();
        assert!(parsed.command.is_none());
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[1].get("cid"), Some("2"));
    }

    #[test]
    fn bare_tokens_after_first_are_flags() {
        let parsed = parse_line("clientlist -uid -away").unwrap();
        assert_eq!(parsed.command.as_deref(), Some("clientlist"));
        assert_eq!(parsed.records[0].get("-uid"), Some(""));
        assert_eq!(parsed.records[0].get("-away"), Some(""));
    }

    #[test]
    fn bare_token_in_later_segment_is_flag() {
        let parsed = parse_line("cid=1|virtual").unwrap();
        assert!(parsed.command.is_none());
        assert_eq!(parsed.records[1].get("virtual"), Some(""));
    }

    #[test]
    fn data_line_starting_with_pair_has_no_command() {
        let parsed = parse_line("virtualserver_name=Test flag").unwrap();
        assert!(parsed.command.is_none());
        assert_eq!(parsed.records[0].get("flag"), Some(""));
    }

    #[test]
    fn splits_on_first_equals_only() {
        let parsed = parse_line("msg=a=b").unwrap();
        assert_eq!(parsed.records[0].get("msg"), Some("a=b"));
    }

    #[test]
    fn empty_value_and_repeated_spaces() {
        let parsed = parse_line("client_description=  clid=3").unwrap();
        assert_eq!(parsed.records[0].get("client_description"), Some(""));
        assert_eq!(parsed.records[0].get("clid"), Some("3"));
    }

    #[test]
    fn bad_escape_is_decode_failure() {
        assert_matches!(parse_line(r"name=a\xb"), Err(QueryError::DecodeFailure(_)));
    }

    #[test]
    fn encodes_params_and_flags() {
        let req = Request::builder("sendtextmessage")
            .param("targetmode", 3)
            .param("target", 1)
            .param("msg", "hello there | friend")
            .flag("uid")
            .flag("-away")
            .build();
        assert_eq!(
            encode_request(&req),
            r"sendtextmessage targetmode=3 target=1 msg=hello\sthere\s\p\sfriend -uid -away"
        );
    }

    #[test]
    fn encoded_request_parses_back() {
        let req = Request::builder("login")
            .param("client_login_name", "server admin")
            .param("client_login_password", "p/w")
            .build();
        let parsed = parse_line(&encode_request(&req)).unwrap();
        assert_eq!(parsed.command.as_deref(), Some("login"));
        assert_eq!(parsed.records[0].get("client_login_name"), Some("server admin"));
        assert_eq!(parsed.records[0].get("client_login_password"), Some("p/w"));
    }
}

//! Packet codec for the line-oriented device protocol.
//!
//! One line is one packet: `CMD (KEY:VALUE)*`, space-separated tokens. A
//! token containing a space is wrapped in double quotes; embedded quotes are
//! not supported. Decoding runs a three-state tokenizer (command, key,
//! value) ported from the original driver's `proto.go`/`encoder.go`.

use std::collections::HashMap;
use std::fmt;

/// A decoded (or to-be-encoded) packet: a command token plus an unordered
/// set of string arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub cmd: String,
    pub args: HashMap<String, String>,
}

impl Packet {
    pub fn new(cmd: impl Into<String>) -> Self {
        Packet {
            cmd: cmd.into(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("empty command")]
    EmptyCommand,
    #[error("unexpected space in key")]
    UnexpectedSpaceInKey,
    #[error("unclosed quote")]
    UnclosedQuote,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TokenizerState {
    Command,
    Key,
    Value,
}

/// Decode one line into a [`Packet`].
///
/// Fails on an empty command, an unescaped space inside an unquoted key, or
/// an unclosed quote at end of line.
pub fn decode(line: &str) -> Result<Packet, CodecError> {
    let mut state = TokenizerState::Command;
    let mut cmd = String::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut args = HashMap::new();
    let mut in_quote = false;

    for c in line.chars() {
        match state {
            TokenizerState::Command => {
                if c == ' ' {
                    state = TokenizerState::Key;
                } else {
                    cmd.push(c);
                }
            }
            TokenizerState::Key => match c {
                '"' => in_quote = !in_quote,
                ' ' => {
                    if !in_quote {
                        return Err(CodecError::UnexpectedSpaceInKey);
                    }
                    key.push(c);
                }
                ':' => {
                    if in_quote {
                        return Err(CodecError::UnclosedQuote);
                    }
                    state = TokenizerState::Value;
                }
                _ => key.push(c),
            },
            TokenizerState::Value => match c {
                '"' => in_quote = !in_quote,
                ' ' if !in_quote => {
                    args.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                    state = TokenizerState::Key;
                }
                _ => value.push(c),
            },
        }
    }

    if in_quote {
        return Err(CodecError::UnclosedQuote);
    }
    if !key.is_empty() || state == TokenizerState::Value {
        args.insert(key, value);
    }
    if cmd.is_empty() {
        return Err(CodecError::EmptyCommand);
    }

    Ok(Packet { cmd, args })
}

/// Encode a packet to its wire line. Argument order is not semantically
/// significant but is emitted sorted by key for deterministic output.
pub fn encode(p: &Packet) -> String {
    let mut tokens = Vec::with_capacity(p.args.len() + 1);
    tokens.push(p.cmd.clone());

    let mut keys: Vec<&String> = p.args.keys().collect();
    keys.sort();
    for k in keys {
        let v = &p.args[k];
        tokens.push(format!("{}:{}", sanitize(k), sanitize(v)));
    }
    tokens.join(" ")
}

/// Quote a token iff it contains a space, or is empty (so an empty value
/// still round-trips instead of being swallowed by the space-splitting
/// decoder).
fn sanitize(s: &str) -> String {
    if s.is_empty() || s.contains(' ') {
        format!("\"{}\"", s)
    } else {
        s.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple_set() {
        let p = Packet::new("set")
            .with_arg("name", "gpio.0")
            .with_arg("value", "true")
            .with_arg("disconnect", "true");
        let line = encode(&p);
        assert!(line.starts_with("set "));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn decode_handshake_line() {
        let p = decode("info id:esp-1 model:m1 hw:1.0 fw:2.3").unwrap();
        assert_eq!(p.cmd, "info");
        assert_eq!(p.arg("id"), Some("esp-1"));
        assert_eq!(p.arg("fw"), Some("2.3"));
    }

    #[test]
    fn decode_quoted_value_with_space() {
        let p = decode("attr name:config.name value:\"lab light\"").unwrap();
        assert_eq!(p.arg("value"), Some("lab light"));
    }

    #[test]
    fn decode_bare_command_no_args() {
        let p = decode("ok").unwrap();
        assert_eq!(p.cmd, "ok");
        assert!(p.args.is_empty());
    }

    #[test]
    fn decode_empty_command_errors() {
        assert_eq!(decode(""), Err(CodecError::EmptyCommand));
        assert_eq!(decode(" foo:bar"), Err(CodecError::EmptyCommand));
    }

    #[test]
    fn decode_unclosed_quote_errors() {
        assert_eq!(
            decode("set name:\"gpio 0"),
            Err(CodecError::UnclosedQuote)
        );
    }

    #[test]
    fn decode_unescaped_space_in_key_errors() {
        assert_eq!(
            decode("set na me:foo"),
            Err(CodecError::UnexpectedSpaceInKey)
        );
    }

    #[test]
    fn encode_wraps_tokens_containing_spaces() {
        let p = Packet::new("set").with_arg("name", "lab light");
        let line = encode(&p);
        assert_eq!(line, "set name:\"lab light\"");
    }

    #[test]
    fn encode_wraps_empty_value() {
        let p = Packet::new("set").with_arg("name", "");
        let line = encode(&p);
        assert_eq!(line, "set name:\"\"");
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.arg("name"), Some(""));
    }

    #[test]
    fn encode_is_deterministic_across_calls() {
        let p = Packet::new("set")
            .with_arg("b", "2")
            .with_arg("a", "1")
            .with_arg("c", "3");
        assert_eq!(encode(&p), encode(&p));
        assert_eq!(encode(&p), "set a:1 b:2 c:3");
    }

    #[test]
    fn trailing_key_without_following_space_is_accepted() {
        let p = decode("ping extra:1").unwrap();
        assert_eq!(p.arg("extra"), Some("1"));
    }
}

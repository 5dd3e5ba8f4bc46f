//! Out-of-band sentinel decoding for remote shell output.
//!
//! The execution environment interleaves human-readable output with
//! escape-sequence markers of the form `ESC ] <opcode> ; <name>
//! [=<value>] BEL`. The decoder separates the two, tolerating a marker
//! split across read boundaries, and never classifies a textual
//! lookalike outside the exact grammar as a sentinel.

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';
/// A pending candidate longer than this is flushed as literal text.
const MAX_SENTINEL_LEN: usize = 256;

/// Opcode used by the execution environment for completion sentinels.
pub const EXIT_OPCODE: u32 = 654;
/// Sentinel name that carries the command's exit code.
pub const EXIT_NAME: &str = "exit";

/// One decoded unit of the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelToken {
    /// A run of displayable text.
    Text(String),
    Sentinel {
        opcode: u32,
        name: String,
        value: Option<i64>,
    },
    /// Raw bytes of an escape sequence still unterminated when the
    /// stream ended. Surfaced, never silently dropped.
    Incomplete(String),
}

/// Progress through the escape grammar for the buffered candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Esc,
    Opcode,
    Name,
    Value,
}

/// Incremental sentinel decoder. `feed` is a synchronous, non-reentrant
/// transition, same discipline as the action scanner.
#[derive(Debug)]
pub struct SentinelDecoder {
    pending: String,
    phase: Phase,
}

impl Default for SentinelDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            phase: Phase::Esc,
        }
    }

    /// Decode the next read increment into text runs and sentinels.
    pub fn feed(&mut self, chunk: &str) -> Vec<SentinelToken> {
        let mut tokens = Vec::new();
        let mut text = String::new();
        for ch in chunk.chars() {
            self.push_char(ch, &mut text, &mut tokens);
        }
        if !text.is_empty() {
            tokens.push(SentinelToken::Text(text));
        }
        tokens
    }

    /// Signal end of stream; a buffered partial sequence is surfaced as
    /// [`SentinelToken::Incomplete`].
    pub fn finish(&mut self) -> Option<SentinelToken> {
        self.phase = Phase::Esc;
        if self.pending.is_empty() {
            None
        } else {
            Some(SentinelToken::Incomplete(std::mem::take(&mut self.pending)))
        }
    }

    fn push_char(&mut self, ch: char, text: &mut String, tokens: &mut Vec<SentinelToken>) {
        if self.pending.is_empty() {
            if ch == ESC {
                self.pending.push(ch);
                self.phase = Phase::Esc;
            } else {
                text.push(ch);
            }
            return;
        }

        if self.pending.len() >= MAX_SENTINEL_LEN {
            self.reject(ch, text, tokens);
            return;
        }

        let accepted = match self.phase {
            Phase::Esc => {
                // Pending is exactly ESC; only `]` continues the grammar.
                if self.pending.len() == 1 && ch == ']' {
                    self.phase = Phase::Opcode;
                    true
                } else {
                    false
                }
            }
            Phase::Opcode => {
                if ch.is_ascii_digit() {
                    true
                } else if ch == ';' && self.pending.chars().last() != Some(']') {
                    self.phase = Phase::Name;
                    true
                } else {
                    false
                }
            }
            Phase::Name => {
                let has_name = !self.pending.ends_with(';');
                if ch == BEL {
                    if has_name {
                        self.complete(tokens, text);
                    } else {
                        self.reject(ch, text, tokens);
                    }
                    return;
                }
                if ch == '=' {
                    if has_name {
                        self.phase = Phase::Value;
                        true
                    } else {
                        false
                    }
                } else {
                    !ch.is_control()
                }
            }
            Phase::Value => {
                if ch == BEL {
                    if self.pending.ends_with(|c: char| c.is_ascii_digit()) {
                        self.complete(tokens, text);
                    } else {
                        self.reject(ch, text, tokens);
                    }
                    return;
                }
                ch.is_ascii_digit() || (ch == '-' && self.pending.ends_with('='))
            }
        };

        if accepted {
            self.pending.push(ch);
        } else {
            self.reject(ch, text, tokens);
        }
    }

    /// The candidate turned out not to be a sentinel: its raw bytes are
    /// ordinary text. `ch` is reprocessed since it may start a new one.
    fn reject(&mut self, ch: char, text: &mut String, tokens: &mut Vec<SentinelToken>) {
        text.push_str(&std::mem::take(&mut self.pending));
        self.phase = Phase::Esc;
        self.push_char(ch, text, tokens);
    }

    /// BEL terminated a well-formed sequence; emit the preceding text
    /// run and the sentinel, in stream order.
    fn complete(&mut self, tokens: &mut Vec<SentinelToken>, text: &mut String) {
        let raw = std::mem::take(&mut self.pending);
        self.phase = Phase::Esc;
        let Some(parsed) = parse_sentinel(&raw) else {
            // Unreachable by construction; keep the bytes visible anyway.
            text.push_str(&raw);
            return;
        };
        if !text.is_empty() {
            tokens.push(SentinelToken::Text(std::mem::take(text)));
        }
        tokens.push(parsed);
    }
}

/// Parse a complete candidate (without the trailing BEL).
fn parse_sentinel(raw: &str) -> Option<SentinelToken> {
    let body = raw.strip_prefix(ESC)?.strip_prefix(']')?;
    let (opcode, rest) = body.split_once(';')?;
    let opcode = opcode.parse::<u32>().ok()?;
    let (name, value) = match rest.split_once('=') {
        Some((name, value)) => (name, Some(value.parse::<i64>().ok()?)),
        None => (rest, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(SentinelToken::Sentinel {
        opcode,
        name: name.to_string(),
        value,
    })
}

/// Encode a sentinel in the wire grammar. Inverse of the decoder for
/// all printable names and integer values.
#[must_use]
pub fn encode(opcode: u32, name: &str, value: Option<i64>) -> String {
    match value {
        Some(value) => format!("{ESC}]{opcode};{name}={value}{BEL}"),
        None => format!("{ESC}]{opcode};{name}{BEL}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(decoder: &mut SentinelDecoder, input: &str) -> Vec<SentinelToken> {
        let mut tokens = decoder.feed(input);
        tokens.extend(decoder.finish());
        tokens
    }

    #[test]
    fn splits_text_and_exit_sentinel() {
        let mut decoder = SentinelDecoder::new();
        let input = format!("Installed.\n{}", encode(654, "exit", Some(0)));
        let tokens = decode_all(&mut decoder, &input);
        assert_eq!(
            tokens,
            vec![
                SentinelToken::Text("Installed.\n".into()),
                SentinelToken::Sentinel {
                    opcode: 654,
                    name: "exit".into(),
                    value: Some(0),
                },
            ]
        );
    }

    #[test]
    fn sentinel_split_across_reads_is_buffered() {
        let mut decoder = SentinelDecoder::new();
        let encoded = encode(654, "exit", Some(42));
        let (a, b) = encoded.split_at(5);
        let mut tokens = decoder.feed(a);
        assert!(tokens.is_empty());
        tokens.extend(decoder.feed(b));
        assert_eq!(
            tokens,
            vec![SentinelToken::Sentinel {
                opcode: 654,
                name: "exit".into(),
                value: Some(42),
            }]
        );
    }

    #[test]
    fn round_trip_holds_for_names_and_values() {
        for (name, value) in [
            ("exit", Some(0)),
            ("exit", Some(137)),
            ("ready", None),
            ("checkpoint-1", Some(-3)),
        ] {
            let mut decoder = SentinelDecoder::new();
            let tokens = decode_all(&mut decoder, &encode(7, name, value));
            assert_eq!(
                tokens,
                vec![SentinelToken::Sentinel {
                    opcode: 7,
                    name: name.into(),
                    value,
                }]
            );
        }
    }

    #[test]
    fn textual_lookalikes_stay_text() {
        let mut decoder = SentinelDecoder::new();
        let tokens = decode_all(&mut decoder, "plain ]654;exit=0 text\x07");
        assert_eq!(
            tokens,
            vec![SentinelToken::Text("plain ]654;exit=0 text\x07".into())]
        );
    }

    #[test]
    fn invalid_escape_bytes_are_reemitted_verbatim() {
        let mut decoder = SentinelDecoder::new();
        let tokens = decode_all(&mut decoder, "a\x1b[31mred\x1b[0m b");
        let text: String = tokens
            .iter()
            .map(|t| match t {
                SentinelToken::Text(t) => t.clone(),
                _ => panic!("unexpected sentinel"),
            })
            .collect();
        assert_eq!(text, "a\x1b[31mred\x1b[0m b");
    }

    #[test]
    fn unterminated_sentinel_surfaces_as_incomplete() {
        let mut decoder = SentinelDecoder::new();
        let mut tokens = decoder.feed("out\x1b]654;exi");
        assert_eq!(tokens, vec![SentinelToken::Text("out".into())]);
        tokens.extend(decoder.finish());
        assert_eq!(
            tokens[1],
            SentinelToken::Incomplete("\x1b]654;exi".into())
        );
    }

    #[test]
    fn back_to_back_sentinels_preserve_order() {
        let mut decoder = SentinelDecoder::new();
        let input = format!(
            "{}mid{}",
            encode(654, "ready", None),
            encode(654, "exit", Some(1))
        );
        let tokens = decode_all(&mut decoder, &input);
        assert_eq!(tokens.len(), 3);
        assert!(matches!(&tokens[0], SentinelToken::Sentinel { name, .. } if name == "ready"));
        assert_eq!(tokens[1], SentinelToken::Text("mid".into()));
        assert!(matches!(&tokens[2], SentinelToken::Sentinel { name, .. } if name == "exit"));
    }
}

//! Minimal HTML entity decoding for action bodies and attribute values.
//!
//! The markup only promises the five named entities plus numeric
//! references; anything else passes through verbatim.

/// Longest entity we will ever hold back: `&#x10FFFF;`.
const MAX_ENTITY_LEN: usize = 10;

/// Decode entity references in `text`. Unrecognized or malformed
/// references are kept verbatim.
pub fn decode(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match decode_one(tail) {
            Some((ch, consumed)) => {
                out.push_str(&ch);
                rest = &tail[consumed..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode a single reference at the start of `text` (which begins with
/// `&`). Returns the replacement and the number of bytes consumed.
fn decode_one(text: &str) -> Option<(String, usize)> {
    let semi = text.find(';')?;
    if semi < 2 || semi >= MAX_ENTITY_LEN {
        return None;
    }
    let body = &text[1..semi];
    let decoded = match body {
        "lt" => '<'.to_string(),
        "gt" => '>'.to_string(),
        "amp" => '&'.to_string(),
        "quot" => '"'.to_string(),
        _ => {
            let digits = body.strip_prefix('#')?;
            let code = if let Some(hex) = digits.strip_prefix('x').or_else(|| digits.strip_prefix('X')) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                digits.parse::<u32>().ok()?
            };
            char::from_u32(code)?.to_string()
        }
    };
    Some((decoded, semi + 1))
}

/// Length of the longest prefix of `text` that is safe to decode now:
/// a trailing `&…` that could still grow into a complete entity is held
/// back so a reference split across chunk boundaries is never mangled.
pub fn safe_prefix_len(text: &str) -> usize {
    let Some(amp) = text.rfind('&') else {
        return text.len();
    };
    let tail = &text[amp..];
    if tail.contains(';') || tail.len() > MAX_ENTITY_LEN {
        return text.len();
    }
    // Only hold back if every byte so far could still be part of a
    // reference; "1 & 2" must not stall the stream.
    let plausible = tail[1..]
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'#');
    if plausible { amp } else { text.len() }
}

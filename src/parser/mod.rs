//! Incremental scanner for the embedded action markup.
//!
//! The model's output arrives in arbitrarily sized fragments; the scanner
//! recognizes `<action …>…</action>` markers across fragment boundaries
//! and emits lifecycle events as soon as they become unambiguous. The
//! same overall text must produce the same event sequence no matter how
//! it was chunked, so anything that could still grow into a marker (or an
//! entity reference) is held back in the buffer instead of being emitted.
//!
//! Parse state is an explicit enum plus accumulation buffers, never
//! recursive descent: a suspended parse can be resumed from the struct
//! alone when the next fragment arrives.

pub mod entities;

use crate::actions::{
    ActionEvent, ActionHeader, ActionId, ActionKind, ActionPayload, ActionTag, Edit,
};

/// Opening marker prefix; the full marker runs through the matching `>`.
const OPEN_PREFIX: &str = "<action";
const CLOSE_MARKER: &str = "</action>";
const BEFORE_OPEN: &str = "<before>";
const BEFORE_CLOSE: &str = "</before>";
const AFTER_OPEN: &str = "<after>";
const AFTER_CLOSE: &str = "</after>";
/// Verbatim passthrough toggle; markers inside a fenced region are plain
/// text, never re-interpreted.
const FENCE: &str = "```";
/// Attribute sections longer than this are literal text, not markers.
const MAX_HEADER_LEN: usize = 512;

/// Append-only text accumulator with a cursor marking the last fully
/// processed offset. Owns any partially matched marker fragment until it
/// can be resolved.
#[derive(Debug, Default)]
struct StreamBuffer {
    data: String,
    cursor: usize,
}

impl StreamBuffer {
    fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
    }

    fn rest(&self) -> &str {
        &self.data[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
        debug_assert!(self.cursor <= self.data.len());
        // Drop the processed prefix once it dominates the allocation.
        if self.cursor > 4096 && self.cursor * 2 > self.data.len() {
            self.data.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

/// Sub-position inside a `modify` body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ModifySub {
    /// Between pairs, waiting for `<before>`.
    Idle,
    InBefore { text: String },
    /// `before` captured, waiting for `<after>`.
    HaveBefore { before: String },
    InAfter { before: String, text: String },
}

/// Variant-specific body accumulator.
#[derive(Debug)]
enum BodyAccum {
    /// Decoded content streams out as it arrives; `pending` holds raw
    /// bytes whose trailing entity reference may still be incomplete.
    File { pending: String, content: String },
    Shell { raw: String },
    Modify { edits: Vec<Edit>, sub: ModifySub },
}

impl BodyAccum {
    fn new(kind: ActionKind) -> Self {
        match kind {
            ActionKind::File => Self::File {
                pending: String::new(),
                content: String::new(),
            },
            ActionKind::Shell => Self::Shell { raw: String::new() },
            ActionKind::Modify => Self::Modify {
                edits: Vec::new(),
                sub: ModifySub::Idle,
            },
        }
    }
}

#[derive(Debug)]
struct BodyState {
    header: ActionHeader,
    accum: BodyAccum,
    in_fence: bool,
}

#[derive(Debug)]
enum ScanState {
    /// Scanning plain text for an opening marker.
    Text { in_fence: bool },
    /// Inside an action body, scanning for the closing marker.
    Body(Box<BodyState>),
}

/// Outcome of one scan step over the marker attribute section.
enum HeaderScan {
    Complete { gt: usize },
    NeedMore,
    /// Too long, or a `<` appeared before `>`: literal text.
    Lookalike,
}

/// Incremental action markup scanner.
///
/// `feed` accepts fragments of any size (down to one character) and
/// returns the events newly recognizable; `finalize` signals end of
/// stream and implicitly closes anything still open. Plain text that is
/// not part of a marker accumulates and is drained with [`take_text`].
///
/// [`take_text`]: ActionParser::take_text
#[derive(Debug)]
pub struct ActionParser {
    buf: StreamBuffer,
    state: ScanState,
    next_id: u64,
    text_out: String,
    finished: bool,
}

impl Default for ActionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::default(),
            state: ScanState::Text { in_fence: false },
            next_id: 0,
            text_out: String::new(),
            finished: false,
        }
    }

    /// Feed the next fragment; returns events that became recognizable.
    pub fn feed(&mut self, chunk: &str) -> Vec<ActionEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buf.append(chunk);
        let mut events = Vec::new();
        self.scan(false, &mut events);
        events
    }

    /// Signal end of stream. An unterminated action is closed with
    /// whatever content accumulated and flagged `implicitly_closed`;
    /// a partially matched marker becomes plain text.
    pub fn finalize(&mut self) -> Vec<ActionEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.scan(true, &mut events);
        if let ScanState::Body(_) = self.state {
            self.close_current(true, &mut events);
        }
        self.finished = true;
        events
    }

    /// Drain plain text recognized so far (literal lookalikes included).
    pub fn take_text(&mut self) -> String {
        std::mem::take(&mut self.text_out)
    }

    fn next_id(&mut self) -> ActionId {
        self.next_id += 1;
        ActionId(self.next_id)
    }

    fn scan(&mut self, at_end: bool, events: &mut Vec<ActionEvent>) {
        loop {
            let progressed = match self.state {
                ScanState::Text { .. } => self.step_text(at_end, events),
                ScanState::Body(_) => self.step_body(at_end, events),
            };
            if !progressed {
                break;
            }
        }
    }

    /// One step in plain-text state. Returns false when more input is
    /// needed to make progress.
    fn step_text(&mut self, at_end: bool, events: &mut Vec<ActionEvent>) -> bool {
        let ScanState::Text { in_fence } = self.state else {
            return false;
        };
        let rest = self.buf.rest();
        if rest.is_empty() {
            return false;
        }

        if in_fence {
            return match rest.find(FENCE) {
                Some(i) => {
                    let upto = i + FENCE.len();
                    self.text_out.push_str(&rest[..upto].to_string());
                    self.state = ScanState::Text { in_fence: false };
                    self.buf.advance(upto);
                    true
                }
                None => self.emit_text_with_holdback(rest.len(), &[FENCE], at_end),
            };
        }

        let fence_at = rest.find(FENCE);
        let open_at = rest.find(OPEN_PREFIX);
        match (fence_at, open_at) {
            (Some(f), o) if o.is_none_or(|o| f < o) => {
                let upto = f + FENCE.len();
                self.text_out.push_str(&rest[..upto].to_string());
                self.state = ScanState::Text { in_fence: true };
                self.buf.advance(upto);
                true
            }
            (_, Some(o)) => self.try_open_marker(o, at_end, events),
            (_, None) => {
                self.emit_text_with_holdback(rest.len(), &[OPEN_PREFIX, FENCE], at_end)
            }
        }
    }

    /// Emit plain text up to (but not including) a suffix that could
    /// still grow into one of `markers`. Returns whether any progress
    /// was made.
    fn emit_text_with_holdback(&mut self, len: usize, markers: &[&str], at_end: bool) -> bool {
        let rest = &self.buf.rest()[..len];
        let hold = if at_end { 0 } else { partial_marker_suffix(rest, markers) };
        let emit = len - hold;
        if emit == 0 {
            return false;
        }
        self.text_out.push_str(&rest[..emit].to_string());
        self.buf.advance(emit);
        true
    }

    /// `rest[open_at..]` starts with the opening marker prefix; decide
    /// whether it is a real marker, a lookalike, or still ambiguous.
    fn try_open_marker(&mut self, open_at: usize, at_end: bool, events: &mut Vec<ActionEvent>) -> bool {
        enum Verdict {
            NeedMore,
            /// Emit this many bytes as text and continue scanning.
            Literal(usize),
            Open {
                kind: ActionKind,
                path: Option<String>,
                marker_len: usize,
            },
        }

        let rest = self.buf.rest();
        let marker = &rest[open_at..];
        let verdict = match marker.as_bytes().get(OPEN_PREFIX.len()) {
            None => {
                if at_end {
                    Verdict::Literal(rest.len())
                } else {
                    // Flush the text before the candidate, keep the prefix.
                    if open_at > 0 {
                        self.text_out.push_str(&rest[..open_at].to_string());
                        self.buf.advance(open_at);
                        return true;
                    }
                    Verdict::NeedMore
                }
            }
            Some(b) if !b.is_ascii_whitespace() && *b != b'>' => {
                // `<actionable…`: not our marker.
                Verdict::Literal(open_at + OPEN_PREFIX.len())
            }
            Some(_) => match scan_header(&marker[OPEN_PREFIX.len()..]) {
                HeaderScan::NeedMore => {
                    if at_end {
                        Verdict::Literal(rest.len())
                    } else {
                        if open_at > 0 {
                            self.text_out.push_str(&rest[..open_at].to_string());
                            self.buf.advance(open_at);
                            return true;
                        }
                        Verdict::NeedMore
                    }
                }
                HeaderScan::Lookalike => Verdict::Literal(open_at + OPEN_PREFIX.len()),
                HeaderScan::Complete { gt } => {
                    let attrs_raw = &marker[OPEN_PREFIX.len()..OPEN_PREFIX.len() + gt];
                    let marker_len = OPEN_PREFIX.len() + gt + 1;
                    match parse_open_attrs(attrs_raw) {
                        Some((kind, path)) => Verdict::Open {
                            kind,
                            path,
                            marker_len,
                        },
                        // Attribute grammar failed: the whole marker is
                        // literal text and scanning resumes after it.
                        None => Verdict::Literal(open_at + marker_len),
                    }
                }
            },
        };

        match verdict {
            Verdict::NeedMore => false,
            Verdict::Literal(n) => {
                self.text_out.push_str(&rest[..n].to_string());
                self.buf.advance(n);
                true
            }
            Verdict::Open {
                kind,
                path,
                marker_len,
            } => {
                if open_at > 0 {
                    self.text_out.push_str(&rest[..open_at].to_string());
                }
                let header = ActionHeader {
                    id: self.next_id(),
                    kind,
                    path,
                };
                events.push(ActionEvent::Open {
                    header: header.clone(),
                });
                self.state = ScanState::Body(Box::new(BodyState {
                    header,
                    accum: BodyAccum::new(kind),
                    in_fence: false,
                }));
                self.buf.advance(open_at + marker_len);
                true
            }
        }
    }

    /// One step inside an action body.
    fn step_body(&mut self, at_end: bool, events: &mut Vec<ActionEvent>) -> bool {
        let ScanState::Body(body) = &self.state else {
            return false;
        };
        let rest = self.buf.rest();
        if rest.is_empty() {
            return false;
        }

        let markers = body_markers(body);
        match find_first_marker(rest, &markers) {
            Some((at, marker)) => {
                let segment = rest[..at].to_string();
                let marker = marker.to_string();
                let advance = at + marker.len();
                self.absorb_body_segment(&segment, true, events);
                self.apply_body_marker(&marker, events);
                self.buf.advance(advance);
                true
            }
            None => {
                let hold = if at_end {
                    0
                } else {
                    partial_marker_suffix(rest, &markers)
                };
                let emit = rest.len() - hold;
                if emit == 0 {
                    return false;
                }
                let segment = rest[..emit].to_string();
                self.absorb_body_segment(&segment, false, events);
                self.buf.advance(emit);
                true
            }
        }
    }

    /// Fold a body text segment into the current accumulator. `flush`
    /// is true when a marker follows the segment, so no entity reference
    /// can still be growing.
    fn absorb_body_segment(&mut self, segment: &str, flush: bool, events: &mut Vec<ActionEvent>) {
        let ScanState::Body(body) = &mut self.state else {
            return;
        };
        match &mut body.accum {
            BodyAccum::File { pending, content } => {
                pending.push_str(segment);
                let cut = if flush {
                    pending.len()
                } else {
                    entities::safe_prefix_len(pending)
                };
                if cut == 0 {
                    return;
                }
                let delta = entities::decode(&pending[..cut]);
                pending.drain(..cut);
                if !delta.is_empty() {
                    content.push_str(&delta);
                    events.push(ActionEvent::Stream {
                        id: body.header.id,
                        delta,
                    });
                }
            }
            BodyAccum::Shell { raw } => raw.push_str(segment),
            BodyAccum::Modify { sub, .. } => match sub {
                ModifySub::InBefore { text } | ModifySub::InAfter { text, .. } => {
                    text.push_str(segment);
                }
                // Whitespace and stray text between pairs is ignored.
                ModifySub::Idle | ModifySub::HaveBefore { .. } => {}
            },
        }
    }

    fn apply_body_marker(&mut self, marker: &str, events: &mut Vec<ActionEvent>) {
        if marker == CLOSE_MARKER {
            self.close_current(false, events);
            return;
        }
        let ScanState::Body(body) = &mut self.state else {
            return;
        };
        if marker == FENCE {
            // The backticks are body content; only interpretation is
            // suspended between them.
            body.in_fence = !body.in_fence;
            self.absorb_body_segment(FENCE, true, events);
            return;
        }
        let BodyAccum::Modify { edits, sub } = &mut body.accum else {
            return;
        };
        match marker {
            BEFORE_OPEN => {
                *sub = ModifySub::InBefore {
                    text: String::new(),
                };
            }
            BEFORE_CLOSE => {
                if let ModifySub::InBefore { text } = sub {
                    *sub = ModifySub::HaveBefore {
                        before: entities::decode(text),
                    };
                }
            }
            AFTER_OPEN => {
                if let ModifySub::HaveBefore { before } = sub {
                    *sub = ModifySub::InAfter {
                        before: std::mem::take(before),
                        text: String::new(),
                    };
                }
            }
            AFTER_CLOSE => {
                if let ModifySub::InAfter { before, text } = sub {
                    edits.push(Edit {
                        before: std::mem::take(before),
                        after: entities::decode(text),
                    });
                    *sub = ModifySub::Idle;
                }
            }
            _ => {}
        }
    }

    /// Seal the open action and emit its `Close` event.
    fn close_current(&mut self, implicit: bool, events: &mut Vec<ActionEvent>) {
        let state = std::mem::replace(&mut self.state, ScanState::Text { in_fence: false });
        let ScanState::Body(body) = state else {
            return;
        };
        let BodyState { header, accum, .. } = *body;
        let payload = match accum {
            BodyAccum::File {
                pending,
                mut content,
            } => {
                if !pending.is_empty() {
                    let delta = entities::decode(&pending);
                    content.push_str(&delta);
                    events.push(ActionEvent::Stream {
                        id: header.id,
                        delta,
                    });
                }
                ActionPayload::File { content }
            }
            BodyAccum::Shell { raw } => ActionPayload::Shell {
                command: entities::decode(&raw).trim().to_string(),
            },
            BodyAccum::Modify { mut edits, sub } => {
                // A pair cut off mid-`after` still carries intent; an
                // unpaired `before` does not survive the implicit close.
                if let ModifySub::InAfter { before, text } = sub {
                    edits.push(Edit {
                        before,
                        after: entities::decode(&text),
                    });
                }
                ActionPayload::Modify { edits }
            }
        };
        if implicit {
            tracing::debug!(id = %header.id, "action implicitly closed at end of stream");
        }
        events.push(ActionEvent::Close {
            id: header.id,
            action: ActionTag {
                id: header.id,
                path: header.path,
                payload,
                implicitly_closed: implicit,
            },
        });
    }
}

/// Marker set relevant to the current body state.
fn body_markers(body: &BodyState) -> Vec<&'static str> {
    if body.in_fence {
        return vec![FENCE];
    }
    match &body.accum {
        BodyAccum::File { .. } | BodyAccum::Shell { .. } => vec![CLOSE_MARKER, FENCE],
        BodyAccum::Modify { sub, .. } => match sub {
            ModifySub::Idle => vec![CLOSE_MARKER, BEFORE_OPEN, FENCE],
            ModifySub::InBefore { .. } => vec![CLOSE_MARKER, BEFORE_CLOSE, FENCE],
            ModifySub::HaveBefore { .. } => vec![CLOSE_MARKER, AFTER_OPEN, FENCE],
            ModifySub::InAfter { .. } => vec![CLOSE_MARKER, AFTER_CLOSE, FENCE],
        },
    }
}

/// Earliest occurrence of any marker in `text`.
fn find_first_marker<'a>(text: &str, markers: &[&'a str]) -> Option<(usize, &'a str)> {
    markers
        .iter()
        .filter_map(|marker| text.find(marker).map(|idx| (idx, *marker)))
        .min_by_key(|(idx, _)| *idx)
}

/// Length of the longest suffix of `text` that is a proper prefix of one
/// of `markers` (what must be held back at a chunk boundary).
fn partial_marker_suffix(text: &str, markers: &[&str]) -> usize {
    let mut hold = 0;
    for marker in markers {
        let max = marker.len().saturating_sub(1).min(text.len());
        for len in (1..=max).rev() {
            if text.ends_with(&marker[..len]) {
                hold = hold.max(len);
                break;
            }
        }
    }
    hold
}

/// Scan the attribute section following `<action` for the closing `>`,
/// honoring quoted values (which may contain `\"` escapes).
fn scan_header(s: &str) -> HeaderScan {
    let mut in_quote = false;
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate() {
        if i > MAX_HEADER_LEN {
            return HeaderScan::Lookalike;
        }
        if in_quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quote = false;
            }
        } else if b == b'"' {
            in_quote = true;
        } else if b == b'>' {
            return HeaderScan::Complete { gt: i };
        } else if b == b'<' {
            return HeaderScan::Lookalike;
        }
    }
    HeaderScan::NeedMore
}

/// Parse the opening marker's attributes into the variant discriminant
/// and optional path. `None` means the marker is literal text.
fn parse_open_attrs(raw: &str) -> Option<(ActionKind, Option<String>)> {
    let attrs = parse_attrs(raw)?;
    let kind = attrs
        .iter()
        .find(|(name, _)| name == "type")
        .and_then(|(_, value)| ActionKind::parse(value))?;
    let path = attrs
        .iter()
        .find(|(name, _)| name == "path")
        .map(|(_, value)| value.clone());
    if kind.requires_path() && path.is_none() {
        return None;
    }
    Some((kind, path))
}

/// `name="value"` pairs; values accept backslash-escaped quotes and
/// entity references.
fn parse_attrs(raw: &str) -> Option<Vec<(String, String)>> {
    let mut rest = raw.trim_start();
    let mut attrs = Vec::new();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let name = rest[..eq].trim_end();
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return None;
        }
        let value_part = rest[eq + 1..].trim_start();
        let inner = value_part.strip_prefix('"')?;
        let mut value = String::new();
        let mut end = None;
        let mut escaped = false;
        for (i, ch) in inner.char_indices() {
            if escaped {
                value.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                end = Some(i + 1);
                break;
            } else {
                value.push(ch);
            }
        }
        let end = end?;
        attrs.push((name.to_string(), entities::decode(&value)));
        rest = inner[end..].trim_start();
    }
    Some(attrs)
}

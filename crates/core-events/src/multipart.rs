//! Multipart MESSAGE support.
//!
//! The message field holds at most [`MESSAGE_LEN`] - 1 bytes, so longer
//! strings are split into UTF-8 aligned segments carrying a continuation
//! bit. The receiver accumulates into a bounded scratch buffer; overflow is
//! reported without corrupting the accumulator state.

use crate::{Category, EventRecord, ExternalKind, MESSAGE_LEN, TargetKind};

/// Receiver-side accumulation buffer bound.
pub const MULTIPART_LIMIT: usize = 1024;

/// Outcome of feeding one MESSAGE event to the accumulator.
#[derive(Debug, PartialEq, Eq)]
pub enum MultipartStatus<'a> {
    /// Segment buffered, more to come.
    Partial,
    /// Final segment received; the complete message.
    Complete(&'a str),
    /// Not a MESSAGE event, or the bounded buffer overflowed. The
    /// accumulator resets itself either way.
    Invalid,
}

/// Bounded accumulator for inbound multipart messages.
#[derive(Default)]
pub struct MultipartBuffer {
    buf: Vec<u8>,
    flush: bool,
}

impl MultipartBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound TARGET MESSAGE event.
    pub fn push(&mut self, ev: &EventRecord) -> MultipartStatus<'_> {
        if ev.target_kind() != Some(TargetKind::Message) {
            return MultipartStatus::Invalid;
        }

        if self.flush {
            self.flush = false;
            self.buf.clear();
        }

        let seg = ev.message().as_bytes();
        if self.buf.len() + seg.len() > MULTIPART_LIMIT {
            self.buf.clear();
            return MultipartStatus::Invalid;
        }
        self.buf.extend_from_slice(seg);

        // ioev[0] == 0 terminates the sequence.
        if ev.tgt().ioevs[0].iv() == 0 {
            self.flush = true;
            match std::str::from_utf8(&self.buf) {
                Ok(s) => MultipartStatus::Complete(s),
                Err(_) => MultipartStatus::Invalid,
            }
        } else {
            MultipartStatus::Partial
        }
    }
}

/// Split `msg` into UTF-8 aligned MESSAGE events and hand each to `emit`.
///
/// Outbound (EXTERNAL) messages carry the continuation bit in the message
/// body; inbound-style TARGET templates use ioev[0]. The template's category
/// decides which convention applies. Returns false if a single codepoint
/// cannot fit the field (degenerate, only possible with invalid input).
pub fn push_utf8(
    template: &EventRecord,
    msg: &str,
    mut emit: impl FnMut(EventRecord),
) -> bool {
    let cap = MESSAGE_LEN - 1;
    let bytes = msg.as_bytes();
    let mut ofs = 0;

    while ofs < bytes.len() || (ofs == 0 && bytes.is_empty()) {
        let remaining = bytes.len() - ofs;
        let take = if remaining <= cap {
            remaining
        } else {
            // Back off to the previous codepoint boundary.
            let mut t = cap;
            while t > 0 && !msg.is_char_boundary(ofs + t) {
                t -= 1;
            }
            if t == 0 {
                return false;
            }
            t
        };

        let mut ev = *template;
        let last = ofs + take == bytes.len();
        match ev.category() {
            Some(Category::External) => {
                ev.ext_mut().kind = ExternalKind::Message as u8;
                let body = unsafe { &mut ev.body.ext.body.message };
                body.data.fill(0);
                body.data[..take].copy_from_slice(&bytes[ofs..ofs + take]);
                body.multipart = (!last) as u8;
            }
            _ => {
                ev.category = Category::Target as u8;
                ev.tgt_mut().kind = TargetKind::Message as u8;
                ev.tgt_mut().message.fill(0);
                ev.tgt_mut().message[..take].copy_from_slice(&bytes[ofs..ofs + take]);
                ev.tgt_mut().ioevs[0].iv = (!last) as i32;
            }
        }
        emit(ev);

        if bytes.is_empty() {
            break;
        }
        ofs += take;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(data: &str, more: bool) -> EventRecord {
        let mut ev = EventRecord::target(TargetKind::Message);
        ev.set_message(data);
        ev.tgt_mut().ioevs[0].iv = more as i32;
        ev
    }

    #[test]
    fn single_segment_completes() {
        let mut acc = MultipartBuffer::new();
        match acc.push(&message_event("hello", false)) {
            MultipartStatus::Complete(s) => assert_eq!(s, "hello"),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn segments_accumulate_in_order() {
        let mut acc = MultipartBuffer::new();
        assert_eq!(acc.push(&message_event("foo", true)), MultipartStatus::Partial);
        assert_eq!(acc.push(&message_event("bar", true)), MultipartStatus::Partial);
        match acc.push(&message_event("baz", false)) {
            MultipartStatus::Complete(s) => assert_eq!(s, "foobarbaz"),
            other => panic!("unexpected status: {:?}", other),
        }
        // The buffer resets for the next sequence.
        match acc.push(&message_event("next", false)) {
            MultipartStatus::Complete(s) => assert_eq!(s, "next"),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn overflow_reports_invalid_and_resets() {
        let mut acc = MultipartBuffer::new();
        let chunk = "y".repeat(MESSAGE_LEN - 1);
        let mut overflowed = false;
        for _ in 0..(MULTIPART_LIMIT / (MESSAGE_LEN - 1) + 2) {
            if matches!(
                acc.push(&message_event(&chunk, true)),
                MultipartStatus::Invalid
            ) {
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        // state survives the overflow
        match acc.push(&message_event("ok", false)) {
            MultipartStatus::Complete(s) => assert_eq!(s, "ok"),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn utf8_split_respects_boundaries() {
        // 40 three-byte codepoints: 120 bytes, forces a split that cannot
        // land mid-codepoint.
        let msg = "\u{2603}".repeat(40);
        let template = EventRecord::target(TargetKind::Message);
        let mut parts = Vec::new();
        assert!(push_utf8(&template, &msg, |ev| parts.push(ev)));
        assert!(parts.len() > 1);

        let mut acc = MultipartBuffer::new();
        let mut out = None;
        for p in &parts {
            if let MultipartStatus::Complete(s) = acc.push(p) {
                out = Some(s.to_string());
            }
        }
        assert_eq!(out.as_deref(), Some(msg.as_str()));
    }
}

//! Sentinel framing: `OPMsgB` + payload + `OPMsgE`.
//!
//! The framing carries no length prefix; receivers scan for the literal
//! sentinel byte strings. A payload that itself contains a sentinel
//! sequence will corrupt framing — callers encode payloads (JSON,
//! base-64 checkpoint blobs) that cannot collide in practice.

/// Marks the start of a frame.
pub const FRAME_BEGIN: &[u8; 6] = b"OPMsgB";
/// Marks the end of a frame.
pub const FRAME_END: &[u8; 6] = b"OPMsgE";

/// Wrap a payload in begin/end sentinels for the wire.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_BEGIN.len() + FRAME_END.len());
    frame.extend_from_slice(FRAME_BEGIN);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(FRAME_END);
    frame
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Reassembly buffer for one TCP stream. Bytes go in as they arrive;
/// complete de-framed payloads come out.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete payload, if the buffer holds one.
    ///
    /// Garbage before a begin sentinel is discarded, keeping a tail short
    /// enough that a sentinel straddling two reads still matches.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match find(&self.buf, FRAME_BEGIN, 0) {
            Some(begin) => {
                let payload_start = begin + FRAME_BEGIN.len();
                match find(&self.buf, FRAME_END, payload_start) {
                    Some(end) => {
                        let payload = self.buf[payload_start..end].to_vec();
                        self.buf.drain(..end + FRAME_END.len());
                        Some(payload)
                    }
                    None => {
                        if begin > 0 {
                            self.buf.drain(..begin);
                        }
                        None
                    }
                }
            }
            None => {
                let keep = (FRAME_BEGIN.len() - 1).min(self.buf.len());
                self.buf.drain(..self.buf.len() - keep);
                None
            }
        }
    }

    /// Extract every complete payload currently buffered, in order.
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Bytes currently buffered and not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_frame() {
        let mut rx = FrameBuffer::new();
        rx.extend(&encode_frame(b"hello"));
        assert_eq!(rx.next_frame().unwrap(), b"hello");
        assert!(rx.next_frame().is_none());
    }

    #[test]
    fn reassembles_across_arbitrary_splits() {
        let wire = encode_frame(b"split me");
        for cut in 1..wire.len() {
            let mut rx = FrameBuffer::new();
            rx.extend(&wire[..cut]);
            let early = rx.next_frame();
            rx.extend(&wire[cut..]);
            let frame = early.or_else(|| rx.next_frame());
            assert_eq!(frame.unwrap(), b"split me", "cut at {cut}");
        }
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut wire = encode_frame(b"first");
        wire.extend_from_slice(&encode_frame(b"second"));
        let mut rx = FrameBuffer::new();
        rx.extend(&wire);
        assert_eq!(rx.drain_frames(), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn garbage_before_begin_is_discarded() {
        let mut rx = FrameBuffer::new();
        rx.extend(b"noise noise ");
        rx.extend(&encode_frame(b"payload"));
        assert_eq!(rx.next_frame().unwrap(), b"payload");
        assert!(rx.pending() <= FRAME_BEGIN.len() - 1 + FRAME_END.len());
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut rx = FrameBuffer::new();
        rx.extend(&encode_frame(b""));
        assert_eq!(rx.next_frame().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn sentinel_inside_payload_corrupts_framing() {
        // Documented failure mode: the end sentinel inside a payload
        // truncates the frame at the first occurrence.
        let mut payload = b"abc".to_vec();
        payload.extend_from_slice(FRAME_END);
        payload.extend_from_slice(b"def");
        let mut rx = FrameBuffer::new();
        rx.extend(&encode_frame(&payload));
        assert_eq!(rx.next_frame().unwrap(), b"abc");
    }
}

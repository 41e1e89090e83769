use crate::util::{hex_digit, nibble};

/// Events produced while feeding raw channel bytes through the codec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketEvent {
    /// A well-formed packet; the payload is fully unescaped and expanded.
    Packet(Vec<u8>),
    /// `+` from the peer (only surfaced while acks are in force).
    Ack,
    /// `-` from the peer: the last packet we sent must be retransmitted.
    Nak,
    /// 0x03 outside a packet: asynchronous interrupt request.
    Interrupt,
    /// A frame that failed checksum or expansion; a `-` is owed to the peer.
    ChecksumError,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DecodeState {
    Idle,
    Body,
    ChecksumHigh,
    ChecksumLow,
}

/// GDB Remote Serial Protocol framing: `$<payload>#<cc>` with `}`-escaping
/// and run-length encoding. The codec is a pure transducer; it never touches
/// the channel. Whoever drains the events is responsible for writing the
/// `+`/`-` acknowledgements while ack mode is in force.
pub struct PacketCodec {
    state: DecodeState,
    body: Vec<u8>,
    checksum_high: u8,
    no_ack_mode: bool,
}

const RLE_BIAS: u8 = 28;
const RLE_MIN_COUNT: u8 = 32;
const RLE_MAX_COUNT: u8 = 126;
// Longest run a single count byte can express: 126 - 28.
const RLE_MAX_RUN: usize = (RLE_MAX_COUNT - RLE_BIAS) as usize;
// Runs shorter than this are cheaper to send literally.
const RLE_MIN_RUN: usize = 4;

fn must_escape(b: u8) -> bool {
    b == b'$' || b == b'#' || b == b'}' || b == b'*'
}

fn valid_rle_count(b: u8) -> bool {
    (RLE_MIN_COUNT..=RLE_MAX_COUNT).contains(&b) && b != b'#' && b != b'$'
}

impl PacketCodec {
    pub fn new() -> PacketCodec {
        PacketCodec {
            state: DecodeState::Idle,
            body: Vec::new(),
            checksum_high: 0,
            no_ack_mode: false,
        }
    }

    /// Stop emitting and expecting acknowledgements. Takes effect once the
    /// `QStartNoAckMode` reply itself has been acknowledged.
    pub fn set_no_ack_mode(&mut self, enabled: bool) {
        self.no_ack_mode = enabled;
    }

    pub fn no_ack_mode(&self) -> bool {
        self.no_ack_mode
    }

    /// Frame `payload` for the wire: escape, run-length encode, checksum.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.push(b'$');
        let mut i = 0;
        while i < payload.len() {
            let b = payload[i];
            if must_escape(b) {
                out.push(b'}');
                out.push(b ^ 0x20);
                i += 1;
                continue;
            }
            let mut run = 1;
            while i + run < payload.len() && payload[i + run] == b {
                run += 1;
            }
            if run < RLE_MIN_RUN {
                for _ in 0..run {
                    out.push(b);
                }
                i += run;
                continue;
            }
            let mut chunk = run.min(RLE_MAX_RUN);
            // '#', '$', '+' and '-' may not be used as count bytes; giving
            // one byte back to the run always lands on a usable count.
            while !valid_rle_count(chunk as u8 + RLE_BIAS)
                || chunk as u8 + RLE_BIAS == b'+'
                || chunk as u8 + RLE_BIAS == b'-'
            {
                chunk -= 1;
            }
            if chunk < RLE_MIN_RUN {
                for _ in 0..chunk {
                    out.push(b);
                }
            } else {
                out.push(b);
                out.push(b'*');
                out.push(chunk as u8 + RLE_BIAS);
            }
            i += chunk;
        }
        let checksum: u8 = out[1..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        out.push(b'#');
        out.push(hex_digit(checksum >> 4));
        out.push(hex_digit(checksum));
        out
    }

    /// Feed raw bytes; returns the decoded events in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<PacketEvent> {
        let mut events = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match self.state {
                DecodeState::Idle => {
                    match bytes[i] {
                        b'$' => {
                            self.body.clear();
                            self.state = DecodeState::Body;
                        }
                        0x03 => events.push(PacketEvent::Interrupt),
                        b'+' => {
                            if !self.no_ack_mode {
                                events.push(PacketEvent::Ack);
                            }
                        }
                        b'-' => {
                            if !self.no_ack_mode {
                                events.push(PacketEvent::Nak);
                            }
                        }
                        // Line noise between packets is discarded.
                        _ => {}
                    }
                    i += 1;
                }
                DecodeState::Body => {
                    // Bulk-copy the body up to the next frame delimiter.
                    let rest = &bytes[i..];
                    match memchr::memchr2(b'#', b'$', rest) {
                        None => {
                            self.body.extend_from_slice(rest);
                            i = bytes.len();
                        }
                        Some(at) => {
                            self.body.extend_from_slice(&rest[..at]);
                            if rest[at] == b'#' {
                                self.state = DecodeState::ChecksumHigh;
                            } else {
                                // A new packet start mid-body abandons the
                                // old frame.
                                self.body.clear();
                                events.push(PacketEvent::ChecksumError);
                            }
                            i += at + 1;
                        }
                    }
                }
                DecodeState::ChecksumHigh => {
                    self.checksum_high = bytes[i];
                    self.state = DecodeState::ChecksumLow;
                    i += 1;
                }
                DecodeState::ChecksumLow => {
                    self.state = DecodeState::Idle;
                    events.push(self.finish_frame(self.checksum_high, bytes[i]));
                    i += 1;
                }
            }
        }
        events
    }

    fn finish_frame(&mut self, high: u8, low: u8) -> PacketEvent {
        let received = match (nibble(high), nibble(low)) {
            (Ok(h), Ok(l)) => (h << 4) | l,
            _ => return PacketEvent::ChecksumError,
        };
        let computed: u8 = self.body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if computed != received {
            return PacketEvent::ChecksumError;
        }
        match expand_body(&self.body) {
            Ok(payload) => PacketEvent::Packet(payload),
            Err(()) => PacketEvent::ChecksumError,
        }
    }
}

/// Undo escaping and run-length encoding on a checksummed body.
fn expand_body(body: &[u8]) -> Result<Vec<u8>, ()> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'}' => {
                let escaped = *body.get(i + 1).ok_or(())?;
                out.push(escaped ^ 0x20);
                i += 2;
            }
            b'*' => {
                let count = *body.get(i + 1).ok_or(())?;
                if !valid_rle_count(count) {
                    return Err(());
                }
                let repeated = *out.last().ok_or(())?;
                // Total occurrences = count - 28; one is already in `out`.
                for _ in 0..(count - RLE_BIAS - 1) {
                    out.push(repeated);
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(codec: &mut PacketCodec, bytes: &[u8]) -> Vec<PacketEvent> {
        codec.feed(bytes)
    }

    #[test]
    fn decodes_simple_packet_and_ack() {
        let mut codec = PacketCodec::new();
        let events = feed_all(&mut codec, b"$OK#9a+");
        assert_eq!(
            events,
            vec![PacketEvent::Packet(b"OK".to_vec()), PacketEvent::Ack]
        );
    }

    #[test]
    fn decodes_vcont_packet() {
        let mut codec = PacketCodec::new();
        let frame = PacketCodec::encode(b"vCont;c:p1.-1");
        let events = feed_all(&mut codec, &frame);
        assert_eq!(events, vec![PacketEvent::Packet(b"vCont;c:p1.-1".to_vec())]);
    }

    #[test]
    fn checksum_off_by_one_is_an_error() {
        let mut codec = PacketCodec::new();
        let events = feed_all(&mut codec, b"$OK#9b");
        assert_eq!(events, vec![PacketEvent::ChecksumError]);
    }

    #[test]
    fn interrupt_outside_packet() {
        let mut codec = PacketCodec::new();
        assert_eq!(codec.feed(&[0x03]), vec![PacketEvent::Interrupt]);
    }

    #[test]
    fn interrupt_byte_inside_body_is_payload() {
        let mut codec = PacketCodec::new();
        let frame = PacketCodec::encode(&[b'X', 0x03, b'Y']);
        let events = feed_all(&mut codec, &frame);
        assert_eq!(events, vec![PacketEvent::Packet(vec![b'X', 0x03, b'Y'])]);
    }

    #[test]
    fn escape_round_trip() {
        let mut codec = PacketCodec::new();
        let payload = b"a}b$c#d*e".to_vec();
        let frame = PacketCodec::encode(&payload);
        // None of the specials may appear raw in the body.
        let body = &frame[1..frame.len() - 3];
        assert!(!body.iter().any(|&b| b == b'$' || b == b'#'));
        let events = feed_all(&mut codec, &frame);
        assert_eq!(events, vec![PacketEvent::Packet(payload)]);
    }

    #[test]
    fn rle_expansion() {
        // '!' is 33: five occurrences in total.
        let mut codec = PacketCodec::new();
        let body = b"0*!";
        let checksum: u8 = body.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        let frame = format!("$0*!#{:02x}", checksum);
        let events = feed_all(&mut codec, frame.as_bytes());
        assert_eq!(events, vec![PacketEvent::Packet(b"00000".to_vec())]);
    }

    #[test]
    fn rle_count_below_space_is_invalid() {
        let mut codec = PacketCodec::new();
        let body = [b'0', b'*', 0x1f];
        let checksum: u8 = body.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        let mut frame = vec![b'$'];
        frame.extend_from_slice(&body);
        frame.push(b'#');
        frame.push(hex_digit(checksum >> 4));
        frame.push(hex_digit(checksum));
        let events = feed_all(&mut codec, &frame);
        assert_eq!(events, vec![PacketEvent::ChecksumError]);
    }

    #[test]
    fn long_runs_round_trip_through_rle() {
        for n in &[32usize, 34, 97, 98, 99, 200] {
            let payload = vec![b'z'; *n];
            let frame = PacketCodec::encode(&payload);
            assert!(frame.len() < payload.len() + 4, "run of {} not compressed", n);
            let mut codec = PacketCodec::new();
            let events = codec.feed(&frame);
            assert_eq!(events, vec![PacketEvent::Packet(payload)]);
        }
    }

    #[test]
    fn encoder_never_emits_forbidden_count_bytes() {
        for n in 1..300usize {
            let payload = vec![b'q'; n];
            let frame = PacketCodec::encode(&payload);
            let body = &frame[1..frame.len() - 3];
            let mut i = 0;
            while i < body.len() {
                if body[i] == b'*' {
                    let count = body[i + 1];
                    assert!(valid_rle_count(count) && count != b'+' && count != b'-');
                    i += 2;
                } else {
                    i += 1;
                }
            }
            let mut codec = PacketCodec::new();
            assert_eq!(codec.feed(&frame), vec![PacketEvent::Packet(payload)]);
        }
    }

    #[test]
    fn arbitrary_payload_round_trip() {
        let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let frame = PacketCodec::encode(&payload);
        let mut codec = PacketCodec::new();
        assert_eq!(codec.feed(&frame), vec![PacketEvent::Packet(payload)]);
    }

    #[test]
    fn split_feeds_reassemble() {
        let mut codec = PacketCodec::new();
        let frame = PacketCodec::encode(b"qSupported");
        let mut events = Vec::new();
        for chunk in frame.chunks(3) {
            events.extend(codec.feed(chunk));
        }
        assert_eq!(events, vec![PacketEvent::Packet(b"qSupported".to_vec())]);
    }

    #[test]
    fn no_ack_mode_drops_peer_acks() {
        let mut codec = PacketCodec::new();
        codec.set_no_ack_mode(true);
        let events = feed_all(&mut codec, b"+$OK#9a+");
        assert_eq!(events, vec![PacketEvent::Packet(b"OK".to_vec())]);
    }
}

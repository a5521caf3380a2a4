use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Serialized header size of a segment. Every wire segment starts with this
///  fixed little-endian header, optionally followed by `len` payload bytes.
pub const HEADER_LEN: usize = 24;

/// Difference of two sequence numbers (or timestamps) under wrap-around.
///
/// All sn/ts/una/conv fields are 32-bit counters that may wrap; interpreting
///  the unsigned difference as signed yields a correct ordering as long as
///  the compared values are less than 2^31 apart. Every ordering decision on
///  these fields must go through this function.
#[inline]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Data segment carrying (a fragment of) a user message.
    Push = 81,
    /// Acknowledgment of a single received PUSH.
    Ack = 82,
    /// Window probe: "tell me your receive window".
    WindowAsk = 83,
    /// Window advertisement sent in response to a probe or after the
    ///  receive queue drains below its limit.
    WindowTell = 84,
}

impl Command {
    fn from_wire(raw: u8) -> Option<Command> {
        match raw {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowAsk),
            84 => Some(Command::WindowTell),
            _ => None,
        }
    }
}

/// One unit of wire exchange, together with the sender-side retransmission
///  bookkeeping that never goes on the wire.
#[derive(Debug, Clone)]
pub struct Segment {
    pub cmd: Command,
    /// Number of fragments still following in this message; 0 marks the last.
    pub frg: u8,
    /// Sender's advertised free receive-window size at send time.
    pub wnd: u16,
    /// Timestamp (engine clock, ms) of the most recent transmission.
    pub ts: u32,
    pub sn: u32,
    /// Smallest unacknowledged sn at the sender when this segment was sent.
    pub una: u32,
    pub payload: Bytes,

    // retransmission state, sender side only
    pub resend_ts: u32,
    pub rto: u32,
    pub fast_ack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn new(cmd: Command) -> Segment {
        Segment {
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            payload: Bytes::new(),
            resend_ts: 0,
            rto: 0,
            fast_ack: 0,
            xmit: 0,
        }
    }

    pub fn with_payload(cmd: Command, frg: u8, payload: Bytes) -> Segment {
        let mut seg = Segment::new(cmd);
        seg.frg = frg;
        seg.payload = payload;
        seg
    }

    /// Append the wire representation (header + payload) to `buf`.
    pub fn encode(&self, conv: u32, buf: &mut BytesMut) {
        buf.put_u32_le(conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// Header fields of a wire segment, decoded but with the payload left in
///  place in the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl WireHeader {
    /// Decode one header from the front of `buf`, advancing it. Returns
    ///  `None` for short buffers and unknown commands; the caller drops the
    ///  rest of the datagram in both cases.
    pub fn decode(buf: &mut impl Buf) -> Option<WireHeader> {
        if buf.remaining() < HEADER_LEN {
            return None;
        }
        let conv = buf.get_u32_le();
        let cmd = Command::from_wire(buf.get_u8())?;
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le();
        Some(WireHeader { conv, cmd, frg, wnd, ts, sn, una, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::push(Command::Push, 3, 17, vec![1, 2, 3, 4, 5])]
    #[case::push_empty(Command::Push, 0, 0, vec![])]
    #[case::ack(Command::Ack, 0, 65535, vec![])]
    #[case::window_ask(Command::WindowAsk, 0, 1, vec![])]
    #[case::window_tell(Command::WindowTell, 0, 32, vec![])]
    fn test_encode_decode(
        #[case] cmd: Command,
        #[case] frg: u8,
        #[case] wnd: u16,
        #[case] payload: Vec<u8>,
    ) {
        let mut seg = Segment::with_payload(cmd, frg, Bytes::from(payload.clone()));
        seg.wnd = wnd;
        seg.ts = 0xdead_beef;
        seg.sn = 42;
        seg.una = 41;

        let mut buf = BytesMut::new();
        seg.encode(0x1234_5678, &mut buf);
        assert_eq!(buf.len(), HEADER_LEN + payload.len());

        let mut rd: &[u8] = &buf;
        let header = WireHeader::decode(&mut rd).unwrap();
        assert_eq!(
            header,
            WireHeader {
                conv: 0x1234_5678,
                cmd,
                frg,
                wnd,
                ts: 0xdead_beef,
                sn: 42,
                una: 41,
                len: payload.len() as u32,
            }
        );
        assert_eq!(rd, payload.as_slice());
    }

    #[test]
    fn test_header_is_little_endian() {
        let mut seg = Segment::new(Command::Push);
        seg.wnd = 0x0201;
        let mut buf = BytesMut::new();
        seg.encode(0x0403_0201, &mut buf);

        assert_eq!(&buf[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(buf[4], 81);
        assert_eq!(&buf[6..8], &[0x01, 0x02]);
    }

    #[rstest]
    #[case::short_header(vec![0u8; HEADER_LEN - 1])]
    #[case::unknown_command({
        let mut seg_buf = BytesMut::new();
        Segment::new(Command::Push).encode(7, &mut seg_buf);
        let mut raw = seg_buf.to_vec();
        raw[4] = 99;
        raw
    })]
    fn test_decode_rejects(#[case] raw: Vec<u8>) {
        let mut rd: &[u8] = &raw;
        assert!(WireHeader::decode(&mut rd).is_none());
    }

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::ahead(7, 5, 2)]
    #[case::behind(5, 7, -2)]
    #[case::wrap_forward(2, u32::MAX - 1, 4)]
    #[case::wrap_backward(u32::MAX - 1, 2, -4)]
    fn test_seq_diff(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(seq_diff(a, b), expected);
    }
}

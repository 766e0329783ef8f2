use rand::Rng;

/// ICMP header size in bytes.
pub const ICMP_HEADER_SIZE: usize = 8;
/// Size of an IPv4 header without options. Raw ICMP sockets hand us the IP
/// header in front of every datagram, and replies are parsed at offsets
/// fixed by this layout.
pub const IP_HEADER_SIZE: usize = 20;

const ECHO_REQUEST_TYPE: u8 = 8;
const ECHO_REQUEST_CODE: u8 = 0;
/// Longest zig-zag varint encoding of an i64.
const MAX_VARINT_LEN: usize = 10;

/// One's complement checksum over the full ICMP message, with the checksum
/// field zeroed. Words are summed as little-endian byte pairs and a trailing
/// odd byte is added unextended; the carry fold runs twice because the first
/// fold can itself overflow 16 bits.
pub fn checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = buf.chunks_exact(2);
    for pair in &mut words {
        sum += u32::from(pair[1]) << 8 | u32::from(pair[0]);
    }
    if let Some(&last) = words.remainder().first() {
        sum += u32::from(last);
    }
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

/// Write `value` as a zig-zag signed varint. Returns the encoded width, or
/// None when the buffer is too small.
pub fn encode_varint(value: i64, buf: &mut [u8]) -> Option<usize> {
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    while ux >= 0x80 {
        *buf.get_mut(i)? = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    *buf.get_mut(i)? = ux as u8;
    Some(i + 1)
}

/// Decode a zig-zag signed varint from the front of `buf`. Returns the value
/// and the number of bytes consumed, or None when the encoding is truncated
/// or overflows 64 bits.
pub fn decode_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let mut ux: u64 = 0;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            ux |= u64::from(b) << (7 * i);
            let value = (ux >> 1) as i64 ^ -((ux & 1) as i64);
            return Some((value, i + 1));
        }
        ux |= u64::from(b & 0x7f) << (7 * i);
    }
    None
}

/// Logical Echo Request. The wire form is built fresh for every send; the
/// reply carries everything needed to time it, so requests are not retained.
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
}

impl EchoRequest {
    /// Serialize to the wire form: 8-byte ICMP header followed by
    /// `payload_len` payload bytes. The payload leads with the send
    /// timestamp as a length-prefixed varint when it fits (a zero prefix
    /// means no timestamp) and is padded with pseudo-random bytes in
    /// [0, 127). Never fails; undersized payloads simply carry no timestamp.
    pub fn encode(&self, payload_len: usize, now_ns: i64) -> Vec<u8> {
        let mut buf = vec![0u8; ICMP_HEADER_SIZE + payload_len];
        buf[0] = ECHO_REQUEST_TYPE;
        buf[1] = ECHO_REQUEST_CODE;
        // bytes 2-3 stay zero until the checksum is known
        buf[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        buf[6..8].copy_from_slice(&self.sequence.to_be_bytes());

        let mut filler_start = ICMP_HEADER_SIZE;
        let mut varint = [0u8; MAX_VARINT_LEN];
        if let Some(width) = encode_varint(now_ns, &mut varint) {
            if payload_len > width {
                buf[ICMP_HEADER_SIZE] = width as u8;
                buf[ICMP_HEADER_SIZE + 1..ICMP_HEADER_SIZE + 1 + width]
                    .copy_from_slice(&varint[..width]);
                filler_start += 1 + width;
            } else if payload_len >= 1 {
                // zero length prefix: no room for the timestamp
                filler_start += 1;
            }
        }

        let mut rng = rand::thread_rng();
        for b in &mut buf[filler_start..] {
            *b = rng.gen_range(0..127);
        }

        let csum = checksum(&buf);
        buf[2] = (csum & 0xff) as u8;
        buf[3] = (csum >> 8) as u8;
        buf
    }
}

/// Fields extracted from a received datagram, IP header included.
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
    /// Send timestamp recovered from the payload, when one was embedded and
    /// decodes cleanly.
    pub timestamp_ns: Option<i64>,
}

/// Pull the echo fields out of a raw datagram. The buffer starts with the
/// 20-byte IPv4 header, so the identifier sits at offset 24, the sequence
/// number at 26 and the TTL at 8. Returns None for datagrams too short to
/// hold the two headers. Identifier filtering is the caller's job.
pub fn parse_reply(buf: &[u8]) -> Option<EchoReply> {
    if buf.len() < IP_HEADER_SIZE + ICMP_HEADER_SIZE {
        return None;
    }
    let id_at = IP_HEADER_SIZE + 4;
    let seq_at = IP_HEADER_SIZE + 6;
    Some(EchoReply {
        identifier: u16::from_be_bytes([buf[id_at], buf[id_at + 1]]),
        sequence: u16::from_be_bytes([buf[seq_at], buf[seq_at + 1]]),
        ttl: buf[8],
        timestamp_ns: decode_timestamp(
            &buf[IP_HEADER_SIZE + ICMP_HEADER_SIZE..],
        ),
    })
}

fn decode_timestamp(payload: &[u8]) -> Option<i64> {
    let width = usize::from(*payload.first()?);
    if width == 0 || width > MAX_VARINT_LEN {
        return None;
    }
    let varint = payload.get(1..1 + width)?;
    let (value, consumed) = decode_varint(varint)?;
    if consumed != width {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod test {
    use super::*;

    // Wrap an encoded request the way the raw socket hands replies back:
    // 20 bytes of IPv4 header in front, TTL at offset 8.
    fn with_ip_header(icmp: &[u8], ttl: u8) -> Vec<u8> {
        let mut datagram = vec![0u8; IP_HEADER_SIZE];
        datagram[8] = ttl;
        datagram.extend_from_slice(icmp);
        datagram
    }

    #[test]
    fn checksum_all_zeros() {
        assert_eq!(checksum(&[0u8; 20]), 0xffff);
    }

    #[test]
    fn checksum_trailing_odd_byte() {
        // one word (0x0201) plus the raw trailing byte 0x03
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), !0x0204u16);
    }

    #[test]
    fn checksum_carry_folds() {
        // two words summing past 16 bits
        assert_eq!(checksum(&[0xff, 0xff, 0x02, 0x00]), !0x0002u16);
    }

    #[test]
    fn encoded_request_verifies() {
        let request = EchoRequest {
            identifier: 0x1234,
            sequence: 7,
        };
        let buf = request.encode(56, 1_700_000_000_000_000_000);
        // re-summing with the checksum in place must cancel to zero
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn encode_parse_roundtrip() {
        for (id, seq) in [(0u16, 0u16), (65535, 65535), (0x1234, 42)] {
            let now_ns = 1_700_000_000_000_000_000;
            let request = EchoRequest {
                identifier: id,
                sequence: seq,
            };
            let datagram = with_ip_header(&request.encode(56, now_ns), 64);

            let reply = parse_reply(&datagram).unwrap();
            assert_eq!(reply.identifier, id);
            assert_eq!(reply.sequence, seq);
            assert_eq!(reply.ttl, 64);
            assert_eq!(reply.timestamp_ns, Some(now_ns));
        }
    }

    #[test]
    fn encode_tiny_payload_has_no_timestamp() {
        let request = EchoRequest {
            identifier: 1,
            sequence: 1,
        };
        let buf = request.encode(4, 1_700_000_000_000_000_000);
        assert_eq!(buf.len(), ICMP_HEADER_SIZE + 4);

        let reply = parse_reply(&with_ip_header(&buf, 64)).unwrap();
        assert_eq!(reply.timestamp_ns, None);
    }

    #[test]
    fn encode_empty_payload() {
        let request = EchoRequest {
            identifier: 1,
            sequence: 1,
        };
        let buf = request.encode(0, 0);
        assert_eq!(buf.len(), ICMP_HEADER_SIZE);
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn filler_bytes_in_range() {
        let request = EchoRequest {
            identifier: 9,
            sequence: 9,
        };
        let buf = request.encode(56, 1_700_000_000_000_000_000);
        let width = usize::from(buf[ICMP_HEADER_SIZE]);
        for &b in &buf[ICMP_HEADER_SIZE + 1 + width..] {
            assert!(b < 127);
        }
    }

    #[test]
    fn parse_rejects_short_datagram() {
        assert!(parse_reply(&[0u8; IP_HEADER_SIZE + ICMP_HEADER_SIZE - 1])
            .is_none());
    }

    #[test]
    fn varint_roundtrip() {
        let mut buf = [0u8; 10];
        for value in
            [0i64, 1, -1, 63, -64, 300, i64::MAX, i64::MIN, 1_700_000_000_000_000_000]
        {
            let width = encode_varint(value, &mut buf).unwrap();
            assert_eq!(decode_varint(&buf[..width]), Some((value, width)));
        }
    }

    #[test]
    fn varint_truncated_decodes_to_none() {
        // continuation bit set with nothing following
        assert_eq!(decode_varint(&[0x80]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[test]
    fn varint_encode_needs_room() {
        let mut buf = [0u8; 4];
        assert_eq!(encode_varint(i64::MAX, &mut buf), None);
    }
}

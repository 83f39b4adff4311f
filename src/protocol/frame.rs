use std::mem;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_into_slice,
};

use crate::{
    error::TransportError,
    packet::{PacketLength, PacketType, types},
};

/// One byte of type plus a four byte big-endian length.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: PacketType,
    pub length: PacketLength,
}

fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Serializes one frame: header followed by the payload, in one buffer.
pub fn encode_frame(kind: PacketType, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let length = PacketLength::try_from(payload.len())
        .map_err(|_| TransportError::PayloadTooLarge(payload.len()))?;

    let mut frame = vec![0u8; HEADER_LEN + payload.len()];
    let written = encode_into_slice(
        FrameHeader { kind, length },
        &mut frame[..HEADER_LEN],
        wire_config(),
    )?;
    debug_assert_eq!(written, HEADER_LEN);
    frame[HEADER_LEN..].copy_from_slice(payload);

    Ok(frame)
}

/// Output of the decoder once a frame is complete.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame { kind: PacketType, payload: Vec<u8> },
    /// The peer sent the disconnect marker. Its payload, if any, was consumed.
    Disconnect,
}

#[derive(Debug)]
enum Stage {
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    Payload {
        kind: PacketType,
        buf: Vec<u8>,
        filled: usize,
    },
}

impl Stage {
    fn header() -> Self {
        Stage::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Rebuilds frames from arbitrarily fragmented reads.
///
/// The caller reads into [`FrameDecoder::demand`], which never asks for more
/// than the rest of the current header or payload, then reports how many bytes
/// arrived through [`FrameDecoder::advance`].
#[derive(Debug)]
pub struct FrameDecoder {
    stage: Stage,
    max_payload: u32,
}

impl FrameDecoder {
    pub fn new(max_payload: u32) -> Self {
        Self {
            stage: Stage::header(),
            max_payload,
        }
    }

    /// Buffer for the next read. Never empty.
    pub fn demand(&mut self) -> &mut [u8] {
        match &mut self.stage {
            Stage::Header { buf, filled } => &mut buf[*filled..],
            Stage::Payload { buf, filled, .. } => &mut buf[*filled..],
        }
    }

    /// Records that `n` bytes were written into the last [`FrameDecoder::demand`].
    pub fn advance(&mut self, n: usize) -> Result<Option<Decoded>, TransportError> {
        let header = match &mut self.stage {
            Stage::Header { buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= HEADER_LEN);
                if *filled < HEADER_LEN {
                    return Ok(None);
                }
                *buf
            }
            Stage::Payload { kind, buf, filled } => {
                *filled += n;
                debug_assert!(*filled <= buf.len());
                if *filled < buf.len() {
                    return Ok(None);
                }
                let (kind, payload) = (*kind, mem::take(buf));
                self.stage = Stage::header();
                return Ok(Some(complete(kind, payload)));
            }
        };

        let (header, _): (FrameHeader, usize) = decode_from_slice(&header, wire_config())?;
        self.stage = Stage::header();
        if header.length > self.max_payload {
            return Err(TransportError::Oversized {
                declared: header.length,
                limit: self.max_payload,
            });
        }
        if header.length == 0 {
            return Ok(Some(complete(header.kind, Vec::new())));
        }

        self.stage = Stage::Payload {
            kind: header.kind,
            buf: vec![0; header.length as usize],
            filled: 0,
        };
        Ok(None)
    }

    /// Copies `bytes` through the decoder, returning every frame they complete.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<Decoded>, TransportError> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let want = self.demand();
            let n = want.len().min(bytes.len());
            want[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];

            if let Some(decoded) = self.advance(n)? {
                out.push(decoded);
            }
        }
        Ok(out)
    }

    /// True between frames, i.e. no partial header or payload is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Header { filled: 0, .. })
    }
}

fn complete(kind: PacketType, payload: Vec<u8>) -> Decoded {
    if kind == types::DISCONNECTED {
        Decoded::Disconnect
    } else {
        Decoded::Frame { kind, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: PacketType, payload: &[u8]) -> Decoded {
        Decoded::Frame {
            kind,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = encode_frame(0x2a, b"abc").unwrap();

        assert_eq!(bytes, vec![0x2a, 0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(
            encode_frame(1, &[0u8; 0x0102]).unwrap()[..HEADER_LEN],
            [1, 0, 0, 1, 2]
        );
    }

    #[test]
    fn round_trip_lengths() {
        for len in [0usize, 1, 65_535, 1_000_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let bytes = encode_frame(9, &payload).unwrap();
            let mut decoder = FrameDecoder::new(crate::config::DEFAULT_MAX_PAYLOAD);

            let decoded = decoder.feed(&bytes).unwrap();
            assert_eq!(decoded, vec![frame(9, &payload)], "length {len}");
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn every_split_point_decodes_identically() {
        let bytes = encode_frame(3, b"This is the string that was transmitted.").unwrap();
        let expected = vec![frame(3, b"This is the string that was transmitted.")];

        for split in 1..bytes.len() {
            let mut decoder = FrameDecoder::new(1024);
            let mut decoded = decoder.feed(&bytes[..split]).unwrap();
            assert!(decoded.is_empty(), "split {split}");
            decoded.extend(decoder.feed(&bytes[split..]).unwrap());
            assert_eq!(decoded, expected, "split {split}");
        }

        let mut decoder = FrameDecoder::new(1024);
        let mut decoded = Vec::new();
        for byte in &bytes {
            decoded.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(decoded, expected);
    }

    #[test]
    fn back_to_back_frames() {
        let mut bytes = encode_frame(1, b"one").unwrap();
        bytes.extend(encode_frame(2, b"").unwrap());
        bytes.extend(encode_frame(3, b"three").unwrap());

        let decoded = FrameDecoder::new(64).feed(&bytes).unwrap();
        assert_eq!(
            decoded,
            vec![frame(1, b"one"), frame(2, b""), frame(3, b"three")]
        );
    }

    #[test]
    fn demand_never_overreads() {
        let mut decoder = FrameDecoder::new(64);
        assert_eq!(decoder.demand().len(), HEADER_LEN);

        decoder.demand()[..2].copy_from_slice(&[7, 0]);
        assert_eq!(decoder.advance(2).unwrap(), None);
        assert_eq!(decoder.demand().len(), 3);

        decoder.demand().copy_from_slice(&[0, 0, 4]);
        assert_eq!(decoder.advance(3).unwrap(), None);
        assert_eq!(decoder.demand().len(), 4);
    }

    #[test]
    fn disconnect_marker_consumes_payload() {
        let mut bytes = encode_frame(types::DISCONNECTED, b"bye").unwrap();
        bytes.extend(encode_frame(1, b"after").unwrap());

        let decoded = FrameDecoder::new(64).feed(&bytes).unwrap();
        assert_eq!(decoded, vec![Decoded::Disconnect, frame(1, b"after")]);
    }

    #[test]
    #[should_panic(expected = "Oversized")]
    fn oversized_declaration_is_rejected() {
        let bytes = encode_frame(1, &[0u8; 65]).unwrap();
        FrameDecoder::new(64).feed(&bytes).unwrap();
    }
}

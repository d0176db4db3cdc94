// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, Bytes, BytesMut};

use crate::network::RingBuffer;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// `opcode: u16 LE | length: u32 LE`
pub const HEADER_LEN: usize = 6;
/// Hard protocol limit on the declared payload length.
pub const MAX_PAYLOAD_LEN: usize = 65535;

/// One complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u16,
    payload: Bytes,
}

impl Frame {
    pub fn new(opcode: u16, payload: impl Into<Bytes>) -> Self {
        Frame {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (u16, Bytes) {
        (self.opcode, self.payload)
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> AppResult<Bytes> {
        Self::encode_parts(self.opcode, &self.payload).map(BytesMut::freeze)
    }

    /// Builds header and payload in one buffer so the frame can be queued
    /// with a single all-or-nothing write.
    pub fn encode_parts(opcode: u16, payload: &[u8]) -> AppResult<BytesMut> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(AppError::InvalidValue(format!(
                "frame payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        let mut wire = BytesMut::with_capacity(HEADER_LEN + payload.len());
        wire.put_u16_le(opcode);
        wire.put_u32_le(payload.len() as u32);
        wire.put_slice(payload);
        Ok(wire)
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    opcode: u16,
    length: u32,
}

impl FrameHeader {
    fn parse(raw: &[u8; HEADER_LEN]) -> Self {
        FrameHeader {
            opcode: u16::from_le_bytes([raw[0], raw[1]]),
            length: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
        }
    }

    fn peek(buffer: &RingBuffer) -> Option<Self> {
        let mut raw = [0u8; HEADER_LEN];
        buffer.peek(&mut raw).then(|| Self::parse(&raw))
    }
}

/// Splits a connection's read buffer into frames.
///
/// Nothing is consumed until the whole frame is buffered, so a header that
/// arrives ahead of its payload stays in the buffer for the next readable
/// event.
#[derive(Debug)]
pub struct FrameDecoder;

impl FrameDecoder {
    /// Checks whether the head of `buffer` holds a complete, valid frame and
    /// returns its total wire length.
    pub fn check(buffer: &RingBuffer) -> AppResult<usize> {
        let header = FrameHeader::peek(buffer).ok_or(Incomplete)?;
        let length = header.length as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(AppError::ProtocolViolation(format!(
                "frame of length {} with opcode {:#06x} is too large",
                length, header.opcode
            )));
        }
        if buffer.size() < HEADER_LEN + length {
            return Err(Incomplete);
        }
        Ok(HEADER_LEN + length)
    }

    pub fn parse(buffer: &mut RingBuffer) -> AppResult<Option<Frame>> {
        match FrameDecoder::check(buffer) {
            Ok(total) => {
                let mut wire = BytesMut::zeroed(total);
                if !buffer.read(&mut wire) {
                    return Err(AppError::IllegalStateError(format!(
                        "checked frame of {} bytes vanished from the buffer",
                        total
                    )));
                }
                let payload = wire.split_off(HEADER_LEN).freeze();
                let opcode = u16::from_le_bytes([wire[0], wire[1]]);
                Ok(Some(Frame { opcode, payload }))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every frame currently decodable, lazily. After an error the iterator
    /// yields nothing more.
    pub fn frames(buffer: &mut RingBuffer) -> Frames<'_> {
        Frames {
            buffer,
            done: false,
        }
    }

    /// Total size of the frame whose header sits at the head of `buffer`, when
    /// a valid header is buffered.
    pub fn pending_frame_len(buffer: &RingBuffer) -> Option<usize> {
        let header = FrameHeader::peek(buffer)?;
        let length = header.length as usize;
        (length <= MAX_PAYLOAD_LEN).then_some(HEADER_LEN + length)
    }
}

#[derive(Debug)]
pub struct Frames<'a> {
    buffer: &'a mut RingBuffer,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = AppResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match FrameDecoder::parse(self.buffer) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(opcode: u16, payload: &[u8]) -> Vec<u8> {
        Frame::encode_parts(opcode, payload).unwrap().to_vec()
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let bytes = wire(0x0102, b"xyz");
        assert_eq!(&bytes[..HEADER_LEN], &[0x02, 0x01, 3, 0, 0, 0]);
        assert_eq!(&bytes[HEADER_LEN..], b"xyz");
    }

    #[test]
    fn test_short_header_consumes_nothing() {
        let mut buffer = RingBuffer::new(64);
        assert!(buffer.write(&wire(7, b"abc")[..4]));
        assert!(FrameDecoder::parse(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.size(), 4);
    }

    #[test]
    fn test_header_without_payload_consumes_nothing() {
        let mut buffer = RingBuffer::new(64);
        let bytes = wire(7, b"abcdef");
        assert!(buffer.write(&bytes[..HEADER_LEN + 2]));
        assert_eq!(FrameDecoder::frames(&mut buffer).count(), 0);
        assert_eq!(buffer.size(), HEADER_LEN + 2);
        assert_eq!(FrameDecoder::pending_frame_len(&buffer), Some(HEADER_LEN + 6));

        assert!(buffer.write(&bytes[HEADER_LEN + 2..]));
        let frames: Vec<_> = FrameDecoder::frames(&mut buffer)
            .collect::<AppResult<_>>()
            .unwrap();
        assert_eq!(frames, vec![Frame::new(7, &b"abcdef"[..])]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_back_to_back_frames_keep_order() {
        let mut buffer = RingBuffer::new(64);
        let mut bytes = wire(1, b"A");
        bytes.extend(wire(2, b"BB"));
        bytes.extend(wire(3, b""));
        assert!(buffer.write(&bytes));

        let frames: Vec<_> = FrameDecoder::frames(&mut buffer)
            .collect::<AppResult<_>>()
            .unwrap();
        let opcodes: Vec<_> = frames.iter().map(Frame::opcode).collect();
        assert_eq!(opcodes, vec![1, 2, 3]);
        assert_eq!(frames[1].payload().as_ref(), b"BB");
        assert!(frames[2].payload().is_empty());

        let (opcode, payload) = frames[1].clone().into_parts();
        assert_eq!(opcode, 2);
        assert_eq!(payload.as_ref(), b"BB");
    }

    #[test]
    fn test_oversized_length_is_a_violation() {
        let mut buffer = RingBuffer::new(64);
        let mut header = vec![9, 0];
        header.extend(70000u32.to_le_bytes());
        assert!(buffer.write(&header));

        let mut frames = FrameDecoder::frames(&mut buffer);
        assert!(matches!(
            frames.next(),
            Some(Err(AppError::ProtocolViolation(_)))
        ));
        assert!(frames.next().is_none());
        assert_eq!(FrameDecoder::pending_frame_len(&buffer), None);
    }

    #[test]
    fn test_max_payload_is_accepted() {
        let payload = vec![0xAB; MAX_PAYLOAD_LEN];
        let mut buffer = RingBuffer::new(HEADER_LEN + MAX_PAYLOAD_LEN);
        assert!(buffer.write(&wire(4, &payload)));
        let frame = FrameDecoder::parse(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.payload().len(), MAX_PAYLOAD_LEN);
        assert_eq!(frame.wire_len(), HEADER_LEN + MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_frame_straddling_wrap_point() {
        let mut buffer = RingBuffer::new(20);
        assert!(buffer.write(&[0u8; 16]));
        assert!(buffer.remove(16));
        // buffer reset to the front once empty, push it forward again
        assert!(buffer.write(&[0u8; 14]));
        assert!(buffer.remove(12));

        let bytes = wire(5, b"wrapped!");
        assert!(buffer.write(&bytes[..6]));
        assert!(buffer.write(&bytes[6..]));
        assert!(buffer.remove(2));

        let frame = FrameDecoder::parse(&mut buffer).unwrap().unwrap();
        assert_eq!(frame, Frame::new(5, &b"wrapped!"[..]));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(Frame::encode_parts(1, &payload).is_err());
        assert_eq!(
            Frame::new(1, &b"ok"[..]).encode().unwrap().len(),
            HEADER_LEN + 2
        );
    }
}

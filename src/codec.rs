use bytes::{Buf, BytesMut};

use crate::errors::ProtocolError;
use crate::frame::{apply_mask, get_bit, parse_opcode, Frame, OpCode};

/// frame level limits and flags
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// mask outgoing frames; clients must leave this on
    pub mask_send_frame: bool,
    /// reject any frame or reassembled message whose payload exceeds this
    pub max_frame_size: usize,
    /// reject frames with rsv bits set (no extension negotiated)
    pub check_rsv: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            mask_send_frame: true,
            max_frame_size: 1024 * 1024,
            check_rsv: true,
        }
    }
}

/// incremental websocket frame decoder
///
/// consumes whole frames from the front of a byte buffer; a buffer shorter
/// than the fully determined frame is left untouched until more bytes
/// arrive. fragmented text/binary messages are reassembled before delivery.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FrameConfig,
    fragmented: bool,
    fragmented_type: OpCode,
    fragmented_data: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl FrameDecoder {
    /// decoder with explicit limits
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            fragmented: false,
            fragmented_type: OpCode::Text,
            fragmented_data: BytesMut::new(),
        }
    }

    /// decode one raw frame from the front of `src`
    ///
    /// returns `Ok(None)` without consuming anything when the buffer does
    /// not yet hold the whole frame; on success exactly the frame's wire
    /// length has been consumed
    pub fn decode_single(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let leading_bits = src[0] >> 4;
        if self.config.check_rsv && !(leading_bits == 0b00001000 || leading_bits == 0b00000000) {
            return Err(ProtocolError::InvalidLeadingBits(leading_bits));
        }
        let opcode = parse_opcode(src[0]).map_err(ProtocolError::InvalidOpcode)?;
        let leading_len = src[1] & 0b01111111;
        let (len_occupied, payload_len) = match leading_len {
            0..=125 => (1usize, leading_len as u64),
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let mut arr = [0u8; 2];
                arr.copy_from_slice(&src[2..4]);
                (3, u16::from_be_bytes(arr) as u64)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(arr);
                // the rfc forbids the most significant bit of the 64 bit form
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::InvalidExtendedLen);
                }
                (9, len)
            }
            _ => unreachable!(),
        };
        if payload_len > self.config.max_frame_size as u64 {
            return Err(ProtocolError::PayloadTooLarge(self.config.max_frame_size));
        }
        let masked = get_bit(src, 1, 0);
        let expected_len = 1 + len_occupied + if masked { 4 } else { 0 } + payload_len as usize;
        if src.len() < expected_len {
            src.reserve(expected_len - src.len());
            return Ok(None);
        }
        let fin = get_bit(src, 0, 0);
        let mut raw = src.split_to(expected_len);
        raw.advance(1 + len_occupied);
        let mask = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&raw[..4]);
            raw.advance(4);
            Some(key)
        } else {
            None
        };
        let mut payload = raw;
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        Ok(Some(Frame::from_parts(fin, opcode, mask, payload)))
    }

    /// decode the next deliverable frame
    ///
    /// control frames pass through validated; fragmented data frames are
    /// buffered until their final continuation and delivered as one frame
    /// carrying the initiating opcode
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let frame = match self.decode_single(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            let opcode = frame.opcode();
            match opcode {
                OpCode::Continue => {
                    if !self.fragmented {
                        return Err(ProtocolError::MissInitialFragmentedFrame);
                    }
                    if self.fragmented_data.len() + frame.payload().len()
                        > self.config.max_frame_size
                    {
                        return Err(ProtocolError::PayloadTooLarge(self.config.max_frame_size));
                    }
                    let fin = frame.fin();
                    self.fragmented_data.extend_from_slice(frame.payload());
                    if fin {
                        self.fragmented = false;
                        let data = std::mem::take(&mut self.fragmented_data);
                        if self.fragmented_type == OpCode::Text
                            && std::str::from_utf8(&data).is_err()
                        {
                            return Err(ProtocolError::InvalidUtf8);
                        }
                        return Ok(Some(Frame::from_parts(true, self.fragmented_type, None, data)));
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented {
                        return Err(ProtocolError::NotContinueFrameAfterFragmented);
                    }
                    if !frame.fin() {
                        self.fragmented = true;
                        self.fragmented_type = opcode;
                        self.fragmented_data.clear();
                        self.fragmented_data.extend_from_slice(frame.payload());
                    } else {
                        if opcode == OpCode::Text && std::str::from_utf8(frame.payload()).is_err()
                        {
                            return Err(ProtocolError::InvalidUtf8);
                        }
                        return Ok(Some(frame));
                    }
                }
                OpCode::Close | OpCode::Ping | OpCode::Pong => {
                    if !frame.fin() {
                        return Err(ProtocolError::FragmentedControlFrame);
                    }
                    let payload_len = frame.payload().len();
                    if payload_len > 125 {
                        return Err(ProtocolError::ControlFrameTooBig(payload_len));
                    }
                    if opcode == OpCode::Close {
                        if payload_len == 1 {
                            return Err(ProtocolError::InvalidCloseFramePayload);
                        }
                        if let Some(code) = frame.close_code() {
                            if code < 1000
                                || (1004..=1006).contains(&code)
                                || (1015..=2999).contains(&code)
                                || code >= 5000
                            {
                                return Err(ProtocolError::InvalidCloseCode(code));
                            }
                            if std::str::from_utf8(&frame.payload()[2..]).is_err() {
                                return Err(ProtocolError::InvalidUtf8);
                            }
                        }
                    }
                    return Ok(Some(frame));
                }
                OpCode::ReservedNonControl | OpCode::ReservedControl => {
                    return Err(ProtocolError::UnsupportedFrame(opcode));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn round_trip_boundary_lengths() {
        let mut decoder = FrameDecoder::default();
        for len in [0usize, 1, 125, 126, 127, 65535, 65536, 100_000] {
            for mask in [None, Some([1u8, 2, 3, 4])] {
                let frame = Frame::binary_frame(mask, &vec![0x5A; len]);
                let mut buf = encode(&frame);
                let wire_len = buf.len();
                assert_eq!(wire_len, frame.encoded_len());
                let decoded = decoder.decode(&mut buf).unwrap().unwrap();
                assert_eq!(decoded, frame, "len {len} mask {mask:?}");
                assert!(buf.is_empty(), "consumed exactly the frame bytes");
            }
        }
    }

    #[test]
    fn round_trip_text() {
        let mut decoder = FrameDecoder::default();
        let frame = Frame::text_frame(Some([9, 9, 9, 9]), "Hello");
        let mut buf = encode(&frame);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload(), b"Hello");
        assert_eq!(decoded.opcode(), OpCode::Text);
    }

    #[test]
    fn incremental_feed_never_consumes_short_buffers() {
        let frame = Frame::binary_frame(Some([7, 7, 7, 7]), &vec![3u8; 300]);
        let wire = encode(&frame);
        for split in [1usize, 2, 3, 4, 10, wire.len() - 1] {
            let mut decoder = FrameDecoder::default();
            let mut buf = BytesMut::from(&wire[..split]);
            assert!(decoder.decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), split, "need-more must not consume");
            buf.extend_from_slice(&wire[split..]);
            let decoded = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = Frame::text_frame(None, "one");
        let second = Frame::text_frame(None, "two");
        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().payload(), b"one");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().payload(), b"two");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut decoder = FrameDecoder::new(FrameConfig {
            max_frame_size: 16,
            ..Default::default()
        });
        let mut buf = encode(&Frame::binary_frame(None, &[0u8; 17]));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::PayloadTooLarge(16)
        );
    }

    #[test]
    fn extended_length_high_bit_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(
            &[0x82u8, 127, 0x80, 0, 0, 0, 0, 0, 0, 0][..],
        );
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::InvalidExtendedLen
        );
    }

    #[test]
    fn rsv_bits_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&[0xC1u8, 0x00][..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::InvalidLeadingBits(_))
        ));
    }

    #[test]
    fn fragmented_message_reassembled() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(false, OpCode::Text, None, b"Hel"));
        buf.extend_from_slice(&encode(&Frame::new(true, OpCode::Continue, None, b"lo")));
        let message = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.opcode(), OpCode::Text);
        assert!(message.fin());
        assert_eq!(message.payload(), b"Hello");
    }

    #[test]
    fn control_frame_allowed_between_fragments() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(false, OpCode::Binary, None, b"ab"));
        buf.extend_from_slice(&encode(&Frame::ping_frame(None, b"hb")));
        buf.extend_from_slice(&encode(&Frame::new(true, OpCode::Continue, None, b"cd")));
        let ping = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping.opcode(), OpCode::Ping);
        let message = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.opcode(), OpCode::Binary);
        assert_eq!(message.payload(), b"abcd");
    }

    #[test]
    fn interleaved_data_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(false, OpCode::Text, None, b"ab"));
        buf.extend_from_slice(&encode(&Frame::text_frame(None, "cd")));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::NotContinueFrameAfterFragmented
        );
    }

    #[test]
    fn continuation_without_initial_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(true, OpCode::Continue, None, b"xy"));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::MissInitialFragmentedFrame
        );
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(false, OpCode::Ping, None, b""));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::FragmentedControlFrame
        );
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x89, 126, 0, 126]);
        buf.extend_from_slice(&[0u8; 126]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::ControlFrameTooBig(126)
        );
    }

    #[test]
    fn close_frame_validation() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&[0x88u8, 1, 0][..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::InvalidCloseFramePayload
        );

        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::close_frame(None, 999, b""));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::InvalidCloseCode(999)
        );

        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::close_frame(None, 1000, b"bye"));
        let close = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(close.close_code(), Some(1000));
    }

    #[test]
    fn invalid_utf8_text_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = encode(&Frame::new(true, OpCode::Text, None, &[0xFF, 0xFE]));
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::InvalidUtf8
        );
    }
}

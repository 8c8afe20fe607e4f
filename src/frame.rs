use bytes::{BufMut, BytesMut};

/// Defines the interpretation of the "Payload data".  If an unknown
/// opcode is received, the receiving endpoint MUST _Fail the
/// WebSocket Connection_.  The following values are defined.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x3-7 are reserved for further non-control frames
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
/// - xB-F are reserved for further control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// - x0 denotes a continuation frame
    Continue,
    /// - x1 denotes a text frame
    Text,
    /// - x2 denotes a binary frame
    Binary,
    /// - x3-7 are reserved for further non-control frames
    ReservedNonControl,
    /// - x8 denotes a connection close
    Close,
    /// - x9 denotes a ping
    Ping,
    /// - xA denotes a pong
    Pong,
    /// - xB-F are reserved for further control frames
    ReservedControl,
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::ReservedNonControl => 3,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::ReservedControl => 11,
        }
    }

    /// check is close type frame
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }

    /// close/ping/pong, payload capped at 125 and never fragmented
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// check is text/binary/continuation ?
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continue)
    }
}

#[inline]
pub(crate) fn parse_opcode(val: u8) -> Result<OpCode, u8> {
    match val & 0b00001111 {
        0 => Ok(OpCode::Continue),
        1 => Ok(OpCode::Text),
        2 => Ok(OpCode::Binary),
        3..=7 => Ok(OpCode::ReservedNonControl),
        8 => Ok(OpCode::Close),
        9 => Ok(OpCode::Ping),
        10 => Ok(OpCode::Pong),
        11..=15 => Ok(OpCode::ReservedControl),
        other => Err(other),
    }
}

#[inline]
pub(crate) fn get_bit(source: &[u8], byte_idx: usize, bit_idx: usize) -> bool {
    let b: u8 = source[byte_idx];
    1 & (b >> (7 - bit_idx)) != 0
}

/// xor payload bytes with the 4 byte key, a word at a time
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        let xored = u32::from_ne_bytes(word) ^ mask_u32;
        chunk.copy_from_slice(&xored.to_ne_bytes());
    }
    // tail starts at a multiple of 4, key rotation restarts cleanly
    for (idx, b) in chunks.into_remainder().iter_mut().enumerate() {
        *b ^= mask[idx % 4];
    }
}

/// fresh random key for one outgoing frame
pub(crate) fn gen_mask() -> [u8; 4] {
    rand::random()
}

/// single websocket frame
///
/// the payload is always held unmasked in memory; the mask key, when
/// present, is applied while encoding and removed while decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: BytesMut,
}

impl Frame {
    /// construct new frame
    pub fn new(fin: bool, opcode: OpCode, mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(data.len());
        payload.extend_from_slice(data);
        Self {
            fin,
            opcode,
            mask: mask.into(),
            payload,
        }
    }

    pub(crate) fn from_parts(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: BytesMut,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload,
        }
    }

    /// helper function to construct a final text frame
    pub fn text_frame(mask: impl Into<Option<[u8; 4]>>, data: &str) -> Self {
        Self::new(true, OpCode::Text, mask, data.as_bytes())
    }

    /// helper function to construct a final binary frame
    pub fn binary_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        Self::new(true, OpCode::Binary, mask, data)
    }

    /// helper function to construct a ping frame
    pub fn ping_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(true, OpCode::Ping, mask, data)
    }

    /// helper function to construct a pong frame
    pub fn pong_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(true, OpCode::Pong, mask, data)
    }

    /// helper function to construct a close frame
    ///
    /// the close payload is the 2 byte big endian status code followed by
    /// a utf-8 reason; a frame without a code carries an empty payload
    pub fn close_frame(
        mask: impl Into<Option<[u8; 4]>>,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Self {
        debug_assert!(reason.len() <= 123);
        let code = code.into();
        debug_assert!(code.is_some() || reason.is_empty());
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
            payload.extend_from_slice(reason);
        }
        Self {
            fin: true,
            opcode: OpCode::Close,
            mask: mask.into(),
            payload,
        }
    }

    /// get fin bit value
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// return frame opcode
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// get frame mask key
    pub fn masking_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// get payload, unmasked
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// status code carried by a close frame payload
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode.is_close() && self.payload.len() >= 2 {
            let mut code = [0u8; 2];
            code.copy_from_slice(&self.payload[..2]);
            Some(u16::from_be_bytes(code))
        } else {
            None
        }
    }

    /// consume frame and return payload
    pub fn into_payload(self) -> BytesMut {
        self.payload
    }

    /// the exact number of bytes `encode` will emit
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let len_occupied = if len <= 125 {
            1
        } else if len <= 65535 {
            3
        } else {
            9
        };
        1 + len_occupied + if self.mask.is_some() { 4 } else { 0 } + len
    }

    /// append the wire encoding of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(((self.fin as u8) << 7) | self.opcode.as_u8());
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }
        match self.mask {
            Some(key) => {
                dst.extend_from_slice(&key);
                let start = dst.len();
                dst.extend_from_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.extend_from_slice(&self.payload),
        }
    }
}

use bytes::{BufMut, BytesMut};

/// RFC 6455 操作码。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// 低 4 位到操作码；未定义的值返回 `None`。
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// 是否为控制帧操作码。
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// 服务端帧头长度：2、4 或 10 字节（无掩码）。
pub fn head_len(payload_len: usize) -> usize {
    if payload_len < 126 {
        2
    } else if payload_len <= u16::MAX as usize {
        4
    } else {
        10
    }
}

/// 编码服务端帧头（MASK=0）写入 `out`。
///
/// 载荷长度按最小编码：`<126` 直接编入第二字节，`<=65535` 用 16 位
/// 扩展，更大用 64 位扩展。
pub fn encode_head(opcode: OpCode, fin: bool, payload_len: usize, out: &mut BytesMut) {
    let first = (u8::from(fin) << 7) | opcode as u8;
    out.put_u8(first);
    if payload_len < 126 {
        out.put_u8(payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        out.put_u8(126);
        out.put_u16(payload_len as u16);
    } else {
        out.put_u8(127);
        out.put_u64(payload_len as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(opcode: OpCode, fin: bool, len: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_head(opcode, fin, len, &mut out);
        out.to_vec()
    }

    #[test]
    fn short_lengths_use_two_byte_head() {
        assert_eq!(head(OpCode::Text, true, 0), vec![0x81, 0x00]);
        assert_eq!(head(OpCode::Text, true, 5), vec![0x81, 0x05]);
        assert_eq!(head(OpCode::Binary, false, 125), vec![0x02, 0x7D]);
    }

    #[test]
    fn extended_16_bit_lengths() {
        assert_eq!(head(OpCode::Text, true, 126), vec![0x81, 0x7E, 0x00, 0x7E]);
        assert_eq!(
            head(OpCode::Text, true, 65535),
            vec![0x81, 0x7E, 0xFF, 0xFF]
        );
    }

    #[test]
    fn extended_64_bit_lengths() {
        assert_eq!(
            head(OpCode::Binary, true, 65536),
            vec![0x82, 0x7F, 0, 0, 0, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn head_len_matches_encoding() {
        for len in [0usize, 1, 125, 126, 127, 65535, 65536, 10_000_000] {
            assert_eq!(head(OpCode::Text, true, len).len(), head_len(len));
        }
    }

    #[test]
    fn continuation_and_close_opcodes() {
        assert_eq!(head(OpCode::Continuation, true, 1), vec![0x80, 0x01]);
        assert_eq!(head(OpCode::Close, true, 2), vec![0x88, 0x02]);
    }
}

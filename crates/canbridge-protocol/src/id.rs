//! CAN ID 表示转换
//!
//! packed 形式把标识符左对齐到 32 位：标准帧占 bit 21..31，扩展帧占 bit 3..31，
//! bit 2 = IDE，bit 1 = RTR。线上每个 ID 以小端字节序写成 8 个 hex 字符。

/// socket 形式：扩展帧标志
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// socket 形式：远程帧标志
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// 标准帧 11 位掩码
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// 扩展帧 29 位掩码
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// packed 形式：IDE 位
pub const PACKED_IDE_BIT: u32 = 0x0000_0004;
/// packed 形式：RTR 位
pub const PACKED_RTR_BIT: u32 = 0x0000_0002;

/// 只有 29 位 ID 才可能置位的低位
const PACKED_EXTENDED_ONLY_MASK: u32 = 0x0001_FFFC;

/// socket 形式 → packed 形式
pub fn socket_to_packed(socket_id: u32) -> u32 {
    let mut packed = if socket_id & CAN_EFF_FLAG != 0 {
        ((socket_id & CAN_EFF_MASK) << 3) | PACKED_IDE_BIT
    } else {
        (socket_id & CAN_SFF_MASK) << 21
    };
    if socket_id & CAN_RTR_FLAG != 0 {
        packed |= PACKED_RTR_BIT;
    }
    packed
}

/// packed 形式 → socket 形式
pub fn packed_to_socket(packed_id: u32) -> u32 {
    let rtr = if packed_id & PACKED_RTR_BIT != 0 {
        CAN_RTR_FLAG
    } else {
        0
    };
    if packed_id & PACKED_IDE_BIT != 0 {
        (packed_id >> 3) | CAN_EFF_FLAG | rtr
    } else {
        (packed_id >> 21) | rtr
    }
}

/// 11 位 ID 不允许出现 29 位专有的低位
pub fn packed_id_is_legal(packed_id: u32) -> bool {
    packed_id & PACKED_EXTENDED_ONLY_MASK == 0 || packed_id & PACKED_IDE_BIT != 0
}

/// 非 hex 字符在查找表中的标记
pub(crate) const HEX_INVALID: u8 = 0xFF;

/// ASCII → nibble 查找表（大小写均可）
pub(crate) const HEX_NIBBLE: [u8; 256] = build_hex_table();

const fn build_hex_table() -> [u8; 256] {
    let mut table = [HEX_INVALID; 256];
    let mut i = 0;
    while i < 10 {
        table[b'0' as usize + i] = i as u8;
        i += 1;
    }
    let mut i = 0;
    while i < 6 {
        table[b'A' as usize + i] = 10 + i as u8;
        table[b'a' as usize + i] = 10 + i as u8;
        i += 1;
    }
    table
}

fn hex_value(c: u8) -> Option<u8> {
    match HEX_NIBBLE[c as usize] {
        HEX_INVALID => None,
        v => Some(v),
    }
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// 解析线上顺序（小端字节序）的 8 个 hex 字符
///
/// `"00002024"` → `0x2420_0000`。少于 8 个字符或含非 hex 字符时返回 `None`。
pub fn packed_id_from_hex(hex: &[u8]) -> Option<u32> {
    if hex.len() < 8 {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let hi = hex_value(hex[2 * i])?;
        let lo = hex_value(hex[2 * i + 1])?;
        *byte = (hi << 4) | lo;
    }
    Some(u32::from_le_bytes(bytes))
}

/// 以线上顺序（小端字节序、大写）写出 packed ID
pub fn packed_id_to_hex(packed_id: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, byte) in packed_id.to_le_bytes().iter().enumerate() {
        out[2 * i] = HEX_UPPER[(byte >> 4) as usize];
        out[2 * i + 1] = HEX_UPPER[(byte & 0x0F) as usize];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_roundtrip() {
        for id in [0u32, 1, 0x123, 0x7FF] {
            let packed = socket_to_packed(id);
            assert_eq!(packed, id << 21);
            assert_eq!(packed_to_socket(packed), id);
        }
    }

    #[test]
    fn test_extended_roundtrip() {
        let socket = 0x1234_5678 | CAN_EFF_FLAG;
        let packed = socket_to_packed(socket);
        assert_eq!(packed, (0x1234_5678 << 3) | PACKED_IDE_BIT);
        assert_eq!(packed_to_socket(packed), socket);
    }

    #[test]
    fn test_rtr_bit_carried_both_ways() {
        let socket = 0x7FF | CAN_RTR_FLAG;
        let packed = socket_to_packed(socket);
        assert_eq!(packed & PACKED_RTR_BIT, PACKED_RTR_BIT);
        assert_eq!(packed_to_socket(packed), socket);

        let socket = 0x100 | CAN_EFF_FLAG | CAN_RTR_FLAG;
        assert_eq!(packed_to_socket(socket_to_packed(socket)), socket);
    }

    #[test]
    fn test_legality() {
        assert!(packed_id_is_legal(0x2420_0000));
        assert!(packed_id_is_legal(0x0000_0004 | 0x0001_0000));
        // 11 位帧却带有 29 位低位
        assert!(!packed_id_is_legal(0x0001_0000));
        assert!(!packed_id_is_legal(0x0000_0008));
        // RTR 位本身不影响合法性
        assert!(packed_id_is_legal(0x2420_0002));
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(packed_id_from_hex(b"00002024"), Some(0x2420_0000));
        assert_eq!(packed_id_from_hex(b"0000a0b2"), Some(0xB2A0_0000));
        assert_eq!(packed_id_from_hex(b"0000202"), None);
        assert_eq!(packed_id_from_hex(b"0000202G"), None);
        assert_eq!(&packed_id_to_hex(0xB2A0_0000), b"0000A0B2");
    }
}

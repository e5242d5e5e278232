//! 序列号解析
//!
//! 控制板的序列号以 USB 字符串描述符（UTF-16LE）返回，但固件只放数字。
//! 解析时只保留 ASCII 数字字节，其余（包括 UTF-16 的高字节 0x00）全部丢弃。

/// 字符串描述符类型
pub const STRING_DESCRIPTOR_TYPE: u8 = 0x03;

/// 从字符串描述符原始字节中提取数字序列号
///
/// 描述符头为 `[bLength, bDescriptorType]`。只有 `bDescriptorType == 0x03`
/// 且 `bLength` 为不小于 2 的偶数时才视为有效；否则返回空字符串。
/// 扫描范围为 `buf[2..min(bLength, buf.len())]`，读取被截断时不越界。
pub fn parse_serial_descriptor(buf: &[u8]) -> String {
    let &[length, descriptor_type, ..] = buf else {
        return String::new();
    };

    let length = usize::from(length);
    if descriptor_type != STRING_DESCRIPTOR_TYPE || length < 2 || length % 2 != 0 {
        return String::new();
    }

    let end = length.min(buf.len());
    buf[2..end]
        .iter()
        .filter(|byte| byte.is_ascii_digit())
        .map(|&byte| char::from(byte))
        .collect()
}

/// 按字符串描述符格式编码（UTF-16LE），用于测试夹具
pub fn encode_string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let length = 2 + units.len() * 2;

    let mut buf = Vec::with_capacity(length);
    buf.push(length.min(u8::MAX as usize) as u8);
    buf.push(STRING_DESCRIPTOR_TYPE);
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

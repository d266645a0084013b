//! EBML (Extensible Binary Meta Language) 基础解析.
//!
//! EBML 使用变长整数编码元素 ID 和数据大小.
//!
//! # 变长整数 (VINT)
//! ```text
//! 首字节的前导 1 位之前的 0 的数量决定了字节长度:
//!   1xxxxxxx                  → 1 字节 (7 位数据)
//!   01xxxxxx xxxxxxxx         → 2 字节 (14 位数据)
//!   001xxxxx xxxxxxxx ×2      → 3 字节 (21 位数据)
//!   ...依此类推, 最多 8 字节
//! ```
//!
//! 数据位全为 1 的大小值保留为"未知大小" (直播追加写入的文件会用到).

use bytes::Bytes;
use vessel_core::{VesselError, VesselResult};

use crate::io::FileSlice;

/// 元素 ID 最大字节数
pub const MAX_ID_WIDTH: usize = 4;

/// 数据大小最大字节数
pub const MAX_SIZE_WIDTH: usize = 8;

/// 最小的元素头部 (1 字节 ID + 1 字节大小)
pub const MIN_HEADER_SIZE: usize = 2;

/// 最大的元素头部
pub const MAX_HEADER_SIZE: usize = MAX_ID_WIDTH + MAX_SIZE_WIDTH;

/// 由首字节得到变长整数的字节长度, 首字节为 0 时无效
pub fn vint_width(first: u8) -> Option<usize> {
    if first == 0 {
        None
    } else {
        Some(first.leading_zeros() as usize + 1)
    }
}

/// 读取变长整数, 返回 (去掉标记位的值, 字节长度)
pub fn read_vint(slice: &mut FileSlice) -> VesselResult<(u64, usize)> {
    let first = slice.read_u8()?;
    let width = vint_width(first)
        .ok_or_else(|| VesselError::InvalidData("EBML: 无效的变长整数首字节".into()))?;

    let mask = 0xFFu16 >> width;
    let mut value = u64::from(first & mask as u8);
    for _ in 1..width {
        value = (value << 8) | u64::from(slice.read_u8()?);
    }
    Ok((value, width))
}

/// 读取元素 ID
///
/// 元素 ID 保留前导标记位. 数据位全为 1 的 ID 为保留值 (填充), 视为无效.
pub fn read_element_id(slice: &mut FileSlice) -> VesselResult<u32> {
    let first = slice.read_u8()?;
    let width = vint_width(first)
        .filter(|&w| w <= MAX_ID_WIDTH)
        .ok_or_else(|| VesselError::InvalidData("EBML: 无效的元素 ID".into()))?;

    let mut id = u32::from(first);
    for _ in 1..width {
        id = (id << 8) | u32::from(slice.read_u8()?);
    }

    let value_bits = 7 * width as u32;
    let value_mask = (1u32 << value_bits) - 1;
    if id & value_mask == value_mask {
        return Err(VesselError::InvalidData(format!(
            "EBML: 保留的元素 ID 0x{id:X}"
        )));
    }
    Ok(id)
}

/// 读取元素数据大小
///
/// 返回 `None` 表示"未知大小".
pub fn read_element_size(slice: &mut FileSlice) -> VesselResult<Option<u64>> {
    let (value, width) = read_vint(slice)?;
    let max_val = (1u64 << (7 * width)) - 1;
    if value == max_val {
        return Ok(None);
    }
    Ok(Some(value))
}

/// 读取有符号变长整数 (EBML 分组的大小差值)
///
/// 存储值 = 实际值 + (2^(7w-1) - 1).
pub fn read_signed_vint(slice: &mut FileSlice) -> VesselResult<i64> {
    let (value, width) = read_vint(slice)?;
    let bias = (1i64 << (7 * width - 1)) - 1;
    Ok(value as i64 - bias)
}

/// 读取无符号整数 (大端, 0-8 字节, 0 字节表示 0)
pub fn read_uint(slice: &mut FileSlice, size: u64) -> VesselResult<u64> {
    if size > 8 {
        return Err(VesselError::InvalidData(format!(
            "EBML: 无效的 uint 大小: {size}"
        )));
    }
    let mut val = 0u64;
    for _ in 0..size {
        val = (val << 8) | u64::from(slice.read_u8()?);
    }
    Ok(val)
}

/// 读取有符号整数 (大端, 符号扩展, 0-8 字节)
pub fn read_sint(slice: &mut FileSlice, size: u64) -> VesselResult<i64> {
    let u = read_uint(slice, size)?;
    if size == 0 {
        return Ok(0);
    }
    let bits = size * 8;
    if bits == 64 {
        return Ok(u as i64);
    }
    let sign = 1u64 << (bits - 1);
    if u & sign != 0 {
        Ok((u | !((1u64 << bits) - 1)) as i64)
    } else {
        Ok(u as i64)
    }
}

/// 读取浮点数 (0、4 或 8 字节)
pub fn read_float(slice: &mut FileSlice, size: u64) -> VesselResult<f64> {
    match size {
        0 => Ok(0.0),
        4 => {
            let bits = read_uint(slice, 4)? as u32;
            Ok(f64::from(f32::from_bits(bits)))
        }
        8 => Ok(f64::from_bits(read_uint(slice, 8)?)),
        _ => Err(VesselError::InvalidData(format!(
            "EBML: 无效的浮点数大小: {size}"
        ))),
    }
}

/// 读取字符串 (去除尾部 NUL)
pub fn read_string(slice: &mut FileSlice, size: u64) -> VesselResult<String> {
    let data = read_binary(slice, size)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

/// 读取二进制数据 (零拷贝)
pub fn read_binary(slice: &mut FileSlice, size: u64) -> VesselResult<Bytes> {
    let size = usize::try_from(size).map_err(|_| VesselError::Eof)?;
    slice.read_bytes(size)
}

// ========================
// Matroska 元素 ID
// ========================

// EBML Header
pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const EBML_DOC_TYPE: u32 = 0x4282;

// 全局元素
pub const VOID: u32 = 0xEC;
pub const CRC32: u32 = 0xBF;

// Segment
pub const SEGMENT: u32 = 0x1853_8067;

// SeekHead
pub const SEEK_HEAD: u32 = 0x114D_9B74;
pub const SEEK: u32 = 0x4DBB;
pub const SEEK_ID: u32 = 0x53AB;
pub const SEEK_POSITION: u32 = 0x53AC;

// Segment Information
pub const SEGMENT_INFO: u32 = 0x1549_A966;
pub const INFO_TIMESTAMP_SCALE: u32 = 0x002A_D7B1;
pub const INFO_DURATION: u32 = 0x4489;
pub const INFO_TITLE: u32 = 0x7BA9;

// Tracks
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
pub const TRACK_TYPE: u32 = 0x83;
pub const TRACK_FLAG_ENABLED: u32 = 0xB9;
pub const TRACK_FLAG_DEFAULT: u32 = 0x88;
pub const TRACK_FLAG_FORCED: u32 = 0x55AA;
pub const TRACK_DEFAULT_DURATION: u32 = 0x0023_E383;
pub const TRACK_NAME: u32 = 0x536E;
pub const TRACK_LANGUAGE: u32 = 0x0022_B59C;
pub const TRACK_LANGUAGE_BCP47: u32 = 0x0022_B59D;
pub const TRACK_CODEC_ID: u32 = 0x86;
pub const TRACK_CODEC_PRIVATE: u32 = 0x63A2;
pub const TRACK_CODEC_DELAY: u32 = 0x56AA;
pub const TRACK_SEEK_PRE_ROLL: u32 = 0x56BB;

// Video settings
pub const VIDEO_SETTINGS: u32 = 0xE0;
pub const VIDEO_FLAG_INTERLACED: u32 = 0x9A;
pub const VIDEO_PIXEL_WIDTH: u32 = 0xB0;
pub const VIDEO_PIXEL_HEIGHT: u32 = 0xBA;
pub const VIDEO_DISPLAY_WIDTH: u32 = 0x54B0;
pub const VIDEO_DISPLAY_HEIGHT: u32 = 0x54BA;
pub const VIDEO_PROJECTION: u32 = 0x7670;
pub const VIDEO_PROJECTION_POSE_ROLL: u32 = 0x7675;

// Audio settings
pub const AUDIO_SETTINGS: u32 = 0xE1;
pub const AUDIO_SAMPLING_FREQ: u32 = 0xB5;
pub const AUDIO_CHANNELS: u32 = 0x9F;
pub const AUDIO_BIT_DEPTH: u32 = 0x6264;

// Content encodings
pub const CONTENT_ENCODINGS: u32 = 0x6D80;
pub const CONTENT_ENCODING: u32 = 0x6240;
pub const CONTENT_ENCODING_ORDER: u32 = 0x5031;
pub const CONTENT_ENCODING_SCOPE: u32 = 0x5032;
pub const CONTENT_ENCODING_TYPE: u32 = 0x5033;
pub const CONTENT_COMPRESSION: u32 = 0x5034;
pub const CONTENT_COMP_ALGO: u32 = 0x4254;
pub const CONTENT_COMP_SETTINGS: u32 = 0x4255;
pub const CONTENT_ENCRYPTION: u32 = 0x5035;

// Cluster
pub const CLUSTER: u32 = 0x1F43_B675;
pub const CLUSTER_TIMESTAMP: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;
pub const BLOCK_GROUP: u32 = 0xA0;
pub const BLOCK: u32 = 0xA1;
pub const BLOCK_DURATION: u32 = 0x9B;
pub const REFERENCE_BLOCK: u32 = 0xFB;
pub const BLOCK_ADDITIONS: u32 = 0x75A1;
pub const BLOCK_MORE: u32 = 0xA6;
pub const BLOCK_ADD_ID: u32 = 0xEE;
pub const BLOCK_ADDITIONAL: u32 = 0xA5;

// Cues
pub const CUES: u32 = 0x1C53_BB6B;
pub const CUE_POINT: u32 = 0xBB;
pub const CUE_TIME: u32 = 0xB3;
pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
pub const CUE_TRACK: u32 = 0xF7;
pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

// Chapters
pub const CHAPTERS: u32 = 0x1043_A770;

// Attachments
pub const ATTACHMENTS: u32 = 0x1941_A469;
pub const ATTACHED_FILE: u32 = 0x61A7;
pub const FILE_DESCRIPTION: u32 = 0x467E;
pub const FILE_NAME: u32 = 0x466E;
pub const FILE_MIME_TYPE: u32 = 0x4660;
pub const FILE_DATA: u32 = 0x465C;
pub const FILE_UID: u32 = 0x46AE;

// Tags
pub const TAGS: u32 = 0x1254_C367;
pub const TAG: u32 = 0x7373;
pub const TARGETS: u32 = 0x63C0;
pub const TARGET_TYPE_VALUE: u32 = 0x68CA;
pub const TAG_TRACK_UID: u32 = 0x63C5;
pub const TAG_EDITION_UID: u32 = 0x63C9;
pub const TAG_CHAPTER_UID: u32 = 0x63C4;
pub const TAG_ATTACHMENT_UID: u32 = 0x63C6;
pub const SIMPLE_TAG: u32 = 0x67C8;
pub const TAG_NAME: u32 = 0x45A3;
pub const TAG_STRING: u32 = 0x4487;

// ========================
// 边界元素集合
// ========================

/// 顶层 (level 0) 元素
pub const LEVEL_0_IDS: &[u32] = &[EBML_HEADER, SEGMENT];

/// Segment 直接子元素 (level 1)
///
/// 数据簇之后只能合法地出现这些元素, 用于未知大小的边界搜索与损坏数据重新同步.
pub const LEVEL_1_IDS: &[u32] = &[
    SEEK_HEAD,
    SEGMENT_INFO,
    CLUSTER,
    TRACKS,
    CUES,
    ATTACHMENTS,
    CHAPTERS,
    TAGS,
];

/// level 0 与 level 1 元素的并集
pub const LEVEL_0_AND_1_IDS: &[u32] = &[
    EBML_HEADER,
    SEGMENT,
    SEEK_HEAD,
    SEGMENT_INFO,
    CLUSTER,
    TRACKS,
    CUES,
    ATTACHMENTS,
    CHAPTERS,
    TAGS,
];

/// 是否为 Segment 直接子元素
pub fn is_level_1(id: u32) -> bool {
    LEVEL_1_IDS.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(data: &[u8]) -> FileSlice {
        FileSlice::new(Bytes::copy_from_slice(data), 0)
    }

    #[test]
    fn test_read_1_byte_vint_id() {
        let mut s = slice(&[0x81]);
        assert_eq!(read_element_id(&mut s).unwrap(), 0x81);
        assert_eq!(s.file_pos(), 1);
    }

    #[test]
    fn test_read_4_byte_vint_id() {
        let mut s = slice(&[0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(read_element_id(&mut s).unwrap(), EBML_HEADER);
    }

    #[test]
    fn test_reserved_and_oversized_ids() {
        assert!(read_element_id(&mut slice(&[0xFF])).is_err());
        assert!(read_element_id(&mut slice(&[0x00])).is_err());
        // 5 字节宽度的 ID 超出范围
        assert!(read_element_id(&mut slice(&[0x08, 1, 2, 3, 4])).is_err());
        // 截断
        assert!(matches!(
            read_element_id(&mut slice(&[0x1A, 0x45])),
            Err(VesselError::Eof)
        ));
    }

    #[test]
    fn test_read_vint_size() {
        assert_eq!(read_element_size(&mut slice(&[0x85])).unwrap(), Some(5));
        assert_eq!(read_element_size(&mut slice(&[0x40, 0x20])).unwrap(), Some(32));
    }

    #[test]
    fn test_unknown_size_any_width() {
        assert_eq!(read_element_size(&mut slice(&[0xFF])).unwrap(), None);
        assert_eq!(read_element_size(&mut slice(&[0x7F, 0xFF])).unwrap(), None);
        let eight = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(read_element_size(&mut slice(&eight)).unwrap(), None);
        // 非全 1 的 8 字节值是普通大小
        let big = [0x01, 0, 0, 0, 0, 0, 0x01, 0x00];
        assert_eq!(read_element_size(&mut slice(&big)).unwrap(), Some(256));
    }

    #[test]
    fn test_signed_vint() {
        // 1 字节: 偏置 63
        assert_eq!(read_signed_vint(&mut slice(&[0x80 | 63])).unwrap(), 0);
        assert_eq!(read_signed_vint(&mut slice(&[0x80 | 60])).unwrap(), -3);
        // 2 字节: 偏置 8191
        assert_eq!(read_signed_vint(&mut slice(&[0x60, 0x09])).unwrap(), 10);
    }

    #[test]
    fn test_read_uint_and_sint() {
        assert_eq!(read_uint(&mut slice(&[0x01, 0x00]), 2).unwrap(), 256);
        assert_eq!(read_uint(&mut slice(&[]), 0).unwrap(), 0);
        assert_eq!(read_sint(&mut slice(&[0xFF, 0xFE]), 2).unwrap(), -2);
        assert_eq!(read_sint(&mut slice(&[0x7F]), 1).unwrap(), 127);
    }

    #[test]
    fn test_read_float_4_byte() {
        let bits = 1.5f32.to_bits().to_be_bytes();
        let val = read_float(&mut slice(&bits), 4).unwrap();
        assert!((val - 1.5).abs() < f64::EPSILON);
        assert!(read_float(&mut slice(&[0; 3]), 3).is_err());
    }

    #[test]
    fn test_read_string() {
        let mut s = slice(b"hello\x00\x00");
        assert_eq!(read_string(&mut s, 7).unwrap(), "hello");
    }
}

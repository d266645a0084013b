//! 块分组 (Lacing) 拆分.
//!
//! 一个 Block 可以打包多个小帧. 负载开头 1 字节为帧数 - 1, 之后按模式记录帧大小:
//! ```text
//! Xiph : 每个帧大小为若干 255 加上一个 < 255 的字节
//! Fixed: 无大小字段, 剩余数据均分
//! EBML : 第一个大小为无符号变长整数, 之后为与前一个大小的有符号差值
//! ```
//! 最后一帧的大小总是剩余的字节数.

use bytes::Bytes;
use vessel_core::{VesselError, VesselResult};

use super::ebml::{read_signed_vint, read_vint};
use crate::io::FileSlice;

/// 分组模式 (块标志的第 1-2 位)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    Fixed,
    Ebml,
}

impl Lacing {
    /// 从块标志字节解析
    pub fn from_flags(flags: u8) -> Self {
        match (flags >> 1) & 0x03 {
            0 => Self::None,
            1 => Self::Xiph,
            2 => Self::Fixed,
            _ => Self::Ebml,
        }
    }
}

/// 将分组负载拆分为各帧数据
pub fn split_frames(data: &Bytes, lacing: Lacing) -> VesselResult<Vec<Bytes>> {
    if lacing == Lacing::None {
        return Ok(vec![data.clone()]);
    }

    let mut slice = FileSlice::new(data.clone(), 0);
    let frame_count = usize::from(slice.read_u8()?) + 1;
    let mut sizes: Vec<u64> = Vec::with_capacity(frame_count);

    match lacing {
        Lacing::Xiph => {
            for _ in 1..frame_count {
                let mut size = 0u64;
                loop {
                    let b = slice.read_u8()?;
                    size += u64::from(b);
                    if b < 255 {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        Lacing::Ebml => {
            if frame_count > 1 {
                let (first, _) = read_vint(&mut slice)?;
                sizes.push(first);
                let mut prev = first as i64;
                for _ in 2..frame_count {
                    let size = prev + read_signed_vint(&mut slice)?;
                    if size < 0 {
                        return Err(VesselError::InvalidData(format!(
                            "MKV: EBML 分组帧大小为负: {size}"
                        )));
                    }
                    sizes.push(size as u64);
                    prev = size;
                }
            }
        }
        Lacing::Fixed => {
            let remaining = slice.remaining();
            if remaining % frame_count != 0 {
                return Err(VesselError::InvalidData(format!(
                    "MKV: 固定分组无法均分, {remaining} 字节 / {frame_count} 帧"
                )));
            }
            let each = (remaining / frame_count) as u64;
            sizes.resize(frame_count - 1, each);
        }
        Lacing::None => unreachable!(),
    }

    let explicit: u64 = sizes.iter().sum();
    let remaining = slice.remaining() as u64;
    let last = remaining.checked_sub(explicit).ok_or_else(|| {
        VesselError::InvalidData(format!(
            "MKV: 分组帧大小之和 {explicit} 超出负载 {remaining}"
        ))
    })?;
    sizes.push(last);

    sizes
        .into_iter()
        .map(|size| slice.read_bytes(size as usize))
        .collect()
}

/// 第 `index` 帧的 (时间戳, 时长)
///
/// 原块时长按帧序号均分, 各帧时长之和等于原块时长.
pub fn frame_timing(timestamp: i64, duration: i64, count: usize, index: usize) -> (i64, i64) {
    let count = count as i64;
    let index = index as i64;
    let offset = duration * index / count;
    let next = duration * (index + 1) / count;
    (timestamp + offset, next - offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lacing_from_flags() {
        assert_eq!(Lacing::from_flags(0x80), Lacing::None);
        assert_eq!(Lacing::from_flags(0x02), Lacing::Xiph);
        assert_eq!(Lacing::from_flags(0x84), Lacing::Fixed);
        assert_eq!(Lacing::from_flags(0x06), Lacing::Ebml);
    }

    #[test]
    fn test_fixed_lacing() {
        let mut payload = vec![3u8]; // 4 帧
        payload.extend_from_slice(&[7u8; 12]);
        let data = Bytes::from(payload);
        let frames = split_frames(&data, Lacing::Fixed).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.len() == 3));
        assert_eq!(frames.iter().map(Bytes::len).sum::<usize>() + 1, data.len());

        let bad = Bytes::from(vec![2u8, 1, 2, 3, 4]);
        assert!(split_frames(&bad, Lacing::Fixed).is_err());
    }

    #[test]
    fn test_xiph_lacing() {
        // 3 帧: 300 字节 (255 + 45), 2 字节, 剩余 1 字节
        let mut payload = vec![2u8, 255, 45, 2];
        payload.extend_from_slice(&[0xAA; 300]);
        payload.extend_from_slice(&[0xBB; 2]);
        payload.push(0xCC);
        let frames = split_frames(&Bytes::from(payload), Lacing::Xiph).unwrap();
        let sizes: Vec<_> = frames.iter().map(Bytes::len).collect();
        assert_eq!(sizes, [300, 2, 1]);
        assert_eq!(frames[2][0], 0xCC);
    }

    #[test]
    fn test_ebml_lacing_with_negative_delta() {
        // 3 帧: 5 字节, 5 - 3 = 2 字节, 剩余 4 字节
        let mut payload = vec![2u8, 0x85, 0x80 | 60];
        payload.extend_from_slice(&[1u8; 5]);
        payload.extend_from_slice(&[2u8; 2]);
        payload.extend_from_slice(&[3u8; 4]);
        let frames = split_frames(&Bytes::from(payload), Lacing::Ebml).unwrap();
        let sizes: Vec<_> = frames.iter().map(Bytes::len).collect();
        assert_eq!(sizes, [5, 2, 4]);
    }

    #[test]
    fn test_oversized_lacing_is_rejected() {
        let payload = Bytes::from(vec![1u8, 10, 1, 2]);
        assert!(split_frames(&payload, Lacing::Xiph).is_err());
    }

    #[test]
    fn test_frame_timing_sums_to_duration() {
        let timings: Vec<_> = (0..3).map(|i| frame_timing(100, 10, 3, i)).collect();
        assert_eq!(timings, [(100, 3), (103, 3), (106, 4)]);
        assert_eq!(timings.iter().map(|t| t.1).sum::<i64>(), 10);
    }
}

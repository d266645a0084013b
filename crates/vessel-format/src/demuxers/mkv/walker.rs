//! 元素树遍历.
//!
//! 只负责解码元素头部和枚举子元素, 不做任何索引或缓存.
//! 是否深入某个子元素由调用方决定.

use vessel_core::VesselResult;

use super::ebml::{
    MAX_HEADER_SIZE, MAX_ID_WIDTH, MIN_HEADER_SIZE, read_element_id, read_element_size, vint_width,
};
use crate::io::{FileSlice, Reader};

/// 默认的重新同步窗口 (10 MiB)
pub const MAX_RESYNC_LENGTH: u64 = 10 * 1024 * 1024;

/// 默认的扫描分块大小 (64 KiB)
pub const DEFAULT_SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// 元素头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    /// 元素 ID (含标记位)
    pub id: u32,
    /// 数据大小, `None` 表示未知大小
    pub size: Option<u64>,
    /// 头部字节数 (ID + 大小)
    pub header_len: usize,
    /// 数据起始的文件偏移
    pub data_start: u64,
}

impl ElementHeader {
    /// 元素起始的文件偏移
    pub fn start(&self) -> u64 {
        self.data_start - self.header_len as u64
    }

    /// 数据结束的文件偏移 (不含), 未知大小时为 `None`
    pub fn data_end(&self) -> Option<u64> {
        self.size.map(|size| self.data_start.saturating_add(size))
    }
}

/// 在游标处解码元素头部
///
/// 头部不完整、首字节为 0 或遇到保留 ID 时返回 `None`, 并恢复游标.
pub fn read_element_header(slice: &mut FileSlice) -> Option<ElementHeader> {
    let start = slice.file_pos();
    let parsed = read_element_id(slice).and_then(|id| Ok((id, read_element_size(slice)?)));
    match parsed {
        Ok((id, size)) => Some(ElementHeader {
            id,
            size,
            header_len: (slice.file_pos() - start) as usize,
            data_start: slice.file_pos(),
        }),
        Err(_) => {
            slice.set_file_pos(start);
            None
        }
    }
}

/// 从数据源读取并解码 `offset` 处的元素头部
///
/// 数据不足时返回 `Ok(None)`.
pub async fn read_element_header_at(
    reader: &Reader,
    offset: u64,
) -> VesselResult<Option<ElementHeader>> {
    let Some(mut slice) = reader
        .request_slice_range(offset, MIN_HEADER_SIZE, MAX_HEADER_SIZE)
        .await?
    else {
        return Ok(None);
    };
    Ok(read_element_header(&mut slice))
}

/// 子元素迭代器
///
/// 依次产出 (头部, 数据窗口). 声明大小超出父窗口的子元素视为截断, 迭代结束;
/// 未知大小的子元素延伸到父窗口末尾.
pub struct ChildElements {
    slice: FileSlice,
}

impl ChildElements {
    /// 从窗口游标处开始枚举
    pub fn new(slice: FileSlice) -> Self {
        Self { slice }
    }
}

impl Iterator for ChildElements {
    type Item = (ElementHeader, FileSlice);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slice.remaining() < MIN_HEADER_SIZE {
            return None;
        }
        let header = read_element_header(&mut self.slice)?;
        let available = self.slice.remaining() as u64;
        let size = match header.size {
            Some(size) if size <= available => size,
            Some(_) => {
                self.slice.read_rest();
                return None;
            }
            None => available,
        };
        let data = self.slice.sub_slice(size).ok()?;
        Some((header, data))
    }
}

/// 扫描结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// 在该偏移找到目标元素
    Found(u64),
    /// 未找到, 扫描停在该偏移 (上限或数据末尾)
    Exhausted(u64),
}

/// 不经完整解码, 快速读出缓冲区开头的元素 ID
fn peek_id(buf: &[u8]) -> Option<u32> {
    let first = *buf.first()?;
    let width = vint_width(first).filter(|&w| w <= MAX_ID_WIDTH)?;
    let bytes = buf.get(..width)?;
    Some(bytes.iter().fold(0u32, |id, &b| (id << 8) | u32::from(b)))
}

/// 从 `start` 开始逐字节扫描, 找到第一个 ID 属于 `ids` 且头部可解码的元素
///
/// `until` 为扫描上限 (不含), `None` 表示直到数据末尾.
pub async fn scan_for_element_id(
    reader: &Reader,
    start: u64,
    ids: &[u32],
    until: Option<u64>,
    chunk_size: usize,
) -> VesselResult<ScanOutcome> {
    let chunk_size = chunk_size.max(1);
    // 多读一个头部的长度, 避免漏掉跨越分块边界的元素
    let want = chunk_size + MAX_HEADER_SIZE;
    let mut pos = start;

    loop {
        if let Some(limit) = until.filter(|&limit| pos >= limit) {
            return Ok(ScanOutcome::Exhausted(limit));
        }

        let Some(mut slice) = reader.request_slice_range(pos, 0, want).await? else {
            return Ok(ScanOutcome::Exhausted(pos));
        };
        if slice.is_empty() {
            return Ok(ScanOutcome::Exhausted(pos));
        }

        let is_last = slice.len() < want;
        let scan_len = if is_last { slice.len() } else { chunk_size };
        let window = slice.clone();
        let buf = window.remaining_bytes();

        for i in 0..scan_len {
            let offset = pos + i as u64;
            if let Some(limit) = until.filter(|&limit| offset >= limit) {
                return Ok(ScanOutcome::Exhausted(limit));
            }
            let Some(id) = peek_id(&buf[i..]) else {
                continue;
            };
            if !ids.contains(&id) {
                continue;
            }
            slice.set_file_pos(offset);
            if read_element_header(&mut slice).is_some() {
                return Ok(ScanOutcome::Found(offset));
            }
        }

        if is_last {
            let end = pos + slice.len() as u64;
            return Ok(ScanOutcome::Exhausted(until.map_or(end, |limit| end.min(limit))));
        }
        pos += chunk_size as u64;
    }
}

/// 查找下一个 ID 属于 `ids` 的元素
///
/// 找不到时返回扫描上限或数据末尾, 用于确定未知大小元素的实际范围.
pub async fn search_for_next_element_id(
    reader: &Reader,
    start: u64,
    ids: &[u32],
    until: Option<u64>,
    chunk_size: usize,
) -> VesselResult<u64> {
    Ok(
        match scan_for_element_id(reader, start, ids, until, chunk_size).await? {
            ScanOutcome::Found(pos) | ScanOutcome::Exhausted(pos) => pos,
        },
    )
}

/// 损坏数据后的重新同步
///
/// 从 `start + 1` 开始 (保证前进), 在 `until` 之前寻找可识别的元素.
/// 窗口耗尽时返回 `None`.
pub async fn resync(
    reader: &Reader,
    start: u64,
    ids: &[u32],
    until: u64,
    chunk_size: usize,
) -> VesselResult<Option<u64>> {
    Ok(
        match scan_for_element_id(reader, start + 1, ids, Some(until), chunk_size).await? {
            ScanOutcome::Found(pos) => Some(pos),
            ScanOutcome::Exhausted(_) => None,
        },
    )
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::super::ebml::{CLUSTER, CUES, LEVEL_1_IDS, SEGMENT_INFO, VOID};
    use super::*;

    fn slice(data: &[u8], start: u64) -> FileSlice {
        FileSlice::new(Bytes::copy_from_slice(data), start)
    }

    #[test]
    fn test_read_header() {
        let mut s = slice(&[0x1F, 0x43, 0xB6, 0x75, 0x84, 1, 2, 3, 4], 100);
        let header = read_element_header(&mut s).unwrap();
        assert_eq!(header.id, CLUSTER);
        assert_eq!(header.size, Some(4));
        assert_eq!(header.header_len, 5);
        assert_eq!(header.start(), 100);
        assert_eq!(header.data_start, 105);
        assert_eq!(header.data_end(), Some(109));
    }

    #[test]
    fn test_no_element_on_padding_and_truncation() {
        let mut s = slice(&[0x00, 0x81], 0);
        assert!(read_element_header(&mut s).is_none());
        assert_eq!(s.file_pos(), 0);
        assert!(read_element_header(&mut slice(&[0xFF, 0x81], 0)).is_none());
        assert!(read_element_header(&mut slice(&[0x1F, 0x43], 0)).is_none());
    }

    #[test]
    fn test_child_elements() {
        // VOID(2) + CUES(1) + 声明 5 字节但只剩 1 字节的 INFO
        let data = [0xEC, 0x82, 0, 0, 0x1C, 0x53, 0xBB, 0x6B, 0x81, 7, 0x15, 0x49, 0xA9, 0x66, 0x85, 1];
        let children: Vec<_> = ChildElements::new(slice(&data, 0)).collect();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].0.id, VOID);
        assert_eq!(children[1].0.id, CUES);
        assert_eq!(children[1].1.start(), 9);
        assert_eq!(children[1].1.len(), 1);
        assert!(!children.iter().any(|(h, _)| h.id == SEGMENT_INFO));
    }

    #[test]
    fn test_child_unknown_size_spans_parent() {
        let data = [0xA3, 0xFF, 1, 2, 3];
        let (header, body) = ChildElements::new(slice(&data, 0)).next().unwrap();
        assert_eq!(header.size, None);
        assert_eq!(body.len(), 3);
    }

    #[tokio::test]
    async fn test_search_across_chunk_boundary() {
        let mut data = vec![0u8; 30];
        data.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0x80]);
        data.extend_from_slice(&[0u8; 40]);
        let reader = Reader::from_bytes(data);
        // 分块大小 8: 目标元素位于第四个分块
        let pos = search_for_next_element_id(&reader, 0, LEVEL_1_IDS, None, 8)
            .await
            .unwrap();
        assert_eq!(pos, 30);
        // 分块大小 32: 元素头部跨越分块边界
        let pos = search_for_next_element_id(&reader, 0, LEVEL_1_IDS, None, 32)
            .await
            .unwrap();
        assert_eq!(pos, 30);
    }

    #[tokio::test]
    async fn test_search_returns_end_when_missing() {
        let reader = Reader::from_bytes(vec![0u8; 100]);
        let pos = search_for_next_element_id(&reader, 4, LEVEL_1_IDS, None, 16)
            .await
            .unwrap();
        assert_eq!(pos, 100);
        let pos = search_for_next_element_id(&reader, 4, LEVEL_1_IDS, Some(50), 16)
            .await
            .unwrap();
        assert_eq!(pos, 50);
    }

    #[tokio::test]
    async fn test_resync_skips_start_and_respects_window() {
        let mut data = vec![0x1F, 0x43, 0xB6, 0x75, 0x80];
        data.extend_from_slice(&[0x42; 20]);
        data.extend_from_slice(&[0x1F, 0x43, 0xB6, 0x75, 0x80]);
        let reader = Reader::from_bytes(data);
        assert_eq!(
            resync(&reader, 0, &[CLUSTER], 100, 8).await.unwrap(),
            Some(25)
        );
        assert_eq!(resync(&reader, 0, &[CLUSTER], 20, 8).await.unwrap(), None);
    }
}

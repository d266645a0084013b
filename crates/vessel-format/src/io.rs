//! 字节区间数据源抽象.
//!
//! 解封装器不假设数据可以顺序读完: 数据源按绝对偏移提供字节区间,
//! 可能需要异步等待, 也可能总长度未知 (例如直播流).
//!
//! - [`ByteSource`]: 底层数据源 (内存、文件、网络等)
//! - [`Reader`]: 在数据源之上提供 `request_slice` / `request_slice_range`
//! - [`FileSlice`]: 带绝对偏移的内存字节窗口, 供解析器按游标读取

use std::io::{self, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use vessel_core::{VesselError, VesselResult};

/// 字节区间数据源
///
/// 实现此 trait 以接入不同的数据来源.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// 数据总大小, `None` 表示未知或无界
    fn size(&self) -> Option<u64>;

    /// 从 `offset` 开始读取至多 `max_len` 字节
    ///
    /// 到达数据末尾时可以返回少于 `max_len` 的字节 (包括 0 字节).
    async fn read_at(&self, offset: u64, max_len: usize) -> io::Result<Bytes>;
}

/// 内存数据源
///
/// 用于测试和已完整载入内存的数据.
pub struct MemorySource {
    /// 全部数据
    data: Bytes,
    /// 是否向上层报告总大小
    sized: bool,
}

impl MemorySource {
    /// 从数据创建, 报告总大小
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            sized: true,
        }
    }

    /// 从数据创建, 但不报告总大小 (模拟直播流)
    pub fn unbounded(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            sized: false,
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn size(&self) -> Option<u64> {
        self.sized.then_some(self.data.len() as u64)
    }

    async fn read_at(&self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let start = offset as usize;
        let end = start.saturating_add(max_len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

/// 文件数据源
pub struct FileSource {
    /// 文件句柄 (seek + read 需要独占)
    file: Mutex<tokio::fs::File>,
    /// 打开时的文件大小
    size: u64,
}

impl FileSource {
    /// 打开文件 (只读)
    pub async fn open(path: impl AsRef<std::path::Path>) -> VesselResult<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn read_at(&self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let to_read = (self.size - offset).min(max_len as u64) as usize;
        let mut buf = vec![0u8; to_read];

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < to_read {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// 数据读取器
///
/// 对解析器暴露"按偏移请求字节区间"的接口.
/// 返回 `Ok(None)` 表示该位置没有足够数据 (截断), 不是错误.
#[derive(Clone)]
pub struct Reader {
    /// 底层数据源
    source: Arc<dyn ByteSource>,
}

impl Reader {
    /// 从数据源创建读取器
    pub fn new(source: Arc<dyn ByteSource>) -> Self {
        Self { source }
    }

    /// 从内存数据创建读取器
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(Arc::new(MemorySource::new(data)))
    }

    /// 数据总大小, `None` 表示未知
    pub fn file_size(&self) -> Option<u64> {
        self.source.size()
    }

    /// 请求恰好 `len` 字节
    pub async fn request_slice(&self, offset: u64, len: usize) -> VesselResult<Option<FileSlice>> {
        self.request_slice_range(offset, len, len).await
    }

    /// 请求至少 `min_len`、至多 `max_len` 字节
    pub async fn request_slice_range(
        &self,
        offset: u64,
        min_len: usize,
        max_len: usize,
    ) -> VesselResult<Option<FileSlice>> {
        let max_len = match self.file_size() {
            Some(size) if offset >= size => {
                return Ok((min_len == 0).then(|| FileSlice::new(Bytes::new(), offset)));
            }
            Some(size) => max_len.min((size - offset).min(usize::MAX as u64) as usize),
            None => max_len,
        };
        if max_len < min_len {
            return Ok(None);
        }

        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total = 0usize;
        // 数据源可能分多次返回, 读到至少 min_len 或数据耗尽为止
        while total < max_len {
            let chunk = self
                .source
                .read_at(offset + total as u64, max_len - total)
                .await?;
            if chunk.is_empty() {
                break;
            }
            total += chunk.len();
            chunks.push(chunk);
            if total >= min_len {
                break;
            }
        }

        if total < min_len {
            return Ok(None);
        }
        let bytes = if chunks.len() == 1 {
            chunks.pop().unwrap_or_default()
        } else {
            let mut joined = Vec::with_capacity(total);
            for chunk in &chunks {
                joined.extend_from_slice(chunk);
            }
            Bytes::from(joined)
        };
        Ok(Some(FileSlice::new(bytes, offset)))
    }
}

/// 带绝对偏移的字节窗口
///
/// 游标以文件绝对偏移表示, 超出窗口的读取返回 [`VesselError::Eof`].
#[derive(Debug, Clone)]
pub struct FileSlice {
    /// 窗口数据
    bytes: Bytes,
    /// 窗口起始的文件偏移
    start: u64,
    /// 窗口内游标
    pos: usize,
}

impl FileSlice {
    /// 创建窗口, 游标位于起点
    pub fn new(bytes: Bytes, start: u64) -> Self {
        Self {
            bytes,
            start,
            pos: 0,
        }
    }

    /// 窗口起始的文件偏移
    pub fn start(&self) -> u64 {
        self.start
    }

    /// 窗口结束的文件偏移 (不含)
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    /// 窗口总长度
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 窗口是否为空
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 游标处的文件偏移
    pub fn file_pos(&self) -> u64 {
        self.start + self.pos as u64
    }

    /// 将游标移动到指定文件偏移 (会被限制在窗口范围内)
    pub fn set_file_pos(&mut self, file_pos: u64) {
        let rel = file_pos.saturating_sub(self.start).min(self.bytes.len() as u64);
        self.pos = rel as usize;
    }

    /// 游标之后剩余的字节数
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// 游标之后的字节 (不移动游标)
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    /// 读取 1 个字节
    pub fn read_u8(&mut self) -> VesselResult<u8> {
        let b = *self.bytes.get(self.pos).ok_or(VesselError::Eof)?;
        self.pos += 1;
        Ok(b)
    }

    /// 读取 i16 大端
    pub fn read_i16_be(&mut self) -> VesselResult<i16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(i16::from_be_bytes([hi, lo]))
    }

    /// 读取 `count` 字节 (零拷贝)
    pub fn read_bytes(&mut self, count: usize) -> VesselResult<Bytes> {
        if count > self.remaining() {
            return Err(VesselError::Eof);
        }
        let out = self.bytes.slice(self.pos..self.pos + count);
        self.pos += count;
        Ok(out)
    }

    /// 读取游标之后的全部字节
    pub fn read_rest(&mut self) -> Bytes {
        let out = self.bytes.slice(self.pos..);
        self.pos = self.bytes.len();
        out
    }

    /// 截取游标之后的 `count` 字节作为子窗口, 并推进游标
    pub fn sub_slice(&mut self, count: u64) -> VesselResult<FileSlice> {
        let start = self.file_pos();
        let bytes = self.read_bytes(usize::try_from(count).map_err(|_| VesselError::Eof)?)?;
        Ok(FileSlice::new(bytes, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 每次只返回少量字节的数据源, 用于验证读取器的拼接逻辑
    struct Trickle(Bytes);

    #[async_trait]
    impl ByteSource for Trickle {
        fn size(&self) -> Option<u64> {
            None
        }

        async fn read_at(&self, offset: u64, max_len: usize) -> io::Result<Bytes> {
            let start = (offset as usize).min(self.0.len());
            let end = (start + max_len.min(3)).min(self.0.len());
            Ok(self.0.slice(start..end))
        }
    }

    #[tokio::test]
    async fn test_request_slice_exact() {
        let reader = Reader::from_bytes(vec![1u8, 2, 3, 4, 5]);
        let slice = reader.request_slice(1, 3).await.unwrap().unwrap();
        assert_eq!(slice.start(), 1);
        assert_eq!(slice.len(), 3);
        assert!(reader.request_slice(3, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_slice_range_clamps_to_size() {
        let reader = Reader::from_bytes(vec![0u8; 10]);
        let slice = reader.request_slice_range(6, 2, 100).await.unwrap().unwrap();
        assert_eq!(slice.len(), 4);
        assert!(reader.request_slice_range(9, 2, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unbounded_source_joins_chunks() {
        let reader = Reader::new(Arc::new(Trickle(Bytes::from_static(b"abcdefgh"))));
        assert_eq!(reader.file_size(), None);
        let slice = reader.request_slice(1, 6).await.unwrap().unwrap();
        assert_eq!(&slice.bytes[..], b"bcdefg");
        assert!(reader.request_slice(4, 6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let source = FileSource::open(tmp.path()).await.unwrap();
        let reader = Reader::new(Arc::new(source));
        assert_eq!(reader.file_size(), Some(10));
        let slice = reader.request_slice(4, 3).await.unwrap().unwrap();
        assert_eq!(&slice.bytes[..], b"456");
    }

    #[test]
    fn test_file_slice_cursor() {
        let mut slice = FileSlice::new(Bytes::from_static(&[0x12, 0x34, 0xFF, 0xFE, 9]), 100);
        assert_eq!(slice.read_i16_be().unwrap(), 0x1234);
        assert_eq!(slice.file_pos(), 102);
        let mut sub = slice.sub_slice(2).unwrap();
        assert_eq!(sub.start(), 102);
        assert_eq!(sub.read_i16_be().unwrap(), -2);
        assert_eq!(slice.remaining(), 1);
        assert!(matches!(slice.sub_slice(2), Err(VesselError::Eof)));
    }
}

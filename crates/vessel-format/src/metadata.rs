//! 容器级元数据标签.

use bytes::Bytes;

/// 附带的图片 (封面等)
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedImage {
    /// 图片数据
    pub data: Bytes,
    /// MIME 类型
    pub mime_type: String,
    /// 文件名
    pub name: Option<String>,
    /// 描述
    pub description: Option<String>,
}

/// 容器级元数据标签
///
/// 常用字段单独列出, 所有原始键值对同时保存在 `raw` 中.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTags {
    pub title: Option<String>,
    pub description: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub comment: Option<String>,
    pub date: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    /// 附带的图片
    pub images: Vec<AttachedImage>,
    /// 原始键值对 (键保持容器中的大小写)
    pub raw: Vec<(String, String)>,
}

impl MetadataTags {
    /// 是否不含任何标签
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

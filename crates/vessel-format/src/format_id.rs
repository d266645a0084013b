//! 容器格式标识符.

use std::fmt;

/// 容器格式标识符
///
/// Matroska 与 WebM 共用同一套 EBML 结构, 只有 DocType 不同.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatId {
    /// Matroska (MKV/MKA)
    Matroska,
    /// WebM (Matroska 子集)
    Webm,
}

impl FormatId {
    /// 格式名称
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Matroska => "matroska",
            Self::Webm => "webm",
        }
    }

    /// 由 EBML 头部的 DocType 确定格式
    pub fn from_doc_type(doc_type: &str) -> Self {
        if doc_type == "webm" {
            Self::Webm
        } else {
            Self::Matroska
        }
    }

    /// MIME 子类型 (`video/<subtype>`)
    pub const fn mime_subtype(&self) -> &'static str {
        match self {
            Self::Matroska => "x-matroska",
            Self::Webm => "webm",
        }
    }

    /// 常用文件扩展名
    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Matroska => &["mkv", "mka", "mks", "mk3d"],
            Self::Webm => &["webm"],
        }
    }

    /// 从文件名猜测格式
    pub fn from_filename(filename: &str) -> Option<FormatId> {
        let ext = filename.rsplit('.').next()?.to_lowercase();
        [Self::Matroska, Self::Webm]
            .into_iter()
            .find(|id| id.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_filename() {
        assert_eq!(FormatId::from_filename("a.MKV"), Some(FormatId::Matroska));
        assert_eq!(FormatId::from_filename("clip.webm"), Some(FormatId::Webm));
        assert_eq!(FormatId::from_filename("clip.mp4"), None);
    }

    #[test]
    fn test_doc_type() {
        assert_eq!(FormatId::from_doc_type("webm"), FormatId::Webm);
        assert_eq!(FormatId::from_doc_type("matroska"), FormatId::Matroska);
    }
}

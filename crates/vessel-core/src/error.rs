//! 统一错误类型定义.
//!
//! 错误分为两类: 调用方/逻辑错误 (致命) 与数据问题. 数据截断不属于错误,
//! 由读取接口以 `None` 表示; 只有真正无法继续时才返回 `Err`.

use thiserror::Error;

/// Vessel 统一错误类型
#[derive(Debug, Error)]
pub enum VesselError {
    /// 无效参数 (例如把一个轨道的数据包交给另一个轨道)
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的内容 (例如无法还原的内容编码)
    #[error("不支持的内容: {0}")]
    Unsupported(String),

    /// 容器格式错误
    #[error("格式错误: {0}")]
    Format(String),

    /// 底层数据源的 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 已到达数据末尾
    #[error("已到达数据末尾")]
    Eof,

    /// 无效数据 (损坏的元素、无法识别的文件等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 内部不变量被破坏 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// Vessel 统一 Result 类型
pub type VesselResult<T> = Result<T, VesselError>;

impl VesselError {
    /// 是否为数据截断导致的错误
    ///
    /// 截断在查找路径上按"没有更多数据"处理, 不向调用方抛出.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_classification() {
        assert!(VesselError::Eof.is_truncation());
        assert!(!VesselError::InvalidData("x".into()).is_truncation());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: VesselError = io.into();
        assert!(matches!(err, VesselError::Io(_)));
        assert!(err.to_string().contains("short read"));
    }
}

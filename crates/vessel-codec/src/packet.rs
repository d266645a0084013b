//! 压缩数据包 (Packet).
//!
//! 解封装器返回给调用方的一帧压缩数据. 除了时间信息和负载外,
//! 数据包还携带一个不透明的来源引用, 解封装器可以凭它从该帧继续向后查找,
//! 而不必从头重新定位.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use vessel_core::Rational;

/// 数据包来源引用
///
/// 内容只对产生该数据包的解封装器有意义, 其他代码只能整体传递.
#[derive(Clone)]
pub struct PacketOrigin(Arc<dyn Any + Send + Sync>);

impl PacketOrigin {
    /// 用任意解封装器私有的定位信息构造
    pub fn new<T: Any + Send + Sync>(location: T) -> Self {
        Self(Arc::new(location))
    }

    /// 取回定位信息, 类型不符时返回 `None`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for PacketOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PacketOrigin(..)")
    }
}

/// 压缩数据包
#[derive(Debug, Clone)]
pub struct Packet {
    /// 压缩数据; 仅请求元数据时为空
    pub data: Bytes,
    /// 附加数据 (例如 Alpha 平面)
    pub side_data: Option<Bytes>,
    /// 显示时间戳 (以 time_base 为单位)
    pub pts: i64,
    /// 解码时间戳 (容器不提供解码顺序时等于 pts)
    pub dts: i64,
    /// 时长 (以 time_base 为单位)
    pub duration: i64,
    /// 时间基
    pub time_base: Rational,
    /// 所属轨道 ID
    pub track_id: u64,
    /// 是否为关键帧
    pub is_keyframe: bool,
    /// 所在数据簇的字节偏移 (-1 表示未知)
    pub pos: i64,
    /// 负载的真实字节数 (即使 `data` 被占位替换也保持准确)
    pub byte_length: usize,
    /// 是否只包含元数据 (负载为占位)
    pub metadata_only: bool,
    /// 解封装器私有的来源引用
    pub origin: Option<PacketOrigin>,
}

impl Packet {
    /// 从负载创建数据包, 其余字段取默认值
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            byte_length: data.len(),
            data,
            side_data: None,
            pts: vessel_core::timestamp::NOPTS_VALUE,
            dts: vessel_core::timestamp::NOPTS_VALUE,
            duration: 0,
            time_base: Rational::UNDEFINED,
            track_id: 0,
            is_keyframe: false,
            pos: -1,
            metadata_only: false,
            origin: None,
        }
    }

    /// 创建只含元数据的数据包, 负载以空占位代替
    pub fn placeholder(byte_length: usize) -> Self {
        Self {
            byte_length,
            metadata_only: true,
            ..Self::from_data(Bytes::new())
        }
    }

    /// 负载大小 (字节)
    pub fn size(&self) -> usize {
        self.byte_length
    }

    /// 结束时间戳 (pts + duration)
    pub fn end_pts(&self) -> i64 {
        self.pts.saturating_add(self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_keeps_size() {
        let pkt = Packet::placeholder(1024);
        assert!(pkt.data.is_empty());
        assert!(pkt.metadata_only);
        assert_eq!(pkt.size(), 1024);
    }

    #[test]
    fn test_origin_roundtrip() {
        #[derive(Debug, PartialEq)]
        struct Loc(u32);
        let origin = PacketOrigin::new(Loc(7));
        assert_eq!(origin.downcast_ref::<Loc>(), Some(&Loc(7)));
        assert!(origin.downcast_ref::<u64>().is_none());
    }
}

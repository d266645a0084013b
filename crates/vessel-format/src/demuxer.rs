//! 解封装器 (Demuxer) 与轨道后端 (TrackBacking) trait 定义.
//!
//! 解封装器只在第一次被询问时解析容器结构, 之后所有调用共享同一份结果.
//! 数据包按轨道查找: 每个轨道后端都支持"第一个/指定时间/下一个/关键帧"查询.

use std::sync::Arc;

use async_trait::async_trait;
use vessel_codec::{CodecId, Packet};
use vessel_core::{MediaType, Rational, VesselResult};

use crate::format_id::FormatId;
use crate::metadata::MetadataTags;
use crate::track::TrackKind;

/// 数据包读取选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// 只需要时间与大小信息, 负载用占位代替
    pub metadata_only: bool,
}

impl ReadOptions {
    /// 只读取元数据的选项
    pub const METADATA_ONLY: Self = Self {
        metadata_only: true,
    };
}

/// 解封装器 trait
#[async_trait]
pub trait Demuxer: Send + Sync {
    /// 解封装器名称
    fn name(&self) -> &str;

    /// 容器格式 (需要读取头部)
    async fn format_id(&self) -> VesselResult<FormatId>;

    /// 所有可用轨道, 默认轨道排在前面
    async fn tracks(&self) -> VesselResult<Vec<Arc<dyn TrackBacking>>>;

    /// 容器时长 (秒): 所有轨道结束时间的最大值
    async fn compute_duration(&self) -> VesselResult<f64>;

    /// 完整的 MIME 类型 (包含 codecs 参数)
    async fn mime_type(&self) -> VesselResult<String>;

    /// 容器级元数据标签
    async fn metadata_tags(&self) -> VesselResult<MetadataTags>;
}

/// 轨道后端 trait
///
/// 所有时间戳参数与返回值均以 [`TrackBacking::time_base`] 为单位.
/// 数据缺失 (文件截断、索引不存在) 时返回 `Ok(None)`, 不返回错误.
#[async_trait]
pub trait TrackBacking: Send + Sync {
    /// 轨道 ID (在所属 Segment 内唯一)
    fn id(&self) -> u64;

    /// 轨道类型与专有参数
    fn kind(&self) -> &TrackKind;

    /// 编解码器
    fn codec_id(&self) -> CodecId;

    /// 容器内的原始编解码器字符串
    fn codec_string(&self) -> &str;

    /// 解码器配置数据 (CodecPrivate)
    fn decoder_config(&self) -> Option<&[u8]>;

    /// 语言 (ISO 639-2 或 BCP 47), 未知时为 `"und"`
    fn language(&self) -> &str;

    /// 轨道名称
    fn name(&self) -> Option<&str>;

    /// 是否为默认轨道
    fn is_default(&self) -> bool;

    /// 是否为强制轨道 (例如必须显示的字幕)
    fn is_forced(&self) -> bool {
        false
    }

    /// 解码器引入的延迟 (纳秒)
    fn codec_delay(&self) -> u64 {
        0
    }

    /// 跳转后需要先解码丢弃的时长 (纳秒)
    fn seek_pre_roll(&self) -> u64 {
        0
    }

    /// 时间基
    fn time_base(&self) -> Rational;

    /// 媒体类型
    fn media_type(&self) -> MediaType {
        self.kind().media_type()
    }

    /// 采样率 (仅音频)
    fn sample_rate(&self) -> Option<u32> {
        match self.kind() {
            TrackKind::Audio(a) => Some(a.sample_rate),
            _ => None,
        }
    }

    /// 声道数 (仅音频)
    fn channel_count(&self) -> Option<u32> {
        match self.kind() {
            TrackKind::Audio(a) => Some(a.channels),
            _ => None,
        }
    }

    /// 编码宽度 (仅视频)
    fn coded_width(&self) -> Option<u32> {
        match self.kind() {
            TrackKind::Video(v) => Some(v.coded_width),
            _ => None,
        }
    }

    /// 编码高度 (仅视频)
    fn coded_height(&self) -> Option<u32> {
        match self.kind() {
            TrackKind::Video(v) => Some(v.coded_height),
            _ => None,
        }
    }

    /// 第一个数据包
    async fn get_first_packet(&self, options: ReadOptions) -> VesselResult<Option<Packet>>;

    /// 覆盖 `timestamp` 的数据包; 超出轨道范围时返回最后一个数据包
    async fn get_packet(&self, timestamp: i64, options: ReadOptions)
    -> VesselResult<Option<Packet>>;

    /// 显示顺序上的下一个数据包
    async fn get_next_packet(
        &self,
        packet: &Packet,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>>;

    /// `timestamp` 处或之前最近的关键帧
    async fn get_key_packet(
        &self,
        timestamp: i64,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>>;

    /// 显示顺序上的下一个关键帧
    async fn get_next_key_packet(
        &self,
        packet: &Packet,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>>;

    /// 轨道时长 (秒): 最后一个数据包的结束时间
    async fn compute_duration(&self) -> VesselResult<f64>;
}

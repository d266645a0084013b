//! 轨道信息定义.
//!
//! 不同媒体类型的参数用封闭的枚举表示, 每个变体只携带与之相关的字段.

use vessel_core::MediaType;

/// 轨道类型及其专有参数
#[derive(Debug, Clone, PartialEq)]
pub enum TrackKind {
    /// 视频轨道
    Video(VideoTrackInfo),
    /// 音频轨道
    Audio(AudioTrackInfo),
    /// 字幕轨道
    Subtitle,
}

impl TrackKind {
    /// 对应的媒体类型
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::Video(_) => MediaType::Video,
            Self::Audio(_) => MediaType::Audio,
            Self::Subtitle => MediaType::Subtitle,
        }
    }
}

/// 视频轨道参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoTrackInfo {
    /// 编码宽度 (像素)
    pub coded_width: u32,
    /// 编码高度 (像素)
    pub coded_height: u32,
    /// 显示宽度 (未声明时等于编码宽度)
    pub display_width: u32,
    /// 显示高度 (未声明时等于编码高度)
    pub display_height: u32,
    /// 顺时针旋转角度 (0/90/180/270)
    pub rotation: u16,
    /// 是否隔行
    pub interlaced: bool,
}

/// 音频轨道参数
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackInfo {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 声道数
    pub channels: u32,
    /// 位深 (未声明时为 None)
    pub bit_depth: Option<u32>,
}

impl Default for AudioTrackInfo {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            bit_depth: None,
        }
    }
}

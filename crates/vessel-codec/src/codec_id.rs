//! 编解码器标识符.

use std::fmt;
use vessel_core::MediaType;

/// 编解码器标识符
///
/// 唯一标识一种编码格式, 与容器格式无关.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecId {
    /// 未知编解码器
    None,

    // ========================
    // 视频
    // ========================
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
    /// VP8
    Vp8,
    /// VP9
    Vp9,
    /// AV1
    Av1,
    /// MPEG-1 Video
    Mpeg1Video,
    /// MPEG-2 Video
    Mpeg2Video,
    /// MPEG-4 Part 2
    Mpeg4,
    /// Theora
    Theora,
    /// VfW 兼容的 FourCC 视频
    VfwFourcc,

    // ========================
    // 音频
    // ========================
    /// AAC
    Aac,
    /// MP3
    Mp3,
    /// MP2
    Mp2,
    /// Opus
    Opus,
    /// Vorbis
    Vorbis,
    /// FLAC
    Flac,
    /// Apple Lossless
    Alac,
    /// AC-3
    Ac3,
    /// E-AC-3
    Eac3,
    /// DTS
    Dts,
    /// PCM 整数小端
    PcmIntLe,
    /// PCM 整数大端
    PcmIntBe,
    /// PCM 浮点
    PcmFloat,

    // ========================
    // 字幕
    // ========================
    /// 纯文本 UTF-8 (SubRip 风格)
    Srt,
    /// ASS / SSA
    Ass,
    /// WebVTT
    Webvtt,
    /// DVD 位图字幕
    DvdSubtitle,
    /// HDMV PGS 字幕
    HdmvPgsSubtitle,
}

impl CodecId {
    /// 编解码器对应的媒体类型, 未知编解码器返回 `None`
    pub const fn media_type(&self) -> Option<MediaType> {
        match self {
            Self::None => None,
            Self::H264
            | Self::H265
            | Self::Vp8
            | Self::Vp9
            | Self::Av1
            | Self::Mpeg1Video
            | Self::Mpeg2Video
            | Self::Mpeg4
            | Self::Theora
            | Self::VfwFourcc => Some(MediaType::Video),
            Self::Aac
            | Self::Mp3
            | Self::Mp2
            | Self::Opus
            | Self::Vorbis
            | Self::Flac
            | Self::Alac
            | Self::Ac3
            | Self::Eac3
            | Self::Dts
            | Self::PcmIntLe
            | Self::PcmIntBe
            | Self::PcmFloat => Some(MediaType::Audio),
            Self::Srt | Self::Ass | Self::Webvtt | Self::DvdSubtitle | Self::HdmvPgsSubtitle => {
                Some(MediaType::Subtitle)
            }
        }
    }

    /// 人类可读名称
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::H264 => "h264",
            Self::H265 => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Mpeg1Video => "mpeg1video",
            Self::Mpeg2Video => "mpeg2video",
            Self::Mpeg4 => "mpeg4",
            Self::Theora => "theora",
            Self::VfwFourcc => "vfw",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Mp2 => "mp2",
            Self::Opus => "opus",
            Self::Vorbis => "vorbis",
            Self::Flac => "flac",
            Self::Alac => "alac",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Dts => "dts",
            Self::PcmIntLe => "pcm_le",
            Self::PcmIntBe => "pcm_be",
            Self::PcmFloat => "pcm_float",
            Self::Srt => "srt",
            Self::Ass => "ass",
            Self::Webvtt => "webvtt",
            Self::DvdSubtitle => "dvd_subtitle",
            Self::HdmvPgsSubtitle => "hdmv_pgs_subtitle",
        }
    }

    /// MIME `codecs` 参数里使用的简短标识
    ///
    /// 只返回无需检查码流即可确定的前缀; 其余编码返回 `None`.
    pub const fn mime_codec(&self) -> Option<&'static str> {
        match self {
            Self::H264 => Some("avc1"),
            Self::H265 => Some("hvc1"),
            Self::Vp8 => Some("vp8"),
            Self::Vp9 => Some("vp09"),
            Self::Av1 => Some("av01"),
            Self::Aac => Some("mp4a"),
            Self::Mp3 => Some("mp3"),
            Self::Opus => Some("opus"),
            Self::Vorbis => Some("vorbis"),
            Self::Flac => Some("flac"),
            Self::Ac3 => Some("ac-3"),
            Self::Eac3 => Some("ec-3"),
            Self::Webvtt => Some("wvtt"),
            _ => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_grouping() {
        assert_eq!(CodecId::Vp9.media_type(), Some(MediaType::Video));
        assert_eq!(CodecId::Opus.media_type(), Some(MediaType::Audio));
        assert_eq!(CodecId::Webvtt.media_type(), Some(MediaType::Subtitle));
        assert_eq!(CodecId::None.media_type(), None);
    }

    #[test]
    fn test_mime_codec() {
        assert_eq!(CodecId::Vp9.mime_codec(), Some("vp09"));
        assert_eq!(CodecId::Theora.mime_codec(), None);
    }
}

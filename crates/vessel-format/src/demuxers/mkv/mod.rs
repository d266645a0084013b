//! Matroska/WebM 解封装器.
//!
//! 支持 Matroska (.mkv/.mka) 和 WebM (.webm) 容器格式.
//! 基于 EBML (Extensible Binary Meta Language) 编码.
//!
//! # Matroska 结构概览
//! ```text
//! EBML Header        文件头 (DocType: "matroska" 或 "webm")
//! Segment            根容器
//! ├── SeekHead       索引 (可选)
//! ├── Info           段信息 (时间刻度, 时长)
//! ├── Tracks         轨道定义 (编解码器, 参数)
//! ├── Cluster        数据簇
//! │   ├── Timestamp  簇时间戳
//! │   └── SimpleBlock / BlockGroup  音视频数据块
//! ├── Cues           时间索引 (可选)
//! └── Tags           元数据标签 (可选)
//! ```
//!
//! # 随机访问
//! 解封装器不会顺序读取整个文件. 打开时只遍历到第一个数据簇为止
//! (加上 SeekHead 指向的元数据), 数据簇在查找时按需加载.
//! 查找起点来自 Cues 与运行中积累的位置缓存, 两者都可能不准确,
//! 查找引擎会验证并回退.

pub mod cache;
pub mod cluster;
pub mod ebml;
pub mod index;
pub mod lacing;
pub mod lookup;
pub mod segment;
pub mod track;
pub mod walker;

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::OnceCell;
use vessel_codec::CodecId;
use vessel_core::{MediaType, VesselError, VesselResult};

use self::ebml::*;
use self::segment::Segment;
use self::track::MkvTrackBacking;
use self::walker::{ChildElements, DEFAULT_SCAN_CHUNK_SIZE, MAX_RESYNC_LENGTH, read_element_header_at};
use crate::demuxer::{Demuxer, TrackBacking};
use crate::format_id::FormatId;
use crate::io::Reader;
use crate::metadata::MetadataTags;
use crate::probe::{FormatProbe, ProbeResult, SCORE_EXTENSION, SCORE_MAGIC, SCORE_MAX};

/// Matroska 解封装配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkvConfig {
    /// 数据损坏时重新同步的最大扫描长度 (字节)
    pub max_resync_length: u64,
    /// 逐字节扫描时每次读取的分块大小 (字节)
    pub scan_chunk_size: usize,
}

impl Default for MkvConfig {
    fn default() -> Self {
        Self {
            max_resync_length: MAX_RESYNC_LENGTH,
            scan_chunk_size: DEFAULT_SCAN_CHUNK_SIZE,
        }
    }
}

/// 打开时读取的容器结构
struct MkvMetadata {
    format_id: FormatId,
    segments: Vec<Arc<Segment>>,
    tracks: Vec<Arc<dyn TrackBacking>>,
}

/// Matroska 解封装器
///
/// 容器结构只在第一次被询问时解析, 并发的首次调用共享同一次解析.
pub struct MkvDemuxer {
    reader: Reader,
    config: MkvConfig,
    metadata: OnceCell<MkvMetadata>,
}

impl MkvDemuxer {
    /// 使用默认配置创建
    pub fn new(reader: Reader) -> Self {
        Self::with_config(reader, MkvConfig::default())
    }

    pub fn with_config(reader: Reader, config: MkvConfig) -> Self {
        Self {
            reader,
            config,
            metadata: OnceCell::new(),
        }
    }

    async fn metadata(&self) -> VesselResult<&MkvMetadata> {
        self.metadata.get_or_try_init(|| self.read_metadata()).await
    }

    /// Info 中声明的时长 (秒)
    ///
    /// 只是写入方的声明, 精确值请用 [`Demuxer::compute_duration`].
    pub async fn declared_duration(&self) -> VesselResult<Option<f64>> {
        let metadata = self.metadata().await?;
        Ok(metadata.segments.first().and_then(|s| s.declared_duration))
    }

    /// 遍历顶层元素: EBML 头部与各个 Segment
    async fn read_metadata(&self) -> VesselResult<MkvMetadata> {
        let mut format_id = FormatId::Matroska;
        let mut segments: Vec<Arc<Segment>> = Vec::new();
        let mut pos = 0u64;

        while let Some(header) = read_element_header_at(&self.reader, pos).await? {
            match header.id {
                EBML_HEADER => {
                    if let Some(doc_type) = self.read_doc_type(header.data_start, header.size).await? {
                        debug!("MKV: DocType = {doc_type}");
                        format_id = FormatId::from_doc_type(&doc_type);
                    }
                }
                SEGMENT => {
                    let segment = index::read_segment(&self.reader, header, &self.config).await?;
                    segments.push(Arc::new(segment));
                    // 长度未知的数据源 (直播) 只索引第一个 Segment
                    if self.reader.file_size().is_none() {
                        break;
                    }
                }
                other => debug!("MKV: 跳过顶层元素 0x{other:X} @{pos}"),
            }
            match header.data_end() {
                Some(end) if end > pos => pos = end,
                _ => break,
            }
        }

        if segments.is_empty() {
            return Err(VesselError::InvalidData("MKV: 未找到 Segment".into()));
        }

        let mut tracks: Vec<Arc<dyn TrackBacking>> = Vec::new();
        for segment in &segments {
            for track in &segment.tracks {
                tracks.push(Arc::new(MkvTrackBacking::new(
                    self.reader.clone(),
                    Arc::clone(segment),
                    Arc::clone(track),
                    self.config,
                )));
            }
        }

        Ok(MkvMetadata {
            format_id,
            segments,
            tracks,
        })
    }

    async fn read_doc_type(&self, data_start: u64, size: Option<u64>) -> VesselResult<Option<String>> {
        let Some(size) = size.and_then(|s| usize::try_from(s).ok()) else {
            return Ok(None);
        };
        let Some(body) = self.reader.request_slice(data_start, size).await? else {
            return Ok(None);
        };
        for (header, mut data) in ChildElements::new(body) {
            if header.id == EBML_DOC_TYPE {
                let size = data.len() as u64;
                return Ok(Some(read_string(&mut data, size)?));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Demuxer for MkvDemuxer {
    fn name(&self) -> &str {
        "matroska"
    }

    async fn format_id(&self) -> VesselResult<FormatId> {
        Ok(self.metadata().await?.format_id)
    }

    async fn tracks(&self) -> VesselResult<Vec<Arc<dyn TrackBacking>>> {
        Ok(self.metadata().await?.tracks.clone())
    }

    async fn compute_duration(&self) -> VesselResult<f64> {
        let mut duration = 0.0f64;
        for track in &self.metadata().await?.tracks {
            duration = duration.max(track.compute_duration().await?);
        }
        Ok(duration)
    }

    async fn mime_type(&self) -> VesselResult<String> {
        let metadata = self.metadata().await?;
        let has_video = metadata
            .tracks
            .iter()
            .any(|t| t.media_type() == MediaType::Video);
        let kind = if has_video {
            MediaType::Video
        } else {
            MediaType::Audio
        };

        let mut codecs: Vec<&str> = Vec::new();
        for codec in metadata.tracks.iter().filter_map(|t| t.codec_id().mime_codec()) {
            if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }

        let base = format!("{}/{}", kind.mime_prefix(), metadata.format_id.mime_subtype());
        if codecs.is_empty() {
            Ok(base)
        } else {
            Ok(format!("{base}; codecs=\"{}\"", codecs.join(", ")))
        }
    }

    async fn metadata_tags(&self) -> VesselResult<MetadataTags> {
        let metadata = self.metadata().await?;
        Ok(metadata
            .segments
            .first()
            .map(|s| s.tags.clone())
            .unwrap_or_default())
    }
}

/// Matroska CodecID → CodecId 映射
pub fn mkv_codec_to_id(codec_str: &str) -> CodecId {
    match codec_str {
        // 视频
        "V_MPEG4/ISO/AVC" => CodecId::H264,
        "V_MPEGH/ISO/HEVC" => CodecId::H265,
        "V_VP8" => CodecId::Vp8,
        "V_VP9" => CodecId::Vp9,
        "V_AV1" => CodecId::Av1,
        "V_MPEG4/ISO/SP" | "V_MPEG4/ISO/ASP" | "V_MPEG4/ISO/AP" => CodecId::Mpeg4,
        "V_MPEG1" => CodecId::Mpeg1Video,
        "V_MPEG2" => CodecId::Mpeg2Video,
        "V_THEORA" => CodecId::Theora,
        "V_MS/VFW/FOURCC" => CodecId::VfwFourcc,
        // 音频
        "A_MPEG/L3" => CodecId::Mp3,
        "A_MPEG/L2" => CodecId::Mp2,
        "A_OPUS" | "A_OPUS/EXPERIMENTAL" => CodecId::Opus,
        "A_VORBIS" => CodecId::Vorbis,
        "A_FLAC" => CodecId::Flac,
        "A_ALAC" => CodecId::Alac,
        "A_AC3" => CodecId::Ac3,
        "A_EAC3" => CodecId::Eac3,
        "A_DTS" => CodecId::Dts,
        "A_PCM/INT/LIT" => CodecId::PcmIntLe,
        "A_PCM/INT/BIG" => CodecId::PcmIntBe,
        "A_PCM/FLOAT/IEEE" => CodecId::PcmFloat,
        // A_AAC/MPEG4/LC 等旧式写法
        s if s == "A_AAC" || s.starts_with("A_AAC/") => CodecId::Aac,
        // 字幕
        "S_TEXT/UTF8" => CodecId::Srt,
        "S_TEXT/SSA" | "S_TEXT/ASS" => CodecId::Ass,
        "S_TEXT/WEBVTT" => CodecId::Webvtt,
        "S_VOBSUB" => CodecId::DvdSubtitle,
        "S_HDMV/PGS" => CodecId::HdmvPgsSubtitle,
        _ => CodecId::None,
    }
}

/// Matroska 格式探测器
pub struct MkvProbe;

impl FormatProbe for MkvProbe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeResult> {
        // EBML Header 魔数: 0x1A 0x45 0xDF 0xA3
        if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            // DocType 通常位于头部前 64 字节内
            let head = &data[..data.len().min(64)];
            let (format_id, score) = if head.windows(4).any(|w| w == b"webm") {
                (FormatId::Webm, SCORE_MAX)
            } else if head.windows(8).any(|w| w == b"matroska") {
                (FormatId::Matroska, SCORE_MAX)
            } else {
                (FormatId::Matroska, SCORE_MAGIC)
            };
            return Some(ProbeResult { format_id, score });
        }

        // 扩展名
        filename
            .and_then(FormatId::from_filename)
            .map(|format_id| ProbeResult {
                format_id,
                score: SCORE_EXTENSION,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::ReadOptions;
    use crate::io::MemorySource;
    use crate::track::TrackKind;

    /// 辅助: 写入 EBML 元素 ID (保留标记位)
    fn write_vint_id(buf: &mut Vec<u8>, id: u32) {
        let bytes = id.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        buf.extend_from_slice(&bytes[skip..]);
    }

    /// 辅助: 写入 EBML 变长整数 (大小, 加标记位)
    fn write_vint_size(buf: &mut Vec<u8>, size: u64) {
        if size < 0x7F {
            buf.push(0x80 | size as u8);
        } else if size < 0x3FFF {
            buf.push(0x40 | (size >> 8) as u8);
            buf.push(size as u8);
        } else {
            buf.push(0x10);
            buf.extend_from_slice(&(size as u32).to_be_bytes()[1..]);
        }
    }

    /// 辅助: 写入 EBML 元素 (ID + size + content)
    fn write_element(buf: &mut Vec<u8>, id: u32, content: &[u8]) {
        write_vint_id(buf, id);
        write_vint_size(buf, content.len() as u64);
        buf.extend_from_slice(content);
    }

    /// 辅助: 写入 uint 元素
    fn write_uint_element(buf: &mut Vec<u8>, id: u32, val: u64) {
        let bytes = val.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
        write_element(buf, id, &bytes[skip..]);
    }

    /// 辅助: 写入 float 元素 (8 字节)
    fn write_float_element(buf: &mut Vec<u8>, id: u32, val: f64) {
        write_element(buf, id, &val.to_bits().to_be_bytes());
    }

    /// 辅助: 写入 string 元素
    fn write_string_element(buf: &mut Vec<u8>, id: u32, s: &str) {
        write_element(buf, id, s.as_bytes());
    }

    fn simple_block(track: u8, timestamp: i16, keyframe: bool, payload: &[u8]) -> Vec<u8> {
        let mut block = vec![0x80 | track];
        block.extend_from_slice(&timestamp.to_be_bytes());
        block.push(if keyframe { 0x80 } else { 0x00 });
        block.extend_from_slice(payload);
        block
    }

    /// 构造一个最小的 WebM 文件: 视频 + 音频, 两个数据簇
    fn build_minimal_webm() -> Vec<u8> {
        let mut data = Vec::new();

        let mut ebml_content = Vec::new();
        write_string_element(&mut ebml_content, EBML_DOC_TYPE, "webm");
        write_element(&mut data, EBML_HEADER, &ebml_content);

        let mut segment = Vec::new();

        let mut info = Vec::new();
        write_uint_element(&mut info, INFO_TIMESTAMP_SCALE, 1_000_000);
        write_float_element(&mut info, INFO_DURATION, 5000.0);
        write_string_element(&mut info, INFO_TITLE, "Demo");
        write_element(&mut segment, SEGMENT_INFO, &info);

        let mut tracks = Vec::new();
        {
            let mut entry = Vec::new();
            write_uint_element(&mut entry, TRACK_NUMBER, 1);
            write_uint_element(&mut entry, TRACK_TYPE, 1);
            write_string_element(&mut entry, TRACK_CODEC_ID, "V_VP9");
            write_string_element(&mut entry, TRACK_LANGUAGE, "eng");
            let mut video = Vec::new();
            write_uint_element(&mut video, VIDEO_PIXEL_WIDTH, 1280);
            write_uint_element(&mut video, VIDEO_PIXEL_HEIGHT, 720);
            write_element(&mut entry, VIDEO_SETTINGS, &video);
            write_element(&mut tracks, TRACK_ENTRY, &entry);
        }
        {
            let mut entry = Vec::new();
            write_uint_element(&mut entry, TRACK_NUMBER, 2);
            write_uint_element(&mut entry, TRACK_TYPE, 2);
            write_string_element(&mut entry, TRACK_CODEC_ID, "A_OPUS");
            write_uint_element(&mut entry, TRACK_DEFAULT_DURATION, 20_000_000);
            let mut audio = Vec::new();
            write_float_element(&mut audio, AUDIO_SAMPLING_FREQ, 48000.0);
            write_uint_element(&mut audio, AUDIO_CHANNELS, 2);
            write_element(&mut entry, AUDIO_SETTINGS, &audio);
            write_element(&mut tracks, TRACK_ENTRY, &entry);
        }
        write_element(&mut segment, TRACKS, &tracks);

        for (base, frames) in [(0u64, [0i16, 40]), (80, [0, 40])] {
            let mut cluster = Vec::new();
            write_uint_element(&mut cluster, CLUSTER_TIMESTAMP, base);
            for ts in frames {
                let key = ts == 0;
                write_element(&mut cluster, SIMPLE_BLOCK, &simple_block(1, ts, key, &[0xDE, 0xAD]));
                write_element(&mut cluster, SIMPLE_BLOCK, &simple_block(2, ts, true, &[0xBE, 0xEF, 0xCA, 0xFE]));
            }
            write_element(&mut segment, CLUSTER, &cluster);
        }

        write_element(&mut data, SEGMENT, &segment);
        data
    }

    #[test]
    fn test_probe_mkv_magic() {
        let probe = MkvProbe;
        let result = probe.probe(&[0x1A, 0x45, 0xDF, 0xA3], None).unwrap();
        assert_eq!(result.score, SCORE_MAGIC);

        let webm = build_minimal_webm();
        let result = probe.probe(&webm, None).unwrap();
        assert_eq!(result.format_id, FormatId::Webm);
        assert_eq!(result.score, SCORE_MAX);
    }

    #[test]
    fn test_probe_mkv_extension() {
        let probe = MkvProbe;
        assert!(probe.probe(&[], Some("video.mkv")).is_some());
        assert!(probe.probe(&[], Some("video.webm")).is_some());
        assert!(probe.probe(&[], Some("audio.mka")).is_some());
        assert!(probe.probe(&[], Some("video.mp4")).is_none());
    }

    #[tokio::test]
    async fn test_parse_minimal_webm() {
        let demuxer = MkvDemuxer::new(Reader::from_bytes(build_minimal_webm()));
        assert_eq!(demuxer.format_id().await.unwrap(), FormatId::Webm);

        let tracks = demuxer.tracks().await.unwrap();
        assert_eq!(tracks.len(), 2, "应该有 2 个轨道");

        assert_eq!(tracks[0].media_type(), MediaType::Video);
        assert_eq!(tracks[0].codec_id(), CodecId::Vp9);
        assert_eq!(tracks[0].coded_width(), Some(1280));
        assert_eq!(tracks[0].coded_height(), Some(720));
        assert_eq!(tracks[0].language(), "eng");

        assert_eq!(tracks[1].codec_id(), CodecId::Opus);
        assert_eq!(tracks[1].sample_rate(), Some(48000));
        assert_eq!(tracks[1].channel_count(), Some(2));
        assert_eq!(tracks[1].language(), "und");
        assert!(matches!(tracks[1].kind(), TrackKind::Audio(_)));
    }

    #[tokio::test]
    async fn test_read_packets() {
        let demuxer = MkvDemuxer::new(Reader::from_bytes(build_minimal_webm()));
        let tracks = demuxer.tracks().await.unwrap();
        let video = &tracks[0];

        let first = video.get_first_packet(ReadOptions::default()).await.unwrap().unwrap();
        assert!(first.is_keyframe);
        assert_eq!(first.pts, 0);
        assert_eq!(first.duration, 40);
        assert_eq!(first.data.as_ref(), &[0xDE, 0xAD]);

        let second = video.get_next_packet(&first, ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(second.pts, 40);
        assert!(!second.is_keyframe);

        let next_key = video
            .get_next_key_packet(&first, ReadOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next_key.pts, 80);

        let key = video.get_key_packet(150, ReadOptions::METADATA_ONLY).await.unwrap().unwrap();
        assert_eq!(key.pts, 80);
        assert!(key.metadata_only);
        assert_eq!(key.size(), 2);

        // 音频轨道的数据包不能用于视频轨道
        let audio_packet = tracks[1].get_first_packet(ReadOptions::default()).await.unwrap().unwrap();
        assert!(matches!(
            video.get_next_packet(&audio_packet, ReadOptions::default()).await,
            Err(VesselError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_duration() {
        let demuxer = MkvDemuxer::new(Reader::from_bytes(build_minimal_webm()));
        let declared = demuxer.declared_duration().await.unwrap().expect("应该有时长");
        // Duration = 5000 ticks * 1_000_000 ns/tick = 5s
        assert!((declared - 5.0).abs() < 0.01, "时长应约为 5 秒, 实际={declared}");

        // 音频最后一帧 120 + 默认时长 20
        let computed = demuxer.compute_duration().await.unwrap();
        assert!((computed - 0.14).abs() < 1e-9, "实际={computed}");
    }

    #[tokio::test]
    async fn test_mime_type_and_tags() {
        let demuxer = MkvDemuxer::new(Reader::from_bytes(build_minimal_webm()));
        assert_eq!(
            demuxer.mime_type().await.unwrap(),
            "video/webm; codecs=\"vp09, opus\""
        );
        let tags = demuxer.metadata_tags().await.unwrap();
        assert_eq!(tags.title.as_deref(), Some("Demo"));
    }

    #[tokio::test]
    async fn test_no_segment_is_an_error() {
        let demuxer = MkvDemuxer::new(Reader::from_bytes(vec![0u8; 64]));
        assert!(matches!(
            demuxer.tracks().await,
            Err(VesselError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_unbounded_source() {
        let reader = Reader::new(Arc::new(MemorySource::unbounded(build_minimal_webm())));
        let demuxer = MkvDemuxer::new(reader);
        let tracks = demuxer.tracks().await.unwrap();
        let last = tracks[0].get_packet(i64::MAX, ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(last.pts, 120);
    }

    #[test]
    fn test_codec_id_mapping() {
        assert_eq!(mkv_codec_to_id("V_MPEG4/ISO/AVC"), CodecId::H264);
        assert_eq!(mkv_codec_to_id("V_VP9"), CodecId::Vp9);
        assert_eq!(mkv_codec_to_id("A_OPUS"), CodecId::Opus);
        assert_eq!(mkv_codec_to_id("A_AAC"), CodecId::Aac);
        assert_eq!(mkv_codec_to_id("A_AAC/MPEG4/LC/SBR"), CodecId::Aac);
        assert_eq!(mkv_codec_to_id("A_FLAC"), CodecId::Flac);
        assert_eq!(mkv_codec_to_id("UNKNOWN"), CodecId::None);
    }
}

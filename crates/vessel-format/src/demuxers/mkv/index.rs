//! Segment 索引构建.
//!
//! 自上而下遍历一次 Segment 的 level 1 元素:
//! - 直接遇到的元数据元素 (Info/Tracks/Cues/Tags/Attachments) 就地解析
//! - 遇到第一个数据簇即停止, 数据簇留给查找阶段按需加载
//! - 之后根据 SeekHead 的指针补充解析尚未见过的元数据元素 (通常是文件末尾的 Cues)
//!
//! 遍历状态放在 [`IndexContext`] 中显式传递.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use vessel_core::{VesselError, VesselResult};

use super::MkvConfig;
use super::ebml::*;
use super::mkv_codec_to_id;
use super::segment::{CuePoint, DEFAULT_TIMESTAMP_SCALE, MkvTrack, Segment};
use super::walker::{
    ChildElements, ElementHeader, read_element_header_at, resync, search_for_next_element_id,
};
use crate::io::{FileSlice, Reader};
use crate::metadata::{AttachedImage, MetadataTags};
use crate::track::{AudioTrackInfo, TrackKind, VideoTrackInfo};

/// Matroska TrackType
const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;
const TRACK_TYPE_SUBTITLE: u64 = 17;

/// 头部剥离压缩算法
const COMP_ALGO_HEADER_STRIPPING: u64 = 3;

/// 索引阶段需要解析的元数据元素
const METADATA_IDS: &[u32] = &[SEEK_HEAD, SEGMENT_INFO, TRACKS, CUES, TAGS, ATTACHMENTS];

/// SeekHead 中的一条指针
#[derive(Debug, Clone, Copy)]
struct SeekEntry {
    id: u32,
    /// 绝对偏移
    position: u64,
}

/// 单个 ContentEncoding
#[derive(Debug, Default)]
struct ContentEncoding {
    order: u64,
    scope: u64,
    encoding_type: u64,
    comp_algo: Option<u64>,
    comp_settings: Option<Bytes>,
}

/// TrackEntry 解析中间结果
#[derive(Debug)]
struct TrackEntry {
    number: u64,
    uid: u64,
    track_type: u64,
    enabled: bool,
    default: bool,
    forced: bool,
    codec_string: String,
    codec_private: Option<Bytes>,
    /// 纳秒
    default_duration: Option<u64>,
    language: Option<String>,
    language_bcp47: Option<String>,
    name: Option<String>,
    codec_delay: u64,
    seek_pre_roll: u64,
    video: VideoTrackInfo,
    audio: AudioTrackInfo,
    encodings: Vec<ContentEncoding>,
}

impl Default for TrackEntry {
    fn default() -> Self {
        Self {
            number: 0,
            uid: 0,
            track_type: 0,
            enabled: true,
            default: true,
            forced: false,
            codec_string: String::new(),
            codec_private: None,
            default_duration: None,
            language: None,
            language_bcp47: None,
            name: None,
            codec_delay: 0,
            seek_pre_roll: 0,
            video: VideoTrackInfo::default(),
            audio: AudioTrackInfo::default(),
            encodings: Vec::new(),
        }
    }
}

/// Segment 遍历上下文
struct IndexContext {
    data_start: u64,
    /// 已解析的元数据元素 ID
    seen: HashSet<u32>,
    /// 已解析的元数据元素偏移 (允许 SeekHead 链式引用)
    parsed_positions: HashSet<u64>,
    seek_entries: Vec<SeekEntry>,
    timestamp_scale: Option<u64>,
    /// tick
    duration: Option<f64>,
    info_title: Option<String>,
    tracks: Vec<TrackEntry>,
    cue_points: Vec<CuePoint>,
    tags: MetadataTags,
    /// 当前标题来自的 TargetTypeValue, 数值越小越具体
    title_level: Option<u64>,
}

impl IndexContext {
    fn new(data_start: u64) -> Self {
        Self {
            data_start,
            seen: HashSet::new(),
            parsed_positions: HashSet::new(),
            seek_entries: Vec::new(),
            timestamp_scale: None,
            duration: None,
            info_title: None,
            tracks: Vec::new(),
            cue_points: Vec::new(),
            tags: MetadataTags::default(),
            title_level: None,
        }
    }
}

/// 构建一个 Segment 的索引
pub async fn read_segment(
    reader: &Reader,
    header: ElementHeader,
    config: &MkvConfig,
) -> VesselResult<Segment> {
    let data_start = header.data_start;
    let end = header.data_end().or(reader.file_size());
    let mut ctx = IndexContext::new(data_start);
    let mut pos = data_start;
    let mut cluster_seek_start = None;

    while end.is_none_or(|end| pos.saturating_add(MIN_HEADER_SIZE as u64) <= end) {
        let Some(child) = read_element_header_at(reader, pos).await? else {
            break;
        };
        if LEVEL_0_IDS.contains(&child.id) {
            // 未知大小的 Segment 后面紧跟下一个 Segment
            break;
        }
        if !is_level_1(child.id) && child.id != VOID && child.id != CRC32 {
            let window_end = pos.saturating_add(config.max_resync_length);
            let limit = end.map_or(window_end, |end| end.min(window_end));
            match resync(reader, pos, LEVEL_0_AND_1_IDS, limit, config.scan_chunk_size).await? {
                Some(next) => {
                    debug!("MKV: Segment 头部 @{pos} 出现未知元素 0x{:X}, 重新同步到 {next}", child.id);
                    pos = next;
                    continue;
                }
                None => break,
            }
        }
        if child.id == CLUSTER {
            cluster_seek_start = Some(pos);
            break;
        }

        let child_end = element_end(reader, &child, end, config).await?;
        if METADATA_IDS.contains(&child.id) {
            read_metadata_element(reader, &mut ctx, child, child_end).await?;
        }
        pos = child_end;
    }

    // 按 SeekHead 补充解析; 解析 SeekHead 本身可能追加新的条目
    let mut i = 0;
    while i < ctx.seek_entries.len() {
        let entry = ctx.seek_entries[i];
        i += 1;
        if !METADATA_IDS.contains(&entry.id)
            || ctx.parsed_positions.contains(&entry.position)
            || (entry.id != SEEK_HEAD && ctx.seen.contains(&entry.id))
        {
            continue;
        }
        let Some(target) = read_element_header_at(reader, entry.position).await? else {
            continue;
        };
        if target.id != entry.id {
            debug!(
                "MKV: SeekHead 指向 @{} 的 0x{:X}, 实际为 0x{:X}, 忽略",
                entry.position, entry.id, target.id
            );
            continue;
        }
        let target_end = element_end(reader, &target, end, config).await?;
        read_metadata_element(reader, &mut ctx, target, target_end).await?;
    }

    Ok(finish_segment(header, end, cluster_seek_start.unwrap_or(pos), ctx))
}

/// 元素结束偏移; 未知大小时搜索下一个 level 0/1 元素
async fn element_end(
    reader: &Reader,
    header: &ElementHeader,
    limit: Option<u64>,
    config: &MkvConfig,
) -> VesselResult<u64> {
    match header.data_end() {
        Some(end) => Ok(end),
        None => {
            search_for_next_element_id(
                reader,
                header.data_start,
                LEVEL_0_AND_1_IDS,
                limit,
                config.scan_chunk_size,
            )
            .await
        }
    }
}

/// 读入并解析一个元数据元素; 内容损坏时视为不存在
async fn read_metadata_element(
    reader: &Reader,
    ctx: &mut IndexContext,
    header: ElementHeader,
    end: u64,
) -> VesselResult<()> {
    let start = header.start();
    ctx.parsed_positions.insert(start);
    ctx.seen.insert(header.id);

    let len = usize::try_from(end.saturating_sub(header.data_start))
        .map_err(|_| VesselError::InvalidData(format!("MKV: 元素 @{start} 过大")))?;
    let Some(body) = reader.request_slice(header.data_start, len).await? else {
        debug!("MKV: 元数据元素 0x{:X} @{start} 被截断", header.id);
        return Ok(());
    };

    let result = match header.id {
        SEEK_HEAD => parse_seek_head(ctx, body),
        SEGMENT_INFO => parse_info(ctx, body),
        TRACKS => {
            parse_tracks(ctx, body);
            Ok(())
        }
        CUES => {
            parse_cues(ctx, body);
            Ok(())
        }
        TAGS => parse_tags(ctx, body),
        ATTACHMENTS => parse_attachments(ctx, body),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("MKV: 元数据元素 0x{:X} @{start} 解析失败: {e}", header.id);
    }
    Ok(())
}

fn parse_seek_head(ctx: &mut IndexContext, body: FileSlice) -> VesselResult<()> {
    for (header, seek) in ChildElements::new(body) {
        if header.id != SEEK {
            continue;
        }
        let mut id = None;
        let mut position = None;
        for (child, mut data) in ChildElements::new(seek) {
            let size = data.len() as u64;
            match child.id {
                SEEK_ID => id = Some(read_uint(&mut data, size)? as u32),
                SEEK_POSITION => position = Some(read_uint(&mut data, size)?),
                _ => {}
            }
        }
        if let (Some(id), Some(position)) = (id, position) {
            match ctx.data_start.checked_add(position) {
                Some(position) => ctx.seek_entries.push(SeekEntry { id, position }),
                None => debug!("MKV: 忽略越界的 SeekPosition, id=0x{id:X}, position={position}"),
            }
        }
    }
    Ok(())
}

fn parse_info(ctx: &mut IndexContext, body: FileSlice) -> VesselResult<()> {
    for (header, mut data) in ChildElements::new(body) {
        let size = data.len() as u64;
        match header.id {
            INFO_TIMESTAMP_SCALE => {
                let scale = read_uint(&mut data, size)?;
                debug!("MKV: TimestampScale = {scale}");
                ctx.timestamp_scale = Some(scale);
            }
            INFO_DURATION => {
                let duration = read_float(&mut data, size)?;
                debug!("MKV: Duration = {duration} ticks");
                ctx.duration = Some(duration);
            }
            INFO_TITLE => ctx.info_title = Some(read_string(&mut data, size)?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_tracks(ctx: &mut IndexContext, body: FileSlice) {
    for (header, entry) in ChildElements::new(body) {
        if header.id != TRACK_ENTRY {
            continue;
        }
        match parse_track_entry(entry) {
            Ok(track) => ctx.tracks.push(track),
            Err(e) => warn!("MKV: 跳过无法解析的 TrackEntry @{}: {e}", header.start()),
        }
    }
}

fn parse_track_entry(body: FileSlice) -> VesselResult<TrackEntry> {
    let mut track = TrackEntry::default();
    for (header, mut data) in ChildElements::new(body) {
        let size = data.len() as u64;
        match header.id {
            TRACK_NUMBER => track.number = read_uint(&mut data, size)?,
            TRACK_UID => track.uid = read_uint(&mut data, size)?,
            TRACK_TYPE => track.track_type = read_uint(&mut data, size)?,
            TRACK_FLAG_ENABLED => track.enabled = read_uint(&mut data, size)? != 0,
            TRACK_FLAG_DEFAULT => track.default = read_uint(&mut data, size)? != 0,
            TRACK_FLAG_FORCED => track.forced = read_uint(&mut data, size)? != 0,
            TRACK_CODEC_ID => track.codec_string = read_string(&mut data, size)?,
            TRACK_CODEC_PRIVATE => track.codec_private = Some(read_binary(&mut data, size)?),
            TRACK_DEFAULT_DURATION => {
                track.default_duration = Some(read_uint(&mut data, size)?).filter(|&d| d > 0);
            }
            TRACK_LANGUAGE => track.language = Some(read_string(&mut data, size)?),
            TRACK_LANGUAGE_BCP47 => track.language_bcp47 = Some(read_string(&mut data, size)?),
            TRACK_NAME => track.name = Some(read_string(&mut data, size)?),
            TRACK_CODEC_DELAY => track.codec_delay = read_uint(&mut data, size)?,
            TRACK_SEEK_PRE_ROLL => track.seek_pre_roll = read_uint(&mut data, size)?,
            VIDEO_SETTINGS => parse_video_settings(data, &mut track.video)?,
            AUDIO_SETTINGS => parse_audio_settings(data, &mut track.audio)?,
            CONTENT_ENCODINGS => track.encodings = parse_content_encodings(data)?,
            _ => {}
        }
    }
    Ok(track)
}

fn parse_video_settings(body: FileSlice, video: &mut VideoTrackInfo) -> VesselResult<()> {
    let mut display_width = None;
    let mut display_height = None;
    for (header, mut data) in ChildElements::new(body) {
        let size = data.len() as u64;
        match header.id {
            VIDEO_PIXEL_WIDTH => video.coded_width = read_uint(&mut data, size)? as u32,
            VIDEO_PIXEL_HEIGHT => video.coded_height = read_uint(&mut data, size)? as u32,
            VIDEO_DISPLAY_WIDTH => display_width = Some(read_uint(&mut data, size)? as u32),
            VIDEO_DISPLAY_HEIGHT => display_height = Some(read_uint(&mut data, size)? as u32),
            VIDEO_FLAG_INTERLACED => video.interlaced = read_uint(&mut data, size)? == 1,
            VIDEO_PROJECTION => {
                for (child, mut value) in ChildElements::new(data) {
                    if child.id == VIDEO_PROJECTION_POSE_ROLL {
                        let size = value.len() as u64;
                        let roll = read_float(&mut value, size)?;
                        video.rotation = rotation_from_roll(roll);
                    }
                }
            }
            _ => {}
        }
    }
    video.display_width = display_width.unwrap_or(video.coded_width);
    video.display_height = display_height.unwrap_or(video.coded_height);
    Ok(())
}

/// ProjectionPoseRoll (逆时针角度) → 顺时针旋转, 取最接近的 90 度倍数
fn rotation_from_roll(roll: f64) -> u16 {
    let quarter_turns = (-roll / 90.0).round() as i64;
    (quarter_turns.rem_euclid(4) * 90) as u16
}

fn parse_audio_settings(body: FileSlice, audio: &mut AudioTrackInfo) -> VesselResult<()> {
    for (header, mut data) in ChildElements::new(body) {
        let size = data.len() as u64;
        match header.id {
            AUDIO_SAMPLING_FREQ => {
                let rate = read_float(&mut data, size)?;
                if rate > 0.0 {
                    audio.sample_rate = rate.round() as u32;
                }
            }
            AUDIO_CHANNELS => {
                let channels = read_uint(&mut data, size)? as u32;
                if channels > 0 {
                    audio.channels = channels;
                }
            }
            AUDIO_BIT_DEPTH => audio.bit_depth = Some(read_uint(&mut data, size)? as u32),
            _ => {}
        }
    }
    Ok(())
}

fn parse_content_encodings(body: FileSlice) -> VesselResult<Vec<ContentEncoding>> {
    let mut encodings = Vec::new();
    for (header, encoding_body) in ChildElements::new(body) {
        if header.id != CONTENT_ENCODING {
            continue;
        }
        let mut encoding = ContentEncoding {
            scope: 1,
            ..ContentEncoding::default()
        };
        for (child, mut data) in ChildElements::new(encoding_body) {
            let size = data.len() as u64;
            match child.id {
                CONTENT_ENCODING_ORDER => encoding.order = read_uint(&mut data, size)?,
                CONTENT_ENCODING_SCOPE => encoding.scope = read_uint(&mut data, size)?,
                CONTENT_ENCODING_TYPE => encoding.encoding_type = read_uint(&mut data, size)?,
                CONTENT_COMPRESSION => {
                    encoding.comp_algo = Some(0);
                    for (comp, mut value) in ChildElements::new(data) {
                        let size = value.len() as u64;
                        match comp.id {
                            CONTENT_COMP_ALGO => {
                                encoding.comp_algo = Some(read_uint(&mut value, size)?);
                            }
                            CONTENT_COMP_SETTINGS => {
                                encoding.comp_settings = Some(read_binary(&mut value, size)?);
                            }
                            _ => {}
                        }
                    }
                }
                CONTENT_ENCRYPTION => encoding.encoding_type = 1,
                _ => {}
            }
        }
        encodings.push(encoding);
    }
    encodings.sort_by_key(|e| std::cmp::Reverse(e.order));
    Ok(encodings)
}

/// 检查内容编码, 返回需要补回到每帧前面的字节
///
/// 只支持一个头部剥离压缩; 其他情况返回 `Err`, 调用方丢弃轨道.
fn header_strip_prefix(encodings: &[ContentEncoding]) -> Result<Option<Bytes>, String> {
    match encodings {
        [] => Ok(None),
        [encoding] => {
            if encoding.encoding_type != 0 {
                return Err("加密内容".into());
            }
            match encoding.comp_algo {
                Some(COMP_ALGO_HEADER_STRIPPING) => {}
                Some(algo) => return Err(format!("压缩算法 {algo}")),
                None => return Err("缺少 ContentCompression".into()),
            }
            if encoding.scope & 1 == 0 {
                return Ok(None);
            }
            Ok(encoding.comp_settings.clone().filter(|s| !s.is_empty()))
        }
        _ => Err(format!("{} 层内容编码", encodings.len())),
    }
}

/// 语言代码: 优先 BCP 47, 其次 ISO 639-2 三字母代码, 否则为 "und"
fn normalize_language(language: Option<&str>, bcp47: Option<&str>) -> String {
    if let Some(tag) = bcp47.map(str::trim).filter(|t| !t.is_empty()) {
        return tag.to_string();
    }
    match language.map(str::trim) {
        Some(code) if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
            code.to_ascii_lowercase()
        }
        _ => "und".to_string(),
    }
}

/// TrackEntry → 轨道; 被禁用、类型未知或内容编码不受支持时返回 `None`
fn build_track(entry: TrackEntry, timestamp_scale: u64) -> Option<MkvTrack> {
    if !entry.enabled {
        debug!("MKV: 轨道 {} 被禁用, 忽略", entry.number);
        return None;
    }
    if entry.number == 0 {
        debug!("MKV: 忽略缺少 TrackNumber 的轨道");
        return None;
    }
    let kind = match entry.track_type {
        TRACK_TYPE_VIDEO => TrackKind::Video(entry.video),
        TRACK_TYPE_AUDIO => TrackKind::Audio(entry.audio),
        TRACK_TYPE_SUBTITLE => TrackKind::Subtitle,
        other => {
            debug!("MKV: 忽略轨道 {} (TrackType {other})", entry.number);
            return None;
        }
    };
    let header_strip = match header_strip_prefix(&entry.encodings) {
        Ok(prefix) => prefix,
        Err(reason) => {
            warn!("MKV: 轨道 {} 使用不支持的内容编码 ({reason}), 丢弃", entry.number);
            return None;
        }
    };

    let default_duration = entry
        .default_duration
        .map(|ns| (ns as f64 / timestamp_scale as f64).round() as i64)
        .filter(|&ticks| ticks > 0);

    Some(MkvTrack {
        id: entry.number,
        uid: entry.uid,
        kind,
        codec_id: mkv_codec_to_id(&entry.codec_string),
        language: normalize_language(entry.language.as_deref(), entry.language_bcp47.as_deref()),
        codec_string: entry.codec_string,
        codec_private: entry.codec_private.filter(|p| !p.is_empty()),
        default_duration,
        name: entry.name.filter(|n| !n.is_empty()),
        is_default: entry.default,
        is_forced: entry.forced,
        codec_delay: entry.codec_delay,
        seek_pre_roll: entry.seek_pre_roll,
        header_strip,
        cue_points: Vec::new(),
    })
}

fn parse_cues(ctx: &mut IndexContext, body: FileSlice) {
    for (header, point) in ChildElements::new(body) {
        if header.id != CUE_POINT {
            continue;
        }
        if let Err(e) = parse_cue_point(ctx, point) {
            debug!("MKV: 跳过损坏的 CuePoint @{}: {e}", header.start());
        }
    }
}

fn parse_cue_point(ctx: &mut IndexContext, body: FileSlice) -> VesselResult<()> {
    let mut time = None;
    let mut positions = Vec::new();
    for (header, mut data) in ChildElements::new(body) {
        match header.id {
            CUE_TIME => {
                let size = data.len() as u64;
                time = Some(read_uint(&mut data, size)? as i64);
            }
            CUE_TRACK_POSITIONS => {
                let mut track = None;
                let mut cluster = None;
                for (child, mut value) in ChildElements::new(data) {
                    let size = value.len() as u64;
                    match child.id {
                        CUE_TRACK => track = Some(read_uint(&mut value, size)?),
                        CUE_CLUSTER_POSITION => cluster = Some(read_uint(&mut value, size)?),
                        _ => {}
                    }
                }
                if let (Some(track), Some(cluster)) = (track, cluster) {
                    positions.push((track, cluster));
                }
            }
            _ => {}
        }
    }
    // 缺少必需字段的索引点视为不存在
    let Some(time) = time else {
        return Ok(());
    };
    for (track_id, cluster) in positions {
        let Some(cluster_position) = ctx.data_start.checked_add(cluster) else {
            debug!("MKV: 忽略越界的 CueClusterPosition, track={track_id}, position={cluster}");
            continue;
        };
        ctx.cue_points.push(CuePoint {
            time,
            track_id,
            cluster_position,
        });
    }
    Ok(())
}

fn parse_tags(ctx: &mut IndexContext, body: FileSlice) -> VesselResult<()> {
    for (header, tag) in ChildElements::new(body) {
        if header.id != TAG {
            continue;
        }
        let mut level = 50;
        let mut global = true;
        let mut simple_tags = Vec::new();
        for (child, data) in ChildElements::new(tag) {
            match child.id {
                TARGETS => {
                    for (target, mut value) in ChildElements::new(data) {
                        let size = value.len() as u64;
                        match target.id {
                            TARGET_TYPE_VALUE => level = read_uint(&mut value, size)?,
                            TAG_TRACK_UID | TAG_EDITION_UID | TAG_CHAPTER_UID
                            | TAG_ATTACHMENT_UID => {
                                if read_uint(&mut value, size)? != 0 {
                                    global = false;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                SIMPLE_TAG => {
                    let mut name = None;
                    let mut value = None;
                    for (field, mut data) in ChildElements::new(data) {
                        let size = data.len() as u64;
                        match field.id {
                            TAG_NAME => name = Some(read_string(&mut data, size)?),
                            TAG_STRING => value = Some(read_string(&mut data, size)?),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(value)) = (name, value) {
                        simple_tags.push((name, value));
                    }
                }
                _ => {}
            }
        }
        if !global {
            continue;
        }
        for (name, value) in simple_tags {
            apply_tag(ctx, level, &name, &value);
            ctx.tags.raw.push((name, value));
        }
    }
    Ok(())
}

/// 将一个全局 SimpleTag 映射到常用字段
fn apply_tag(ctx: &mut IndexContext, level: u64, name: &str, value: &str) {
    let tags = &mut ctx.tags;
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    match name.to_ascii_uppercase().as_str() {
        "TITLE" => {
            if ctx.title_level.is_none_or(|current| level < current) {
                tags.title = Some(value.to_string());
                ctx.title_level = Some(level);
            }
        }
        "ARTIST" | "LEAD_PERFORMER" => {
            tags.artist.get_or_insert_with(|| value.to_string());
        }
        "ALBUM" => {
            tags.album.get_or_insert_with(|| value.to_string());
        }
        "ALBUM_ARTIST" => {
            tags.album_artist.get_or_insert_with(|| value.to_string());
        }
        "GENRE" => {
            tags.genre.get_or_insert_with(|| value.to_string());
        }
        "COMMENT" => {
            tags.comment.get_or_insert_with(|| value.to_string());
        }
        "DESCRIPTION" | "SUMMARY" | "SYNOPSIS" => {
            tags.description.get_or_insert_with(|| value.to_string());
        }
        "DATE" | "DATE_RELEASED" | "DATE_RECORDED" => {
            tags.date.get_or_insert_with(|| value.to_string());
        }
        "PART_NUMBER" | "TRACK" | "TRACKNUMBER" => {
            if tags.track_number.is_none() {
                tags.track_number = leading_number(value);
            }
        }
        "DISC" | "DISCNUMBER" => {
            if tags.disc_number.is_none() {
                tags.disc_number = leading_number(value);
            }
        }
        _ => {}
    }
}

/// "3/12" → 3
fn leading_number(value: &str) -> Option<u32> {
    value.split('/').next()?.trim().parse().ok()
}

fn parse_attachments(ctx: &mut IndexContext, body: FileSlice) -> VesselResult<()> {
    for (header, file) in ChildElements::new(body) {
        if header.id != ATTACHED_FILE {
            continue;
        }
        let mut name = None;
        let mut mime_type = None;
        let mut description = None;
        let mut data = None;
        for (child, mut value) in ChildElements::new(file) {
            let size = value.len() as u64;
            match child.id {
                FILE_NAME => name = Some(read_string(&mut value, size)?),
                FILE_MIME_TYPE => mime_type = Some(read_string(&mut value, size)?),
                FILE_DESCRIPTION => description = Some(read_string(&mut value, size)?),
                FILE_DATA => data = Some(read_binary(&mut value, size)?),
                _ => {}
            }
        }
        if let (Some(mime_type), Some(data)) = (mime_type, data) {
            if mime_type.starts_with("image/") {
                ctx.tags.images.push(AttachedImage {
                    data,
                    mime_type,
                    name,
                    description,
                });
            }
        }
    }
    Ok(())
}

/// 收尾: 默认值、轨道过滤与排序、索引点分配
fn finish_segment(
    header: ElementHeader,
    end: Option<u64>,
    cluster_seek_start: u64,
    mut ctx: IndexContext,
) -> Segment {
    let timestamp_scale = ctx
        .timestamp_scale
        .filter(|&scale| scale > 0)
        .unwrap_or(DEFAULT_TIMESTAMP_SCALE);
    let declared_duration = ctx
        .duration
        .map(|ticks| ticks * timestamp_scale as f64 / 1e9);
    if ctx.tags.title.is_none() {
        ctx.tags.title = ctx.info_title.take().filter(|t| !t.is_empty());
    }

    let mut tracks: Vec<MkvTrack> = Vec::new();
    for entry in std::mem::take(&mut ctx.tracks) {
        let Some(track) = build_track(entry, timestamp_scale) else {
            continue;
        };
        if tracks.iter().any(|t| t.id == track.id) {
            warn!("MKV: 重复的轨道号 {}, 保留第一个", track.id);
            continue;
        }
        tracks.push(track);
    }
    tracks.sort_by_key(|t| !t.is_default);

    assign_cue_points(&mut tracks, ctx.cue_points);

    debug!(
        "MKV: Segment @{} 索引完成: {} 个轨道, 首个数据簇 @{cluster_seek_start}",
        header.start(),
        tracks.len()
    );

    Segment::new(
        header.start(),
        header.data_start,
        end,
        cluster_seek_start,
        timestamp_scale,
        declared_duration,
        tracks.into_iter().map(Arc::new).collect(),
        ctx.tags,
    )
}

/// 按轨道分配索引点: 排序、按时间去重 (保留第一个);
/// 没有索引点的轨道借用索引点最多的轨道的列表
fn assign_cue_points(tracks: &mut [MkvTrack], cue_points: Vec<CuePoint>) {
    for track in tracks.iter_mut() {
        let mut points: Vec<CuePoint> = cue_points
            .iter()
            .filter(|c| c.track_id == track.id)
            .copied()
            .collect();
        points.sort_by_key(|c| c.time);
        points.dedup_by_key(|c| c.time);
        track.cue_points = points;
    }

    let mut richest: Option<usize> = None;
    for (i, track) in tracks.iter().enumerate() {
        if richest.is_none_or(|r| track.cue_points.len() > tracks[r].cue_points.len()) {
            richest = Some(i);
        }
    }
    let Some(richest) = richest else {
        return;
    };
    let proxy = tracks[richest].cue_points.clone();
    if proxy.is_empty() {
        return;
    }
    for track in tracks.iter_mut().filter(|t| t.cue_points.is_empty()) {
        track.cue_points = proxy.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(time: i64, track_id: u64, cluster_position: u64) -> CuePoint {
        CuePoint {
            time,
            track_id,
            cluster_position,
        }
    }

    fn entry(number: u64, track_type: u64) -> TrackEntry {
        TrackEntry {
            number,
            track_type,
            codec_string: "A_OPUS".into(),
            ..TrackEntry::default()
        }
    }

    #[test]
    fn test_language_fallback() {
        assert_eq!(normalize_language(None, None), "und");
        assert_eq!(normalize_language(Some("ENG"), None), "eng");
        assert_eq!(normalize_language(Some("english"), None), "und");
        assert_eq!(normalize_language(Some("ger"), Some("de-CH")), "de-CH");
    }

    #[test]
    fn test_rotation_from_roll() {
        assert_eq!(rotation_from_roll(0.0), 0);
        assert_eq!(rotation_from_roll(-90.0), 90);
        assert_eq!(rotation_from_roll(90.0), 270);
        assert_eq!(rotation_from_roll(180.0), 180);
    }

    #[test]
    fn test_video_settings_with_projection() {
        let mut body = vec![0xB0, 0x82, 0x02, 0x80];
        body.extend_from_slice(&[0x76, 0x70, 0x8B, 0x76, 0x75, 0x88]);
        body.extend_from_slice(&(-90.0f64).to_be_bytes());

        let mut video = VideoTrackInfo::default();
        parse_video_settings(FileSlice::new(Bytes::from(body), 0), &mut video).unwrap();
        assert_eq!(video.coded_width, 640);
        assert_eq!(video.display_width, 640);
        assert_eq!(video.rotation, 90);
    }

    #[test]
    fn test_header_strip_validation() {
        let strip = ContentEncoding {
            scope: 1,
            comp_algo: Some(3),
            comp_settings: Some(Bytes::from_static(&[0x00, 0x00, 0x01])),
            ..ContentEncoding::default()
        };
        assert_eq!(
            header_strip_prefix(std::slice::from_ref(&strip)).unwrap().as_deref(),
            Some(&[0x00, 0x00, 0x01][..])
        );

        let zlib = ContentEncoding {
            scope: 1,
            comp_algo: Some(0),
            ..ContentEncoding::default()
        };
        assert!(header_strip_prefix(&[zlib]).is_err());

        let encrypted = ContentEncoding {
            scope: 1,
            encoding_type: 1,
            ..ContentEncoding::default()
        };
        assert!(header_strip_prefix(&[encrypted]).is_err());
    }

    #[test]
    fn test_build_track_drops_disabled_and_unsupported() {
        let mut disabled = entry(1, TRACK_TYPE_AUDIO);
        disabled.enabled = false;
        assert!(build_track(disabled, DEFAULT_TIMESTAMP_SCALE).is_none());

        let mut encrypted = entry(2, TRACK_TYPE_AUDIO);
        encrypted.encodings.push(ContentEncoding {
            encoding_type: 1,
            ..ContentEncoding::default()
        });
        assert!(build_track(encrypted, DEFAULT_TIMESTAMP_SCALE).is_none());

        assert!(build_track(entry(3, 99), DEFAULT_TIMESTAMP_SCALE).is_none());
    }

    #[test]
    fn test_build_track_converts_default_duration() {
        let mut audio = entry(1, TRACK_TYPE_AUDIO);
        audio.default_duration = Some(20_000_000);
        let track = build_track(audio, DEFAULT_TIMESTAMP_SCALE).unwrap();
        assert_eq!(track.default_duration, Some(20));
        assert_eq!(track.language, "und");
        assert_eq!(track.codec_id, vessel_codec::CodecId::Opus);
    }

    #[test]
    fn test_cue_points_sorted_deduplicated_and_inherited() {
        let mut tracks: Vec<MkvTrack> = [entry(1, TRACK_TYPE_VIDEO), entry(2, TRACK_TYPE_AUDIO)]
            .into_iter()
            .filter_map(|e| build_track(e, DEFAULT_TIMESTAMP_SCALE))
            .collect();
        let cues = vec![cue(2000, 1, 300), cue(0, 1, 100), cue(2000, 1, 999), cue(1000, 1, 200)];
        assign_cue_points(&mut tracks, cues);

        let times: Vec<_> = tracks[0].cue_points.iter().map(|c| c.time).collect();
        assert_eq!(times, [0, 1000, 2000]);
        assert_eq!(tracks[0].cue_points[2].cluster_position, 300);
        // 音频轨道没有索引点, 借用视频轨道的
        assert_eq!(tracks[1].cue_points, tracks[0].cue_points);
    }

    #[test]
    fn test_cue_position_overflow_is_dropped() {
        let mut body = vec![0xB3, 0x81, 0x00];
        // 越界的 CueClusterPosition
        body.extend_from_slice(&[0xB7, 0x8D, 0xF7, 0x81, 0x01, 0xF1, 0x88]);
        body.extend_from_slice(&[0xFF; 8]);
        body.extend_from_slice(&[0xB7, 0x86, 0xF7, 0x81, 0x02, 0xF1, 0x81, 0x10]);

        let mut ctx = IndexContext::new(100);
        parse_cue_point(&mut ctx, FileSlice::new(Bytes::from(body), 0)).unwrap();
        assert_eq!(ctx.cue_points, vec![cue(0, 2, 116)]);
    }

    #[test]
    fn test_seek_position_overflow_is_dropped() {
        let mut body = vec![0x4D, 0xBB, 0x92, 0x53, 0xAB, 0x84, 0x1C, 0x53, 0xBB, 0x6B];
        body.extend_from_slice(&[0x53, 0xAC, 0x88]);
        body.extend_from_slice(&[0xFF; 8]);

        let mut ctx = IndexContext::new(100);
        parse_seek_head(&mut ctx, FileSlice::new(Bytes::from(body), 0)).unwrap();
        assert!(ctx.seek_entries.is_empty());
    }

    #[test]
    fn test_tag_mapping() {
        let mut ctx = IndexContext::new(0);
        apply_tag(&mut ctx, 50, "TITLE", "Album Title");
        apply_tag(&mut ctx, 30, "TITLE", "Song");
        apply_tag(&mut ctx, 50, "TITLE", "Ignored");
        apply_tag(&mut ctx, 30, "PART_NUMBER", "3/12");
        apply_tag(&mut ctx, 50, "artist", "Someone");
        assert_eq!(ctx.tags.title.as_deref(), Some("Song"));
        assert_eq!(ctx.tags.track_number, Some(3));
        assert_eq!(ctx.tags.artist.as_deref(), Some("Someone"));
    }
}

//! Segment 与轨道的索引结果.
//!
//! 索引阶段一次性构建, 之后只读; 查找过程中会变化的部分
//! (最近数据簇、位置缓存、回溯发现的结束偏移) 放在 [`SegmentState`] 中.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use vessel_codec::CodecId;
use vessel_core::{Rational, Timestamp};

use super::cache::{ClusterPositionEntry, LastClusterSlot, PositionKey, TrackPositions};
use super::cluster::Cluster;
use crate::metadata::MetadataTags;
use crate::track::TrackKind;

/// 默认时间刻度 (纳秒/tick), 即毫秒精度
pub const DEFAULT_TIMESTAMP_SCALE: u64 = 1_000_000;

/// Cues 索引点
///
/// 可能不准确 (文件损坏或写入错误), 使用方必须验证并回退.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuePoint {
    /// 时间 (tick)
    pub time: i64,
    /// 轨道号
    pub track_id: u64,
    /// 数据簇元素的绝对偏移
    pub cluster_position: u64,
}

/// Matroska 轨道
#[derive(Debug, Clone)]
pub struct MkvTrack {
    /// 轨道号 (Segment 内唯一)
    pub id: u64,
    pub uid: u64,
    pub kind: TrackKind,
    pub codec_id: CodecId,
    /// 原始 CodecID 字符串, 如 "V_VP9"
    pub codec_string: String,
    pub codec_private: Option<Bytes>,
    /// 默认帧时长 (tick)
    pub default_duration: Option<i64>,
    pub language: String,
    pub name: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    /// 编解码器延迟 (纳秒)
    pub codec_delay: u64,
    /// 跳转后需要预解码的时长 (纳秒)
    pub seek_pre_roll: u64,
    /// 头部剥离压缩: 每帧负载前需要补回的字节
    pub header_strip: Option<Bytes>,
    /// 按时间排序、去重后的索引点
    pub cue_points: Vec<CuePoint>,
}

/// 查找期间可变的 Segment 状态
#[derive(Default)]
pub struct SegmentState {
    /// 已知的结束偏移, `None` 表示无界
    pub end: Option<u64>,
    pub last_cluster: LastClusterSlot,
    /// 轨道号 → 位置缓存
    pub positions: HashMap<u64, TrackPositions>,
}

/// 一个 Segment 的索引结果
pub struct Segment {
    /// Segment 元素的起始偏移
    pub start: u64,
    /// Segment 数据的起始偏移 (SeekHead/Cues 中的位置以此为基准)
    pub data_start: u64,
    /// 第一个数据簇的偏移 (没有索引可用时从这里开始扫描)
    pub cluster_seek_start: u64,
    /// 时间刻度 (纳秒/tick)
    pub timestamp_scale: u64,
    pub time_base: Rational,
    /// Info 中声明的时长 (秒)
    pub declared_duration: Option<f64>,
    /// 默认轨道在前
    pub tracks: Vec<Arc<MkvTrack>>,
    pub tags: MetadataTags,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// 创建 Segment, `end` 为已知的结束偏移
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: u64,
        data_start: u64,
        end: Option<u64>,
        cluster_seek_start: u64,
        timestamp_scale: u64,
        declared_duration: Option<f64>,
        tracks: Vec<Arc<MkvTrack>>,
        tags: MetadataTags,
    ) -> Self {
        Self {
            start,
            data_start,
            cluster_seek_start,
            timestamp_scale,
            time_base: Rational::from_timestamp_scale(timestamp_scale),
            declared_duration,
            tracks,
            tags,
            state: Mutex::new(SegmentState {
                end,
                ..SegmentState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 已知的结束偏移
    pub fn end(&self) -> Option<u64> {
        self.state().end
    }

    /// 记录回溯发现的结束偏移
    pub fn set_end(&self, end: u64) {
        self.state().end = Some(end);
    }

    pub fn track(&self, id: u64) -> Option<&Arc<MkvTrack>> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// 最近加载的数据簇 (偏移一致时)
    pub fn cached_cluster(&self, cluster_start: u64) -> Option<Arc<Cluster>> {
        self.state().last_cluster.get(cluster_start)
    }

    /// 缓存新加载的数据簇, 并为其中每个轨道登记位置缓存
    pub fn store_cluster(&self, cluster: Arc<Cluster>) {
        let mut state = self.state();
        for (&track_id, data) in &cluster.tracks {
            if data.is_empty() {
                continue;
            }
            let positions = state.positions.entry(track_id).or_default();
            positions.start.insert(cluster.start, data.start_timestamp);
            if let Some(key_frame) = data.first_key_frame_timestamp {
                positions.key_frame.insert(cluster.start, key_frame);
            }
        }
        state.last_cluster.put(cluster);
    }

    /// 位置缓存中按 `key` 记录的时间戳 `<= timestamp` 的最后一个数据簇
    pub fn position_lookup(
        &self,
        track_id: u64,
        key: PositionKey,
        timestamp: i64,
    ) -> Option<ClusterPositionEntry> {
        self.state()
            .positions
            .get(&track_id)
            .and_then(|positions| positions.get(key).lookup(timestamp))
    }

    /// 秒 → tick
    pub fn seconds_to_ticks(&self, seconds: f64) -> i64 {
        Timestamp::from_seconds(seconds, self.time_base).pts
    }

    /// tick → 秒
    pub fn ticks_to_seconds(&self, ticks: i64) -> f64 {
        Timestamp::new(ticks, self.time_base).to_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxers::mkv::cluster::ClusterTrackData;

    fn segment() -> Segment {
        Segment::new(40, 52, None, 100, DEFAULT_TIMESTAMP_SCALE, None, Vec::new(), MetadataTags::default())
    }

    #[test]
    fn test_time_base_from_scale() {
        let seg = segment();
        assert_eq!(seg.time_base, Rational::new(1, 1000));
        assert!((seg.ticks_to_seconds(1500) - 1.5).abs() < 1e-9);
        assert_eq!(seg.seconds_to_ticks(2.0), 2000);
    }

    #[test]
    fn test_end_discovered_later() {
        let seg = segment();
        assert_eq!(seg.end(), None);
        seg.set_end(5000);
        assert_eq!(seg.end(), Some(5000));
    }

    #[test]
    fn test_store_cluster_records_positions() {
        let seg = segment();
        let mut cluster = Cluster::empty(100, 105, 200);
        cluster.tracks.insert(1, ClusterTrackData::with_range(30, 60));
        seg.store_cluster(Arc::new(cluster));

        assert!(seg.cached_cluster(100).is_some());
        assert_eq!(seg.position_lookup(1, PositionKey::Start, 45).unwrap().cluster_start, 100);
        assert!(seg.position_lookup(1, PositionKey::Start, 10).is_none());
        assert!(seg.position_lookup(2, PositionKey::Start, 45).is_none());
    }

    #[test]
    fn test_delta_only_cluster_skipped_by_key_frame_cache() {
        let seg = segment();
        let mut keyed = Cluster::empty(100, 105, 200);
        keyed.tracks.insert(1, ClusterTrackData::with_range(0, 80));
        let mut delta_only = Cluster::empty(200, 205, 300);
        let mut data = ClusterTrackData::with_range(100, 180);
        data.first_key_frame_timestamp = None;
        delta_only.tracks.insert(1, data);
        seg.store_cluster(Arc::new(keyed));
        seg.store_cluster(Arc::new(delta_only));

        assert_eq!(seg.position_lookup(1, PositionKey::Start, 150).unwrap().cluster_start, 200);
        let key = seg.position_lookup(1, PositionKey::KeyFrame, 150).unwrap();
        assert_eq!(key.cluster_start, 100);
        assert_eq!(key.start_timestamp, 0);
    }
}

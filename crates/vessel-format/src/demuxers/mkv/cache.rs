//! 查找缓存.
//!
//! - [`TrackPositions`]: 每个轨道一份, 两张 (数据簇偏移, 时间戳) 有序表:
//!   按起始时间戳与按第一个关键帧时间戳, 在没有 Cues 的文件中代替索引
//! - [`LastClusterSlot`]: 每个 Segment 一份, 只保留最近加载的数据簇

use std::sync::Arc;

use super::cluster::Cluster;

/// 二分查找最后一个键 `<= target` 的下标
///
/// `items` 必须按键升序排列. 不存在时返回 `None`.
pub fn binary_search_less_or_equal<T, K, F>(items: &[T], target: K, key: F) -> Option<usize>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let count = items.partition_point(|item| key(item) <= target);
    count.checked_sub(1)
}

/// 位置缓存条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPositionEntry {
    /// 数据簇元素的起始偏移
    pub cluster_start: u64,
    /// 该轨道在此数据簇内的起始时间戳
    pub start_timestamp: i64,
}

/// 位置缓存的键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKey {
    /// 轨道在数据簇内的起始时间戳
    Start,
    /// 轨道在数据簇内的第一个关键帧时间戳
    KeyFrame,
}

/// 数据簇位置缓存
///
/// 按时间戳升序保存, 同一数据簇只记录一次.
#[derive(Debug, Default)]
pub struct ClusterPositionCache {
    entries: Vec<ClusterPositionEntry>,
}

impl ClusterPositionCache {
    /// 插入条目
    ///
    /// 数据簇已存在时只保留较早的时间戳.
    pub fn insert(&mut self, cluster_start: u64, start_timestamp: i64) {
        if let Some(i) = self.entries.iter().position(|e| e.cluster_start == cluster_start) {
            if self.entries[i].start_timestamp <= start_timestamp {
                return;
            }
            self.entries.remove(i);
        }
        let index = self
            .entries
            .partition_point(|e| e.start_timestamp <= start_timestamp);
        self.entries.insert(
            index,
            ClusterPositionEntry {
                cluster_start,
                start_timestamp,
            },
        );
    }

    /// 起始时间戳 `<= timestamp` 的最后一个条目
    pub fn lookup(&self, timestamp: i64) -> Option<ClusterPositionEntry> {
        binary_search_less_or_equal(&self.entries, timestamp, |e| e.start_timestamp)
            .map(|i| self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 一个轨道的两张位置缓存
#[derive(Debug, Default)]
pub struct TrackPositions {
    pub start: ClusterPositionCache,
    pub key_frame: ClusterPositionCache,
}

impl TrackPositions {
    pub fn get(&self, key: PositionKey) -> &ClusterPositionCache {
        match key {
            PositionKey::Start => &self.start,
            PositionKey::KeyFrame => &self.key_frame,
        }
    }
}

/// 容量为 1 的数据簇缓存
#[derive(Default)]
pub struct LastClusterSlot {
    cluster: Option<Arc<Cluster>>,
}

impl LastClusterSlot {
    /// 命中时返回缓存的数据簇
    pub fn get(&self, cluster_start: u64) -> Option<Arc<Cluster>> {
        self.cluster
            .as_ref()
            .filter(|c| c.start == cluster_start)
            .cloned()
    }

    /// 替换缓存内容
    pub fn put(&mut self, cluster: Arc<Cluster>) {
        self.cluster = Some(cluster);
    }
}

//! 数据包查找引擎.
//!
//! 所有查询 (第一个/指定时间/下一个/关键帧) 都基于同一个算法
//! [`TrackLookup::perform_cluster_lookup`], 区别只在于逐数据簇的匹配函数:
//!
//! 1. 有起始数据簇 (从某个数据包继续) 时先检查它
//! 2. 否则取 Cues 与位置缓存中 `<= 搜索时间` 的较靠后者作为起点, 都没有时从第一个数据簇开始.
//!    查找关键帧时位置缓存按数据簇内第一个关键帧的时间戳检索
//! 3. 逐个数据簇向后扫描; 精确匹配立即返回, 候选匹配记下后继续
//! 4. 遇到无法识别的元素时在有限窗口内重新同步
//! 5. 若从某个索引点出发却始终没有在其偏移之后找到匹配, 该索引点不可信,
//!    改用前一个索引点重新查找

use std::sync::Arc;

use log::{debug, trace, warn};
use vessel_core::VesselResult;

use super::MkvConfig;
use super::cache::{PositionKey, binary_search_less_or_equal};
use super::cluster::{Cluster, load_cluster};
use super::ebml::{
    CLUSTER, LEVEL_0_AND_1_IDS, LEVEL_0_IDS, LEVEL_1_IDS, MAX_HEADER_SIZE, MIN_HEADER_SIZE,
    SEGMENT, VOID, is_level_1, read_element_id,
};
use super::segment::{MkvTrack, Segment};
use super::walker::{read_element_header, resync, search_for_next_element_id};
use crate::io::Reader;

/// 单个数据簇的匹配结果 (下标为显示顺序下标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMatch {
    /// 确认是要找的块
    Exact(usize),
    /// 可能是, 但后面的数据簇里也许有更好的
    Candidate(usize),
    /// 本数据簇中没有
    Nothing,
}

/// 一个轨道的查找上下文
pub struct TrackLookup {
    pub reader: Reader,
    pub segment: Arc<Segment>,
    pub track: Arc<MkvTrack>,
    pub config: MkvConfig,
}

impl TrackLookup {
    /// 通用数据簇查找
    ///
    /// `search_timestamp` 与 `position_key` 用于选择起点, 扫描到轨道起始时间超过
    /// `latest_timestamp` 的数据簇即停止. 返回 (数据簇, 显示顺序下标).
    pub async fn perform_cluster_lookup<M>(
        &self,
        mut start_cluster: Option<Arc<Cluster>>,
        matcher: M,
        position_key: PositionKey,
        mut search_timestamp: i64,
        latest_timestamp: i64,
    ) -> VesselResult<Option<(Arc<Cluster>, usize)>>
    where
        M: Fn(&Cluster) -> BlockMatch + Sync,
    {
        let segment = &*self.segment;
        let track = &*self.track;

        loop {
            let mut best: Option<(Arc<Cluster>, usize)> = None;
            let mut current: Option<Arc<Cluster>> = None;

            let cue_index =
                binary_search_less_or_equal(&track.cue_points, search_timestamp, |c| c.time);
            let cue = cue_index.map(|i| track.cue_points[i]);
            let cached = segment.position_lookup(track.id, position_key, search_timestamp);
            let lookup_position = cue
                .map(|c| c.cluster_position)
                .max(cached.map(|e| e.cluster_start));

            let mut pos = match start_cluster.take() {
                Some(start) => {
                    match matcher(&start) {
                        BlockMatch::Exact(index) => return Ok(Some((start, index))),
                        BlockMatch::Candidate(index) => best = Some((Arc::clone(&start), index)),
                        BlockMatch::Nothing => {}
                    }
                    match lookup_position {
                        Some(position) if start.start < position => position,
                        _ => {
                            let end = start.end;
                            current = Some(start);
                            end
                        }
                    }
                }
                None => lookup_position.unwrap_or(segment.cluster_seek_start),
            };

            while segment
                .end()
                .is_none_or(|end| pos.saturating_add(MIN_HEADER_SIZE as u64) <= end)
            {
                if let Some(cluster) = &current {
                    let past_bound = cluster
                        .track_data(track.id)
                        .is_some_and(|d| d.start_timestamp > latest_timestamp);
                    if past_bound {
                        break;
                    }
                }

                let Some(mut slice) = self
                    .reader
                    .request_slice_range(pos, MIN_HEADER_SIZE, MAX_HEADER_SIZE)
                    .await?
                else {
                    break;
                };
                let header = match read_element_header(&mut slice) {
                    Some(h) if LEVEL_0_IDS.contains(&h.id) => {
                        // 已经进入下一个 Segment
                        segment.set_end(pos);
                        break;
                    }
                    Some(h) if is_level_1(h.id) || h.id == VOID => h,
                    _ => match self.resync_from(pos).await? {
                        Some(next) => {
                            debug!("MKV: 偏移 {pos} 处数据损坏, 重新同步到 {next}");
                            pos = next;
                            continue;
                        }
                        None => {
                            warn!("MKV: 偏移 {pos} 之后的重新同步窗口内没有可识别的元素");
                            break;
                        }
                    },
                };

                let mut element_end = header.data_end();
                if header.id == CLUSTER {
                    let Some(cluster) =
                        load_cluster(&self.reader, segment, pos, &self.config).await?
                    else {
                        break;
                    };
                    element_end = Some(cluster.end);
                    match matcher(&cluster) {
                        BlockMatch::Exact(index) => return Ok(Some((cluster, index))),
                        BlockMatch::Candidate(index) => {
                            best = Some((Arc::clone(&cluster), index));
                        }
                        BlockMatch::Nothing => {}
                    }
                    current = Some(cluster);
                }

                let end = match element_end {
                    Some(end) => end,
                    None => {
                        search_for_next_element_id(
                            &self.reader,
                            header.data_start,
                            LEVEL_0_AND_1_IDS,
                            segment.end(),
                            self.config.scan_chunk_size,
                        )
                        .await?
                    }
                };

                if segment.end().is_none() {
                    // 长度未知的数据源: 下一个元素是新的 Segment 时, 当前 Segment 到此结束
                    let Some(mut next) = self
                        .reader
                        .request_slice_range(end, MIN_HEADER_SIZE, MAX_HEADER_SIZE)
                        .await?
                    else {
                        break;
                    };
                    if read_element_id(&mut next).ok() == Some(SEGMENT) {
                        segment.set_end(end);
                        break;
                    }
                }

                if end <= pos {
                    break;
                }
                pos = end;
            }

            if let (Some(cue), Some(index)) = (cue, cue_index) {
                let trusted = best
                    .as_ref()
                    .is_some_and(|(cluster, _)| cluster.start >= cue.cluster_position);
                if !trusted {
                    let previous = index.checked_sub(1).map(|i| track.cue_points[i].time);
                    debug!(
                        "MKV: 轨道 {} 的索引点 (时间 {}, 偏移 {}) 不可信, 回退到 {:?}",
                        track.id, cue.time, cue.cluster_position, previous
                    );
                    search_timestamp = previous.unwrap_or(i64::MIN);
                    continue;
                }
            }

            trace!(
                "MKV: 轨道 {} 查找结束, 结果 {:?}",
                track.id,
                best.as_ref().map(|(c, i)| (c.start, *i))
            );
            return Ok(best);
        }
    }

    /// 在有限窗口内寻找下一个 level 1 元素
    async fn resync_from(&self, pos: u64) -> VesselResult<Option<u64>> {
        let window_end = pos.saturating_add(self.config.max_resync_length);
        let limit = self
            .segment
            .end()
            .map_or(window_end, |end| end.min(window_end));
        resync(
            &self.reader,
            pos,
            LEVEL_1_IDS,
            limit,
            self.config.scan_chunk_size,
        )
        .await
    }
}

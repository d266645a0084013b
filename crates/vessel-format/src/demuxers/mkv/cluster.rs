//! 数据簇加载与数据块重建.
//!
//! 数据簇按需整体读入内存, 遍历一次收集各轨道的数据块, 然后逐轨道处理:
//! 1. 相对时间戳加上数据簇基准时间戳
//! 2. 存在反向引用时按依赖关系重排 (被引用的块在前)
//! 3. 建立显示顺序索引
//! 4. 记录首个关键帧, 用相邻显示时间戳之差补全时长
//! 5. 展开分组块, 重建显示顺序索引
//! 6. 计算轨道在数据簇内的起止时间
//! 7. 登记位置缓存 (由 [`Segment::store_cluster`] 完成)

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use vessel_core::{VesselError, VesselResult};

use super::MkvConfig;
use super::ebml::{
    BLOCK, BLOCK_ADD_ID, BLOCK_ADDITIONAL, BLOCK_ADDITIONS, BLOCK_DURATION, BLOCK_GROUP, BLOCK_MORE,
    CLUSTER, CLUSTER_TIMESTAMP, LEVEL_0_AND_1_IDS, MIN_HEADER_SIZE, REFERENCE_BLOCK, SIMPLE_BLOCK,
    read_sint, read_uint, read_vint,
};
use super::lacing::{Lacing, frame_timing, split_frames};
use super::segment::{MkvTrack, Segment};
use super::walker::{
    ChildElements, read_element_header, read_element_header_at, search_for_next_element_id,
};
use crate::io::{FileSlice, Reader};

/// 数据块 (一个帧, 分组展开前可能是多个帧)
#[derive(Debug, Clone)]
pub struct Block {
    /// 时间戳 (tick); 解析时相对数据簇, 之后为绝对值
    pub timestamp: i64,
    /// 时长 (tick), 0 表示未知
    pub duration: i64,
    pub is_key_frame: bool,
    /// 依赖的块的时间戳; 解析时相对本块, 之后为绝对值
    pub references: Vec<i64>,
    pub data: Bytes,
    pub lacing: Lacing,
    /// BlockAddID 为 1 的附加数据 (如 Alpha 平面)
    pub additional: Option<Bytes>,
}

/// 显示顺序索引条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationEntry {
    pub timestamp: i64,
    pub block_index: usize,
}

/// 一个轨道在一个数据簇内的数据
#[derive(Debug, Default)]
pub struct ClusterTrackData {
    /// 解码顺序 (存储顺序, 或按引用关系重排后的顺序)
    pub blocks: Vec<Block>,
    /// 按时间戳排序的索引
    pub presentation_order: Vec<PresentationEntry>,
    pub first_key_frame_timestamp: Option<i64>,
    pub start_timestamp: i64,
    /// 最后一个块的结束时间
    pub end_timestamp: i64,
}

impl ClusterTrackData {
    pub fn is_empty(&self) -> bool {
        self.presentation_order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.presentation_order.len()
    }

    /// 显示顺序第 `index` 个块
    pub fn block_at(&self, index: usize) -> Option<&Block> {
        let entry = self.presentation_order.get(index)?;
        self.blocks.get(entry.block_index)
    }

    fn rebuild_presentation_order(&mut self) {
        let mut order: Vec<PresentationEntry> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(block_index, b)| PresentationEntry {
                timestamp: b.timestamp,
                block_index,
            })
            .collect();
        order.sort_by_key(|e| (e.timestamp, e.block_index));
        self.presentation_order = order;
    }

    #[cfg(test)]
    pub fn with_range(start: i64, end: i64) -> Self {
        let block = Block {
            timestamp: start,
            duration: end - start,
            is_key_frame: true,
            references: Vec::new(),
            data: Bytes::new(),
            lacing: Lacing::None,
            additional: None,
        };
        let mut data = Self {
            blocks: vec![block],
            start_timestamp: start,
            end_timestamp: end,
            first_key_frame_timestamp: Some(start),
            ..Self::default()
        };
        data.rebuild_presentation_order();
        data
    }
}

/// 已加载的数据簇
#[derive(Debug)]
pub struct Cluster {
    /// 元素起始偏移
    pub start: u64,
    pub data_start: u64,
    /// 元素结束偏移 (未知大小或大小损坏时为修正后的值)
    pub end: u64,
    /// 基准时间戳 (tick)
    pub timestamp: i64,
    /// 轨道号 → 数据
    pub tracks: HashMap<u64, ClusterTrackData>,
}

impl Cluster {
    pub fn empty(start: u64, data_start: u64, end: u64) -> Self {
        Self {
            start,
            data_start,
            end,
            timestamp: 0,
            tracks: HashMap::new(),
        }
    }

    pub fn track_data(&self, track_id: u64) -> Option<&ClusterTrackData> {
        self.tracks.get(&track_id).filter(|d| !d.is_empty())
    }
}

/// 加载 `cluster_start` 处的数据簇
///
/// 与 Segment 最近加载的数据簇相同时不做任何 I/O.
/// 头部不可读 (数据截断) 时返回 `Ok(None)`.
pub async fn load_cluster(
    reader: &Reader,
    segment: &Segment,
    cluster_start: u64,
    config: &MkvConfig,
) -> VesselResult<Option<Arc<Cluster>>> {
    if let Some(cluster) = segment.cached_cluster(cluster_start) {
        return Ok(Some(cluster));
    }

    let Some(header) = read_element_header_at(reader, cluster_start).await? else {
        return Ok(None);
    };
    if header.id != CLUSTER {
        return Err(VesselError::InvalidData(format!(
            "MKV: 偏移 {cluster_start} 处不是数据簇 (ID 0x{:X})",
            header.id
        )));
    }

    let size = match header.size {
        Some(size) => size,
        None => {
            let next = search_for_next_element_id(
                reader,
                header.data_start,
                LEVEL_0_AND_1_IDS,
                segment.end(),
                config.scan_chunk_size,
            )
            .await?;
            trace!("MKV: 未知大小数据簇 @{cluster_start} 延伸到 {next}");
            next - header.data_start
        }
    };

    let max_len = usize::try_from(size).unwrap_or(usize::MAX);
    let body = reader
        .request_slice_range(header.data_start, 0, max_len)
        .await?
        .unwrap_or_else(|| FileSlice::new(Bytes::new(), header.data_start));

    let mut cluster = Cluster::empty(cluster_start, header.data_start, header.data_start + size);
    let raw_blocks = read_cluster_body(body, segment, &mut cluster);

    for (track_id, blocks) in raw_blocks {
        let Some(track) = segment.track(track_id) else {
            continue;
        };
        let data = build_track_data(blocks, cluster.timestamp, track);
        cluster.tracks.insert(track_id, data);
    }

    trace!(
        "MKV: 加载数据簇 @{} ({}..{}), 时间戳 {}, {} 个轨道",
        cluster.start,
        cluster.data_start,
        cluster.end,
        cluster.timestamp,
        cluster.tracks.len()
    );

    let cluster = Arc::new(cluster);
    segment.store_cluster(Arc::clone(&cluster));
    Ok(Some(cluster))
}

/// 遍历数据簇内容, 收集每个轨道的原始数据块 (存储顺序)
///
/// 在数据簇内部遇到 level 0/1 元素说明声明的大小有误, 数据簇在此截止.
fn read_cluster_body(
    mut body: FileSlice,
    segment: &Segment,
    cluster: &mut Cluster,
) -> HashMap<u64, Vec<Block>> {
    let mut blocks: HashMap<u64, Vec<Block>> = HashMap::new();

    while body.remaining() >= MIN_HEADER_SIZE {
        let pos = body.file_pos();
        let Some(header) = read_element_header(&mut body) else {
            break;
        };
        if LEVEL_0_AND_1_IDS.contains(&header.id) {
            debug!(
                "MKV: 数据簇 @{} 内遇到 0x{:X} @{pos}, 大小有误, 截断",
                cluster.start, header.id
            );
            cluster.end = pos;
            break;
        }

        let available = body.remaining() as u64;
        let size = match header.size {
            Some(size) if size <= available => size,
            Some(_) => break,
            None => available,
        };
        let Ok(mut element) = body.sub_slice(size) else {
            break;
        };

        let parsed = match header.id {
            CLUSTER_TIMESTAMP => {
                match read_uint(&mut element, size) {
                    Ok(ts) => cluster.timestamp = ts as i64,
                    Err(e) => debug!("MKV: 无效的数据簇时间戳: {e}"),
                }
                continue;
            }
            SIMPLE_BLOCK => parse_simple_block(element, segment),
            BLOCK_GROUP => parse_block_group(element, segment),
            _ => continue,
        };

        match parsed {
            Ok(Some((track_id, block))) => blocks.entry(track_id).or_default().push(block),
            Ok(None) => {}
            Err(e) => debug!("MKV: 跳过损坏的数据块 @{pos}: {e}"),
        }
    }

    blocks
}

/// 解析块头部: 轨道号、相对时间戳、标志
fn read_block_header(slice: &mut FileSlice) -> VesselResult<(u64, i16, u8)> {
    let (track_id, _) = read_vint(slice)?;
    let timestamp = slice.read_i16_be()?;
    let flags = slice.read_u8()?;
    Ok((track_id, timestamp, flags))
}

/// 解析 SimpleBlock; 轨道不存在时返回 `Ok(None)`
fn parse_simple_block(mut slice: FileSlice, segment: &Segment) -> VesselResult<Option<(u64, Block)>> {
    let (track_id, timestamp, flags) = read_block_header(&mut slice)?;
    if segment.track(track_id).is_none() {
        return Ok(None);
    }
    Ok(Some((
        track_id,
        Block {
            timestamp: i64::from(timestamp),
            duration: 0,
            is_key_frame: flags & 0x80 != 0,
            references: Vec::new(),
            data: slice.read_rest(),
            lacing: Lacing::from_flags(flags),
            additional: None,
        },
    )))
}

/// 解析 BlockGroup; 没有 Block 子元素或轨道不存在时返回 `Ok(None)`
fn parse_block_group(slice: FileSlice, segment: &Segment) -> VesselResult<Option<(u64, Block)>> {
    let mut block: Option<(u64, Block)> = None;
    let mut duration = 0i64;
    let mut references = Vec::new();
    let mut additional = None;

    for (header, mut child) in ChildElements::new(slice) {
        let size = child.len() as u64;
        match header.id {
            BLOCK => {
                let (track_id, timestamp, flags) = read_block_header(&mut child)?;
                block = Some((
                    track_id,
                    Block {
                        timestamp: i64::from(timestamp),
                        duration: 0,
                        is_key_frame: true,
                        references: Vec::new(),
                        data: child.read_rest(),
                        lacing: Lacing::from_flags(flags),
                        additional: None,
                    },
                ));
            }
            BLOCK_DURATION => duration = read_uint(&mut child, size)? as i64,
            REFERENCE_BLOCK => references.push(read_sint(&mut child, size)?),
            BLOCK_ADDITIONS => additional = read_block_additions(child)?,
            _ => {}
        }
    }

    let Some((track_id, mut block)) = block else {
        return Ok(None);
    };
    if segment.track(track_id).is_none() {
        return Ok(None);
    }
    block.duration = duration;
    block.is_key_frame = references.is_empty();
    block.references = references;
    block.additional = additional;
    Ok(Some((track_id, block)))
}

/// 取出 BlockAddID 为 1 的附加数据
fn read_block_additions(slice: FileSlice) -> VesselResult<Option<Bytes>> {
    for (header, more) in ChildElements::new(slice) {
        if header.id != BLOCK_MORE {
            continue;
        }
        let mut add_id = 1;
        let mut data = None;
        for (child_header, mut child) in ChildElements::new(more) {
            let size = child.len() as u64;
            match child_header.id {
                BLOCK_ADD_ID => add_id = read_uint(&mut child, size)?,
                BLOCK_ADDITIONAL => data = Some(child.read_rest()),
                _ => {}
            }
        }
        if add_id == 1 && data.is_some() {
            return Ok(data);
        }
    }
    Ok(None)
}

/// 由一个轨道的原始数据块构建数据簇内的轨道数据
pub fn build_track_data(mut blocks: Vec<Block>, base_timestamp: i64, track: &MkvTrack) -> ClusterTrackData {
    for block in &mut blocks {
        block.timestamp += base_timestamp;
        for reference in &mut block.references {
            *reference += block.timestamp;
        }
    }

    if blocks.iter().any(|b| !b.references.is_empty()) {
        blocks = reference_sort(blocks);
    }

    let mut data = ClusterTrackData {
        blocks,
        ..ClusterTrackData::default()
    };
    data.rebuild_presentation_order();

    let order = &data.presentation_order;
    for (i, entry) in order.iter().enumerate() {
        let block = &mut data.blocks[entry.block_index];
        if data.first_key_frame_timestamp.is_none() && block.is_key_frame {
            data.first_key_frame_timestamp = Some(block.timestamp);
        }
        if let Some(next) = order.get(i + 1) {
            block.duration = next.timestamp - entry.timestamp;
        } else if block.duration == 0 && block.lacing == Lacing::None {
            if let Some(default_duration) = track.default_duration {
                block.duration = default_duration;
            }
        }
    }

    if data.blocks.iter().any(|b| b.lacing != Lacing::None) {
        data.blocks = expand_laced_blocks(std::mem::take(&mut data.blocks), track);
        data.rebuild_presentation_order();
    }

    if let (Some(first), Some(last)) = (data.presentation_order.first(), data.presentation_order.last()) {
        data.start_timestamp = first.timestamp;
        data.end_timestamp = last.timestamp + data.blocks[last.block_index].duration;
    }

    data
}

/// 将分组块展开为单帧块, 原块时长按帧均分
fn expand_laced_blocks(blocks: Vec<Block>, track: &MkvTrack) -> Vec<Block> {
    let mut expanded = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.lacing == Lacing::None {
            expanded.push(block);
            continue;
        }

        let frames = match split_frames(&block.data, block.lacing) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("MKV: 轨道 {} 丢弃无法拆分的分组块: {e}", track.id);
                continue;
            }
        };
        let count = frames.len();
        let duration = if block.duration != 0 {
            block.duration
        } else {
            track.default_duration.unwrap_or(0) * count as i64
        };

        for (index, frame) in frames.into_iter().enumerate() {
            let (timestamp, frame_duration) = frame_timing(block.timestamp, duration, count, index);
            expanded.push(Block {
                timestamp,
                duration: frame_duration,
                is_key_frame: block.is_key_frame,
                references: block.references.clone(),
                data: frame,
                lacing: Lacing::None,
                additional: block.additional.clone(),
            });
        }
    }
    expanded
}

/// 按引用关系重排, 使每个块依赖的块排在它之前
///
/// 迭代式深度优先后序遍历; 已访问的块不再访问, 环只会打乱环内部分的顺序.
/// 引用按绝对时间戳匹配, 时间戳重复时匹配存储顺序中的第一个块.
pub fn reference_sort(blocks: Vec<Block>) -> Vec<Block> {
    let mut by_timestamp: HashMap<i64, usize> = HashMap::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        by_timestamp.entry(block.timestamp).or_insert(i);
    }

    let mut visited = vec![false; blocks.len()];
    let mut order = Vec::with_capacity(blocks.len());
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..blocks.len() {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            match blocks[node].references.get(cursor) {
                Some(reference) => {
                    top.1 += 1;
                    if let Some(&dep) = by_timestamp.get(reference) {
                        if !visited[dep] {
                            visited[dep] = true;
                            stack.push((dep, 0));
                        }
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
    }

    let mut slots: Vec<Option<Block>> = blocks.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

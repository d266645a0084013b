//! Matroska 轨道后端.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use vessel_codec::{CodecId, Packet, PacketOrigin};
use vessel_core::{Rational, VesselError, VesselResult};

use super::MkvConfig;
use super::cache::{PositionKey, binary_search_less_or_equal};
use super::cluster::{Block, Cluster};
use super::lookup::{BlockMatch, TrackLookup};
use super::segment::{MkvTrack, Segment};
use crate::demuxer::{ReadOptions, TrackBacking};
use crate::io::Reader;
use crate::track::TrackKind;

/// 数据包在数据簇中的位置, 存放在 [`Packet::origin`] 中
struct PacketLocation {
    /// 产生该数据包的轨道后端
    backing: usize,
    cluster: Arc<Cluster>,
    /// 显示顺序下标
    index: usize,
}

/// Matroska 轨道后端
///
/// 同一轨道上的查找互斥执行, 避免交错的查找争用 Segment 的单槽数据簇缓存.
pub struct MkvTrackBacking {
    lookup: TrackLookup,
    lock: Mutex<()>,
}

impl MkvTrackBacking {
    pub fn new(reader: Reader, segment: Arc<Segment>, track: Arc<MkvTrack>, config: MkvConfig) -> Self {
        Self {
            lookup: TrackLookup {
                reader,
                segment,
                track,
                config,
            },
            lock: Mutex::new(()),
        }
    }

    fn track(&self) -> &MkvTrack {
        &self.lookup.track
    }

    fn backing_key(&self) -> usize {
        self as *const Self as usize
    }

    /// 取回数据包的位置; 不是本轨道产生的数据包属于调用错误
    fn location<'p>(&self, packet: &'p Packet) -> VesselResult<&'p PacketLocation> {
        packet
            .origin
            .as_ref()
            .and_then(|origin| origin.downcast_ref::<PacketLocation>())
            .filter(|loc| loc.backing == self.backing_key())
            .ok_or_else(|| {
                VesselError::InvalidArgument(format!(
                    "数据包不是由轨道 {} 产生的",
                    self.track().id
                ))
            })
    }

    /// 负载: 头部剥离压缩时补回前缀
    fn payload(&self, block: &Block) -> Bytes {
        match &self.track().header_strip {
            Some(prefix) => {
                let mut buf = BytesMut::with_capacity(prefix.len() + block.data.len());
                buf.extend_from_slice(prefix);
                buf.extend_from_slice(&block.data);
                buf.freeze()
            }
            None => block.data.clone(),
        }
    }

    fn make_packet(
        &self,
        cluster: Arc<Cluster>,
        index: usize,
        options: ReadOptions,
    ) -> VesselResult<Packet> {
        let track = self.track();
        let block = cluster
            .track_data(track.id)
            .and_then(|data| data.block_at(index))
            .ok_or_else(|| {
                VesselError::Internal(format!(
                    "数据簇 @{} 不包含轨道 {} 的第 {index} 个块",
                    cluster.start, track.id
                ))
            })?;

        let mut packet = if options.metadata_only {
            let prefix_len = track.header_strip.as_ref().map_or(0, Bytes::len);
            Packet::placeholder(prefix_len + block.data.len())
        } else {
            Packet::from_data(self.payload(block))
        };
        packet.side_data = block.additional.clone();
        packet.pts = block.timestamp;
        packet.dts = block.timestamp;
        packet.duration = block.duration;
        packet.time_base = self.lookup.segment.time_base;
        packet.track_id = track.id;
        packet.is_keyframe = block.is_key_frame;
        packet.pos = cluster.start as i64;
        packet.origin = Some(PacketOrigin::new(PacketLocation {
            backing: self.backing_key(),
            cluster,
            index,
        }));
        Ok(packet)
    }

    async fn lookup_packet<M>(
        &self,
        start_cluster: Option<Arc<Cluster>>,
        matcher: M,
        position_key: PositionKey,
        search_timestamp: i64,
        latest_timestamp: i64,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>>
    where
        M: Fn(&Cluster) -> BlockMatch + Sync,
    {
        let _guard = self.lock.lock().await;
        let found = self
            .lookup
            .perform_cluster_lookup(
                start_cluster,
                matcher,
                position_key,
                search_timestamp,
                latest_timestamp,
            )
            .await?;
        found
            .map(|(cluster, index)| self.make_packet(cluster, index, options))
            .transpose()
    }
}

#[async_trait]
impl TrackBacking for MkvTrackBacking {
    fn id(&self) -> u64 {
        self.track().id
    }

    fn kind(&self) -> &TrackKind {
        &self.track().kind
    }

    fn codec_id(&self) -> CodecId {
        self.track().codec_id
    }

    fn codec_string(&self) -> &str {
        &self.track().codec_string
    }

    fn decoder_config(&self) -> Option<&[u8]> {
        self.track().codec_private.as_deref()
    }

    fn language(&self) -> &str {
        &self.track().language
    }

    fn name(&self) -> Option<&str> {
        self.track().name.as_deref()
    }

    fn is_default(&self) -> bool {
        self.track().is_default
    }

    fn is_forced(&self) -> bool {
        self.track().is_forced
    }

    fn codec_delay(&self) -> u64 {
        self.track().codec_delay
    }

    fn seek_pre_roll(&self) -> u64 {
        self.track().seek_pre_roll
    }

    fn time_base(&self) -> Rational {
        self.lookup.segment.time_base
    }

    async fn get_first_packet(&self, options: ReadOptions) -> VesselResult<Option<Packet>> {
        let id = self.track().id;
        let matcher = move |cluster: &Cluster| match cluster.track_data(id) {
            Some(_) => BlockMatch::Exact(0),
            None => BlockMatch::Nothing,
        };
        self.lookup_packet(None, matcher, PositionKey::Start, i64::MIN, i64::MAX, options)
            .await
    }

    async fn get_packet(
        &self,
        timestamp: i64,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>> {
        let id = self.track().id;
        let matcher = move |cluster: &Cluster| {
            let Some(data) = cluster.track_data(id) else {
                return BlockMatch::Nothing;
            };
            match binary_search_less_or_equal(&data.presentation_order, timestamp, |e| e.timestamp)
            {
                Some(index) if timestamp < data.end_timestamp => BlockMatch::Exact(index),
                Some(index) => BlockMatch::Candidate(index),
                None => BlockMatch::Nothing,
            }
        };
        self.lookup_packet(None, matcher, PositionKey::Start, timestamp, timestamp, options)
            .await
    }

    async fn get_next_packet(
        &self,
        packet: &Packet,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>> {
        let location = self.location(packet)?;
        let id = self.track().id;
        let origin_start = location.cluster.start;
        let origin_index = location.index;
        let matcher = move |cluster: &Cluster| {
            let Some(data) = cluster.track_data(id) else {
                return BlockMatch::Nothing;
            };
            if cluster.start == origin_start {
                if origin_index + 1 < data.len() {
                    BlockMatch::Exact(origin_index + 1)
                } else {
                    BlockMatch::Nothing
                }
            } else {
                BlockMatch::Exact(0)
            }
        };
        self.lookup_packet(
            Some(Arc::clone(&location.cluster)),
            matcher,
            PositionKey::Start,
            i64::MIN,
            i64::MAX,
            options,
        )
        .await
    }

    async fn get_key_packet(
        &self,
        timestamp: i64,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>> {
        let id = self.track().id;
        let matcher = move |cluster: &Cluster| {
            let Some(data) = cluster.track_data(id) else {
                return BlockMatch::Nothing;
            };
            if data
                .first_key_frame_timestamp
                .is_none_or(|first| first > timestamp)
            {
                return BlockMatch::Nothing;
            }
            let found = data.presentation_order.iter().rposition(|e| {
                e.timestamp <= timestamp && data.blocks[e.block_index].is_key_frame
            });
            match found {
                Some(index) if timestamp < data.end_timestamp => BlockMatch::Exact(index),
                Some(index) => BlockMatch::Candidate(index),
                None => BlockMatch::Nothing,
            }
        };
        self.lookup_packet(None, matcher, PositionKey::KeyFrame, timestamp, timestamp, options)
            .await
    }

    async fn get_next_key_packet(
        &self,
        packet: &Packet,
        options: ReadOptions,
    ) -> VesselResult<Option<Packet>> {
        let location = self.location(packet)?;
        let id = self.track().id;
        let origin_start = location.cluster.start;
        let origin_index = location.index;
        let matcher = move |cluster: &Cluster| {
            let Some(data) = cluster.track_data(id) else {
                return BlockMatch::Nothing;
            };
            let from = if cluster.start == origin_start {
                origin_index + 1
            } else {
                0
            };
            (from..data.len())
                .find(|&i| data.block_at(i).is_some_and(|b| b.is_key_frame))
                .map_or(BlockMatch::Nothing, BlockMatch::Exact)
        };
        self.lookup_packet(
            Some(Arc::clone(&location.cluster)),
            matcher,
            PositionKey::KeyFrame,
            i64::MIN,
            i64::MAX,
            options,
        )
        .await
    }

    async fn compute_duration(&self) -> VesselResult<f64> {
        let last = self.get_packet(i64::MAX, ReadOptions::METADATA_ONLY).await?;
        let end = last.map_or(0, |p| p.end_pts());
        Ok(self.lookup.segment.ticks_to_seconds(end))
    }
}

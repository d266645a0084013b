//! # vessel-codec
//!
//! 编解码器标识与压缩数据包 (Packet) 抽象.
//!
//! 本工具包不解码样本, 这里只描述"数据是什么编码"和"一帧数据在哪里".

pub mod codec_id;
pub mod packet;

// 重导出常用类型
pub use codec_id::CodecId;
pub use packet::{Packet, PacketOrigin};

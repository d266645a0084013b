//! 格式探测.
//!
//! 通过文件头部的 EBML 魔数和 DocType, 以及文件扩展名识别容器格式.

use crate::demuxers::mkv::MkvProbe;
use crate::format_id::FormatId;

/// 探测置信度
pub type ProbeScore = u32;

/// 最低探测分数 (仅根据扩展名)
pub const SCORE_EXTENSION: ProbeScore = 50;

/// 魔数匹配但 DocType 未确认
pub const SCORE_MAGIC: ProbeScore = 90;

/// 最高探测分数 (魔数与 DocType 均匹配)
pub const SCORE_MAX: ProbeScore = 100;

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// 识别出的格式
    pub format_id: FormatId,
    /// 置信度分数
    pub score: ProbeScore,
}

/// 格式探测器 trait
pub trait FormatProbe {
    /// 根据文件头部数据 (及可选的文件名) 探测格式
    ///
    /// 不是此格式时返回 `None`.
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeResult>;
}

/// 使用所有内置探测器探测, 返回置信度最高的结果
pub fn probe_format(data: &[u8], filename: Option<&str>) -> Option<ProbeResult> {
    let probes: [&dyn FormatProbe; 1] = [&MkvProbe];
    probes
        .iter()
        .filter_map(|p| p.probe(data, filename))
        .max_by_key(|r| r.score)
}

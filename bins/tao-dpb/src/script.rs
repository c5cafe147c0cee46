//! slice 头回放脚本.
//!
//! 脚本为 JSON:
//!
//! ```json
//! {
//!   "config": { "worker_threads": 2 },
//!   "stream": { "width_in_mbs": 2, "height_in_mbs": 2, "max_num_ref_frames": 2 },
//!   "slices": [
//!     { "nal_ref_idc": 3, "nal_unit_type": 5, "slice_type": "I" },
//!     { "nal_ref_idc": 2, "nal_unit_type": 1, "slice_type": "P", "frame_num": 1,
//!       "num_ref_idx_active": [1, 0], "fail_after": 2 }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tao_h264::{DecoderConfig, SliceHeader, StreamParams};

/// 一个回放脚本
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub config: Option<DecoderConfig>,
    pub stream: StreamParams,
    pub slices: Vec<ScriptSlice>,
}

/// 脚本中的一个 slice: header 字段加合成流水线的控制项
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSlice {
    #[serde(flatten)]
    pub header: SliceHeader,
    /// slice 覆盖的宏块数, 缺省到图像末尾
    #[serde(default)]
    pub mb_count: Option<u32>,
    /// 解码若干宏块后模拟失败
    #[serde(default)]
    pub fail_after: Option<u32>,
}

/// 合成流水线从 slice 载荷读取的控制项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceControl {
    pub mb_count: Option<u32>,
    pub fail_after: Option<u32>,
}

impl SliceControl {
    const NONE: u32 = u32::MAX;

    /// 编码为 8 字节载荷 (两个小端 u32, `u32::MAX` 表示缺省)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.mb_count.unwrap_or(Self::NONE));
        buf.put_u32_le(self.fail_after.unwrap_or(Self::NONE));
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Self {
        let field = |offset: usize| {
            payload
                .get(offset..offset + 4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_le_bytes)
                .filter(|&v| v != Self::NONE)
        };
        Self {
            mb_count: field(0),
            fail_after: field(4),
        }
    }
}

impl ScriptSlice {
    /// 生成提交给解码器的 header, 控制项写入载荷
    pub fn to_header(&self) -> SliceHeader {
        let mut header = self.header.clone();
        header.payload = SliceControl {
            mb_count: self.mb_count,
            fail_after: self.fail_after,
        }
        .encode();
        header
    }
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("解析回放脚本失败")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取回放脚本失败: {}", path.display()))?;
        Self::from_json(&text)
    }
}

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 全局时间基：每秒的 tick 数（微秒精度）
///
/// 管线内所有 pts/dts/duration 都使用这个时间基，
/// `None` 表示“无时间戳”（NOPTS）。
pub const TIME_BASE: i64 = 1_000_000;

/// 暂停速度
pub const PLAYSPEED_PAUSE: i32 = 0;
/// 正常速度（1x）
pub const PLAYSPEED_NORMAL: i32 = 1000;

/// 秒转 tick
pub fn sec_to_time(sec: f64) -> i64 {
    (sec * TIME_BASE as f64).round() as i64
}

/// 毫秒转 tick
pub fn msec_to_time(ms: i64) -> i64 {
    ms * (TIME_BASE / 1000)
}

/// tick 转毫秒
pub fn time_to_msec(time: i64) -> i64 {
    time / (TIME_BASE / 1000)
}

/// tick 转秒
pub fn time_to_sec(time: i64) -> f64 {
    time as f64 / TIME_BASE as f64
}

/// 小端 FourCC（与容器里的 codec tag 排列一致）
pub const fn mktag(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// 大端 FourCC
pub const fn mkbetag(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (d as u32) | ((c as u32) << 8) | ((b as u32) << 16) | ((a as u32) << 24)
}

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    None,
    Audio,
    Video,
    Subtitle,
    Data,
    Teletext,
}

/// 编码 ID（只列出管线需要区分的编码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg4,
    H264,
    Hevc,
    Vc1,
    Wmv3,
    Vp6,
    Vp6f,
    Vp6a,
    Vp8,
    Vp9,
    Av1,
    Flv1,
    Rv10,
    Rv20,
    Rv30,
    Rv40,
    Aac,
    Ac3,
    Dts,
    Mp3,
    Flac,
    Pcm,
    Text,
    Ass,
    Dvb,
    Teletext,
    Ttf,
    None,
    /// 其他编码（保留容器给出的原始编号）
    Other(u32),
}

impl CodecId {
    /// 是否是已知编码（用于“单轨已知编码”回退判断）
    pub fn is_known(&self) -> bool {
        !matches!(self, CodecId::None | CodecId::Other(_))
    }

    pub fn name(&self) -> String {
        match self {
            CodecId::Other(id) => format!("codec#{}", id),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

/// 解封装后的数据包
///
/// 负载用 `Arc<[u8]>` 共享：回放缓冲区需要保留已发送包的副本，
/// 克隆只增加引用计数。
#[derive(Debug, Clone)]
pub struct DemuxPacket {
    /// 连续流 ID（由流注册表分配）
    pub stream_id: i32,
    pub data: Arc<[u8]>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// 持续时间（tick），0 表示未知
    pub duration: i64,
    pub group_id: i32,
}

impl DemuxPacket {
    pub fn new(stream_id: i32, data: Vec<u8>) -> Self {
        Self {
            stream_id,
            data: Arc::from(data),
            pts: None,
            dts: None,
            duration: 0,
            group_id: 0,
        }
    }

    pub fn with_timestamps(mut self, pts: Option<i64>, dts: Option<i64>) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 排序用时间戳：优先 dts，其次 pts
    pub fn timestamp(&self) -> Option<i64> {
        self.dts.or(self.pts)
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
    /// 硬件直出，数据不经过 CPU
    Bypass,
}

/// 图像标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureFlags(u32);

impl PictureFlags {
    pub const ALLOCATED: u32 = 0x0001;
    pub const DROPPED: u32 = 0x0002;
    pub const INTERLACED: u32 = 0x0004;
    pub const TOP_FIELD_FIRST: u32 = 0x0008;
    pub const NOSKIP: u32 = 0x0010;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }
}

/// 解码后的图像
#[derive(Debug, Clone)]
pub struct Picture {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// 持续时间（tick），0 表示解码器没有给出
    pub duration: i64,
    /// 重复场次数（软 telecine）
    pub repeat_picture: u32,
    pub flags: PictureFlags,
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Picture {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            pts: None,
            dts: None,
            duration: 0,
            repeat_picture: 0,
            flags: PictureFlags::empty(),
            width,
            height,
            display_width: width,
            display_height: height,
            format,
            data: Vec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.flags.contains(PictureFlags::ALLOCATED)
    }
}

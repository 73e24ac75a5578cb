use crate::core::{CodecId, OpenError, StreamType, TIME_BASE};
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// 字节数据源（文件/网络/光盘等输入流的抽象）
///
/// 具体实现不在本库范围内，解封装器只通过这个接口读取数据。
pub trait ByteSource: Send {
    /// 读取数据，返回 0 表示到达末尾
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// 定位，返回新的偏移
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// 总长度（未知时返回 None）
    fn length(&self) -> Option<u64>;

    /// 数据源自身是否要求中断（例如用户取消）
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// I/O 中断句柄：中止标志 + 看门狗截止时间
///
/// 容器解析库的 I/O 回调在每次读写前后轮询它，
/// 超时或中止后正在进行的读取会尽快返回中断状态。
#[derive(Debug, Default)]
pub struct InterruptHandle {
    aborted: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求中止（不会自动恢复，需要调用 reset）
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        *self.deadline.lock() = None;
    }

    /// 设置看门狗
    pub fn set_timeout(&self, timeout: Duration) {
        *self.deadline.lock() = Some(Instant::now() + timeout);
    }

    /// 取消看门狗
    pub fn clear_timeout(&self) {
        *self.deadline.lock() = None;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        if self.is_aborted() {
            return true;
        }
        matches!(*self.deadline.lock(), Some(deadline) if Instant::now() >= deadline)
    }
}

/// 带中断检查的数据源包装
pub struct GuardedSource {
    inner: Box<dyn ByteSource>,
    interrupt: Arc<InterruptHandle>,
}

impl GuardedSource {
    pub fn new(inner: Box<dyn ByteSource>, interrupt: Arc<InterruptHandle>) -> Self {
        Self { inner, interrupt }
    }

    fn check(&self) -> io::Result<()> {
        if self.interrupt.is_interrupted() || self.inner.is_interrupted() {
            Err(io::Error::new(io::ErrorKind::Interrupted, "I/O 被中断"))
        } else {
            Ok(())
        }
    }
}

impl ByteSource for GuardedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let n = self.inner.read(buf)?;
        self.check()?;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check()?;
        let offset = self.inner.seek(pos)?;
        self.check()?;
        Ok(offset)
    }

    fn length(&self) -> Option<u64> {
        self.inner.length()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted() || self.inner.is_interrupted()
    }
}

/// 流时间基（num/den 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 把流时间基下的值换算成全局 tick（四舍五入）
    pub fn to_time(&self, value: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        let scaled = value as i128 * self.num as i128 * TIME_BASE as i128;
        let den = self.den as i128;
        let (q, r) = (scaled / den, scaled % den);
        // 四舍五入（远离零）
        let rounded = if 2 * r.abs() >= den.abs() {
            q + scaled.signum() * den.signum()
        } else {
            q
        };
        rounded as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        // 与全局时间基一致
        Self::new(1, TIME_BASE as i32)
    }
}

/// 附件（字体等）
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_font(&self) -> bool {
        matches!(
            self.mime_type.as_str(),
            "application/x-truetype-font"
                | "application/vnd.ms-opentype"
                | "application/x-font-ttf"
                | "application/font-sfnt"
                | "font/ttf"
                | "font/otf"
        )
    }
}

/// 封面图片标志
pub const DISPOSITION_ATTACHED_PIC: u32 = 0x0400;

/// 容器给出的实时流信息（每次查询都是当前值）
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    /// 容器内的物理 ID（例如 TS 的 PID）
    pub physical_id: i32,
    pub stream_type: StreamType,
    pub codec: CodecId,
    pub codec_tag: u32,
    pub language: Option<String>,
    pub extradata: Vec<u8>,
    pub time_base: TimeBase,
    /// 起始时间（流时间基）
    pub start_time: Option<i64>,
    /// 时长（流时间基）
    pub duration: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub fps_rate: u32,
    pub fps_scale: u32,
    pub aspect: f64,
    pub profile: i32,
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,
    pub bit_rate: u64,
    pub disposition: u32,
    pub attachment: Option<Attachment>,
}

impl StreamInfo {
    pub fn new(index: usize, stream_type: StreamType, codec: CodecId) -> Self {
        Self {
            index,
            physical_id: index as i32,
            stream_type,
            codec,
            codec_tag: 0,
            language: None,
            extradata: Vec::new(),
            time_base: TimeBase::default(),
            start_time: None,
            duration: None,
            width: 0,
            height: 0,
            fps_rate: 0,
            fps_scale: 0,
            aspect: 0.0,
            profile: 0,
            channels: 0,
            sample_rate: 0,
            bits_per_sample: 0,
            block_align: 0,
            bit_rate: 0,
            disposition: 0,
            attachment: None,
        }
    }
}

/// 节目（一组基本流）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub program_number: u32,
    pub stream_indexes: Vec<usize>,
}

/// 容器解析库读出的原始帧（时间戳为流时间基）
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub stream_index: i32,
    /// 解析库报告的大小（可能为负，表示解析出错）
    pub size: i32,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// 字幕等格式的收敛时长
    pub convergence_duration: i64,
    pub keyframe: bool,
}

impl RawPacket {
    pub fn new(stream_index: i32, data: Vec<u8>) -> Self {
        Self {
            stream_index,
            size: data.len() as i32,
            data,
            pts: None,
            dts: None,
            duration: 0,
            convergence_duration: 0,
            keyframe: false,
        }
    }
}

/// 读取帧失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameReadError {
    #[error("读取被中断")]
    Interrupted,

    #[error("暂时无数据")]
    WouldBlock,

    #[error("到达流末尾")]
    Eof,

    #[error("读取错误: {0}")]
    Io(String),

    #[error("数据损坏: {0}")]
    Corrupt(String),
}

impl FrameReadError {
    /// 超时/中断类错误不算失败
    pub fn is_transient(&self) -> bool {
        matches!(self, FrameReadError::Interrupted | FrameReadError::WouldBlock)
    }
}

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMatch {
    pub format: String,
    pub score: u32,
}

/// 打开容器时的调优参数
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// 流结构分析时长
    pub analyze_duration: Duration,
    /// 是否自动检测帧率
    pub detect_frame_rate: bool,
    pub interrupt: Arc<InterruptHandle>,
}

/// 容器解析库（格式探测 + 打开）
pub trait ContainerBackend: Send + Sync {
    /// 按内容类型查找格式
    fn format_for_content_type(&self, _content_type: &str) -> Option<String> {
        None
    }

    /// 自动探测格式
    fn probe(&self, buffer: &[u8]) -> Option<ProbeMatch>;

    /// 用指定格式探测，返回得分（0 表示不匹配）
    fn probe_format(&self, format: &str, buffer: &[u8]) -> u32;

    /// 用选定格式打开数据源
    fn open(
        &self,
        format: &str,
        source: Box<dyn ByteSource>,
        options: &OpenOptions,
    ) -> std::result::Result<Box<dyn ContainerSource>, OpenError>;
}

/// 已打开的容器（格式相关的解析状态）
///
/// 所有权归 Demuxer 独占。
pub trait ContainerSource: Send {
    /// 格式名（例如 "mpegts"、"matroska"）
    fn format_name(&self) -> &str;

    /// 流结构分析
    fn find_stream_info(&mut self) -> std::result::Result<(), OpenError>;

    /// 读取下一帧
    fn read_frame(&mut self) -> std::result::Result<RawPacket, FrameReadError>;

    fn stream_count(&self) -> usize;

    /// 查询流的当前信息，索引无效时返回 None
    fn stream_info(&self, index: usize) -> Option<StreamInfo>;

    /// 当前已知的节目表
    fn programs(&self) -> Vec<ProgramInfo>;

    /// 容器起始时间（全局 tick）
    fn start_time(&self) -> Option<i64>;

    /// 容器时长（全局 tick）
    fn duration(&self) -> Option<i64>;

    fn eof_reached(&self) -> bool;

    fn clear_eof(&mut self);

    /// 丢弃读取中的残留数据（不关闭容器）
    fn flush(&mut self);

    /// 定位到全局 tick
    fn seek(&mut self, time: i64) -> std::result::Result<(), FrameReadError>;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String {
        format!("容器: {}", self.format_name())
    }
}

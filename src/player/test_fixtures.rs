//! 测试用的内存替身：数据源、容器、解码器、渲染器、时钟、硬件解码器

use crate::core::{
    CodecId, MasterClock, OpenError, Picture, PictureFlags, PixelFormat, PlayerError, StreamType,
};
use crate::player::decoder::{CodecProvider, DecodeStatus, StreamHints, VideoCodec};
use crate::player::demuxer_source::{
    ByteSource, ContainerBackend, ContainerSource, FrameReadError, OpenOptions, ProbeMatch, ProgramInfo,
    RawPacket, StreamInfo,
};
use crate::player::video_player::{OutputResult, PostProcessor, RenderSink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[cfg(feature = "hwaccel")]
use crate::player::hw_decoder::{DisplayCallback, DisplayInfo, ExternalDecoder, HwCommand, HwDecodeState};

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn video_info(index: usize, width: u32, height: u32) -> StreamInfo {
    let mut info = StreamInfo::new(index, StreamType::Video, CodecId::H264);
    info.width = width;
    info.height = height;
    info.fps_rate = 25;
    info.fps_scale = 1;
    info
}

pub fn audio_info(index: usize, channels: u32, sample_rate: u32) -> StreamInfo {
    let mut info = StreamInfo::new(index, StreamType::Audio, CodecId::Aac);
    info.channels = channels;
    info.sample_rate = sample_rate;
    info
}

pub fn raw_packet(index: i32, pts: Option<i64>, dts: Option<i64>) -> RawPacket {
    let mut packet = RawPacket::new(index, vec![0xAB; 16]);
    packet.pts = pts;
    packet.dts = dts;
    packet.keyframe = true;
    packet
}

/// 内存数据源
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => self.data.len() as i64 + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.pos = (target as usize).min(self.data.len());
        Ok(self.pos as u64)
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// 每次读取都很慢、永远读不完的数据源
pub struct SlowSource {
    delay: Duration,
}

impl SlowSource {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ByteSource for SlowSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(self.delay);
        if buf.is_empty() {
            return Ok(0);
        }
        buf[0] = 0;
        Ok(1)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Ok(0)
    }

    fn length(&self) -> Option<u64> {
        None
    }
}

/// 容器脚本：测试可以在读取过程中修改
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub format: String,
    pub probe_result: Option<String>,
    pub spdif: bool,
    pub frames: VecDeque<Result<RawPacket, FrameReadError>>,
    pub streams: Vec<StreamInfo>,
    pub programs: Vec<ProgramInfo>,
    /// 第 n 次读取时节目表出现
    pub programs_after: Option<(usize, Vec<ProgramInfo>)>,
    pub analysis_error: Option<OpenError>,
    pub start_time: Option<i64>,
    pub duration: Option<i64>,
    pub reads: usize,
    pub eof: bool,
    /// clear_eof 不清除 eof 标志
    pub sticky_eof: bool,
    pub flushes: usize,
    pub seeks: Vec<i64>,
    /// 节目表被查询的次数
    pub program_queries: usize,
}

impl ContainerState {
    pub fn new(format: &str) -> Self {
        Self {
            format: format.to_string(),
            probe_result: Some(format.to_string()),
            spdif: false,
            frames: VecDeque::new(),
            streams: Vec::new(),
            programs: Vec::new(),
            programs_after: None,
            analysis_error: None,
            start_time: None,
            duration: None,
            reads: 0,
            eof: false,
            sticky_eof: false,
            flushes: 0,
            seeks: Vec::new(),
            program_queries: 0,
        }
    }

    pub fn push(&mut self, packet: RawPacket) {
        self.frames.push_back(Ok(packet));
    }

    pub fn push_error(&mut self, error: FrameReadError) {
        self.frames.push_back(Err(error));
    }
}

pub type SharedContainer = Arc<Mutex<ContainerState>>;

pub struct MockContainer {
    state: SharedContainer,
    format: String,
}

impl ContainerSource for MockContainer {
    fn format_name(&self) -> &str {
        &self.format
    }

    fn find_stream_info(&mut self) -> Result<(), OpenError> {
        match self.state.lock().analysis_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_frame(&mut self) -> Result<RawPacket, FrameReadError> {
        let mut state = self.state.lock();
        state.reads += 1;
        let reads = state.reads;
        if let Some((after, programs)) = state.programs_after.clone() {
            if reads >= after {
                state.programs = programs;
                state.programs_after = None;
            }
        }
        match state.frames.pop_front() {
            Some(frame) => frame,
            None => {
                state.eof = true;
                Err(FrameReadError::Eof)
            }
        }
    }

    fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    fn stream_info(&self, index: usize) -> Option<StreamInfo> {
        self.state.lock().streams.get(index).cloned()
    }

    fn programs(&self) -> Vec<ProgramInfo> {
        let mut state = self.state.lock();
        state.program_queries += 1;
        state.programs.clone()
    }

    fn start_time(&self) -> Option<i64> {
        self.state.lock().start_time
    }

    fn duration(&self) -> Option<i64> {
        self.state.lock().duration
    }

    fn eof_reached(&self) -> bool {
        self.state.lock().eof
    }

    fn clear_eof(&mut self) {
        let mut state = self.state.lock();
        if !state.sticky_eof {
            state.eof = false;
        }
    }

    fn flush(&mut self) {
        self.state.lock().flushes += 1;
    }

    fn seek(&mut self, time: i64) -> Result<(), FrameReadError> {
        self.state.lock().seeks.push(time);
        Ok(())
    }
}

/// 容器解析库替身
pub struct MockBackend {
    state: SharedContainer,
    opened: Mutex<Option<(String, Duration)>>,
}

impl MockBackend {
    pub fn new(state: ContainerState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            opened: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SharedContainer {
        self.state.clone()
    }

    pub fn opened_format(&self) -> Option<String> {
        self.opened.lock().as_ref().map(|(f, _)| f.clone())
    }

    pub fn analyze_duration(&self) -> Option<Duration> {
        self.opened.lock().as_ref().map(|(_, d)| *d)
    }
}

impl ContainerBackend for MockBackend {
    fn probe(&self, _buffer: &[u8]) -> Option<ProbeMatch> {
        self.state.lock().probe_result.clone().map(|format| ProbeMatch { format, score: 100 })
    }

    fn probe_format(&self, format: &str, _buffer: &[u8]) -> u32 {
        if format == "spdif" && self.state.lock().spdif {
            100
        } else {
            0
        }
    }

    fn open(
        &self,
        format: &str,
        _source: Box<dyn ByteSource>,
        options: &OpenOptions,
    ) -> Result<Box<dyn ContainerSource>, OpenError> {
        *self.opened.lock() = Some((format.to_string(), options.analyze_duration));
        Ok(Box::new(MockContainer {
            state: self.state.clone(),
            format: format.to_string(),
        }))
    }
}

/// 解码器调用记录
#[derive(Debug, Clone, Default)]
pub struct CodecLog {
    pub opens: usize,
    /// 每次送入数据包时的 (pts, dts)
    pub decoded: Vec<(Option<i64>, Option<i64>)>,
    pub drop_states: Vec<bool>,
    pub controls: Vec<u32>,
    pub filters: Vec<u32>,
    pub speeds: Vec<i32>,
    pub resets: usize,
    pub reopens: usize,
    pub disposed: bool,
}

/// 脚本化解码器：默认每个包出一帧，可以预先压入状态
#[derive(Clone)]
pub struct MockCodec {
    name: String,
    log: Arc<Mutex<CodecLog>>,
    script: Arc<Mutex<VecDeque<u32>>>,
    fail_open: bool,
    converge: usize,
    repeat: u32,
    interlaced: bool,
    width: u32,
    height: u32,
    pending: Option<Picture>,
    buffered: Arc<Mutex<f64>>,
}

impl MockCodec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::new(Mutex::new(CodecLog::default())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fail_open: false,
            converge: 0,
            repeat: 0,
            interlaced: false,
            width: 0,
            height: 0,
            pending: None,
            buffered: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_converge_count(mut self, count: usize) -> Self {
        self.converge = count;
        self
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_interlaced(mut self) -> Self {
        self.interlaced = true;
        self
    }

    /// 解码器内部缓存的时长（秒）
    pub fn set_time_size(&self, seconds: f64) {
        *self.buffered.lock() = seconds;
    }

    /// 下一次送包时返回的状态
    pub fn push_status(&self, status: u32) {
        self.script.lock().push_back(status);
    }

    pub fn log(&self) -> CodecLog {
        self.log.lock().clone()
    }
}

impl VideoCodec for MockCodec {
    fn open(&mut self, hints: &StreamHints) -> crate::core::Result<()> {
        if self.fail_open {
            return Err(PlayerError::DecodeError(format!("{} 打开失败", self.name)));
        }
        self.width = hints.width;
        self.height = hints.height;
        self.log.lock().opens += 1;
        Ok(())
    }

    fn dispose(&mut self) {
        self.log.lock().disposed = true;
    }

    fn decode(&mut self, data: Option<&[u8]>, dts: Option<i64>, pts: Option<i64>) -> DecodeStatus {
        if data.is_none() {
            return DecodeStatus::buffer();
        }
        self.log.lock().decoded.push((pts, dts));

        let status = self
            .script
            .lock()
            .pop_front()
            .map(DecodeStatus::new)
            .unwrap_or(DecodeStatus::new(DecodeStatus::PICTURE | DecodeStatus::BUFFER));

        if status.contains(DecodeStatus::PICTURE) {
            let mut picture = Picture::new(self.width, self.height, PixelFormat::RGBA);
            picture.flags.insert(PictureFlags::ALLOCATED);
            if self.interlaced {
                picture.flags.insert(PictureFlags::INTERLACED);
            }
            picture.pts = pts;
            picture.dts = dts;
            picture.repeat_picture = self.repeat;
            self.pending = Some(picture);
        }
        status
    }

    fn reset(&mut self) {
        self.pending = None;
        self.log.lock().resets += 1;
    }

    fn reopen(&mut self) -> bool {
        self.pending = None;
        self.log.lock().reopens += 1;
        true
    }

    fn picture(&mut self) -> Option<Picture> {
        self.pending.take()
    }

    fn set_drop_state(&mut self, drop: bool) {
        self.log.lock().drop_states.push(drop);
    }

    fn set_speed(&mut self, speed: i32) {
        self.log.lock().speeds.push(speed);
    }

    fn set_codec_control(&mut self, flags: u32) {
        self.log.lock().controls.push(flags);
    }

    fn set_filters(&mut self, filters: u32) -> u32 {
        self.log.lock().filters.push(filters);
        0
    }

    fn converge_count(&self) -> usize {
        self.converge
    }

    fn time_size(&self) -> f64 {
        *self.buffered.lock()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct MockCodecProvider {
    name: String,
    codec: MockCodec,
}

impl MockCodecProvider {
    pub fn new(name: &str, codec: MockCodec) -> Self {
        Self {
            name: name.to_string(),
            codec,
        }
    }

    /// 创建的解码器总是打开失败
    pub fn failing(name: &str) -> Self {
        Self::new(name, MockCodec::new(name).failing())
    }
}

impl CodecProvider for MockCodecProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Box<dyn VideoCodec> {
        Box::new(self.codec.clone())
    }
}

#[derive(Default)]
struct RenderLog {
    pictures: Vec<Picture>,
    discards: usize,
    no_rotation: bool,
}

/// 记录所有输出图像的渲染器
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    log: Arc<Mutex<RenderLog>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pictures(&self) -> Vec<Picture> {
        self.log.lock().pictures.clone()
    }

    pub fn discards(&self) -> usize {
        self.log.lock().discards
    }

    pub fn set_supports_rotation(&self, supported: bool) {
        self.log.lock().no_rotation = !supported;
    }
}

impl RenderSink for RecordingRenderer {
    fn output_picture(&mut self, picture: &Picture) -> OutputResult {
        self.log.lock().pictures.push(picture.clone());
        OutputResult::default()
    }

    fn discard_buffer(&mut self) {
        self.log.lock().discards += 1;
    }

    fn supports_rotation(&self) -> bool {
        !self.log.lock().no_rotation
    }
}

#[derive(Clone, Default)]
pub struct RecordingPostProcessor {
    chains: Arc<Mutex<Vec<String>>>,
}

impl RecordingPostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chains(&self) -> Vec<String> {
        self.chains.lock().clone()
    }
}

impl PostProcessor for RecordingPostProcessor {
    fn process(&mut self, _picture: &mut Picture, chain: &str) -> bool {
        self.chains.lock().push(chain.to_string());
        true
    }
}

/// 手动推进的时钟
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<i64>,
    absolute: Mutex<i64>,
    adjusts: Mutex<Vec<f64>>,
    discontinuities: Mutex<Vec<(i64, i64)>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, time: i64) {
        *self.now.lock() = time;
    }

    pub fn set_absolute(&self, time: i64) {
        *self.absolute.lock() = time;
    }

    pub fn speed_adjusts(&self) -> Vec<f64> {
        self.adjusts.lock().clone()
    }

    pub fn discontinuities(&self) -> Vec<(i64, i64)> {
        self.discontinuities.lock().clone()
    }
}

impl MasterClock for ManualClock {
    fn clock(&self) -> i64 {
        *self.now.lock()
    }

    fn absolute_clock(&self) -> i64 {
        *self.absolute.lock()
    }

    fn discontinuity(&self, pts: i64, absolute: i64) {
        *self.now.lock() = pts;
        self.discontinuities.lock().push((pts, absolute));
    }

    fn set_speed_adjust(&self, ratio: f64) {
        self.adjusts.lock().push(ratio);
    }
}

/// 外部硬件解码器调用记录
#[cfg(feature = "hwaccel")]
#[derive(Clone)]
pub struct HwLog {
    /// 每次 write 的 (长度, pts, dts)
    pub writes: Vec<(usize, Option<i64>, Option<i64>)>,
    pub commands: Vec<HwCommand>,
    pub listener: Option<DisplayCallback>,
    pub opened: bool,
    pub closed: bool,
    pub stereo: Option<bool>,
    pub pauses: u32,
    pub resumes: u32,
    pub resets: u32,
    pub flushes: u32,
    pub next_state: HwDecodeState,
}

#[cfg(feature = "hwaccel")]
#[derive(Clone)]
pub struct MockExternalDecoder {
    log: Arc<Mutex<HwLog>>,
}

#[cfg(feature = "hwaccel")]
impl MockExternalDecoder {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(HwLog {
                writes: Vec::new(),
                commands: Vec::new(),
                listener: None,
                opened: false,
                closed: false,
                stereo: None,
                pauses: 0,
                resumes: 0,
                resets: 0,
                flushes: 0,
                next_state: HwDecodeState::Buffer,
            })),
        }
    }

    pub fn log(&self) -> HwLog {
        self.log.lock().clone()
    }

    pub fn set_next_state(&self, state: HwDecodeState) {
        self.log.lock().next_state = state;
    }

    /// 模拟一次显示回调
    pub fn fire(&self, info: DisplayInfo) {
        let listener = self.log.lock().listener.clone();
        if let Some(listener) = listener {
            listener(info);
        }
    }
}

#[cfg(feature = "hwaccel")]
impl ExternalDecoder for MockExternalDecoder {
    fn init(&mut self, _hints: &StreamHints, stereo: bool) -> crate::core::Result<()> {
        self.log.lock().stereo = Some(stereo);
        Ok(())
    }

    fn open(&mut self) -> crate::core::Result<()> {
        self.log.lock().opened = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8], pts: Option<i64>, dts: Option<i64>) -> HwDecodeState {
        let mut log = self.log.lock();
        log.writes.push((data.len(), pts, dts));
        log.next_state
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }

    fn flush(&mut self) {
        self.log.lock().flushes += 1;
    }

    fn reset(&mut self) {
        self.log.lock().resets += 1;
    }

    fn pause(&mut self) {
        self.log.lock().pauses += 1;
    }

    fn resume(&mut self) {
        self.log.lock().resumes += 1;
    }

    fn send_command(&mut self, command: HwCommand) {
        self.log.lock().commands.push(command);
    }

    fn register_listener(&mut self, callback: DisplayCallback) {
        self.log.lock().listener = Some(callback);
    }
}

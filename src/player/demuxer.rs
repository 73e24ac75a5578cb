use crate::core::{
    DemuxConfig, DemuxPacket, OpenError, Result, StreamType, PLAYSPEED_NORMAL, TIME_BASE,
};
use crate::player::demuxer_source::{
    ByteSource, ContainerBackend, ContainerSource, FrameReadError, GuardedSource, InterruptHandle,
    OpenOptions, ProgramInfo, RawPacket, StreamInfo, TimeBase,
};
use crate::player::stream_registry::{StreamDescriptor, StreamRegistry};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

/// 探测缓冲区大小
const PROBE_BUFFER_SIZE: usize = 32 * 1024;

/// 立体视频主视角 PID
pub const PRIMARY_VIEW_PID: i32 = 0x1011;
/// 立体视频从视角（数据流）PID
pub const DEPENDENT_VIEW_PID: i32 = 0x1012;
/// 从视角包相对主视角包的时间戳偏移（tick）
pub const DEPENDENT_VIEW_PTS_OFFSET: i64 = 5;

/// 内容类型 -> 容器格式
const CONTENT_TYPE_FORMATS: &[(&str, &str)] = &[
    ("video/mp2t", "mpegts"),
    ("video/x-matroska", "matroska"),
    ("video/webm", "matroska"),
    ("video/x-flv", "flv"),
    ("video/mp4", "mov"),
    ("audio/aacp", "aac"),
    ("audio/aac", "aac"),
    ("audio/x-flac", "flac"),
    ("audio/flac", "flac"),
    ("audio/mpeg", "mp3"),
    ("audio/x-wav", "wav"),
    ("audio/wav", "wav"),
];

/// 按内容类型查找格式（忽略参数部分，例如 `; charset=`）
pub fn format_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    CONTENT_TYPE_FORMATS
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, f)| *f)
}

/// 解封装器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    Closed,
    Opening,
    Probing,
    Ready,
    Reading,
    ProgramChanging,
    Flushing,
}

/// 一次 Read 的结果
#[derive(Debug, Clone)]
pub enum DemuxRead {
    /// 数据包（stream_id 已是连续 ID）
    Packet(DemuxPacket),
    /// 暂无数据（不是结束），调用方稍后重试
    Empty,
    /// 流结构变化，调用方需要重新查询流
    StreamChange,
    /// 真正结束或不可恢复错误
    End,
}

/// 打开参数
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    /// 内容类型提示（例如 HTTP 的 Content-Type）
    pub content_type: Option<String>,
    /// 光盘来源（流分析失败时仍然继续）
    pub optical_disc: bool,
    /// 立体视频（主/从视角配对）模式
    pub stereo_ssif: bool,
}

impl OpenRequest {
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn optical_disc(mut self) -> Self {
        self.optical_disc = true;
        self
    }

    pub fn stereo_ssif(mut self) -> Self {
        self.stereo_ssif = true;
        self
    }
}

/// 格式相关的行为开关
#[derive(Debug, Clone, Copy, Default)]
struct FormatFlags {
    matroska: bool,
    avi: bool,
    transport_stream: bool,
    fast_start: bool,
}

impl FormatFlags {
    fn from_name(name: &str) -> Self {
        let transport_stream = name == "mpegts" || name == "mpegtsraw";
        Self {
            matroska: name.contains("matroska"),
            avi: name == "avi",
            transport_stream,
            fast_start: transport_stream || name == "flv" || name == "hls" || name == "rtsp",
        }
    }
}

/// 解封装器：线程安全，Read 与流信息查询可以来自不同线程
pub struct Demuxer {
    inner: Mutex<DemuxInner>,
    interrupt: Arc<InterruptHandle>,
}

struct DemuxInner {
    state: DemuxState,
    source: Option<Box<dyn ContainerSource>>,
    format: String,
    flags: FormatFlags,
    registry: StreamRegistry,
    /// 当前节目（None 表示不按节目过滤）
    program: Option<usize>,
    /// 当前节目包含的流（None 表示全部流）
    program_streams: Option<Vec<usize>>,
    /// 节目切换时暂存的包，下一次 Read 返回
    saved: Option<RawPacket>,
    ssif: bool,
    dependent_queue: VecDeque<DemuxPacket>,
    pending_dependent: Option<DemuxPacket>,
    speed: i32,
    current_pts: Option<i64>,
    /// 容器起始时间（全局 tick）
    start_time: Option<i64>,
    /// 总时长（全局 tick）
    duration: Option<i64>,
    /// 每路流观察到的最大时长（流时间基）
    stream_durations: Vec<Option<i64>>,
    check_video: bool,
    video_ready: bool,
    changed_streams: Vec<i32>,
    read_timeout: Duration,
    packet_count: u64,
}

impl Demuxer {
    /// 打开数据源
    ///
    /// 打开阶段的所有 I/O 都受看门狗保护，超时返回 `OpenError::Interrupted`。
    pub fn open(
        backend: &dyn ContainerBackend,
        source: Box<dyn ByteSource>,
        request: &OpenRequest,
        config: &DemuxConfig,
    ) -> Result<Self> {
        Self::open_with_interrupt(backend, source, request, config, Arc::new(InterruptHandle::new()))
    }

    /// 使用外部提供的中断句柄打开（调用方可以在打开过程中 abort）
    pub fn open_with_interrupt(
        backend: &dyn ContainerBackend,
        source: Box<dyn ByteSource>,
        request: &OpenRequest,
        config: &DemuxConfig,
        interrupt: Arc<InterruptHandle>,
    ) -> Result<Self> {
        interrupt.set_timeout(config.open_timeout());
        let result = Self::open_container(backend, source, request, config, &interrupt);
        interrupt.clear_timeout();

        let (container, format) = result?;
        let flags = FormatFlags::from_name(&format);

        let mut inner = DemuxInner {
            state: DemuxState::Ready,
            start_time: container.start_time(),
            duration: container.duration(),
            stream_durations: vec![None; container.stream_count()],
            source: Some(container),
            format,
            flags,
            registry: StreamRegistry::new(),
            program: None,
            program_streams: None,
            saved: None,
            ssif: request.stereo_ssif,
            dependent_queue: VecDeque::new(),
            pending_dependent: None,
            speed: PLAYSPEED_NORMAL,
            current_pts: None,
            check_video: config.check_video_ready && flags.transport_stream,
            video_ready: false,
            changed_streams: Vec::new(),
            read_timeout: config.read_timeout(),
            packet_count: 0,
        };
        inner.select_program(config.preferred_program);
        inner.create_streams();

        info!(
            "✅ 解封装器已打开: format={} streams={} program={:?} duration={:?}",
            inner.format,
            inner.registry.len(),
            inner.program,
            inner.duration
        );

        Ok(Self {
            inner: Mutex::new(inner),
            interrupt,
        })
    }

    fn open_container(
        backend: &dyn ContainerBackend,
        source: Box<dyn ByteSource>,
        request: &OpenRequest,
        config: &DemuxConfig,
        interrupt: &Arc<InterruptHandle>,
    ) -> std::result::Result<(Box<dyn ContainerSource>, String), OpenError> {
        let mut guarded = GuardedSource::new(source, interrupt.clone());

        // 1. 选择格式：内容类型提示优先，否则探测
        let hinted = request.content_type.as_deref().and_then(|ct| {
            format_for_content_type(ct)
                .map(str::to_string)
                .or_else(|| backend.format_for_content_type(ct))
        });

        let mut probe_buffer = None;
        let mut format = match hinted {
            Some(format) => {
                info!("按内容类型选择格式: {}", format);
                format
            }
            None => {
                debug!("探测容器格式...");
                let buffer = read_probe_buffer(&mut guarded)?;
                let found = backend.probe(&buffer).ok_or(OpenError::NoMatchingFormat)?;
                info!("探测到格式: {} (score={})", found.format, found.score);
                probe_buffer = Some(buffer);
                found.format
            }
        };

        // wav 里包着的压缩音频
        if format == "wav" {
            let buffer = match probe_buffer {
                Some(buffer) => buffer,
                None => read_probe_buffer(&mut guarded)?,
            };
            if backend.probe_format("spdif", &buffer) > 0 {
                info!("wav 中检测到 spdif 数据，改用 spdif 解析");
                format = "spdif".to_string();
            }
        }

        // 2. 格式相关调优
        let flags = FormatFlags::from_name(&format);
        let options = OpenOptions {
            analyze_duration: if flags.fast_start {
                Duration::from_millis(config.fast_start_analyze_ms)
            } else {
                Duration::from_millis(config.analyze_duration_ms)
            },
            detect_frame_rate: !flags.fast_start,
            interrupt: interrupt.clone(),
        };

        // 3. 打开
        let mut container = backend.open(&format, Box::new(guarded), &options)?;

        // 4. 流结构分析
        if let Err(e) = container.find_stream_info() {
            if interrupt.is_interrupted() {
                return Err(OpenError::Interrupted);
            }
            let single_known = container.stream_count() == 1
                && container.stream_info(0).map(|s| s.codec.is_known()).unwrap_or(false);
            if single_known || request.optical_disc {
                warn!("⚠️ 流结构分析失败，继续尝试播放: {}", e);
            } else {
                error!("❌ 流结构分析失败: {}", e);
                return Err(e);
            }
        }

        Ok((container, format))
    }

    /// 读取一个单元（数据包/空占位/流变化/结束）
    pub fn read(&self) -> DemuxRead {
        let mut inner = self.inner.lock();
        inner.read(&self.interrupt)
    }

    /// 丢弃读取中的残留数据
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    /// 释放容器和全部流描述符
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.source = None;
        inner.registry.clear();
        inner.saved = None;
        inner.dependent_queue.clear();
        inner.pending_dependent = None;
        inner.state = DemuxState::Closed;
        info!("解封装器已关闭");
    }

    /// 中止正在进行的 I/O
    pub fn abort(&self) {
        self.interrupt.abort();
    }

    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.interrupt.clone()
    }

    pub fn state(&self) -> DemuxState {
        self.inner.lock().state
    }

    pub fn format_name(&self) -> String {
        self.inner.lock().format.clone()
    }

    /// 设置播放速度（快进时丢弃非关键帧）
    pub fn set_speed(&self, speed: i32) {
        let mut inner = self.inner.lock();
        if inner.speed != speed {
            debug!("解封装速度: {} -> {}", inner.speed, speed);
            inner.speed = speed;
        }
    }

    /// 定位到指定时间（毫秒）
    pub fn seek_time(&self, time_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        let target = crate::core::msec_to_time(time_ms) + inner.start_time.unwrap_or(0);
        inner.flush();
        let Some(source) = inner.source.as_mut() else {
            return false;
        };
        match source.seek(target) {
            Ok(()) => {
                info!("⏩ Seek 到 {} ms", time_ms);
                true
            }
            Err(e) => {
                warn!("Seek 失败: {}", e);
                false
            }
        }
    }

    /// 总时长（毫秒）
    pub fn stream_length_ms(&self) -> i64 {
        self.inner
            .lock()
            .duration
            .map(crate::core::time_to_msec)
            .unwrap_or(0)
    }

    /// 最近读出的解码时间（毫秒）
    pub fn current_time(&self) -> i64 {
        self.inner
            .lock()
            .current_pts
            .map(crate::core::time_to_msec)
            .unwrap_or(0)
    }

    /// 按连续 ID 查询流
    pub fn stream(&self, id: i32) -> Option<Arc<StreamDescriptor>> {
        self.inner.lock().registry.by_id(id)
    }

    /// 当前全部流
    pub fn streams(&self) -> Vec<Arc<StreamDescriptor>> {
        self.inner.lock().registry.descriptors()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// 编码名（可以与 Read 并发调用）
    pub fn codec_name(&self, id: i32) -> Option<String> {
        self.stream(id).map(|s| s.codec.name())
    }

    /// 取出自上次调用以来参数发生变化的流 ID
    pub fn take_changed_streams(&self) -> Vec<i32> {
        std::mem::take(&mut self.inner.lock().changed_streams)
    }
}

impl DemuxInner {
    fn read(&mut self, interrupt: &InterruptHandle) -> DemuxRead {
        if self.source.is_none() {
            return DemuxRead::End;
        }

        // 1. 待发送的从视角包
        if let Some(packet) = self.pending_dependent.take() {
            return DemuxRead::Packet(packet);
        }

        // 2. 取原始包（节目切换时暂存的包优先）
        let raw = match self.saved.take() {
            Some(raw) => raw,
            None => {
                let Some(source) = self.source.as_mut() else {
                    return DemuxRead::End;
                };
                source.clear_eof();
                interrupt.set_timeout(self.read_timeout);
                let result = source.read_frame();
                interrupt.clear_timeout();

                match result {
                    Ok(raw) => raw,
                    Err(e) if e.is_transient() => return DemuxRead::Empty,
                    Err(FrameReadError::Eof) => {
                        debug!("读取到流末尾");
                        self.flush();
                        return DemuxRead::End;
                    }
                    Err(e) => {
                        // 3. 硬错误：清空状态，交给调用方决定是否停止
                        error!("读取数据包失败: {}", e);
                        self.flush();
                        return DemuxRead::Empty;
                    }
                }
            }
        };
        self.state = DemuxState::Reading;

        // 4. 节目变化
        if !self.ssif && self.is_program_change() {
            info!("🔄 检测到节目变化，重建流");
            self.state = DemuxState::ProgramChanging;
            self.create_streams();
            self.saved = Some(raw);
            self.state = DemuxState::Reading;
            return DemuxRead::StreamChange;
        }

        let Some(source) = self.source.as_ref() else {
            return DemuxRead::End;
        };

        // 5. 边界检查
        if raw.size < 0 || raw.stream_index < 0 || raw.stream_index as usize >= source.stream_count() {
            if !source.eof_reached() {
                error!(
                    "无效数据包: stream_index={} size={} streams={}",
                    raw.stream_index,
                    raw.size,
                    source.stream_count()
                );
                self.flush();
                return DemuxRead::Empty;
            }
            error!("无效数据包且已到达流末尾");
            return DemuxRead::End;
        }

        let index = raw.stream_index as usize;
        let Some(info) = source.stream_info(index) else {
            error!("流信息不可用: index={}", index);
            return DemuxRead::End;
        };

        // 9. 快进时丢弃非关键帧
        let trick_drop =
            info.stream_type == StreamType::Video && self.speed > PLAYSPEED_NORMAL && !raw.keyframe;
        if trick_drop || !self.is_video_ready() {
            return DemuxRead::Empty;
        }

        // 10. 节目过滤
        if !self.ssif && !self.in_active_program(index) {
            return DemuxRead::Empty;
        }

        let mut packet = self.convert_packet(&raw, &info);

        // 13. 打上连续 ID
        let resolved = match self.registry.resolve_or_create(index, Some(&info)) {
            Some(resolved) => resolved,
            None => {
                error!("无法解析流描述符: index={}", index);
                return DemuxRead::End;
            }
        };
        if resolved.replaced {
            self.changed_streams.push(resolved.descriptor.id);
        }
        let descriptor = resolved.descriptor;
        packet.stream_id = descriptor.id;

        self.packet_count += 1;
        if self.packet_count <= 5 || self.packet_count % 100 == 0 {
            debug!(
                "📦 包 #{}: stream={} size={} pts={:?} dts={:?}",
                self.packet_count,
                packet.stream_id,
                packet.size(),
                packet.pts,
                packet.dts
            );
        }

        // 11/12. 立体视频主/从视角配对
        if self.ssif {
            match descriptor.stream_type() {
                StreamType::Data if descriptor.physical_id == DEPENDENT_VIEW_PID => {
                    self.dependent_queue.push_back(packet);
                    return DemuxRead::Empty;
                }
                StreamType::Video if descriptor.physical_id == PRIMARY_VIEW_PID => {
                    self.pair_dependent(&packet);
                }
                _ => {}
            }
        }

        DemuxRead::Packet(packet)
    }

    /// 时间戳归一化 + 换算
    fn convert_packet(&mut self, raw: &RawPacket, info: &StreamInfo) -> DemuxPacket {
        let is_video = info.stream_type == StreamType::Video;

        // 6. 0 视为无时间戳
        let mut pts = raw.pts.filter(|&t| t != 0);
        let mut dts = raw.dts.filter(|&t| t != 0);
        let mut duration = raw.duration;
        let container_dts = dts;

        if self.flags.matroska && is_video {
            if info.codec_tag == 0 {
                dts = None;
            } else {
                pts = None;
            }
        }
        if self.flags.matroska
            && info.codec == crate::core::CodecId::Text
            && raw.convergence_duration != 0
        {
            duration = raw.convergence_duration;
        }
        if self.flags.avi && is_video {
            pts = None;
        }

        // 8. 直播流时长只增不减
        if let Some(raw_dts) = container_dts {
            if is_video || info.stream_type == StreamType::Audio {
                self.extend_duration(info, raw_dts);
            }
        }

        // 7. 换算到全局时间基
        let size = (raw.size as usize).min(raw.data.len());
        let mut packet = DemuxPacket::new(raw.stream_index, raw.data[..size].to_vec());
        packet.pts = self.convert_timestamp(pts, info.time_base);
        packet.dts = self.convert_timestamp(dts, info.time_base);
        packet.duration = info.time_base.to_time(duration);

        if let Some(d) = packet.dts {
            if self.current_pts.map_or(true, |cur| d > cur) {
                self.current_pts = Some(d);
            }
        }
        packet
    }

    fn convert_timestamp(&self, ts: Option<i64>, time_base: TimeBase) -> Option<i64> {
        let mut time = time_base.to_time(ts?);
        if !self.flags.avi {
            if let Some(start) = self.start_time {
                if time > start {
                    time -= start;
                } else if time + TIME_BASE / 10 > start {
                    time = 0;
                }
            }
        }
        Some(time)
    }

    fn extend_duration(&mut self, info: &StreamInfo, raw_dts: i64) {
        let observed = raw_dts - info.start_time.unwrap_or(0);
        if info.index >= self.stream_durations.len() {
            self.stream_durations.resize(info.index + 1, None);
        }
        let known = self.stream_durations[info.index].or(info.duration);
        if known.map_or(true, |k| observed > k) {
            self.stream_durations[info.index] = Some(observed);
            let global = info.time_base.to_time(observed);
            if self.duration.map_or(true, |d| global > d) {
                self.duration = Some(global);
            }
        }
    }

    /// 主视角包发出时，取配对的从视角包
    fn pair_dependent(&mut self, primary: &DemuxPacket) {
        let target = primary.timestamp();
        while let Some(front) = self.dependent_queue.front() {
            if front.timestamp() < target {
                self.dependent_queue.pop_front();
            } else {
                break;
            }
        }

        match self.dependent_queue.front() {
            Some(front) if front.timestamp() == target => {
                if let Some(mut dependent) = self.dependent_queue.pop_front() {
                    dependent.stream_id = primary.stream_id;
                    dependent.pts = primary.pts.or(primary.dts).map(|t| t + DEPENDENT_VIEW_PTS_OFFSET);
                    dependent.dts = primary.dts;
                    self.pending_dependent = Some(dependent);
                }
            }
            Some(front) => {
                warn!(
                    "从视角时间戳不匹配，丢弃本帧从视角: primary={:?} dependent={:?}",
                    target,
                    front.timestamp()
                );
            }
            None => {
                warn!("从视角队列为空，丢弃本帧从视角: primary={:?}", target);
            }
        }
    }

    fn flush(&mut self) {
        self.state = DemuxState::Flushing;
        if let Some(source) = self.source.as_mut() {
            source.flush();
        }
        self.saved = None;
        self.current_pts = None;
        self.pending_dependent = None;
        self.dependent_queue.clear();
        self.state = DemuxState::Reading;
    }

    fn programs(&self) -> Vec<ProgramInfo> {
        self.source.as_ref().map(|s| s.programs()).unwrap_or_default()
    }

    fn select_program(&mut self, preferred: Option<u32>) {
        let programs = self.programs();
        self.program = if !programs.is_empty() {
            let chosen = preferred
                .and_then(|number| programs.iter().position(|p| p.program_number == number))
                .or_else(|| programs.iter().position(|p| !p.stream_indexes.is_empty()))
                .unwrap_or(0);
            Some(chosen)
        } else if self.flags.transport_stream {
            // 节目表还没到：延迟到节目表出现后再按节目建流
            debug!("节目表尚未出现，先按全部流创建");
            Some(0)
        } else {
            None
        };
    }

    /// 按当前节目（或全部流）重建注册表
    fn create_streams(&mut self) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        let programs = source.programs();
        if let Some(p) = self.program {
            if p >= programs.len() && !programs.is_empty() {
                self.program = Some(0);
            }
        }

        self.program_streams = self
            .program
            .and_then(|p| programs.get(p))
            .map(|program| program.stream_indexes.clone());
        let infos: Vec<StreamInfo> = match &self.program_streams {
            Some(indexes) => indexes.iter().filter_map(|&i| source.stream_info(i)).collect(),
            None => (0..source.stream_count()).filter_map(|i| source.stream_info(i)).collect(),
        };
        if self.stream_durations.len() < source.stream_count() {
            self.stream_durations.resize(source.stream_count(), None);
        }
        self.registry.rebuild(infos);
    }

    fn is_program_change(&self) -> bool {
        let Some(p) = self.program else {
            return false;
        };
        let Some(source) = self.source.as_ref() else {
            return false;
        };
        let programs = source.programs();
        if p == 0 && programs.is_empty() {
            return false;
        }
        let Some(program) = programs.get(p) else {
            return true;
        };
        if program.stream_indexes.len() != self.registry.len() {
            return true;
        }
        program.stream_indexes.iter().any(|&index| {
            match (self.registry.get(index), source.stream_info(index)) {
                (Some(descriptor), Some(info)) => descriptor.stream_type() != info.stream_type,
                _ => true,
            }
        })
    }

    fn in_active_program(&self, index: usize) -> bool {
        self.program_streams
            .as_ref()
            .map_or(true, |indexes| indexes.contains(&index))
    }

    /// 传输流在视频参数到达前不输出数据
    fn is_video_ready(&mut self) -> bool {
        if !self.check_video || self.video_ready {
            return true;
        }
        let Some(source) = self.source.as_ref() else {
            return true;
        };

        let indexes: Vec<usize> = match &self.program_streams {
            Some(indexes) => indexes.clone(),
            None => (0..source.stream_count()).collect(),
        };

        let mut has_video = false;
        for index in indexes {
            if let Some(info) = source.stream_info(index) {
                if info.stream_type == StreamType::Video {
                    if !info.extradata.is_empty() {
                        info!("🎬 视频参数已就绪");
                        self.video_ready = true;
                        return true;
                    }
                    has_video = true;
                }
            }
        }
        !has_video
    }
}

/// 读取探测数据，读完后回到开头
fn read_probe_buffer(source: &mut GuardedSource) -> std::result::Result<Vec<u8>, OpenError> {
    let mut buffer = vec![0u8; PROBE_BUFFER_SIZE];
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Err(OpenError::Interrupted),
            Err(e) => return Err(OpenError::Io(e.to_string())),
        }
    }
    buffer.truncate(filled);

    source.seek(SeekFrom::Start(0)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::Interrupted {
            OpenError::Interrupted
        } else {
            OpenError::Io(e.to_string())
        }
    })?;
    Ok(buffer)
}

use crate::core::{
    log_ctx, time_to_msec, time_to_sec, DeinterlaceMode, DemuxPacket, InterlaceMethod, MasterClock, Picture,
    PictureFlags, PlayerConfig, PlayerError, QueueError, Result, VideoConfig, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE,
    TIME_BASE,
};
use crate::player::decoder::{
    CodecFactory, DecodeStatus, StreamHints, VideoCodec, CODEC_CTRL_DRAIN, CODEC_CTRL_NO_POSTPROC,
    FILTER_DEINTERLACE_ANY, FILTER_DEINTERLACE_FLAGGED, FILTER_DEINTERLACE_HALFED, FILTER_ROTATE,
};
use crate::player::message::{CodecChange, DisplayTime, Message, MessageKind, PlayerEvent, SYNC_SOURCE_VIDEO};
use crate::player::message_queue::MessageQueue;
use crate::player::pulldown::PulldownCorrection;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 同步/强制不丢帧后保证显示的帧数
const NOSKIP_PICTURES: u32 = 5;
/// 回放缓冲最多保留的时长
const REPLAY_MAX_SPAN: i64 = 10 * TIME_BASE;
/// 连续丢帧超过这个时长后强制显示一帧
const MAX_DROP_SPAN: i64 = TIME_BASE / 10;
/// 连续落后多少帧算严重落后
const VERY_LATE_FRAMES: u32 = 3;
/// 队列水位低于这个值时让解码器吐出缓存帧
const LOW_BUFFER_LEVEL: u32 = 10;

const DROP_VERY_LATE: u32 = 0x01;
const DROP_BUFFER_LEVEL: u32 = 0x02;

/// 渲染器输出结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputResult {
    /// 图像没有显示
    pub dropped: bool,
    /// 渲染器要求停止输出
    pub abort: bool,
}

/// 渲染器接口
pub trait RenderSink: Send {
    fn output_picture(&mut self, picture: &Picture) -> OutputResult;

    /// 丢弃已排队但未显示的图像
    fn discard_buffer(&mut self);

    fn supports_rotation(&self) -> bool {
        true
    }
}

/// 软件后处理（去隔行 / 画质滤镜）
pub trait PostProcessor: Send {
    /// 按滤镜链处理图像，失败时返回 false（图像保持原样）
    fn process(&mut self, picture: &mut Picture, chain: &str) -> bool;
}

pub type SharedRenderer = Arc<Mutex<Box<dyn RenderSink>>>;
pub type SharedPostProcessor = Arc<Mutex<Box<dyn PostProcessor>>>;

/// 解码线程对外可见的状态
#[derive(Debug, Default)]
struct LoopStatus {
    current_pts: Mutex<Option<i64>>,
    /// 解码器内部缓存的时长（秒）
    decoder_time: Mutex<f64>,
    stalled: AtomicBool,
    started: AtomicBool,
}

/// 解码循环的协作者
#[derive(Clone)]
struct LoopContext {
    queue: Arc<MessageQueue>,
    clock: Arc<dyn MasterClock>,
    renderer: SharedRenderer,
    post: Option<SharedPostProcessor>,
    events: Sender<PlayerEvent>,
    config: VideoConfig,
    status: Arc<LoopStatus>,
}

/// 视频解码循环（在自己的线程里运行）
struct DecodeLoop {
    ctx: LoopContext,
    codec: Box<dyn VideoCodec>,
    hints: StreamHints,
    pulldown: PulldownCorrection,
    /// 已送入解码器、尚未确认输出的包
    replay: VecDeque<DemuxPacket>,
    /// 最近一帧（静帧时重复显示）
    picture: Option<Picture>,
    pts: i64,
    frametime: i64,
    speed: i32,
    forced_aspect: f64,
    no_skip: u32,
    /// 连续被渲染器丢弃的帧数
    dropped: u32,
    dropped_frames: u64,
    late_frames: u32,
    stalled: bool,
    started: bool,
}

impl DecodeLoop {
    fn new(hints: StreamHints, codec: Box<dyn VideoCodec>, ctx: LoopContext) -> Self {
        let mut decode_loop = Self {
            ctx,
            codec,
            hints: hints.clone(),
            pulldown: PulldownCorrection::new(),
            replay: VecDeque::new(),
            picture: None,
            pts: 0,
            frametime: TIME_BASE / 25,
            speed: PLAYSPEED_NORMAL,
            forced_aspect: 0.0,
            no_skip: 0,
            dropped: 0,
            dropped_frames: 0,
            late_frames: 0,
            stalled: false,
            started: false,
        };
        decode_loop.apply_hints(hints);
        decode_loop
    }

    fn apply_hints(&mut self, hints: StreamHints) {
        let fps = hints.fps().unwrap_or(self.ctx.config.fallback_fps).max(1.0);
        self.frametime = (TIME_BASE as f64 / fps) as i64;
        match &self.ctx.config.pulldown_pattern {
            Some(pattern) => self.pulldown.init(fps, pattern),
            None => self.pulldown.init(fps, &[]),
        }
        self.hints = hints;
    }

    fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
        self.ctx.status.stalled.store(stalled, Ordering::SeqCst);
    }

    fn set_started(&mut self, started: bool) {
        self.started = started;
        self.ctx.status.started.store(started, Ordering::SeqCst);
    }

    fn notify(&self, event: PlayerEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("上层事件通道已关闭");
        }
    }

    fn run(mut self) {
        info!(
            "{} 🎬 视频解码线程启动: {} {}x{}",
            log_ctx(),
            self.codec.name(),
            self.hints.width,
            self.hints.height
        );

        loop {
            // 静帧时缩短等待，按帧率重复输出最后一帧
            let wait = if self.stalled { self.frametime / 4 } else { self.frametime * 10 };
            let timeout = Duration::from_secs_f64(time_to_sec(wait.max(1)));
            let priority = if self.speed == PLAYSPEED_PAUSE && self.started { 1 } else { 0 };

            match self.ctx.queue.get(timeout, priority) {
                Ok((message, priority)) => self.handle(message, priority),
                Err(QueueError::Timeout) => {
                    if priority > 0 {
                        continue;
                    }
                    self.on_timeout();
                }
                Err(QueueError::Abort) | Err(QueueError::NotInitialized) => break,
                Err(e) => {
                    error!("{} ❌ 读取视频消息失败: {}", log_ctx(), e);
                    break;
                }
            }
        }

        self.codec.dispose();
        info!(
            "{} 🎬 视频解码线程结束，共丢弃 {} 帧",
            log_ctx(),
            self.dropped_frames
        );
    }

    /// 等待超时：可能是静帧
    fn on_timeout(&mut self) {
        if !self.stalled {
            if self.started {
                info!("{} 检测到静帧，按 {:.3} fps 输出", log_ctx(), TIME_BASE as f64 / self.frametime as f64);
            }
            self.set_stalled(true);
            self.pts += self.frametime * 4;
        }

        let Some(mut picture) = self.picture.clone() else {
            return;
        };
        if !picture.is_allocated() {
            return;
        }
        picture.flags.remove(PictureFlags::INTERLACED);
        picture.flags.insert(PictureFlags::NOSKIP);
        picture.pts = Some(self.pts);
        self.output(&picture);
        self.pts += self.frametime;
    }

    fn handle(&mut self, message: Message, priority: i32) {
        match message {
            Message::DemuxerPacket { packet, drop } => self.process_packet(packet, drop, priority),
            Message::Synchronize(sync) => {
                if sync.wait(Duration::from_millis(100), SYNC_SOURCE_VIDEO) {
                    debug!("视频同步完成");
                    self.no_skip = NOSKIP_PICTURES;
                } else if let Err(e) = self.ctx.queue.put(Message::Synchronize(sync), 1) {
                    debug!("同步消息重新入队失败: {}", e);
                }
            }
            Message::Resync { timestamp, clock } => {
                if let Some(ts) = timestamp {
                    self.pts = ts;
                }
                let flip_pts = self.pts - self.frametime;
                if clock {
                    let absolute = self.ctx.clock.absolute_clock();
                    self.ctx.clock.discontinuity(flip_pts, absolute);
                }
                debug!("重新同步: pts={} clock={}", self.pts, clock);
            }
            Message::Delay(delay) => self.delay(delay),
            Message::SetAspect(aspect) => {
                debug!("强制宽高比: {:.3}", aspect);
                self.forced_aspect = aspect;
            }
            Message::Reset => {
                self.codec.reset();
                self.picture = None;
                self.replay.clear();
                self.set_started(false);
            }
            Message::Flush => {
                debug!("{} 🧹 清空视频解码器", log_ctx());
                self.codec.reset();
                self.picture = None;
                self.replay.clear();
                self.pulldown.reset();
                self.dropped = 0;
                self.late_frames = 0;
                self.set_stalled(true);
                self.set_started(false);
                self.ctx.renderer.lock().discard_buffer();
            }
            Message::NoSkip => self.no_skip = NOSKIP_PICTURES,
            Message::SetSpeed(speed) => {
                self.speed = speed;
                if speed == PLAYSPEED_PAUSE {
                    self.no_skip = 0;
                }
                self.codec.set_speed(speed);
                self.dropped = 0;
                self.late_frames = 0;
            }
            Message::Started => {
                if self.started {
                    self.notify(PlayerEvent::Started);
                }
            }
            Message::DisplayTime(reply) => {
                let current = *self.ctx.status.current_pts.lock();
                let time = time_to_msec(current.unwrap_or_else(|| self.ctx.clock.clock()));
                let answer = DisplayTime {
                    time,
                    disp_time: time,
                    timestamp: self.ctx.clock.absolute_clock(),
                };
                let _ = reply.send(answer);
            }
            Message::StreamChange(change) => self.change_codec(*change),
        }
    }

    fn change_codec(&mut self, change: CodecChange) {
        info!(
            "{} 🔄 切换视频解码器: {} -> {}",
            log_ctx(),
            self.codec.name(),
            change.codec.name()
        );
        self.codec.dispose();
        self.codec = change.codec;
        self.apply_hints(change.hints);
        self.picture = None;
        self.replay.clear();
    }

    fn delay(&mut self, delay: Duration) {
        if self.speed == PLAYSPEED_PAUSE {
            return;
        }
        let scaled = delay.mul_f64(PLAYSPEED_NORMAL as f64 / self.speed.unsigned_abs() as f64);
        let deadline = Instant::now() + scaled;
        while Instant::now() < deadline && !self.ctx.queue.received_abort_request() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn calc_drop_requirement(&mut self) -> u32 {
        let mut result = 0;

        let lateness = self.ctx.clock.clock() - self.pts;
        if lateness > 2 * self.frametime {
            self.late_frames += 1;
        } else {
            self.late_frames = 0;
        }
        if self.late_frames >= VERY_LATE_FRAMES {
            result |= DROP_VERY_LATE;
        }
        if self.buffer_level() < LOW_BUFFER_LEVEL {
            result |= DROP_BUFFER_LEVEL;
        }
        result
    }

    /// 队列水位加上解码器内部缓存折算的水位
    fn buffer_level(&self) -> u32 {
        let decoder_time = self.codec.time_size();
        *self.ctx.status.decoder_time.lock() = decoder_time;
        let max_time = self.ctx.queue.max_time_size().max(1.0);
        let decoder_level = (100.0 * decoder_time / max_time).round() as u32;
        (self.ctx.queue.level() + decoder_level).min(100)
    }

    fn process_packet(&mut self, packet: DemuxPacket, packet_drop: bool, priority: i32) {
        if self.stalled {
            if self.started {
                info!("{} 退出静帧", log_ctx());
            }
            self.set_stalled(false);
            self.no_skip = NOSKIP_PICTURES;
        } else if self.dropped as i64 * self.frametime > MAX_DROP_SPAN && self.no_skip == 0 {
            // 丢得太多，强制显示一帧
            self.no_skip = 1;
        }

        // ========== 丢帧判断 ==========
        let directive = self.calc_drop_requirement();
        let mut request_drop = directive & DROP_VERY_LATE != 0 && self.ctx.config.allow_drop;
        if request_drop {
            self.pulldown.reset();
        }

        let mut control = 0;
        if directive & DROP_BUFFER_LEVEL != 0 {
            control |= CODEC_CTRL_DRAIN;
        }
        if self.speed > PLAYSPEED_NORMAL {
            control |= CODEC_CTRL_NO_POSTPROC;
        }
        self.codec.set_codec_control(control);

        if self.ctx.queue.data_size() == 0 || self.speed < 0 {
            request_drop = false;
        }
        if packet_drop {
            request_drop = true;
        }
        self.codec.set_drop_state(request_drop);

        // ========== 滤镜请求 ==========
        let mut filters = 0;
        let mode = self.ctx.config.deinterlace_mode;
        if mode != DeinterlaceMode::Off {
            filters = match self.ctx.config.interlace_method {
                InterlaceMethod::Deinterlace => FILTER_DEINTERLACE_ANY,
                InterlaceMethod::DeinterlaceHalf => FILTER_DEINTERLACE_ANY | FILTER_DEINTERLACE_HALFED,
                _ => 0,
            };
            if mode == DeinterlaceMode::Auto && filters != 0 {
                filters |= FILTER_DEINTERLACE_FLAGGED;
            }
        }
        if !self.ctx.renderer.lock().supports_rotation() {
            filters |= FILTER_ROTATE;
        }
        self.codec.set_filters(filters);

        let status = self.codec.decode(Some(&packet.data), packet.dts, packet.pts);

        if status.contains(DecodeStatus::BYPASS) {
            self.notify(PlayerEvent::BypassPacket(packet));
            return;
        }

        let converge = self.codec.converge_count();
        if converge > 0 {
            self.replay.push_back(packet);
            while self.replay.len() > converge || self.replay.len() as i64 * self.frametime > REPLAY_MAX_SPAN {
                self.replay.pop_front();
            }
        }

        self.drain(status, packet_drop, priority);
    }

    /// 反复取图，直到解码器需要新数据
    fn drain(&mut self, mut status: DecodeStatus, packet_drop: bool, priority: i32) {
        loop {
            if status.contains(DecodeStatus::FLUSHED) {
                warn!("{} 解码器内部清空，回放 {} 个包", log_ctx(), self.replay.len());
                self.requeue_replay(|remaining| remaining || (priority > 0 && packet_drop), priority);
                self.codec.reset();
                self.picture = None;
                self.ctx.renderer.lock().discard_buffer();
                break;
            }

            if status.contains(DecodeStatus::REOPEN) {
                warn!("{} 解码器需要重建，回放 {} 个包", log_ctx(), self.replay.len());
                self.requeue_replay(|_| false, priority);
                if !self.codec.reopen() {
                    error!("{} ❌ 重建解码器失败: {}", log_ctx(), self.codec.name());
                }
                self.picture = None;
                self.ctx.renderer.lock().discard_buffer();
                break;
            }

            if status.contains(DecodeStatus::ERROR) {
                error!("{} ❌ 视频解码出错: {}", log_ctx(), self.codec.name());
                break;
            }

            if status.contains(DecodeStatus::PICTURE) {
                match self.codec.picture() {
                    Some(picture) => {
                        let result = self.present(picture, packet_drop);
                        if result.abort {
                            self.codec.decode(None, None, None);
                            break;
                        }
                        if result.dropped && !packet_drop {
                            self.dropped_frames += 1;
                            self.dropped += 1;
                        } else {
                            self.dropped = 0;
                        }
                    }
                    None => {
                        warn!("{} 解码器报告有图像但取不到，重置解码器", log_ctx());
                        self.codec.reset();
                    }
                }
            }

            if status.contains(DecodeStatus::BUFFER) {
                break;
            }
            status = self.codec.decode(None, None, None);
        }
    }

    /// 把回放缓冲重新放回队列；只有最后一个包可以不丢
    fn requeue_replay(&mut self, drop_rule: impl Fn(bool) -> bool, priority: i32) {
        while let Some(packet) = self.replay.pop_front() {
            let drop = drop_rule(!self.replay.is_empty());
            let message = Message::DemuxerPacket { packet, drop };
            if let Err(e) = self.ctx.queue.put(message, priority + 10) {
                warn!("回放包入队失败: {}", e);
                self.replay.clear();
                break;
            }
        }
    }

    fn present(&mut self, mut picture: Picture, packet_drop: bool) -> OutputResult {
        if picture.duration == 0 {
            picture.duration = self.frametime;
        }
        if packet_drop {
            picture.flags.insert(PictureFlags::DROPPED);
        }
        if self.no_skip > 0 {
            picture.flags.insert(PictureFlags::NOSKIP);
            self.no_skip -= 1;
        }

        if picture.pts.is_none() && picture.dts.is_none() {
            picture.pts = Some(self.pts);
        } else if picture.pts.is_none() {
            picture.pts = picture.dts;
        }

        if self.forced_aspect > 0.0 {
            picture.display_width = (picture.display_height as f64 * self.forced_aspect).round() as u32;
        }

        if self.speed <= PLAYSPEED_NORMAL {
            self.post_process(&mut picture);
        }

        if let Some(pts) = picture.pts {
            let pts = if self.pulldown.enabled() { pts + self.pulldown.pts() } else { pts };
            picture.pts = Some(pts);
            self.pts = pts;
        }
        if self.pulldown.enabled() {
            picture.duration = self.pulldown.dur();
            self.pulldown.next();
        }
        if picture.repeat_picture > 0 {
            picture.duration *= picture.repeat_picture as i64 + 1;
        }

        let result = self.output(&picture);

        if !self.started && !result.dropped {
            info!("{} ✅ 第一帧已输出: pts={:?}", log_ctx(), picture.pts);
            self.set_started(true);
            self.notify(PlayerEvent::Started);
        }

        if self.speed != PLAYSPEED_PAUSE {
            self.pts += picture.duration * self.speed.signum() as i64;
        }
        self.picture = Some(picture);
        result
    }

    fn post_process(&self, picture: &mut Picture) {
        let config = &self.ctx.config;
        let interlaced = picture.flags.contains(PictureFlags::INTERLACED);
        let deinterlace = config.interlace_method == InterlaceMethod::SoftwareBlend
            && ((config.deinterlace_mode == DeinterlaceMode::Auto && interlaced)
                || config.deinterlace_mode == DeinterlaceMode::Force);

        let mut chains = Vec::new();
        if deinterlace {
            chains.push(config.pp_deinterlace_chain.as_str());
        }
        if config.post_process {
            chains.push(config.pp_quality_chain.as_str());
        }
        if chains.is_empty() {
            return;
        }

        let Some(post) = &self.ctx.post else {
            return;
        };
        let chain = chains.join(",");
        if post.lock().process(picture, &chain) {
            if deinterlace {
                picture.flags.remove(PictureFlags::INTERLACED);
            }
        } else {
            warn!("后处理失败: {}", chain);
        }
    }

    fn output(&mut self, picture: &Picture) -> OutputResult {
        *self.ctx.status.current_pts.lock() = picture.pts;

        if picture.flags.contains(PictureFlags::DROPPED) && !picture.flags.contains(PictureFlags::NOSKIP) {
            return OutputResult {
                dropped: true,
                abort: false,
            };
        }
        self.ctx.renderer.lock().output_picture(picture)
    }
}

/// 视频播放器：持有消息队列并驱动解码线程
pub struct VideoPlayer {
    ctx: LoopContext,
    factory: Arc<CodecFactory>,
    hints: Option<StreamHints>,
    thread: Option<JoinHandle<()>>,
}

impl VideoPlayer {
    pub fn new(
        factory: Arc<CodecFactory>,
        clock: Arc<dyn MasterClock>,
        renderer: Box<dyn RenderSink>,
        events: Sender<PlayerEvent>,
        config: &PlayerConfig,
    ) -> Self {
        Self {
            ctx: LoopContext {
                queue: Arc::new(MessageQueue::with_config("video", &config.queue)),
                clock,
                renderer: Arc::new(Mutex::new(renderer)),
                post: None,
                events,
                config: config.video.clone(),
                status: Arc::new(LoopStatus::default()),
            },
            factory,
            hints: None,
            thread: None,
        }
    }

    pub fn with_post_processor(mut self, post: Box<dyn PostProcessor>) -> Self {
        self.ctx.post = Some(Arc::new(Mutex::new(post)));
        self
    }

    /// 视频消息队列（解封装线程往这里送包）
    pub fn queue(&self) -> Arc<MessageQueue> {
        self.ctx.queue.clone()
    }

    /// 打开视频流
    ///
    /// 第一次打开时启动解码线程；之后再打开会发送解码器切换消息。
    pub fn open_stream(&mut self, hints: StreamHints) -> Result<()> {
        if hints.is_attached_picture() {
            warn!("{} 封面图片流不作为视频播放", log_ctx());
            return Err(PlayerError::UnsupportedCodec(format!("{} (attached picture)", hints.codec.name())));
        }

        let codec = self
            .factory
            .create(&hints)
            .ok_or_else(|| PlayerError::UnsupportedCodec(hints.codec.name()))?;
        self.hints = Some(hints.clone());

        if self.ctx.queue.is_inited() && self.thread.is_some() {
            self.ctx
                .queue
                .put(Message::StreamChange(Box::new(CodecChange { hints, codec })), 0)?;
            return Ok(());
        }

        self.ctx.queue.init();
        self.ctx.status.stalled.store(false, Ordering::SeqCst);
        self.ctx.status.started.store(false, Ordering::SeqCst);
        *self.ctx.status.current_pts.lock() = None;

        let decode_loop = DecodeLoop::new(hints, codec, self.ctx.clone());
        let handle = thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || decode_loop.run())?;
        self.thread = Some(handle);
        Ok(())
    }

    /// 发送消息到解码线程
    pub fn send_message(&self, message: Message, priority: i32) -> Result<()> {
        Ok(self.ctx.queue.put(message, priority)?)
    }

    pub fn set_speed(&self, speed: i32) -> Result<()> {
        self.send_message(Message::SetSpeed(speed), 1)
    }

    /// 清空队列并让解码线程清空解码器
    pub fn flush(&self) -> Result<()> {
        self.ctx.queue.flush(Some(MessageKind::DemuxerPacket));
        self.send_message(Message::Flush, 1)
    }

    /// 查询显示时间
    pub fn display_time(&self, timeout: Duration) -> Option<DisplayTime> {
        let (tx, rx) = bounded(1);
        self.send_message(Message::DisplayTime(tx), 1).ok()?;
        rx.recv_timeout(timeout).ok()
    }

    /// 关闭视频流并等待解码线程退出
    pub fn close_stream(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        info!("{} ⏹️  关闭视频流", log_ctx());
        self.ctx.queue.abort();
        if handle.join().is_err() {
            error!("{} ❌ 视频解码线程异常退出", log_ctx());
        }
        self.ctx.queue.end();
        self.hints = None;
        info!("{} ✅ 视频解码线程已结束", log_ctx());
    }

    pub fn current_pts(&self) -> Option<i64> {
        *self.ctx.status.current_pts.lock()
    }

    /// 解码器内部缓存的时长（秒），解码线程每处理一个包更新一次
    pub fn decoder_time_size(&self) -> f64 {
        *self.ctx.status.decoder_time.lock()
    }

    /// 队列加解码器缓存的总时长（秒）
    pub fn buffered_time(&self) -> f64 {
        self.ctx.queue.time_size() + self.decoder_time_size()
    }

    pub fn is_stalled(&self) -> bool {
        self.ctx.status.stalled.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.ctx.status.started.load(Ordering::SeqCst)
    }

    pub fn hints(&self) -> Option<&StreamHints> {
        self.hints.as_ref()
    }
}

impl Drop for VideoPlayer {
    fn drop(&mut self) {
        self.close_stream();
    }
}

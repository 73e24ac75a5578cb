use crate::core::{
    log_ctx, mkbetag, mktag, CodecId, HardwareConfig, MasterClock, Picture, PictureFlags, PixelFormat,
    PlayerError, Result, SyncMode, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE, TIME_BASE,
};
use crate::player::decoder::{CodecProvider, DecodeStatus, StreamHints, VideoCodec};
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// MVC 立体视频的 codec tag
pub const MVC_CODEC_TAG: u32 = mkbetag(b'M', b'V', b'C', b'C');

/// time_size 的上限（秒）
const MAX_TIME_SIZE: f64 = 7.0;

/// 外部解码器 write 的返回状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwDecodeState {
    Error,
    /// 需要更多数据
    Buffer,
    /// 有图像等待显示
    Picture,
    BufferPicture,
    /// 不处理，原样转交
    Bypass,
}

impl HwDecodeState {
    fn to_status(self) -> DecodeStatus {
        DecodeStatus::new(match self {
            HwDecodeState::Error => DecodeStatus::ERROR,
            HwDecodeState::Buffer => DecodeStatus::BUFFER,
            HwDecodeState::Picture => DecodeStatus::PICTURE,
            HwDecodeState::BufferPicture => DecodeStatus::BUFFER | DecodeStatus::PICTURE,
            HwDecodeState::Bypass => DecodeStatus::BYPASS,
        })
    }
}

/// 发给外部解码器的命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwCommand {
    SetSpeed(i32),
    /// 把显示时间同步到给定 tick
    Sync(i64),
    Eos,
    /// 显示区域（x, y, 宽, 高）
    SetRect { x: i32, y: i32, width: i32, height: i32 },
}

/// 显示回调送来的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub kind: u32,
    /// 实际显示时间（tick）
    pub raw: i64,
    /// 逻辑 pts（tick）
    pub pts: i64,
    pub eos: u32,
}

pub type DisplayCallback = Arc<dyn Fn(DisplayInfo) + Send + Sync>;

/// 外部异步硬件解码器
///
/// 解码结果不在 write 里返回，而是通过注册的显示回调推送。
pub trait ExternalDecoder: Send {
    fn init(&mut self, hints: &StreamHints, stereo: bool) -> Result<()>;
    fn open(&mut self) -> Result<()>;
    fn write(&mut self, data: &[u8], pts: Option<i64>, dts: Option<i64>) -> HwDecodeState;
    fn close(&mut self);
    fn flush(&mut self);
    fn reset(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn send_command(&mut self, command: HwCommand);
    fn register_listener(&mut self, callback: DisplayCallback);
}

/// 显示延迟来源（秒）
pub trait DisplayLatency: Send + Sync {
    fn display_latency(&self) -> f64;
}

/// 固定延迟
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLatency(pub f64);

impl DisplayLatency for FixedLatency {
    fn display_latency(&self) -> f64 {
        self.0
    }
}

/// 一次时钟校正
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncCorrection {
    pub ratio: f64,
    /// 偏差（秒）
    pub error: f64,
    /// 发给解码器的同步时间（tick）
    pub sync_pts: i64,
}

/// 比较主时钟与解码器显示时间，超过阈值时给出校正
pub fn compute_correction(
    clock: i64,
    latency: f64,
    audio_delay: f64,
    info: &DisplayInfo,
    threshold: f64,
) -> Option<SyncCorrection> {
    if info.raw <= 0 {
        return None;
    }
    let ratio = if info.pts > 0 {
        info.raw as f64 / info.pts as f64 - 1.0
    } else {
        0.0
    };
    let master = clock as f64 + (latency - audio_delay) * TIME_BASE as f64;
    let error = (master - info.raw as f64) / TIME_BASE as f64;
    if error.abs() > threshold {
        Some(SyncCorrection {
            ratio,
            error,
            sync_pts: (master * (1.0 - ratio)) as i64,
        })
    } else {
        None
    }
}

/// 硬件解码器是否支持这个流
pub fn is_supported(hints: &StreamHints) -> bool {
    const DIVX_TAGS: [u32; 4] = [
        mktag(b'3', b'I', b'V', b'D'),
        mktag(b'D', b'I', b'V', b'X'),
        mktag(b'X', b'V', b'I', b'D'),
        mktag(b'3', b'I', b'V', b'2'),
    ];
    if DIVX_TAGS.contains(&hints.codec_tag) {
        debug!("硬件解码不支持 DivX/XviD");
        return false;
    }

    let tag: String = hints
        .codec_tag
        .to_le_bytes()
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect();
    if tag.contains("div") || tag.contains("vid") || tag.contains("dx50") {
        debug!("硬件解码不支持 DivX/XviD: tag={}", tag);
        return false;
    }

    match hints.codec {
        CodecId::Rv10 | CodecId::Rv20 | CodecId::Rv30 | CodecId::Rv40 => false,
        CodecId::Mpeg1Video | CodecId::Mpeg2Video => true,
        CodecId::Mpeg4 => hints.width < 3840 && hints.height < 2160,
        CodecId::Flv1
        | CodecId::H264
        | CodecId::Vc1
        | CodecId::Wmv3
        | CodecId::Vp8
        | CodecId::Hevc
        | CodecId::Vp6
        | CodecId::Vp6f
        | CodecId::Vp6a => true,
        other => {
            debug!("硬件解码不支持编码: {}", other.name());
            false
        }
    }
}

/// 适配器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwState {
    Closed,
    /// 参数已接受，外部解码器尚未启动
    Opened,
    /// 已开始送数据，还没有收到显示回调
    AwaitingCallback,
    Ready,
}

/// 回调线程、校正线程与解码线程共享的状态
struct HwShared {
    decoder: Mutex<Box<dyn ExternalDecoder>>,
    display: Mutex<DisplayInfo>,
    /// 解码器忙时暂存的命令，write 返回后发出
    deferred: Mutex<Vec<HwCommand>>,
    clock: Arc<dyn MasterClock>,
    latency: Arc<dyn DisplayLatency>,
    audio_delay: f64,
    threshold: f64,
    server_sync: bool,
}

impl HwShared {
    fn on_display(&self, info: DisplayInfo) {
        *self.display.lock() = info;
        if self.server_sync && info.eos != 1 {
            self.update_play_status();
        }
    }

    fn update_play_status(&self) {
        let info = *self.display.lock();
        let correction = compute_correction(
            self.clock.clock(),
            self.latency.display_latency(),
            self.audio_delay,
            &info,
            self.threshold,
        );
        if let Some(c) = correction {
            debug!("时钟偏差 {:.3}s，校正 ratio={:.4}", c.error, c.ratio);
            self.clock.set_speed_adjust(c.ratio);
            self.send(HwCommand::Sync(c.sync_pts));
        }
    }

    fn send(&self, command: HwCommand) {
        match self.decoder.try_lock() {
            Some(mut decoder) => decoder.send_command(command),
            None => self.deferred.lock().push(command),
        }
    }

    fn flush_deferred(&self) {
        let pending: Vec<HwCommand> = std::mem::take(&mut *self.deferred.lock());
        if pending.is_empty() {
            return;
        }
        let mut decoder = self.decoder.lock();
        for command in pending {
            decoder.send_command(command);
        }
    }
}

/// 后台校正线程
struct CorrectionTask {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CorrectionTask {
    fn start(shared: Arc<HwShared>, config: &HardwareConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(config.correction_period());

        let handle = thread::Builder::new()
            .name("hw-sync".to_string())
            .spawn(move || {
                info!("{} 硬件同步校正线程启动", log_ctx());
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => shared.update_play_status(),
                    }
                }
                info!("{} 硬件同步校正线程退出", log_ctx());
            })?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("硬件同步校正线程异常退出");
            }
        }
    }
}

impl Drop for CorrectionTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 异步硬件解码器适配器
///
/// 第一次 decode 时才真正打开外部解码器；图像直接由硬件显示，
/// 这里只返回一个 Bypass 格式的占位图像。
pub struct HardwareVideoCodec {
    state: HwState,
    hints: Option<StreamHints>,
    shared: Arc<HwShared>,
    config: HardwareConfig,
    correction: Option<CorrectionTask>,
    template: Picture,
    decode_pts: Option<i64>,
    submitted_eos: bool,
    render_rect: Option<(i32, i32, i32, i32)>,
}

impl HardwareVideoCodec {
    pub fn new(
        decoder: Box<dyn ExternalDecoder>,
        clock: Arc<dyn MasterClock>,
        latency: Arc<dyn DisplayLatency>,
        config: HardwareConfig,
    ) -> Self {
        let shared = Arc::new(HwShared {
            decoder: Mutex::new(decoder),
            display: Mutex::new(DisplayInfo::default()),
            deferred: Mutex::new(Vec::new()),
            clock,
            latency,
            audio_delay: config.audio_delay,
            threshold: config.sync_threshold,
            server_sync: config.sync_mode == SyncMode::ServerSync,
        });
        Self {
            state: HwState::Closed,
            hints: None,
            shared,
            config,
            correction: None,
            template: Picture::new(0, 0, PixelFormat::Bypass),
            decode_pts: None,
            submitted_eos: false,
            render_rect: None,
        }
    }

    /// 当前状态（收到有效显示回调后进入 Ready）
    pub fn state(&self) -> HwState {
        if self.state == HwState::AwaitingCallback && self.shared.display.lock().raw > 0 {
            return HwState::Ready;
        }
        self.state
    }

    fn started(&self) -> bool {
        matches!(self.state, HwState::AwaitingCallback | HwState::Ready)
    }

    pub fn display_info(&self) -> DisplayInfo {
        *self.shared.display.lock()
    }

    /// 启动外部解码器（第一次 decode 时调用）
    fn start(&mut self) -> Result<()> {
        let hints = self
            .hints
            .clone()
            .ok_or_else(|| PlayerError::HardwareError("解码器未打开".to_string()))?;

        let stereo = hints.codec_tag == MVC_CODEC_TAG;
        if stereo {
            info!("检测到 MVC 立体视频");
        }

        {
            let mut decoder = self.shared.decoder.lock();
            decoder.init(&hints, stereo)?;
            decoder.open()?;

            let weak: Weak<HwShared> = Arc::downgrade(&self.shared);
            decoder.register_listener(Arc::new(move |info: DisplayInfo| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_display(info);
                }
            }));
        }

        if self.config.sync_mode == SyncMode::ClientNotify {
            self.correction = Some(CorrectionTask::start(self.shared.clone(), &self.config)?);
        }

        *self.shared.display.lock() = DisplayInfo::default();
        self.state = HwState::AwaitingCallback;
        info!("✅ 硬件解码器已启动: {}", hints.codec.name());
        Ok(())
    }

    /// 显示区域变化时通知解码器
    pub fn update_render_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        if self.render_rect == Some((x, y, width, height)) {
            return;
        }
        self.render_rect = Some((x, y, width, height));
        if self.started() {
            debug!("显示区域变化: {}x{}+{}+{}", width, height, x, y);
            self.shared.send(HwCommand::SetRect { x, y, width, height });
        }
    }

    pub fn submitted_eos(&self) -> bool {
        self.started() && self.submitted_eos
    }
}

impl VideoCodec for HardwareVideoCodec {
    fn open(&mut self, hints: &StreamHints) -> Result<()> {
        if !self.config.enabled {
            return Err(PlayerError::HardwareError("硬件解码已禁用".to_string()));
        }
        if !is_supported(hints) {
            return Err(PlayerError::UnsupportedCodec(hints.codec.name()));
        }

        let mut template = Picture::new(hints.width, hints.height, PixelFormat::Bypass);
        template.flags.insert(PictureFlags::ALLOCATED);
        self.template = template;
        self.hints = Some(hints.clone());
        self.state = HwState::Opened;
        Ok(())
    }

    fn dispose(&mut self) {
        if let Some(mut task) = self.correction.take() {
            task.stop();
        }
        if self.started() {
            debug!("关闭硬件解码器");
            self.shared.decoder.lock().close();
        }
        self.state = HwState::Closed;
    }

    fn decode(&mut self, data: Option<&[u8]>, dts: Option<i64>, pts: Option<i64>) -> DecodeStatus {
        match self.state {
            HwState::Closed => return DecodeStatus::new(DecodeStatus::ERROR),
            HwState::Opened => {
                if let Err(e) = self.start() {
                    error!("❌ 启动硬件解码器失败: {}", e);
                    self.state = HwState::Closed;
                    return DecodeStatus::new(DecodeStatus::ERROR);
                }
            }
            _ => {}
        }

        let Some(data) = data else {
            return DecodeStatus::buffer();
        };

        let pts = match &self.hints {
            Some(hints) if hints.pts_invalid => None,
            _ => pts,
        };
        let state = self.shared.decoder.lock().write(data, pts, dts);
        self.shared.flush_deferred();
        if pts.is_some() {
            self.decode_pts = pts;
        }
        state.to_status()
    }

    fn reset(&mut self) {
        if self.started() {
            debug!("重置硬件解码器");
            self.shared.decoder.lock().reset();
        }
    }

    fn picture(&mut self) -> Option<Picture> {
        let mut picture = self.template.clone();
        if self.started() {
            // 第一帧显示前返回 0
            picture.pts = if self.shared.display.lock().raw > 0 {
                Some(self.shared.clock.clock())
            } else {
                Some(0)
            };
        }
        Some(picture)
    }

    fn set_drop_state(&mut self, _drop: bool) {}

    fn set_speed(&mut self, speed: i32) {
        if !self.started() {
            return;
        }
        debug!("硬件解码速度: {}", speed);
        let mut decoder = self.shared.decoder.lock();
        match speed {
            PLAYSPEED_PAUSE => decoder.pause(),
            PLAYSPEED_NORMAL => decoder.resume(),
            other => decoder.send_command(HwCommand::SetSpeed(other)),
        }
    }

    fn time_size(&self) -> f64 {
        if !self.started() {
            return 0.0;
        }
        let raw = self.shared.display.lock().raw;
        let Some(decode_pts) = self.decode_pts else {
            return 0.0;
        };
        ((decode_pts - raw) as f64 / TIME_BASE as f64).clamp(0.0, MAX_TIME_SIZE)
    }

    fn submit_eos(&mut self) {
        if self.started() {
            debug!("提交 EOS");
            self.shared.send(HwCommand::Eos);
            self.submitted_eos = true;
        }
    }

    fn is_eos(&self) -> bool {
        self.started() && self.submitted_eos && self.shared.display.lock().eos > 0
    }

    fn name(&self) -> &str {
        "hw-video"
    }
}

impl Drop for HardwareVideoCodec {
    fn drop(&mut self) {
        if self.state != HwState::Closed {
            self.dispose();
        }
    }
}

/// 外部解码器构造函数
pub type ExternalDecoderFactory = Arc<dyn Fn() -> Box<dyn ExternalDecoder> + Send + Sync>;

/// 硬件解码器提供者（注册到 CodecFactory 的第一位）
pub struct HardwareCodecProvider {
    make_decoder: ExternalDecoderFactory,
    clock: Arc<dyn MasterClock>,
    latency: Arc<dyn DisplayLatency>,
    config: HardwareConfig,
}

impl HardwareCodecProvider {
    pub fn new(
        make_decoder: ExternalDecoderFactory,
        clock: Arc<dyn MasterClock>,
        latency: Arc<dyn DisplayLatency>,
        config: HardwareConfig,
    ) -> Self {
        Self {
            make_decoder,
            clock,
            latency,
            config,
        }
    }
}

impl CodecProvider for HardwareCodecProvider {
    fn name(&self) -> &str {
        "hardware"
    }

    fn accepts(&self, hints: &StreamHints) -> bool {
        if !self.config.enabled || hints.software {
            return false;
        }
        let supported = is_supported(hints);
        if !supported {
            warn!("硬件解码不支持 {}，回退软件解码", hints.codec.name());
        }
        supported
    }

    fn create(&self) -> Box<dyn VideoCodec> {
        Box::new(HardwareVideoCodec::new(
            (self.make_decoder)(),
            self.clock.clone(),
            self.latency.clone(),
            self.config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::decoder::CodecFactory;
    use crate::player::test_fixtures::{init_test_logging, ManualClock, MockExternalDecoder};
    use std::time::{Duration, Instant};

    fn hints(codec: CodecId) -> StreamHints {
        StreamHints::new(codec, 1920, 1080)
    }

    fn codec_with(config: HardwareConfig) -> (HardwareVideoCodec, MockExternalDecoder, Arc<ManualClock>) {
        init_test_logging();
        let decoder = MockExternalDecoder::new();
        let clock = Arc::new(ManualClock::new());
        let codec = HardwareVideoCodec::new(
            Box::new(decoder.clone()),
            clock.clone(),
            Arc::new(FixedLatency(0.0)),
            config,
        );
        (codec, decoder, clock)
    }

    fn server_sync() -> HardwareConfig {
        HardwareConfig {
            sync_mode: SyncMode::ServerSync,
            ..HardwareConfig::default()
        }
    }

    #[test]
    fn test_support_matrix() {
        assert!(is_supported(&hints(CodecId::H264)));
        assert!(is_supported(&hints(CodecId::Mpeg2Video)));
        assert!(is_supported(&hints(CodecId::Vp6f)));
        assert!(!is_supported(&hints(CodecId::Rv40)));
        assert!(!is_supported(&hints(CodecId::Vp9)));

        let mut divx = hints(CodecId::Mpeg4);
        divx.codec_tag = mktag(b'D', b'I', b'V', b'X');
        assert!(!is_supported(&divx));
        divx.codec_tag = mktag(b'd', b'x', b'5', b'0');
        assert!(!is_supported(&divx));
        divx.codec_tag = mktag(b'F', b'M', b'P', b'4');
        assert!(is_supported(&divx));

        let uhd = StreamHints::new(CodecId::Mpeg4, 3840, 2160);
        assert!(!is_supported(&uhd));
    }

    #[test]
    fn test_correction_math() {
        let info = DisplayInfo {
            kind: 0,
            raw: 9_800_000,
            pts: 9_800_000,
            eos: 0,
        };
        let c = compute_correction(10 * TIME_BASE, 0.0, 0.0, &info, 0.125).unwrap();
        assert_eq!(c.ratio, 0.0);
        assert!((c.error - 0.2).abs() < 1e-9);
        assert_eq!(c.sync_pts, 10 * TIME_BASE);

        // 阈值内不校正
        assert!(compute_correction(9_900_000, 0.0, 0.0, &info, 0.125).is_none());
        // 延迟补偿
        assert!(compute_correction(9_700_000, 0.1, 0.0, &info, 0.125).is_none());
        // 没有显示回调时不校正
        assert!(compute_correction(10 * TIME_BASE, 0.0, 0.0, &DisplayInfo::default(), 0.125).is_none());
    }

    #[test]
    fn test_lazy_open_and_status_mapping() {
        let (mut codec, decoder, _) = codec_with(server_sync());
        codec.open(&hints(CodecId::H264)).unwrap();
        assert_eq!(codec.state(), HwState::Opened);
        assert!(!decoder.log().opened);

        decoder.set_next_state(HwDecodeState::BufferPicture);
        let status = codec.decode(Some(&[1, 2, 3]), Some(10), Some(20));
        assert!(status.contains(DecodeStatus::BUFFER | DecodeStatus::PICTURE));
        assert!(decoder.log().opened);
        assert_eq!(decoder.log().writes, vec![(3, Some(20), Some(10))]);
        assert_eq!(codec.state(), HwState::AwaitingCallback);

        decoder.set_next_state(HwDecodeState::Bypass);
        assert!(codec.decode(Some(&[1]), None, None).contains(DecodeStatus::BYPASS));
        decoder.set_next_state(HwDecodeState::Error);
        assert!(codec.decode(Some(&[1]), None, None).contains(DecodeStatus::ERROR));
    }

    #[test]
    fn test_picture_pts_follows_display_callback() {
        let (mut codec, decoder, clock) = codec_with(server_sync());
        codec.open(&hints(CodecId::H264)).unwrap();
        codec.decode(Some(&[0]), None, Some(TIME_BASE));

        let picture = codec.picture().unwrap();
        assert_eq!(picture.pts, Some(0));
        assert_eq!(picture.format, PixelFormat::Bypass);
        assert!(picture.is_allocated());

        clock.set(5 * TIME_BASE);
        decoder.fire(DisplayInfo {
            kind: 1,
            raw: 5 * TIME_BASE,
            pts: 5 * TIME_BASE,
            eos: 0,
        });
        assert_eq!(codec.state(), HwState::Ready);
        assert_eq!(codec.picture().unwrap().pts, Some(5 * TIME_BASE));
    }

    #[test]
    fn test_server_sync_corrects_on_callback() {
        let (mut codec, decoder, clock) = codec_with(server_sync());
        codec.open(&hints(CodecId::H264)).unwrap();
        codec.decode(Some(&[0]), None, None);

        clock.set(10 * TIME_BASE);
        decoder.fire(DisplayInfo {
            kind: 1,
            raw: 9 * TIME_BASE,
            pts: 9 * TIME_BASE,
            eos: 0,
        });
        assert_eq!(decoder.log().commands, vec![HwCommand::Sync(10 * TIME_BASE)]);
        assert_eq!(clock.speed_adjusts(), vec![0.0]);

        // 偏差在阈值内：不发命令
        decoder.fire(DisplayInfo {
            kind: 1,
            raw: 10 * TIME_BASE,
            pts: 10 * TIME_BASE,
            eos: 0,
        });
        assert_eq!(decoder.log().commands.len(), 1);
    }

    #[test]
    fn test_client_notify_thread_corrects_periodically() {
        let config = HardwareConfig {
            correction_period_ms: 10,
            ..HardwareConfig::default()
        };
        let (mut codec, decoder, clock) = codec_with(config);
        codec.open(&hints(CodecId::Hevc)).unwrap();
        codec.decode(Some(&[0]), None, None);

        clock.set(20 * TIME_BASE);
        decoder.fire(DisplayInfo {
            kind: 1,
            raw: 19 * TIME_BASE,
            pts: 19 * TIME_BASE,
            eos: 0,
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while decoder.log().commands.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(decoder.log().commands.first(), Some(HwCommand::Sync(_))));

        codec.dispose();
        assert!(decoder.log().closed);
    }

    #[test]
    fn test_time_size_is_clamped() {
        let (mut codec, decoder, _) = codec_with(server_sync());
        assert_eq!(codec.time_size(), 0.0);
        codec.open(&hints(CodecId::H264)).unwrap();

        codec.decode(Some(&[0]), None, Some(3 * TIME_BASE));
        decoder.fire(DisplayInfo {
            kind: 1,
            raw: TIME_BASE,
            pts: TIME_BASE,
            eos: 1,
        });
        assert!((codec.time_size() - 2.0).abs() < 1e-9);

        codec.decode(Some(&[0]), None, Some(30 * TIME_BASE));
        assert_eq!(codec.time_size(), 7.0);

        codec.decode(Some(&[0]), None, Some(0));
        assert_eq!(codec.time_size(), 0.0);
    }

    #[test]
    fn test_eos_requires_submission_and_report() {
        let (mut codec, decoder, _) = codec_with(server_sync());
        codec.open(&hints(CodecId::H264)).unwrap();
        codec.submit_eos();
        assert!(!codec.submitted_eos());

        codec.decode(Some(&[0]), None, None);
        assert!(!codec.is_eos());
        codec.submit_eos();
        assert!(codec.submitted_eos());
        assert!(!codec.is_eos());

        decoder.fire(DisplayInfo {
            kind: 1,
            raw: 1,
            pts: 1,
            eos: 1,
        });
        assert!(codec.is_eos());
        assert!(decoder.log().commands.contains(&HwCommand::Eos));
    }

    #[test]
    fn test_speed_mapping() {
        let (mut codec, decoder, _) = codec_with(server_sync());
        codec.open(&hints(CodecId::H264)).unwrap();
        codec.decode(Some(&[0]), None, None);

        codec.set_speed(PLAYSPEED_PAUSE);
        codec.set_speed(PLAYSPEED_NORMAL);
        codec.set_speed(2 * PLAYSPEED_NORMAL);
        let log = decoder.log();
        assert_eq!(log.pauses, 1);
        assert_eq!(log.resumes, 1);
        assert_eq!(log.commands, vec![HwCommand::SetSpeed(2000)]);
    }

    #[test]
    fn test_mvc_stereo_detection() {
        let (mut codec, decoder, _) = codec_with(server_sync());
        let mut mvc = hints(CodecId::H264);
        mvc.codec_tag = MVC_CODEC_TAG;
        codec.open(&mvc).unwrap();
        codec.decode(Some(&[0]), None, None);
        assert_eq!(decoder.log().stereo, Some(true));
    }

    #[test]
    fn test_provider_rejects_unsupported_and_falls_back() {
        let decoder = MockExternalDecoder::new();
        let make: ExternalDecoderFactory = Arc::new(move || Box::new(decoder.clone()) as Box<dyn ExternalDecoder>);
        let provider = HardwareCodecProvider::new(
            make,
            Arc::new(ManualClock::new()),
            Arc::new(FixedLatency(0.0)),
            HardwareConfig::default(),
        );
        assert!(!provider.accepts(&hints(CodecId::Rv30)));

        let mut forced = hints(CodecId::H264);
        forced.software = true;
        assert!(!provider.accepts(&forced));

        let factory = CodecFactory::new().with_provider(Box::new(provider));
        let codec = factory.create(&hints(CodecId::H264)).unwrap();
        assert_eq!(codec.name(), "hw-video");
        assert!(factory.create(&hints(CodecId::Rv30)).is_none());
    }
}

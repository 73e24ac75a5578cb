use crate::core::{log_ctx, DemuxPacket, QueueError, Result, StreamType};
use crate::player::demuxer::{DemuxRead, Demuxer};
use crate::player::message::{Message, PlayerEvent};
use crate::player::message_queue::MessageQueue;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 队列满时每次等待的时长（之后检查停止标志再重试）
const PUT_WAIT: Duration = Duration::from_millis(100);
/// 暂无数据时的休眠
const EMPTY_SLEEP: Duration = Duration::from_millis(5);
/// 读完后等待命令的休眠
const END_SLEEP: Duration = Duration::from_millis(100);

const LOG_FIRST_N: u64 = 5;

/// Demuxer 线程命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerCommand {
    /// 丢弃读取中的残留数据
    Flush,
    /// 定位（毫秒）
    Seek(i64),
    SetSpeed(i32),
    Stop,
}

/// 数据包去向
pub struct PacketRoutes {
    pub video: Option<Arc<MessageQueue>>,
    pub audio: Option<Arc<MessageQueue>>,
    pub events: Sender<PlayerEvent>,
    /// 送往视频队列的流（None 表示自动选择第一路视频）
    pub video_stream: Option<i32>,
    pub audio_stream: Option<i32>,
}

impl PacketRoutes {
    pub fn new(events: Sender<PlayerEvent>) -> Self {
        Self {
            video: None,
            audio: None,
            events,
            video_stream: None,
            audio_stream: None,
        }
    }

    pub fn with_video(mut self, queue: Arc<MessageQueue>) -> Self {
        self.video = Some(queue);
        self
    }

    pub fn with_audio(mut self, queue: Arc<MessageQueue>) -> Self {
        self.audio = Some(queue);
        self
    }

    /// 当前选择的流不存在时，改选第一路对应类型的流
    fn select_defaults(&mut self, demuxer: &Demuxer) {
        let streams = demuxer.streams();
        let first = |kind: StreamType| streams.iter().find(|s| s.stream_type() == kind).map(|s| s.id);

        if self.video_stream.map_or(true, |id| demuxer.stream(id).is_none()) {
            self.video_stream = first(StreamType::Video);
        }
        if self.audio_stream.map_or(true, |id| demuxer.stream(id).is_none()) {
            self.audio_stream = first(StreamType::Audio);
        }
        debug!(
            "选择流: video={:?} audio={:?}",
            self.video_stream, self.audio_stream
        );
    }

    fn queue_for(&self, stream_id: i32) -> Option<&Arc<MessageQueue>> {
        if Some(stream_id) == self.video_stream {
            self.video.as_ref()
        } else if Some(stream_id) == self.audio_stream {
            self.audio.as_ref()
        } else {
            None
        }
    }
}

/// Demuxer 线程管理器
///
/// 在独立线程里驱动 [`Demuxer::read`]，把数据包送进消息队列；
/// 队列满时阻塞等待（背压），同时保持对停止请求的响应。
pub struct DemuxerThread {
    thread_handle: Option<JoinHandle<()>>,
    command_tx: Sender<DemuxerCommand>,
    running: Arc<AtomicBool>,
    demuxer: Arc<Demuxer>,
}

struct DemuxLoop {
    demuxer: Arc<Demuxer>,
    routes: PacketRoutes,
    command_rx: Receiver<DemuxerCommand>,
    running: Arc<AtomicBool>,
    ended: bool,
    packet_count: u64,
    video_count: u64,
    audio_count: u64,
}

impl DemuxerThread {
    /// 启动 Demuxer 线程
    pub fn start(demuxer: Arc<Demuxer>, mut routes: PacketRoutes) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<DemuxerCommand>();
        let running = Arc::new(AtomicBool::new(true));
        routes.select_defaults(&demuxer);

        let demux_loop = DemuxLoop {
            demuxer: demuxer.clone(),
            routes,
            command_rx,
            running: running.clone(),
            ended: false,
            packet_count: 0,
            video_count: 0,
            audio_count: 0,
        };

        let thread_handle = thread::Builder::new()
            .name("demuxer".to_string())
            .spawn(move || demux_loop.run())?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            command_tx,
            running,
            demuxer,
        })
    }

    pub fn demuxer(&self) -> Arc<Demuxer> {
        self.demuxer.clone()
    }

    pub fn send(&self, command: DemuxerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| crate::core::PlayerError::Other(format!("发送 Demuxer 命令失败: {}", e)))
    }

    pub fn flush(&self) -> Result<()> {
        self.send(DemuxerCommand::Flush)
    }

    pub fn seek(&self, time_ms: i64) -> Result<()> {
        self.send(DemuxerCommand::Seek(time_ms))
    }

    pub fn set_speed(&self, speed: i32) -> Result<()> {
        self.send(DemuxerCommand::SetSpeed(speed))
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// 停止线程并等待退出
    ///
    /// 同时中断 Demuxer 的 I/O，避免线程卡在读取上。
    pub fn stop(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        info!("{} 🛑 停止 Demuxer 线程", log_ctx());
        self.running.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(DemuxerCommand::Stop);
        self.demuxer.abort();

        if handle.join().is_err() {
            error!("{} ❌ Demuxer 线程异常退出", log_ctx());
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ DemuxerThread 被 drop，但未调用 stop()，正在停止", log_ctx());
            self.stop();
        }
    }
}

impl DemuxLoop {
    fn run(mut self) {
        info!(
            "{} 🎬 Demuxer 线程启动: format={} streams={}",
            log_ctx(),
            self.demuxer.format_name(),
            self.demuxer.stream_count()
        );

        while self.running.load(Ordering::SeqCst) {
            if !self.handle_commands() {
                break;
            }

            if self.ended {
                thread::sleep(END_SLEEP);
                continue;
            }

            match self.demuxer.read() {
                DemuxRead::Packet(packet) => {
                    self.report_changed_streams();
                    if !self.route(packet) {
                        break;
                    }
                }
                DemuxRead::Empty => thread::sleep(EMPTY_SLEEP),
                DemuxRead::StreamChange => {
                    info!("{} 🔄 流结构变化", log_ctx());
                    self.routes.select_defaults(&self.demuxer);
                    self.notify(PlayerEvent::StreamChanged(Vec::new()));
                }
                DemuxRead::End => {
                    info!("{} 📄 Demuxer 读取结束，等待命令（Seek/Stop）...", log_ctx());
                    self.ended = true;
                    self.notify(PlayerEvent::DemuxEnded);
                }
            }
        }

        info!(
            "{} 🛑 Demuxer 线程退出（共读取 {} 个包：{} 视频，{} 音频）",
            log_ctx(),
            self.packet_count,
            self.video_count,
            self.audio_count
        );
    }

    /// 处理所有待处理命令，返回 false 表示需要退出
    fn handle_commands(&mut self) -> bool {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                DemuxerCommand::Flush => {
                    debug!("{} 🧹 Demuxer 清空", log_ctx());
                    self.demuxer.flush();
                }
                DemuxerCommand::Seek(time_ms) => {
                    info!("{} ⏩ Demuxer 线程收到 Seek 命令: {}ms", log_ctx(), time_ms);
                    if self.demuxer.seek_time(time_ms) {
                        self.ended = false;
                    } else {
                        error!("{} ❌ Seek 失败: {}ms", log_ctx(), time_ms);
                    }
                }
                DemuxerCommand::SetSpeed(speed) => self.demuxer.set_speed(speed),
                DemuxerCommand::Stop => {
                    info!("{} ⏹ Demuxer 线程收到停止命令", log_ctx());
                    return false;
                }
            }
        }
        true
    }

    fn report_changed_streams(&mut self) {
        let changed = self.demuxer.take_changed_streams();
        if !changed.is_empty() {
            info!("{} 🔄 流参数变化: {:?}", log_ctx(), changed);
            self.notify(PlayerEvent::StreamChanged(changed));
        }
    }

    fn notify(&self, event: PlayerEvent) {
        if self.routes.events.send(event).is_err() {
            debug!("上层事件通道已关闭");
        }
    }

    /// 把包送到对应队列，返回 false 表示需要退出
    fn route(&mut self, packet: DemuxPacket) -> bool {
        self.packet_count += 1;
        let stream_id = packet.stream_id;

        let Some(queue) = self.routes.queue_for(stream_id).cloned() else {
            return true;
        };

        if Some(stream_id) == self.routes.video_stream {
            self.video_count += 1;
            if self.video_count <= LOG_FIRST_N || self.video_count % 100 == 0 {
                info!(
                    "{} 📦 Demuxer 读取视频包 #{}（total packets {}）",
                    log_ctx(),
                    self.video_count,
                    self.packet_count
                );
            }
        } else {
            self.audio_count += 1;
            if self.audio_count <= LOG_FIRST_N || self.audio_count % 100 == 0 {
                info!(
                    "{} 🔊 Demuxer 读取音频包 #{}（total packets {}）",
                    log_ctx(),
                    self.audio_count,
                    self.packet_count
                );
            }
        }

        // 队列满时分段等待，期间检查停止请求
        let mut message = Message::packet(packet);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            let retry = message.clone_for_requeue();
            match queue.put_wait(message, 0, PUT_WAIT) {
                Ok(()) => return true,
                Err(QueueError::Timeout) => match retry {
                    Some(retry) => message = retry,
                    None => return true,
                },
                Err(e) => {
                    debug!("{} 队列 {} 不可用，丢弃数据包: {}", log_ctx(), queue.owner(), e);
                    return true;
                }
            }
            if !self.handle_commands() {
                return false;
            }
        }
    }
}

use crate::core::DemuxPacket;
use crate::player::decoder::{StreamHints, VideoCodec};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 同步点的参与方
pub const SYNC_SOURCE_AUDIO: u32 = 0x01;
pub const SYNC_SOURCE_VIDEO: u32 = 0x02;
pub const SYNC_SOURCE_SUBTITLE: u32 = 0x04;
pub const SYNC_SOURCE_OWNER: u32 = 0x08;

/// 多线程同步屏障：所有参与方都到达后才放行
#[derive(Debug)]
pub struct SyncPoint {
    sources: u32,
    reached: Mutex<u32>,
    cond: Condvar,
}

impl SyncPoint {
    pub fn new(sources: u32) -> Self {
        Self {
            sources,
            reached: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// 以 `source` 身份到达并等待其余参与方，超时返回 false
    pub fn wait(&self, timeout: Duration, source: u32) -> bool {
        let deadline = Instant::now() + timeout;
        let mut reached = self.reached.lock();
        *reached |= source & self.sources;
        self.cond.notify_all();

        while *reached != self.sources {
            if self.cond.wait_until(&mut reached, deadline).timed_out() {
                return *reached == self.sources;
            }
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        *self.reached.lock() == self.sources
    }
}

/// 显示时间查询结果（毫秒 / tick）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTime {
    /// 当前播放位置（毫秒）
    pub time: i64,
    /// 显示位置（毫秒）
    pub disp_time: i64,
    /// 应答时刻的绝对时钟（tick）
    pub timestamp: i64,
}

/// 解码器切换（流参数变化时由 open_stream 发出）
pub struct CodecChange {
    pub hints: StreamHints,
    pub codec: Box<dyn VideoCodec>,
}

/// 消息类型（用于按类型清空/计数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DemuxerPacket,
    Synchronize,
    Resync,
    Delay,
    SetAspect,
    Reset,
    Flush,
    NoSkip,
    SetSpeed,
    Started,
    DisplayTime,
    StreamChange,
}

/// 发给视频解码循环的消息
///
/// 消息所有权随队列转移；需要重新入队时使用 [`Message::clone_for_requeue`]。
pub enum Message {
    /// 数据包，`drop` 为 true 时解码但不显示
    DemuxerPacket { packet: DemuxPacket, drop: bool },
    Synchronize(Arc<SyncPoint>),
    /// 重新同步到时间戳，`clock` 为 true 时同时校正主时钟
    Resync { timestamp: Option<i64>, clock: bool },
    /// 暂停输出一段时间（按当前速度缩放）
    Delay(Duration),
    /// 强制宽高比（0 表示取消）
    SetAspect(f64),
    Reset,
    Flush,
    /// 接下来的几帧不允许丢弃
    NoSkip,
    SetSpeed(i32),
    /// 询问是否已开始播放（已开始时再次通知上层）
    Started,
    /// 显示时间查询，应答通过通道返回
    DisplayTime(Sender<DisplayTime>),
    StreamChange(Box<CodecChange>),
}

impl Message {
    pub fn packet(packet: DemuxPacket) -> Self {
        Message::DemuxerPacket { packet, drop: false }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::DemuxerPacket { .. } => MessageKind::DemuxerPacket,
            Message::Synchronize(_) => MessageKind::Synchronize,
            Message::Resync { .. } => MessageKind::Resync,
            Message::Delay(_) => MessageKind::Delay,
            Message::SetAspect(_) => MessageKind::SetAspect,
            Message::Reset => MessageKind::Reset,
            Message::Flush => MessageKind::Flush,
            Message::NoSkip => MessageKind::NoSkip,
            Message::SetSpeed(_) => MessageKind::SetSpeed,
            Message::Started => MessageKind::Started,
            Message::DisplayTime(_) => MessageKind::DisplayTime,
            Message::StreamChange(_) => MessageKind::StreamChange,
        }
    }

    pub fn is_packet(&self) -> bool {
        matches!(self, Message::DemuxerPacket { .. })
    }

    /// 数据包负载字节数（非数据包为 0）
    pub fn data_size(&self) -> usize {
        match self {
            Message::DemuxerPacket { packet, .. } => packet.size(),
            _ => 0,
        }
    }

    /// 复制一份用于重新入队（负载共享）；解码器切换消息不可复制
    pub fn clone_for_requeue(&self) -> Option<Message> {
        Some(match self {
            Message::DemuxerPacket { packet, drop } => Message::DemuxerPacket {
                packet: packet.clone(),
                drop: *drop,
            },
            Message::Synchronize(sync) => Message::Synchronize(sync.clone()),
            Message::Resync { timestamp, clock } => Message::Resync {
                timestamp: *timestamp,
                clock: *clock,
            },
            Message::Delay(d) => Message::Delay(*d),
            Message::SetAspect(a) => Message::SetAspect(*a),
            Message::Reset => Message::Reset,
            Message::Flush => Message::Flush,
            Message::NoSkip => Message::NoSkip,
            Message::SetSpeed(s) => Message::SetSpeed(*s),
            Message::Started => Message::Started,
            Message::DisplayTime(tx) => Message::DisplayTime(tx.clone()),
            Message::StreamChange(_) => return None,
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::DemuxerPacket { packet, drop } => f
                .debug_struct("DemuxerPacket")
                .field("stream_id", &packet.stream_id)
                .field("size", &packet.size())
                .field("pts", &packet.pts)
                .field("dts", &packet.dts)
                .field("drop", drop)
                .finish(),
            Message::StreamChange(change) => f
                .debug_struct("StreamChange")
                .field("codec", &change.codec.name())
                .finish(),
            Message::Resync { timestamp, clock } => f
                .debug_struct("Resync")
                .field("timestamp", timestamp)
                .field("clock", clock)
                .finish(),
            Message::Delay(d) => f.debug_tuple("Delay").field(d).finish(),
            Message::SetAspect(a) => f.debug_tuple("SetAspect").field(a).finish(),
            Message::SetSpeed(s) => f.debug_tuple("SetSpeed").field(s).finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// 视频解码循环 / 解封装线程发给上层的事件
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// 第一帧已显示
    Started,
    /// 显示时间应答（上层主动广播时使用）
    DisplayTime(DisplayTime),
    /// 流结构或参数变化，附带受影响的连续 ID（节目切换时为空）
    StreamChanged(Vec<i32>),
    /// 解码器要求原样转交的数据包
    BypassPacket(DemuxPacket),
    /// 解封装结束
    DemuxEnded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sync_point_releases_when_all_arrive() {
        let sync = Arc::new(SyncPoint::new(SYNC_SOURCE_AUDIO | SYNC_SOURCE_VIDEO));
        let audio = sync.clone();
        let handle = thread::spawn(move || audio.wait(Duration::from_secs(2), SYNC_SOURCE_AUDIO));

        assert!(sync.wait(Duration::from_secs(2), SYNC_SOURCE_VIDEO));
        assert!(handle.join().unwrap());
        assert!(sync.is_complete());
    }

    #[test]
    fn test_sync_point_times_out() {
        let sync = SyncPoint::new(SYNC_SOURCE_AUDIO | SYNC_SOURCE_VIDEO);
        assert!(!sync.wait(Duration::from_millis(20), SYNC_SOURCE_VIDEO));
        assert!(!sync.is_complete());
    }

    #[test]
    fn test_clone_for_requeue_shares_payload() {
        let packet = DemuxPacket::new(1, vec![1, 2, 3]);
        let message = Message::DemuxerPacket { packet, drop: true };
        let copy = message.clone_for_requeue().unwrap();
        match (&message, &copy) {
            (Message::DemuxerPacket { packet: a, .. }, Message::DemuxerPacket { packet: b, drop }) => {
                assert!(Arc::ptr_eq(&a.data, &b.data));
                assert!(*drop);
            }
            _ => panic!("unexpected kind"),
        }
        assert_eq!(copy.data_size(), 3);
    }
}

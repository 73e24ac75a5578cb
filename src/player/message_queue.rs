use crate::core::{QueueConfig, QueueError, TIME_BASE};
use crate::player::message::{Message, MessageKind};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 优先级达到这个值的消息在队列满时也能入队
pub const ADMIT_WHEN_FULL_PRIORITY: i32 = 1;

struct QueueItem {
    message: Message,
    priority: i32,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    initialized: bool,
    abort_requested: bool,
    data_size: usize,
    /// 最新入队数据包的时间戳
    time_front: Option<i64>,
    /// 最近出队数据包的时间戳
    time_back: Option<i64>,
    max_data_size: usize,
    max_time_size: f64,
    emptied: bool,
}

impl QueueInner {
    fn time_size(&self) -> f64 {
        match (self.time_front, self.time_back) {
            (Some(front), Some(back)) if front > back => (front - back) as f64 / TIME_BASE as f64,
            _ => 0.0,
        }
    }

    fn is_data_based(&self) -> bool {
        match (self.time_front, self.time_back) {
            (Some(front), Some(back)) => front <= back,
            _ => true,
        }
    }

    fn level(&self) -> u32 {
        if self.data_size == 0 {
            return 0;
        }
        if self.is_data_based() {
            if self.max_data_size == 0 {
                return 100;
            }
            return (100 * self.data_size / self.max_data_size).min(100) as u32;
        }
        let level = (100.0 * self.time_size() / self.max_time_size.max(1.0)).round();
        level.clamp(0.0, 100.0) as u32
    }

    fn is_full(&self) -> bool {
        self.level() >= 100
    }

    fn check_put(&self) -> Result<(), QueueError> {
        if !self.initialized {
            return Err(QueueError::NotInitialized);
        }
        if self.abort_requested {
            return Err(QueueError::Abort);
        }
        Ok(())
    }

    fn push(&mut self, message: Message, priority: i32) {
        if let Message::DemuxerPacket { packet, .. } = &message {
            self.data_size += packet.size();
            if priority == 0 {
                if let Some(ts) = packet.timestamp() {
                    self.time_front = Some(ts);
                    if self.time_back.is_none() {
                        self.time_back = Some(ts);
                    }
                }
            }
        }

        // 高优先级在前，同优先级先进先出
        let position = self
            .items
            .iter()
            .position(|item| item.priority < priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, QueueItem { message, priority });
        self.emptied = false;
    }

    fn pop_front(&mut self) -> Option<QueueItem> {
        let item = self.items.pop_front()?;
        if let Message::DemuxerPacket { packet, .. } = &item.message {
            self.data_size = self.data_size.saturating_sub(packet.size());
            if item.priority == 0 {
                if let Some(ts) = packet.timestamp() {
                    self.time_back = Some(ts);
                }
            }
        }
        Some(item)
    }

    fn recount(&mut self) {
        self.data_size = self.items.iter().map(|item| item.message.data_size()).sum();
    }

    /// 移除消息后按剩余数据包重算时间跨度，没有数据包时清零
    fn recompute_time_span(&mut self) {
        let span = self
            .items
            .iter()
            .filter_map(|item| match &item.message {
                Message::DemuxerPacket { packet, .. } if item.priority == 0 => packet.timestamp(),
                _ => None,
            })
            .fold(None, |span: Option<(i64, i64)>, ts| match span {
                Some((oldest, _)) => Some((oldest, ts)),
                None => Some((ts, ts)),
            });
        match span {
            Some((oldest, newest)) => {
                self.time_front = Some(newest);
                if self.time_back.is_none() {
                    self.time_back = Some(oldest);
                }
            }
            None => {
                self.time_front = None;
                self.time_back = None;
            }
        }
    }
}

/// 视频消息队列
///
/// 按字节数和缓存时长两种口径限流；一把锁保护列表和统计，
/// 条件变量分别唤醒读者、写者和等待清空的一方。
pub struct MessageQueue {
    owner: String,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    empty: Condvar,
}

impl MessageQueue {
    pub fn new(owner: &str) -> Self {
        Self::with_config(owner, &QueueConfig::default())
    }

    pub fn with_config(owner: &str, config: &QueueConfig) -> Self {
        Self {
            owner: owner.to_string(),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                initialized: false,
                abort_requested: false,
                data_size: 0,
                time_front: None,
                time_back: None,
                max_data_size: config.max_data_size,
                max_time_size: config.max_time_size,
                emptied: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            empty: Condvar::new(),
        }
    }

    /// 初始化（清空内容并允许读写）
    pub fn init(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.data_size = 0;
        inner.time_front = None;
        inner.time_back = None;
        inner.abort_requested = false;
        inner.initialized = true;
        debug!("消息队列 {} 已初始化", self.owner);
    }

    /// 结束：清空并回到未初始化状态
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.data_size = 0;
        inner.time_front = None;
        inner.time_back = None;
        inner.initialized = false;
        inner.abort_requested = false;
        self.empty.notify_all();
        self.not_full.notify_all();
    }

    /// 中止：唤醒所有等待者，之后的读写都返回 Abort
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.abort_requested = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.empty.notify_all();
        debug!("消息队列 {} 已中止", self.owner);
    }

    /// 入队
    ///
    /// 队列满且优先级低于 [`ADMIT_WHEN_FULL_PRIORITY`] 时拒绝，内容不变。
    pub fn put(&self, message: Message, priority: i32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        inner.check_put()?;
        if priority < ADMIT_WHEN_FULL_PRIORITY && inner.is_full() {
            return Err(QueueError::Full);
        }
        inner.push(message, priority);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 阻塞入队：队列满时等待空间，超时返回 Timeout（消息随错误一起丢弃）
    pub fn put_wait(&self, message: Message, priority: i32, timeout: Duration) -> Result<(), QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            inner.check_put()?;
            if priority >= ADMIT_WHEN_FULL_PRIORITY || !inner.is_full() {
                break;
            }
            if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                inner.check_put()?;
                if inner.is_full() {
                    return Err(QueueError::Timeout);
                }
                break;
            }
        }
        inner.push(message, priority);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 出队：返回优先级不低于 `min_priority` 的第一条消息及其优先级
    pub fn get(&self, timeout: Duration, min_priority: i32) -> Result<(Message, i32), QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(QueueError::NotInitialized);
        }

        if inner.items.is_empty() && !inner.emptied && min_priority == 0 {
            debug!("消息队列 {} 已空，等待数据", self.owner);
            inner.emptied = true;
        }

        loop {
            if inner.abort_requested {
                return Err(QueueError::Abort);
            }

            let ready = inner
                .items
                .front()
                .map(|item| item.priority >= min_priority)
                .unwrap_or(false);
            if ready {
                if let Some(item) = inner.pop_front() {
                    self.not_full.notify_all();
                    if inner.items.is_empty() {
                        self.empty.notify_all();
                    }
                    return Ok((item.message, item.priority));
                }
            }

            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                if inner.abort_requested {
                    return Err(QueueError::Abort);
                }
                let ready = inner
                    .items
                    .front()
                    .map(|item| item.priority >= min_priority)
                    .unwrap_or(false);
                if !ready {
                    return Err(QueueError::Timeout);
                }
            }
        }
    }

    /// 按类型移除消息（None 表示全部）
    ///
    /// 不唤醒读者；队列因此变空时唤醒等待清空的一方。
    pub fn flush(&self, kind: Option<MessageKind>) {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner
            .items
            .retain(|item| kind.map_or(false, |k| item.message.kind() != k));
        inner.recount();
        inner.recompute_time_span();

        let removed = before - inner.items.len();
        if removed > 0 {
            debug!("消息队列 {} 清空 {} 条消息", self.owner, removed);
        }
        self.not_full.notify_all();
        if inner.items.is_empty() {
            self.empty.notify_all();
        }
    }

    /// 等待队列被读空
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.items.is_empty() {
            if inner.abort_requested {
                return false;
            }
            if self.empty.wait_until(&mut inner, deadline).timed_out() {
                if !inner.items.is_empty() {
                    warn!("消息队列 {} 等待清空超时，剩余 {} 条", self.owner, inner.items.len());
                }
                return inner.items.is_empty();
            }
        }
        true
    }

    pub fn data_size(&self) -> usize {
        self.inner.lock().data_size
    }

    /// 缓存时长（秒）
    pub fn time_size(&self) -> f64 {
        self.inner.lock().time_size()
    }

    /// 缓存水位（0-100）
    pub fn level(&self) -> u32 {
        self.inner.lock().level()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().is_full()
    }

    /// 水位按字节数计算（时间戳不可用时）
    pub fn is_data_based(&self) -> bool {
        self.inner.lock().is_data_based()
    }

    pub fn packet_count(&self, kind: MessageKind) -> usize {
        self.inner
            .lock()
            .items
            .iter()
            .filter(|item| item.message.kind() == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn is_inited(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn received_abort_request(&self) -> bool {
        self.inner.lock().abort_requested
    }

    pub fn set_max_data_size(&self, size: usize) {
        self.inner.lock().max_data_size = size;
    }

    pub fn max_time_size(&self) -> f64 {
        self.inner.lock().max_time_size
    }

    pub fn set_max_time_size(&self, seconds: f64) {
        self.inner.lock().max_time_size = seconds.max(1.0);
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

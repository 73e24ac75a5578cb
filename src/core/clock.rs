use crate::core::types::{PLAYSPEED_NORMAL, PLAYSPEED_PAUSE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 主时钟接口 - 视频循环和硬件适配器通过它读取/修正播放时钟
///
/// 时钟的生命周期由外层播放会话管理，这里只消费它。
pub trait MasterClock: Send + Sync {
    /// 当前播放时间（tick）
    fn clock(&self) -> i64;

    /// 单调递增的绝对时间（tick）
    fn absolute_clock(&self) -> i64;

    /// 时钟跳变：在绝对时刻 `absolute` 把播放时间设为 `pts`
    fn discontinuity(&self, pts: i64, absolute: i64);

    /// 速度微调（0.0 = 不调整，0.01 = 快 1%）
    fn set_speed_adjust(&self, ratio: f64);
}

/// 播放时钟 - 用于音视频同步
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
    origin: Instant,
}

struct ClockInner {
    base_pts: i64,       // 基准 PTS（tick）
    base_absolute: i64,  // 基准时刻（绝对 tick）
    speed: i32,          // 播放速度（PLAYSPEED_NORMAL = 正常）
    speed_adjust: f64,   // 硬件同步给出的微调比例
    paused: bool,
    paused_at: i64,      // 暂停时的位置
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_pts: 0,
                base_absolute: 0,
                speed: PLAYSPEED_NORMAL,
                speed_adjust: 0.0,
                paused: true,
                paused_at: 0,
            })),
            origin: Instant::now(),
        }
    }

    /// 设置播放位置
    pub fn set_time(&self, pts: i64) {
        let absolute = self.absolute_clock();
        self.discontinuity(pts, absolute);
    }

    /// 开始播放
    pub fn play(&self) {
        let absolute = self.absolute_clock();
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.base_pts = inner.paused_at;
            inner.base_absolute = absolute;
            inner.paused = false;
        }
    }

    /// 暂停播放
    pub fn pause(&self) {
        let absolute = self.absolute_clock();
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.paused_at = Self::now_locked(&inner, absolute);
            inner.paused = true;
        }
    }

    /// 设置播放速度（PLAYSPEED_PAUSE 等价于暂停）
    pub fn set_speed(&self, speed: i32) {
        if speed == PLAYSPEED_PAUSE {
            self.pause();
            return;
        }
        let absolute = self.absolute_clock();
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.base_pts = Self::now_locked(&inner, absolute);
            inner.base_absolute = absolute;
        }
        inner.speed = speed;
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 当前速度微调比例
    pub fn speed_adjust(&self) -> f64 {
        self.inner.lock().speed_adjust
    }

    fn now_locked(inner: &ClockInner, absolute: i64) -> i64 {
        if inner.paused {
            inner.paused_at
        } else {
            let elapsed = (absolute - inner.base_absolute) as f64;
            let rate = inner.speed as f64 / PLAYSPEED_NORMAL as f64 * (1.0 + inner.speed_adjust);
            inner.base_pts + (elapsed * rate) as i64
        }
    }
}

impl MasterClock for PlaybackClock {
    fn clock(&self) -> i64 {
        let absolute = self.absolute_clock();
        let inner = self.inner.lock();
        Self::now_locked(&inner, absolute)
    }

    fn absolute_clock(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn discontinuity(&self, pts: i64, absolute: i64) {
        let mut inner = self.inner.lock();
        inner.base_pts = pts;
        inner.base_absolute = absolute;
        inner.paused_at = pts;
    }

    fn set_speed_adjust(&self, ratio: f64) {
        let absolute = self.absolute_clock();
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.base_pts = Self::now_locked(&inner, absolute);
            inner.base_absolute = absolute;
        }
        inner.speed_adjust = ratio;
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

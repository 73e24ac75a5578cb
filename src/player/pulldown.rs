use crate::core::TIME_BASE;

/// 下拉（telecine）节奏校正
///
/// 以固定节奏（例如 3:2）重新分配每帧的显示时长，并给出相对于
/// 均匀节奏的 pts 偏移。
#[derive(Debug, Clone, Default)]
pub struct PulldownCorrection {
    pattern: Vec<u32>,
    duration: f64,
    accum: u32,
    total: u32,
    next: usize,
}

impl PulldownCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以帧率和节奏初始化（节奏为空表示关闭）
    pub fn init(&mut self, fps: f64, pattern: &[u32]) {
        self.pattern = pattern.to_vec();
        self.duration = if fps > 0.0 { TIME_BASE as f64 / fps } else { 0.0 };
        self.accum = 0;
        self.total = pattern.iter().sum();
        self.next = 0;
    }

    pub fn reset(&mut self) {
        self.accum = 0;
        self.next = 0;
    }

    pub fn enabled(&self) -> bool {
        !self.pattern.is_empty() && self.total > 0
    }

    /// 当前帧的 pts 偏移（tick）
    pub fn pts(&self) -> i64 {
        if !self.enabled() {
            return 0;
        }
        let input = self.duration * self.next as f64;
        let output = self.duration * self.pattern.len() as f64 * self.accum as f64 / self.total as f64;
        (output - input) as i64
    }

    /// 当前帧的显示时长（tick）
    pub fn dur(&self) -> i64 {
        if !self.enabled() {
            return self.duration as i64;
        }
        (self.duration * self.pattern.len() as f64 * self.pattern[self.next] as f64 / self.total as f64) as i64
    }

    /// 前进到下一帧
    pub fn next(&mut self) {
        if !self.enabled() {
            return;
        }
        self.accum += self.pattern[self.next];
        self.next += 1;
        if self.next >= self.pattern.len() {
            self.next = 0;
            self.accum = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_pattern() {
        let mut pulldown = PulldownCorrection::new();
        pulldown.init(25.0, &[]);
        assert!(!pulldown.enabled());
        assert_eq!(pulldown.pts(), 0);
        assert_eq!(pulldown.dur(), 40_000);
    }

    #[test]
    fn test_three_two_cadence() {
        // 3:2 节奏：一个周期两帧，分别占周期的 3/5 和 2/5
        let mut pulldown = PulldownCorrection::new();
        pulldown.init(24.0, &[3, 2]);
        let frame = TIME_BASE as f64 / 24.0;

        assert_eq!(pulldown.pts(), 0);
        assert_eq!(pulldown.dur(), (frame * 2.0 * 3.0 / 5.0) as i64);
        pulldown.next();

        // 第二帧推后 1/5 帧
        assert_eq!(pulldown.pts(), (frame * 2.0 * 3.0 / 5.0 - frame) as i64);
        assert_eq!(pulldown.dur(), (frame * 2.0 * 2.0 / 5.0) as i64);
        pulldown.next();

        // 一个周期后回到起点
        assert_eq!(pulldown.pts(), 0);
    }

    #[test]
    fn test_cycle_durations_sum_to_uniform_span() {
        let mut pulldown = PulldownCorrection::new();
        pulldown.init(30.0, &[2, 3, 2, 3]);
        let total: i64 = (0..4)
            .map(|_| {
                let d = pulldown.dur();
                pulldown.next();
                d
            })
            .sum();
        let uniform = 4 * TIME_BASE / 30;
        assert!((total - uniform).abs() <= 4);
    }
}

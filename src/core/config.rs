use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 管线配置（所有字段都有默认值，JSON 里可以只写需要覆盖的部分）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub demux: DemuxConfig,
    pub queue: QueueConfig,
    pub video: VideoConfig,
    pub hardware: HardwareConfig,
}

impl PlayerConfig {
    /// 从 JSON 文本加载
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 解封装配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// 打开阶段的 I/O 看门狗（毫秒）
    pub open_timeout_ms: u64,
    /// 稳定读取阶段的 I/O 看门狗（毫秒）
    pub read_timeout_ms: u64,
    /// 普通格式的流分析时长（毫秒）
    pub analyze_duration_ms: u64,
    /// 快速起播格式的流分析时长（毫秒）
    pub fast_start_analyze_ms: u64,
    /// 多节目时优先选择的节目号
    pub preferred_program: Option<u32>,
    /// 传输流/直播源在视频参数到达前不输出数据
    pub check_video_ready: bool,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 30_000,
            read_timeout_ms: 2_000,
            analyze_duration_ms: 5_000,
            fast_start_analyze_ms: 500,
            preferred_program: None,
            check_video_ready: true,
        }
    }
}

impl DemuxConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// 视频消息队列容量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大缓存字节数
    pub max_data_size: usize,
    /// 最大缓存时长（秒）
    pub max_time_size: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_data_size: 40 * 1024 * 1024,
            max_time_size: 8.0,
        }
    }
}

/// 去隔行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeinterlaceMode {
    Off,
    Auto,
    Force,
}

/// 去隔行方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlaceMethod {
    /// 由渲染器决定
    Auto,
    /// 交给解码器去隔行
    Deinterlace,
    /// 解码器去隔行（半帧率）
    DeinterlaceHalf,
    /// 软件混合（走后处理滤镜链）
    SoftwareBlend,
    None,
}

/// 视频解码循环配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// 落后时允许请求解码器丢帧
    pub allow_drop: bool,
    pub deinterlace_mode: DeinterlaceMode,
    pub interlace_method: InterlaceMethod,
    /// 是否启用画质后处理滤镜
    pub post_process: bool,
    /// 软件去隔行滤镜链
    pub pp_deinterlace_chain: String,
    /// 画质后处理滤镜链
    pub pp_quality_chain: String,
    /// 下拉节奏（例如 [3, 2]），为空表示关闭
    pub pulldown_pattern: Option<Vec<u32>>,
    /// 流没有声明帧率时使用的帧率
    pub fallback_fps: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            allow_drop: true,
            deinterlace_mode: DeinterlaceMode::Auto,
            interlace_method: InterlaceMethod::Auto,
            post_process: false,
            pp_deinterlace_chain: "linblenddeint".to_string(),
            pp_quality_chain: "ha:128:7,va,dr".to_string(),
            pulldown_pattern: None,
            fallback_fps: 25.0,
        }
    }
}

/// 硬件解码同步方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// 解码器在显示回调里驱动校正
    ServerSync,
    /// 本地后台任务周期性校正
    ClientNotify,
}

/// 硬件解码器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub enabled: bool,
    /// 时钟偏差阈值（秒）
    pub sync_threshold: f64,
    /// 校正周期（毫秒）
    pub correction_period_ms: u64,
    /// 音频延迟（秒）
    pub audio_delay: f64,
    pub sync_mode: SyncMode,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_threshold: 0.125,
            correction_period_ms: 100,
            audio_delay: 0.0,
            sync_mode: SyncMode::ClientNotify,
        }
    }
}

impl HardwareConfig {
    pub fn correction_period(&self) -> Duration {
        Duration::from_millis(self.correction_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json(
            r#"{ "video": { "pulldown_pattern": [3, 2] }, "hardware": { "sync_threshold": 0.25 } }"#,
        )
        .unwrap();
        assert_eq!(config.video.pulldown_pattern, Some(vec![3, 2]));
        assert_eq!(config.video.fallback_fps, 25.0);
        assert_eq!(config.hardware.sync_threshold, 0.25);
        assert_eq!(config.hardware.correction_period_ms, 100);
        assert_eq!(config.demux, DemuxConfig::default());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = PlayerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::core::PlayerError::ConfigError(_)));
    }
}

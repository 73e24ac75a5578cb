use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(#[from] OpenError),

    #[error("消息队列错误: {0}")]
    QueueError(#[from] QueueError),

    #[error("不支持的视频编码: {0}")]
    UnsupportedCodec(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("硬件解码器错误: {0}")]
    HardwareError(String),

    #[error("配置错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

/// 打开容器失败（对 Demuxer 是致命错误，不重试）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("没有匹配的容器格式")]
    NoMatchingFormat,

    #[error("读取数据源失败: {0}")]
    Io(String),

    #[error("流结构分析失败: {0}")]
    Analysis(String),

    #[error("打开过程被中断")]
    Interrupted,
}

/// 消息队列返回码
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("等待超时")]
    Timeout,

    #[error("队列已中止")]
    Abort,

    #[error("队列未初始化")]
    NotInitialized,

    #[error("队列已满")]
    Full,
}

pub type Result<T> = std::result::Result<T, PlayerError>;

//! 播放引擎的解封装与同步视频解码管线
//!
//! 数据流：容器字节流 -> [`player::Demuxer`] -> [`player::MessageQueue`]
//! -> [`player::VideoPlayer`] 解码循环 -> 渲染器。

pub mod core;
pub mod player;

pub use crate::core::{PlayerConfig, PlayerError, Result};

/// 初始化日志（默认 Info 级别，可用 RUST_LOG 覆盖）
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

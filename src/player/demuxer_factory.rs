use crate::core::{DemuxConfig, OpenError, PlayerError, Result};
use crate::player::demuxer::{Demuxer, OpenRequest};
use crate::player::demuxer_source::{ByteSource, ContainerBackend, InterruptHandle};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Demuxer 创建结果
pub enum DemuxerCreationResult {
    /// 创建成功
    Success { demuxer: Demuxer, format: String },
    /// 创建失败
    Failed { error: PlayerError },
}

/// Demuxer 工厂 - 在子线程中打开容器（探测/分析可能很慢）
///
/// 使用方法：
/// ```ignore
/// let (tx, rx) = unbounded();
/// let interrupt = DemuxerFactory::create_async(backend, source, request, config, tx);
///
/// // 稍后接收结果，或者调用 interrupt.abort() 放弃
/// match rx.recv()? {
///     DemuxerCreationResult::Success { demuxer, .. } => { /* ... */ }
///     DemuxerCreationResult::Failed { error } => error!("创建失败: {}", error),
/// }
/// ```
pub struct DemuxerFactory;

impl DemuxerFactory {
    /// 异步创建 Demuxer，返回可以中断打开过程的句柄
    pub fn create_async(
        backend: Arc<dyn ContainerBackend>,
        source: Box<dyn ByteSource>,
        request: OpenRequest,
        config: DemuxConfig,
        result_tx: Sender<DemuxerCreationResult>,
    ) -> Result<Arc<InterruptHandle>> {
        let interrupt = Arc::new(InterruptHandle::new());
        let handle = interrupt.clone();

        thread::Builder::new()
            .name("demuxer-open".to_string())
            .spawn(move || {
                info!("🔨 开始在子线程中创建 Demuxer");

                let result = match Demuxer::open_with_interrupt(&*backend, source, &request, &config, handle) {
                    Ok(demuxer) => {
                        let format = demuxer.format_name();
                        DemuxerCreationResult::Success { demuxer, format }
                    }
                    Err(error) => {
                        warn!("创建 Demuxer 失败: {}", error);
                        DemuxerCreationResult::Failed { error }
                    }
                };

                if result_tx.send(result).is_err() {
                    error!("❌ 发送 Demuxer 创建结果失败，接收端已关闭");
                } else {
                    info!("✅ Demuxer 创建结果已发送");
                }
            })?;

        Ok(interrupt)
    }

    /// 阻塞创建，超过 `timeout` 时中断打开过程
    pub fn open_blocking(
        backend: Arc<dyn ContainerBackend>,
        source: Box<dyn ByteSource>,
        request: OpenRequest,
        config: DemuxConfig,
        timeout: Duration,
    ) -> Result<Demuxer> {
        let (tx, rx) = bounded(1);
        let interrupt = Self::create_async(backend, source, request, config, tx)?;

        match rx.recv_timeout(timeout) {
            Ok(DemuxerCreationResult::Success { demuxer, .. }) => Ok(demuxer),
            Ok(DemuxerCreationResult::Failed { error }) => Err(error),
            Err(RecvTimeoutError::Timeout) => {
                warn!("打开超时（{:?}），中断", timeout);
                interrupt.abort();
                Err(OpenError::Interrupted.into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(PlayerError::Other("打开线程意外退出".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_fixtures::{video_info, ContainerState, MemorySource, MockBackend, SlowSource};
    use crossbeam_channel::unbounded;

    #[test]
    fn test_create_async_success() {
        let mut state = ContainerState::new("matroska");
        state.streams = vec![video_info(0, 1280, 720)];
        let backend: Arc<dyn ContainerBackend> = Arc::new(MockBackend::new(state));

        let (tx, rx) = unbounded();
        DemuxerFactory::create_async(
            backend,
            Box::new(MemorySource::new(vec![0; 128])),
            OpenRequest::default(),
            DemuxConfig::default(),
            tx,
        )
        .unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            DemuxerCreationResult::Success { demuxer, format } => {
                assert_eq!(format, "matroska");
                assert_eq!(demuxer.stream_count(), 1);
            }
            DemuxerCreationResult::Failed { error } => panic!("open failed: {}", error),
        }
    }

    #[test]
    fn test_create_async_reports_failure() {
        let mut state = ContainerState::new("matroska");
        state.probe_result = None;
        let backend: Arc<dyn ContainerBackend> = Arc::new(MockBackend::new(state));

        let result = DemuxerFactory::open_blocking(
            backend,
            Box::new(MemorySource::new(vec![0; 128])),
            OpenRequest::default(),
            DemuxConfig::default(),
            Duration::from_secs(2),
        );
        assert!(matches!(result, Err(PlayerError::OpenError(OpenError::NoMatchingFormat))));
    }

    #[test]
    fn test_open_blocking_times_out() {
        let backend: Arc<dyn ContainerBackend> = Arc::new(MockBackend::new(ContainerState::new("mpegts")));
        let result = DemuxerFactory::open_blocking(
            backend,
            Box::new(SlowSource::new(Duration::from_millis(5))),
            OpenRequest::default(),
            DemuxConfig::default(),
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(PlayerError::OpenError(OpenError::Interrupted))));
    }
}

// 解封装与视频解码管线

pub mod demuxer;
pub mod demuxer_source;  // 容器/字节源抽象接口
pub mod demuxer_thread;  // Demuxer 线程管理
pub mod demuxer_factory; // Demuxer 工厂（异步创建）
pub mod stream_registry;
pub mod message;
pub mod message_queue;
pub mod decoder;
#[cfg(feature = "hwaccel")]
pub mod hw_decoder;
pub mod pulldown;
pub mod video_player;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;   // ffmpeg 容器后端

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use demuxer::{DemuxRead, Demuxer, OpenRequest};
pub use demuxer_source::{ByteSource, ContainerBackend, ContainerSource, InterruptHandle};
pub use demuxer_thread::{DemuxerCommand, DemuxerThread, PacketRoutes};
pub use demuxer_factory::{DemuxerCreationResult, DemuxerFactory};
pub use stream_registry::{StreamDescriptor, StreamRegistry};
pub use message::{Message, MessageKind, PlayerEvent};
pub use message_queue::MessageQueue;
pub use decoder::{CodecFactory, CodecProvider, DecodeStatus, StreamHints, VideoCodec};
#[cfg(feature = "hwaccel")]
pub use hw_decoder::{ExternalDecoder, HardwareCodecProvider, HardwareVideoCodec};
pub use pulldown::PulldownCorrection;
pub use video_player::{PostProcessor, RenderSink, VideoPlayer};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_source::FfmpegBackend;

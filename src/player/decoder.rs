use crate::core::{CodecId, Picture, Result};
use crate::player::demuxer_source::DISPOSITION_ATTACHED_PIC;
use crate::player::stream_registry::StreamDescriptor;
use log::{debug, info, warn};

/// 解码状态位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeStatus(u32);

impl DecodeStatus {
    /// 解码出错
    pub const ERROR: u32 = 0x0001;
    /// 有图像可取
    pub const PICTURE: u32 = 0x0004;
    /// 需要更多数据
    pub const BUFFER: u32 = 0x0008;
    /// 解码器内部清空，需要回放已发送的包
    pub const FLUSHED: u32 = 0x0020;
    /// 需要重建解码器并回放
    pub const REOPEN: u32 = 0x0100;
    /// 数据包原样转交上层
    pub const BYPASS: u32 = 0x0200;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn buffer() -> Self {
        Self(Self::BUFFER)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// 解码控制位
pub const CODEC_CTRL_DRAIN: u32 = 0x01;
pub const CODEC_CTRL_NO_POSTPROC: u32 = 0x02;

/// 解码器滤镜请求位
pub const FILTER_DEINTERLACE_ANY: u32 = 0x01;
pub const FILTER_DEINTERLACE_FLAGGED: u32 = 0x02;
pub const FILTER_DEINTERLACE_HALFED: u32 = 0x04;
pub const FILTER_ROTATE: u32 = 0x08;

/// 打开解码器所需的流参数
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHints {
    pub codec: CodecId,
    pub codec_tag: u32,
    pub width: u32,
    pub height: u32,
    pub fps_rate: u32,
    pub fps_scale: u32,
    pub aspect: f64,
    pub profile: i32,
    pub extradata: Vec<u8>,
    pub disposition: u32,
    /// 容器的 pts 不可信
    pub pts_invalid: bool,
    /// 强制使用软件解码
    pub software: bool,
}

impl StreamHints {
    pub fn new(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec,
            codec_tag: 0,
            width,
            height,
            fps_rate: 0,
            fps_scale: 0,
            aspect: 0.0,
            profile: 0,
            extradata: Vec::new(),
            disposition: 0,
            pts_invalid: false,
            software: false,
        }
    }

    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        let mut hints = Self::new(descriptor.codec, 0, 0);
        hints.codec_tag = descriptor.codec_tag;
        hints.extradata = descriptor.extradata.clone();
        hints.disposition = descriptor.disposition;
        if let Some(video) = descriptor.video() {
            hints.width = video.width;
            hints.height = video.height;
            hints.fps_rate = video.fps_rate;
            hints.fps_scale = video.fps_scale;
            hints.aspect = video.aspect;
            hints.profile = video.profile;
        }
        hints
    }

    /// 封面图片（不作为视频流播放）
    pub fn is_attached_picture(&self) -> bool {
        self.disposition & DISPOSITION_ATTACHED_PIC != 0
    }

    /// 流声明的帧率
    pub fn fps(&self) -> Option<f64> {
        if self.fps_rate > 0 && self.fps_scale > 0 {
            Some(self.fps_rate as f64 / self.fps_scale as f64)
        } else {
            None
        }
    }
}

/// 视频解码器能力接口（硬件/软件实现）
pub trait VideoCodec: Send {
    /// 打开解码器，失败时工厂会尝试下一个实现
    fn open(&mut self, hints: &StreamHints) -> Result<()>;

    fn dispose(&mut self);

    /// 送入一个数据包（None 表示只取出缓冲的图像）
    fn decode(&mut self, data: Option<&[u8]>, dts: Option<i64>, pts: Option<i64>) -> DecodeStatus;

    fn reset(&mut self);

    /// 重建解码器实例（参数不变）
    fn reopen(&mut self) -> bool {
        self.reset();
        true
    }

    /// 取出最近解码的图像
    fn picture(&mut self) -> Option<Picture>;

    /// 下一帧解码后丢弃（不显示）
    fn set_drop_state(&mut self, drop: bool);

    fn set_speed(&mut self, _speed: i32) {}

    fn set_codec_control(&mut self, _flags: u32) {}

    /// 请求解码器执行的滤镜，返回实际接受的部分
    fn set_filters(&mut self, _filters: u32) -> u32 {
        0
    }

    /// 清空后需要回放的帧数（0 表示不需要回放缓冲）
    fn converge_count(&self) -> usize {
        0
    }

    /// 解码器内部缓存的时长（秒）
    fn time_size(&self) -> f64 {
        0.0
    }

    /// 通知解码器输入结束
    fn submit_eos(&mut self) {}

    fn is_eos(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// 解码器提供者（工厂按注册顺序尝试）
pub trait CodecProvider: Send + Sync {
    fn name(&self) -> &str;

    /// 是否可以处理这个流（不打开解码器的快速检查）
    fn accepts(&self, _hints: &StreamHints) -> bool {
        true
    }

    fn create(&self) -> Box<dyn VideoCodec>;
}

/// 解码器工厂：硬件优先，失败回退到软件
#[derive(Default)]
pub struct CodecFactory {
    providers: Vec<Box<dyn CodecProvider>>,
}

impl CodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Box<dyn CodecProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// 标准组合：可选的硬件提供者 + ffmpeg 软件解码
    pub fn standard(hardware: Option<Box<dyn CodecProvider>>) -> Self {
        let mut factory = Self::new();
        if let Some(hardware) = hardware {
            factory.providers.push(hardware);
        }
        #[cfg(feature = "ffmpeg")]
        {
            factory.providers.push(Box::new(ffmpeg_codec::FfmpegCodecProvider));
        }
        factory
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// 依次尝试打开解码器
    pub fn create(&self, hints: &StreamHints) -> Option<Box<dyn VideoCodec>> {
        info!("创建视频解码器: codec={} {}x{}", hints.codec.name(), hints.width, hints.height);

        for provider in &self.providers {
            if !provider.accepts(hints) {
                debug!("{} 不支持该流，跳过", provider.name());
                continue;
            }

            let mut codec = provider.create();
            match codec.open(hints) {
                Ok(()) => {
                    info!("✓ 使用解码器: {}", codec.name());
                    return Some(codec);
                }
                Err(e) => {
                    warn!("{} 打开失败: {}", provider.name(), e);
                    codec.dispose();
                }
            }
        }

        warn!("❌ 没有可用的视频解码器: {}", hints.codec.name());
        None
    }
}

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_codec::{FfmpegCodecProvider, FfmpegVideoCodec};

#[cfg(feature = "ffmpeg")]
mod ffmpeg_codec {
    use super::*;
    use crate::core::{PictureFlags, PixelFormat, PlayerError};
    use ffmpeg_next as ffmpeg;
    use ffmpeg_next::{codec, software, util};

    pub struct FfmpegCodecProvider;

    impl CodecProvider for FfmpegCodecProvider {
        fn name(&self) -> &str {
            "ffmpeg"
        }

        fn accepts(&self, hints: &StreamHints) -> bool {
            codec_id(hints.codec).is_some()
        }

        fn create(&self) -> Box<dyn VideoCodec> {
            Box::new(FfmpegVideoCodec::new())
        }
    }

    fn codec_id(codec: CodecId) -> Option<codec::Id> {
        Some(match codec {
            CodecId::Mpeg1Video => codec::Id::MPEG1VIDEO,
            CodecId::Mpeg2Video => codec::Id::MPEG2VIDEO,
            CodecId::Mpeg4 => codec::Id::MPEG4,
            CodecId::H264 => codec::Id::H264,
            CodecId::Hevc => codec::Id::HEVC,
            CodecId::Vc1 => codec::Id::VC1,
            CodecId::Wmv3 => codec::Id::WMV3,
            CodecId::Vp6 => codec::Id::VP6,
            CodecId::Vp6f => codec::Id::VP6F,
            CodecId::Vp6a => codec::Id::VP6A,
            CodecId::Vp8 => codec::Id::VP8,
            CodecId::Vp9 => codec::Id::VP9,
            CodecId::Av1 => codec::Id::AV1,
            CodecId::Flv1 => codec::Id::FLV1,
            CodecId::Rv10 => codec::Id::RV10,
            CodecId::Rv20 => codec::Id::RV20,
            CodecId::Rv30 => codec::Id::RV30,
            CodecId::Rv40 => codec::Id::RV40,
            _ => return None,
        })
    }

    /// ffmpeg 软件解码器（输出 RGBA）
    pub struct FfmpegVideoCodec {
        decoder: Option<codec::decoder::Video>,
        scaler: Option<software::scaling::Context>,
        picture: Option<Picture>,
        drop: bool,
        name: String,
    }

    // SwsContext 本身不是 Send，但每个解码器实例只在解码线程中使用
    unsafe impl Send for FfmpegVideoCodec {}

    impl FfmpegVideoCodec {
        pub fn new() -> Self {
            Self {
                decoder: None,
                scaler: None,
                picture: None,
                drop: false,
                name: "ff-video".to_string(),
            }
        }

        /// 转换为 RGBA 并复制到连续内存
        fn convert_frame(&mut self, frame: &util::frame::Video) -> std::result::Result<Picture, ffmpeg::Error> {
            let width = frame.width();
            let height = frame.height();

            let mut picture = Picture::new(width, height, PixelFormat::RGBA);
            picture.pts = frame.timestamp();
            picture.repeat_picture = frame.repeat().max(0.0) as u32;
            picture.flags.insert(PictureFlags::ALLOCATED);
            if frame.is_interlaced() {
                picture.flags.insert(PictureFlags::INTERLACED);
                if frame.is_top_first() {
                    picture.flags.insert(PictureFlags::TOP_FIELD_FIRST);
                }
            }

            if self.drop {
                picture.flags.insert(PictureFlags::DROPPED);
                return Ok(picture);
            }

            let rebuild = match &self.scaler {
                Some(scaler) => {
                    scaler.input().width != width
                        || scaler.input().height != height
                        || scaler.input().format != frame.format()
                }
                None => true,
            };
            if rebuild {
                self.scaler = Some(software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    util::format::Pixel::RGBA,
                    width,
                    height,
                    software::scaling::Flags::BILINEAR,
                )?);
            }

            let mut rgba_frame = util::frame::Video::empty();
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(frame, &mut rgba_frame)?;
            }

            let row_size = width as usize * 4;
            let stride = rgba_frame.stride(0);
            let frame_data = rgba_frame.data(0);
            let mut data = vec![0u8; row_size * height as usize];
            for y in 0..height as usize {
                let src = y * stride;
                data[y * row_size..(y + 1) * row_size].copy_from_slice(&frame_data[src..src + row_size]);
            }
            picture.data = data;
            Ok(picture)
        }

        fn receive(&mut self) -> DecodeStatus {
            let Some(decoder) = self.decoder.as_mut() else {
                return DecodeStatus::new(DecodeStatus::ERROR);
            };

            let mut frame = util::frame::Video::empty();
            match decoder.receive_frame(&mut frame) {
                Ok(()) => match self.convert_frame(&frame) {
                    Ok(picture) => {
                        self.picture = Some(picture);
                        DecodeStatus::new(DecodeStatus::PICTURE)
                    }
                    Err(e) => {
                        warn!("图像转换失败: {}", e);
                        DecodeStatus::new(DecodeStatus::ERROR | DecodeStatus::BUFFER)
                    }
                },
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    DecodeStatus::buffer()
                }
                Err(ffmpeg::Error::Eof) => DecodeStatus::buffer(),
                Err(e) => {
                    warn!("解码错误（已跳过）: {}", e);
                    DecodeStatus::new(DecodeStatus::ERROR | DecodeStatus::BUFFER)
                }
            }
        }
    }

    impl Default for FfmpegVideoCodec {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VideoCodec for FfmpegVideoCodec {
        fn open(&mut self, hints: &StreamHints) -> Result<()> {
            ffmpeg::init()?;
            let id = codec_id(hints.codec).ok_or_else(|| PlayerError::UnsupportedCodec(hints.codec.name()))?;
            let found = ffmpeg::decoder::find(id).ok_or_else(|| PlayerError::UnsupportedCodec(hints.codec.name()))?;

            let mut context = codec::context::Context::new();
            unsafe {
                let ptr = context.as_mut_ptr();
                (*ptr).width = hints.width as i32;
                (*ptr).height = hints.height as i32;
                (*ptr).codec_tag = hints.codec_tag;
                if !hints.extradata.is_empty() {
                    let size = hints.extradata.len();
                    let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                    let buffer = ffmpeg::ffi::av_mallocz(size + padding) as *mut u8;
                    if !buffer.is_null() {
                        std::ptr::copy_nonoverlapping(hints.extradata.as_ptr(), buffer, size);
                        (*ptr).extradata = buffer;
                        (*ptr).extradata_size = size as i32;
                    }
                }
            }

            let decoder = context.decoder().open_as(found)?.video()?;
            debug!("软件解码器: {}x{}, 格式: {:?}", decoder.width(), decoder.height(), decoder.format());
            self.name = format!("ff-{}", hints.codec.name());
            self.decoder = Some(decoder);
            Ok(())
        }

        fn dispose(&mut self) {
            self.decoder = None;
            self.scaler = None;
            self.picture = None;
        }

        fn decode(&mut self, data: Option<&[u8]>, dts: Option<i64>, pts: Option<i64>) -> DecodeStatus {
            let Some(decoder) = self.decoder.as_mut() else {
                return DecodeStatus::new(DecodeStatus::ERROR);
            };

            if let Some(bytes) = data {
                let mut packet = ffmpeg::Packet::copy(bytes);
                packet.set_pts(pts);
                packet.set_dts(dts);
                match decoder.send_packet(&packet) {
                    Ok(()) => {}
                    Err(ffmpeg::Error::Eof) => {
                        debug!("视频解码器收到 EOF，执行 flush");
                        decoder.flush();
                        return DecodeStatus::buffer();
                    }
                    Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {}
                    Err(e) => {
                        warn!("送入数据包失败: {}", e);
                        return DecodeStatus::new(DecodeStatus::ERROR | DecodeStatus::BUFFER);
                    }
                }
            }
            self.receive()
        }

        fn reset(&mut self) {
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.flush();
            }
            self.picture = None;
        }

        fn picture(&mut self) -> Option<Picture> {
            self.picture.take()
        }

        fn set_drop_state(&mut self, drop: bool) {
            self.drop = drop;
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_fixtures::{MockCodec, MockCodecProvider};

    #[test]
    fn test_factory_falls_back_to_next_provider() {
        let factory = CodecFactory::new()
            .with_provider(Box::new(MockCodecProvider::failing("hw")))
            .with_provider(Box::new(MockCodecProvider::new("sw", MockCodec::new("sw"))));

        let codec = factory.create(&StreamHints::new(CodecId::H264, 1920, 1080)).unwrap();
        assert_eq!(codec.name(), "sw");
        assert_eq!(factory.provider_names(), vec!["hw".to_string(), "sw".to_string()]);
    }

    #[test]
    fn test_factory_without_providers() {
        let factory = CodecFactory::new().with_provider(Box::new(MockCodecProvider::failing("hw")));
        assert!(factory.create(&StreamHints::new(CodecId::H264, 640, 480)).is_none());
    }

    #[test]
    fn test_hints_from_descriptor() {
        let mut registry = crate::player::stream_registry::StreamRegistry::new();
        let mut info = crate::player::test_fixtures::video_info(0, 1280, 720);
        info.disposition = DISPOSITION_ATTACHED_PIC;
        let descriptor = registry.create(&info);

        let hints = StreamHints::from_descriptor(&descriptor);
        assert_eq!((hints.width, hints.height), (1280, 720));
        assert_eq!(hints.fps(), Some(25.0));
        assert!(hints.is_attached_picture());
    }

    #[test]
    fn test_decode_status_flags() {
        let mut status = DecodeStatus::buffer();
        status.insert(DecodeStatus::PICTURE);
        assert!(status.contains(DecodeStatus::BUFFER));
        assert!(status.contains(DecodeStatus::PICTURE));
        assert!(!status.contains(DecodeStatus::ERROR));
    }
}

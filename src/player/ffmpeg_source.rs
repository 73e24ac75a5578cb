//! ffmpeg 容器后端
//!
//! 通过自定义 AVIO 把 [`ByteSource`] 交给 libavformat 解析，
//! I/O 中断回调轮询 [`InterruptHandle`]。

use crate::core::{CodecId, OpenError, StreamType};
use crate::player::demuxer_source::{
    Attachment, ByteSource, ContainerBackend, ContainerSource, FrameReadError, InterruptHandle, OpenOptions,
    ProbeMatch, ProgramInfo, RawPacket, StreamInfo, TimeBase,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, ffi};
use log::{debug, info, warn};
use std::ffi::{c_void, CStr, CString};
use std::io::SeekFrom;
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Arc;

const AVIO_BUFFER_SIZE: usize = 32 * 1024;
const AVSEEK_SIZE: c_int = 0x10000;
const AVSEEK_FORCE: c_int = 0x20000;

/// AVIO 回调共享的状态（地址在容器生命周期内固定）
struct IoState {
    source: Box<dyn ByteSource>,
    interrupt: Arc<InterruptHandle>,
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let state = &mut *(opaque as *mut IoState);
    if buf_size <= 0 {
        return 0;
    }
    let slice = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    match state.source.read(slice) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(n) => n as c_int,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ffi::AVERROR_EXIT,
        Err(e) => {
            debug!("AVIO 读取失败: {}", e);
            ffi::AVERROR_UNKNOWN
        }
    }
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let state = &mut *(opaque as *mut IoState);
    let whence = whence & !AVSEEK_FORCE;
    if whence == AVSEEK_SIZE {
        return state.source.length().map(|len| len as i64).unwrap_or(-1);
    }
    let pos = match whence {
        0 => SeekFrom::Start(offset.max(0) as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return -1,
    };
    match state.source.seek(pos) {
        Ok(offset) => offset as i64,
        Err(_) => -1,
    }
}

unsafe extern "C" fn interrupt_cb(opaque: *mut c_void) -> c_int {
    let state = &*(opaque as *const IoState);
    (state.interrupt.is_interrupted() || state.source.is_interrupted()) as c_int
}

fn ts(value: i64) -> Option<i64> {
    (value != ffi::AV_NOPTS_VALUE).then_some(value)
}

fn map_codec(id: codec::Id) -> CodecId {
    match id {
        codec::Id::MPEG1VIDEO => CodecId::Mpeg1Video,
        codec::Id::MPEG2VIDEO => CodecId::Mpeg2Video,
        codec::Id::MPEG4 => CodecId::Mpeg4,
        codec::Id::H264 => CodecId::H264,
        codec::Id::HEVC => CodecId::Hevc,
        codec::Id::VC1 => CodecId::Vc1,
        codec::Id::WMV3 => CodecId::Wmv3,
        codec::Id::VP6 => CodecId::Vp6,
        codec::Id::VP6F => CodecId::Vp6f,
        codec::Id::VP6A => CodecId::Vp6a,
        codec::Id::VP8 => CodecId::Vp8,
        codec::Id::VP9 => CodecId::Vp9,
        codec::Id::AV1 => CodecId::Av1,
        codec::Id::FLV1 => CodecId::Flv1,
        codec::Id::RV10 => CodecId::Rv10,
        codec::Id::RV20 => CodecId::Rv20,
        codec::Id::RV30 => CodecId::Rv30,
        codec::Id::RV40 => CodecId::Rv40,
        codec::Id::AAC => CodecId::Aac,
        codec::Id::AC3 => CodecId::Ac3,
        codec::Id::DTS => CodecId::Dts,
        codec::Id::MP3 => CodecId::Mp3,
        codec::Id::FLAC => CodecId::Flac,
        codec::Id::PCM_S16LE | codec::Id::PCM_S16BE | codec::Id::PCM_S24LE | codec::Id::PCM_F32LE => CodecId::Pcm,
        codec::Id::TEXT | codec::Id::SUBRIP => CodecId::Text,
        codec::Id::ASS | codec::Id::SSA => CodecId::Ass,
        codec::Id::DVB_SUBTITLE => CodecId::Dvb,
        codec::Id::DVB_TELETEXT => CodecId::Teletext,
        codec::Id::TTF | codec::Id::OTF => CodecId::Ttf,
        codec::Id::None => CodecId::None,
        other => CodecId::Other(ffi::AVCodecID::from(other) as u32),
    }
}

/// 从 ffmpeg 错误码映射读取错误
fn map_read_error(code: c_int, interrupted: bool) -> FrameReadError {
    if interrupted || code == ffi::AVERROR_EXIT {
        FrameReadError::Interrupted
    } else if code == ffi::AVERROR_EOF {
        FrameReadError::Eof
    } else if code == ffi::AVERROR(ffmpeg::util::error::EAGAIN) {
        FrameReadError::WouldBlock
    } else if code == ffi::AVERROR_INVALIDDATA {
        FrameReadError::Corrupt(ffmpeg::Error::from(code).to_string())
    } else {
        FrameReadError::Io(ffmpeg::Error::from(code).to_string())
    }
}

unsafe fn dict_value(dict: *mut ffi::AVDictionary, key: &CStr) -> Option<String> {
    let entry = ffi::av_dict_get(dict, key.as_ptr(), ptr::null(), 0);
    if entry.is_null() || (*entry).value.is_null() {
        return None;
    }
    Some(CStr::from_ptr((*entry).value).to_string_lossy().into_owned())
}

/// 基于 libavformat 的容器后端
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> std::result::Result<Self, ffmpeg::Error> {
        ffmpeg::init()?;
        Ok(Self)
    }

    fn probe_with_score(&self, buffer: &[u8]) -> Option<(String, u32)> {
        // 探测缓冲区末尾需要零填充
        let mut padded = buffer.to_vec();
        padded.resize(buffer.len() + ffi::AVPROBE_PADDING_SIZE as usize, 0);

        let filename = CString::default();
        let probe = ffi::AVProbeData {
            filename: filename.as_ptr(),
            buf: padded.as_mut_ptr(),
            buf_size: buffer.len() as c_int,
            mime_type: ptr::null(),
        };
        let mut score: c_int = 0;
        unsafe {
            let format = ffi::av_probe_input_format2(&probe, 1, &mut score);
            if format.is_null() || (*format).name.is_null() {
                return None;
            }
            let name = CStr::from_ptr((*format).name).to_string_lossy().into_owned();
            Some((name, score.max(0) as u32))
        }
    }
}

impl ContainerBackend for FfmpegBackend {
    fn probe(&self, buffer: &[u8]) -> Option<ProbeMatch> {
        self.probe_with_score(buffer).map(|(names, score)| ProbeMatch {
            // "mov,mp4,m4a,..." 取第一个名字
            format: names.split(',').next().unwrap_or_default().to_string(),
            score,
        })
    }

    fn probe_format(&self, format: &str, buffer: &[u8]) -> u32 {
        match self.probe_with_score(buffer) {
            Some((names, score)) if names.split(',').any(|name| name == format) => score,
            _ => 0,
        }
    }

    fn open(
        &self,
        format: &str,
        source: Box<dyn ByteSource>,
        options: &OpenOptions,
    ) -> std::result::Result<Box<dyn ContainerSource>, OpenError> {
        let short_name = CString::new(format).map_err(|e| OpenError::Io(e.to_string()))?;
        let io_state = Box::into_raw(Box::new(IoState {
            source,
            interrupt: options.interrupt.clone(),
        }));

        unsafe {
            let input_format = ffi::av_find_input_format(short_name.as_ptr());
            if input_format.is_null() {
                drop(Box::from_raw(io_state));
                return Err(OpenError::NoMatchingFormat);
            }

            let buffer = ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(io_state));
                return Err(OpenError::Io("无法分配 AVIO 缓冲区".to_string()));
            }

            let seekable = (*io_state).source.length().is_some();
            let mut avio = ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                0,
                io_state as *mut c_void,
                Some(read_packet),
                None,
                if seekable { Some(seek_packet) } else { None },
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(io_state));
                return Err(OpenError::Io("无法创建 AVIO 上下文".to_string()));
            }

            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                free_avio(&mut avio);
                drop(Box::from_raw(io_state));
                return Err(OpenError::Io("无法分配格式上下文".to_string()));
            }

            (*ctx).pb = avio;
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            (*ctx).max_analyze_duration = options.analyze_duration.as_micros() as i64;
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_cb),
                opaque: io_state as *mut c_void,
            };

            // 失败时 avformat_open_input 会释放 ctx
            let ret = ffi::avformat_open_input(&mut ctx, ptr::null(), input_format, ptr::null_mut());
            if ret < 0 {
                let interrupted = (*io_state).interrupt.is_interrupted();
                free_avio(&mut avio);
                drop(Box::from_raw(io_state));
                return Err(if interrupted {
                    OpenError::Interrupted
                } else {
                    OpenError::Io(ffmpeg::Error::from(ret).to_string())
                });
            }

            info!("ffmpeg 容器已打开: {}", format);
            Ok(Box::new(FfmpegContainer {
                ctx,
                avio,
                io_state,
                format: format.to_string(),
                detect_frame_rate: options.detect_frame_rate,
                eof: false,
            }))
        }
    }
}

unsafe fn free_avio(avio: &mut *mut ffi::AVIOContext) {
    if avio.is_null() {
        return;
    }
    // 缓冲区可能已被 libavformat 替换，释放当前指针
    ffi::av_freep(&mut (**avio).buffer as *mut *mut u8 as *mut c_void);
    ffi::avio_context_free(avio);
}

/// 已打开的 libavformat 容器
pub struct FfmpegContainer {
    ctx: *mut ffi::AVFormatContext,
    avio: *mut ffi::AVIOContext,
    io_state: *mut IoState,
    format: String,
    detect_frame_rate: bool,
    eof: bool,
}

// 格式上下文只由持有它的 Demuxer 在加锁后访问
unsafe impl Send for FfmpegContainer {}

impl FfmpegContainer {
    fn is_interrupted(&self) -> bool {
        unsafe { (*self.io_state).interrupt.is_interrupted() || (*self.io_state).source.is_interrupted() }
    }

    unsafe fn stream_ptr(&self, index: usize) -> Option<*mut ffi::AVStream> {
        if index >= (*self.ctx).nb_streams as usize {
            return None;
        }
        let stream = *(*self.ctx).streams.add(index);
        (!stream.is_null()).then_some(stream)
    }
}

impl ContainerSource for FfmpegContainer {
    fn format_name(&self) -> &str {
        &self.format
    }

    fn find_stream_info(&mut self) -> std::result::Result<(), OpenError> {
        let ret = unsafe { ffi::avformat_find_stream_info(self.ctx, ptr::null_mut()) };
        if ret < 0 {
            if self.is_interrupted() {
                return Err(OpenError::Interrupted);
            }
            return Err(OpenError::Analysis(ffmpeg::Error::from(ret).to_string()));
        }
        debug!("流结构分析完成: {} 个流", self.stream_count());
        Ok(())
    }

    fn read_frame(&mut self) -> std::result::Result<RawPacket, FrameReadError> {
        let mut packet = ffmpeg::Packet::empty();
        let ret = unsafe { ffi::av_read_frame(self.ctx, packet.as_mut_ptr()) };
        if ret < 0 {
            let error = map_read_error(ret, self.is_interrupted());
            if error == FrameReadError::Eof {
                self.eof = true;
            }
            return Err(error);
        }

        let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
        let mut raw = RawPacket::new(packet.stream() as i32, data);
        raw.size = packet.size() as i32;
        raw.pts = packet.pts();
        raw.dts = packet.dts();
        raw.duration = packet.duration();
        raw.keyframe = packet.is_key();
        Ok(raw)
    }

    fn stream_count(&self) -> usize {
        unsafe { (*self.ctx).nb_streams as usize }
    }

    fn stream_info(&self, index: usize) -> Option<StreamInfo> {
        unsafe {
            let stream = self.stream_ptr(index)?;
            let par = (*stream).codecpar;
            if par.is_null() {
                return None;
            }

            let codec = map_codec(codec::Id::from((*par).codec_id));
            let stream_type = match (*par).codec_type {
                _ if codec == CodecId::Teletext => StreamType::Teletext,
                ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => StreamType::Video,
                ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => StreamType::Audio,
                ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE => StreamType::Subtitle,
                ffi::AVMediaType::AVMEDIA_TYPE_DATA => StreamType::Data,
                _ => StreamType::None,
            };

            let mut info = StreamInfo::new(index, stream_type, codec);
            info.physical_id = (*stream).id;
            info.codec_tag = (*par).codec_tag;
            info.language = dict_value((*stream).metadata, c"language");
            if !(*par).extradata.is_null() && (*par).extradata_size > 0 {
                info.extradata = std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize).to_vec();
            }
            info.time_base = TimeBase::new((*stream).time_base.num, (*stream).time_base.den);
            info.start_time = ts((*stream).start_time);
            info.duration = ts((*stream).duration);
            info.width = (*par).width.max(0) as u32;
            info.height = (*par).height.max(0) as u32;

            let rate = if self.detect_frame_rate && (*stream).avg_frame_rate.den > 0 {
                (*stream).avg_frame_rate
            } else {
                (*stream).r_frame_rate
            };
            if rate.num > 0 && rate.den > 0 {
                info.fps_rate = rate.num as u32;
                info.fps_scale = rate.den as u32;
            }

            let sar = (*par).sample_aspect_ratio;
            if sar.num > 0 && sar.den > 0 && info.height > 0 {
                info.aspect = sar.num as f64 / sar.den as f64 * info.width as f64 / info.height as f64;
            }

            info.profile = (*par).profile;
            info.channels = (*par).ch_layout.nb_channels.max(0) as u32;
            info.sample_rate = (*par).sample_rate.max(0) as u32;
            info.bits_per_sample = (*par).bits_per_coded_sample.max(0) as u32;
            info.block_align = (*par).block_align.max(0) as u32;
            info.bit_rate = (*par).bit_rate.max(0) as u64;
            info.disposition = (*stream).disposition as u32;

            if (*par).codec_type == ffi::AVMediaType::AVMEDIA_TYPE_ATTACHMENT {
                info.attachment = Some(Attachment {
                    filename: dict_value((*stream).metadata, c"filename").unwrap_or_default(),
                    mime_type: dict_value((*stream).metadata, c"mimetype").unwrap_or_default(),
                    data: std::mem::take(&mut info.extradata),
                });
            }
            Some(info)
        }
    }

    fn programs(&self) -> Vec<ProgramInfo> {
        unsafe {
            let count = (*self.ctx).nb_programs as usize;
            (0..count)
                .filter_map(|i| {
                    let program = *(*self.ctx).programs.add(i);
                    if program.is_null() {
                        return None;
                    }
                    let indexes = if (*program).stream_index.is_null() {
                        Vec::new()
                    } else {
                        std::slice::from_raw_parts((*program).stream_index, (*program).nb_stream_indexes as usize)
                            .iter()
                            .map(|&i| i as usize)
                            .collect()
                    };
                    Some(ProgramInfo {
                        program_number: (*program).program_num.max(0) as u32,
                        stream_indexes: indexes,
                    })
                })
                .collect()
        }
    }

    // AV_TIME_BASE 与全局时间基一致，无需换算
    fn start_time(&self) -> Option<i64> {
        unsafe { ts((*self.ctx).start_time) }
    }

    fn duration(&self) -> Option<i64> {
        unsafe { ts((*self.ctx).duration).filter(|d| *d > 0) }
    }

    fn eof_reached(&self) -> bool {
        self.eof || unsafe { !(*self.ctx).pb.is_null() && (*(*self.ctx).pb).eof_reached != 0 }
    }

    fn clear_eof(&mut self) {
        self.eof = false;
        unsafe {
            if !(*self.ctx).pb.is_null() {
                (*(*self.ctx).pb).eof_reached = 0;
            }
        }
    }

    fn flush(&mut self) {
        unsafe {
            ffi::avformat_flush(self.ctx);
        }
    }

    fn seek(&mut self, time: i64) -> std::result::Result<(), FrameReadError> {
        let ret = unsafe { ffi::av_seek_frame(self.ctx, -1, time, ffi::AVSEEK_FLAG_BACKWARD as c_int) };
        if ret < 0 {
            warn!("av_seek_frame 失败: {}", ffmpeg::Error::from(ret));
            return Err(map_read_error(ret, self.is_interrupted()));
        }
        self.clear_eof();
        Ok(())
    }

    fn description(&self) -> String {
        unsafe {
            let long_name = if (*self.ctx).iformat.is_null() || (*(*self.ctx).iformat).long_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr((*(*self.ctx).iformat).long_name as *const c_char)
                    .to_string_lossy()
                    .into_owned()
            };
            format!("ffmpeg 容器: {} ({})", self.format, long_name)
        }
    }
}

impl Drop for FfmpegContainer {
    fn drop(&mut self) {
        unsafe {
            ffi::avformat_close_input(&mut self.ctx);
            free_avio(&mut self.avio);
            drop(Box::from_raw(self.io_state));
        }
        debug!("ffmpeg 容器已释放: {}", self.format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_mapping() {
        assert_eq!(map_codec(codec::Id::H264), CodecId::H264);
        assert_eq!(map_codec(codec::Id::SUBRIP), CodecId::Text);
        assert_eq!(map_codec(codec::Id::None), CodecId::None);
        assert!(matches!(map_codec(codec::Id::PNG), CodecId::Other(_)));
    }

    #[test]
    fn test_read_error_mapping() {
        assert_eq!(map_read_error(ffi::AVERROR_EOF, false), FrameReadError::Eof);
        assert_eq!(map_read_error(ffi::AVERROR_EXIT, false), FrameReadError::Interrupted);
        assert_eq!(map_read_error(ffi::AVERROR_EOF, true), FrameReadError::Interrupted);
        assert_eq!(
            map_read_error(ffi::AVERROR(ffmpeg::util::error::EAGAIN), false),
            FrameReadError::WouldBlock
        );
    }

    #[test]
    fn test_nopts_is_none() {
        assert_eq!(ts(ffi::AV_NOPTS_VALUE), None);
        assert_eq!(ts(42), Some(42));
    }
}

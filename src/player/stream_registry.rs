use crate::core::{CodecId, StreamType};
use crate::player::demuxer_source::{Attachment, StreamInfo};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 视频流参数
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDetails {
    pub width: u32,
    pub height: u32,
    pub fps_rate: u32,
    pub fps_scale: u32,
    pub aspect: f64,
    pub profile: i32,
}

/// 音频流参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDetails {
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,
    pub bit_rate: u64,
}

/// 按流类型区分的参数
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDetails {
    Video(VideoDetails),
    Audio(AudioDetails),
    Subtitle,
    Teletext,
    Data,
    None,
}

/// 流描述符（对外发布的快照，创建后不可变）
///
/// 参数变化时注册表会生成新的描述符替换旧的，持有旧 `Arc` 的一方不受影响。
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    /// 连续 ID
    pub id: i32,
    /// 容器内的流索引
    pub source_index: usize,
    /// 容器内的物理 ID（TS 的 PID）
    pub physical_id: i32,
    pub codec: CodecId,
    pub codec_tag: u32,
    pub language: Option<String>,
    pub extradata: Vec<u8>,
    pub disposition: u32,
    pub details: StreamDetails,
    /// 提取出的字体附件路径
    pub font_path: Option<PathBuf>,
}

impl StreamDescriptor {
    fn from_info(id: i32, info: &StreamInfo, font_path: Option<PathBuf>) -> Self {
        let details = match info.stream_type {
            StreamType::Video => StreamDetails::Video(VideoDetails {
                width: info.width,
                height: info.height,
                fps_rate: info.fps_rate,
                fps_scale: info.fps_scale,
                aspect: info.aspect,
                profile: info.profile,
            }),
            StreamType::Audio => StreamDetails::Audio(AudioDetails {
                channels: info.channels,
                sample_rate: info.sample_rate,
                bits_per_sample: info.bits_per_sample,
                block_align: info.block_align,
                bit_rate: info.bit_rate,
            }),
            StreamType::Subtitle => StreamDetails::Subtitle,
            StreamType::Teletext => StreamDetails::Teletext,
            StreamType::Data => StreamDetails::Data,
            StreamType::None => StreamDetails::None,
        };

        Self {
            id,
            source_index: info.index,
            physical_id: info.physical_id,
            codec: info.codec,
            codec_tag: info.codec_tag,
            language: info.language.clone(),
            extradata: info.extradata.clone(),
            disposition: info.disposition,
            details,
            font_path,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        match self.details {
            StreamDetails::Video(_) => StreamType::Video,
            StreamDetails::Audio(_) => StreamType::Audio,
            StreamDetails::Subtitle => StreamType::Subtitle,
            StreamDetails::Teletext => StreamType::Teletext,
            StreamDetails::Data => StreamType::Data,
            StreamDetails::None => StreamType::None,
        }
    }

    pub fn video(&self) -> Option<&VideoDetails> {
        match &self.details {
            StreamDetails::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioDetails> {
        match &self.details {
            StreamDetails::Audio(a) => Some(a),
            _ => None,
        }
    }

    /// 描述符是否仍然与容器的实时参数一致
    pub fn matches(&self, info: &StreamInfo) -> bool {
        if self.codec != info.codec || self.stream_type() != info.stream_type {
            return false;
        }
        match &self.details {
            StreamDetails::Audio(a) => a.channels == info.channels && a.sample_rate == info.sample_rate,
            StreamDetails::Video(v) => v.width == info.width && v.height == info.height,
            _ => true,
        }
    }
}

/// 解析结果
#[derive(Debug, Clone)]
pub struct Resolved {
    pub descriptor: Arc<StreamDescriptor>,
    /// 这次解析替换了旧描述符（参数变化）
    pub replaced: bool,
}

/// 流注册表：容器流索引 -> 描述符
///
/// 连续 ID 单调递增，从不复用；描述符被替换时沿用原槽位的 ID。
pub struct StreamRegistry {
    streams: BTreeMap<usize, Arc<StreamDescriptor>>,
    next_id: i32,
    font_dir: PathBuf,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_font_dir(std::env::temp_dir().join("myy_pipeline_fonts"))
    }

    pub fn with_font_dir(font_dir: PathBuf) -> Self {
        Self {
            streams: BTreeMap::new(),
            next_id: 0,
            font_dir,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, source_index: usize) -> Option<Arc<StreamDescriptor>> {
        self.streams.get(&source_index).cloned()
    }

    /// 按连续 ID 查找
    pub fn by_id(&self, id: i32) -> Option<Arc<StreamDescriptor>> {
        self.streams.values().find(|s| s.id == id).cloned()
    }

    /// 所有描述符（按容器索引排序）
    pub fn descriptors(&self) -> Vec<Arc<StreamDescriptor>> {
        self.streams.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    /// 为容器流创建描述符（已存在时替换，ID 沿用）
    pub fn create(&mut self, info: &StreamInfo) -> Arc<StreamDescriptor> {
        let id = match self.streams.get(&info.index) {
            Some(existing) => existing.id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };

        let font_path = info
            .attachment
            .as_ref()
            .filter(|a| a.is_font() || info.codec == CodecId::Ttf)
            .and_then(|a| self.extract_font(a));

        let descriptor = Arc::new(StreamDescriptor::from_info(id, info, font_path));
        debug!(
            "创建流描述符: index={} id={} type={:?} codec={}",
            info.index,
            id,
            info.stream_type,
            info.codec.name()
        );
        self.streams.insert(info.index, descriptor.clone());
        descriptor
    }

    /// 丢弃全部描述符并按给定流信息重建（节目切换时使用）
    pub fn rebuild<I>(&mut self, infos: I)
    where
        I: IntoIterator<Item = StreamInfo>,
    {
        self.streams.clear();
        for info in infos {
            self.create(&info);
        }
        info!("流注册表已重建，共 {} 路流", self.streams.len());
    }

    /// 解析容器索引对应的描述符
    ///
    /// - 已有且参数一致：直接返回
    /// - 已有但参数变化：替换为新描述符
    /// - 没有：创建
    /// - 容器已不认识这个索引（info 为 None）：返回已有描述符，否则 None
    pub fn resolve_or_create(&mut self, source_index: usize, info: Option<&StreamInfo>) -> Option<Resolved> {
        let existing = self.streams.get(&source_index).cloned();
        let Some(info) = info else {
            return existing.map(|descriptor| Resolved {
                descriptor,
                replaced: false,
            });
        };

        match existing {
            Some(descriptor) if descriptor.matches(info) => Some(Resolved {
                descriptor,
                replaced: false,
            }),
            Some(old) => {
                info!(
                    "流参数变化，替换描述符: index={} id={} codec {} -> {}",
                    source_index,
                    old.id,
                    old.codec.name(),
                    info.codec.name()
                );
                Some(Resolved {
                    descriptor: self.create(info),
                    replaced: true,
                })
            }
            None => Some(Resolved {
                descriptor: self.create(info),
                replaced: false,
            }),
        }
    }

    /// 把字体附件写到临时目录，失败只记录警告
    fn extract_font(&self, attachment: &Attachment) -> Option<PathBuf> {
        let name = Path::new(&attachment.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())?;

        if let Err(e) = fs::create_dir_all(&self.font_dir) {
            warn!("无法创建字体目录 {:?}: {}", self.font_dir, e);
            return None;
        }

        let path = self.font_dir.join(name);
        if path.exists() {
            return Some(path);
        }
        match fs::write(&path, &attachment.data) {
            Ok(()) => {
                info!("📎 已提取字体附件: {:?}", path);
                Some(path)
            }
            Err(e) => {
                warn!("写入字体附件失败 {:?}: {}", path, e);
                None
            }
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_fixtures::{audio_info, video_info};

    #[test]
    fn test_ids_are_monotonic_and_stable() {
        let mut registry = StreamRegistry::new();
        let v = registry.resolve_or_create(0, Some(&video_info(0, 1920, 1080))).unwrap();
        let a = registry.resolve_or_create(1, Some(&audio_info(1, 2, 48_000))).unwrap();
        assert_eq!(v.descriptor.id, 0);
        assert_eq!(a.descriptor.id, 1);

        // 再次解析：同一个描述符
        let again = registry.resolve_or_create(0, Some(&video_info(0, 1920, 1080))).unwrap();
        assert!(!again.replaced);
        assert!(Arc::ptr_eq(&again.descriptor, &v.descriptor));
    }

    #[test]
    fn test_resolution_change_replaces_descriptor() {
        let mut registry = StreamRegistry::new();
        let first = registry.resolve_or_create(0, Some(&video_info(0, 1280, 720))).unwrap();
        let second = registry.resolve_or_create(0, Some(&video_info(0, 1920, 1080))).unwrap();

        assert!(second.replaced);
        assert_eq!(second.descriptor.id, first.descriptor.id);
        assert_eq!(second.descriptor.video().unwrap().width, 1920);
        // 旧快照不受影响
        assert_eq!(first.descriptor.video().unwrap().width, 1280);
    }

    #[test]
    fn test_audio_channel_change_replaces_descriptor() {
        let mut registry = StreamRegistry::new();
        registry.resolve_or_create(3, Some(&audio_info(3, 2, 48_000))).unwrap();
        let changed = registry.resolve_or_create(3, Some(&audio_info(3, 6, 48_000))).unwrap();
        assert!(changed.replaced);
        assert_eq!(changed.descriptor.audio().unwrap().channels, 6);
    }

    #[test]
    fn test_ids_not_reused_after_rebuild() {
        let mut registry = StreamRegistry::new();
        registry.rebuild(vec![video_info(0, 640, 480), audio_info(1, 2, 44_100)]);
        registry.rebuild(vec![video_info(0, 640, 480)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(0).unwrap().id, 2);
    }

    #[test]
    fn test_unknown_index_without_info() {
        let mut registry = StreamRegistry::new();
        assert!(registry.resolve_or_create(7, None).is_none());
    }

    #[test]
    fn test_font_attachment_extracted() {
        let dir = std::env::temp_dir().join(format!("myy_fonts_test_{}", std::process::id()));
        let mut registry = StreamRegistry::with_font_dir(dir.clone());

        let mut info = StreamInfo::new(4, StreamType::None, CodecId::Ttf);
        info.attachment = Some(Attachment {
            filename: "sub/../Arial.ttf".to_string(),
            mime_type: "application/x-truetype-font".to_string(),
            data: vec![0, 1, 0, 0],
        });
        let descriptor = registry.create(&info);

        let path = descriptor.font_path.clone().unwrap();
        assert_eq!(path, dir.join("Arial.ttf"));
        assert_eq!(fs::read(&path).unwrap(), vec![0, 1, 0, 0]);
        let _ = fs::remove_dir_all(dir);
    }
}

use std::any::Any;
use std::fmt::Debug;

use bytes::BytesMut;

use crate::codec::MediaKind;

/// Backend-owned picture or sample storage carried by a [`Frame`].
///
/// The core never looks inside; transform stages built on the same backend
/// downcast through [`FrameData::as_any`].
pub trait FrameData: Any + Send + Sync + Debug {
    /// Deep copy of the underlying storage.
    fn copy(&self) -> Box<dyn FrameData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Plain byte planes, used by backends that do not have a native frame type.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Planes {
    pub planes: Vec<BytesMut>,
    pub linesize: Vec<usize>,
}

impl FrameData for Planes {
    fn copy(&self) -> Box<dyn FrameData> {
        Box::new(Planes {
            planes: self
                .planes
                .iter()
                .map(|plane| BytesMut::from(&plane[..]))
                .collect(),
            linesize: self.linesize.clone(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One unit of decoded media. Same single-owner rules as [`crate::Packet`]:
/// stages reuse one working frame per emission, so keep a [`Frame::copy`]
/// if you need it after the callback returns.
#[derive(Debug)]
pub struct Frame {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub key: bool,
    pub stream_index: usize,
    // video
    pub width: u32,
    pub height: u32,
    /// Pixel or sample format in backend numbering.
    pub format: i32,
    // audio
    pub nb_samples: usize,
    pub sample_rate: u32,
    pub channels: u16,
    data: Box<dyn FrameData>,
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

impl Frame {
    pub fn empty() -> Self {
        Self::with_data(Box::new(Planes::default()))
    }

    pub fn with_data(data: Box<dyn FrameData>) -> Self {
        Self {
            kind: MediaKind::Unknown,
            pts: None,
            key: false,
            stream_index: 0,
            width: 0,
            height: 0,
            format: -1,
            nb_samples: 0,
            sample_rate: 0,
            channels: 0,
            data,
        }
    }

    pub fn video(width: u32, height: u32, format: i32, data: Box<dyn FrameData>) -> Self {
        Self {
            kind: MediaKind::Video,
            width,
            height,
            format,
            ..Self::with_data(data)
        }
    }

    pub fn audio(
        nb_samples: usize,
        sample_rate: u32,
        channels: u16,
        format: i32,
        data: Box<dyn FrameData>,
    ) -> Self {
        Self {
            kind: MediaKind::Audio,
            nb_samples,
            sample_rate,
            channels,
            format,
            ..Self::with_data(data)
        }
    }

    pub fn copy(&self) -> Self {
        Self {
            kind: self.kind,
            pts: self.pts,
            key: self.key,
            stream_index: self.stream_index,
            width: self.width,
            height: self.height,
            format: self.format,
            nb_samples: self.nb_samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            data: self.data.copy(),
        }
    }

    pub fn data(&self) -> &dyn FrameData {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> &mut dyn FrameData {
        self.data.as_mut()
    }

    pub fn downcast_ref<T: FrameData>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: FrameData>(&mut self) -> Option<&mut T> {
        self.data.as_any_mut().downcast_mut::<T>()
    }

    pub fn set_data(&mut self, data: Box<dyn FrameData>) {
        self.data = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_is_deep() {
        let planes = Planes {
            planes: vec![BytesMut::from(&b"luma"[..]), BytesMut::from(&b"chroma"[..])],
            linesize: vec![4, 6],
        };
        let mut working = Frame::video(2, 2, 0, Box::new(planes));
        working.pts = Some(40);

        let stored = working.copy();
        working
            .downcast_mut::<Planes>()
            .unwrap()
            .planes[0]
            .copy_from_slice(b"XXXX");
        working.pts = Some(80);

        let stored_planes = stored.downcast_ref::<Planes>().unwrap();
        assert_eq!(&stored_planes.planes[0][..], b"luma");
        assert_eq!(stored.pts, Some(40));
        assert_eq!(stored.kind, MediaKind::Video);
    }

    #[test]
    fn test_downcast_wrong_type() {
        #[derive(Debug)]
        struct Other;
        impl FrameData for Other {
            fn copy(&self) -> Box<dyn FrameData> {
                Box::new(Other)
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        let frame = Frame::with_data(Box::new(Other));
        assert!(frame.downcast_ref::<Planes>().is_none());
        assert!(frame.downcast_ref::<Other>().is_some());
    }
}

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow, bail, ensure};
use image::{
    Delay, DynamicImage, RgbImage,
    codecs::gif::{GifEncoder, Repeat},
};
use tracing::{debug, info};

pub const VIDEO_FPS: u32 = 20;

/// Where rollout videos go. The two output modes are exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VideoTarget {
    #[default]
    None,
    /// One animated GIF per environment inside this directory.
    PerEnv(PathBuf),
    /// A single stream shared by every environment.
    Shared(PathBuf),
}

impl VideoTarget {
    /// Output file for `env_name`.
    pub fn path_for(&self, env_name: &str, epoch: Option<usize>) -> Option<PathBuf> {
        match self {
            VideoTarget::None => None,
            VideoTarget::PerEnv(dir) => Some(match epoch {
                Some(e) => dir.join(format!("{env_name}_epoch_{e}.gif")),
                None => dir.join(format!("{env_name}.gif")),
            }),
            VideoTarget::Shared(path) => Some(path.clone()),
        }
    }
}

/// Animated GIF writer at [`VIDEO_FPS`]. The file is created on the first
/// frame and finalised when the sink is dropped.
pub struct VideoSink {
    path: PathBuf,
    encoder: Option<GifEncoder<BufWriter<File>>>,
    size: Option<(u32, u32)>,
    frames: usize,
}

impl VideoSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            encoder: None,
            size: None,
            frames: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// # Errors
    /// Every frame must have the size of the first one.
    pub fn write_frame(&mut self, image: &RgbImage) -> Result<()> {
        let dims = image.dimensions();
        match self.size {
            Some(size) => ensure!(
                size == dims,
                "video frame {:?} does not match stream size {:?}",
                dims,
                size
            ),
            None => self.size = Some(dims),
        }
        if self.encoder.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&self.path)
                .map_err(|e| anyhow!("failed to create video {:?}: {e}", self.path))?;
            let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
            encoder.set_repeat(Repeat::Infinite)?;
            info!("video writes to {:?}", self.path);
            self.encoder = Some(encoder);
        }
        let Some(encoder) = self.encoder.as_mut() else {
            bail!("video encoder for {:?} is not open", self.path);
        };
        let rgba = DynamicImage::ImageRgb8(image.clone()).to_rgba8();
        let delay = Delay::from_numer_denom_ms(1000 / VIDEO_FPS, 1);
        encoder.encode_frame(image::Frame::from_parts(rgba, 0, 0, delay))?;
        self.frames += 1;
        Ok(())
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if self.encoder.take().is_some() {
            debug!("closed video {:?} after {} frames", self.path, self.frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_env_paths() {
        let target = VideoTarget::PerEnv(PathBuf::from("/videos"));
        assert_eq!(
            target.path_for("Reach", Some(20)),
            Some(PathBuf::from("/videos/Reach_epoch_20.gif"))
        );
        assert_eq!(
            target.path_for("Reach", None),
            Some(PathBuf::from("/videos/Reach.gif"))
        );
        let shared = VideoTarget::Shared(PathBuf::from("/all.gif"));
        assert_eq!(shared.path_for("A", Some(1)), shared.path_for("B", Some(2)));
        assert_eq!(VideoTarget::None.path_for("A", None), None);
    }

    #[test]
    fn sink_is_lazy_and_writes_gif() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.gif");
        {
            let mut sink = VideoSink::new(&path);
            assert!(!path.exists());
            let frame = RgbImage::from_pixel(8, 4, image::Rgb([10, 20, 30]));
            sink.write_frame(&frame)?;
            sink.write_frame(&frame)?;
            assert_eq!(sink.frames(), 2);
            assert!(sink.write_frame(&RgbImage::new(4, 4)).is_err());
        }
        let bytes = std::fs::read(&path)?;
        assert!(bytes.starts_with(b"GIF89a"));
        Ok(())
    }
}

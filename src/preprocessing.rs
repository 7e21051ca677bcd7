use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
    DynamicImage, ImageError, ImageFormat, RgbImage,
};
use ndarray::Array4;
use thiserror::Error;

pub const INPUT_WIDTH: u32 = 240;
pub const INPUT_HEIGHT: u32 = 159;

/// Per-channel mean, indexed in the model's (BGR) channel order.
pub const MEAN: [f32; 3] = [108.0, 103.0, 296.0];
pub const RAW_SCALE: f32 = 255.0;
/// Output channel `c` is read from RGB channel `CHANNEL_SWAP[c]`.
pub const CHANNEL_SWAP: [usize; 3] = [2, 1, 0];
pub const REENCODE_QUALITY: u8 = 75;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image has no pixels")]
    EmptyImage,
    #[error("failed to re-encode image: {0}")]
    Encode(ImageError),
    #[error("failed to reload re-encoded image: {0}")]
    Decode(ImageError),
    #[error("expected a {expected:?} image, got {actual:?}")]
    Dimensions {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Fixed transformation from an uploaded photo to the classifier's
/// `1x3xHxW` input.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    mean: [f32; 3],
    raw_scale: f32,
    channel_swap: [usize; 3],
    reencode_quality: Option<u8>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            width: INPUT_WIDTH,
            height: INPUT_HEIGHT,
            mean: MEAN,
            raw_scale: RAW_SCALE,
            channel_swap: CHANNEL_SWAP,
            reencode_quality: Some(REENCODE_QUALITY),
        }
    }
}

impl Preprocessor {
    /// Same constants, without the lossy JPEG re-encode between resize and
    /// tensor construction.
    pub fn without_reencode() -> Self {
        Self {
            reencode_quality: None,
            ..Self::default()
        }
    }

    pub fn input_shape(&self) -> (usize, usize, usize, usize) {
        (1, 3, self.height as usize, self.width as usize)
    }

    pub fn prepare(&self, photo: DynamicImage) -> Result<Array4<f32>, PreprocessError> {
        let photo = photo.to_rgb8();
        let (width, height) = photo.dimensions();

        // Every photo is turned, whatever its orientation.
        if width < height {
            tracing::info!("Image is horizontal - rotating to vertical...");
        }
        let photo = rotate_or_keep(photo, rotate_quarter_turn);

        tracing::info!(
            "Resizing the image to {}x{} pixels...",
            self.width,
            self.height
        );
        let photo = self.resize(&photo)?;

        tracing::info!("Loading image into the input tensor...");
        let photo = match self.reencode_quality {
            Some(quality) => reencode(&photo, quality)?,
            None => photo,
        };

        self.to_tensor(&photo)
    }

    fn resize(&self, photo: &RgbImage) -> Result<RgbImage, PreprocessError> {
        if photo.width() == 0 || photo.height() == 0 {
            return Err(PreprocessError::EmptyImage);
        }
        Ok(imageops::resize(
            photo,
            self.width,
            self.height,
            FilterType::CatmullRom,
        ))
    }

    /// Builds the CHW tensor: channel swap, then raw scale, then mean
    /// subtraction, pixels being read as `[0, 1]` floats.
    pub fn to_tensor(&self, photo: &RgbImage) -> Result<Array4<f32>, PreprocessError> {
        if photo.dimensions() != (self.width, self.height) {
            return Err(PreprocessError::Dimensions {
                expected: (self.width, self.height),
                actual: photo.dimensions(),
            });
        }

        let mut input = Array4::zeros(self.input_shape());
        for (x, y, pixel) in photo.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for (channel, &source) in self.channel_swap.iter().enumerate() {
                let value = f32::from(pixel[source]) / 255.;
                input[[0, channel, y, x]] = value * self.raw_scale - self.mean[channel];
            }
        }

        Ok(input)
    }
}

/// Turns the photo 90 degrees counter-clockwise on a canvas of the same size,
/// centered, with uncovered areas left black.
pub fn rotate_quarter_turn(photo: &RgbImage) -> Result<RgbImage, PreprocessError> {
    let (width, height) = photo.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage);
    }

    let turned = imageops::rotate270(photo);
    let mut canvas = RgbImage::new(width, height);
    let x = (i64::from(width) - i64::from(height)) / 2;
    let y = (i64::from(height) - i64::from(width)) / 2;
    imageops::replace(&mut canvas, &turned, x, y);

    Ok(canvas)
}

/// Applies `rotate`, falling back to the untouched photo when it fails.
pub fn rotate_or_keep<F>(photo: RgbImage, rotate: F) -> RgbImage
where
    F: FnOnce(&RgbImage) -> Result<RgbImage, PreprocessError>,
{
    match rotate(&photo) {
        Ok(rotated) => rotated,
        Err(err) => {
            tracing::error!("Rotation failed, keeping original orientation: {}", err);
            photo
        }
    }
}

fn reencode(photo: &RgbImage, quality: u8) -> Result<RgbImage, PreprocessError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(photo)
        .map_err(PreprocessError::Encode)?;

    let reloaded = image::load_from_memory_with_format(&buffer, ImageFormat::Jpeg)
        .map_err(PreprocessError::Decode)?;

    Ok(reloaded.to_rgb8())
}

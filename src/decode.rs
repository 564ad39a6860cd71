use std::fmt;
use std::io::Cursor;

use anyhow::{anyhow, bail};
use image::{GenericImageView, ImageReader, RgbImage};
use jpeg_decoder::PixelFormat;
use log::{debug, info, warn};

use crate::preprocessing::{normalize, resize_exact_bilinear, CanonicalTensor, Preprocessor, IMAGE_INPUT_SIZE};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const HEADER_BYTES: usize = 10;
// Same ceiling as the `image` crate's default decoding limit.
const MAX_DECODED_BYTES: usize = 512 * 1024 * 1024;

/// Which strategy produced a tensor. Vectors from different paths are not
/// directly comparable: the two paths resize differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath
{
    Primary,
    Fallback,
}

impl fmt::Display for DecodePath
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            DecodePath::Primary => write!(f, "primary"),
            DecodePath::Fallback => write!(f, "fallback"),
        }
    }
}

/// Turns raw image bytes into the model input.
/// Each strategy owns both its codec and its geometry.
pub trait DecodeStrategy: Send + Sync
{
    fn name(&self) -> &'static str;

    fn load(&self, bytes: &[u8]) -> anyhow::Result<CanonicalTensor>;
}

/// Decodes with the `image` crate, sniffing the format from the bytes
/// (never the file extension), then runs the standard `Preprocessor`.
#[derive(Debug, Default)]
pub struct PrimaryDecoder
{
    preprocessor: Preprocessor,
}

impl DecodeStrategy for PrimaryDecoder
{
    fn name(&self) -> &'static str
    {
        "image"
    }

    fn load(&self, bytes: &[u8]) -> anyhow::Result<CanonicalTensor>
    {
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let format = reader.format();
        let image = reader.decode()?;

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            bail!("Decoded image has no pixels ({}x{})", width, height);
        }
        info!("Image opened successfully - Format: {:?}, Size: {}x{}, Color: {:?}", format, width, height, image.color());

        self.preprocessor.preprocess(&image.to_rgb8())
    }
}

/// Decodes JPEG data with `jpeg-decoder`, a codec independent of the one the
/// `image` crate uses, then resizes straight to 224x224 without cropping.
///
/// Only JPEG is read here. A PNG, BMP, TIFF or WebP file that the primary
/// decoder rejects has no second chance and ends as a decode error.
#[derive(Debug, Default)]
pub struct FallbackDecoder;

impl DecodeStrategy for FallbackDecoder
{
    fn name(&self) -> &'static str
    {
        "jpeg-decoder"
    }

    fn load(&self, bytes: &[u8]) -> anyhow::Result<CanonicalTensor>
    {
        let image = decode_jpeg(bytes)?;
        info!("Image loaded with fallback decoder - Size: {}x{}", image.width(), image.height());

        let resized = resize_exact_bilinear(&image, IMAGE_INPUT_SIZE);
        Ok(normalize(resized.view()))
    }
}

fn decode_jpeg(bytes: &[u8]) -> anyhow::Result<RgbImage>
{
    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
    decoder.set_max_decoding_buffer_size(MAX_DECODED_BYTES);
    let pixels = decoder.decode()?;
    let info = decoder.info().ok_or(anyhow!("JPEG decoder returned no image info"))?;
    let (width, height) = (info.width as u32, info.height as u32);
    if width == 0 || height == 0 {
        bail!("Decoded JPEG has no pixels ({}x{})", width, height);
    }
    debug!("jpeg-decoder pixel format: {:?}", info.pixel_format);

    #[allow(unreachable_patterns)]
    let rgb: Vec<u8> = match info.pixel_format {
        PixelFormat::RGB24 => pixels,
        PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        // Big-endian; the high byte is the 8-bit value.
        PixelFormat::L16 => pixels.chunks_exact(2).flat_map(|l| [l[0], l[0], l[0]]).collect(),
        PixelFormat::CMYK32 => pixels.chunks_exact(4).flat_map(cmyk_to_rgb).collect(),
        other => bail!("Unsupported JPEG pixel format {:?}", other),
    };

    RgbImage::from_raw(width, height, rgb)
        .ok_or(anyhow!("JPEG pixel buffer does not match {}x{}", width, height))
}

fn cmyk_to_rgb(cmyk: &[u8]) -> [u8; 3]
{
    let k = 1.0 - cmyk[3] as f64 / 255.0;
    let channel = |v: u8| (255.0 * (1.0 - v as f64 / 255.0) * k).round() as u8;
    [channel(cmyk[0]), channel(cmyk[1]), channel(cmyk[2])]
}

/// What the first bytes of a file say about it. Logged before decoding; never
/// used to pick a decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderInfo
{
    pub hex: String,
    pub has_jpeg_marker: bool,
    pub kind: Option<String>,
    pub dimensions: Option<(usize, usize)>,
}

impl HeaderInfo
{
    pub fn inspect(bytes: &[u8]) -> Self
    {
        let hex = bytes.iter()
            .take(HEADER_BYTES)
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");

        HeaderInfo {
            hex,
            has_jpeg_marker: bytes.starts_with(&JPEG_SOI),
            kind: imagesize::image_type(bytes).ok().map(|kind| format!("{:?}", kind)),
            dimensions: imagesize::blob_size(bytes).ok().map(|size| (size.width, size.height)),
        }
    }

    pub fn log(&self)
    {
        info!("File header (hex): {}", self.hex);
        if !self.has_jpeg_marker {
            warn!("File doesn't have JPEG header markers (FF D8)");
        }
        match (&self.kind, self.dimensions) {
            (Some(kind), Some((width, height))) => info!("Header reports {} image, {}x{}", kind, width, height),
            (Some(kind), None) => info!("Header reports {} image", kind),
            _ => warn!("Unrecognized image header"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb};

    use super::*;

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8>
    {
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, format).unwrap();
        bytes.into_inner()
    }

    fn photo(width: u32, height: u32) -> DynamicImage
    {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn primary_decodes_jpeg_and_png()
    {
        let decoder = PrimaryDecoder::default();
        for format in [ImageFormat::Jpeg, ImageFormat::Png] {
            let tensor = decoder.load(&encode(photo(500, 375), format)).unwrap();
            assert_eq!(tensor.view().dim(), (1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE));
        }
    }

    #[test]
    fn fallback_decodes_jpeg()
    {
        let tensor = FallbackDecoder.load(&encode(photo(500, 375), ImageFormat::Jpeg)).unwrap();
        assert_eq!(tensor.view().dim(), (1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE));
        assert!(tensor.view().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn fallback_expands_grayscale_to_three_channels()
    {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(300, 200, Luma([90])));
        let tensor = FallbackDecoder.load(&encode(gray, ImageFormat::Jpeg)).unwrap();

        let view = tensor.view();
        let pixel: Vec<f64> = (0..3).map(|c| view[[0, c, 100, 100]] * crate::preprocessing::IMAGENET_STD[c]
            + crate::preprocessing::IMAGENET_MEAN[c]).collect();
        assert!((pixel[0] - pixel[1]).abs() < 1e-12);
        assert!((pixel[1] - pixel[2]).abs() < 1e-12);
    }

    #[test]
    fn fallback_rejects_non_jpeg()
    {
        assert!(FallbackDecoder.load(&encode(photo(64, 64), ImageFormat::Png)).is_err());
    }

    #[test]
    fn primary_rejects_extreme_aspect_ratio()
    {
        let thin = DynamicImage::ImageRgb8(RgbImage::new(1, 70_000));
        let message = PrimaryDecoder::default().load(&encode(thin, ImageFormat::Png)).unwrap_err().to_string();
        assert!(message.contains("pixel limit"), "{}", message);
    }

    #[test]
    fn both_decoders_reject_garbage()
    {
        let garbage = b"\xFF\xD8 this is not really a jpeg at all".to_vec();
        assert!(PrimaryDecoder::default().load(&garbage).is_err());
        assert!(FallbackDecoder.load(&garbage).is_err());
    }

    #[test]
    fn paths_use_different_geometry()
    {
        let bytes = encode(photo(500, 375), ImageFormat::Jpeg);
        let primary = PrimaryDecoder::default().load(&bytes).unwrap();
        let fallback = FallbackDecoder.load(&bytes).unwrap();
        assert_ne!(primary, fallback);
    }

    #[test]
    fn cmyk_conversion()
    {
        assert_eq!(cmyk_to_rgb(&[0, 0, 0, 0]), [255, 255, 255]);
        assert_eq!(cmyk_to_rgb(&[0, 0, 0, 255]), [0, 0, 0]);
        assert_eq!(cmyk_to_rgb(&[255, 0, 0, 0]), [0, 255, 255]);
    }

    #[test]
    fn header_info_for_jpeg()
    {
        let info = HeaderInfo::inspect(&encode(photo(500, 375), ImageFormat::Jpeg));
        assert!(info.has_jpeg_marker);
        assert!(info.hex.starts_with("FF D8"));
        assert_eq!(info.hex.split(' ').count(), HEADER_BYTES);
        assert_eq!(info.dimensions, Some((500, 375)));
        assert_eq!(info.kind.as_deref(), Some("Jpeg"));
    }

    #[test]
    fn header_info_for_short_garbage()
    {
        let info = HeaderInfo::inspect(b"abc");
        assert_eq!(info.hex, "61 62 63");
        assert!(!info.has_jpeg_marker);
        assert_eq!(info.dimensions, None);
    }
}

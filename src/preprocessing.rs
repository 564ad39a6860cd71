/// Preprocessing functions that turn decoded pixels into the input tensor of the
/// ResNet backbone. Every value leaves this module as an f64; nothing here
/// goes through a narrower float type.

use anyhow::{anyhow, bail};
use image::{imageops::{self, FilterType}, RgbImage};
use log::{debug, error};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

pub const RESIZE_SHORTER_SIDE: u32 = 256;
pub const IMAGE_INPUT_SIZE: usize = 224;
pub const FEATURE_VECTOR_LENGTH: usize = 2048;

// Largest intermediate image the primary resize may allocate (about 200 MB of RGB).
pub const MAX_RESIZE_PIXELS: u64 = 1 << 26;

// ImageNet statistics, in RGB order.
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// The model input for a single image: shape (1, 3, 224, 224), channel-first,
/// normalized by the ImageNet mean and standard deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTensor(Array4<f64>);

impl CanonicalTensor
{
	/// Panics if the array does not have the canonical shape.
	pub fn new(array: Array4<f64>) -> Self
	{
		assert_eq!(
			array.dim(),
			(1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE),
			"canonical tensor must be (1, 3, {0}, {0})", IMAGE_INPUT_SIZE);

		let non_finite = array.iter().filter(|v| !v.is_finite()).count();
		if non_finite > 0 {
			error!("Canonical tensor contains {} non-finite values after f64 conversion", non_finite);
		}

		CanonicalTensor(array)
	}

	pub fn view(&self) -> ArrayView4<'_, f64>
	{
		self.0.view()
	}

	/// Flattened values in (batch, channel, row, column) order.
	pub fn to_vec(&self) -> Vec<f64>
	{
		self.0.iter().copied().collect()
	}
}

/// The deterministic pipeline used on the primary decode path:
/// shorter side to 256, center crop to 224x224, normalize.
#[derive(Debug, Default, Clone, Copy)]
pub struct Preprocessor;

impl Preprocessor
{
	/// Fails, without allocating, when the aspect ratio is so extreme that the
	/// intermediate resize would exceed `MAX_RESIZE_PIXELS`.
	pub fn preprocess(&self, image: &RgbImage) -> anyhow::Result<CanonicalTensor>
	{
		let (width, height) = image.dimensions();
		let (new_width, new_height) = shorter_side_dimensions(width, height, RESIZE_SHORTER_SIDE)?;
		if new_width as u64 * new_height as u64 > MAX_RESIZE_PIXELS {
			bail!("Resizing {}x{} to {}x{} exceeds the {} pixel limit",
				width, height, new_width, new_height, MAX_RESIZE_PIXELS);
		}
		let resized = imageops::resize(image, new_width, new_height, FilterType::Triangle);

		let crop = IMAGE_INPUT_SIZE as u32;
		let left = crop_offset(new_width, crop);
		let top = crop_offset(new_height, crop);
		let cropped = imageops::crop_imm(&resized, left, top, crop, crop).to_image();

		debug!("Resized {}x{} -> {}x{}, cropped at ({}, {})", width, height, new_width, new_height, left, top);

		Ok(normalize(rgb_to_array(&cropped).view()))
	}
}

/// Dimensions that scale the shorter side to `target` and keep the aspect ratio.
/// The longer side is truncated, not rounded. Errors if either side is zero
/// or the longer side does not fit in a u32.
pub fn shorter_side_dimensions(width: u32, height: u32, target: u32) -> anyhow::Result<(u32, u32)>
{
	if width == 0 || height == 0 {
		bail!("Cannot resize an image with no pixels ({}x{})", width, height);
	}

	let (shorter, longer) = (width.min(height) as u64, width.max(height) as u64);
	let scaled = u32::try_from(longer * target as u64 / shorter)
		.map_err(|_| anyhow!("Resizing {}x{} overflows the longer side", width, height))?;

	if width <= height {
		Ok((target, scaled))
	} else {
		Ok((scaled, target))
	}
}

/// Offset of a centered window of `size` within `dimension`; halves round to even.
pub fn crop_offset(dimension: u32, size: u32) -> u32
{
	(dimension.saturating_sub(size) as f64 / 2.0).round_ties_even() as u32
}

/// Pixel values as an (height, width, 3) array on the 0..=255 scale.
pub fn rgb_to_array(image: &RgbImage) -> Array3<f64>
{
	let (width, height) = image.dimensions();
	let mut pixels = Array3::zeros((height as usize, width as usize, 3));
	for (x, y, pixel) in image.enumerate_pixels() {
		let [r, g, b] = pixel.0;
		pixels[[y as usize, x as usize, 0]] = r as f64;
		pixels[[y as usize, x as usize, 1]] = g as f64;
		pixels[[y as usize, x as usize, 2]] = b as f64;
	}
	pixels
}

/// Scales (224, 224, 3) pixels on the 0..=255 scale to [0, 1], applies the
/// per-channel mean/std and transposes to channel-first.
pub fn normalize(pixels: ArrayView3<f64>) -> CanonicalTensor
{
	let mut input = Array4::zeros((1, 3, IMAGE_INPUT_SIZE, IMAGE_INPUT_SIZE));
	for ((y, x, c), value) in pixels.indexed_iter() {
		input[[0, c, y, x]] = (value / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
	}

	CanonicalTensor::new(input)
}

/// Resizes directly to `size` x `size` with bilinear interpolation on half-pixel
/// centers and no antialiasing. Used by the fallback path, which skips the
/// aspect-preserving resize and crop.
pub fn resize_exact_bilinear(image: &RgbImage, size: usize) -> Array3<f64>
{
	let (width, height) = image.dimensions();
	let scale_x = width as f64 / size as f64;
	let scale_y = height as f64 / size as f64;

	let mut resized = Array3::zeros((size, size, 3));
	for y in 0..size {
		let (y0, y1, wy) = source_span(y, scale_y, height);
		for x in 0..size {
			let (x0, x1, wx) = source_span(x, scale_x, width);
			let (p00, p10) = (image.get_pixel(x0, y0).0, image.get_pixel(x1, y0).0);
			let (p01, p11) = (image.get_pixel(x0, y1).0, image.get_pixel(x1, y1).0);
			for c in 0..3 {
				let upper = p00[c] as f64 * (1.0 - wx) + p10[c] as f64 * wx;
				let lower = p01[c] as f64 * (1.0 - wx) + p11[c] as f64 * wx;
				resized[[y, x, c]] = upper * (1.0 - wy) + lower * wy;
			}
		}
	}

	resized
}

// Neighbouring source indices and the weight of the second one.
fn source_span(destination: usize, scale: f64, length: u32) -> (u32, u32, f64)
{
	let source = ((destination as f64 + 0.5) * scale - 0.5).max(0.0);
	let last = length - 1;
	let lower = (source.floor() as u32).min(last);
	if lower >= last {
		return (last, last, 0.0);
	}
	(lower, lower + 1, source - lower as f64)
}

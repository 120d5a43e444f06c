//! # Image Model
//!
//! In-memory pixel container shared by the dither engine and the video
//! pipeline, plus the PNG codec and the fixed output palettes.
//!
//! Layout contract:
//! - grayscale: row-major, 1 byte per pixel, `len == w * h`
//! - rgba: row-major, 4 bytes per pixel (R, G, B, A), `len == 4 * w * h`,
//!   alpha forced to 255 for sources without an alpha channel
//!
//! Dithered images additionally guarantee that every sample is exactly 0 or
//! 255, which is what makes the 1-bit and 3-bit palette PNG encodings
//! possible.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use thiserror::Error;

use crate::pnm;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode \"{path}\": {reason}")]
    Decode { path: String, reason: String },
    #[error("failed to encode \"{path}\": {reason}")]
    Encode { path: String, reason: String },
    #[error("\"{0}\" already exists and overwrite is disabled")]
    AlreadyExists(String),
    #[error("unsupported image input: {0}")]
    Unsupported(String),
}

/// Channel interpretation of the pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    Grayscale,
    Rgba,
}

/// Which palette, if any, the pixel data has been quantized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DitherState {
    /// Continuous-tone data.
    None,
    /// 1-bit black/white; implies grayscale.
    Bw1,
    /// 3-bit R/G/B palette; implies rgba.
    Color3,
}

/// Black/white palette for 1-bit output.
pub const DITHER_BW_PALETTE: [[u8; 3]; 2] = [[0, 0, 0], [255, 255, 255]];

/// 8-entry palette for 3-bit output. Index order is fixed by the nibble
/// packing: black, white, red, green, blue, yellow, magenta, cyan.
pub const DITHER_COLOR_PALETTE: [[u8; 3]; 8] = [
    [0, 0, 0],
    [255, 255, 255],
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
];

/// Palette index of a dithered pixel, derived from which channels are
/// non-zero.
pub fn palette_index(red: u8, green: u8, blue: u8) -> u8 {
    match (red != 0, green != 0, blue != 0) {
        (false, false, false) => 0,
        (true, true, true) => 1,
        (true, false, false) => 2,
        (false, true, false) => 3,
        (false, false, true) => 4,
        (true, true, false) => 5,
        (true, false, true) => 6,
        (false, true, true) => 7,
    }
}

// ============================================================================
// Blue-noise channel offsets
// ============================================================================

/// Exclusive upper bound for channel offsets; a large multiple of any
/// practical noise-tile area so the per-channel phases decorrelate.
pub const BLUE_NOISE_OFFSET_MAX: u32 = 1 << 24;

/// Source of the per-channel spatial phases into the blue-noise tile.
///
/// Production callers seed from entropy; tests inject a fixed seed for
/// reproducible offset sequences.
pub struct OffsetGenerator {
    rng: fastrand::Rng,
}

impl OffsetGenerator {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Three offsets in `[0, BLUE_NOISE_OFFSET_MAX)`, pairwise distinct.
    /// Collisions are handled by resampling the whole triple.
    pub fn distinct_triple(&mut self) -> [u32; 3] {
        loop {
            let triple = [
                self.rng.u32(0..BLUE_NOISE_OFFSET_MAX),
                self.rng.u32(0..BLUE_NOISE_OFFSET_MAX),
                self.rng.u32(0..BLUE_NOISE_OFFSET_MAX),
            ];
            if triple[0] != triple[1] && triple[1] != triple[2] && triple[0] != triple[2] {
                return triple;
            }
        }
    }
}

impl Default for OffsetGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Image
// ============================================================================

#[derive(Debug, Clone)]
pub struct Image {
    pub(crate) data: Vec<u8>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) chroma: Chroma,
    pub(crate) dither_state: DitherState,
    pub(crate) channel_offsets: [u32; 3],
    pub(crate) preserve_offsets: bool,
}

impl Image {
    fn with_buffer(data: Vec<u8>, width: u32, height: u32, chroma: Chroma) -> Self {
        Self {
            data,
            width,
            height,
            chroma,
            dither_state: DitherState::None,
            channel_offsets: OffsetGenerator::new().distinct_triple(),
            preserve_offsets: false,
        }
    }

    /// Wraps an existing grayscale buffer (`data.len() == w * h`).
    pub fn from_gray(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 || data.len() != (width as usize) * (height as usize) {
            return Err(ImageError::Unsupported(format!(
                "grayscale buffer of {} bytes does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self::with_buffer(data, width, height, Chroma::Grayscale))
    }

    /// Wraps an existing rgba buffer (`data.len() == 4 * w * h`).
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 || data.len() != 4 * (width as usize) * (height as usize) {
            return Err(ImageError::Unsupported(format!(
                "rgba buffer of {} bytes does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self::with_buffer(data, width, height, Chroma::Rgba))
    }

    /// Decodes a file, dispatching on the (case-insensitive) filename
    /// extension: `.png`, `.pgm`, or `.ppm`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "png" => {
                tracing::info!("decoding PNG \"{}\"", path.display());
                decode_png(path)
            }
            "pgm" => {
                tracing::info!("decoding PGM \"{}\"", path.display());
                let (data, width, height) = pnm::decode_pgm(path)?;
                Self::from_gray(width, height, data)
            }
            "ppm" => {
                tracing::info!("decoding PPM \"{}\"", path.display());
                let (data, width, height) = pnm::decode_ppm(path)?;
                Self::from_rgba(width, height, data)
            }
            other => Err(ImageError::Unsupported(format!(
                "unknown filename extension \"{other}\" for \"{}\"",
                path.display()
            ))),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes in the pixel buffer.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma(&self) -> Chroma {
        self.chroma
    }

    pub fn is_grayscale(&self) -> bool {
        self.chroma == Chroma::Grayscale
    }

    pub fn dither_state(&self) -> DitherState {
        self.dither_state
    }

    /// Whether buffer length, dimensions, and chroma are consistent.
    pub fn is_valid(&self) -> bool {
        let pixels = (self.width as usize) * (self.height as usize);
        !self.data.is_empty()
            && self.width > 0
            && self.height > 0
            && match self.chroma {
                Chroma::Grayscale => self.data.len() == pixels,
                Chroma::Rgba => self.data.len() == 4 * pixels,
            }
    }

    pub fn channel_offsets(&self) -> [u32; 3] {
        self.channel_offsets
    }

    pub fn set_channel_offsets(&mut self, offsets: [u32; 3]) {
        self.channel_offsets = offsets;
    }

    /// When set, the channel offsets are kept stable across dither calls
    /// instead of being regenerated, which keeps the noise pattern constant
    /// across video frames and suppresses flicker.
    pub fn preserve_offsets(&self) -> bool {
        self.preserve_offsets
    }

    pub fn set_preserve_offsets(&mut self, preserve: bool) {
        self.preserve_offsets = preserve;
    }

    /// Replaces the pixel contents in place, keeping the channel offsets and
    /// preserve flag. Used by the video pipeline, which reuses one image
    /// across every decoded frame.
    pub(crate) fn set_rgba(&mut self, width: u32, height: u32, data: Vec<u8>) {
        debug_assert_eq!(data.len(), 4 * width as usize * height as usize);
        self.data = data;
        self.width = width;
        self.height = height;
        self.chroma = Chroma::Rgba;
        self.dither_state = DitherState::None;
    }

    /// Converts one sRGB color to gray, preserving relative luminance
    /// (Rec. 709 weights, sRGB transfer curve on the way back).
    pub fn color_to_gray(red: u8, green: u8, blue: u8) -> u8 {
        let y_linear = 0.2126 * (f64::from(red) / 255.0)
            + 0.7152 * (f64::from(green) / 255.0)
            + 0.0722 * (f64::from(blue) / 255.0);
        if y_linear <= 0.003_130_8 {
            ((12.92 * y_linear) * 255.0).round() as u8
        } else {
            ((1.055 * y_linear.powf(1.0 / 2.4) - 0.055) * 255.0).round() as u8
        }
    }

    /// Returns a grayscale rendition of this image. Grayscale input comes
    /// back as a plain copy, dither state included.
    pub fn to_grayscale(&self) -> Image {
        if self.is_grayscale() {
            return self.clone();
        }
        let pixels = (self.width as usize) * (self.height as usize);
        let mut gray = Vec::with_capacity(pixels);
        for px in self.data.chunks_exact(4) {
            gray.push(Self::color_to_gray(px[0], px[1], px[2]));
        }
        Image {
            data: gray,
            width: self.width,
            height: self.height,
            chroma: Chroma::Grayscale,
            dither_state: DitherState::None,
            channel_offsets: self.channel_offsets,
            preserve_offsets: self.preserve_offsets,
        }
    }

    // ------------------------------------------------------------------
    // Encoders
    // ------------------------------------------------------------------

    /// Saves as PNG. The encoding depends on the dither state: 1-bit
    /// palette for [`DitherState::Bw1`], 4-bit palette (8 entries) for
    /// [`DitherState::Color3`], plain 8-bit gray or rgba otherwise.
    ///
    /// Refuses to clobber an existing file unless `overwrite` is set. The
    /// existence check is stat-then-create, so there is no protection
    /// against a concurrent writer racing the check.
    pub fn save_png(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<(), ImageError> {
        let path = path.as_ref();
        if !self.is_valid() {
            return Err(ImageError::Unsupported("image is not valid".to_string()));
        }
        if !overwrite && path.exists() {
            return Err(ImageError::AlreadyExists(path.display().to_string()));
        }

        let encode_err = |e: png::EncodingError| ImageError::Encode {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let file = File::create(path)?;
        let mut encoder = png::Encoder::new(BufWriter::new(file), self.width, self.height);
        let rows = match (self.chroma, self.dither_state) {
            (Chroma::Grayscale, DitherState::Bw1) => {
                encoder.set_color(png::ColorType::Indexed);
                encoder.set_depth(png::BitDepth::One);
                encoder.set_palette(DITHER_BW_PALETTE.concat());
                pack_bw1_rows(&self.data, self.width, self.height)
            }
            (Chroma::Rgba, DitherState::Color3) => {
                encoder.set_color(png::ColorType::Indexed);
                encoder.set_depth(png::BitDepth::Four);
                encoder.set_palette(DITHER_COLOR_PALETTE.concat());
                pack_color3_rows(&self.data, self.width, self.height)
            }
            (Chroma::Grayscale, _) => {
                encoder.set_color(png::ColorType::Grayscale);
                encoder.set_depth(png::BitDepth::Eight);
                self.data.clone()
            }
            (Chroma::Rgba, _) => {
                encoder.set_color(png::ColorType::Rgba);
                encoder.set_depth(png::BitDepth::Eight);
                self.data.clone()
            }
        };

        let mut writer = encoder.write_header().map_err(encode_err)?;
        writer.write_image_data(&rows).map_err(encode_err)?;
        writer.finish().map_err(encode_err)?;
        Ok(())
    }

    /// Saves as PPM, binary P6 when `binary` is set, ASCII P3 otherwise.
    /// Grayscale pixels are replicated across R, G, B; alpha is dropped.
    pub fn save_ppm(
        &self,
        path: impl AsRef<Path>,
        overwrite: bool,
        binary: bool,
    ) -> Result<(), ImageError> {
        let path = path.as_ref();
        if !self.is_valid() {
            return Err(ImageError::Unsupported("image is not valid".to_string()));
        }
        if !overwrite && path.exists() {
            return Err(ImageError::AlreadyExists(path.display().to_string()));
        }
        pnm::encode_ppm(
            path,
            &self.data,
            self.width,
            self.height,
            self.is_grayscale(),
            binary,
        )
    }
}

/// Packs a dithered grayscale buffer into 1-bit rows, most significant bit
/// first, each row padded to a whole byte.
fn pack_bw1_rows(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let row_bytes = (width as usize).div_ceil(8);
    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let row = &data[y * width as usize..(y + 1) * width as usize];
        let mut byte = 0u8;
        let mut bit = 0u32;
        for &sample in row {
            if sample != 0 {
                byte |= 0x80 >> bit;
            }
            bit += 1;
            if bit == 8 {
                packed.push(byte);
                byte = 0;
                bit = 0;
            }
        }
        if bit != 0 {
            packed.push(byte);
        }
    }
    packed
}

/// Packs a dithered rgba buffer into 4-bit palette rows, two pixels per
/// byte with the first pixel in the high nibble.
fn pack_color3_rows(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let row_bytes = (width as usize).div_ceil(2);
    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let row = &data[y * width as usize * 4..(y + 1) * width as usize * 4];
        let mut byte = 0u8;
        let mut half = false;
        for px in row.chunks_exact(4) {
            let index = palette_index(px[0], px[1], px[2]);
            if half {
                packed.push(byte | index);
                byte = 0;
            } else {
                byte = index << 4;
            }
            half = !half;
        }
        if half {
            packed.push(byte);
        }
    }
    packed
}

/// PNG decode through the `image` crate. One-channel sources stay
/// grayscale; everything else lands in rgba with alpha defaulted to 255.
fn decode_png(path: &Path) -> Result<Image, ImageError> {
    let decode_err = |reason: String| ImageError::Decode {
        path: path.display().to_string(),
        reason,
    };

    let decoded = image::ImageReader::open(path)?
        .decode()
        .map_err(|e| decode_err(e.to_string()))?;
    let width = decoded.width();
    let height = decoded.height();
    if width == 0 || height == 0 {
        return Err(decode_err("image has zero dimensions".to_string()));
    }

    match decoded {
        image::DynamicImage::ImageLuma8(gray) => Image::from_gray(width, height, gray.into_raw()),
        gray16 @ image::DynamicImage::ImageLuma16(_) => {
            Image::from_gray(width, height, gray16.to_luma8().into_raw())
        }
        image::DynamicImage::ImageLumaA8(_) | image::DynamicImage::ImageLumaA16(_) => Err(
            decode_err("gray+alpha PNG is not supported".to_string()),
        ),
        other => Image::from_rgba(width, height, other.to_rgba8().into_raw()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_index_matches_fixed_order() {
        assert_eq!(palette_index(0, 0, 0), 0);
        assert_eq!(palette_index(255, 255, 255), 1);
        assert_eq!(palette_index(255, 0, 0), 2);
        assert_eq!(palette_index(0, 255, 0), 3);
        assert_eq!(palette_index(0, 0, 255), 4);
        assert_eq!(palette_index(255, 255, 0), 5);
        assert_eq!(palette_index(255, 0, 255), 6);
        assert_eq!(palette_index(0, 255, 255), 7);
    }

    #[test]
    fn color_to_gray_endpoints() {
        assert_eq!(Image::color_to_gray(0, 0, 0), 0);
        assert_eq!(Image::color_to_gray(255, 255, 255), 255);
        // Equal channels map back onto themselves through the transfer
        // round trip only approximately; mid-gray should stay mid-ish.
        let mid = Image::color_to_gray(128, 128, 128);
        assert!((100..=160).contains(&mid), "mid gray was {mid}");
    }

    #[test]
    fn color_to_gray_weights_green_highest() {
        let g = Image::color_to_gray(0, 200, 0);
        let r = Image::color_to_gray(200, 0, 0);
        let b = Image::color_to_gray(0, 0, 200);
        assert!(g > r && r > b);
    }

    #[test]
    fn layout_invariants_hold() {
        let gray = Image::from_gray(3, 2, vec![0; 6]).unwrap();
        assert!(gray.is_valid());
        assert_eq!(gray.size(), 6);

        let rgba = Image::from_rgba(3, 2, vec![0; 24]).unwrap();
        assert!(rgba.is_valid());
        assert_eq!(rgba.size(), 24);

        assert!(Image::from_gray(3, 2, vec![0; 5]).is_err());
        assert!(Image::from_rgba(3, 2, vec![0; 23]).is_err());
    }

    #[test]
    fn to_grayscale_uses_luminance() {
        let rgba = Image::from_rgba(2, 1, vec![255, 255, 255, 255, 0, 0, 0, 255]).unwrap();
        let gray = rgba.to_grayscale();
        assert!(gray.is_grayscale());
        assert_eq!(gray.data(), &[255, 0]);
        assert_eq!(gray.channel_offsets(), rgba.channel_offsets());
    }

    #[test]
    fn offsets_are_distinct_and_bounded() {
        let mut generator = OffsetGenerator::with_seed(7);
        for _ in 0..100 {
            let [a, b, c] = generator.distinct_triple();
            assert!(a != b && b != c && a != c);
            assert!(a < BLUE_NOISE_OFFSET_MAX);
            assert!(b < BLUE_NOISE_OFFSET_MAX);
            assert!(c < BLUE_NOISE_OFFSET_MAX);
        }
    }

    #[test]
    fn offsets_are_reproducible_with_a_seed() {
        let mut first = OffsetGenerator::with_seed(99);
        let mut second = OffsetGenerator::with_seed(99);
        assert_eq!(first.distinct_triple(), second.distinct_triple());
        assert_eq!(first.distinct_triple(), second.distinct_triple());
    }

    #[test]
    fn bw1_packing_is_msb_first() {
        // 8 pixels: on, off, on, off, off, on, on, on -> 0b10100111
        let data = vec![255, 0, 255, 0, 0, 255, 255, 255];
        assert_eq!(pack_bw1_rows(&data, 8, 1), vec![0b1010_0111]);
        // 3 pixels pad the tail of the row byte with zeros.
        let data = vec![255, 255, 0];
        assert_eq!(pack_bw1_rows(&data, 3, 1), vec![0b1100_0000]);
    }

    #[test]
    fn color3_packing_is_high_nibble_first() {
        // black, white, red, green -> indices 0, 1, 2, 3 -> 0x01 0x23
        let data = vec![
            0, 0, 0, 255, //
            255, 255, 255, 255, //
            255, 0, 0, 255, //
            0, 255, 0, 255, //
        ];
        assert_eq!(pack_color3_rows(&data, 4, 1), vec![0x01, 0x23]);
        // Odd width leaves the low nibble of the last byte zero.
        let data = vec![255, 255, 255, 255, 0, 0, 255, 255, 0, 0, 0, 255];
        assert_eq!(pack_color3_rows(&data, 3, 1), vec![0x14, 0x00]);
    }

    #[test]
    fn save_png_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let img = Image::from_gray(2, 2, vec![0, 64, 128, 255]).unwrap();

        img.save_png(&path, false).unwrap();
        let original = std::fs::read(&path).unwrap();

        let denied = img.save_png(&path, false);
        assert!(matches!(denied, Err(ImageError::AlreadyExists(_))));
        assert_eq!(std::fs::read(&path).unwrap(), original);

        img.save_png(&path, true).unwrap();
    }

    #[test]
    fn png_gray_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        let img = Image::from_gray(3, 2, vec![0, 50, 100, 150, 200, 250]).unwrap();
        img.save_png(&path, false).unwrap();

        let back = Image::from_file(&path).unwrap();
        assert!(back.is_grayscale());
        assert_eq!(back.data(), img.data());
    }

    #[test]
    fn png_rgba_round_trip_keeps_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgba.png");
        let img = Image::from_rgba(1, 2, vec![10, 20, 30, 255, 40, 50, 60, 255]).unwrap();
        img.save_png(&path, false).unwrap();

        let back = Image::from_file(&path).unwrap();
        assert_eq!(back.chroma(), Chroma::Rgba);
        assert_eq!(back.data(), img.data());
    }

    #[test]
    fn ppm_round_trip_through_image() {
        let dir = tempfile::tempdir().unwrap();
        let img = Image::from_rgba(
            2,
            2,
            vec![
                255, 0, 0, 255, //
                0, 255, 0, 255, //
                0, 0, 255, 255, //
                255, 255, 255, 255,
            ],
        )
        .unwrap();

        let binary_path = dir.path().join("out.ppm");
        img.save_ppm(&binary_path, false, true).unwrap();
        let back = Image::from_file(&binary_path).unwrap();
        assert_eq!(back.chroma(), Chroma::Rgba);
        assert_eq!(back.data(), img.data());

        // The ASCII variant carries the same samples.
        let ascii_path = dir.path().join("out_ascii.ppm");
        img.save_ppm(&ascii_path, false, false).unwrap();
        let ascii = Image::from_file(&ascii_path).unwrap();
        assert_eq!(ascii.data(), img.data());
    }

    #[test]
    fn gray_ppm_export_replicates_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.ppm");
        let img = Image::from_gray(2, 1, vec![7, 200]).unwrap();
        img.save_ppm(&path, false, true).unwrap();

        let back = Image::from_file(&path).unwrap();
        assert_eq!(back.data(), &[7, 7, 7, 255, 200, 200, 200, 255]);

        let denied = img.save_ppm(&path, false, true);
        assert!(matches!(denied, Err(ImageError::AlreadyExists(_))));
    }

    #[test]
    fn bw1_png_decodes_back_to_black_and_white() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bw.png");
        let mut img = Image::from_gray(4, 1, vec![0, 255, 255, 0]).unwrap();
        img.dither_state = DitherState::Bw1;
        img.save_png(&path, false).unwrap();

        // The palette expands back to gray or rgb values on decode.
        let back = Image::from_file(&path).unwrap();
        assert_eq!(back.width(), 4);
        assert_eq!(back.height(), 1);
        let samples: Vec<u8> = match back.chroma() {
            Chroma::Grayscale => back.data().to_vec(),
            Chroma::Rgba => back.data().chunks_exact(4).map(|px| px[0]).collect(),
        };
        assert_eq!(samples, vec![0, 255, 255, 0]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let result = Image::from_file("nope.bmp");
        assert!(matches!(result, Err(ImageError::Unsupported(_))));
    }
}

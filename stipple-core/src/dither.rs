//! # Blue-Noise Dither Engine
//!
//! Threshold dithering against a blue-noise texture, executed on the
//! compute device. Two kernels cover the output modes:
//!
//! - `grayscale_dither` produces 1-bit black/white from a grayscale input
//! - `color_dither` thresholds R, G, B independently, each channel phased
//!   into the noise tile by its own offset so the three use uncorrelated
//!   thresholds; alpha passes through unchanged
//!
//! Byte buffers are packed into `array<u32>` words on the device (storage
//! buffers have no byte addressing); the output holds one word per sample
//! so work-items never contend for a word.

use std::sync::Arc;

use thiserror::Error;

use crate::compute::{
    acquire_handle, select_tile_sizes, BufferAccess, ComputeError, ComputeHandle,
};
use crate::image::{Chroma, DitherState, Image, OffsetGenerator};

#[derive(Debug, Error)]
pub enum DitherError {
    #[error("blue-noise image must be grayscale")]
    NoiseNotGrayscale,
    #[error("color dithering requires an rgba input image")]
    GrayscaleInput,
    #[error("input image is not valid")]
    InvalidImage,
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Kernel cache names; also the WGSL entry-point names.
pub const GRAYSCALE_KERNEL_NAME: &str = "grayscale_dither";
pub const COLOR_KERNEL_NAME: &str = "color_dither";

/// Fixed buffer names inside each kernel entry.
const BUF_INPUT: &str = "input";
const BUF_OUTPUT: &str = "output";
const BUF_NOISE: &str = "noise";
const BUF_NOISE_OFFSETS: &str = "noise_offsets";

const GRAYSCALE_KERNEL_SRC: &str = r#"
override tile_w: u32 = 16u;
override tile_h: u32 = 16u;

@group(0) @binding(0) var<storage, read> input: array<u32>;
@group(0) @binding(1) var<storage, read> blue_noise: array<u32>;
@group(0) @binding(2) var<storage, read_write> output: array<u32>;
@group(0) @binding(3) var<uniform> input_width: u32;
@group(0) @binding(4) var<uniform> input_height: u32;
@group(0) @binding(5) var<uniform> blue_noise_width: u32;
@group(0) @binding(6) var<uniform> blue_noise_height: u32;
@group(0) @binding(7) var<uniform> blue_noise_offset: u32;

fn bn_index(x: u32, y: u32, o: u32, bn_w: u32, bn_h: u32) -> u32 {
    let offset_x = (o % bn_w + x) % bn_w;
    let offset_y = (o / bn_w + y) % bn_h;
    return offset_x + offset_y * bn_w;
}

fn input_byte(idx: u32) -> u32 {
    return (input[idx / 4u] >> ((idx % 4u) * 8u)) & 0xffu;
}

fn noise_byte(idx: u32) -> u32 {
    return (blue_noise[idx / 4u] >> ((idx % 4u) * 8u)) & 0xffu;
}

@compute @workgroup_size(tile_w, tile_h)
fn grayscale_dither(@builtin(global_invocation_id) gid: vec3<u32>) {
    let x = gid.x;
    let y = gid.y;
    if x >= input_width || y >= input_height {
        return;
    }
    let b_i = bn_index(x, y, blue_noise_offset, blue_noise_width, blue_noise_height);
    let i = x + y * input_width;
    output[i] = select(0u, 255u, input_byte(i) > noise_byte(b_i));
}
"#;

const COLOR_KERNEL_SRC: &str = r#"
override tile_w: u32 = 16u;
override tile_h: u32 = 16u;

@group(0) @binding(0) var<storage, read> input: array<u32>;
@group(0) @binding(1) var<storage, read> blue_noise: array<u32>;
@group(0) @binding(2) var<storage, read_write> output: array<u32>;
@group(0) @binding(3) var<uniform> input_width: u32;
@group(0) @binding(4) var<uniform> input_height: u32;
@group(0) @binding(5) var<uniform> blue_noise_width: u32;
@group(0) @binding(6) var<uniform> blue_noise_height: u32;
@group(0) @binding(7) var<storage, read> noise_offsets: array<u32>;

fn bn_index(x: u32, y: u32, o: u32, bn_w: u32, bn_h: u32) -> u32 {
    let offset_x = (o % bn_w + x) % bn_w;
    let offset_y = (o / bn_w + y) % bn_h;
    return offset_x + offset_y * bn_w;
}

fn noise_byte(idx: u32) -> u32 {
    return (blue_noise[idx / 4u] >> ((idx % 4u) * 8u)) & 0xffu;
}

@compute @workgroup_size(tile_w, tile_h)
fn color_dither(@builtin(global_invocation_id) gid: vec3<u32>) {
    let x = gid.x;
    let y = gid.y;
    if x >= input_width || y >= input_height {
        return;
    }
    let i = x + y * input_width;
    let pixel = input[i];
    // One rgba pixel per word; the alpha lane is copied unchanged.
    var word = pixel & 0xff000000u;
    for (var c = 0u; c < 3u; c = c + 1u) {
        let sample = (pixel >> (c * 8u)) & 0xffu;
        let b_i = bn_index(x, y, noise_offsets[c], blue_noise_width, blue_noise_height);
        word = word | (select(0u, 255u, sample > noise_byte(b_i)) << (c * 8u));
    }
    output[i] = word;
}
"#;

/// WGSL source of the grayscale kernel.
pub fn grayscale_kernel_source() -> &'static str {
    GRAYSCALE_KERNEL_SRC
}

/// WGSL source of the color kernel.
pub fn color_kernel_source() -> &'static str {
    COLOR_KERNEL_SRC
}

// ============================================================================
// Engine
// ============================================================================

/// Drives the dithering kernels through the compute handle.
///
/// Kernels and their buffers are cached under fixed names across calls, so
/// running a whole video re-uses one compiled pipeline and one set of
/// device allocations for as long as the frame size stays constant.
pub struct DitherEngine {
    handle: Arc<ComputeHandle>,
    offsets: OffsetGenerator,
}

impl DitherEngine {
    pub fn new() -> Result<Self, DitherError> {
        Ok(Self {
            handle: acquire_handle()?,
            offsets: OffsetGenerator::new(),
        })
    }

    /// Engine with a deterministic offset sequence, for reproducible runs.
    pub fn with_seed(seed: u64) -> Result<Self, DitherError> {
        Ok(Self {
            handle: acquire_handle()?,
            offsets: OffsetGenerator::with_seed(seed),
        })
    }

    pub fn handle(&self) -> &Arc<ComputeHandle> {
        &self.handle
    }

    /// Dithers `image` to 1-bit black/white. Non-grayscale input is first
    /// converted through the luminance path.
    ///
    /// Fresh channel offsets are drawn unless the image preserves them;
    /// offset state lives on the image so a video pipeline can hold the
    /// noise phase constant across frames.
    pub fn dither_grayscale(
        &mut self,
        image: &mut Image,
        blue_noise: &Image,
    ) -> Result<Image, DitherError> {
        if !blue_noise.is_grayscale() || !blue_noise.is_valid() {
            return Err(DitherError::NoiseNotGrayscale);
        }
        if !image.is_valid() {
            return Err(DitherError::InvalidImage);
        }
        if !image.preserve_offsets() {
            image.set_channel_offsets(self.offsets.distinct_triple());
        }

        let gray = image.to_grayscale();
        let result = self.run_grayscale(&gray, blue_noise, image.channel_offsets());
        if result.is_err() {
            self.handle.cleanup_kernel(GRAYSCALE_KERNEL_NAME);
        }
        result
    }

    /// Dithers `image` to the 8-color palette, thresholding each of R, G, B
    /// against its own offset into the noise tile.
    pub fn dither_color(
        &mut self,
        image: &mut Image,
        blue_noise: &Image,
    ) -> Result<Image, DitherError> {
        if !blue_noise.is_grayscale() || !blue_noise.is_valid() {
            return Err(DitherError::NoiseNotGrayscale);
        }
        if image.is_grayscale() {
            return Err(DitherError::GrayscaleInput);
        }
        if !image.is_valid() {
            return Err(DitherError::InvalidImage);
        }
        if !image.preserve_offsets() {
            image.set_channel_offsets(self.offsets.distinct_triple());
        }

        let result = self.run_color(image, blue_noise);
        if result.is_err() {
            self.handle.cleanup_kernel(COLOR_KERNEL_NAME);
        }
        result
    }

    fn run_grayscale(
        &self,
        gray: &Image,
        blue_noise: &Image,
        offsets: [u32; 3],
    ) -> Result<Image, DitherError> {
        let name = GRAYSCALE_KERNEL_NAME;
        let width = gray.width();
        let height = gray.height();
        let input_size = gray.size();
        let output_size = 4 * input_size;
        let noise_size = blue_noise.size();

        self.prepare_kernel(
            name,
            GRAYSCALE_KERNEL_SRC,
            input_size,
            output_size,
            noise_size,
            false,
        )?;

        self.handle.write_buffer(name, BUF_INPUT, gray.data())?;
        self.handle.write_buffer(name, BUF_NOISE, blue_noise.data())?;

        self.handle.bind_buffer(name, 0, BUF_INPUT)?;
        self.handle.bind_buffer(name, 1, BUF_NOISE)?;
        self.handle.bind_buffer(name, 2, BUF_OUTPUT)?;
        self.handle.bind_value(name, 3, &width.to_le_bytes())?;
        self.handle.bind_value(name, 4, &height.to_le_bytes())?;
        self.handle
            .bind_value(name, 5, &blue_noise.width().to_le_bytes())?;
        self.handle
            .bind_value(name, 6, &blue_noise.height().to_le_bytes())?;
        self.handle.bind_value(name, 7, &offsets[0].to_le_bytes())?;

        let preferred = self.handle.work_group_size(name)?;
        let local = select_tile_sizes(preferred, width, height);
        self.handle.execute_2d(name, [width, height], local, true)?;

        let mut words = vec![0u8; output_size];
        self.handle.read_buffer(name, BUF_OUTPUT, &mut words)?;
        let data: Vec<u8> = words.chunks_exact(4).map(|word| word[0]).collect();

        Ok(Image {
            data,
            width,
            height,
            chroma: Chroma::Grayscale,
            dither_state: DitherState::Bw1,
            channel_offsets: offsets,
            preserve_offsets: gray.preserve_offsets(),
        })
    }

    fn run_color(&self, image: &Image, blue_noise: &Image) -> Result<Image, DitherError> {
        let name = COLOR_KERNEL_NAME;
        let width = image.width();
        let height = image.height();
        let input_size = image.size();
        let noise_size = blue_noise.size();
        let offsets = image.channel_offsets();

        self.prepare_kernel(
            name,
            COLOR_KERNEL_SRC,
            input_size,
            input_size,
            noise_size,
            true,
        )?;

        self.handle.write_buffer(name, BUF_INPUT, image.data())?;
        self.handle.write_buffer(name, BUF_NOISE, blue_noise.data())?;
        self.handle
            .write_buffer(name, BUF_NOISE_OFFSETS, bytemuck::cast_slice(&offsets))?;

        self.handle.bind_buffer(name, 0, BUF_INPUT)?;
        self.handle.bind_buffer(name, 1, BUF_NOISE)?;
        self.handle.bind_buffer(name, 2, BUF_OUTPUT)?;
        self.handle.bind_value(name, 3, &width.to_le_bytes())?;
        self.handle.bind_value(name, 4, &height.to_le_bytes())?;
        self.handle
            .bind_value(name, 5, &blue_noise.width().to_le_bytes())?;
        self.handle
            .bind_value(name, 6, &blue_noise.height().to_le_bytes())?;
        self.handle.bind_buffer(name, 7, BUF_NOISE_OFFSETS)?;

        let preferred = self.handle.work_group_size(name)?;
        let local = select_tile_sizes(preferred, width, height);
        self.handle.execute_2d(name, [width, height], local, true)?;

        let mut data = vec![0u8; input_size];
        self.handle.read_buffer(name, BUF_OUTPUT, &mut data)?;

        Ok(Image {
            data,
            width,
            height,
            chroma: Chroma::Rgba,
            dither_state: DitherState::Color3,
            channel_offsets: offsets,
            preserve_offsets: image.preserve_offsets(),
        })
    }

    /// Ensures the kernel is compiled and its fixed-name buffers exist with
    /// the right sizes. A stale entry (image or noise resized since the
    /// last call) is torn down wholesale and recreated.
    fn prepare_kernel(
        &self,
        name: &str,
        source: &str,
        input_size: usize,
        output_size: usize,
        noise_size: usize,
        with_offsets: bool,
    ) -> Result<(), DitherError> {
        let handle = &self.handle;
        if handle.has_kernel(name) && !self.buffers_match(name, input_size, output_size, noise_size)
        {
            handle.cleanup_kernel(name);
        }
        if !handle.has_kernel(name) {
            handle.create_kernel_from_source(source, name)?;
        }

        if !handle.has_buffer(name, BUF_INPUT) {
            handle.create_buffer(name, BufferAccess::ReadOnly, input_size, None, BUF_INPUT)?;
        }
        if !handle.has_buffer(name, BUF_OUTPUT) {
            handle.create_buffer(name, BufferAccess::WriteOnly, output_size, None, BUF_OUTPUT)?;
        }
        if !handle.has_buffer(name, BUF_NOISE) {
            handle.create_buffer(name, BufferAccess::ReadOnly, noise_size, None, BUF_NOISE)?;
        }
        if with_offsets && !handle.has_buffer(name, BUF_NOISE_OFFSETS) {
            handle.create_buffer(
                name,
                BufferAccess::ReadOnly,
                3 * std::mem::size_of::<u32>(),
                None,
                BUF_NOISE_OFFSETS,
            )?;
        }
        Ok(())
    }

    fn buffers_match(
        &self,
        name: &str,
        input_size: usize,
        output_size: usize,
        noise_size: usize,
    ) -> bool {
        self.handle.buffer_size(name, BUF_INPUT) == Some(input_size)
            && self.handle.buffer_size(name, BUF_OUTPUT) == Some(output_size)
            && self.handle.buffer_size(name, BUF_NOISE) == Some(noise_size)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::DEVICE_TEST_LOCK as ENGINE_LOCK;

    /// Host-side reference for the kernel's index function.
    fn bn_index(x: u32, y: u32, o: u32, bn_w: u32, bn_h: u32) -> u32 {
        let offset_x = (o % bn_w + x) % bn_w;
        let offset_y = (o / bn_w + y) % bn_h;
        offset_x + offset_y * bn_w
    }

    fn engine() -> Option<DitherEngine> {
        match DitherEngine::with_seed(1234) {
            Ok(engine) => Some(engine),
            Err(DitherError::Compute(ComputeError::DeviceUnavailable(reason))) => {
                eprintln!("skipping: no compute adapter available ({reason})");
                None
            }
            Err(other) => panic!("engine setup failed: {other}"),
        }
    }

    #[test]
    fn bn_index_wraps_in_both_axes() {
        // 2x2 tile, offset 1: x phase shifts by one column.
        assert_eq!(bn_index(0, 0, 1, 2, 2), 1);
        assert_eq!(bn_index(1, 0, 1, 2, 2), 0);
        assert_eq!(bn_index(0, 1, 1, 2, 2), 3);
        assert_eq!(bn_index(1, 1, 1, 2, 2), 2);
        // Offsets larger than the width advance the y phase.
        assert_eq!(bn_index(0, 0, 2, 2, 2), 2);
        assert_eq!(bn_index(0, 0, 5, 2, 2), 3);
    }

    #[test]
    fn grayscale_thresholds_against_noise() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_gray(2, 1, vec![100, 200]).unwrap();
        input.set_channel_offsets([0, 1, 2]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(1, 1, vec![150]).unwrap();

        let out = engine.dither_grayscale(&mut input, &noise).unwrap();
        assert_eq!(out.data(), &[0, 255]);
        assert_eq!(out.dither_state(), DitherState::Bw1);
        assert!(out.is_grayscale());
    }

    #[test]
    fn color_thresholds_each_channel() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_rgba(1, 1, vec![128, 0, 200, 255]).unwrap();
        input.set_channel_offsets([0, 0, 0]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(1, 1, vec![127]).unwrap();

        let out = engine.dither_color(&mut input, &noise).unwrap();
        assert_eq!(out.data(), &[255, 0, 255, 255]);
        assert_eq!(out.dither_state(), DitherState::Color3);
    }

    #[test]
    fn grayscale_offset_wraps_across_tile() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_gray(2, 2, vec![200; 4]).unwrap();
        input.set_channel_offsets([1, 2, 3]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(2, 2, vec![10, 250, 50, 100]).unwrap();

        let out = engine.dither_grayscale(&mut input, &noise).unwrap();
        assert_eq!(out.data(), &[0, 255, 255, 255]);
    }

    #[test]
    fn dithering_a_dithered_image_is_a_fixed_point() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_gray(4, 4, (0..16u8).map(|v| v * 16).collect()).unwrap();
        input.set_channel_offsets([3, 5, 9]);
        input.set_preserve_offsets(true);
        let noise =
            Image::from_gray(4, 4, (0..16u8).map(|v| 255 - v * 13).collect()).unwrap();

        let mut once = engine.dither_grayscale(&mut input, &noise).unwrap();
        let twice = engine.dither_grayscale(&mut once, &noise).unwrap();
        assert_eq!(once.data(), twice.data());
    }

    #[test]
    fn one_pixel_image_dithers() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_gray(1, 1, vec![255]).unwrap();
        input.set_channel_offsets([0, 1, 2]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(1, 1, vec![254]).unwrap();
        let out = engine.dither_grayscale(&mut input, &noise).unwrap();
        assert_eq!(out.data(), &[255]);
    }

    #[test]
    fn coprime_dimensions_still_dither() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        // 17x19 falls back to a 1x1 tile.
        let mut input = Image::from_gray(17, 19, vec![200; 17 * 19]).unwrap();
        input.set_channel_offsets([0, 1, 2]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(4, 4, vec![100; 16]).unwrap();
        let out = engine.dither_grayscale(&mut input, &noise).unwrap();
        assert!(out.data().iter().all(|&v| v == 255));
    }

    #[test]
    fn rgba_input_is_grayscaled_before_thresholding() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input =
            Image::from_rgba(2, 1, vec![255, 255, 255, 255, 0, 0, 0, 255]).unwrap();
        input.set_channel_offsets([0, 1, 2]);
        input.set_preserve_offsets(true);
        let noise = Image::from_gray(1, 1, vec![127]).unwrap();

        let out = engine.dither_grayscale(&mut input, &noise).unwrap();
        assert!(out.is_grayscale());
        assert_eq!(out.data(), &[255, 0]);
    }

    #[test]
    fn color_rejects_grayscale_input() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };
        let mut input = Image::from_gray(1, 1, vec![0]).unwrap();
        let noise = Image::from_gray(1, 1, vec![0]).unwrap();
        assert!(matches!(
            engine.dither_color(&mut input, &noise),
            Err(DitherError::GrayscaleInput)
        ));
    }

    #[test]
    fn rgba_noise_is_rejected() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };
        let mut input = Image::from_gray(1, 1, vec![0]).unwrap();
        let noise = Image::from_rgba(1, 1, vec![0, 0, 0, 255]).unwrap();
        assert!(matches!(
            engine.dither_grayscale(&mut input, &noise),
            Err(DitherError::NoiseNotGrayscale)
        ));
    }

    #[test]
    fn fresh_offsets_are_drawn_unless_preserved() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let mut input = Image::from_gray(1, 1, vec![128]).unwrap();
        input.set_channel_offsets([1, 2, 3]);
        input.set_preserve_offsets(false);
        let noise = Image::from_gray(1, 1, vec![127]).unwrap();

        engine.dither_grayscale(&mut input, &noise).unwrap();
        let drawn = input.channel_offsets();
        assert_ne!(drawn, [1, 2, 3]);

        input.set_preserve_offsets(true);
        engine.dither_grayscale(&mut input, &noise).unwrap();
        assert_eq!(input.channel_offsets(), drawn);
    }

    #[test]
    fn resizing_recreates_the_kernel_buffers() {
        let _guard = ENGINE_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let noise = Image::from_gray(2, 2, vec![100, 150, 50, 200]).unwrap();

        let mut small = Image::from_gray(2, 2, vec![200; 4]).unwrap();
        small.set_preserve_offsets(true);
        engine.dither_grayscale(&mut small, &noise).unwrap();
        assert_eq!(
            engine.handle().buffer_size(GRAYSCALE_KERNEL_NAME, "input"),
            Some(4)
        );

        let mut large = Image::from_gray(4, 4, vec![200; 16]).unwrap();
        large.set_preserve_offsets(true);
        engine.dither_grayscale(&mut large, &noise).unwrap();
        assert_eq!(
            engine.handle().buffer_size(GRAYSCALE_KERNEL_NAME, "input"),
            Some(16)
        );
    }
}

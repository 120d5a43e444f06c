//! # Pixel Format Conversion
//!
//! Pure Rust converters between the video pipeline's pixel layouts: planar
//! YUV 4:2:0 on the codec side, packed RGBA and 1-byte grayscale on the
//! dither side. Fixed-point BT.601 matrices, scaled by 1024.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("width and height must be non-zero")]
    ZeroDimensions,
    #[error("yuv 4:2:0 requires even dimensions, got {width}x{height}")]
    OddDimensions { width: u32, height: u32 },
    #[error("{side} buffer is {got} bytes, expected {expected}")]
    SizeMismatch {
        side: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("unsupported conversion: {0:?} -> {1:?}")]
    Unsupported(PixelFormat, PixelFormat),
}

/// Pixel layouts the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0: Y plane, then U, then V (quarter-size chroma).
    I420,
    /// Packed RGBA, 4 bytes per pixel.
    Rgba,
    /// Grayscale, 1 byte per pixel.
    Gray8,
}

impl PixelFormat {
    /// Total buffer size for the given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::I420 => w * h + 2 * (w / 2) * (h / 2),
            PixelFormat::Rgba => w * h * 4,
            PixelFormat::Gray8 => w * h,
        }
    }
}

/// Fixed-resolution pixel format converter.
///
/// One converter instance handles one direction at one size; the video
/// pipeline keeps a decode-side and an encode-side instance and rebuilds
/// the latter when the source format toggles between grayscale and rgba.
pub struct PixelConverter {
    input: PixelFormat,
    output: PixelFormat,
    width: u32,
    height: u32,
}

impl PixelConverter {
    pub fn new(
        input: PixelFormat,
        output: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::ZeroDimensions);
        }
        let involves_i420 = input == PixelFormat::I420 || output == PixelFormat::I420;
        if involves_i420 && (width % 2 != 0 || height % 2 != 0) {
            return Err(ConvertError::OddDimensions { width, height });
        }
        Ok(Self {
            input,
            output,
            width,
            height,
        })
    }

    pub fn input_format(&self) -> PixelFormat {
        self.input
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn output_size(&self) -> usize {
        self.output.buffer_size(self.width, self.height)
    }

    /// Converts one frame. Both buffers must be exactly sized for the
    /// converter's dimensions.
    pub fn convert(&self, input: &[u8], output: &mut [u8]) -> Result<(), ConvertError> {
        let expected_input = self.input.buffer_size(self.width, self.height);
        if input.len() != expected_input {
            return Err(ConvertError::SizeMismatch {
                side: "input",
                got: input.len(),
                expected: expected_input,
            });
        }
        let expected_output = self.output.buffer_size(self.width, self.height);
        if output.len() != expected_output {
            return Err(ConvertError::SizeMismatch {
                side: "output",
                got: output.len(),
                expected: expected_output,
            });
        }

        match (self.input, self.output) {
            (a, b) if a == b => output.copy_from_slice(input),
            (PixelFormat::I420, PixelFormat::Rgba) => self.i420_to_rgba(input, output),
            (PixelFormat::Rgba, PixelFormat::I420) => self.rgba_to_i420(input, output),
            (PixelFormat::Gray8, PixelFormat::I420) => self.gray_to_i420(input, output),
            (from, to) => return Err(ConvertError::Unsupported(from, to)),
        }
        Ok(())
    }

    fn i420_to_rgba(&self, input: &[u8], output: &mut [u8]) {
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w / 2;

        let y_plane = &input[..w * h];
        let u_plane = &input[w * h..w * h + cw * (h / 2)];
        let v_plane = &input[w * h + cw * (h / 2)..];

        for row in 0..h {
            for col in 0..w {
                let y = y_plane[row * w + col];
                let u = u_plane[(row / 2) * cw + col / 2];
                let v = v_plane[(row / 2) * cw + col / 2];
                let (r, g, b) = yuv_to_rgb(y, u, v);

                let dst = (row * w + col) * 4;
                output[dst] = r;
                output[dst + 1] = g;
                output[dst + 2] = b;
                output[dst + 3] = 255;
            }
        }
    }

    fn rgba_to_i420(&self, input: &[u8], output: &mut [u8]) {
        let w = self.width as usize;
        let h = self.height as usize;
        let cw = w / 2;
        let ch = h / 2;
        let (y_plane, chroma) = output.split_at_mut(w * h);
        let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

        for row in 0..h {
            for col in 0..w {
                let src = (row * w + col) * 4;
                let (y, _, _) = rgb_to_yuv(input[src], input[src + 1], input[src + 2]);
                y_plane[row * w + col] = y;
            }
        }

        // Chroma from the average of each 2x2 block.
        for crow in 0..ch {
            for ccol in 0..cw {
                let mut u_sum = 0u32;
                let mut v_sum = 0u32;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let src = ((crow * 2 + dy) * w + ccol * 2 + dx) * 4;
                        let (_, u, v) = rgb_to_yuv(input[src], input[src + 1], input[src + 2]);
                        u_sum += u32::from(u);
                        v_sum += u32::from(v);
                    }
                }
                u_plane[crow * cw + ccol] = (u_sum / 4) as u8;
                v_plane[crow * cw + ccol] = (v_sum / 4) as u8;
            }
        }
    }

    fn gray_to_i420(&self, input: &[u8], output: &mut [u8]) {
        let w = self.width as usize;
        let h = self.height as usize;
        let (y_plane, chroma) = output.split_at_mut(w * h);
        y_plane.copy_from_slice(input);
        chroma.fill(128);
    }
}

/// BT.601 YUV -> RGB, coefficients scaled by 1024.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;

    // R = Y + 1.402 * V
    // G = Y - 0.344 * U - 0.714 * V
    // B = Y + 1.772 * U
    let r = y + ((1436 * v) >> 10);
    let g = y - ((352 * u + 731 * v) >> 10);
    let b = y + ((1815 * u) >> 10);

    (
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    )
}

/// BT.601 RGB -> YUV, coefficients scaled by 1024.
#[inline]
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = i32::from(r);
    let g = i32::from(g);
    let b = i32::from(b);

    // Y = 0.299 * R + 0.587 * G + 0.114 * B
    // U = -0.169 * R - 0.331 * G + 0.5 * B + 128
    // V = 0.5 * R - 0.419 * G - 0.081 * B + 128
    let y = ((306 * r + 601 * g + 117 * b) >> 10).clamp(0, 255);
    let u = (((-173 * r - 339 * g + 512 * b) >> 10) + 128).clamp(0, 255);
    let v = (((512 * r - 429 * g - 83 * b) >> 10) + 128).clamp(0, 255);

    (y as u8, u as u8, v as u8)
}

// ============================================================================
// Tests
// ============================================================================

//! # Stipple Core
//!
//! GPU blue-noise dithering for still images and video frames.
//!
//! The crate is built around a process-wide compute context with a
//! named-kernel registry ([`compute`]), a byte-level image model with
//! PNG/PGM/PPM codecs (`image`, `pnm`), the threshold-dithering engine
//! itself ([`dither`]), and a video pipeline that routes decoded frames
//! through the engine and re-encodes them ([`video`]).

// ============================================================================
// Compute Device
// ============================================================================
pub mod compute;

// ============================================================================
// Image Model & Codecs
// ============================================================================
pub mod image;
pub mod pnm;

// ============================================================================
// Dithering
// ============================================================================
pub mod dither;

// ============================================================================
// Video Pipeline
// ============================================================================
pub mod h264_utils;
pub mod pixel_convert;
pub mod video;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # Video Dithering Pipeline
//!
//! Transforms an MP4 video into a dithered MP4 (or a numbered PNG per
//! frame): demux -> decode -> convert to rgba -> dither -> convert to
//! YUV 4:2:0 -> encode -> mux.
//!
//! The H.264 decoder hands back a frame only once it has seen enough input;
//! `Ok(None)` from a decode call is the normal "need more data" signal, not
//! an error, and the decoder is drained explicitly at end of stream. The
//! channel offsets of the dithering noise are held constant across frames
//! so the pattern does not flicker.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use mp4::{
    AvcConfig, MediaConfig, MediaType, Mp4Config, Mp4Reader, Mp4Sample, Mp4Writer, TrackConfig,
    TrackType,
};
use openh264::decoder::{DecodedYUV, Decoder};
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use thiserror::Error;

use crate::dither::{DitherEngine, DitherError};
use crate::h264_utils::{
    annexb_to_avcc, avcc_to_annexb, nal_unit_type, split_annexb, NAL_TYPE_IDR, NAL_TYPE_PPS,
    NAL_TYPE_SPS,
};
use crate::image::{Image, ImageError};
use crate::pixel_convert::{ConvertError, PixelConverter, PixelFormat};

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("demux failure: {0}")]
    Demux(String),
    #[error("decode failure: {0}")]
    Decode(String),
    #[error("encode failure: {0}")]
    Encode(String),
    #[error("mux failure: {0}")]
    Mux(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("\"{0}\" already exists and overwrite is disabled")]
    AlreadyExists(String),
    #[error(transparent)]
    Dither(#[from] DitherError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Output encoder settings.
#[derive(Debug, Clone)]
pub struct EncodeConfig {
    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,
    /// An IDR frame is forced every this many frames.
    pub keyframe_interval: u32,
    /// Frame rate assumed when the container advertises none.
    pub fallback_frame_rate: f64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 80_000_000,
            keyframe_interval: 128,
            fallback_frame_rate: 30.0,
        }
    }
}

/// Output track timing, derived once per run from the input track.
#[derive(Debug, Clone, Copy, PartialEq)]
struct VideoTiming {
    /// Ticks per second of the output track.
    timescale: u32,
    /// Ticks per frame.
    tick: u64,
    /// Frames per second, for the encoder's rate control.
    fps: f64,
}

/// Prefers timing derived from the container's duration and sample count;
/// falls back to the track's advertised frame rate, then to a default.
fn select_timing(
    duration_ticks: u64,
    sample_count: u32,
    timescale: u32,
    advertised_fps: f64,
    fallback_fps: f64,
) -> VideoTiming {
    if duration_ticks > 0 && sample_count > 0 && timescale > 0 {
        let tick = (duration_ticks / u64::from(sample_count)).max(1);
        return VideoTiming {
            timescale,
            tick,
            fps: f64::from(timescale) / tick as f64,
        };
    }
    let fps = if advertised_fps > 0.0 {
        advertised_fps
    } else {
        fallback_fps
    };
    VideoTiming {
        timescale: (fps * 1000.0).round() as u32,
        tick: 1000,
        fps,
    }
}

// ============================================================================
// Decoded frames
// ============================================================================

/// A decoded YUV 4:2:0 frame, copied out of the decoder's scratch space.
struct DecodedFrame {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    width: usize,
    height: usize,
    y_stride: usize,
    u_stride: usize,
    v_stride: usize,
}

impl DecodedFrame {
    fn from_decoded_yuv(yuv: DecodedYUV) -> Self {
        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        Self {
            y: yuv.y().to_vec(),
            u: yuv.u().to_vec(),
            v: yuv.v().to_vec(),
            width,
            height,
            y_stride,
            u_stride,
            v_stride,
        }
    }

    /// Contiguous I420 with any stride padding removed.
    fn to_i420(&self) -> Vec<u8> {
        let cw = self.width / 2;
        let ch = self.height / 2;
        let mut out = Vec::with_capacity(self.width * self.height + 2 * cw * ch);
        for row in 0..self.height {
            let start = row * self.y_stride;
            out.extend_from_slice(&self.y[start..start + self.width]);
        }
        for row in 0..ch {
            let start = row * self.u_stride;
            out.extend_from_slice(&self.u[start..start + cw]);
        }
        for row in 0..ch {
            let start = row * self.v_stride;
            out.extend_from_slice(&self.v[start..start + cw]);
        }
        out
    }
}

/// YUV wrapper handing an I420 slice to the encoder.
struct YuvFrame<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

impl YUVSource for YuvFrame<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }

    fn u(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let u_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size..y_size + u_size]
    }

    fn v(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let u_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size + u_size..]
    }
}

// ============================================================================
// Frame source (demux + decode)
// ============================================================================

struct Mp4FrameSource {
    reader: Mp4Reader<BufReader<File>>,
    track_id: u32,
    sample_count: u32,
    next_sample: u32,
    decoder: Decoder,
    /// SPS and PPS from the container's avcC box, Annex B framed, fed to
    /// the decoder ahead of the first sample.
    header_nals: Vec<u8>,
    headers_sent: bool,
    /// Frames recovered by draining the decoder at end of stream.
    flushed: Option<VecDeque<DecodedFrame>>,
    packets_read: u64,
    width: u32,
    height: u32,
    timing: VideoTiming,
}

impl Mp4FrameSource {
    fn open(path: &Path, fallback_fps: f64) -> Result<Self, VideoError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let reader = Mp4Reader::read_header(BufReader::new(file), size).map_err(|e| {
            VideoError::Demux(format!("failed to open \"{}\": {e}", path.display()))
        })?;

        let mut tracks: Vec<_> = reader.tracks().values().collect();
        tracks.sort_by_key(|track| track.track_id());

        let mut saw_video = false;
        let mut selected = None;
        for track in tracks {
            if !matches!(track.track_type(), Ok(TrackType::Video)) {
                continue;
            }
            saw_video = true;
            if matches!(track.media_type(), Ok(MediaType::H264)) {
                selected = Some(track);
                break;
            }
        }
        let Some(track) = selected else {
            return Err(if saw_video {
                VideoError::Unsupported("only H.264 video tracks can be decoded".to_string())
            } else {
                VideoError::Demux(format!("no video track in \"{}\"", path.display()))
            });
        };

        let track_id = track.track_id();
        let sample_count = track.sample_count();
        let width = u32::from(track.width());
        let height = u32::from(track.height());
        let timescale = track.timescale();
        let duration_ticks =
            (track.duration().as_secs_f64() * f64::from(timescale)).round() as u64;
        let timing = select_timing(
            duration_ticks,
            sample_count,
            timescale,
            track.frame_rate(),
            fallback_fps,
        );

        let sps = track
            .sequence_parameter_set()
            .map_err(|e| VideoError::Demux(format!("missing SPS: {e}")))?;
        let pps = track
            .picture_parameter_set()
            .map_err(|e| VideoError::Demux(format!("missing PPS: {e}")))?;
        let mut header_nals = Vec::with_capacity(sps.len() + pps.len() + 8);
        header_nals.extend_from_slice(&[0, 0, 0, 1]);
        header_nals.extend_from_slice(sps);
        header_nals.extend_from_slice(&[0, 0, 0, 1]);
        header_nals.extend_from_slice(pps);

        let decoder =
            Decoder::new().map_err(|e| VideoError::Decode(format!("decoder init: {e:?}")))?;

        tracing::info!(
            "input track {track_id}: {width}x{height}, {sample_count} samples, {:.3} fps",
            timing.fps
        );

        Ok(Self {
            reader,
            track_id,
            sample_count,
            next_sample: 1,
            decoder,
            header_nals,
            headers_sent: false,
            flushed: None,
            packets_read: 0,
            width,
            height,
            timing,
        })
    }

    /// Demuxes and decodes until a frame is ready. `Ok(None)` means the
    /// stream is exhausted and the decoder fully drained.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, VideoError> {
        loop {
            if let Some(queue) = self.flushed.as_mut() {
                return Ok(queue.pop_front());
            }
            if self.next_sample > self.sample_count {
                let drained = self
                    .decoder
                    .flush_remaining()
                    .map_err(|e| VideoError::Decode(format!("decoder drain: {e:?}")))?;
                self.flushed = Some(
                    drained
                        .into_iter()
                        .map(DecodedFrame::from_decoded_yuv)
                        .collect(),
                );
                continue;
            }

            let sample = self
                .reader
                .read_sample(self.track_id, self.next_sample)
                .map_err(|e| {
                    VideoError::Demux(format!("sample {}: {e}", self.next_sample))
                })?;
            self.next_sample += 1;
            let Some(sample) = sample else {
                self.next_sample = self.sample_count + 1;
                continue;
            };
            if sample.bytes.is_empty() {
                continue;
            }
            self.packets_read += 1;

            let mut packet = Vec::new();
            if !self.headers_sent {
                packet.extend_from_slice(&self.header_nals);
                self.headers_sent = true;
            }
            packet.extend_from_slice(&avcc_to_annexb(&sample.bytes, 4));

            match self
                .decoder
                .decode(&packet)
                .map_err(|e| VideoError::Decode(format!("packet {}: {e:?}", self.packets_read)))?
            {
                Some(yuv) => return Ok(Some(DecodedFrame::from_decoded_yuv(yuv))),
                // The decoder wants more input before releasing a frame.
                None => continue,
            }
        }
    }
}

// ============================================================================
// Frame sink (encode + mux)
// ============================================================================

struct Mp4FrameSink {
    writer: Mp4Writer<BufWriter<File>>,
    encoder: Encoder,
    /// Assigned after the first encoded access unit yields SPS/PPS.
    track_id: Option<u32>,
    width: u32,
    height: u32,
    timing: VideoTiming,
    keyframe_interval: u32,
    frames_encoded: u64,
}

fn brand(tag: &str) -> Result<mp4::FourCC, VideoError> {
    tag.parse()
        .map_err(|_| VideoError::Mux(format!("invalid brand \"{tag}\"")))
}

impl Mp4FrameSink {
    fn create(
        path: &Path,
        width: u32,
        height: u32,
        timing: VideoTiming,
        config: &EncodeConfig,
    ) -> Result<Self, VideoError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !matches!(ext.as_str(), "mp4" | "m4v" | "mov") {
            return Err(VideoError::Unsupported(format!(
                "cannot infer an MP4 container from \"{}\"",
                path.display()
            )));
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(VideoError::Unsupported(format!(
                "encoder requires even dimensions, video is {width}x{height}"
            )));
        }

        let writer = Mp4Writer::write_start(
            BufWriter::new(File::create(path)?),
            &Mp4Config {
                major_brand: brand("isom")?,
                minor_version: 512,
                compatible_brands: vec![
                    brand("isom")?,
                    brand("iso2")?,
                    brand("avc1")?,
                    brand("mp41")?,
                ],
                timescale: 1000,
            },
        )
        .map_err(|e| VideoError::Mux(format!("container init: {e}")))?;

        let api = OpenH264API::from_source();
        let encoder_config = EncoderConfig::new()
            .set_bitrate_bps(config.bitrate_bps)
            .max_frame_rate(timing.fps as f32);
        let encoder = Encoder::with_api_config(api, encoder_config)
            .map_err(|e| VideoError::Encode(format!("encoder init: {e:?}")))?;

        Ok(Self {
            writer,
            encoder,
            track_id: None,
            width,
            height,
            timing,
            keyframe_interval: config.keyframe_interval,
            frames_encoded: 0,
        })
    }

    /// Encodes one I420 frame and muxes the resulting packets.
    fn push_i420(&mut self, i420: &[u8], frame_index: u64) -> Result<(), VideoError> {
        if self.keyframe_interval > 0
            && frame_index > 0
            && frame_index % u64::from(self.keyframe_interval) == 0
        {
            self.encoder.force_intra_frame();
        }

        let yuv = YuvFrame {
            data: i420,
            width: self.width as usize,
            height: self.height as usize,
        };
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| VideoError::Encode(format!("frame {frame_index}: {e:?}")))?;
        let annexb = bitstream.to_vec();
        self.frames_encoded += 1;
        if annexb.is_empty() {
            return Ok(());
        }

        let units = split_annexb(&annexb);
        if self.track_id.is_none() {
            let sps = units
                .iter()
                .find(|nal| nal_unit_type(nal) == NAL_TYPE_SPS)
                .ok_or_else(|| {
                    VideoError::Encode("first access unit carries no SPS".to_string())
                })?;
            let pps = units
                .iter()
                .find(|nal| nal_unit_type(nal) == NAL_TYPE_PPS)
                .ok_or_else(|| {
                    VideoError::Encode("first access unit carries no PPS".to_string())
                })?;
            self.writer
                .add_track(&TrackConfig {
                    track_type: TrackType::Video,
                    timescale: self.timing.timescale,
                    language: "und".to_string(),
                    media_conf: MediaConfig::AvcConfig(AvcConfig {
                        width: self.width as u16,
                        height: self.height as u16,
                        seq_param_set: sps.to_vec(),
                        pic_param_set: pps.to_vec(),
                    }),
                })
                .map_err(|e| VideoError::Mux(format!("add track: {e}")))?;
            self.track_id = Some(1);
        }

        // Parameter sets live in the avcC box; the sample keeps only the
        // slice data.
        let mut sample_annexb = Vec::with_capacity(annexb.len());
        let mut is_sync = false;
        for nal in &units {
            let nal_type = nal_unit_type(nal);
            if nal_type == NAL_TYPE_SPS || nal_type == NAL_TYPE_PPS {
                continue;
            }
            if nal_type == NAL_TYPE_IDR {
                is_sync = true;
            }
            sample_annexb.extend_from_slice(&[0, 0, 0, 1]);
            sample_annexb.extend_from_slice(nal);
        }
        if sample_annexb.is_empty() {
            return Ok(());
        }

        let Some(track_id) = self.track_id else {
            return Err(VideoError::Mux("no output track".to_string()));
        };
        let sample = Mp4Sample {
            start_time: frame_index * self.timing.tick,
            duration: self.timing.tick as u32,
            rendering_offset: 0,
            is_sync,
            bytes: Bytes::from(annexb_to_avcc(&sample_annexb)),
        };
        self.writer
            .write_sample(track_id, &sample)
            .map_err(|e| VideoError::Mux(format!("frame {frame_index}: {e}")))?;
        Ok(())
    }

    /// Finalizes the container. The encoder holds no delayed frames, so
    /// draining it is writing the trailer.
    fn finish(&mut self) -> Result<(), VideoError> {
        tracing::debug!("finalizing container after {} frames", self.frames_encoded);
        self.writer
            .write_end()
            .map_err(|e| VideoError::Mux(format!("trailer: {e}")))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Dithers every frame of a video file.
///
/// One instance can run several passes over the same input; the decode- and
/// encode-side converters persist between runs, and the encode-side one is
/// rebuilt when the grayscale flag toggles.
pub struct VideoDither {
    input_path: PathBuf,
    /// Reused across frames so the channel offsets stay put.
    image: Option<Image>,
    frame_count: u64,
    packet_count: u64,
    was_grayscale: bool,
    config: EncodeConfig,
    dec_converter: Option<PixelConverter>,
    enc_converter: Option<PixelConverter>,
}

impl VideoDither {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input.into(),
            image: None,
            frame_count: 0,
            packet_count: 0,
            was_grayscale: false,
            config: EncodeConfig::default(),
            dec_converter: None,
            enc_converter: None,
        }
    }

    pub fn with_config(mut self, config: EncodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Frames decoded (and dithered) in the last run.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Packets demuxed in the last run.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Runs the full pipeline. With `output_as_pngs` each dithered frame is
    /// written as `output_NNNNNNNNNN.png` (1-based, ten digits) in the
    /// output path's directory instead of being encoded.
    pub fn dither_video(
        &mut self,
        output: impl AsRef<Path>,
        engine: &mut DitherEngine,
        blue_noise: &Image,
        grayscale: bool,
        overwrite: bool,
        output_as_pngs: bool,
    ) -> Result<(), VideoError> {
        let output = output.as_ref();
        if !output_as_pngs && !overwrite && output.exists() {
            return Err(VideoError::AlreadyExists(output.display().to_string()));
        }

        self.frame_count = 0;
        let color_changed = self.was_grayscale != grayscale;
        self.was_grayscale = grayscale;
        if color_changed {
            self.enc_converter = None;
        }

        let png_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut source = Mp4FrameSource::open(&self.input_path, self.config.fallback_frame_rate)?;
        let mut sink = if output_as_pngs {
            None
        } else {
            Some(Mp4FrameSink::create(
                output,
                source.width,
                source.height,
                source.timing,
                &self.config,
            )?)
        };

        while let Some(frame) = source.next_frame()? {
            self.frame_count += 1;
            self.process_frame(frame, engine, blue_noise, grayscale, sink.as_mut(), &png_dir)?;
        }
        self.packet_count = source.packets_read;

        if let Some(sink) = sink.as_mut() {
            sink.finish()?;
        }
        tracing::info!(
            "dithered {} frames from {} packets",
            self.frame_count,
            self.packet_count
        );
        Ok(())
    }

    fn process_frame(
        &mut self,
        frame: DecodedFrame,
        engine: &mut DitherEngine,
        blue_noise: &Image,
        grayscale: bool,
        sink: Option<&mut Mp4FrameSink>,
        png_dir: &Path,
    ) -> Result<(), VideoError> {
        let width = frame.width as u32;
        let height = frame.height as u32;

        // Decode-side converter, created lazily from the decoded format.
        let rebuild = self
            .dec_converter
            .as_ref()
            .map_or(true, |c| c.width() != width || c.height() != height);
        if rebuild {
            self.dec_converter = Some(PixelConverter::new(
                PixelFormat::I420,
                PixelFormat::Rgba,
                width,
                height,
            )?);
        }
        let Some(dec_converter) = self.dec_converter.as_ref() else {
            return Err(VideoError::Decode("no decode-side converter".to_string()));
        };
        let mut rgba = vec![0u8; dec_converter.output_size()];
        dec_converter.convert(&frame.to_i420(), &mut rgba)?;

        match self.image.as_mut() {
            Some(image) => image.set_rgba(width, height, rgba),
            None => {
                let mut image = Image::from_rgba(width, height, rgba)?;
                image.set_preserve_offsets(true);
                self.image = Some(image);
            }
        }
        let Some(image) = self.image.as_mut() else {
            return Err(VideoError::Decode("no frame image".to_string()));
        };

        let dithered = if grayscale {
            engine.dither_grayscale(image, blue_noise)?
        } else {
            engine.dither_color(image, blue_noise)?
        };

        match sink {
            None => {
                let name = png_dir.join(format!("output_{:010}.png", self.frame_count));
                dithered.save_png(&name, true)?;
            }
            Some(sink) => {
                let input_format = if grayscale {
                    PixelFormat::Gray8
                } else {
                    PixelFormat::Rgba
                };
                let rebuild = self.enc_converter.as_ref().map_or(true, |c| {
                    c.input_format() != input_format
                        || c.width() != width
                        || c.height() != height
                });
                if rebuild {
                    self.enc_converter = Some(PixelConverter::new(
                        input_format,
                        PixelFormat::I420,
                        width,
                        height,
                    )?);
                }
                let Some(enc_converter) = self.enc_converter.as_ref() else {
                    return Err(VideoError::Encode("no encode-side converter".to_string()));
                };
                let mut i420 = vec![0u8; enc_converter.output_size()];
                enc_converter.convert(dithered.data(), &mut i420)?;
                sink.push_i420(&i420, self.frame_count - 1)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeError, DEVICE_TEST_LOCK};

    fn engine() -> Option<DitherEngine> {
        match DitherEngine::with_seed(77) {
            Ok(engine) => Some(engine),
            Err(DitherError::Compute(ComputeError::DeviceUnavailable(reason))) => {
                eprintln!("skipping: no compute adapter available ({reason})");
                None
            }
            Err(other) => panic!("engine setup failed: {other}"),
        }
    }

    /// Writes a short 32x32 video whose frames are all the same flat luma.
    fn write_flat_video(path: &Path, frames: usize, luma: u8) {
        let timing = VideoTiming {
            timescale: 30000,
            tick: 1000,
            fps: 30.0,
        };
        let mut sink =
            Mp4FrameSink::create(path, 32, 32, timing, &EncodeConfig::default()).unwrap();
        let mut i420 = vec![128u8; PixelFormat::I420.buffer_size(32, 32)];
        i420[..32 * 32].fill(luma);
        for index in 0..frames {
            sink.push_i420(&i420, index as u64).unwrap();
        }
        sink.finish().unwrap();
    }

    #[test]
    fn encode_config_defaults() {
        let config = EncodeConfig::default();
        assert_eq!(config.bitrate_bps, 80_000_000);
        assert_eq!(config.keyframe_interval, 128);
    }

    #[test]
    fn timing_prefers_container_duration() {
        // 300 frames over 10 s at 30000 ticks/s -> 1000 ticks/frame, 30 fps,
        // regardless of what the track advertises.
        let timing = select_timing(300_000, 300, 30000, 25.0, 30.0);
        assert_eq!(timing.timescale, 30000);
        assert_eq!(timing.tick, 1000);
        assert!((timing.fps - 30.0).abs() < 1e-9);
    }

    #[test]
    fn timing_falls_back_to_advertised_rate() {
        let timing = select_timing(0, 300, 30000, 24.0, 30.0);
        assert_eq!(timing.timescale, 24000);
        assert_eq!(timing.tick, 1000);
        assert!((timing.fps - 24.0).abs() < 1e-9);
    }

    #[test]
    fn timing_last_resort_default() {
        let timing = select_timing(0, 0, 0, 0.0, 30.0);
        assert_eq!(timing.timescale, 30000);
        assert_eq!(timing.tick, 1000);
    }

    #[test]
    fn sink_rejects_unknown_containers() {
        let timing = VideoTiming {
            timescale: 30000,
            tick: 1000,
            fps: 30.0,
        };
        let result = Mp4FrameSink::create(
            Path::new("out.avi"),
            32,
            32,
            timing,
            &EncodeConfig::default(),
        );
        assert!(matches!(result, Err(VideoError::Unsupported(_))));
    }

    #[test]
    fn sink_rejects_odd_dimensions() {
        let timing = VideoTiming {
            timescale: 30000,
            tick: 1000,
            fps: 30.0,
        };
        let result = Mp4FrameSink::create(
            Path::new("out.mp4"),
            33,
            32,
            timing,
            &EncodeConfig::default(),
        );
        assert!(matches!(result, Err(VideoError::Unsupported(_))));
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let result = Mp4FrameSource::open(Path::new("does-not-exist.mp4"), 30.0);
        assert!(matches!(result, Err(VideoError::Io(_))));
    }

    #[test]
    fn dither_video_holds_noise_steady_across_frames() {
        let _guard = DEVICE_TEST_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.mp4");
        write_flat_video(&input, 2, 150);

        let noise = Image::from_gray(4, 4, (0..16u8).map(|v| v * 16 + 7).collect()).unwrap();
        let mut video = VideoDither::new(&input);
        video
            .dither_video(
                dir.path().join("frames.png"),
                &mut engine,
                &noise,
                false,
                false,
                true,
            )
            .unwrap();
        assert_eq!(video.frame_count(), 2);

        // Identical source frames with preserved offsets dither to the same
        // bytes, so the two frame PNGs match exactly.
        let first = std::fs::read(dir.path().join("output_0000000001.png")).unwrap();
        let second = std::fs::read(dir.path().join("output_0000000002.png")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn grayscale_toggle_rebuilds_the_encode_converter() {
        let _guard = DEVICE_TEST_LOCK.lock();
        let Some(mut engine) = engine() else { return };

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.mp4");
        write_flat_video(&input, 2, 90);
        let noise = Image::from_gray(2, 2, vec![40, 120, 200, 80]).unwrap();

        // Same pipeline instance, color then grayscale; the second run has
        // to rebuild the encode-side converter for the gray8 source.
        let mut video = VideoDither::new(&input);
        let color_out = dir.path().join("color.mp4");
        video
            .dither_video(&color_out, &mut engine, &noise, false, false, false)
            .unwrap();
        let gray_out = dir.path().join("gray.mp4");
        video
            .dither_video(&gray_out, &mut engine, &noise, true, false, false)
            .unwrap();
        assert_eq!(video.frame_count(), 2);

        for path in [&color_out, &gray_out] {
            let mut source = Mp4FrameSource::open(path, 30.0).unwrap();
            let frame = source.next_frame().unwrap().expect("at least one frame");
            assert_eq!((frame.width, frame.height), (32, 32));
        }
    }

    #[test]
    fn encode_mux_demux_decode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round_trip.mp4");
        let timing = VideoTiming {
            timescale: 30000,
            tick: 1000,
            fps: 30.0,
        };

        let width = 32u32;
        let height = 32u32;
        let mut sink =
            Mp4FrameSink::create(&path, width, height, timing, &EncodeConfig::default()).unwrap();

        // Three flat frames at different brightness levels.
        let frame_size = PixelFormat::I420.buffer_size(width, height);
        for (index, luma) in [40u8, 128, 220].iter().enumerate() {
            let mut i420 = vec![128u8; frame_size];
            i420[..(width * height) as usize].fill(*luma);
            sink.push_i420(&i420, index as u64).unwrap();
        }
        sink.finish().unwrap();

        let mut source = Mp4FrameSource::open(&path, 30.0).unwrap();
        assert_eq!((source.width, source.height), (width, height));

        let mut decoded = 0usize;
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!((frame.width as u32, frame.height as u32), (width, height));
            let i420 = frame.to_i420();
            assert_eq!(i420.len(), frame_size);
            decoded += 1;
        }
        assert_eq!(decoded, 3);
        assert_eq!(source.packets_read, 3);
    }
}

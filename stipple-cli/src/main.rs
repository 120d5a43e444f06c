//! # Stipple CLI
//!
//! Blue-noise dithering for images and video on a compute device.
//!
//! Exit codes mirror the failure site: 1 bad blue-noise input, 2 bad input
//! image, 3/4 grayscale dither/save failure, 5/6 color dither/save failure,
//! 7 video failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use stipple_core::dither::DitherEngine;
use stipple_core::image::Image;
use stipple_core::video::VideoDither;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stipple",
    version,
    about = "Dither images and video to small palettes with blue noise, on the GPU"
)]
struct Cli {
    /// Input image or video
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output destination; a .png output in video mode writes one PNG per
    /// frame
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Blue-noise texture (grayscale image)
    #[arg(short = 'b', long = "blue")]
    blue: PathBuf,

    /// Dither to 1-bit black/white instead of the 8-color palette
    #[arg(short = 'g', long = "gray")]
    gray: bool,

    /// Dither a single image (default)
    #[arg(long = "image", conflicts_with = "video")]
    image: bool,

    /// Dither the frames of a video
    #[arg(long = "video")]
    video: bool,

    /// Allow overwriting existing files
    #[arg(long)]
    overwrite: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let blue_noise = match Image::from_file(&cli.blue) {
        Ok(noise) if noise.is_grayscale() => noise,
        Ok(_) => {
            tracing::error!(
                "blue-noise file \"{}\" is not grayscale",
                cli.blue.display()
            );
            return ExitCode::from(1);
        }
        Err(error) => {
            tracing::error!("invalid blue-noise file \"{}\": {error}", cli.blue.display());
            return ExitCode::from(1);
        }
    };

    if cli.video && !cli.image {
        run_video(&cli, &blue_noise)
    } else {
        run_image(&cli, &blue_noise)
    }
}

fn run_image(cli: &Cli, blue_noise: &Image) -> ExitCode {
    let mut input = match Image::from_file(&cli.input) {
        Ok(image) => image,
        Err(error) => {
            tracing::error!("invalid input image \"{}\": {error}", cli.input.display());
            return ExitCode::from(2);
        }
    };

    let (dither_code, save_code) = if cli.gray { (3, 4) } else { (5, 6) };
    let mut engine = match DitherEngine::new() {
        Ok(engine) => engine,
        Err(error) => {
            tracing::error!("failed to set up the dither engine: {error}");
            return ExitCode::from(dither_code);
        }
    };

    let dithered = if cli.gray {
        engine.dither_grayscale(&mut input, blue_noise)
    } else {
        engine.dither_color(&mut input, blue_noise)
    };
    let dithered = match dithered {
        Ok(image) => image,
        Err(error) => {
            tracing::error!(
                "failed to dither input image \"{}\": {error}",
                cli.input.display()
            );
            return ExitCode::from(dither_code);
        }
    };

    if let Err(error) = dithered.save_png(&cli.output, cli.overwrite) {
        tracing::error!(
            "failed to save dithered image to \"{}\": {error}",
            cli.output.display()
        );
        return ExitCode::from(save_code);
    }
    ExitCode::SUCCESS
}

fn run_video(cli: &Cli, blue_noise: &Image) -> ExitCode {
    let mut engine = match DitherEngine::new() {
        Ok(engine) => engine,
        Err(error) => {
            tracing::error!("failed to set up the dither engine: {error}");
            return ExitCode::from(7);
        }
    };

    let output_as_pngs = cli
        .output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));

    let mut video = VideoDither::new(&cli.input);
    if let Err(error) = video.dither_video(
        &cli.output,
        &mut engine,
        blue_noise,
        cli.gray,
        cli.overwrite,
        output_as_pngs,
    ) {
        tracing::error!(
            "failed to dither frames from \"{}\": {error}",
            cli.input.display()
        );
        return ExitCode::from(7);
    }
    ExitCode::SUCCESS
}

//! Still photo snapshots
//!
//! A photo is the next routed video frame, converted to RGBA and encoded
//! as PNG. There is no encoding state machine behind it.

use crate::capture::frame::{FrameBuffer, FrameFormat, PixelFormat, Timestamp};
use crate::utils::error::{CaptureError, CaptureResult};
use std::path::Path;

/// A PNG-encoded snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPhoto {
    pub width: u32,
    pub height: u32,
    /// Source timestamp of the frame the photo was taken from
    pub pts: Timestamp,
    pub png: Vec<u8>,
}

impl CapturedPhoto {
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        std::fs::write(path, &self.png)?;
        Ok(())
    }
}

/// Take a snapshot of a video frame
pub fn snapshot(frame: &FrameBuffer) -> CaptureResult<CapturedPhoto> {
    let FrameFormat::Video {
        width,
        height,
        pixel_format,
    } = frame.format()
    else {
        return Err(CaptureError::UnsupportedFormat(
            "photos need a video frame".to_string(),
        ));
    };

    let data = frame.payload();
    let expected = pixel_format.frame_size(width, height);
    if data.len() < expected {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{} frame of {} bytes, expected {}",
            pixel_format.ffmpeg_name(),
            data.len(),
            expected
        )));
    }

    let rgba = to_rgba(&data[..expected], width, height, pixel_format);
    let png = encode_png(width, height, &rgba)?;

    Ok(CapturedPhoto {
        width,
        height,
        pts: frame.pts(),
        png,
    })
}

fn encode_png(width: u32, height: u32, rgba: &[u8]) -> CaptureResult<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| CaptureError::UnsupportedFormat(format!("PNG header error: {}", e)))?;
        writer
            .write_image_data(rgba)
            .map_err(|e| CaptureError::UnsupportedFormat(format!("PNG encode error: {}", e)))?;
        writer
            .finish()
            .map_err(|e| CaptureError::UnsupportedFormat(format!("PNG encode error: {}", e)))?;
    }
    Ok(out)
}

/// BT.601 limited-range YUV to RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

fn to_rgba(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut rgba = Vec::with_capacity(w * h * 4);

    match format {
        PixelFormat::Rgba => rgba.extend_from_slice(data),
        PixelFormat::Bgra => {
            for px in data.chunks_exact(4) {
                rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        PixelFormat::Rgb24 => {
            for px in data.chunks_exact(3) {
                rgba.extend_from_slice(px);
                rgba.push(255);
            }
        }
        PixelFormat::Yuyv422 => {
            // Y0 U Y1 V covers two pixels
            for quad in data.chunks_exact(4) {
                let [y0, u, y1, v] = [quad[0], quad[1], quad[2], quad[3]];
                rgba.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgba.push(255);
                rgba.extend_from_slice(&yuv_to_rgb(y1, u, v));
                rgba.push(255);
            }
        }
        PixelFormat::Nv12 => {
            let (luma, chroma) = data.split_at(w * h);
            for row in 0..h {
                for col in 0..w {
                    let y = luma[row * w + col];
                    let uv = (row / 2) * w + (col / 2) * 2;
                    let (u, v) = match chroma.get(uv..uv + 2) {
                        Some(pair) => (pair[0], pair[1]),
                        None => (128, 128),
                    };
                    rgba.extend_from_slice(&yuv_to_rgb(y, u, v));
                    rgba.push(255);
                }
            }
        }
    }

    rgba
}

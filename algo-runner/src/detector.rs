//! Detection backends.
//!
//! A [`Detector`] turns image bytes into a result document. The built-in
//! [`ProbeDetector`] runs no model: it identifies the image and reports an
//! empty detection list, which is enough to exercise the whole dispatch path.

use async_trait::async_trait;
use dispatch_common::InferenceRequest;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Output of one detection run.
#[derive(Debug, Clone)]
pub struct Detection {
    pub result: Value,
    pub confidence: f64,
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Short backend name reported by `/health`.
    fn name(&self) -> &str;

    async fn detect(&self, image: &[u8], request: &InferenceRequest) -> Result<Detection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Identify an image from its header bytes.
pub fn probe_image(data: &[u8]) -> Result<ImageInfo> {
    if data.starts_with(&PNG_SIGNATURE) {
        return probe_png(data);
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return probe_jpeg(data);
    }
    Err(Error::UnsupportedImage("not a PNG or JPEG image".to_string()))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn probe_png(data: &[u8]) -> Result<ImageInfo> {
    // Signature, then the IHDR chunk: length, type, width, height
    if data.len() < 24 || &data[12..16] != b"IHDR" {
        return Err(Error::UnsupportedImage("truncated PNG header".to_string()));
    }
    Ok(ImageInfo {
        format: ImageFormat::Png,
        width: be_u32(&data[16..20]),
        height: be_u32(&data[20..24]),
    })
}

fn probe_jpeg(data: &[u8]) -> Result<ImageInfo> {
    let mut i = 2;
    while i + 1 < data.len() {
        if data[i] != 0xFF {
            return Err(Error::UnsupportedImage("corrupt JPEG marker".to_string()));
        }
        let marker = data[i + 1];
        match marker {
            // Fill byte
            0xFF => {
                i += 1;
                continue;
            }
            // Markers without a payload
            0x01 | 0xD0..=0xD7 => {
                i += 2;
                continue;
            }
            0xD9 | 0xDA => break,
            _ => {}
        }

        if i + 4 > data.len() {
            break;
        }
        let length = be_u16(&data[i + 2..i + 4]) as usize;

        let is_frame_header = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame_header {
            if i + 9 > data.len() {
                break;
            }
            return Ok(ImageInfo {
                format: ImageFormat::Jpeg,
                height: be_u16(&data[i + 5..i + 7]) as u32,
                width: be_u16(&data[i + 7..i + 9]) as u32,
            });
        }
        i += 2 + length;
    }
    Err(Error::UnsupportedImage("JPEG without a frame header".to_string()))
}

/// Reports image format and size with no detections.
#[derive(Debug, Default)]
pub struct ProbeDetector;

#[async_trait]
impl Detector for ProbeDetector {
    fn name(&self) -> &str {
        "probe"
    }

    async fn detect(&self, image: &[u8], request: &InferenceRequest) -> Result<Detection> {
        let info = probe_image(image)?;
        tracing::debug!(
            "Probed {} for {}: {:?} {}x{}",
            request.image_path,
            request.task_id,
            info.format,
            info.width,
            info.height
        );
        Ok(Detection {
            result: json!({
                "task_type": request.task_type,
                "format": info.format,
                "width": info.width,
                "height": info.height,
                "detections": [],
                "count": 0,
            }),
            confidence: 0.0,
        })
    }
}

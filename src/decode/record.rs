//! Reference decoder for uncompressed fixed-size point records
//!
//! Record layout, little-endian, 21 bytes:
//!
//! | bytes | field                                  |
//! |-------|----------------------------------------|
//! | 0..12 | position, `i32 × 3`, scaled            |
//! | 12..14| intensity, `u16`                       |
//! | 14    | classification, `u8`                   |
//! | 15..21| colour, `u16 × 3`                      |

use std::sync::Arc;

use async_trait::async_trait;
use glam::DVec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::source::ByteSource;
use super::{DecodeRequest, DecodedAttributes, Decoder};
use crate::error::DecodeError;

/// Bytes per encoded point
pub const RECORD_SIZE: usize = 21;

/// Quantisation parameters shared by encoder and decoder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordLayout {
    /// World units per integer step
    pub scale: DVec3,
    /// World position of integer (0, 0, 0)
    pub origin: DVec3,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            scale: DVec3::splat(0.001),
            origin: DVec3::ZERO,
        }
    }
}

/// One point before encoding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    /// World position
    pub position: DVec3,
    /// Intensity
    pub intensity: u16,
    /// Classification code
    pub classification: u8,
    /// 16-bit rgb
    pub color: [u16; 3],
}

impl RecordLayout {
    /// Encode points into the record format
    pub fn encode(&self, points: &[RawPoint]) -> Vec<u8> {
        let mut out = Vec::with_capacity(points.len() * RECORD_SIZE);
        for p in points {
            let q = ((p.position - self.origin) / self.scale).round();
            for v in [q.x, q.y, q.z] {
                out.extend_from_slice(&(v as i32).to_le_bytes());
            }
            out.extend_from_slice(&p.intensity.to_le_bytes());
            out.push(p.classification);
            for c in p.color {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
        out
    }

    /// Decode records, subtracting `offset` from every position
    pub fn decode(&self, bytes: &[u8], offset: DVec3) -> Result<DecodedAttributes, DecodeError> {
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(DecodeError::malformed(format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                RECORD_SIZE
            )));
        }
        let n = bytes.len() / RECORD_SIZE;
        let mut attrs = DecodedAttributes {
            positions: Vec::with_capacity(n * 3),
            colors: Vec::with_capacity(n * 3),
            classification: Vec::with_capacity(n),
            intensity: Vec::with_capacity(n),
            indices: Vec::with_capacity(n),
        };

        for (i, rec) in bytes.chunks_exact(RECORD_SIZE).enumerate() {
            let xi = i32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
            let yi = i32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
            let zi = i32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]);
            let world = DVec3::new(xi as f64, yi as f64, zi as f64) * self.scale + self.origin;
            let local = world - offset;
            attrs.positions.extend_from_slice(&[local.x as f32, local.y as f32, local.z as f32]);

            attrs.intensity.push(u16::from_le_bytes([rec[12], rec[13]]));
            attrs.classification.push(rec[14] as i32);
            for c in 0..3 {
                let v = u16::from_le_bytes([rec[15 + 2 * c], rec[16 + 2 * c]]);
                attrs.colors.push((v / 257) as u8);
            }
            attrs.indices.push(i as u32);
        }
        Ok(attrs)
    }
}

/// Decoder reading records from a byte source
pub struct RecordDecoder<S: ByteSource> {
    source: Arc<S>,
    layout: RecordLayout,
}

impl<S: ByteSource> RecordDecoder<S> {
    /// Create a decoder over `source`
    pub fn new(source: Arc<S>, layout: RecordLayout) -> Self {
        Self { source, layout }
    }

    /// Quantisation in use
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }
}

#[async_trait]
impl<S: ByteSource> Decoder for RecordDecoder<S> {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError> {
        let d = &request.descriptor;
        if d.byte_size == 0 {
            return Ok(DecodedAttributes::empty());
        }
        let bytes = self
            .source
            .fetch(&request.source, d.byte_offset, d.byte_size)
            .await?;
        if (bytes.len() as u64) != d.byte_size {
            return Err(DecodeError::Truncated {
                expected: d.byte_size,
                actual: bytes.len() as u64,
            });
        }
        let attrs = self.layout.decode(&bytes, request.offset)?;
        debug!(tile = %request.tile, points = attrs.point_count(), "Decoded records");
        Ok(attrs)
    }
}

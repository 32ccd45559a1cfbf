//! Decode service contract
//!
//! ## Table of Contents
//! - **DecodeRequest**: What a worker is asked to decode
//! - **DecodedAttributes**: Parallel typed attribute arrays for one tile
//! - **Decoder**: The external capability the worker pool drives
//! - **source**: Byte-range sources (memory, files)
//! - **record**: Reference decoder for fixed-size little-endian records

pub mod record;
pub mod source;

use async_trait::async_trait;
use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::tile::TileDescriptor;
use crate::types::TileId;

pub use record::{RawPoint, RecordDecoder, RecordLayout};
pub use source::{ByteSource, FileSource, MemorySource};

/// Request handed to a decode worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeRequest {
    /// Tile being decoded
    pub tile: TileId,
    /// Source handle of the owning point cloud
    pub source: String,
    /// Byte range and declared point count
    pub descriptor: TileDescriptor,
    /// Coordinate offset subtracted from every decoded position
    pub offset: DVec3,
}

/// Decoded attributes for one tile, one entry (or triple) per point
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedAttributes {
    /// xyz triples, already offset-corrected
    pub positions: Vec<f32>,
    /// rgb triples
    pub colors: Vec<u8>,
    /// Classification code per point
    pub classification: Vec<i32>,
    /// Intensity per point
    pub intensity: Vec<u16>,
    /// Index of each point within the tile
    pub indices: Vec<u32>,
}

impl DecodedAttributes {
    /// Zero-point tile
    pub fn empty() -> Self {
        Self::default()
    }

    /// `points` points at the origin with zeroed attributes
    pub fn zeroed(points: usize) -> Self {
        Self {
            positions: vec![0.0; points * 3],
            colors: vec![0; points * 3],
            classification: vec![0; points],
            intensity: vec![0; points],
            indices: (0..points as u32).collect(),
        }
    }

    /// Number of decoded points
    pub fn point_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Whether the tile holds no points
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Check that every array agrees on the point count
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.positions.len() % 3 != 0 {
            return Err(DecodeError::malformed(format!(
                "position array length {} is not a multiple of 3",
                self.positions.len()
            )));
        }
        let n = self.point_count();
        let lengths = [
            ("colors", self.colors.len(), n * 3),
            ("classification", self.classification.len(), n),
            ("intensity", self.intensity.len(), n),
            ("indices", self.indices.len(), n),
        ];
        for (name, got, want) in lengths {
            if got != want {
                return Err(DecodeError::malformed(format!(
                    "{} has {} entries, expected {}",
                    name, got, want
                )));
            }
        }
        Ok(())
    }
}

/// External decode capability: bytes described by a request in, typed arrays out.
///
/// Implementations must accept zero-point tiles and return empty arrays.
#[async_trait]
pub trait Decoder: Send + Sync + 'static {
    /// Decode one tile
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedAttributes, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_is_consistent() {
        let a = DecodedAttributes::zeroed(4);
        assert_eq!(a.point_count(), 4);
        assert!(a.validate().is_ok());
        assert!(DecodedAttributes::empty().validate().is_ok());
        assert!(DecodedAttributes::empty().is_empty());
    }

    #[test]
    fn test_validate_rejects_ragged_arrays() {
        let mut a = DecodedAttributes::zeroed(2);
        a.intensity.pop();
        assert!(matches!(a.validate(), Err(DecodeError::Malformed(_))));

        let mut b = DecodedAttributes::zeroed(1);
        b.positions.push(1.0);
        assert!(b.validate().is_err());
    }
}

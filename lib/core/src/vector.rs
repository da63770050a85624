use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::simd;

/// Distance function identifier. Part of the query cache key, so the
/// discriminant values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DistanceType {
    Euclidean = 0,
    Cosine = 1,
    Dot = 2,
}

/// Dense single-precision vector.
///
/// Dimension is fixed per collection; zero-dimension vectors are rejected
/// at every entry point that constructs one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub data: Vec<f32>,
}

impl Vector {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Construct with dimension validation.
    pub fn with_dim(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidArgument("dimension must be nonzero".into()));
        }
        if data.len() != dim {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: data.len(),
            });
        }
        Ok(Self { data })
    }

    pub fn dim(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn dot(&self, other: &Vector) -> f32 {
        simd::dot_product(&self.data, &other.data)
    }

    pub fn l2_squared(&self, other: &Vector) -> f32 {
        simd::l2_squared(&self.data, &other.data)
    }

    pub fn l2_distance(&self, other: &Vector) -> f32 {
        simd::l2_distance(&self.data, &other.data)
    }

    pub fn norm(&self) -> f32 {
        simd::norm(&self.data)
    }

    /// Normalize in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let n = self.norm();
        if n > 0.0 {
            for x in &mut self.data {
                *x /= n;
            }
        }
    }

    pub fn distance(&self, other: &Vector, distance_type: DistanceType) -> f32 {
        match distance_type {
            DistanceType::Euclidean => self.l2_distance(other),
            DistanceType::Cosine => {
                let denom = self.norm() * other.norm();
                if denom > 0.0 {
                    1.0 - self.dot(other) / denom
                } else {
                    1.0
                }
            }
            DistanceType::Dot => -self.dot(other),
        }
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

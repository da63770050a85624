//! Product-quantization codebook.
//!
//! Vectors are split into `m` contiguous subspaces and each subspace is
//! quantized independently with its own k-means codebook of `2^nbits`
//! centroids. Training is deterministic: the PRNG seed is derived from the
//! training set size and `m`, so retraining on identical input reproduces
//! the codebook bit for bit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::rng::XorShift32;
use crate::simd;

const MAGIC: &[u8; 4] = b"GVCB";
const VERSION: u32 = 1;

/// Trained product quantizer. Immutable once trained; encode, decode and
/// ADC are stateless reads.
#[derive(Debug, Clone)]
pub struct PqCodebook {
    dimension: usize,
    m: usize,
    nbits: u8,
    ksub: usize,
    dsub: usize,
    /// `m * ksub * dsub` floats, subspace-major.
    centroids: Vec<f32>,
    trained: bool,
}

impl PqCodebook {
    pub fn new(dimension: usize, m: usize, nbits: u8) -> Result<Self> {
        if dimension == 0 || m == 0 || nbits == 0 || nbits > 8 {
            return Err(Error::InvalidArgument(format!(
                "invalid codebook shape: dimension={dimension}, m={m}, nbits={nbits}"
            )));
        }
        if dimension % m != 0 {
            return Err(Error::InvalidArgument(format!(
                "dimension {dimension} not divisible by m {m}"
            )));
        }

        let ksub = 1usize << nbits;
        let dsub = dimension / m;
        Ok(Self {
            dimension,
            m,
            nbits,
            ksub,
            dsub,
            centroids: vec![0.0; m * ksub * dsub],
            trained: false,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn num_subspaces(&self) -> usize {
        self.m
    }

    pub fn nbits(&self) -> u8 {
        self.nbits
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Train on `count` row-major vectors. `data.len()` must be a multiple
    /// of the dimension.
    pub fn train(&mut self, data: &[f32], iters: usize) -> Result<()> {
        if data.is_empty() || iters == 0 {
            return Err(Error::InvalidArgument(
                "training data and iterations must be nonzero".into(),
            ));
        }
        if data.len() % self.dimension != 0 {
            return Err(Error::InvalidDimension {
                expected: self.dimension,
                actual: data.len() % self.dimension,
            });
        }
        let count = data.len() / self.dimension;

        // One PRNG stream shared across subspaces keeps training
        // reproducible for a given (count, m).
        let seed = (count as u32)
            .wrapping_mul(2654435761)
            .wrapping_add((self.m as u32).wrapping_mul(40503))
            .wrapping_add(1);
        let mut rng = XorShift32::new(seed);

        let mut subvecs = vec![0.0f32; count * self.dsub];
        for mi in 0..self.m {
            // Gather the mi-th slice of every training vector into a
            // contiguous buffer.
            for i in 0..count {
                let src = i * self.dimension + mi * self.dsub;
                let dst = i * self.dsub;
                subvecs[dst..dst + self.dsub]
                    .copy_from_slice(&data[src..src + self.dsub]);
            }

            let base = mi * self.ksub * self.dsub;
            let sub_codebook = &mut self.centroids[base..base + self.ksub * self.dsub];
            kmeans_subspace(sub_codebook, &subvecs, count, self.dsub, self.ksub, iters, &mut rng);
        }

        self.trained = true;
        Ok(())
    }

    /// Quantize a vector to `m` one-byte codes.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.check_trained()?;
        self.check_dim(vector)?;

        let mut codes = vec![0u8; self.m];
        for (mi, code) in codes.iter_mut().enumerate() {
            let subvec = &vector[mi * self.dsub..(mi + 1) * self.dsub];
            let base = mi * self.ksub * self.dsub;

            let mut best_d = f32::MAX;
            let mut best_c = 0u8;
            for k in 0..self.ksub {
                let centroid = &self.centroids[base + k * self.dsub..base + (k + 1) * self.dsub];
                let d = simd::l2_squared(subvec, centroid);
                if d < best_d {
                    best_d = d;
                    best_c = k as u8;
                }
            }
            *code = best_c;
        }
        Ok(codes)
    }

    /// Reconstruct the centroid concatenation addressed by `codes`.
    pub fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        self.check_trained()?;
        self.check_codes(codes)?;

        let mut output = vec![0.0f32; self.dimension];
        for (mi, &code) in codes.iter().enumerate() {
            let base = mi * self.ksub * self.dsub + code as usize * self.dsub;
            output[mi * self.dsub..(mi + 1) * self.dsub]
                .copy_from_slice(&self.centroids[base..base + self.dsub]);
        }
        Ok(output)
    }

    /// Asymmetric distance between a raw query and a coded vector.
    ///
    /// Builds the per-subspace distance table first, then accumulates the
    /// table entries addressed by the codes.
    pub fn distance_adc(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        self.check_trained()?;
        self.check_dim(query)?;
        self.check_codes(codes)?;

        let mut table = vec![0.0f32; self.m * self.ksub];
        for mi in 0..self.m {
            let q_sub = &query[mi * self.dsub..(mi + 1) * self.dsub];
            let base = mi * self.ksub * self.dsub;
            for k in 0..self.ksub {
                let centroid = &self.centroids[base + k * self.dsub..base + (k + 1) * self.dsub];
                table[mi * self.ksub + k] = simd::l2_squared(q_sub, centroid);
            }
        }

        let mut dist_sq = 0.0f32;
        for (mi, &code) in codes.iter().enumerate() {
            dist_sq += table[mi * self.ksub + code as usize];
        }
        Ok(dist_sq.sqrt())
    }

    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.dimension as u32).to_le_bytes())?;
        w.write_all(&(self.m as u32).to_le_bytes())?;
        w.write_all(&[self.nbits])?;
        w.write_all(&(self.trained as u32).to_le_bytes())?;
        for &c in &self.centroids {
            w.write_all(&c.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Corrupt("bad codebook magic".into()));
        }

        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported codebook version {version}"
            )));
        }

        let dimension = read_u32(&mut r)? as usize;
        let m = read_u32(&mut r)? as usize;
        let mut nbits = [0u8; 1];
        r.read_exact(&mut nbits)?;
        let trained = read_u32(&mut r)?;

        let mut cb = Self::new(dimension, m, nbits[0])
            .map_err(|_| Error::Corrupt("invalid codebook header".into()))?;

        let mut buf = [0u8; 4];
        for c in &mut cb.centroids {
            r.read_exact(&mut buf)
                .map_err(|_| Error::Corrupt("truncated centroid data".into()))?;
            *c = f32::from_le_bytes(buf);
        }

        cb.trained = trained != 0;
        Ok(cb)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.save(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }

    fn check_trained(&self) -> Result<()> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        Ok(())
    }

    fn check_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn check_codes(&self, codes: &[u8]) -> Result<()> {
        if codes.len() != self.m {
            return Err(Error::InvalidArgument(format!(
                "expected {} codes, got {}",
                self.m,
                codes.len()
            )));
        }
        Ok(())
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Lloyd's algorithm for one subspace.
///
/// The PRNG stream is strictly sequential (initialization, then any
/// empty-cluster reseeds in iteration order), so only the pure assignment
/// step runs in parallel.
fn kmeans_subspace(
    codebook: &mut [f32],
    subvecs: &[f32],
    count: usize,
    dsub: usize,
    ksub: usize,
    iters: usize,
    rng: &mut XorShift32,
) {
    if count == 0 || ksub == 0 || dsub == 0 {
        return;
    }

    // Initialize centroids from a Fisher-Yates partial shuffle of the
    // training slices; surplus centroids stay zero when count < ksub.
    let init_k = ksub.min(count);
    let mut perm: Vec<usize> = (0..count).collect();
    for i in 0..init_k {
        let j = i + (rng.next_u32() as usize) % (count - i);
        perm.swap(i, j);
        codebook[i * dsub..(i + 1) * dsub]
            .copy_from_slice(&subvecs[perm[i] * dsub..(perm[i] + 1) * dsub]);
    }
    for k in init_k..ksub {
        codebook[k * dsub..(k + 1) * dsub].fill(0.0);
    }

    let mut accum = vec![0.0f32; ksub * dsub];
    let mut counts = vec![0u32; ksub];

    for _ in 0..iters {
        // Assignment step: nearest centroid by squared distance.
        let assignments: Vec<u32> = subvecs[..count * dsub]
            .par_chunks_exact(dsub)
            .map(|vec| {
                let mut best_d = f32::MAX;
                let mut best_k = 0u32;
                for k in 0..ksub {
                    let d = simd::l2_squared(vec, &codebook[k * dsub..(k + 1) * dsub]);
                    if d < best_d {
                        best_d = d;
                        best_k = k as u32;
                    }
                }
                best_k
            })
            .collect();

        // Update step.
        accum.fill(0.0);
        counts.fill(0);
        for (i, &k) in assignments.iter().enumerate() {
            let k = k as usize;
            counts[k] += 1;
            let vec = &subvecs[i * dsub..(i + 1) * dsub];
            let dst = &mut accum[k * dsub..(k + 1) * dsub];
            for (d, &v) in dst.iter_mut().zip(vec) {
                *d += v;
            }
        }

        for k in 0..ksub {
            if counts[k] > 0 {
                let inv = 1.0 / counts[k] as f32;
                for d in 0..dsub {
                    codebook[k * dsub + d] = accum[k * dsub + d] * inv;
                }
            } else {
                // Empty cluster: reseed from a pseudorandom training slice.
                let rand_idx = (rng.next_u32() as usize) % count;
                codebook[k * dsub..(k + 1) * dsub]
                    .copy_from_slice(&subvecs[rand_idx * dsub..(rand_idx + 1) * dsub]);
            }
        }
    }
}

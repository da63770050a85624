//! MUVERA encoding: fixed-size single-vector encodings of variable-length
//! multi-vector (token) embeddings.
//!
//! Each of `num_projections` random sign vectors splits the tokens into two
//! buckets on the sign of the dot product. Tokens are first reduced to
//! `reduced_dim` by a random projection matrix; the per-bucket means are
//! concatenated across projections and optionally L2-normalized.
//!
//! The encoder is immutable after creation; encoding touches only shared
//! state and caller buffers.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rng::Xoshiro256;
use crate::simd;

const MAGIC: &[u8; 7] = b"GV_MUVR";
const VERSION: u32 = 1;

/// Binary bucket hashing: bucket 0 (dot ≤ 0) and bucket 1 (dot > 0).
const NUM_BUCKETS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuveraConfig {
    pub token_dimension: usize,
    pub num_projections: usize,
    /// 0 means auto: `num_projections * token_dimension / 4`, then rounded
    /// down to a multiple of `num_projections * 2`.
    pub output_dimension: usize,
    pub seed: u64,
    pub normalize: bool,
}

impl Default for MuveraConfig {
    fn default() -> Self {
        Self {
            token_dimension: 128,
            num_projections: 64,
            output_dimension: 0,
            seed: 42,
            normalize: true,
        }
    }
}

/// Deterministic multi-vector to single-vector encoder.
pub struct MuveraEncoder {
    config: MuveraConfig,
    reduced_dim: usize,
    /// `num_projections * token_dimension` entries of +1.0 or -1.0.
    sign_vectors: Vec<f32>,
    /// `reduced_dim * token_dimension`, scaled by `1/sqrt(reduced_dim)`.
    proj_matrix: Vec<f32>,
}

impl MuveraEncoder {
    pub fn new(config: MuveraConfig) -> Self {
        let mut cfg = config;
        if cfg.token_dimension == 0 {
            cfg.token_dimension = 128;
        }
        if cfg.num_projections == 0 {
            cfg.num_projections = 64;
        }
        if cfg.seed == 0 {
            cfg.seed = 42;
        }

        let np = cfg.num_projections;
        let td = cfg.token_dimension;
        if cfg.output_dimension == 0 {
            cfg.output_dimension = np * td / 4;
        }

        // output_dimension = num_projections * NUM_BUCKETS * reduced_dim;
        // round the requested value down to the nearest representable size.
        let reduced_dim = (cfg.output_dimension / (np * NUM_BUCKETS)).max(1);
        cfg.output_dimension = np * NUM_BUCKETS * reduced_dim;

        let mut rng = Xoshiro256::new(cfg.seed);
        let mut sign_vectors = Vec::with_capacity(np * td);
        for _ in 0..np * td {
            sign_vectors.push(rng.next_sign());
        }

        let scale = 1.0 / (reduced_dim as f32).sqrt();
        let mut proj_matrix = Vec::with_capacity(reduced_dim * td);
        for _ in 0..reduced_dim * td {
            proj_matrix.push(rng.next_uniform() * scale);
        }

        Self { config: cfg, reduced_dim, sign_vectors, proj_matrix }
    }

    pub fn config(&self) -> &MuveraConfig {
        &self.config
    }

    pub fn output_dimension(&self) -> usize {
        self.config.output_dimension
    }

    pub fn reduced_dimension(&self) -> usize {
        self.reduced_dim
    }

    /// Encode one token set (flat `num_tokens * token_dimension` floats).
    ///
    /// An empty slice encodes to the zero vector.
    pub fn encode(&self, tokens: &[f32]) -> Result<Vec<f32>> {
        let td = self.config.token_dimension;
        if tokens.len() % td != 0 {
            return Err(Error::InvalidDimension {
                expected: td,
                actual: tokens.len(),
            });
        }

        let num_tokens = tokens.len() / td;
        let np = self.config.num_projections;
        let rd = self.reduced_dim;
        let od = self.config.output_dimension;

        let mut output = vec![0.0f32; od];
        if num_tokens == 0 {
            return Ok(output);
        }

        // Pre-project every token into the reduced space.
        let mut reduced_tokens = vec![0.0f32; num_tokens * rd];
        for (t, token) in tokens.chunks_exact(td).enumerate() {
            let reduced = &mut reduced_tokens[t * rd..(t + 1) * rd];
            for (r, out) in reduced.iter_mut().enumerate() {
                *out = simd::dot_product(&self.proj_matrix[r * td..(r + 1) * td], token);
            }
        }

        // Hash each token per projection and accumulate bucket sums.
        let mut bucket_counts = vec![0usize; np * NUM_BUCKETS];
        for i in 0..np {
            let sign_vec = &self.sign_vectors[i * td..(i + 1) * td];
            for (t, token) in tokens.chunks_exact(td).enumerate() {
                let bucket = if simd::dot_product(sign_vec, token) > 0.0 { 1 } else { 0 };
                let out_offset = (i * NUM_BUCKETS + bucket) * rd;
                let rtok = &reduced_tokens[t * rd..(t + 1) * rd];
                for (d, &v) in rtok.iter().enumerate() {
                    output[out_offset + d] += v;
                }
                bucket_counts[i * NUM_BUCKETS + bucket] += 1;
            }
        }

        // Bucket sums become means; empty buckets stay zero.
        for (slot, &cnt) in bucket_counts.iter().enumerate() {
            if cnt > 0 {
                let inv = 1.0 / cnt as f32;
                for v in &mut output[slot * rd..(slot + 1) * rd] {
                    *v *= inv;
                }
            }
        }

        if self.config.normalize {
            let norm_sq: f32 = output.iter().map(|v| v * v).sum();
            if norm_sq > 0.0 {
                let inv_norm = 1.0 / norm_sq.sqrt();
                for v in &mut output {
                    *v *= inv_norm;
                }
            }
        }

        Ok(output)
    }

    /// Encode several token sets in one call.
    pub fn encode_batch(&self, token_sets: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        token_sets.iter().map(|set| self.encode(set)).collect()
    }

    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.config.token_dimension as u64).to_le_bytes())?;
        w.write_all(&(self.config.num_projections as u64).to_le_bytes())?;
        w.write_all(&(self.config.output_dimension as u64).to_le_bytes())?;
        w.write_all(&self.config.seed.to_le_bytes())?;
        w.write_all(&u32::from(self.config.normalize).to_le_bytes())?;
        w.write_all(&(self.reduced_dim as u64).to_le_bytes())?;
        for &v in &self.sign_vectors {
            w.write_all(&v.to_le_bytes())?;
        }
        for &v in &self.proj_matrix {
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 7];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Corrupt("bad encoder magic".into()));
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported encoder version {}",
                version
            )));
        }

        let token_dimension = read_u64(&mut r)? as usize;
        let num_projections = read_u64(&mut r)? as usize;
        let output_dimension = read_u64(&mut r)? as usize;
        let seed = read_u64(&mut r)?;
        let normalize = read_u32(&mut r)? != 0;
        let reduced_dim = read_u64(&mut r)? as usize;

        if token_dimension == 0
            || num_projections == 0
            || output_dimension == 0
            || reduced_dim == 0
        {
            return Err(Error::Corrupt("invalid encoder header".into()));
        }

        let mut sign_vectors = vec![0.0f32; num_projections * token_dimension];
        read_f32_into(&mut r, &mut sign_vectors)?;
        let mut proj_matrix = vec![0.0f32; reduced_dim * token_dimension];
        read_f32_into(&mut r, &mut proj_matrix)?;

        Ok(Self {
            config: MuveraConfig {
                token_dimension,
                num_projections,
                output_dimension,
                seed,
                normalize,
            },
            reduced_dim,
            sign_vectors,
            proj_matrix,
        })
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
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32_into<R: Read>(r: &mut R, out: &mut [f32]) -> Result<()> {
    let mut buf = [0u8; 4];
    for v in out {
        r.read_exact(&mut buf)
            .map_err(|_| Error::Corrupt("truncated encoder data".into()))?;
        *v = f32::from_le_bytes(buf);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MuveraConfig {
        MuveraConfig {
            token_dimension: 8,
            num_projections: 4,
            output_dimension: 0,
            seed: 7,
            normalize: false,
        }
    }

    #[test]
    fn default_output_dimension() {
        let enc = MuveraEncoder::new(MuveraConfig::default());
        // 64 * 128 / 4 = 2048 = 64 * 2 * 16, already representable.
        assert_eq!(enc.output_dimension(), 2048);
        assert_eq!(enc.reduced_dimension(), 16);
    }

    #[test]
    fn requested_output_dimension_is_rounded() {
        let config = MuveraConfig {
            token_dimension: 16,
            num_projections: 8,
            output_dimension: 100,
            seed: 1,
            normalize: false,
        };
        let enc = MuveraEncoder::new(config);
        // 100 / (8 * 2) = 6 reduced dims, so 8 * 2 * 6 = 96.
        assert_eq!(enc.output_dimension(), 96);
        assert_eq!(enc.reduced_dimension(), 6);
    }

    #[test]
    fn zero_fields_fall_back_to_defaults() {
        let enc = MuveraEncoder::new(MuveraConfig {
            token_dimension: 0,
            num_projections: 0,
            output_dimension: 0,
            seed: 0,
            normalize: true,
        });
        assert_eq!(enc.config().token_dimension, 128);
        assert_eq!(enc.config().num_projections, 64);
        assert_eq!(enc.config().seed, 42);
    }

    #[test]
    fn encoding_is_deterministic() {
        let tokens: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
        let a = MuveraEncoder::new(small_config()).encode(&tokens).unwrap();
        let b = MuveraEncoder::new(small_config()).encode(&tokens).unwrap();
        assert_eq!(a, b);

        let mut other = small_config();
        other.seed = 8;
        let c = MuveraEncoder::new(other).encode(&tokens).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn empty_token_set_encodes_to_zero() {
        let enc = MuveraEncoder::new(small_config());
        let out = enc.encode(&[]).unwrap();
        assert_eq!(out.len(), enc.output_dimension());
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn ragged_input_rejected() {
        let enc = MuveraEncoder::new(small_config());
        assert!(enc.encode(&[1.0; 9]).is_err());
    }

    #[test]
    fn normalized_output_has_unit_norm() {
        let mut config = small_config();
        config.normalize = true;
        let enc = MuveraEncoder::new(config);
        let tokens: Vec<f32> = (0..32).map(|i| (i as f32 * 0.11).cos()).collect();
        let out = enc.encode(&tokens).unwrap();
        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn batch_matches_individual_encodes() {
        let enc = MuveraEncoder::new(small_config());
        let a: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..8).map(|i| -(i as f32)).collect();
        let batch = enc.encode_batch(&[&a, &b]).unwrap();
        assert_eq!(batch[0], enc.encode(&a).unwrap());
        assert_eq!(batch[1], enc.encode(&b).unwrap());
    }

    #[test]
    fn save_load_round_trip_is_byte_identical() {
        let enc = MuveraEncoder::new(small_config());
        let mut buf = Vec::new();
        enc.save(&mut buf).unwrap();

        let loaded = MuveraEncoder::load(buf.as_slice()).unwrap();
        let mut buf2 = Vec::new();
        loaded.save(&mut buf2).unwrap();
        assert_eq!(buf, buf2);

        let tokens: Vec<f32> = (0..40).map(|i| (i as f32 * 0.21).sin()).collect();
        assert_eq!(enc.encode(&tokens).unwrap(), loaded.encode(&tokens).unwrap());
    }

    #[test]
    fn load_rejects_corrupt_input() {
        let enc = MuveraEncoder::new(small_config());
        let mut buf = Vec::new();
        enc.save(&mut buf).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(MuveraEncoder::load(bad_magic.as_slice()).is_err());

        let mut bad_version = buf.clone();
        bad_version[7] = 99;
        assert!(MuveraEncoder::load(bad_version.as_slice()).is_err());

        assert!(MuveraEncoder::load(&buf[..buf.len() - 3]).is_err());
    }

    #[test]
    fn save_load_via_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoder.bin");
        let enc = MuveraEncoder::new(small_config());
        enc.save_to_path(&path).unwrap();
        let loaded = MuveraEncoder::load_from_path(&path).unwrap();
        assert_eq!(loaded.output_dimension(), enc.output_dimension());
    }
}

//! Sample streams feeding the trainer
//!
//! A stream hands out batches of triplets `(X_t, X_{t+k}, X_j)`:
//! - `X_t` and `X_{t+k}` are frames of one utterance, `k` apart
//! - `X_j` is a frame from an utterance of another speaker
//!
//! Streams never end. Anything that would stop them from producing a valid
//! triplet is reported when the stream is built.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use super::DatasetConfig;
use crate::error::TrainError;

/// One batch of aligned frames, each `(batch, feature_dim)`
#[derive(Debug, Clone)]
pub struct SampleTriplet {
    pub x_t: Tensor,
    pub x_tk: Tensor,
    pub x_j: Tensor,
}

pub trait SampleStream {
    fn next_triplet(&mut self) -> Result<SampleTriplet>;
    fn feature_dim(&self) -> usize;
}

impl<S: SampleStream + ?Sized> SampleStream for Box<S> {
    fn next_triplet(&mut self) -> Result<SampleTriplet> {
        (**self).next_triplet()
    }

    fn feature_dim(&self) -> usize {
        (**self).feature_dim()
    }
}

/// Entry of a speaker index file
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEntry {
    pub id: String,
    pub sex: Option<String>,
}

/// Read a speaker index: one `speaker_id [sex]` per line, `#` starts a comment
pub fn load_speaker_index(path: &Path) -> Result<Vec<SpeakerEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read speaker index: {}", path.display()))?;

    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next() else {
            continue;
        };
        entries.push(SpeakerEntry {
            id: id.to_string(),
            sex: fields.next().map(str::to_string),
        });
    }
    Ok(entries)
}

struct Utterance {
    frames: usize,
    // Row-major (frames, feature_dim)
    data: Vec<f32>,
}

impl Utterance {
    fn frame(&self, index: usize, dim: usize) -> &[f32] {
        &self.data[index * dim..(index + 1) * dim]
    }
}

/// Stream over a safetensors store of per-utterance feature matrices keyed
/// `"{speaker}/{utterance}"`
pub struct FeatureStoreStream {
    speakers: Vec<(String, Vec<Utterance>)>,
    feature_dim: usize,
    batch_size: usize,
    max_offset: usize,
    rng: StdRng,
    device: Device,
}

impl FeatureStoreStream {
    pub fn open(config: &DatasetConfig, device: &Device) -> Result<Self> {
        let store = config
            .feature_store
            .as_ref()
            .ok_or_else(|| TrainError::config("dataset.feature_store is required"))?;
        if config.batch_size == 0 || config.max_offset == 0 {
            return Err(TrainError::config("batch_size and max_offset must be at least 1").into());
        }

        let allowed: Option<HashSet<String>> = match &config.speaker_index {
            Some(path) => Some(load_speaker_index(path)?.into_iter().map(|e| e.id).collect()),
            None => None,
        };

        let tensors = candle_core::safetensors::load(store, &Device::Cpu)
            .with_context(|| format!("Failed to load feature store: {}", store.display()))?;

        let mut grouped: BTreeMap<String, Vec<(String, Utterance)>> = BTreeMap::new();
        let mut feature_dim = None;
        let mut skipped = 0;

        for (key, tensor) in tensors {
            let Some((speaker, utterance)) = key.split_once('/') else {
                warn!("Ignoring feature store entry without speaker prefix: {}", key);
                continue;
            };
            if let Some(allowed) = &allowed {
                if !allowed.contains(speaker) {
                    continue;
                }
            }

            let (frames, dim) = tensor.dims2().map_err(|_| {
                TrainError::Stream(format!("{} has shape {:?}, expected (frames, dim)", key, tensor.dims()))
            })?;
            match feature_dim {
                None => feature_dim = Some(dim),
                Some(expected) if expected != dim => {
                    return Err(TrainError::Stream(format!(
                        "{} has feature_dim {}, expected {}",
                        key, dim, expected
                    ))
                    .into())
                }
                _ => {}
            }

            if frames <= config.max_offset {
                warn!(
                    "Skipping {}: {} frames, need more than max_offset={}",
                    key, frames, config.max_offset
                );
                skipped += 1;
                continue;
            }

            let data: Vec<f32> = tensor.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1()?;
            grouped
                .entry(speaker.to_string())
                .or_default()
                .push((utterance.to_string(), Utterance { frames, data }));
        }

        // Utterance order inside a speaker must not depend on hash order
        let speakers: Vec<(String, Vec<Utterance>)> = grouped
            .into_iter()
            .map(|(speaker, mut utts)| {
                utts.sort_by(|a, b| a.0.cmp(&b.0));
                (speaker, utts.into_iter().map(|(_, u)| u).collect())
            })
            .collect();

        if speakers.len() < 2 {
            return Err(TrainError::Stream(format!(
                "need utterances from at least 2 speakers, found {}",
                speakers.len()
            ))
            .into());
        }
        let feature_dim = feature_dim.ok_or_else(|| TrainError::Stream("feature store is empty".into()))?;

        let utterances: usize = speakers.iter().map(|(_, u)| u.len()).sum();
        info!(
            "Feature store: {} speakers, {} utterances, feature_dim={}, {} skipped",
            speakers.len(),
            utterances,
            feature_dim,
            skipped
        );

        Ok(Self {
            speakers,
            feature_dim,
            batch_size: config.batch_size,
            max_offset: config.max_offset,
            rng: StdRng::seed_from_u64(config.seed),
            device: device.clone(),
        })
    }

    pub fn num_speakers(&self) -> usize {
        self.speakers.len()
    }
}

impl SampleStream for FeatureStoreStream {
    fn next_triplet(&mut self) -> Result<SampleTriplet> {
        let dim = self.feature_dim;
        let n = self.batch_size * dim;
        let (mut x_t, mut x_tk, mut x_j) = (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));

        for _ in 0..self.batch_size {
            let speaker = self.rng.gen_range(0..self.speakers.len());
            let utts = &self.speakers[speaker].1;
            let utt = &utts[self.rng.gen_range(0..utts.len())];
            let k = self.rng.gen_range(1..=self.max_offset);
            let t = self.rng.gen_range(0..utt.frames - k);
            x_t.extend_from_slice(utt.frame(t, dim));
            x_tk.extend_from_slice(utt.frame(t + k, dim));

            // Any speaker but the first one
            let mut other = self.rng.gen_range(0..self.speakers.len() - 1);
            if other >= speaker {
                other += 1;
            }
            let utts = &self.speakers[other].1;
            let utt = &utts[self.rng.gen_range(0..utts.len())];
            x_j.extend_from_slice(utt.frame(self.rng.gen_range(0..utt.frames), dim));
        }

        let shape = (self.batch_size, dim);
        Ok(SampleTriplet {
            x_t: Tensor::from_vec(x_t, shape, &self.device)?,
            x_tk: Tensor::from_vec(x_tk, shape, &self.device)?,
            x_j: Tensor::from_vec(x_j, shape, &self.device)?,
        })
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// Gaussian frames for smoke runs and tests.
///
/// `X_{t+k}` is `X_t` plus small noise, or an exact copy when
/// `identical_pairs` is set.
pub struct SyntheticStream {
    feature_dim: usize,
    batch_size: usize,
    identical_pairs: bool,
    rng: StdRng,
    device: Device,
}

impl SyntheticStream {
    pub fn new(feature_dim: usize, batch_size: usize, seed: u64, device: &Device) -> Self {
        Self {
            feature_dim,
            batch_size,
            identical_pairs: false,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    pub fn with_identical_pairs(mut self, identical: bool) -> Self {
        self.identical_pairs = identical;
        self
    }
}

impl SampleStream for SyntheticStream {
    fn next_triplet(&mut self) -> Result<SampleTriplet> {
        let n = self.batch_size * self.feature_dim;
        let frame = Normal::new(0.0f32, 1.0)?;
        let jitter = Normal::new(0.0f32, 0.1)?;

        let x_t: Vec<f32> = (0..n).map(|_| frame.sample(&mut self.rng)).collect();
        let x_tk: Vec<f32> = if self.identical_pairs {
            x_t.clone()
        } else {
            x_t.iter().map(|v| v + jitter.sample(&mut self.rng)).collect()
        };
        let x_j: Vec<f32> = (0..n).map(|_| frame.sample(&mut self.rng)).collect();

        let shape = (self.batch_size, self.feature_dim);
        Ok(SampleTriplet {
            x_t: Tensor::from_vec(x_t, shape, &self.device)?,
            x_tk: Tensor::from_vec(x_tk, shape, &self.device)?,
            x_j: Tensor::from_vec(x_j, shape, &self.device)?,
        })
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    // Frame i of speaker s has every value equal to s * 1000 + i
    fn write_store(dir: &Path, layout: &[(&str, &str, usize)], dim: usize) -> PathBuf {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        for (speaker, utt, frames) in layout {
            let base: f32 = speaker.trim_start_matches('s').parse::<f32>().unwrap() * 1000.0;
            let data: Vec<f32> = (0..*frames)
                .flat_map(|i| std::iter::repeat(base + i as f32).take(dim))
                .collect();
            let t = Tensor::from_vec(data, (*frames, dim), &device).unwrap();
            tensors.insert(format!("{}/{}", speaker, utt), t);
        }
        let path = dir.join("features.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    fn config(store: PathBuf) -> DatasetConfig {
        DatasetConfig {
            feature_store: Some(store),
            speaker_index: None,
            batch_size: 16,
            max_offset: 3,
            seed: 11,
        }
    }

    #[test]
    fn test_speaker_index_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("speakers.txt");
        fs::write(&path, "# id sex\np225 F\n\np226 M # comment\np227\n").unwrap();
        let entries = load_speaker_index(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], SpeakerEntry { id: "p225".into(), sex: Some("F".into()) });
        assert_eq!(entries[1].sex.as_deref(), Some("M"));
        assert_eq!(entries[2].sex, None);
    }

    #[test]
    fn test_triplet_structure() {
        let dir = TempDir::new().unwrap();
        let store = write_store(dir.path(), &[("s1", "a", 20), ("s1", "b", 12), ("s2", "a", 15)], 4);
        let mut stream = FeatureStoreStream::open(&config(store), &Device::Cpu).unwrap();
        assert_eq!(stream.feature_dim(), 4);

        for _ in 0..5 {
            let triplet = stream.next_triplet().unwrap();
            assert_eq!(triplet.x_t.dims(), &[16, 4]);
            let t: Vec<Vec<f32>> = triplet.x_t.to_vec2().unwrap();
            let tk: Vec<Vec<f32>> = triplet.x_tk.to_vec2().unwrap();
            let j: Vec<Vec<f32>> = triplet.x_j.to_vec2().unwrap();
            for row in 0..16 {
                let speaker_t = (t[row][0] / 1000.0).floor();
                let speaker_j = (j[row][0] / 1000.0).floor();
                let k = tk[row][0] - t[row][0];
                assert!((1.0..=3.0).contains(&k), "offset {} out of range", k);
                assert_ne!(speaker_t, speaker_j);
            }
        }
    }

    #[test]
    fn test_same_seed_same_stream() {
        let dir = TempDir::new().unwrap();
        let store = write_store(dir.path(), &[("s1", "a", 20), ("s2", "a", 20), ("s3", "a", 9)], 2);
        let mut a = FeatureStoreStream::open(&config(store.clone()), &Device::Cpu).unwrap();
        let mut b = FeatureStoreStream::open(&config(store), &Device::Cpu).unwrap();
        let ta: Vec<Vec<f32>> = a.next_triplet().unwrap().x_j.to_vec2().unwrap();
        let tb: Vec<Vec<f32>> = b.next_triplet().unwrap().x_j.to_vec2().unwrap();
        assert_eq!(ta, tb);
    }

    #[test]
    fn test_short_utterances_and_single_speaker_fail() {
        let dir = TempDir::new().unwrap();
        // s2 only has an utterance too short for max_offset=3
        let store = write_store(dir.path(), &[("s1", "a", 20), ("s2", "a", 3)], 2);
        let err = FeatureStoreStream::open(&config(store), &Device::Cpu).err().unwrap();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::Stream(_))));
    }

    #[test]
    fn test_speaker_index_filters() {
        let dir = TempDir::new().unwrap();
        let store = write_store(dir.path(), &[("s1", "a", 20), ("s2", "a", 20), ("s3", "a", 20)], 2);
        let index = dir.path().join("speakers.txt");
        fs::write(&index, "s1 F\ns3 M\n").unwrap();

        let mut cfg = config(store);
        cfg.speaker_index = Some(index);
        let mut stream = FeatureStoreStream::open(&cfg, &Device::Cpu).unwrap();
        assert_eq!(stream.num_speakers(), 2);
        let t: Vec<Vec<f32>> = stream.next_triplet().unwrap().x_t.to_vec2().unwrap();
        assert!(t.iter().all(|row| (row[0] / 1000.0).floor() != 2.0));
    }

    #[test]
    fn test_synthetic_identical_pairs() {
        let mut stream = SyntheticStream::new(5, 4, 1, &Device::Cpu).with_identical_pairs(true);
        let triplet = stream.next_triplet().unwrap();
        let t: Vec<Vec<f32>> = triplet.x_t.to_vec2().unwrap();
        let tk: Vec<Vec<f32>> = triplet.x_tk.to_vec2().unwrap();
        assert_eq!(t, tk);
        assert_eq!(triplet.x_j.dims(), &[4, 5]);
    }
}

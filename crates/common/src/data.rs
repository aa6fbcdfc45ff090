//! Sample datasets and batching.
//!
//! Samples live in a flat binary file that is memory-mapped on open; only the
//! pages touched for each batch are paged in. A [`DataLoader`] picks a fixed
//! subset of sample indices once and yields `(inputs, labels)` tensor batches
//! in that order on every pass, so repeated inference sees identical data.
//!
//! File format (little endian):
//!
//! | field | size |
//! |---|---|
//! | magic `SMP1` | 4 |
//! | sample count `n` | u64 |
//! | sample rank `r` | u64 |
//! | sample dims | `r` × u64 |
//! | inputs | `n` × prod(dims) × f32 |
//! | labels | `n` × u32 |

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{DatasetConfig, SampleSelection};
use crate::error::{ExplorerError, Result};

// ── Sample binary format ────────────────────────────────────────────────────

/// Magic bytes for the sample file format.
const SAMPLE_MAGIC: &[u8; 4] = b"SMP1";
/// Fixed header: magic (4) + count (8) + rank (8).
const SAMPLE_HEADER_LEN: usize = 4 + 8 + 8;

/// Write labelled samples to a binary file readable by [`SampleDataset::open`].
///
/// `inputs` holds every sample back to back, each of `sample_shape` elements.
pub fn write_sample_file(
    path: &Path,
    sample_shape: &[usize],
    inputs: &[f32],
    labels: &[u32],
) -> Result<()> {
    let sample_len: usize = sample_shape.iter().product();
    if inputs.len() != labels.len() * sample_len {
        return Err(ExplorerError::Dataset(format!(
            "{} input values do not fill {} samples of shape {:?}",
            inputs.len(),
            labels.len(),
            sample_shape
        )));
    }
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(SAMPLE_MAGIC)?;
    f.write_all(&(labels.len() as u64).to_le_bytes())?;
    f.write_all(&(sample_shape.len() as u64).to_le_bytes())?;
    for &d in sample_shape {
        f.write_all(&(d as u64).to_le_bytes())?;
    }
    for &x in inputs {
        f.write_all(&x.to_le_bytes())?;
    }
    for &l in labels {
        f.write_all(&l.to_le_bytes())?;
    }
    f.into_inner()
        .map_err(|e| ExplorerError::Io(e.into_error()))?
        .sync_all()?;
    Ok(())
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let b = bytes.get(offset..offset + 8)?;
    Some(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

// ── SampleDataset ───────────────────────────────────────────────────────────

enum Storage {
    Mapped { mmap: Mmap, data_offset: usize },
    Owned { inputs: Vec<f32>, labels: Vec<u32> },
}

/// Labelled samples of a fixed shape, either memory-mapped or in memory.
pub struct SampleDataset {
    storage: Storage,
    num_samples: usize,
    sample_shape: Vec<usize>,
    sample_len: usize,
}

impl SampleDataset {
    /// Open a sample file written by [`write_sample_file`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ExplorerError::Dataset(format!("cannot open {}: {e}", path.display()))
        })?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < SAMPLE_HEADER_LEN {
            return Err(ExplorerError::Dataset(format!("{}: file too short", path.display())));
        }
        if &mmap[0..4] != SAMPLE_MAGIC {
            return Err(ExplorerError::Dataset(format!("{}: bad magic", path.display())));
        }
        let truncated = || ExplorerError::Dataset(format!("{}: header truncated", path.display()));
        let oversized = || {
            ExplorerError::Dataset(format!("{}: header sizes overflow", path.display()))
        };
        let field = |offset: usize| -> Result<usize> {
            let v = read_u64(&mmap, offset).ok_or_else(truncated)?;
            usize::try_from(v).map_err(|_| oversized())
        };
        let num_samples = field(4)?;
        let rank = field(12)?;
        if rank > (mmap.len() - SAMPLE_HEADER_LEN) / 8 {
            return Err(truncated());
        }
        let mut sample_shape = Vec::with_capacity(rank);
        for i in 0..rank {
            sample_shape.push(field(SAMPLE_HEADER_LEN + i * 8)?);
        }
        let data_offset = SAMPLE_HEADER_LEN + rank * 8;
        let sample_len = sample_shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(oversized)?;
        // f32 inputs plus one u32 label per sample.
        let expected_len = sample_len
            .checked_add(1)
            .and_then(|n| n.checked_mul(num_samples))
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(data_offset))
            .ok_or_else(oversized)?;
        if mmap.len() < expected_len {
            return Err(ExplorerError::Dataset(format!(
                "{}: truncated, expected {} bytes, got {}",
                path.display(),
                expected_len,
                mmap.len()
            )));
        }
        Ok(Self {
            storage: Storage::Mapped { mmap, data_offset },
            num_samples,
            sample_shape,
            sample_len,
        })
    }

    /// In-memory dataset; used by tests and synthetic workloads.
    pub fn from_vec(sample_shape: &[usize], inputs: Vec<f32>, labels: Vec<u32>) -> Result<Self> {
        let sample_len = sample_shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| ExplorerError::Dataset(format!("sample shape {sample_shape:?} overflows")))?;
        if labels.len().checked_mul(sample_len) != Some(inputs.len()) {
            return Err(ExplorerError::Dataset(format!(
                "{} input values do not fill {} samples of shape {:?}",
                inputs.len(),
                labels.len(),
                sample_shape
            )));
        }
        Ok(Self {
            num_samples: labels.len(),
            storage: Storage::Owned { inputs, labels },
            sample_shape: sample_shape.to_vec(),
            sample_len,
        })
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    /// Append sample `idx`'s values to `out`.
    fn extend_sample(&self, idx: usize, out: &mut Vec<f32>) {
        match &self.storage {
            Storage::Mapped { mmap, data_offset } => {
                let start = data_offset + idx * self.sample_len * 4;
                let bytes = &mmap[start..start + self.sample_len * 4];
                out.extend(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            Storage::Owned { inputs, .. } => {
                let start = idx * self.sample_len;
                out.extend_from_slice(&inputs[start..start + self.sample_len]);
            }
        }
    }

    fn label(&self, idx: usize) -> u32 {
        match &self.storage {
            Storage::Mapped { mmap, data_offset } => {
                let i = data_offset + self.num_samples * self.sample_len * 4 + idx * 4;
                u32::from_le_bytes([mmap[i], mmap[i + 1], mmap[i + 2], mmap[i + 3]])
            }
            Storage::Owned { labels, .. } => labels[idx],
        }
    }
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Fixed-order batching over a [`SampleDataset`].
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<SampleDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<SampleDataset>,
        batch_size: usize,
        sample_limit: Option<usize>,
        selection: SampleSelection,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ExplorerError::config("batch_size must be positive"));
        }
        let total = dataset.len();
        let limit = sample_limit.unwrap_or(total).min(total);
        let indices = match selection {
            SampleSelection::Sequential => (0..limit).collect(),
            SampleSelection::FixedRandom { seed } => {
                let mut all: Vec<usize> = (0..total).collect();
                all.shuffle(&mut StdRng::seed_from_u64(seed));
                all.truncate(limit);
                all
            }
        };
        Ok(Self {
            dataset,
            indices,
            batch_size,
            device: device.clone(),
        })
    }

    /// Open the configured sample file and build its loader.
    pub fn from_config(cfg: &DatasetConfig, device: &Device) -> Result<Self> {
        let dataset = Arc::new(SampleDataset::open(&cfg.path)?);
        Self::new(dataset, cfg.batch_size, cfg.sample_limit, cfg.selection, device)
    }

    /// Number of samples one pass visits.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Yield `(inputs, labels)` batches: inputs `(b, *sample_shape)` f32,
    /// labels `(b,)` u32. The last batch may be short.
    pub fn batches(&self) -> impl Iterator<Item = Result<(Tensor, Tensor)>> + '_ {
        self.indices
            .chunks(self.batch_size)
            .map(move |chunk| batch_to_tensors(&self.dataset, chunk, &self.device))
    }
}

/// Gather the samples at `indices` into Candle tensors.
pub fn batch_to_tensors(
    dataset: &SampleDataset,
    indices: &[usize],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut inputs = Vec::with_capacity(indices.len() * dataset.sample_len);
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        dataset.extend_sample(i, &mut inputs);
        labels.push(dataset.label(i));
    }
    let mut shape = Vec::with_capacity(dataset.sample_shape.len() + 1);
    shape.push(indices.len());
    shape.extend_from_slice(&dataset.sample_shape);
    let input = Tensor::from_vec(inputs, shape, device)?;
    let labels = Tensor::from_vec(labels, indices.len(), device)?;
    Ok((input, labels))
}

/// Build one loader per configured dataset key.
pub fn build_dataloaders(
    datasets: &BTreeMap<String, DatasetConfig>,
    device: &Device,
) -> Result<BTreeMap<String, DataLoader>> {
    let mut out = BTreeMap::new();
    for (key, cfg) in datasets {
        let loader = DataLoader::from_config(cfg, device)?;
        tracing::info!(
            key = %key,
            dataset = %cfg.name,
            samples = loader.len(),
            batches = loader.num_batches(),
            "dataset loaded"
        );
        out.insert(key.clone(), loader);
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────

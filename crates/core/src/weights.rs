//! On-disk weight archives: discovery, loading into a flat map, and header summaries.

use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use crate::{error::VlmError, weight_keys::WeightKeyMapper};

const ARCHIVE_EXTENSION: &str = "safetensors";

/// List the `*.safetensors` archives directly under `dir`, sorted by file name.
///
/// Fails with [`VlmError::NotFound`] when the directory holds none.
pub fn discover_weight_archives(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(VlmError::NotFound {
            path: dir.to_path_buf(),
        }
        .into());
    }
    let mut archives = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        let is_archive = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION));
        if is_archive {
            archives.push(path);
        }
    }
    if archives.is_empty() {
        return Err(VlmError::NotFound {
            path: dir.to_path_buf(),
        }
        .into());
    }
    archives.sort();
    debug!(dir = %dir.display(), count = archives.len(), "discovered weight archives");
    Ok(archives)
}

/// Load every tensor of every archive into one map. Later archives win on duplicate keys.
pub fn load_weight_archives(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for path in paths {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to load weights from {}", path.display()))?;
        weights.extend(tensors);
    }
    info!(
        tensors = weights.len(),
        archives = paths.len(),
        "loaded checkpoint tensors"
    );
    Ok(weights)
}

/// Discover, load and remap every archive under `dir`.
pub fn load_mapped_weights(
    dir: impl AsRef<Path>,
    device: &Device,
    mapper: &WeightKeyMapper,
) -> Result<HashMap<String, Tensor>> {
    let archives = discover_weight_archives(dir)?;
    let weights = load_weight_archives(&archives, device)?;
    Ok(mapper.apply(weights))
}

#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub num_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub tensor_count: usize,
}

#[derive(Debug, Clone)]
pub struct WeightsSummary {
    pub archives: Vec<ArchiveSummary>,
    pub tensor_count: usize,
    pub total_bytes: u64,
    pub sample: Vec<TensorRecord>,
}

/// Read the headers of every archive under `dir` without materialising tensors.
pub fn summarize_weights(dir: impl AsRef<Path>, sample_limit: usize) -> Result<WeightsSummary> {
    let mut summary = WeightsSummary {
        archives: Vec::new(),
        tensor_count: 0,
        total_bytes: 0,
        sample: Vec::new(),
    };
    for path in discover_weight_archives(dir)? {
        let file = File::open(&path)
            .with_context(|| format!("failed to open weights file {}", path.display()))?;
        let file_size = file
            .metadata()
            .with_context(|| format!("failed to read metadata for {}", path.display()))?
            .len();
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to mmap {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&mmap)
            .with_context(|| format!("failed to parse safetensors header of {}", path.display()))?;

        let mut names = tensors.names();
        names.sort();
        for name in names {
            if summary.sample.len() >= sample_limit {
                break;
            }
            let view = tensors.tensor(name)?;
            let shape = view.shape().to_vec();
            let num_bytes = shape
                .iter()
                .product::<usize>()
                .checked_mul(view.dtype().size())
                .unwrap_or(0);
            summary.sample.push(TensorRecord {
                name: name.to_owned(),
                dtype: view.dtype(),
                shape,
                num_bytes,
            });
        }

        summary.tensor_count += tensors.len();
        summary.total_bytes += file_size;
        summary.archives.push(ArchiveSummary {
            path,
            file_size,
            tensor_count: tensors.len(),
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn write_archive(path: &Path, names: &[&str]) -> Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        for name in names {
            tensors.insert(name.to_string(), Tensor::ones((2, 3), DType::F32, &device)?);
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    #[test]
    fn missing_archives_are_reported_as_not_found() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("config.json"), "{}")?;
        let err = discover_weight_archives(dir.path()).expect_err("no archives present");
        assert!(matches!(
            err.downcast_ref::<VlmError>(),
            Some(VlmError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn shards_are_discovered_in_name_order_and_merged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_archive(&dir.path().join("model-00002-of-00002.safetensors"), &["b", "shared"])?;
        write_archive(&dir.path().join("model-00001-of-00002.safetensors"), &["a", "shared"])?;
        let archives = discover_weight_archives(dir.path())?;
        let names: Vec<_> = archives
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_owned))
            .collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
        let weights = load_weight_archives(&archives, &Device::Cpu)?;
        assert_eq!(weights.len(), 3);
        assert_eq!(weights["a"].dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn mapped_load_moves_legacy_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_archive(
            &dir.path().join("model.safetensors"),
            &["visual.patch_embed.proj.weight", "lm_head.weight"],
        )?;
        let weights = load_mapped_weights(dir.path(), &Device::Cpu, &WeightKeyMapper::default())?;
        assert!(weights.contains_key("vision_tower.patch_embed.proj.weight"));
        assert!(weights.contains_key("language_model.lm_head.weight"));
        Ok(())
    }

    #[test]
    fn summary_counts_tensors_across_archives() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_archive(&dir.path().join("a.safetensors"), &["x", "y"])?;
        write_archive(&dir.path().join("b.safetensors"), &["z"])?;
        let summary = summarize_weights(dir.path(), 2)?;
        assert_eq!(summary.archives.len(), 2);
        assert_eq!(summary.tensor_count, 3);
        assert_eq!(summary.sample.len(), 2);
        assert_eq!(summary.sample[0].name, "x");
        assert_eq!(summary.sample[0].num_bytes, 24);
        Ok(())
    }
}

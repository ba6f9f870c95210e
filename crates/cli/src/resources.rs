use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use qwen_vl_assets as assets;
use qwen_vl_config::{
    LocalFileSystem, ModelResources, ModelSource, VirtualFileSystem, VirtualPath,
};
use tokenizers::Tokenizer;
use tracing::info;

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Local snapshot directory for the active model, downloading hub snapshots into the
/// application cache.
pub fn resolve_model_dir(fs: &LocalFileSystem, resources: &ModelResources) -> Result<PathBuf> {
    let dir = match &resources.source {
        ModelSource::Local(path) => assets::resolve_snapshot(&path.display().to_string())?,
        ModelSource::Hub(repo) => {
            let cache = VirtualPath::hub_cache_dir();
            fs.ensure_dir(&cache)?;
            fs.with_physical_path(&cache, |cache_dir| {
                assets::resolve_snapshot_in(repo, Some(cache_dir))
            })?
        }
    };
    info!("Model `{}` resolved to {}", resources.id, dir.display());
    Ok(dir)
}

pub fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let path = model_dir.join(TOKENIZER_FILE);
    Tokenizer::from_file(&path)
        .map_err(|err| anyhow!("failed to load tokenizer from {}: {err}", path.display()))
}

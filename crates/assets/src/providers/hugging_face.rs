use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};

use super::AssetProvider;

pub struct HuggingFaceProvider {
    api: Api,
}

impl HuggingFaceProvider {
    /// Client using the default Hugging Face cache, or `cache_dir` when given.
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut builder = ApiBuilder::new();
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder
            .build()
            .context("failed to initialise Hugging Face API client")?;
        Ok(Self { api })
    }
}

impl AssetProvider for HuggingFaceProvider {
    fn display_name(&self) -> &'static str {
        "Hugging Face Hub"
    }

    fn list_files(&self, repo_id: &str) -> Result<Vec<String>> {
        let info = self
            .api
            .model(repo_id.to_string())
            .info()
            .with_context(|| format!("failed to query {repo_id} on Hugging Face"))?;
        Ok(info
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect())
    }

    fn fetch(&self, repo_id: &str, remote_name: &str) -> Result<PathBuf> {
        self.api
            .model(repo_id.to_string())
            .get(remote_name)
            .with_context(|| format!("failed to download {remote_name} from Hugging Face"))
    }
}

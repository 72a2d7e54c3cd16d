//! Tensor Location Index (spec §4.2): builds the `name -> TensorLocation`
//! map once per `load()`, either from an inline `manifest.tensors` table
//! or from an external tensor-map file.

use std::collections::HashMap;

use crate::error::{LoaderError, LoaderResult};
use crate::manifest::{Manifest, ManifestParser, TensorLocation};
use crate::storage::ShardStorageBackend;

/// `name -> TensorLocation`, built once per `load()` (spec §4.2).
pub struct TensorLocationIndex {
    locations: HashMap<String, TensorLocation>,
}

impl TensorLocationIndex {
    /// Build the index from a manifest: prefer the inline `tensors` table;
    /// fall back to fetching and parsing `tensorsFile` through the storage
    /// backend.
    pub async fn build(
        manifest: &Manifest,
        backend: &dyn ShardStorageBackend,
        parser: &dyn ManifestParser,
        tensors_json_url: Option<&str>,
    ) -> LoaderResult<Self> {
        if let Some(url) = tensors_json_url {
            let json = backend.load_tensors_from_url(url).await?;
            let locations = parser.parse_tensor_map(&json)?;
            return Ok(Self { locations });
        }
        if let Some(tensors) = manifest.tensors.clone() {
            return Ok(Self { locations: tensors });
        }
        if manifest.tensors_file.is_some() {
            let json = backend.load_tensors_from_store().await?;
            let locations = parser.parse_tensor_map(&json)?;
            return Ok(Self { locations });
        }
        Err(LoaderError::ConfigMissing(
            "manifest has neither inline tensors nor a tensorsFile".into(),
        ))
    }

    pub fn get(&self, name: &str) -> Option<&TensorLocation> {
        self.locations.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Every tensor name carrying the given role (spec §4.9 `LoadEmbeddings`
    /// candidate enumeration), optionally narrowed by `group`.
    pub fn names_with_role<'a>(
        &'a self,
        role: &'a crate::dtype::TensorRole,
        group: Option<&'a str>,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.locations.iter().filter_map(move |(name, loc)| {
            let role_matches = &loc.role == role;
            let group_matches = match group {
                Some(g) => loc.group.as_deref() == Some(g),
                None => true,
            };
            (role_matches && group_matches).then_some(name.as_str())
        })
    }

    /// Resolve the first existing tensor name out of an ordered list of
    /// candidates, crossing prefix and suffix lists (spec §4.9 `LoadLayer`
    /// name resolution).
    pub fn resolve_first<'a>(&self, candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
        candidates
            .into_iter()
            .find(|name| self.contains(name))
            .map(|s| s.to_string())
    }
}

//! File-backed routing repository
//!
//! Reads `ChannelRouting` documents from one file or from every
//! `.yaml`/`.yml`/`.json` file in a directory. Documents carrying a `subset`
//! label only apply when that subset is selected, and then take precedence
//! over the unlabelled document of the same channel.

use async_trait::async_trait;
use parley_core::{
    Channel, ChannelRepository, ChannelRoutingConfig, ChannelRoutingRepository, Result, RuntimeError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::document::{ChannelRoutingDocument, parse_file_content};

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Default)]
struct Loaded {
    configs: HashMap<String, ChannelRoutingConfig>,
    channels: HashMap<String, Channel>,
}

/// How well a document matches the selected subset
fn precedence(doc_subset: Option<&str>, selected: Option<&str>) -> Option<u8> {
    match (doc_subset, selected) {
        (None, _) => Some(0),
        (Some(d), Some(s)) if d == s => Some(1),
        _ => None,
    }
}

pub struct FileBasedChannelRoutingRepository {
    path: PathBuf,
    subset: Option<String>,
    loaded: RwLock<Loaded>,
}

impl std::fmt::Debug for FileBasedChannelRoutingRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBasedChannelRoutingRepository")
            .field("path", &self.path)
            .field("subset", &self.subset)
            .field("channels", &self.read().configs.len())
            .finish()
    }
}

impl FileBasedChannelRoutingRepository {
    /// Load definitions from `path`; any unreadable or invalid document is
    /// a `ConfigurationError`.
    pub fn load(path: impl Into<PathBuf>, subset: Option<String>) -> Result<Self> {
        let path = path.into();
        let subset = subset.filter(|s| !s.trim().is_empty());
        let loaded = load_from(&path, subset.as_deref())?;
        info!(
            "Loaded routing for {} channels from {}{}",
            loaded.configs.len(),
            path.display(),
            subset.as_deref().map(|s| format!(" (subset '{}')", s)).unwrap_or_default()
        );
        Ok(Self {
            path,
            subset,
            loaded: RwLock::new(loaded),
        })
    }

    /// Re-read the definitions; on failure the previous set stays active
    pub fn reload(&self) -> Result<usize> {
        let fresh = match load_from(&self.path, self.subset.as_deref()) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Reloading {} failed, keeping previous routing: {}", self.path.display(), e);
                return Err(e);
            }
        };
        let count = fresh.configs.len();
        *self.loaded.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        info!("Reloaded routing for {} channels from {}", count, self.path.display());
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subset(&self) -> Option<&str> {
        self.subset.as_deref()
    }

    /// Channel ids with a routing definition, sorted
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Channels declared through `tenant` labels, sorted by id
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.read().channels.values().cloned().collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    fn read(&self) -> RwLockReadGuard<'_, Loaded> {
        self.loaded.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn definition_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = std::fs::read_dir(path).map_err(|e| {
        RuntimeError::configuration(format!("cannot read routing directory {}: {}", path.display(), e))
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_from(path: &Path, subset: Option<&str>) -> Result<Loaded> {
    let mut documents: Vec<(PathBuf, ChannelRoutingDocument)> = Vec::new();
    for file in definition_files(path)? {
        let text = std::fs::read_to_string(&file).map_err(|e| {
            RuntimeError::configuration(format!("cannot read routing file {}: {}", file.display(), e))
        })?;
        let docs = parse_file_content(&file, &text).map_err(|e| {
            RuntimeError::configuration(format!("{}: {}", file.display(), e))
        })?;
        debug!("{} holds {} routing documents", file.display(), docs.len());
        documents.extend(docs.into_iter().map(|d| (file.clone(), d)));
    }

    // channel id -> (precedence, source file, document)
    let mut chosen: HashMap<String, (u8, PathBuf, ChannelRoutingDocument)> = HashMap::new();
    for (file, doc) in documents {
        let config = doc
            .to_config()
            .map_err(|e| RuntimeError::configuration(format!("{}: {}", file.display(), e)))?;
        let Some(rank) = precedence(doc.subset(), subset) else {
            debug!(
                "Skipping routing for '{}' in subset '{}'",
                config.channel_id,
                doc.subset().unwrap_or_default()
            );
            continue;
        };
        match chosen.get(&config.channel_id) {
            Some((existing, other, _)) if *existing == rank => {
                return Err(RuntimeError::configuration(format!(
                    "channel '{}' is defined twice ({} and {})",
                    config.channel_id,
                    other.display(),
                    file.display()
                )));
            }
            Some((existing, _, _)) if *existing > rank => continue,
            _ => {
                chosen.insert(config.channel_id.clone(), (rank, file, doc));
            }
        }
    }

    let mut loaded = Loaded::default();
    for (channel_id, (_, _, doc)) in chosen {
        if let Some(channel) = doc.channel() {
            loaded.channels.insert(channel_id.clone(), channel);
        }
        loaded.configs.insert(channel_id, doc.to_config()?);
    }
    Ok(loaded)
}

#[async_trait]
impl ChannelRoutingRepository for FileBasedChannelRoutingRepository {
    fn backend(&self) -> &str {
        "file"
    }

    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelRoutingConfig>> {
        Ok(self.read().configs.get(channel_id).cloned())
    }
}

#[async_trait]
impl ChannelRepository for FileBasedChannelRoutingRepository {
    async fn lookup(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.read().channels.get(channel_id).cloned())
    }
}

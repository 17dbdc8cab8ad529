//! # Upload Reassembly
//!
//! Buffers sequence-numbered file chunks per `(device_id, task_id)` and merges
//! them into one artifact when the device signals the end of the upload.
//!
//! ## Storage tiers
//! - Chunks up to `memory_threshold` bytes are copied into the memory tier.
//! - Larger chunks are spilled to `<root>/temp/{device}_{task}_{seq}.tmp`.
//!
//! Both tiers are one ordered set: the artifact is always written in
//! ascending sequence order, whatever order chunks arrived in. A later chunk
//! with an already-seen sequence number replaces the earlier one, even across
//! tiers.
//!
//! ## Lifecycle
//! A context exists from the first chunk until [`UploadManager::finish`] or
//! [`UploadManager::abandon`]. Both remove the context before doing any I/O,
//! so cached bytes and temp files are reclaimed whether the merge succeeds or
//! not. File I/O runs on `tokio::fs` or `spawn_blocking`; no map entry is held
//! across an await.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{HashAlgorithm, UploadConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::hash::hash_file;
use crate::utils::metrics::Timer;
use crate::utils::time::now_millis;

/// `(device_id, task_id)`
pub type UploadKey = (u32, u32);

/// Where a cached chunk ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTier {
    Memory,
    Disk,
}

/// Outcome of merging one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSaveResult {
    /// Finished artifact; `None` when nothing was cached
    pub artifact: Option<PathBuf>,
    /// Chunks actually merged
    pub chunk_count: u32,
    /// Chunk count the device announced
    pub expected_chunks: u32,
    pub success: bool,
    /// Hash of the finished artifact, empty when there is none
    pub content_hash: Vec<u8>,
}

impl FileSaveResult {
    fn empty(expected_chunks: u32) -> Self {
        Self {
            artifact: None,
            chunk_count: 0,
            expected_chunks,
            success: false,
            content_hash: Vec::new(),
        }
    }

    pub fn count_matches(&self) -> bool {
        self.chunk_count == self.expected_chunks
    }

    pub fn file_name(&self) -> Option<String> {
        self.artifact
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(&self.content_hash)
    }
}

#[derive(Debug, Default)]
struct UploadContext {
    memory_chunks: HashMap<u32, Bytes>,
    disk_chunks: BTreeMap<u32, PathBuf>,
}

impl UploadContext {
    fn len(&self) -> usize {
        self.memory_chunks.len() + self.disk_chunks.len()
    }

    fn temp_files(&self) -> Vec<PathBuf> {
        self.disk_chunks.values().cloned().collect()
    }
}

enum ChunkSource {
    Memory(Bytes),
    Disk(PathBuf),
}

/// Per-key chunk cache and merger
#[derive(Debug)]
pub struct UploadManager {
    root: PathBuf,
    temp_dir: PathBuf,
    memory_threshold: usize,
    hash_algorithm: HashAlgorithm,
    artifact_extension: String,
    contexts: DashMap<UploadKey, UploadContext>,
}

impl UploadManager {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            root: config.root.clone(),
            temp_dir: config.temp_dir(),
            memory_threshold: config.memory_threshold,
            hash_algorithm: config.hash_algorithm,
            artifact_extension: config.artifact_extension.clone(),
            contexts: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Temp file holding a spilled chunk
    pub fn temp_path(&self, device_id: u32, task_id: u32, seq: u32) -> PathBuf {
        self.temp_dir
            .join(format!("{device_id}_{task_id}_{seq}.tmp"))
    }

    /// Cache one chunk in the tier its size selects.
    ///
    /// On a spill failure the chunk is not recorded and `UploadIo` is returned;
    /// the upload can still finish without it.
    pub async fn cache_chunk(
        &self,
        device_id: u32,
        task_id: u32,
        seq: u32,
        data: Bytes,
    ) -> Result<ChunkTier> {
        let key = (device_id, task_id);
        let len = data.len();

        if len <= self.memory_threshold {
            // Detach from the connection's receive buffer before retaining.
            let owned = Bytes::copy_from_slice(&data);
            let displaced = {
                let mut context = self.contexts.entry(key).or_default();
                context.memory_chunks.insert(seq, owned);
                context.disk_chunks.remove(&seq)
            };
            if let Some(path) = displaced {
                remove_temp_file(&path).await;
            }
            debug!(device_id, task_id, seq, len, "Chunk cached in memory");
            return Ok(ChunkTier::Memory);
        }

        let path = self.temp_path(device_id, task_id, seq);
        if let Err(source) = write_temp_file(&self.temp_dir, &path, &data).await {
            remove_temp_file(&path).await;
            // An earlier copy of this seq shared the path and is gone now.
            if let Some(mut context) = self.contexts.get_mut(&key) {
                context.disk_chunks.remove(&seq);
            }
            return Err(ProtocolError::UploadIo { path, source });
        }

        {
            let mut context = self.contexts.entry(key).or_default();
            context.memory_chunks.remove(&seq);
            context.disk_chunks.insert(seq, path.clone());
        }
        debug!(device_id, task_id, seq, len, path = %path.display(), "Chunk spilled to disk");
        Ok(ChunkTier::Disk)
    }

    /// Merge every cached chunk of `(device_id, task_id)` into one artifact.
    ///
    /// A chunk count different from `expected_chunks` is reported, not
    /// rejected. The context and its temp files are gone afterwards on every
    /// path.
    pub async fn finish(
        &self,
        device_id: u32,
        task_id: u32,
        expected_chunks: u32,
    ) -> Result<FileSaveResult> {
        let _timer = Timer::start("upload_finish");

        let context = match self.contexts.remove(&(device_id, task_id)) {
            Some((_, context)) if context.len() > 0 => context,
            _ => {
                warn!(device_id, task_id, expected_chunks, "{}", constants::ERR_NO_CHUNKS);
                return Ok(FileSaveResult::empty(expected_chunks));
            }
        };

        let temp_files = context.temp_files();
        let mut ordered: BTreeMap<u32, ChunkSource> = BTreeMap::new();
        for (seq, path) in context.disk_chunks {
            ordered.insert(seq, ChunkSource::Disk(path));
        }
        for (seq, data) in context.memory_chunks {
            ordered.insert(seq, ChunkSource::Memory(data));
        }

        let chunk_count = ordered.len() as u32;
        if chunk_count != expected_chunks {
            warn!(
                device_id,
                task_id,
                received = chunk_count,
                expected = expected_chunks,
                "Chunk count mismatch, merging what was received"
            );
        }

        let artifact = self.root.join(format!(
            "{device_id}_{task_id}_{}.{}",
            now_millis(),
            self.artifact_extension
        ));

        let merged = self.merge(artifact.clone(), ordered).await;
        for path in &temp_files {
            remove_temp_file(path).await;
        }

        let content_hash = match merged {
            Ok(()) => self.hash(artifact.clone()).await,
            Err(e) => Err(e),
        };

        match content_hash {
            Ok(content_hash) => {
                info!(
                    device_id,
                    task_id,
                    chunks = chunk_count,
                    artifact = %artifact.display(),
                    hash = %hex::encode(&content_hash),
                    "Upload merged"
                );
                Ok(FileSaveResult {
                    artifact: Some(artifact),
                    chunk_count,
                    expected_chunks,
                    success: true,
                    content_hash,
                })
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&artifact).await {
                    if remove_err.kind() != io::ErrorKind::NotFound {
                        warn!(error = %remove_err, artifact = %artifact.display(), "Failed to remove partial artifact");
                    }
                }
                Err(e)
            }
        }
    }

    async fn merge(&self, artifact: PathBuf, ordered: BTreeMap<u32, ChunkSource>) -> Result<()> {
        let root = self.root.clone();
        let target = artifact.clone();
        tokio::task::spawn_blocking(move || write_artifact(&root, &target, ordered))
            .await
            .map_err(|_| ProtocolError::Upload(constants::ERR_MERGE_TASK.to_string()))?
            .map_err(|source| ProtocolError::UploadIo {
                path: artifact,
                source,
            })
    }

    async fn hash(&self, artifact: PathBuf) -> Result<Vec<u8>> {
        let algorithm = self.hash_algorithm;
        let target = artifact.clone();
        tokio::task::spawn_blocking(move || hash_file(&target, algorithm))
            .await
            .map_err(|_| ProtocolError::Upload(constants::ERR_HASH_TASK.to_string()))?
            .map_err(|source| ProtocolError::UploadIo {
                path: artifact,
                source,
            })
    }

    /// Drop the context of `(device_id, task_id)` without producing an
    /// artifact. Returns how many chunks were discarded.
    pub async fn abandon(&self, device_id: u32, task_id: u32) -> usize {
        let Some((_, context)) = self.contexts.remove(&(device_id, task_id)) else {
            return 0;
        };

        let discarded = context.len();
        for path in context.temp_files() {
            remove_temp_file(&path).await;
        }
        if discarded > 0 {
            info!(device_id, task_id, chunks = discarded, "Upload abandoned");
        }
        discarded
    }

    /// Number of uploads currently in progress
    pub fn pending_uploads(&self) -> usize {
        self.contexts.len()
    }

    /// `(memory, disk)` chunk counts of an upload in progress
    pub fn pending_chunks(&self, device_id: u32, task_id: u32) -> Option<(usize, usize)> {
        self.contexts
            .get(&(device_id, task_id))
            .map(|context| (context.memory_chunks.len(), context.disk_chunks.len()))
    }
}

async fn write_temp_file(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, data).await
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove temp chunk"),
    }
}

/// Blocking: stream chunks into `artifact` in ascending sequence order
fn write_artifact(root: &Path, artifact: &Path, ordered: BTreeMap<u32, ChunkSource>) -> io::Result<()> {
    std::fs::create_dir_all(root)?;
    let mut writer = BufWriter::new(File::create(artifact)?);
    for (_, source) in ordered {
        match source {
            ChunkSource::Memory(data) => writer.write_all(&data)?,
            ChunkSource::Disk(path) => {
                let mut chunk = File::open(&path)?;
                io::copy(&mut chunk, &mut writer)?;
            }
        }
    }
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()
}

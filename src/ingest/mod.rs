//! Ingestion Pipeline (C6): standardize → clean → chunk → build chunk records → embed →
//! upsert, run over the union of newly downloaded files handed off by the Orchestrator (C7).

pub mod chunk;
pub mod clean;
pub mod embed;
pub mod standardize;
pub mod vectorstore;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::{
    config::{ChunkerOptions, StorageOptions},
    model::{Chunk, CourseId},
    progress::{Level, ProgressChannel, Stage},
};

pub use standardize::Standardizer;
pub use vectorstore::VectorStore;

/// Stats returned by one ingestion run (folds into the Orchestrator's overall stats record,
/// §4.7 step 8).
#[derive(Debug, Default, Clone)]
pub struct IngestionStats {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub vectors_added: usize,
}

pub struct IngestionPipeline {
    standardizer: Standardizer,
    embedder: Arc<embed::Embedder>,
    store: VectorStore,
    chunker_opts: ChunkerOptions,
    storage: StorageOptions,
    progress: ProgressChannel,
}

impl IngestionPipeline {
    pub fn new(
        standardizer: Standardizer,
        embedder: Arc<embed::Embedder>,
        store: VectorStore,
        chunker_opts: ChunkerOptions,
        storage: StorageOptions,
        progress: ProgressChannel,
    ) -> Self {
        Self { standardizer, embedder, store, chunker_opts, storage, progress }
    }

    /// Runs the full pipeline over `files` — exactly the union of new downloads from both
    /// scrape dispatchers (§4.6 Inputs). Per-file failures are logged, counted, and do not
    /// stop the batch (§4.6 failure semantics).
    pub async fn ingest(&self, files: &[(CourseId, PathBuf)]) -> IngestionStats {
        self.progress.emit(Level::Info, Stage::IngestionStart, format!("ingesting {} files", files.len()));

        let mut stats = IngestionStats::default();

        for (course_id, path) in files {
            match self.ingest_one(*course_id, path).await {
                Ok(added) => {
                    stats.files_processed += 1;
                    stats.vectors_added += added;
                }
                Err(err) => {
                    stats.files_skipped += 1;
                    self.progress.emit(
                        Level::Warn,
                        Stage::FileFailed,
                        format!("{}: {err}", path.display()),
                    );
                }
            }
        }

        self.progress.emit(Level::Info, Stage::Done, "ingestion complete");
        stats
    }

    async fn ingest_one(&self, course_id: CourseId, path: &Path) -> crate::error::Result<usize> {
        let standardized = self.standardizer.standardize(path).await?;
        let cleaned = clean::clean(&standardized);
        let pieces = chunk::chunk_text(&cleaned, &self.chunker_opts);
        if pieces.is_empty() {
            return Ok(0);
        }

        let title = path.file_stem().and_then(|s| s.to_str()).unwrap_or("untitled").to_string();
        let url = chunk_url(path, &self.storage)?;

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .map(|text| Chunk { course_id, title: title.clone(), url: url.clone(), text })
            .collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_all(&texts).await?;

        let records: Vec<crate::model::VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| crate::model::VectorRecord { id: uuid::Uuid::new_v4().to_string(), embedding, chunk })
            .collect();

        let added = records.len();
        self.store.add(course_id, &records).await?;
        Ok(added)
    }
}

/// Synthesizes a chunk's HTTP URL by finding the nearest `knowledge_base/` ancestor of
/// `path`, taking the relative path beneath it, URL-encoding each segment, and joining it to
/// the configured static-file base URL (§4.6 stage 4).
fn chunk_url(path: &Path, storage: &StorageOptions) -> crate::error::Result<String> {
    let relative = relative_to_knowledge_base(path).ok_or_else(|| {
        crate::error::Error::config(format!(
            "{} is not under a knowledge_base/ directory",
            path.display()
        ))
    })?;

    let encoded: Vec<String> = relative
        .components()
        .map(|c| utf8_percent_encode(&c.as_os_str().to_string_lossy(), NON_ALPHANUMERIC).to_string())
        .collect();

    let base = storage.knowledge_base_url.trim_end_matches('/');
    Ok(format!("{base}/{}", encoded.join("/")))
}

fn relative_to_knowledge_base(path: &Path) -> Option<PathBuf> {
    let components: Vec<_> = path.components().collect();
    let anchor = components.iter().rposition(|c| c.as_os_str() == "knowledge_base")?;
    Some(components[anchor + 1..].iter().collect())
}

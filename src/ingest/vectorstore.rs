//! Vector store (§6 "Vector store"): an embedded, persistent store rooted at `INDEX_DIR`,
//! exposing `get_or_create_collection` / `add` / `query` / `count` over one table per
//! course collection (`course_<id>`).
//!
//! Backed by the same SQLite engine already justified for the metadata store (§6: "avoids
//! introducing a second storage engine"), holding each collection as a table of
//! `(id, embedding BLOB, metadata JSON, document TEXT)` rows with brute-force cosine
//! similarity computed in-process — appropriate at per-course collection sizes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{
    error::Result,
    model::{CourseId, VectorRecord},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub course_id: CourseId,
    pub title: String,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub async fn open(index_dir: &std::path::Path) -> Result<Self> {
        tokio::fs::create_dir_all(index_dir).await?;
        let db_path = index_dir.join("vectors.db");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .map_err(|e| crate::error::Error::storage(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
        Ok(Self { pool })
    }

    fn collection_name(course_id: CourseId) -> String {
        format!("course_{course_id}")
    }

    /// Creates the per-course collection's table if it does not already exist.
    pub async fn get_or_create_collection(&self, course_id: CourseId) -> Result<()> {
        let table = Self::collection_name(course_id);
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                document TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Appends `records` to the named collection. No deletion of previous vectors (§4.6
    /// stage 6 "No deletion of previous vectors is performed").
    pub async fn add(&self, course_id: CourseId, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.get_or_create_collection(course_id).await?;
        let table = Self::collection_name(course_id);

        for record in records {
            let metadata = ChunkMetadata {
                course_id: record.chunk.course_id,
                title: record.chunk.title.clone(),
                url: record.chunk.url.clone(),
            };
            let metadata_json = serde_json::to_string(&metadata).map_err(|e| crate::error::Error::storage(e.to_string()))?;
            let embedding_blob = encode_embedding(&record.embedding);

            let sql = format!(
                r#"INSERT OR REPLACE INTO "{table}" (id, embedding, metadata, document) VALUES (?, ?, ?, ?)"#
            );
            sqlx::query(&sql)
                .bind(&record.id)
                .bind(embedding_blob)
                .bind(metadata_json)
                .bind(&record.chunk.text)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Brute-force cosine-similarity search over a collection, returning the `n_results`
    /// nearest rows by ascending distance (`1 - cosine_similarity`).
    pub async fn query(&self, course_id: CourseId, query_embedding: &[f32], n_results: usize) -> Result<Vec<QueryHit>> {
        let table = Self::collection_name(course_id);
        let sql = format!(r#"SELECT id, embedding, metadata, document FROM "{table}""#);
        let rows: Vec<(String, Vec<u8>, String, String)> = match sqlx::query_as(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(_)) | Err(sqlx::Error::Io(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut hits: Vec<QueryHit> = rows
            .into_iter()
            .filter_map(|(id, blob, metadata_json, document)| {
                let embedding = decode_embedding(&blob);
                let metadata: ChunkMetadata = serde_json::from_str(&metadata_json).ok()?;
                let distance = 1.0 - cosine_similarity(&embedding, query_embedding);
                Some(QueryHit { id, document, metadata, distance })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(n_results);
        Ok(hits)
    }

    pub async fn count(&self, course_id: CourseId) -> Result<i64> {
        let table = Self::collection_name(course_id);
        let sql = format!(r#"SELECT COUNT(*) FROM "{table}""#);
        match sqlx::query_as::<_, (i64,)>(&sql).fetch_one(&self.pool).await {
            Ok((count,)) => Ok(count),
            Err(sqlx::Error::Database(_)) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(test)]
    pub async fn memory() -> Self {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await.unwrap();
        Self { pool }
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

//! Embedding client (C6 stage 5): submits cleaned, chunked text to the configured embedding
//! endpoint in batches, speaking either of the two wire shapes selected by configuration
//! (§6 Embedding endpoint).

use serde::{Deserialize, Serialize};

use crate::{
    config::{EmbeddingApiType, EmbeddingOptions},
    error::{Error, Result},
};

#[derive(Serialize)]
struct BatchRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct BatchResponse {
    data: Vec<BatchDatum>,
}

#[derive(Deserialize)]
struct BatchDatum {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OneByOneRequest<'a> {
    model: &'a str,
    sentence: &'a str,
}

#[derive(Deserialize)]
struct OneByOneResponse {
    embedding: Vec<f32>,
}

/// Thin wrapper over the embedding HTTP endpoint.
pub struct Embedder {
    client: reqwest::Client,
    opts: EmbeddingOptions,
}

impl Embedder {
    pub fn new(opts: EmbeddingOptions) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(opts.timeout).build()?;
        Ok(Self { client, opts })
    }

    /// Embeds `texts`, truncating each to the configured character bound and submitting in
    /// batches sized by [`EmbeddingOptions::effective_batch_size`]. Returns one vector per
    /// input text, in the same order. An HTTP error on any batch is returned immediately
    /// with status + body (§4.6 stage 5 failure semantics); the caller (the ingestion
    /// pipeline) decides whether to drop that batch and continue.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.opts.max_chars))
            .collect();

        let batch_size = self.opts.effective_batch_size().max(1);
        let mut out = Vec::with_capacity(truncated.len());
        for batch in truncated.chunks(batch_size) {
            let embeddings = match self.opts.api_type {
                EmbeddingApiType::Batch => self.embed_batch(batch).await?,
                EmbeddingApiType::OneByOne => self.embed_one_by_one(batch).await?,
            };
            out.extend(embeddings);
        }
        Ok(out)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = self.client.post(&self.opts.api_url).json(&BatchRequest {
            model: &self.opts.model,
            input: batch,
        });
        let request = self.with_auth(request);

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::embedding(status, body));
        }
        let parsed: BatchResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn embed_one_by_one(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(batch.len());
        for text in batch {
            let request = self.client.post(&self.opts.api_url).json(&OneByOneRequest {
                model: &self.opts.model,
                sentence: text,
            });
            let request = self.with_auth(request);

            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::embedding(status, body));
            }
            let parsed: OneByOneResponse = response.json().await?;
            out.push(parsed.embedding);
        }
        Ok(out)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.opts.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn spawn_json_server(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/embed")
    }

    #[tokio::test]
    async fn batch_embeds_round_trip() {
        let url = spawn_json_server(200, r#"{"data":[{"embedding":[0.1,0.2]},{"embedding":[0.3,0.4]}]}"#);
        let opts = EmbeddingOptions::builder().api_url(url).build();
        let embedder = Embedder::new(opts).unwrap();
        let vectors = embedder.embed_all(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn one_by_one_embeds_each_text_separately() {
        let url = spawn_json_server(200, r#"{"embedding":[1.0,2.0]}"#);
        let opts = EmbeddingOptions::builder()
            .api_url(url)
            .api_type(EmbeddingApiType::OneByOne)
            .build();
        let embedder = Embedder::new(opts).unwrap();
        let vectors = embedder.embed_all(&["only one".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0]]);
    }

    #[tokio::test]
    async fn non_200_surfaces_status_and_body() {
        let url = spawn_json_server(500, r#"{"error":"boom"}"#);
        let opts = EmbeddingOptions::builder().api_url(url).build();
        let embedder = Embedder::new(opts).unwrap();
        let err = embedder.embed_all(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_embedding_error());
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn truncate_chars_bounds_payload_size() {
        let long = "x".repeat(100);
        assert_eq!(truncate_chars(&long, 10).chars().count(), 10);
        assert_eq!(truncate_chars("short", 10), "short");
    }
}

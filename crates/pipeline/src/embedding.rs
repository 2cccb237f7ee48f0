//! Built-in embedding capabilities.
//!
//! `HashingEmbedder` is a deterministic, dependency-free feature-hashing model: each
//! token is hashed into one of `dimension` buckets with a hash-derived sign, and the
//! result is L2-normalized so cosine similarity reduces to a dot product.

use std::sync::Arc;

use async_trait::async_trait;

use gtmlake_core::capability::EmbeddingProvider;
use gtmlake_core::config::{EmbeddingConfig, EmbeddingProviderKind};
use gtmlake_core::errors::EmbeddingUnavailable;
use gtmlake_core::similarity::l2_normalize;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn build_embedder(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
        EmbeddingProviderKind::Disabled => Arc::new(DisabledEmbedder::new(config.dimension)),
    }
}

#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimension];
        let mut any = false;

        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            any = true;
        }

        if !any {
            return None;
        }
        l2_normalize(&mut vector);
        Some(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingUnavailable> {
        self.embed_sync(text)
            .ok_or_else(|| EmbeddingUnavailable("text has no embeddable tokens".to_string()))
    }
}

/// Always unavailable. Similarity features degrade instead of halting the pipeline.
#[derive(Clone, Debug)]
pub struct DisabledEmbedder {
    dimension: usize,
}

impl DisabledEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingUnavailable> {
        Err(EmbeddingUnavailable("embedding provider is disabled".to_string()))
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

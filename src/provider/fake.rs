//! Scripted in-process backend for tests

use super::{Completion, Message, ToolSpec};
use crate::error::ProviderError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Responder =
    dyn Fn(&[Message], &[ToolSpec]) -> Result<Completion, ProviderError> + Send + Sync;

/// Deterministic bag-of-words embeddings and a closure-driven completion
#[derive(Clone)]
pub struct FakeBackend {
    dimension: usize,
    responder: Arc<Responder>,
    fail_marker: Option<String>,
    embed_calls: Arc<AtomicUsize>,
    complete_calls: Arc<AtomicUsize>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            dimension: 32,
            responder: Arc::new(|_, _| Ok(Completion::text("{\"entities\": [], \"relations\": []}"))),
            fail_marker: None,
            embed_calls: Arc::new(AtomicUsize::new(0)),
            complete_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer completions with `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[Message], &[ToolSpec]) -> Result<Completion, ProviderError> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Fail any embedding batch containing `marker`
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn model(&self) -> String {
        format!("bow-{}", self.dimension)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Completion, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(messages, tools)
    }

    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(ProviderError::InvalidRequest(format!(
                    "refusing input containing {}",
                    marker
                )));
            }
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    /// Hashed word counts, L2-normalized
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = blake3::hash(word.to_lowercase().as_bytes());
            let bytes = hash.as_bytes();
            let slot = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dimension;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_are_deterministic_and_normalized() {
        let fake = FakeBackend::new();
        let a = fake.vector_for("The quick brown fox");
        let b = fake.vector_for("the QUICK brown fox");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_failing_marker() {
        let fake = FakeBackend::new().failing_on("POISON");
        assert!(fake.embed(&["fine".into()]).is_ok());
        assert!(fake.embed(&["has POISON inside".into()]).is_err());
        assert_eq!(fake.embed_calls(), 2);
    }
}

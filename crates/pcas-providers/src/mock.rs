//! Deterministic mock providers for testing and offline use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::provider::{ComputeProvider, RequestData, StreamingComputeProvider};

/// A mock compute provider returning a fixed response.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
}

impl MockProvider {
    /// Create a mock provider with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn execute(&self, request: Option<&RequestData>) -> Result<String> {
        debug!(
            provider = %self.name,
            has_request = request.is_some(),
            "Mock provider executing"
        );
        Ok(format!("Mock response from {}", self.name))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A streaming mock that echoes each input chunk back upper-cased.
///
/// Exists so the interact-stream path has an in-tree backend: it honours the
/// channel contract (drain input until closed, drop output to complete).
#[derive(Debug, Clone)]
pub struct MockStreamProvider {
    name: String,
}

impl MockStreamProvider {
    /// Create a streaming mock with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl StreamingComputeProvider for MockStreamProvider {
    async fn execute_stream(
        &self,
        _attributes: &HashMap<String, String>,
        mut input: mpsc::Receiver<Vec<u8>>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        while let Some(chunk) = input.recv().await {
            let echoed = String::from_utf8_lossy(&chunk).to_uppercase().into_bytes();
            if output.send(echoed).await.is_err() {
                // Receiver went away; nothing left to do.
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_response_format() {
        let provider = MockProvider::new("mock-provider");
        let response = provider.execute(None).await.unwrap();
        assert_eq!(response, "Mock response from mock-provider");
    }

    #[tokio::test]
    async fn test_stream_echo_and_completion() {
        let provider = MockStreamProvider::new("mock-stream");
        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);

        let attrs = HashMap::new();
        let task = tokio::spawn(async move {
            provider.execute_stream(&attrs, in_rx, out_tx).await
        });

        in_tx.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), b"HELLO".to_vec());

        in_tx.send(b"world".to_vec()).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), b"WORLD".to_vec());

        // Closing input ends the stream; output closes when the task drops
        // its sender.
        drop(in_tx);
        task.await.unwrap().unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}

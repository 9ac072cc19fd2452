use async_trait::async_trait;

use crate::Result;

/// Turns a text prompt into an image. Implementations return the encoded image
/// as standard base64 with no data-URL prefix.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

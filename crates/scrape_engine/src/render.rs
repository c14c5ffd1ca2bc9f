use std::collections::BTreeMap;

use scrape_core::RenderOptions;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("page did not finish rendering within {0}s")]
    Timeout(u64),
    #[error("render engine failed: {0}")]
    Engine(String),
}

/// Loads a page in a scripted browser and returns the resulting document.
///
/// Implementations own the waiting and scrolling described by `options`;
/// the orchestrator only vets the address beforehand.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        address: &str,
        options: &RenderOptions,
        cookies: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, RenderError>;
}

//! Remote OCR services.
//!
//! An [`OcrBackend`] performs exactly one request for one page and reports
//! what happened as an [`OcrCallError`]. Retries, pacing, timeouts and
//! cancellation all live in [`crate::pipeline::ocr::OcrClient`], so a backend
//! stays a thin translation between a [`PageUnit`] and a wire format.
//!
//! | Backend | Service | Credential |
//! |---------|---------|------------|
//! | [`MistralOcrBackend`] | `POST {base}/v1/ocr` | Bearer key from the [`crate::credential::CredentialStore`] |
//! | [`VisionLlmBackend`] | any edgequake-llm vision provider | the provider's own key |

pub mod mistral;
pub mod vision;

pub use mistral::MistralOcrBackend;
pub use vision::VisionLlmBackend;

use crate::credential::Credential;
use crate::error::OcrCallError;
use crate::pipeline::render::PageUnit;
use async_trait::async_trait;

/// One OCR request for one page.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Return the page's Markdown, or a classified failure.
    async fn recognize(
        &self,
        unit: &PageUnit,
        credential: &Credential,
    ) -> Result<String, OcrCallError>;

    /// Whether calls need the credential from the store. Backends that
    /// authenticate on their own return `false`.
    fn requires_credential(&self) -> bool {
        true
    }
}

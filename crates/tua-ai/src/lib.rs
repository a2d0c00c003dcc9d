// SPDX-License-Identifier: MIT OR Apache-2.0
//! LLM adapter: a pure request/response facade over an external chat model,
//! covering the four tasks the agent ever asks of it.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tua_dataset::normalizer::HeaderMappingOracle;
use tua_dataset::parser::SheetDetectionOracle;
use tua_dataset::{Confidence, HeaderMappingSuggestion, OracleError, SheetDetection, SheetPreview};
use tua_error::{ErrorCode, TuaError};

// ---------------------------------------------------------------------------
// Task contracts
// ---------------------------------------------------------------------------

/// Result of the intent-classification task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResult {
    /// Whether the ticket is asking for a bulk user upload.
    pub is_user_upload: bool,
}

/// Result of the error-summarization task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// One-paragraph summary suitable for a ticket comment.
    pub summary: String,
    /// Supporting bullet points, one per notable issue.
    pub bullet_points: Vec<String>,
}

/// Pure request/response facade over an external chat model. Each task has
/// a strict JSON output contract; implementations MUST reject (return an
/// error for) any response that does not parse into the expected shape, so
/// callers can apply the per-task deterministic fallback rather than act on
/// a malformed suggestion.
#[async_trait]
pub trait AiAdapter: Send + Sync {
    /// Classify whether a ticket's text is requesting a bulk user upload.
    async fn classify_intent(&self, ticket_text: &str) -> Result<IntentResult, TuaError>;

    /// Suggest a mapping from still-unmapped raw headers to the still-missing
    /// canonical fields.
    async fn map_headers(
        &self,
        unmapped_raw: &[String],
        missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, TuaError>;

    /// Given previews of each worksheet's first ten rows, suggest which
    /// sheet, header row, and data start row to use.
    async fn detect_sheet(&self, previews: &[SheetPreview]) -> Result<SheetDetection, TuaError>;

    /// Summarize a validation/processing failure for a human reader.
    async fn summarize_errors(&self, context: &str) -> Result<ErrorSummary, TuaError>;
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct HeaderMappingWire {
    mapping: std::collections::BTreeMap<String, String>,
    unmapped: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ConfidenceWire {
    High,
    Medium,
    Low,
}

impl From<ConfidenceWire> for Confidence {
    fn from(c: ConfidenceWire) -> Self {
        match c {
            ConfidenceWire::High => Confidence::High,
            ConfidenceWire::Medium => Confidence::Medium,
            ConfidenceWire::Low => Confidence::Low,
        }
    }
}

#[derive(Deserialize)]
struct SheetDetectionWire {
    sheet_name: String,
    header_row: usize,
    data_start_row: usize,
    confidence: ConfidenceWire,
    reasoning: String,
}

/// HTTP-backed [`AiAdapter`] over a chat-completion endpoint (OpenAI-shaped
/// request/response bodies: `model` + `messages`, `choices[0].message.content`
/// holding the JSON payload as a string).
pub struct HttpAiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpAiAdapter {
    /// Construct a client against `base_url` using `api_key` and `model`,
    /// with the longer read timeout `spec.md` §5 mandates for LLM calls
    /// (300s, vs. 120s for other outbound calls).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, TuaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}")))?;
        Ok(HttpAiAdapter {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, TuaError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("LLM request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TuaError::new(ErrorCode::Internal, format!("LLM call returned HTTP {status}"))
                .with_context("body", body));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("LLM response not valid JSON: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TuaError::new(ErrorCode::Internal, "LLM response had no choices"))
    }
}

#[async_trait]
impl AiAdapter for HttpAiAdapter {
    async fn classify_intent(&self, ticket_text: &str) -> Result<IntentResult, TuaError> {
        let content = self
            .complete(
                "You classify issue-tracker tickets. Reply with strict JSON: {\"is_user_upload\": boolean}.",
                ticket_text,
            )
            .await?;
        serde_json::from_str(&content)
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("intent response malformed: {e}")).with_context("raw", content))
    }

    async fn map_headers(
        &self,
        unmapped_raw: &[String],
        missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, TuaError> {
        let prompt = serde_json::json!({
            "unmapped_raw_headers": unmapped_raw,
            "missing_canonical_fields": missing_canonical,
        })
        .to_string();
        let content = self
            .complete(
                "You map spreadsheet column headers to a canonical schema. Reply with strict JSON: \
                 {\"mapping\": {\"raw_header\": \"canonical\"}, \"unmapped\": [\"canonical\"]}.",
                &prompt,
            )
            .await?;
        let wire: HeaderMappingWire = serde_json::from_str(&content)
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("header mapping response malformed: {e}")).with_context("raw", content))?;
        Ok(HeaderMappingSuggestion {
            mapping: wire.mapping,
            unmapped: wire.unmapped,
        })
    }

    async fn detect_sheet(&self, previews: &[SheetPreview]) -> Result<SheetDetection, TuaError> {
        let prompt = serde_json::json!({
            "sheets": previews.iter().map(|p| serde_json::json!({
                "sheet_name": p.sheet_name,
                "rows": p.rows,
            })).collect::<Vec<_>>(),
        })
        .to_string();
        let content = self
            .complete(
                "You locate the header row in one of several worksheet previews. Reply with strict JSON: \
                 {\"sheet_name\": string, \"header_row\": number, \"data_start_row\": number, \
                 \"confidence\": \"high\"|\"medium\"|\"low\", \"reasoning\": string}.",
                &prompt,
            )
            .await?;
        let wire: SheetDetectionWire = serde_json::from_str(&content)
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("sheet detection response malformed: {e}")).with_context("raw", content))?;
        Ok(SheetDetection {
            sheet_name: wire.sheet_name,
            header_row: wire.header_row,
            data_start_row: wire.data_start_row,
            confidence: wire.confidence.into(),
            reasoning: wire.reasoning,
        })
    }

    async fn summarize_errors(&self, context: &str) -> Result<ErrorSummary, TuaError> {
        let content = self
            .complete(
                "You summarize dataset validation failures for a human reader. Reply with strict JSON: \
                 {\"summary\": string, \"bullet_points\": [string]}.",
                context,
            )
            .await?;
        serde_json::from_str(&content)
            .map_err(|e| TuaError::new(ErrorCode::Internal, format!("error summary response malformed: {e}")).with_context("raw", content))
    }
}

// ---------------------------------------------------------------------------
// Deterministic test stub
// ---------------------------------------------------------------------------

/// Deterministic [`AiAdapter`] returning fixed responses, for offline tests
/// and `--dry-run`. Each task's response is configured independently so a
/// test can exercise one fallback path without affecting the others.
pub struct StubAiAdapter {
    /// Response for [`AiAdapter::classify_intent`].
    pub intent: IntentResult,
    /// Response for [`AiAdapter::map_headers`].
    pub header_mapping: HeaderMappingSuggestion,
    /// Response for [`AiAdapter::detect_sheet`].
    pub sheet_detection: SheetDetection,
    /// Response for [`AiAdapter::summarize_errors`].
    pub error_summary: ErrorSummary,
}

impl Default for StubAiAdapter {
    fn default() -> Self {
        StubAiAdapter {
            intent: IntentResult { is_user_upload: true },
            header_mapping: HeaderMappingSuggestion::default(),
            sheet_detection: SheetDetection {
                sheet_name: "Sheet1".into(),
                header_row: 0,
                data_start_row: 1,
                confidence: Confidence::High,
                reasoning: "stub".into(),
            },
            error_summary: ErrorSummary {
                summary: "stub summary".into(),
                bullet_points: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl AiAdapter for StubAiAdapter {
    async fn classify_intent(&self, _ticket_text: &str) -> Result<IntentResult, TuaError> {
        Ok(self.intent)
    }

    async fn map_headers(
        &self,
        _unmapped_raw: &[String],
        _missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, TuaError> {
        Ok(self.header_mapping.clone())
    }

    async fn detect_sheet(&self, _previews: &[SheetPreview]) -> Result<SheetDetection, TuaError> {
        Ok(self.sheet_detection.clone())
    }

    async fn summarize_errors(&self, _context: &str) -> Result<ErrorSummary, TuaError> {
        Ok(self.error_summary.clone())
    }
}

#[async_trait]
impl<T: AiAdapter + ?Sized> AiAdapter for Arc<T> {
    async fn classify_intent(&self, ticket_text: &str) -> Result<IntentResult, TuaError> {
        (**self).classify_intent(ticket_text).await
    }

    async fn map_headers(
        &self,
        unmapped_raw: &[String],
        missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, TuaError> {
        (**self).map_headers(unmapped_raw, missing_canonical).await
    }

    async fn detect_sheet(&self, previews: &[SheetPreview]) -> Result<SheetDetection, TuaError> {
        (**self).detect_sheet(previews).await
    }

    async fn summarize_errors(&self, context: &str) -> Result<ErrorSummary, TuaError> {
        (**self).summarize_errors(context).await
    }
}

// ---------------------------------------------------------------------------
// Synchronous bridging for tua-dataset's oracle traits
// ---------------------------------------------------------------------------

/// Bridges an async [`AiAdapter`] to `tua-dataset`'s synchronous
/// [`HeaderMappingOracle`], so the deterministic-first parsing pipeline can
/// stay free of an async runtime dependency of its own.
///
/// Callers MUST invoke the oracle from a blocking context (e.g. inside
/// `tokio::task::spawn_blocking`), never from a task currently being polled
/// on an async worker thread — `Handle::block_on` panics in the latter case.
pub struct BlockingHeaderOracle<A: AiAdapter> {
    adapter: Arc<A>,
    handle: tokio::runtime::Handle,
}

impl<A: AiAdapter> BlockingHeaderOracle<A> {
    /// Construct a bridge over `adapter`, using the current thread's tokio
    /// runtime handle.
    pub fn new(adapter: Arc<A>, handle: tokio::runtime::Handle) -> Self {
        BlockingHeaderOracle { adapter, handle }
    }
}

impl<A: AiAdapter> HeaderMappingOracle for BlockingHeaderOracle<A> {
    fn map_headers(
        &self,
        unmapped_raw: &[String],
        missing_canonical: &[String],
    ) -> Result<HeaderMappingSuggestion, OracleError> {
        let unmapped = unmapped_raw.to_vec();
        let missing = missing_canonical.to_vec();
        self.handle
            .block_on(async { self.adapter.map_headers(&unmapped, &missing).await })
            .map_err(|e| OracleError(e.message))
    }
}

/// Bridges an async [`AiAdapter`] to `tua-dataset`'s synchronous
/// [`SheetDetectionOracle`]. See [`BlockingHeaderOracle`] for the runtime
/// requirement this imposes on callers.
pub struct BlockingSheetOracle<A: AiAdapter> {
    adapter: Arc<A>,
    handle: tokio::runtime::Handle,
}

impl<A: AiAdapter> BlockingSheetOracle<A> {
    /// Construct a bridge over `adapter`, using the current thread's tokio
    /// runtime handle.
    pub fn new(adapter: Arc<A>, handle: tokio::runtime::Handle) -> Self {
        BlockingSheetOracle { adapter, handle }
    }
}

impl<A: AiAdapter> SheetDetectionOracle for BlockingSheetOracle<A> {
    fn detect_sheet(&self, previews: &[SheetPreview]) -> Result<SheetDetection, OracleError> {
        let previews = previews.to_vec();
        self.handle
            .block_on(async { self.adapter.detect_sheet(&previews).await })
            .map_err(|e| OracleError(e.message))
    }
}

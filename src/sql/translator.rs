//! Translator agent: natural language to SQL through a completion provider.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::messages::{TranslationRequest, TranslationResponse};
use crate::agent::{Agent, Handler, HandlerError, MessageContext, Routes};
use crate::providers::{CompletionRequest, Provider, ProviderError};

pub const TRANSLATOR_AGENT_TYPE: &str = "sql_translator";

pub const SYSTEM_PROMPT: &str = "You are an expert SQL translator. \
Convert natural language queries into SQL queries based on the provided database schema. \
Return only the SQL query without any explanation or markdown formatting.";

/// Build the user prompt for one request.
pub fn build_prompt(request: &TranslationRequest) -> Result<String, serde_json::Error> {
    let schema = serde_json::to_string_pretty(&request.schema)?;
    Ok(format!(
        "Database Schema:\n{}\n\nNatural Language Query: {}\n\nGenerate the SQL query:",
        schema, request.query
    ))
}

/// Trim the completion and drop a surrounding markdown code fence.
pub fn clean_sql(text: &str) -> String {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Skip the info string ("sql") on the opening fence line.
    let body = match inner.split_once('\n') {
        Some((first, rest)) if !first.trim().contains(' ') => rest,
        Some(_) => inner,
        // Single-line fence: "```sql SELECT 1```".
        None => match inner.trim_start().split_once(char::is_whitespace) {
            Some((tag, rest)) if tag.eq_ignore_ascii_case("sql") => rest,
            _ => inner,
        },
    };
    body.trim().to_string()
}

pub struct TranslatorAgent {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl TranslatorAgent {
    pub fn new(provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    async fn translate(&self, request: &TranslationRequest, ctx: &MessageContext) -> Result<String, ProviderError> {
        let prompt = build_prompt(request).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        let completion = self.provider.complete(CompletionRequest {
            system: SYSTEM_PROMPT,
            prompt: &prompt,
        });

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(ProviderError::other("translator is shutting down")),
            result = tokio::time::timeout(self.timeout, completion) => match result {
                Ok(text) => text.map(|t| clean_sql(&t)),
                Err(_) => Err(ProviderError::Timeout),
            },
        }
    }
}

#[async_trait]
impl Handler<TranslationRequest, TranslationResponse> for TranslatorAgent {
    async fn handle(
        &self,
        request: TranslationRequest,
        ctx: MessageContext,
    ) -> Result<TranslationResponse, HandlerError> {
        info!(
            request_id = %request.request_id,
            query = %request.query,
            "Received translation request"
        );

        // Completion failures travel back inside the response.
        match self.translate(&request, &ctx).await {
            Ok(sql) => {
                info!(request_id = %request.request_id, sql = %sql, "Sending back SQL");
                Ok(TranslationResponse::ok(sql, request.request_id))
            }
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Translation failed");
                Ok(TranslationResponse::failed(request.request_id, e.to_string()))
            }
        }
    }
}

impl Agent for TranslatorAgent {
    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<TranslationRequest, TranslationResponse>();
    }
}

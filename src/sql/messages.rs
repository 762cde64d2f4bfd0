//! Translation request/response messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{CodecRegistry, Message};

/// Table name -> column name -> column type.
pub type DatabaseSchema = BTreeMap<String, BTreeMap<String, String>>;

/// Ask the translator to turn a natural-language query into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationRequest {
    #[serde(rename = "natural_language_query")]
    pub query: String,
    #[serde(rename = "database_schema")]
    pub schema: DatabaseSchema,
    /// Caller-assigned; echoed unchanged in the response.
    pub request_id: String,
}

impl TranslationRequest {
    pub fn new(query: impl Into<String>, schema: DatabaseSchema, request_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            schema,
            request_id: request_id.into(),
        }
    }
}

impl Message for TranslationRequest {
    const TYPE_NAME: &'static str = "SQLTranslationRequest";

    /// An empty id is a valid message but not a usable correlation id.
    fn correlation_hint(&self) -> Option<&str> {
        (!self.request_id.is_empty()).then_some(self.request_id.as_str())
    }
}

/// Translator output. Exactly one of `sql` and `error` carries content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationResponse {
    #[serde(rename = "sql_query")]
    pub sql: String,
    pub request_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl TranslationResponse {
    pub fn ok(sql: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            request_id: request_id.into(),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            sql: String::new(),
            request_id: request_id.into(),
            error: Some(if error.is_empty() {
                "translation failed".to_string()
            } else {
                error
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Message for TranslationResponse {
    const TYPE_NAME: &'static str = "SQLTranslationResponse";

    fn validate(&self) -> Result<(), String> {
        if self.error.is_some() && !self.sql.is_empty() {
            return Err("sql_query must be empty when error is set".to_string());
        }
        Ok(())
    }
}

/// Register the JSON codecs for both translation messages.
pub fn register_messages(codecs: &CodecRegistry) {
    codecs.register::<TranslationRequest>();
    codecs.register::<TranslationResponse>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn users_schema() -> DatabaseSchema {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), "INTEGER".to_string());
        let mut schema = BTreeMap::new();
        schema.insert("users".to_string(), columns);
        schema
    }

    #[test]
    fn test_request_wire_field_names() {
        let request = TranslationRequest::new("Show all users", users_schema(), "t-1");
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "natural_language_query": "Show all users",
                "database_schema": {"users": {"id": "INTEGER"}},
                "request_id": "t-1"
            })
        );
        assert_eq!(request.correlation_hint(), Some("t-1"));
    }

    #[test]
    fn test_response_serializes_null_error() {
        let json = serde_json::to_string(&TranslationResponse::ok("SELECT 1", "t-1")).unwrap();
        assert_eq!(json, r#"{"sql_query":"SELECT 1","request_id":"t-1","error":null}"#);
    }

    #[test]
    fn test_response_error_field_may_be_absent() {
        let codecs = CodecRegistry::new();
        register_messages(&codecs);
        let response: TranslationResponse = codecs
            .decode(
                "SQLTranslationResponse",
                br#"{"sql_query":"SELECT 1","request_id":"t-1"}"#,
            )
            .unwrap();
        assert_eq!(response, TranslationResponse::ok("SELECT 1", "t-1"));
    }

    #[test]
    fn test_missing_or_unknown_fields_are_malformed() {
        let codecs = CodecRegistry::new();
        register_messages(&codecs);

        let missing = codecs.decode::<TranslationRequest>(
            "SQLTranslationRequest",
            br#"{"natural_language_query":"q","request_id":"t-1"}"#,
        );
        assert!(matches!(missing, Err(Error::MalformedPayload { .. })));

        let unknown = codecs.decode::<TranslationRequest>(
            "SQLTranslationRequest",
            br#"{"natural_language_query":"q","database_schema":{},"request_id":"t-1","extra":1}"#,
        );
        assert!(matches!(unknown, Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn test_sql_and_error_are_exclusive() {
        let codecs = CodecRegistry::new();
        register_messages(&codecs);
        let both = codecs.decode::<TranslationResponse>(
            "SQLTranslationResponse",
            br#"{"sql_query":"SELECT 1","request_id":"t-1","error":"boom"}"#,
        );
        assert!(matches!(both, Err(Error::MalformedPayload { .. })));

        let failed = TranslationResponse::failed("t-1", "");
        assert!(failed.sql.is_empty());
        assert!(!failed.error.unwrap().is_empty());
    }

    #[test]
    fn test_messages_survive_the_codec_unchanged() {
        let codecs = CodecRegistry::new();
        register_messages(&codecs);

        for request in [
            TranslationRequest::new("Show all users", users_schema(), "t-1"),
            TranslationRequest::new("Count orders", DatabaseSchema::new(), ""),
        ] {
            let encoded = codecs.encode(&request).unwrap();
            let decoded: TranslationRequest = codecs.decode(&encoded.type_name, &encoded.payload).unwrap();
            assert_eq!(decoded, request);
        }

        let failed = TranslationResponse::failed("t-1", "model overloaded");
        let encoded = codecs.encode(&failed).unwrap();
        let decoded: TranslationResponse = codecs.decode(&encoded.type_name, &encoded.payload).unwrap();
        assert_eq!(decoded, failed);
        assert!(decoded.is_error());
    }

    #[test]
    fn test_empty_request_id_gives_no_correlation_hint() {
        let request = TranslationRequest::new("q", DatabaseSchema::new(), "");
        assert_eq!(request.correlation_hint(), None);
    }
}

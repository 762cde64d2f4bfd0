//! SQL translation agents and their messages.

pub mod messages;
pub mod requester;
pub mod translator;

pub use messages::{register_messages, DatabaseSchema, TranslationRequest, TranslationResponse};
pub use requester::{RequesterAgent, ResponseLog, REQUESTER_AGENT_TYPE};
pub use translator::{TranslatorAgent, SYSTEM_PROMPT, TRANSLATOR_AGENT_TYPE};

use std::collections::BTreeMap;

pub const DEFAULT_QUERY: &str = "Show me all users who placed orders in the last 30 days";
pub const DEFAULT_REQUEST_ID: &str = "test-001";

/// Users/orders schema sent by the requester role.
pub fn sample_schema() -> DatabaseSchema {
    let table = |columns: &[(&str, &str)]| -> BTreeMap<String, String> {
        columns
            .iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect()
    };

    let mut schema = BTreeMap::new();
    schema.insert(
        "users".to_string(),
        table(&[
            ("id", "INTEGER PRIMARY KEY"),
            ("name", "VARCHAR(100)"),
            ("email", "VARCHAR(255)"),
            ("created_at", "TIMESTAMP"),
        ]),
    );
    schema.insert(
        "orders".to_string(),
        table(&[
            ("id", "INTEGER PRIMARY KEY"),
            ("user_id", "INTEGER"),
            ("product_name", "VARCHAR(200)"),
            ("amount", "DECIMAL(10,2)"),
            ("order_date", "DATE"),
        ]),
    );
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_schema_tables() {
        let schema = sample_schema();
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["orders", "users"]);
        assert_eq!(schema["orders"]["amount"], "DECIMAL(10,2)");
        assert_eq!(schema["users"].len(), 4);
    }
}

//! Requester agent: receives translation responses and records them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::messages::TranslationResponse;
use crate::agent::{Agent, Handler, HandlerError, MessageContext, Routes};

pub const REQUESTER_AGENT_TYPE: &str = "sql_requester";

/// Responses seen by requester agents, shared with whoever registered them.
#[derive(Clone, Default)]
pub struct ResponseLog {
    responses: Arc<Mutex<Vec<TranslationResponse>>>,
    notify: Arc<Notify>,
}

impl ResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, response: TranslationResponse) {
        self.responses.lock().push(response);
        self.notify.notify_waiters();
    }

    pub fn responses(&self) -> Vec<TranslationResponse> {
        self.responses.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` responses have been recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<TranslationResponse> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() >= count {
                return self.responses();
            }
            notified.await;
        }
    }
}

pub struct RequesterAgent {
    log: ResponseLog,
}

impl RequesterAgent {
    pub fn new(log: ResponseLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Handler<TranslationResponse, ()> for RequesterAgent {
    async fn handle(&self, response: TranslationResponse, _ctx: MessageContext) -> Result<(), HandlerError> {
        match &response.error {
            Some(error) => warn!(request_id = %response.request_id, error = %error, "Translation failed"),
            None => info!(request_id = %response.request_id, sql = %response.sql, "Generated SQL"),
        }
        self.log.record(response);
        Ok(())
    }
}

impl Agent for RequesterAgent {
    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<TranslationResponse, ()>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AgentId;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_responses_are_recorded_in_order() {
        let log = ResponseLog::new();
        let agent = RequesterAgent::new(log.clone());
        let ctx = MessageContext {
            sender: None,
            recipient: AgentId::default_instance(REQUESTER_AGENT_TYPE),
            correlation_id: "c".to_string(),
            cancellation: CancellationToken::new(),
        };

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.wait_for(2).await })
        };

        agent
            .handle(TranslationResponse::ok("SELECT 1", "a"), ctx.clone())
            .await
            .unwrap();
        agent
            .handle(TranslationResponse::failed("b", "boom"), ctx)
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = seen.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(seen[1].is_error());
    }
}

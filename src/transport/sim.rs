//! Scripted broker client.

use super::{BrokerClient, SessionInfo, TransportError, KEEP_ALIVE};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Broker whose open/publish outcomes are queued up front; once a queue is
/// drained, operations succeed. Successful publishes are recorded.
#[derive(Default)]
pub struct SimBroker {
    opens: VecDeque<Result<(), TransportError>>,
    publishes: VecDeque<Result<(), TransportError>>,
    fail_close: bool,
    open: bool,
    open_calls: u32,
    close_calls: u32,
    published: Vec<(String, Vec<u8>)>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_opens(mut self, outcomes: impl IntoIterator<Item = Result<(), TransportError>>) -> Self {
        self.opens.extend(outcomes);
        self
    }

    pub fn script_publishes(mut self, outcomes: impl IntoIterator<Item = Result<(), TransportError>>) -> Self {
        self.publishes.extend(outcomes);
        self
    }

    /// Make every close report an error.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Queue more publish outcomes on a broker already in use.
    pub fn push_publish(&mut self, outcome: Result<(), TransportError>) {
        self.publishes.push_back(outcome);
    }

    pub fn push_open(&mut self, outcome: Result<(), TransportError>) {
        self.opens.push_back(outcome);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls
    }

    /// Topic and payload of each delivered publish.
    pub fn published(&self) -> &[(String, Vec<u8>)] {
        &self.published
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    fn endpoint(&self) -> String {
        "sim:1883".to_string()
    }

    async fn open(&mut self) -> Result<SessionInfo, TransportError> {
        self.open_calls += 1;
        self.open = false;
        self.opens.pop_front().unwrap_or(Ok(()))?;
        self.open = true;
        Ok(SessionInfo {
            keep_alive: KEEP_ALIVE,
        })
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        self.publishes.pop_front().unwrap_or(Ok(()))?;
        self.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.close_calls += 1;
        self.open = false;
        if self.fail_close {
            return Err(TransportError::Protocol("close failed".to_string()));
        }
        Ok(())
    }
}

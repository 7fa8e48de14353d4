//! Outbound messaging capability.
//!
//! The wire protocols of the SMS/Kakao providers live outside this codebase;
//! card execution only needs the seam below.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cards::Recipient;
use crate::errors::ToolError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub channel_used: String,
    pub fallback_used: bool,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        recipient: &Recipient,
        message: &str,
        template_code: Option<&str>,
    ) -> Result<SendOutcome, ToolError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: Recipient,
    pub message: String,
    pub template_code: Option<String>,
}

/// Test double that records every send and always succeeds on the primary
/// channel, unless told to fail.
#[derive(Clone, Default)]
pub struct RecordingMessageSender {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    fail_addresses: Arc<Mutex<Vec<String>>>,
}

impl RecordingMessageSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, address: impl Into<String>) {
        match self.fail_addresses.lock() {
            Ok(mut addresses) => addresses.push(address.into()),
            Err(poisoned) => poisoned.into_inner().push(address.into()),
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl MessageSender for RecordingMessageSender {
    async fn send(
        &self,
        recipient: &Recipient,
        message: &str,
        template_code: Option<&str>,
    ) -> Result<SendOutcome, ToolError> {
        let should_fail = match self.fail_addresses.lock() {
            Ok(addresses) => addresses.contains(&recipient.address),
            Err(poisoned) => poisoned.into_inner().contains(&recipient.address),
        };
        if should_fail {
            return Err(ToolError::Provider(format!(
                "delivery to {} refused by provider",
                recipient.address
            )));
        }

        let record = SentMessage {
            recipient: recipient.clone(),
            message: message.to_string(),
            template_code: template_code.map(str::to_string),
        };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(SendOutcome { success: true, channel_used: "kakao".to_string(), fallback_used: false })
    }
}

//! In-memory [`ChannelTransport`] that records every send.
//!
//! Backs `relay deliver --dry-run` and the scripted transport used across the
//! workspace tests. Failures can be queued per send primitive; once a queue is
//! empty every send succeeds with a sequential synthetic id.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use relay_core::lock_or_recover;
use serde::Serialize;

use crate::delivery_types::{DeliveryTarget, SentMessage};
use crate::transport::{BackendSendError, ChannelTransport, DirectMessage, ProxyMessage};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum RecordedSend {
    ProxyIdentity {
        target: DeliveryTarget,
        message: ProxyMessage,
        outcome: RecordedOutcome,
    },
    Direct {
        target: DeliveryTarget,
        message: DirectMessage,
        outcome: RecordedOutcome,
    },
}

impl RecordedSend {
    pub fn content(&self) -> &str {
        match self {
            Self::ProxyIdentity { message, .. } => &message.content,
            Self::Direct { message, .. } => &message.content,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }

    pub fn succeeded(&self) -> bool {
        match self {
            Self::ProxyIdentity { outcome, .. } | Self::Direct { outcome, .. } => {
                matches!(outcome, RecordedOutcome::Sent { .. })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Sent { message_id: String },
    Failed { reason_code: String },
}

#[derive(Default)]
pub struct RecordingTransport {
    proxy_failures: Mutex<VecDeque<BackendSendError>>,
    direct_failures: Mutex<VecDeque<BackendSendError>>,
    fail_after_successes: Mutex<Option<(usize, BackendSendError)>>,
    sends: Mutex<Vec<RecordedSend>>,
    next_id: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next proxy-identity send.
    pub fn push_proxy_failure(&self, error: BackendSendError) {
        lock_or_recover(&self.proxy_failures).push_back(error);
    }

    /// Queues a failure for the next direct send.
    pub fn push_direct_failure(&self, error: BackendSendError) {
        lock_or_recover(&self.direct_failures).push_back(error);
    }

    /// Once `successes` sends have succeeded, every later send fails with
    /// `error`.
    pub fn fail_after(&self, successes: usize, error: BackendSendError) {
        *lock_or_recover(&self.fail_after_successes) = Some((successes, error));
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        lock_or_recover(&self.sends).clone()
    }

    pub fn successful_sends(&self) -> Vec<RecordedSend> {
        self.sends()
            .into_iter()
            .filter(RecordedSend::succeeded)
            .collect()
    }

    pub fn send_count(&self) -> usize {
        lock_or_recover(&self.sends).len()
    }

    fn next_outcome(
        &self,
        queue: &Mutex<VecDeque<BackendSendError>>,
        channel_id: &str,
    ) -> Result<SentMessage, BackendSendError> {
        if let Some(error) = lock_or_recover(queue).pop_front() {
            return Err(error);
        }
        let successes = self.successful_sends().len();
        if let Some((limit, error)) = lock_or_recover(&self.fail_after_successes).as_ref() {
            if successes >= *limit {
                return Err(error.clone());
            }
        }
        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SentMessage {
            id: format!("recorded-{sequence}"),
            channel_id: channel_id.to_string(),
        })
    }
}

fn recorded_outcome(result: &Result<SentMessage, BackendSendError>) -> RecordedOutcome {
    match result {
        Ok(sent) => RecordedOutcome::Sent {
            message_id: sent.id.clone(),
        },
        Err(error) => RecordedOutcome::Failed {
            reason_code: error.reason_code.clone(),
        },
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send_proxy_identity(
        &self,
        target: &DeliveryTarget,
        message: ProxyMessage,
    ) -> Result<SentMessage, BackendSendError> {
        let result = self.next_outcome(&self.proxy_failures, target.destination_id());
        lock_or_recover(&self.sends).push(RecordedSend::ProxyIdentity {
            target: target.clone(),
            message,
            outcome: recorded_outcome(&result),
        });
        result
    }

    async fn send_direct(
        &self,
        target: &DeliveryTarget,
        message: DirectMessage,
    ) -> Result<SentMessage, BackendSendError> {
        let result = self.next_outcome(&self.direct_failures, target.destination_id());
        lock_or_recover(&self.sends).push(RecordedSend::Direct {
            target: target.clone(),
            message,
            outcome: recorded_outcome(&result),
        });
        result
    }
}

//! Recording mail client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::mail::{MailClient, MailError, MailMessage};

/// Records every message it is asked to send. Queued errors are returned
/// (oldest first) before falling back to success.
#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<MailMessage>>,
    errors: Mutex<VecDeque<MailError>>,
}

impl FakeMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `send` fail with `error`.
    pub fn fail_next(&self, error: MailError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push_back(error);
        }
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MailClient for FakeMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let queued = self.errors.lock().ok().and_then(|mut e| e.pop_front());
        if let Some(error) = queued {
            return Err(error);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}

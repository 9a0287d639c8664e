use futures::{stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::mail::{Mail, Mailbox, Transport};

// BulkSendResult

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendResult {
    /// Recipient address, trimmed.
    pub email: String,
    /// Error returned by the SMTP server if the mail was not sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Message id if the mail was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// True if the mail was sent.
    pub success: bool,
}

impl BulkSendResult {
    fn sent(email: String, message_id: String) -> Self {
        Self {
            email,
            error: None,
            message_id: Some(message_id),
            success: true,
        }
    }

    fn failed(email: String, error: String) -> Self {
        Self {
            email,
            error: Some(error),
            message_id: None,
            success: false,
        }
    }
}

// BulkSendReport

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendReport {
    /// Result of each send, in the order recipients were given.
    pub details: Vec<BulkSendResult>,
    /// Number of mails which were not sent.
    pub failed: usize,
    /// Number of mails sent.
    pub successful: usize,
    /// Number of recipients.
    pub total: usize,
}

impl From<Vec<BulkSendResult>> for BulkSendReport {
    fn from(details: Vec<BulkSendResult>) -> Self {
        let successful = details.iter().filter(|res| res.success).count();
        Self {
            failed: details.len() - successful,
            successful,
            total: details.len(),
            details,
        }
    }
}

// BulkDispatcher

/// Sends one mail per recipient over a shared transport.
///
/// At most `concurrency` sends are in flight at once. A failed or slow send is recorded in the
/// report and never interrupts or delays the other ones: a free slot is refilled as soon as any
/// send settles.
pub struct BulkDispatcher<'a, T: Transport> {
    concurrency: usize,
    from: &'a Mailbox,
    transport: &'a T,
}

impl<'a, T: Transport> BulkDispatcher<'a, T> {
    pub fn new(transport: &'a T, from: &'a Mailbox, concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            from,
            transport,
        }
    }

    #[instrument(skip(self, emails, subject, html), fields(bulk.total = emails.len()))]
    pub async fn dispatch(&self, emails: Vec<String>, subject: &str, html: &str) -> BulkSendReport {
        debug!(bulk.concurrency = self.concurrency, "dispatching mails");
        let mut details: Vec<(usize, BulkSendResult)> = stream::iter(emails.into_iter().enumerate())
            .map(|(idx, email)| async move { (idx, self.send_one(email, subject, html).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        details.sort_unstable_by_key(|(idx, _)| *idx);
        let report = BulkSendReport::from(
            details
                .into_iter()
                .map(|(_, res)| res)
                .collect::<Vec<_>>(),
        );
        info!(
            bulk.successful = report.successful,
            bulk.failed = report.failed,
            "bulk dispatch done"
        );
        report
    }

    async fn send_one(&self, email: String, subject: &str, html: &str) -> BulkSendResult {
        let mail = Mail::new(self.from, &email, subject, html);
        match self.transport.send(&mail).await {
            Ok(id) => {
                debug!(mail.to = %email, mail.id = %id, "mail sent");
                BulkSendResult::sent(email, id)
            }
            Err(err) => {
                warn!(mail.to = %email, "failed to send mail: {err}");
                BulkSendResult::failed(email, err.to_string())
            }
        }
    }
}

// Tests

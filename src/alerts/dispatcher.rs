use crate::alerts::mailer::{MailMessage, MailTransport};
use crate::error::DispatchError;
use crate::events::{AlertEvent, Bound};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// Formats threshold violations and hands them to the mail transport
///
/// The dispatcher holds only configuration. Every failure is logged and returned to
/// the caller; none of them stop monitoring, and nothing is retried.
pub struct NotificationDispatcher {
    transport: Arc<dyn MailTransport>,
    recipients: Vec<String>,
    timeout: Duration,
}

impl NotificationDispatcher {
    /// Create a dispatcher
    ///
    /// # Arguments
    ///
    /// * `transport` - Mail collaborator, already bound to the sender credentials
    /// * `recipients` - Addresses that receive every alert
    /// * `timeout` - Upper bound on a single delivery attempt
    pub fn new(
        transport: Arc<dyn MailTransport>,
        recipients: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            recipients,
            timeout,
        }
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Send an alert for one violation to every recipient
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NoRecipients` without contacting the transport when no
    /// recipients are configured, `DispatchError::Timeout` when the attempt exceeds
    /// the timeout, and whatever the transport reports otherwise.
    pub async fn dispatch(&self, event: &AlertEvent) -> Result<(), DispatchError> {
        if self.recipients.is_empty() {
            error!(
                "Alert for line {} not sent: no recipients configured",
                event.record.source_line_index
            );
            return Err(DispatchError::NoRecipients);
        }

        let message = MailMessage {
            recipients: self.recipients.clone(),
            subject: Self::format_subject(event),
            body: Self::format_body(event),
        };

        let result = match tokio::time::timeout(self.timeout, self.transport.send(message)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        };

        match &result {
            Ok(()) => info!(
                "Sent {} threshold alert for line {} to {} recipient(s)",
                event.threshold_exceeded,
                event.record.source_line_index,
                self.recipients.len()
            ),
            Err(e) => error!(
                "Failed to send alert for line {}: {}",
                event.record.source_line_index, e
            ),
        }

        result
    }

    fn format_subject(event: &AlertEvent) -> String {
        format!(
            "ANUBIS alert: voltage {} the {} threshold",
            direction(event.threshold_exceeded),
            event.threshold_exceeded
        )
    }

    /// Human-readable alert text with date, time, reading and the crossed bound
    fn format_body(event: &AlertEvent) -> String {
        let record = &event.record;
        format!(
            "ALERT: ANUBIS recorded a voltage on {} at {} that was {} the {} threshold of {} V.\n\
             The recorded voltage was {} V (line {} of the run log).",
            record.timestamp.format("%d/%m/%Y"),
            record.timestamp.format("%H:%M:%S"),
            direction(event.threshold_exceeded),
            event.threshold_exceeded,
            event.limit_value,
            record.voltage,
            record.source_line_index
        )
    }
}

fn direction(bound: Bound) -> &'static str {
    match bound {
        Bound::Upper => "above",
        Bound::Lower => "below",
    }
}

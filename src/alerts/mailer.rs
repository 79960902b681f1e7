use crate::error::DispatchError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by a mail transport send attempt
pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send>>;

/// An outgoing alert mail
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// External mail collaborator: attempt delivery, report success or failure
#[cfg_attr(test, mockall::automock)]
pub trait MailTransport: Send + Sync {
    fn send(&self, message: MailMessage) -> SendFuture;
}

/// Sender account for the alert system
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Address alerts are sent from
    ///
    /// A bare username is a Gmail account name.
    pub fn sender_address(&self) -> String {
        if self.username.contains('@') {
            self.username.clone()
        } else {
            format!("{}@gmail.com", self.username)
        }
    }
}

/// Delivers alert mail through an SMTP relay with STARTTLS
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    /// Create a mailer for the given relay
    ///
    /// No connection is made until the first send.
    ///
    /// # Arguments
    ///
    /// * `host` - SMTP relay hostname (e.g., "smtp.gmail.com")
    /// * `port` - Submission port, normally 587
    /// * `credentials` - Account used to authenticate and as the sender
    /// * `timeout` - Socket timeout for each SMTP command
    pub fn new(
        host: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| DispatchError::Transport(e.to_string()))?
            .port(port)
            .timeout(Some(timeout));

        if !credentials.username.is_empty() {
            builder = builder.credentials(SmtpCredentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from: credentials.sender_address(),
        })
    }

    fn build_message(from: &str, message: &MailMessage) -> Result<Message, DispatchError> {
        let parse = |address: &str| {
            address
                .parse::<Mailbox>()
                .map_err(|e| DispatchError::InvalidAddress(format!("{}: {}", address, e)))
        };

        let mut builder = Message::builder()
            .from(parse(from)?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &message.recipients {
            builder = builder.to(parse(recipient)?);
        }

        builder
            .body(message.body.clone())
            .map_err(|e| DispatchError::Build(e.to_string()))
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, message: MailMessage) -> SendFuture {
        let transport = self.transport.clone();
        let email = Self::build_message(&self.from, &message);

        Box::pin(async move {
            transport
                .send(email?)
                .await
                .map(|_| ())
                .map_err(|e| DispatchError::Transport(e.to_string()))
        })
    }
}

/// Transport that only logs alert mail, for dry runs without a relay
#[derive(Debug, Default)]
pub struct LogMailer;

impl MailTransport for LogMailer {
    fn send(&self, message: MailMessage) -> SendFuture {
        info!(
            "MAIL (not sent) - To: {}, Subject: {}, Body: {}",
            message.recipients.join(", "),
            message.subject,
            message.body
        );
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(recipients: &[&str]) -> MailMessage {
        MailMessage {
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            subject: "Voltage alert".to_string(),
            body: "Reading out of band".to_string(),
        }
    }

    #[test]
    fn test_sender_address_for_bare_username() {
        let credentials = Credentials::new("lppcautomated", "secret");
        assert_eq!(credentials.sender_address(), "lppcautomated@gmail.com");
    }

    #[test]
    fn test_sender_address_for_full_address() {
        let credentials = Credentials::new("alerts@cern.ch", "secret");
        assert_eq!(credentials.sender_address(), "alerts@cern.ch");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("lppcautomated", "42oxford");
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("lppcautomated"));
        assert!(!debug.contains("42oxford"));
    }

    #[test]
    fn test_build_message_with_all_recipients() {
        let email = SmtpMailer::build_message(
            "sender@example.org",
            &message(&["a@example.org", "b@example.org"]),
        )
        .unwrap();

        let recipients: Vec<String> = email
            .envelope()
            .to()
            .iter()
            .map(|address| address.to_string())
            .collect();
        assert_eq!(recipients, vec!["a@example.org", "b@example.org"]);
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let result = SmtpMailer::build_message("sender@example.org", &message(&["not-an-email"]));
        assert!(matches!(result, Err(DispatchError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_smtp_send_reports_bad_address_without_network() {
        let mailer = SmtpMailer::new(
            "localhost",
            2525,
            &Credentials::new("user", "pass"),
            Duration::from_secs(1),
        )
        .unwrap();

        let result = mailer.send(message(&["not-an-email"])).await;
        assert!(matches!(result, Err(DispatchError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_log_mailer_always_succeeds() {
        let result = LogMailer.send(message(&["a@example.org"])).await;
        assert_eq!(result, Ok(()));
    }
}

/// Alert formatting and delivery
pub mod dispatcher;
pub mod mailer;

pub use dispatcher::NotificationDispatcher;
pub use mailer::{Credentials, LogMailer, MailMessage, MailTransport, SmtpMailer};

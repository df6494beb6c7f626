//! Verification mail: message shape, the sender seam, and the job handler.

use std::future::Future;
use std::sync::Arc;

use lbx_core::config::MailConfig;
use lbx_storage::KvCache;
use thiserror::Error;
use tracing::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: Contact,
    pub from: Contact,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient {address}: {reason}")]
    InvalidRecipient { address: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound mail transport.
pub trait MailSender: Send + Sync + 'static {
    /// Reject addresses that can never be delivered to.
    fn validate(&self, address: &str) -> Result<(), MailError>;

    fn send(&self, mail: Mail) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Sender that only records outgoing mail in the log. Message bodies are
/// never logged.
pub struct LogMailSender {
    span: Span,
}

impl LogMailSender {
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

impl MailSender for LogMailSender {
    fn validate(&self, address: &str) -> Result<(), MailError> {
        if lbx_core::is_valid_email(address) {
            Ok(())
        } else {
            Err(MailError::InvalidRecipient {
                address: address.to_string(),
                reason: "malformed address".into(),
            })
        }
    }

    async fn send(&self, mail: Mail) -> Result<(), MailError> {
        tracing::info!(
            parent: &self.span,
            to = %mail.to.email,
            subject = %mail.subject,
            "mail: delivered to log sink"
        );
        Ok(())
    }
}

/// Result of running one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Transient failure; run again after a backoff.
    Retry(String),
    /// The job can never succeed; drop it.
    Permanent(String),
}

/// Sends the verification code cached for an address.
pub struct VerificationMailer<S> {
    sender: S,
    codes: Arc<dyn KvCache>,
    from: Contact,
    span: Span,
}

impl<S: MailSender> VerificationMailer<S> {
    pub fn new(sender: S, codes: Arc<dyn KvCache>, config: &MailConfig, span: Span) -> Self {
        Self {
            sender,
            codes,
            from: Contact {
                email: config.from_email.clone(),
                name: config.from_name.clone(),
            },
            span,
        }
    }

    pub async fn handle(&self, email: &str) -> TaskOutcome {
        let code = match self.codes.get(email) {
            Ok(Some(code)) => code,
            // Verified or expired in the meantime.
            Ok(None) => return TaskOutcome::Permanent("no pending verification code".into()),
            Err(e) => return TaskOutcome::Retry(format!("reading code: {e}")),
        };

        if let Err(e) = self.sender.validate(email) {
            return TaskOutcome::Permanent(e.to_string());
        }

        let mail = verification_mail(&self.from, email, &code);
        match self.sender.send(mail).await {
            Ok(()) => {
                tracing::debug!(parent: &self.span, "verification mail sent");
                TaskOutcome::Success
            }
            Err(e) => TaskOutcome::Retry(e.to_string()),
        }
    }
}

pub fn verification_mail(from: &Contact, email: &str, code: &str) -> Mail {
    let text = format!(
        "Welcome to Lockbox!\n\n\
         Your verification code is: {code}\n\n\
         Enter it when you log in to finish setting up your account.\n\
         If you did not sign up, ignore this message."
    );
    let html = format!(
        "<html><body>\
         <h2>Welcome to Lockbox!</h2>\
         <p>Your verification code is:</p>\
         <p style=\"font-size:24px;font-weight:bold;letter-spacing:4px\">{code}</p>\
         <p>Enter it when you log in to finish setting up your account.</p>\
         <p>If you did not sign up, ignore this message.</p>\
         </body></html>"
    );
    Mail {
        to: Contact {
            email: email.to_string(),
            name: email.to_string(),
        },
        from: from.clone(),
        subject: "Confirm your lockbox account".into(),
        html,
        text,
    }
}

use std::{collections::VecDeque, sync::Mutex};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use latch_core::EmailAddress;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::core::SmtpConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum NotifyError {
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
    #[cfg(test)]
    #[error("delivery rejected")]
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundMessage {
    pub(crate) to: EmailAddress,
    pub(crate) subject: String,
    pub(crate) text: String,
    pub(crate) html: String,
}

pub(crate) struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub(crate) fn new(config: &SmtpConfig, from: &str) -> Result<Self, NotifyError> {
        let from: Mailbox = from.parse()?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(message.to.as_str().parse()?)
            .subject(message.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        self.transport.send(email).await?;
        Ok(())
    }
}

/// Keeps the most recent messages in process and logs each delivery.
pub(crate) struct OutboxMailer {
    capacity: usize,
    sent: Mutex<VecDeque<OutboundMessage>>,
    #[cfg(test)]
    rejecting: AtomicBool,
}

impl OutboxMailer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sent: Mutex::new(VecDeque::new()),
            #[cfg(test)]
            rejecting: AtomicBool::new(false),
        }
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        #[cfg(test)]
        if self.rejecting.load(Ordering::Relaxed) {
            return Err(NotifyError::Rejected);
        }

        tracing::info!(
            event = "notify.outbox",
            subject = %message.subject,
            "outbound message retained in outbox"
        );
        if let Ok(mut sent) = self.sent.lock() {
            if sent.len() == self.capacity {
                sent.pop_front();
            }
            sent.push_back(message.clone());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .map(|sent| sent.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub(crate) enum Mailer {
    Smtp(SmtpMailer),
    Outbox(OutboxMailer),
}

impl Mailer {
    pub(crate) async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        match self {
            Self::Smtp(mailer) => mailer.send(message).await,
            Self::Outbox(mailer) => mailer.send(message),
        }
    }

    #[cfg(test)]
    pub(crate) fn outbox(&self) -> Option<&OutboxMailer> {
        match self {
            Self::Smtp(_) => None,
            Self::Outbox(mailer) => Some(mailer),
        }
    }
}

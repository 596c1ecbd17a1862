//! Outbound notifications: operator mail and long-poll event publishing.
//!
//! Delivery is best effort. The lifecycle operations that trigger
//! notifications have already durably changed the store by the time a
//! notification goes out, so a failed delivery is logged and swallowed
//! rather than propagated.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Mail template for a newly stored signing request.
pub const TEMPLATE_REQUEST_STORED: &str = "request-stored.md";
/// Mail template for a first-time signing.
pub const TEMPLATE_CERTIFICATE_SIGNED: &str = "certificate-signed.md";
/// Mail template for a same-key re-signing.
pub const TEMPLATE_CERTIFICATE_RENEWED: &str = "certificate-renewed.md";
/// Mail template for a revocation.
pub const TEMPLATE_CERTIFICATE_REVOKED: &str = "certificate-revoked.md";

/// A file attached to an operator mail.
pub struct Attachment {
    pub content: Vec<u8>,
    pub content_type: &'static str,
    pub filename: String,
}

impl Attachment {
    pub fn pem(content: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            content,
            content_type: "application/x-pem-file",
            filename: filename.into(),
        }
    }
}

/// An operator mail, identified by template name. Rendering and transport
/// are up to the [`Mailer`] implementation.
pub struct MailMessage {
    pub template: &'static str,
    pub common_name: String,
    pub serial_hex: Option<String>,
    pub attachments: Vec<Attachment>,
}

pub trait Mailer: Send + Sync {
    fn deliver(&self, message: MailMessage) -> anyhow::Result<()>;
}

/// Fan-out for lifecycle events consumed by interface layers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &str, common_name: &str) -> anyhow::Result<()>;
}

/// Pushes payloads to a long-poll relay over HTTP. The configured URL
/// template contains a `{}` placeholder for the channel token.
pub struct LongPollPublisher {
    client: reqwest::blocking::Client,
    template: String,
}

impl LongPollPublisher {
    pub fn new(template: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("certmill/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            template: template.into(),
        })
    }

    fn url(&self, token: &str) -> String {
        self.template.replacen("{}", token, 1)
    }

    pub fn publish(&self, token: &str, body: &[u8], content_type: &'static str) -> anyhow::Result<()> {
        self.client
            .post(self.url(token))
            .header("Content-Type", content_type)
            .body(body.to_vec())
            .send()?
            .error_for_status()?;
        Ok(())
    }

    /// Tear down a channel, e.g. when the request it served is deleted.
    pub fn retract(&self, token: &str) -> anyhow::Result<()> {
        self.client.delete(self.url(token)).send()?.error_for_status()?;
        Ok(())
    }
}

/// All notification sinks behind one handle. Every sink is optional and a
/// missing one is simply skipped.
#[derive(Default)]
pub struct NotificationDispatcher {
    mailer: Option<Arc<dyn Mailer>>,
    events: Option<Arc<dyn EventPublisher>>,
    long_poll: Option<LongPollPublisher>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_long_poll(mut self, publisher: LongPollPublisher) -> Self {
        self.long_poll = Some(publisher);
        self
    }

    pub(crate) fn mail(&self, message: MailMessage) {
        if let Some(mailer) = &self.mailer {
            let template = message.template;
            let common_name = message.common_name.clone();
            if let Err(e) = mailer.deliver(message) {
                warn!(template, %common_name, error = %e, "mail delivery failed");
            }
        }
    }

    pub(crate) fn event(&self, event: &str, common_name: &str) {
        if let Some(events) = &self.events {
            if let Err(e) = events.publish(event, common_name) {
                warn!(event, common_name, error = %e, "event publish failed");
            }
        }
    }

    pub(crate) fn long_poll_publish(&self, token: &str, body: &[u8], content_type: &'static str) {
        if let Some(publisher) = &self.long_poll {
            if let Err(e) = publisher.publish(token, body, content_type) {
                warn!(token, error = %e, "long-poll publish failed");
            }
        }
    }

    pub(crate) fn long_poll_retract(&self, token: &str) {
        if let Some(publisher) = &self.long_poll {
            if let Err(e) = publisher.retract(token) {
                warn!(token, error = %e, "long-poll retract failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingMailer;

    impl Mailer for FailingMailer {
        fn deliver(&self, _message: MailMessage) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    struct CountingEvents(Mutex<Vec<(String, String)>>);

    impl EventPublisher for CountingEvents {
        fn publish(&self, event: &str, common_name: &str) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((event.to_string(), common_name.to_string()));
            Ok(())
        }
    }

    #[test]
    fn url_template_substitution() {
        let publisher = LongPollPublisher::new("http://push.local/pub/{}").unwrap();
        assert_eq!(publisher.url("abc123"), "http://push.local/pub/abc123");
    }

    #[test]
    fn mail_failure_does_not_panic_or_propagate() {
        let dispatcher = NotificationDispatcher::new().with_mailer(Arc::new(FailingMailer));
        dispatcher.mail(MailMessage {
            template: TEMPLATE_REQUEST_STORED,
            common_name: "gw.example.com".to_string(),
            serial_hex: None,
            attachments: vec![],
        });
    }

    #[test]
    fn events_reach_the_publisher() {
        let events = Arc::new(CountingEvents(Mutex::new(Vec::new())));
        let dispatcher = NotificationDispatcher::new().with_events(events.clone());
        dispatcher.event("request-signed", "gw.example.com");
        assert_eq!(
            events.0.lock().unwrap().as_slice(),
            &[("request-signed".to_string(), "gw.example.com".to_string())]
        );
    }

    #[test]
    fn empty_dispatcher_is_inert() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.event("request-deleted", "gw.example.com");
        dispatcher.long_poll_retract("deadbeef");
    }
}

use crate::config::EmailConfig;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use lettre::message::header;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// A plain-text mail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Email notification sender
#[derive(Clone)]
pub struct SmtpNotifier {
    smtp_server: String,
    smtp_port: u16,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    from_email: String,
    from_name: Option<String>,
    use_tls: bool,
}

impl SmtpNotifier {
    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        let smtp_server = config.smtp_server.clone().unwrap_or_default();
        if smtp_server.is_empty() {
            return Err(AppError::Configuration(
                "SMTP server cannot be empty".to_string(),
            ));
        }

        let from_email = config.from_email.clone().unwrap_or_default();
        if from_email.is_empty() {
            return Err(AppError::Configuration(
                "From email cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            smtp_server,
            smtp_port: config.smtp_port,
            smtp_username: config.smtp_username.clone(),
            smtp_password: config.smtp_password.clone(),
            from_email,
            from_name: config.from_name.clone(),
            use_tls: config.smtp_use_tls,
        })
    }

    fn build_message(&self, notification: &Notification) -> Result<Message> {
        let from_mailbox = match &self.from_name {
            Some(name) => format!("{} <{}>", name, self.from_email),
            None => self.from_email.clone(),
        };

        let from = from_mailbox
            .parse()
            .map_err(|e| AppError::Configuration(format!("Invalid from address: {}", e)))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(notification.subject.as_str())
            .header(header::ContentType::TEXT_PLAIN);

        for addr in &notification.to {
            let mailbox = addr.parse().map_err(|e| {
                AppError::Validation(format!("Invalid recipient address '{}': {}", addr, e))
            })?;
            builder = builder.to(mailbox);
        }

        builder
            .body(notification.body.clone())
            .map_err(|e| AppError::Notification(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if notification.to.is_empty() {
            return Err(AppError::Validation("No recipients specified".to_string()));
        }

        let message = self.build_message(notification)?;

        // lettre's blocking transport stays off the async workers
        let result = tokio::task::spawn_blocking({
            let smtp_server = self.smtp_server.clone();
            let smtp_port = self.smtp_port;
            let username = self.smtp_username.clone();
            let password = self.smtp_password.clone();
            let use_tls = self.use_tls;

            move || {
                let transport_builder = if use_tls {
                    SmtpTransport::starttls_relay(&smtp_server).map_err(|e| {
                        AppError::Configuration(format!("Invalid SMTP server: {}", e))
                    })?
                } else {
                    SmtpTransport::builder_dangerous(&smtp_server)
                };
                let mut transport_builder = transport_builder.port(smtp_port);

                if let (Some(user), Some(pass)) = (username, password) {
                    transport_builder = transport_builder.credentials(Credentials::new(user, pass));
                }

                transport_builder
                    .build()
                    .send(&message)
                    .map_err(|e| AppError::Notification(format!("Failed to send email: {}", e)))?;

                Ok::<(), AppError>(())
            }
        })
        .await
        .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))?;

        match result {
            Ok(()) => {
                info!(recipients = ?notification.to, subject = %notification.subject, "Email sent");
                Ok(())
            }
            Err(e) => {
                error!(recipients = ?notification.to, error = %e, "Failed to send email");
                Err(e)
            }
        }
    }
}

/// Keeps sent notifications in memory
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_config() -> EmailConfig {
        EmailConfig {
            smtp_server: Some("smtp.example.com".to_string()),
            smtp_username: Some("mailer".to_string()),
            smtp_password: Some("secret".to_string()),
            from_email: Some("shop@example.com".to_string()),
            from_name: Some("Storefront".to_string()),
            ..EmailConfig::default()
        }
    }

    #[test]
    fn test_requires_server_and_sender() {
        let mut config = email_config();
        config.smtp_server = None;
        assert!(matches!(
            SmtpNotifier::from_config(&config),
            Err(AppError::Configuration(_))
        ));

        let mut config = email_config();
        config.from_email = Some(String::new());
        assert!(SmtpNotifier::from_config(&config).is_err());
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let notifier = SmtpNotifier::from_config(&email_config()).unwrap();
        let notification = Notification {
            to: vec!["not an address".to_string()],
            subject: "Hi".to_string(),
            body: "Body".to_string(),
        };
        assert!(matches!(
            notifier.build_message(&notification),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_recipients_fails_fast() {
        let notifier = SmtpNotifier::from_config(&email_config()).unwrap();
        let notification = Notification {
            to: vec![],
            subject: "Hi".to_string(),
            body: "Body".to_string(),
        };
        assert!(matches!(
            notifier.send(&notification).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        let notification = Notification {
            to: vec!["ada@example.com".to_string()],
            subject: "Welcome".to_string(),
            body: "Hello".to_string(),
        };
        notifier.send(&notification).await.unwrap();
        assert_eq!(notifier.sent(), vec![notification]);
    }
}

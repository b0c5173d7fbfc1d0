//! Confirmation email, delivered over SMTP or written to a directory of
//! `.eml` files for development.

use std::path::PathBuf;

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};

use crate::clock::RegionalZone;
use crate::notify::{Confirmation, NotificationSink, NotifyError};

#[derive(Clone, PartialEq, Eq)]
pub enum MailTransportConfig {
    Smtp {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        use_tls: bool,
    },
    /// One `.eml` file per message.
    File { path: PathBuf },
}

impl std::fmt::Debug for MailTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailTransportConfig::Smtp {
                host,
                port,
                username,
                use_tls,
                ..
            } => f
                .debug_struct("Smtp")
                .field("host", host)
                .field("port", port)
                .field("username", username)
                .field("use_tls", use_tls)
                .finish_non_exhaustive(),
            MailTransportConfig::File { path } => {
                f.debug_struct("File").field("path", path).finish()
            }
        }
    }
}

impl std::fmt::Display for MailTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailTransportConfig::Smtp { host, port, .. } => write!(f, "smtp://{host}:{port}"),
            MailTransportConfig::File { path } => write!(f, "file://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    /// `From:` mailbox, either `addr` or `Name <addr>`.
    pub sender: String,
    pub transport: MailTransportConfig,
}

/// What a confirmation says, before it becomes a MIME message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Letter {
    pub to: String,
    pub subject: String,
    pub body: String,
}

enum Transport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

pub struct MailSink {
    transport: Transport,
    sender: Mailbox,
    zone: RegionalZone,
}

impl MailSink {
    pub fn new(config: &MailConfig, zone: RegionalZone) -> Result<Self, NotifyError> {
        let sender = config
            .sender
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Rejected(format!("sender {:?}: {e}", config.sender)))?;

        let transport = match &config.transport {
            MailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled for {host}");
                }
                let builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                        .map_err(|e| NotifyError::Io(format!("smtp relay {host}: {e}")))?
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                };
                let builder = builder.port(*port);
                let builder = match (username, password) {
                    (Some(user), Some(pass)) => {
                        builder.credentials(Credentials::new(user.clone(), pass.clone()))
                    }
                    _ => builder,
                };
                Transport::Smtp(builder.build())
            }
            MailTransportConfig::File { path } => {
                std::fs::create_dir_all(path)
                    .map_err(|e| NotifyError::Io(format!("{}: {e}", path.display())))?;
                Transport::File(AsyncFileTransport::<Tokio1Executor>::new(path))
            }
        };

        Ok(Self {
            transport,
            sender,
            zone,
        })
    }

    pub fn render(&self, c: &Confirmation) -> Letter {
        let greeting = c.user_handle.split('@').next().unwrap_or(&c.user_handle);
        let (date, time) = match self.zone.local(c.start) {
            Some(at) => (
                at.format("%A, %B %d, %Y").to_string(),
                at.format("%I:%M %p").to_string(),
            ),
            None => (String::new(), String::new()),
        };
        let body = format!(
            "Hi {greeting},\n\
             Your booking is confirmed!\n\
             \n\
             Game: {}\n\
             Date: {date}\n\
             Time: {time}\n\
             \n\
             We look forward to seeing you.\n\
             Thanks,\n\
             The Sports Room Team\n",
            c.resource_name
        );
        Letter {
            to: c.user_handle.clone(),
            subject: format!("Booking Confirmation for {}", c.resource_name),
            body,
        }
    }

    /// Fails on a recipient that is not a single well-formed mailbox.
    pub fn compose(&self, letter: &Letter) -> Result<Message, NotifyError> {
        let to = letter
            .to
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Rejected(format!("recipient {:?}: {e}", letter.to)))?;
        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(letter.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(letter.body.clone())
            .map_err(|e| NotifyError::Rejected(format!("build message: {e}")))
    }
}

#[async_trait]
impl NotificationSink for MailSink {
    async fn notify(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        let letter = self.render(confirmation);
        let message = self.compose(&letter)?;
        match &self.transport {
            Transport::Smtp(smtp) => {
                smtp.send(message)
                    .await
                    .map_err(|e| NotifyError::Io(format!("send smtp: {e}")))?;
            }
            Transport::File(file) => {
                file.send(message)
                    .await
                    .map_err(|e| NotifyError::Io(format!("write eml: {e}")))?;
            }
        }
        tracing::debug!(to = %letter.to, booking = %confirmation.reservation_id, "confirmation mailed");
        Ok(())
    }
}

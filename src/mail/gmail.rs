use std::{io, time::Duration};

use mail_send::{mail_builder::MessageBuilder, SmtpClientBuilder};
use tracing::{debug, instrument};

use super::{Credentials, Error, ErrorKind, Mail, Result, Transport, TransportFactory};

// Args

#[derive(clap::Args, Clone, Debug, Eq, PartialEq)]
pub struct SmtpArgs {
    #[arg(
        long = "smtp-host",
        env = "SMTP_HOST",
        name = "SMTP_HOST",
        default_value = "smtp.gmail.com",
        long_help = "SMTP server address"
    )]
    pub host: String,
    #[arg(
        long = "smtp-implicit-tls",
        env = "SMTP_IMPLICIT_TLS",
        name = "SMTP_IMPLICIT_TLS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        long_help = "Enable SMTP implicit TLS (STARTTLS is used otherwise)"
    )]
    pub implicit_tls: bool,
    #[arg(
        long = "smtp-port",
        env = "SMTP_PORT",
        name = "SMTP_PORT",
        default_value_t = 465,
        long_help = "SMTP server port"
    )]
    pub port: u16,
    #[arg(
        long = "smtp-timeout",
        env = "SMTP_TIMEOUT",
        name = "SMTP_TIMEOUT",
        default_value_t = 30,
        long_help = "Number of seconds to wait for an SMTP server response"
    )]
    pub timeout: u64,
}

impl Default for SmtpArgs {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".into(),
            implicit_tls: true,
            port: 465,
            timeout: 30,
        }
    }
}

// GmailTransportFactory

pub struct GmailTransportFactory {
    args: SmtpArgs,
}

impl GmailTransportFactory {
    pub fn new(args: SmtpArgs) -> Self {
        Self { args }
    }
}

impl TransportFactory for GmailTransportFactory {
    type Transport = GmailTransport;

    fn create(&self, creds: &Credentials) -> GmailTransport {
        GmailTransport {
            args: self.args.clone(),
            creds: creds.clone(),
        }
    }
}

// GmailTransport

pub struct GmailTransport {
    args: SmtpArgs,
    creds: Credentials,
}

impl GmailTransport {
    fn client_builder(&self) -> SmtpClientBuilder<&str> {
        SmtpClientBuilder::new(self.args.host.as_str(), self.args.port)
            .implicit_tls(self.args.implicit_tls)
            .credentials((self.creds.user.as_str(), self.creds.password.as_str()))
            .timeout(Duration::from_secs(self.args.timeout))
    }
}

impl Transport for GmailTransport {
    #[instrument(skip(self), fields(smtp.host = %self.args.host, smtp.port = self.args.port))]
    async fn verify(&self) -> Result {
        debug!("connecting smtp client");
        let client = self.client_builder().connect().await?;
        debug!("closing smtp connection");
        client.quit().await?;
        Ok(())
    }

    #[instrument(skip(self, mail), fields(mail.id = %mail.id, mail.to = %mail.to))]
    async fn send(&self, mail: &Mail) -> Result<String> {
        let msg = MessageBuilder::new()
            .from((mail.from.name.as_str(), mail.from.address.as_str()))
            .to(mail.to.as_str())
            .subject(mail.subject.as_str())
            .message_id(mail.id.as_str())
            .html_body(mail.html.as_str());
        debug!("connecting smtp client");
        let mut client = self.client_builder().connect().await?;
        debug!("sending mail");
        client.send(msg).await?;
        client.quit().await.ok();
        Ok(mail.id.clone())
    }
}

// Functions

fn error_kind(err: &mail_send::Error) -> ErrorKind {
    match err {
        mail_send::Error::Auth(_)
        | mail_send::Error::AuthenticationFailed(_)
        | mail_send::Error::MissingCredentials
        | mail_send::Error::UnsupportedAuthMechanism => ErrorKind::Auth,
        mail_send::Error::Io(err) if err.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
        mail_send::Error::Timeout => ErrorKind::Timeout,
        mail_send::Error::Io(_)
        | mail_send::Error::Tls(_)
        | mail_send::Error::InvalidTLSName
        | mail_send::Error::MissingStartTls => ErrorKind::Connection,
        _ => ErrorKind::Other,
    }
}

impl From<mail_send::Error> for Error {
    fn from(err: mail_send::Error) -> Self {
        Self::new(error_kind(&err), err)
    }
}

// Tests

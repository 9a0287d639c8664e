use std::{fmt::Display, future::Future};

use uuid::Uuid;

// Mods

pub mod gmail;

// Consts

pub const DEFAULT_SENDER_NAME: &str = "My Blog";

// Types

pub type Result<T = ()> = std::result::Result<T, Error>;

// Error

#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    pub kind: ErrorKind,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    pub fn new<E: Into<Box<dyn std::error::Error + Send + Sync>>>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: err.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Server rejected the credentials.
    Auth,
    /// Server could not be reached or the TLS handshake failed.
    Connection,
    /// Server did not answer in time.
    Timeout,
    Other,
}

// Args

#[derive(clap::Args, Clone, Debug, Eq, PartialEq)]
pub struct SenderArgs {
    #[arg(
        long = "mail-from-name",
        env = "MAIL_FROM_NAME",
        name = "MAIL_FROM_NAME",
        default_value = DEFAULT_SENDER_NAME,
        long_help = "Display name used in From header"
    )]
    pub name: String,
    #[arg(
        long = "gmail-app-password",
        env = "GMAIL_APP_PASSWORD",
        name = "GMAIL_APP_PASSWORD",
        hide_env_values = true,
        long_help = "Gmail app password"
    )]
    pub password: Option<String>,
    #[arg(
        long = "gmail-user",
        env = "GMAIL_USER",
        name = "GMAIL_USER",
        long_help = "Gmail account used to send mail"
    )]
    pub user: Option<String>,
}

impl SenderArgs {
    /// Returns `None` if the account or the app password is unset or blank.
    pub fn credentials(&self) -> Option<Credentials> {
        let user = self.user.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let password = self.password.as_deref().filter(|s| !s.trim().is_empty())?;
        Some(Credentials {
            password: password.into(),
            user: user.into(),
        })
    }

    pub fn mailbox(&self, creds: &Credentials) -> Mailbox {
        Mailbox {
            address: creds.user.clone(),
            name: self.name.clone(),
        }
    }
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            name: DEFAULT_SENDER_NAME.into(),
            password: None,
            user: None,
        }
    }
}

// Credentials

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    pub password: String,
    pub user: String,
}

// Mailbox

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mailbox {
    pub address: String,
    pub name: String,
}

impl Mailbox {
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost")
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\" <{}>", self.name, self.address)
    }
}

// Mail

/// A single message ready to be handed to a transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mail {
    pub from: Mailbox,
    pub html: String,
    /// Message-ID header value, without angle brackets.
    pub id: String,
    pub subject: String,
    pub to: String,
}

impl Mail {
    pub fn new(from: &Mailbox, to: &str, subject: &str, html: &str) -> Self {
        Self {
            id: format!("{}@{}", Uuid::new_v4(), from.domain()),
            from: from.clone(),
            html: html.into(),
            subject: subject.into(),
            to: to.into(),
        }
    }
}

// Traits

#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Opens a connection, authenticates and closes it.
    fn verify(&self) -> impl Future<Output = Result> + Send;

    /// Sends the mail and returns its message id.
    fn send(&self, mail: &Mail) -> impl Future<Output = Result<String>> + Send;
}

#[cfg_attr(test, mockall::automock(type Transport = MockTransport;))]
pub trait TransportFactory: Send + Sync {
    type Transport: Transport + 'static;

    fn create(&self, creds: &Credentials) -> Self::Transport;
}

// Tests

#[cfg(test)]
mod test {
    use super::*;

    // Mods

    mod mailbox {
        use super::*;

        // Mods

        mod domain {
            use super::*;

            // Tests

            fn test(address: &str) -> String {
                let mailbox = Mailbox {
                    address: address.into(),
                    name: "Blog".into(),
                };
                mailbox.domain().into()
            }

            #[test]
            fn address() {
                assert_eq!(test("blog@gmail.com"), "gmail.com");
            }

            #[test]
            fn no_at() {
                assert_eq!(test("blog"), "localhost");
            }

            #[test]
            fn empty_domain() {
                assert_eq!(test("blog@"), "localhost");
            }
        }

        mod to_string {
            use super::*;

            #[test]
            fn test() {
                let mailbox = Mailbox {
                    address: "blog@gmail.com".into(),
                    name: "My Blog".into(),
                };
                assert_eq!(mailbox.to_string(), "\"My Blog\" <blog@gmail.com>");
            }
        }
    }

    mod sender_args {
        use super::*;

        // Mods

        mod credentials {
            use super::*;

            // Data

            struct Data {
                password: Option<&'static str>,
                user: Option<&'static str>,
            }

            impl Default for Data {
                fn default() -> Self {
                    Self {
                        password: Some("app-password"),
                        user: Some("blog@gmail.com"),
                    }
                }
            }

            // Tests

            fn test(data: Data) -> Option<Credentials> {
                let args = SenderArgs {
                    password: data.password.map(String::from),
                    user: data.user.map(String::from),
                    ..Default::default()
                };
                args.credentials()
            }

            #[test]
            fn configured() {
                let creds = test(Data::default()).unwrap();
                let expected = Credentials {
                    password: "app-password".into(),
                    user: "blog@gmail.com".into(),
                };
                assert_eq!(creds, expected);
            }

            #[test]
            fn no_user() {
                let data = Data {
                    user: None,
                    ..Default::default()
                };
                assert!(test(data).is_none());
            }

            #[test]
            fn no_password() {
                let data = Data {
                    password: None,
                    ..Default::default()
                };
                assert!(test(data).is_none());
            }

            #[test]
            fn blank_user() {
                let data = Data {
                    user: Some("  "),
                    ..Default::default()
                };
                assert!(test(data).is_none());
            }

            #[test]
            fn empty_password() {
                let data = Data {
                    password: Some(""),
                    ..Default::default()
                };
                assert!(test(data).is_none());
            }
        }

        mod mailbox {
            use super::*;

            #[test]
            fn default_name() {
                let args = SenderArgs::default();
                let creds = Credentials {
                    password: "app-password".into(),
                    user: "blog@gmail.com".into(),
                };
                let mailbox = args.mailbox(&creds);
                assert_eq!(mailbox.to_string(), "\"My Blog\" <blog@gmail.com>");
            }
        }
    }

    mod mail {
        use super::*;

        // Mods

        mod new {
            use super::*;

            // Tests

            #[test]
            fn test() {
                let from = Mailbox {
                    address: "blog@gmail.com".into(),
                    name: "My Blog".into(),
                };
                let mail = Mail::new(&from, "a@x.com", "Hi", "<p>Hi</p>");
                assert_eq!(mail.from, from);
                assert_eq!(mail.to, "a@x.com");
                assert_eq!(mail.subject, "Hi");
                assert_eq!(mail.html, "<p>Hi</p>");
                assert!(mail.id.ends_with("@gmail.com"));
            }

            #[test]
            fn unique_ids() {
                let from = Mailbox {
                    address: "blog@gmail.com".into(),
                    name: "My Blog".into(),
                };
                let first = Mail::new(&from, "a@x.com", "Hi", "<p>Hi</p>");
                let second = Mail::new(&from, "a@x.com", "Hi", "<p>Hi</p>");
                assert_ne!(first.id, second.id);
            }
        }
    }
}

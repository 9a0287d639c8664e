use std::{
    io::stderr,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use anyhow::anyhow;
use api::{start_api, verify_smtp, ApiContext};
use axum::http::HeaderValue;
use clap::{builder::RangedU64ValueParser, Parser, Subcommand};
use clock::DefaultClock;
use mail::{
    gmail::{GmailTransportFactory, SmtpArgs},
    SenderArgs,
};
use tokio::{
    select,
    signal::unix::{signal, Signal, SignalKind},
};
use tracing::{debug, info};
use tracing_subscriber::{
    fmt::layer, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter,
};

mod api;
mod clock;
mod dispatch;
mod mail;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracer(&args.log_filter)?;
    match args.cmd {
        Command::Serve(args) => {
            let cors_origins = args
                .cors_origins
                .iter()
                .map(|origin| HeaderValue::from_str(origin))
                .collect::<Result<Vec<_>, _>>()?;
            let ctx = ApiContext {
                bulk_concurrency: args.bulk_concurrency,
                clock: DefaultClock,
                cors_origins,
                environment: args.environment,
                sender: args.sender,
                transports: GmailTransportFactory::new(args.smtp),
            };
            if ctx.sender.credentials().is_none() {
                info!("gmail credentials are not set, email endpoints will answer MISSING_CREDENTIALS");
            }
            start_api(SocketAddr::new(args.bind_ip, args.port), ctx).await
        }
        Command::Verify(args) => {
            let factory = GmailTransportFactory::new(args.smtp);
            verify_smtp(&factory, &args.sender)
                .await
                .map_err(|err| anyhow!("{}: {err}", err.code()))?;
            info!("smtp connection verified");
            Ok(())
        }
    }
}

const CARGO_PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Clone, Debug, Eq, Parser, PartialEq)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
    #[arg(
        long,
        env,
        default_value = "blog_mailer=info,tower_http=info,warn",
        global = true,
        long_help = "Log filter (https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives)"
    )]
    log_filter: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Subcommand)]
enum Command {
    #[command(about = "Start API server")]
    Serve(ServeArgs),
    #[command(about = "Check SMTP connection and credentials")]
    Verify(VerifyArgs),
}

#[derive(clap::Args, Clone, Debug, Eq, PartialEq)]
struct ServeArgs {
    #[arg(
        long,
        env,
        default_value = "0.0.0.0",
        long_help = "IP address on which listen requests"
    )]
    bind_ip: IpAddr,
    #[arg(
        long,
        env,
        default_value_t = 10,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
        long_help = "Maximum number of mails sent at the same time by a bulk request"
    )]
    bulk_concurrency: usize,
    #[arg(
        long,
        env,
        value_delimiter = ',',
        long_help = "Origins allowed to call the API (any origin if empty)"
    )]
    cors_origins: Vec<String>,
    #[arg(
        long,
        env,
        default_value = "development",
        long_help = "Runtime environment label reported by health endpoint"
    )]
    environment: String,
    #[arg(long, env, default_value_t = 3001, long_help = "Port on which listen requests")]
    port: u16,
    #[command(flatten)]
    sender: SenderArgs,
    #[command(flatten)]
    smtp: SmtpArgs,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bulk_concurrency: 10,
            cors_origins: vec![],
            environment: "development".into(),
            port: 3001,
            sender: SenderArgs::default(),
            smtp: SmtpArgs::default(),
        }
    }
}

#[derive(clap::Args, Clone, Debug, Default, Eq, PartialEq)]
struct VerifyArgs {
    #[command(flatten)]
    sender: SenderArgs,
    #[command(flatten)]
    smtp: SmtpArgs,
}

struct SignalListener {
    int: Signal,
    term: Signal,
}

impl SignalListener {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        select! {
            _ = self.int.recv() => {
                debug!("sigint received");
            }
            _ = self.term.recv() => {
                debug!("sigterm received")
            }
        }
    }
}

fn init_tracer(log_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder().parse(log_filter)?;
    let sub = layer().with_writer(stderr);
    registry().with(filter).with(sub).try_init()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{future::Future, pin::Pin};

    use super::*;

    // Functions

    pub fn async_ok<VALUE: Send + 'static, ERR>(
        val: VALUE,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<VALUE, ERR>> + Send>> {
        Box::pin(async move { Ok(val) })
    }

    pub fn async_err<VALUE, ERR: Send + 'static>(
        err: ERR,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<VALUE, ERR>> + Send>> {
        Box::pin(async move { Err(err) })
    }

    pub fn init_tracer() {
        super::init_tracer("blog_mailer=debug,warn").ok();
    }

    // Mods

    mod args {
        use super::*;

        // Tests

        #[test]
        fn serve_defaults() {
            let args = Args::try_parse_from(["blog-mailer", "serve"]).unwrap();
            match args.cmd {
                Command::Serve(args) => {
                    assert_eq!(args.bind_ip, ServeArgs::default().bind_ip);
                    assert_eq!(args.bulk_concurrency, 10);
                    assert_eq!(args.port, 3001);
                    assert_eq!(args.smtp, SmtpArgs::default());
                    assert_eq!(args.sender.name, "My Blog");
                }
                cmd => panic!("unexpected command {cmd:?}"),
            }
        }

        #[test]
        fn serve_cors_origins() {
            let args = Args::try_parse_from([
                "blog-mailer",
                "serve",
                "--cors-origins",
                "https://a.example.com,https://b.example.com",
            ])
            .unwrap();
            match args.cmd {
                Command::Serve(args) => {
                    assert_eq!(
                        args.cors_origins,
                        vec!["https://a.example.com", "https://b.example.com"]
                    );
                }
                cmd => panic!("unexpected command {cmd:?}"),
            }
        }

        #[test]
        fn serve_zero_bulk_concurrency() {
            let res =
                Args::try_parse_from(["blog-mailer", "serve", "--bulk-concurrency", "0"]);
            assert!(res.is_err());
        }

        #[test]
        fn verify_credentials() {
            let args = Args::try_parse_from([
                "blog-mailer",
                "verify",
                "--gmail-user",
                "blog@gmail.com",
                "--gmail-app-password",
                "app-password",
            ])
            .unwrap();
            match args.cmd {
                Command::Verify(args) => {
                    assert!(args.sender.credentials().is_some());
                }
                cmd => panic!("unexpected command {cmd:?}"),
            }
        }
    }
}

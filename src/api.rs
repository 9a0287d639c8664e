use std::{fmt::Display, net::SocketAddr, sync::Arc};

use aide::{
    axum::ApiRouter,
    generate::GenContext,
    openapi::{Info, OpenApi, Operation},
    OperationInput, OperationOutput,
};
use axum::{
    body::Bytes,
    extract::{FromRequest, MatchedPath, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json, Router,
};
use chrono::SecondsFormat;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_trim::option_string_trim;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, instrument, Instrument};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    clock::Clock,
    dispatch::{BulkDispatcher, BulkSendReport},
    mail::{Credentials, ErrorKind, Mail, SenderArgs, Transport, TransportFactory},
    SignalListener, CARGO_PKG_NAME,
};

pub struct ApiContext<C: Clock, F: TransportFactory> {
    pub bulk_concurrency: usize,
    pub clock: C,
    pub cors_origins: Vec<HeaderValue>,
    pub environment: String,
    pub sender: SenderArgs,
    pub transports: F,
}

pub async fn start_api<C: Clock + 'static, F: TransportFactory + 'static>(
    addr: SocketAddr,
    ctx: ApiContext<C, F>,
) -> anyhow::Result<()> {
    let mut sig = SignalListener::new()?;
    debug!("binding tcp listener");
    let tcp = TcpListener::bind(addr).await?;
    info!(%addr, "server started");
    axum::serve(tcp, create_router(ctx))
        .with_graceful_shutdown(async move { sig.recv().await })
        .await?;
    info!("server stopped");
    Ok(())
}

/// Opens then closes an SMTP session with the configured account.
pub async fn verify_smtp<F: TransportFactory>(factory: &F, sender: &SenderArgs) -> Result {
    let creds = credentials(sender)?;
    debug!(smtp.user = %creds.user, "verifying smtp connection");
    factory
        .create(&creds)
        .verify()
        .await
        .map_err(Error::Verification)
}

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to send email: {0}")]
    Delivery(#[source] crate::mail::Error),
    #[error("invalid request body: {0}")]
    InvalidBody(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("smtp credentials are not configured")]
    MissingCredentials,
    #[error("validation of request failed")]
    Validation(
        #[from]
        #[source]
        ValidationErrors,
    ),
    #[error("smtp connection failed: {0}")]
    Verification(#[source] crate::mail::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidBody(_) => ErrorCode::InvalidBody,
            Self::MissingCredentials => ErrorCode::MissingCredentials,
            Self::Delivery(err) => match err.kind {
                ErrorKind::Auth => ErrorCode::AuthFailed,
                ErrorKind::Connection => ErrorCode::ConnectionFailed,
                ErrorKind::Timeout | ErrorKind::Other => ErrorCode::SendFailed,
            },
            Self::Validation(errs) if errs.field_errors().contains_key("emails") => {
                ErrorCode::MissingEmails
            }
            Self::Validation(_) => ErrorCode::MissingFields,
            Self::Verification(err) => match err.kind {
                ErrorKind::Auth => ErrorCode::AuthFailed,
                ErrorKind::Connection => ErrorCode::ConnectionFailed,
                ErrorKind::Timeout => ErrorCode::Timeout,
                ErrorKind::Other => ErrorCode::UnknownError,
            },
        }
    }

    fn body(&self) -> ErrorResponse {
        let code = self.code();
        let (message, details) = match self {
            Self::InvalidBody(err) => ("Invalid request body", Some(err.to_string())),
            Self::MissingCredentials => ("Email service is not configured", None),
            Self::Delivery(err) => ("Failed to send email", Some(err.to_string())),
            Self::Validation(errs) => {
                let mut fields: Vec<String> = errs
                    .field_errors()
                    .keys()
                    .map(|field| field.to_string())
                    .collect();
                fields.sort();
                let msg = if code == ErrorCode::MissingEmails {
                    "Recipient list must be a non-empty array of addresses"
                } else {
                    "Missing required fields"
                };
                (msg, Some(fields.join(", ")))
            }
            Self::Verification(err) => ("SMTP connection failed", Some(err.to_string())),
        };
        ErrorResponse {
            error: ErrorDetail {
                code,
                details,
                message: self.to_string(),
                suggestion: code.suggestion().map(String::from),
            },
            message: message.into(),
            success: false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.code().status();
        if status.is_server_error() {
            error!(error.code = %self.code(), "{self}");
        } else {
            debug!(error.code = %self.code(), "{self}");
        }
        (status, Json(self.body())).into_response()
    }
}

impl OperationOutput for Error {
    type Inner = ErrorResponse;

    fn inferred_responses(
        ctx: &mut GenContext,
        operation: &mut Operation,
    ) -> Vec<(Option<u16>, aide::openapi::Response)> {
        let Some(resp) = Json::<ErrorResponse>::operation_response(ctx, operation) else {
            return vec![];
        };
        vec![
            (
                Some(400),
                aide::openapi::Response {
                    description: "Invalid request or email service not configured".into(),
                    ..resp.clone()
                },
            ),
            (
                Some(500),
                aide::openapi::Response {
                    description: "SMTP server error".into(),
                    ..resp
                },
            ),
        ]
    }

    fn operation_response(
        ctx: &mut GenContext,
        operation: &mut Operation,
    ) -> Option<aide::openapi::Response> {
        Json::<ErrorResponse>::operation_response(ctx, operation)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    ConnectionFailed,
    InvalidBody,
    MissingCredentials,
    MissingEmails,
    MissingFields,
    SendFailed,
    Timeout,
    UnknownError,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::InvalidBody => "INVALID_BODY",
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::MissingEmails => "MISSING_EMAILS",
            Self::MissingFields => "MISSING_FIELDS",
            Self::SendFailed => "SEND_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::InvalidBody
            | Self::MissingCredentials
            | Self::MissingEmails
            | Self::MissingFields => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn suggestion(self) -> Option<&'static str> {
        match self {
            Self::AuthFailed => Some(
                "Make sure 2-step verification is enabled on the Gmail account and that GMAIL_APP_PASSWORD is a valid app password",
            ),
            Self::ConnectionFailed => {
                Some("Check network access to the SMTP server and the SMTP_HOST/SMTP_PORT settings")
            }
            Self::MissingCredentials => Some("Set GMAIL_USER and GMAIL_APP_PASSWORD"),
            Self::Timeout => {
                Some("The SMTP server did not answer in time, retry later or raise SMTP_TIMEOUT")
            }
            _ => None,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body checked with `validator` before the handler runs.
///
/// The content type is not enforced and an empty body reads as `{}`, so a request without a body
/// is reported by validation like any other request with missing fields.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send + Validate + 'static,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|err| Error::InvalidBody(err.into()))?;
        let payload: T = if body.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_slice(b"{}")
        } else {
            serde_json::from_slice(&body)
        }
        .map_err(|err| Error::InvalidBody(err.into()))?;
        payload.validate()?;
        Ok(Self(payload))
    }
}

impl<T: JsonSchema> OperationInput for Payload<T> {
    fn operation_input(ctx: &mut GenContext, operation: &mut Operation) {
        Json::<T>::operation_input(ctx, operation);
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
struct BulkSendRequest {
    /// Recipients, one mail is sent to each of them.
    #[serde(default, deserialize_with = "emails_trim")]
    #[validate(required, length(min = 1), custom(function = "validate_emails"))]
    emails: Option<Vec<String>>,
    /// HTML body.
    #[serde(default)]
    #[validate(required, length(min = 1))]
    html: Option<String>,
    /// Subject.
    #[serde(default, deserialize_with = "option_string_trim")]
    #[validate(required)]
    subject: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    /// HTML body.
    #[serde(default)]
    #[validate(required, length(min = 1))]
    html: Option<String>,
    /// Subject.
    #[serde(default, deserialize_with = "option_string_trim")]
    #[validate(required)]
    subject: Option<String>,
    /// Recipient.
    #[serde(default, deserialize_with = "option_string_trim")]
    #[validate(required)]
    to: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkSendResponse {
    message: String,
    results: BulkSendReport,
    success: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Error kind.
    code: ErrorCode,
    /// Raw error, for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    message: String,
    /// How to fix the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    error: ErrorDetail,
    message: String,
    success: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    /// Runtime environment label.
    environment: String,
    message: String,
    success: bool,
    /// Current time (RFC 3339).
    timestamp: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    message: String,
    success: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message: String,
    /// Message-ID of the sent mail.
    message_id: String,
    success: bool,
}

fn create_router<C: Clock + 'static, F: TransportFactory + 'static>(
    ctx: ApiContext<C, F>,
) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or_default();
        let span = info_span!(
            "http_request",
            http.method = %req.method(),
            http.path = path,
        );
        debug!(parent: &span, "http request received");
        span
    });
    let cors_layer = cors_layer(&ctx.cors_origins);
    let mut api = OpenApi {
        info: Info {
            title: CARGO_PKG_NAME.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            ..Default::default()
        },
        ..Default::default()
    };
    ApiRouter::new()
        .api_route("/api/health", aide::axum::routing::get(health))
        .api_route("/api/email/send", aide::axum::routing::post(send))
        .api_route("/api/email/send-bulk", aide::axum::routing::post(send_bulk))
        .api_route("/api/email/test-smtp", aide::axum::routing::post(test_smtp))
        .route("/api/doc", axum::routing::get(doc))
        .finish_api(&mut api)
        .with_state(Arc::new(ctx))
        .layer(cors_layer)
        .layer(trace_layer)
        .layer(Extension(api))
}

fn cors_layer(origins: &[HeaderValue]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins.iter().cloned()))
    }
}

#[instrument(skip(api))]
async fn doc(Extension(api): Extension<OpenApi>) -> Json<OpenApi> {
    Json(api)
}

#[instrument(skip(ctx))]
async fn health<C: Clock, F: TransportFactory>(
    State(ctx): State<Arc<ApiContext<C, F>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        environment: ctx.environment.clone(),
        message: "Email service is running".into(),
        success: true,
        timestamp: ctx.clock.utc().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

async fn send<C: Clock, F: TransportFactory>(
    State(ctx): State<Arc<ApiContext<C, F>>>,
    Payload(req): Payload<SendRequest>,
) -> Result<Json<SendResponse>> {
    let creds = credentials(&ctx.sender)?;
    let from = ctx.sender.mailbox(&creds);
    let mail = Mail::new(
        &from,
        req.to.as_deref().unwrap_or_default(),
        req.subject.as_deref().unwrap_or_default(),
        req.html.as_deref().unwrap_or_default(),
    );
    let span = info_span!("send", mail.id = %mail.id, mail.to = %mail.to);
    async {
        debug!("sending email");
        let transport = ctx.transports.create(&creds);
        let message_id = transport.send(&mail).await.map_err(Error::Delivery)?;
        info!("email sent");
        Ok(Json(SendResponse {
            message: "Email sent successfully".into(),
            message_id,
            success: true,
        }))
    }
    .instrument(span)
    .await
}

async fn send_bulk<C: Clock, F: TransportFactory>(
    State(ctx): State<Arc<ApiContext<C, F>>>,
    Payload(req): Payload<BulkSendRequest>,
) -> Result<Json<BulkSendResponse>> {
    let creds = credentials(&ctx.sender)?;
    let from = ctx.sender.mailbox(&creds);
    let emails = req.emails.unwrap_or_default();
    let span = info_span!("send_bulk", bulk.total = emails.len());
    async {
        let transport = ctx.transports.create(&creds);
        let dispatcher = BulkDispatcher::new(&transport, &from, ctx.bulk_concurrency);
        let results = dispatcher
            .dispatch(
                emails,
                req.subject.as_deref().unwrap_or_default(),
                req.html.as_deref().unwrap_or_default(),
            )
            .await;
        Ok(Json(BulkSendResponse {
            message: format!(
                "Bulk email processed: {} sent, {} failed",
                results.successful, results.failed
            ),
            results,
            success: true,
        }))
    }
    .instrument(span)
    .await
}

async fn test_smtp<C: Clock, F: TransportFactory>(
    State(ctx): State<Arc<ApiContext<C, F>>>,
) -> Result<Json<MessageResponse>> {
    verify_smtp(&ctx.transports, &ctx.sender).await?;
    info!("smtp connection verified");
    Ok(Json(MessageResponse {
        message: "SMTP connection verified successfully".into(),
        success: true,
    }))
}

fn credentials(sender: &SenderArgs) -> Result<Credentials> {
    sender.credentials().ok_or_else(|| {
        debug!("gmail user or app password is not set");
        Error::MissingCredentials
    })
}

/// Reads a list of trimmed addresses. Anything but an array counts as no list at all.
fn emails_trim<'de, D: Deserializer<'de>>(
    de: D,
) -> std::result::Result<Option<Vec<String>>, D::Error> {
    match Value::deserialize(de)? {
        Value::Array(emails) => emails
            .into_iter()
            .map(|email| match email {
                Value::String(email) => Ok(email.trim().to_string()),
                email => Err(serde::de::Error::custom(format!(
                    "recipient must be a string, got {email}"
                ))),
            })
            .collect::<std::result::Result<Vec<_>, D::Error>>()
            .map(Some),
        _ => Ok(None),
    }
}

fn validate_emails(emails: &[String]) -> std::result::Result<(), ValidationError> {
    if emails.iter().any(String::is_empty) {
        Err(ValidationError::new("blank_email"))
    } else {
        Ok(())
    }
}

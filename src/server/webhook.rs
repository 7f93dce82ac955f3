//! Webhook endpoint.
//!
//! Verifies the delivery's signature, parses it, and hands recognised events to
//! the dispatcher. Handing off only enqueues, so the response does not wait for
//! an access request to be created.
//!
//! | outcome                                   | status |
//! |-------------------------------------------|--------|
//! | deployment review enqueued / event ignored | 202    |
//! | missing header, malformed payload          | 400    |
//! | bad signature                              | 401    |
//! | `workflow_dispatch`                        | 501    |
//! | dispatcher shutting down                   | 503    |

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::dispatch::{DispatchError, EventSink};
use crate::webhooks::{ParseError, WebhookEvent, parse_webhook};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ParseError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) | WebhookError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Dispatch(DispatchError::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
            WebhookError::Dispatch(DispatchError::ShuttingDown | DispatchError::ChannelClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            WebhookError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub async fn webhook_handler<S: EventSink>(
    State(app_state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let signature_header = get_header(&headers, HEADER_SIGNATURE)?;
    let delivery_id = get_header(&headers, HEADER_DELIVERY).unwrap_or_default();

    debug!(%delivery_id, %event_type, "received webhook");

    // Nothing is parsed before the signature checks out.
    if !app_state.secret().verify(&body, &signature_header) {
        warn!(%delivery_id, "invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    match parse_webhook(&event_type, &body)? {
        WebhookEvent::DeploymentReview(event) => {
            info!(
                %delivery_id,
                repo = %event.repo,
                run_id = %event.workflow_run_id,
                environment = %event.environment,
                "deployment review requested"
            );
            app_state
                .sink()
                .handle_deployment_review_event_received(event)
                .await?;
            Ok((StatusCode::ACCEPTED, "Accepted"))
        }
        WebhookEvent::WorkflowDispatch(event) => {
            app_state
                .sink()
                .handle_workflow_dispatch_event_received(event)
                .await?;
            Ok((StatusCode::ACCEPTED, "Accepted"))
        }
        WebhookEvent::Ignored { event_type, action } => {
            debug!(%delivery_id, %event_type, ?action, "ignoring webhook");
            Ok((StatusCode::ACCEPTED, "Ignored"))
        }
    }
}

fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}

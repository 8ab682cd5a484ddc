//! Outbound messaging gateway: one send per work item, with failures sorted
//! into transient (retried) and permanent (counted at once) kinds. A failure
//! of the gateway's own backing state is neither; the dispatcher treats it as
//! an infrastructure outage.

pub mod http;
pub mod loopback;

use serde::Serialize;
use uuid::Uuid;

use crate::campaigns::{Variables, WorkItem};
use crate::BoxFuture;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use loopback::LoopbackGateway;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRequest {
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub channel_address: String,
    pub template_id: Uuid,
    pub variables: Variables,
}

impl SendRequest {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            campaign_id: item.campaign_id,
            tenant_id: item.tenant_id,
            recipient_id: item.recipient_id,
            channel_address: item.channel_address.clone(),
            template_id: item.template_id,
            variables: item.variables.clone(),
        }
    }

    /// Stable per (campaign, recipient, template); repeated sends carry the same key.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.campaign_id, self.recipient_id, self.template_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    /// Not attributable to the recipient; never counted.
    Infrastructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayErrorKind {
    RateLimited,
    InvalidRecipient,
    InvalidTemplate,
    MalformedVariables,
    ServerError,
    Timeout,
    Network,
    Rejected,
    MalformedResponse,
    /// A store the gateway depends on (templates) could not be reached.
    DependencyUnavailable,
}

impl GatewayErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited | Self::ServerError | Self::Timeout | Self::Network => {
                ErrorClass::Transient
            }
            Self::InvalidRecipient
            | Self::InvalidTemplate
            | Self::MalformedVariables
            | Self::Rejected
            | Self::MalformedResponse => ErrorClass::Permanent,
            Self::DependencyUnavailable => ErrorClass::Infrastructure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidRecipient => "INVALID_RECIPIENT",
            Self::InvalidTemplate => "INVALID_TEMPLATE",
            Self::MalformedVariables => "MALFORMED_VARIABLES",
            Self::ServerError => "SERVER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::Rejected => "REJECTED",
            Self::MalformedResponse => "MALFORMED_RESPONSE",
            Self::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "RATE_LIMITED" => Some(Self::RateLimited),
            "INVALID_RECIPIENT" => Some(Self::InvalidRecipient),
            "INVALID_TEMPLATE" => Some(Self::InvalidTemplate),
            "MALFORMED_VARIABLES" => Some(Self::MalformedVariables),
            "SERVER_ERROR" => Some(Self::ServerError),
            "TIMEOUT" => Some(Self::Timeout),
            "NETWORK" => Some(Self::Network),
            "REJECTED" => Some(Self::Rejected),
            "MALFORMED_RESPONSE" => Some(Self::MalformedResponse),
            "DEPENDENCY_UNAVAILABLE" => Some(Self::DependencyUnavailable),
            _ => None,
        }
    }
}

/// Operator hint for a recorded error code.
pub fn suggested_action(code: &str) -> &'static str {
    match GatewayErrorKind::parse(code) {
        Some(GatewayErrorKind::RateLimited) => {
            "Provider throttled the sender. Lower the tenant messages-per-second or spread campaigns."
        }
        Some(GatewayErrorKind::InvalidRecipient) => {
            "Non-retryable. The number is not reachable on the channel; clean the contact list."
        }
        Some(GatewayErrorKind::InvalidTemplate) => {
            "Non-retryable. Template missing, paused or not approved; fix it with the provider and requeue failed."
        }
        Some(GatewayErrorKind::MalformedVariables) => {
            "Non-retryable. Variable count or format does not match the template; check the variable mapping."
        }
        Some(GatewayErrorKind::ServerError) => {
            "Retried automatically. Check provider status if it persists."
        }
        Some(GatewayErrorKind::Timeout) => {
            "Retried automatically. Check provider latency or raise the send timeout."
        }
        Some(GatewayErrorKind::Network) => {
            "Retried automatically. Check outbound connectivity and DNS from the workers."
        }
        Some(GatewayErrorKind::Rejected) => {
            "Non-retryable. Inspect the error message for the provider's reason."
        }
        Some(GatewayErrorKind::MalformedResponse) => {
            "Provider accepted the call without a message id. The message may or may not have been sent."
        }
        Some(GatewayErrorKind::DependencyUnavailable) => {
            "Never recorded against a recipient. Workers pause until the template store is reachable again."
        }
        None => "Inspect error_message and worker logs.",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub trait Gateway: Send + Sync {
    fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<SendReceipt, GatewayError>>;
}

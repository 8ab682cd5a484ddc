use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Gateway, GatewayError, GatewayErrorKind, SendReceipt, SendRequest};
use crate::audience::{HeaderFormat, MessageTemplate, TemplateStore};
use crate::{boxed, BoxFuture};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub access_token: String,
    pub sender_id: String,
    pub timeout: Duration,
}

/// Template messages over the provider's HTTP API.
pub struct HttpGateway {
    http: reqwest::Client,
    cfg: HttpGatewayConfig,
    templates: Arc<dyn TemplateStore>,
    cache: Mutex<HashMap<(Uuid, Uuid), (Instant, MessageTemplate)>>,
    cache_ttl: Duration,
}

impl HttpGateway {
    pub fn new(
        cfg: HttpGatewayConfig,
        templates: Arc<dyn TemplateStore>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            http,
            cfg,
            templates,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(60),
        })
    }

    /// How long a looked-up template is reused before it is read again.
    /// Zero disables the cache.
    pub fn with_template_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}/messages",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.sender_id
        )
    }

    /// The template a request is rendered with.
    ///
    /// A store failure maps to [`GatewayErrorKind::DependencyUnavailable`] so
    /// the dispatcher never counts it against the recipient.
    pub async fn template_for(&self, request: &SendRequest) -> Result<MessageTemplate, GatewayError> {
        let key = (request.tenant_id, request.template_id);
        let now = Instant::now();
        if let Some((fetched, t)) = self.cache_lock().get(&key) {
            if now.saturating_duration_since(*fetched) < self.cache_ttl {
                return Ok(t.clone());
            }
        }

        let template = self
            .templates
            .get_template(request.tenant_id, request.template_id)
            .await
            .map_err(|e| {
                GatewayError::new(
                    GatewayErrorKind::DependencyUnavailable,
                    format!("template lookup: {e}"),
                )
            })?;

        let Some(template) = template else {
            self.cache_lock().remove(&key);
            return Err(GatewayError::new(
                GatewayErrorKind::InvalidTemplate,
                format!("template {} not found", request.template_id),
            ));
        };
        if !self.cache_ttl.is_zero() {
            self.cache_lock().insert(key, (now, template.clone()));
        }
        Ok(template)
    }

    fn cache_lock(&self) -> MutexGuard<'_, HashMap<(Uuid, Uuid), (Instant, MessageTemplate)>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn post(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
        let template = self.template_for(request).await?;
        if !template.approved {
            return Err(GatewayError::new(
                GatewayErrorKind::InvalidTemplate,
                format!("template {} is not approved", template.id),
            ));
        }
        let payload = build_payload(&template, request);

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.cfg.access_token)
            .header("Idempotency-Key", request.idempotency_key())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(transport_error)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        classify_response(status, &body)
    }
}

impl Gateway for HttpGateway {
    fn send<'a>(&'a self, request: &'a SendRequest) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
        boxed(self.post(request))
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    let kind = if e.is_timeout() {
        GatewayErrorKind::Timeout
    } else {
        GatewayErrorKind::Network
    };
    GatewayError::new(kind, e.to_string())
}

/// Template message body for one recipient.
pub fn build_payload(template: &MessageTemplate, request: &SendRequest) -> Value {
    let text_param = |slot: &u32| {
        let value = request
            .variables
            .get(&slot.to_string())
            .cloned()
            .unwrap_or_default();
        json!({ "type": "text", "text": value })
    };

    let mut components = Vec::new();

    if let Some(header) = &template.header {
        match header.format {
            HeaderFormat::Text => {
                let params: Vec<Value> = template.header_slots().iter().map(text_param).collect();
                if !params.is_empty() {
                    components.push(json!({ "type": "header", "parameters": params }));
                }
            }
            media => {
                if let Some(link) = &header.media_url {
                    let kind = media.as_str();
                    components.push(json!({
                        "type": "header",
                        "parameters": [{ "type": kind, kind: { "link": link } }]
                    }));
                }
            }
        }
    }

    let body: Vec<Value> = template.body_slots().iter().map(text_param).collect();
    if !body.is_empty() {
        components.push(json!({ "type": "body", "parameters": body }));
    }

    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": request.channel_address,
        "type": "template",
        "template": {
            "name": template.name,
            "language": { "code": template.language },
            "components": components,
        }
    })
}

/// Maps a provider response to a receipt or a classified error.
pub fn classify_response(status: u16, body: &Value) -> Result<SendReceipt, GatewayError> {
    let error = body.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"));

    if (200..300).contains(&status) {
        return body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .map(|id| SendReceipt {
                provider_message_id: id.to_string(),
            })
            .ok_or_else(|| {
                GatewayError::new(
                    GatewayErrorKind::MalformedResponse,
                    "accepted without a message id",
                )
            });
    }

    let kind = if status == 429 {
        GatewayErrorKind::RateLimited
    } else if status >= 500 {
        GatewayErrorKind::ServerError
    } else {
        error
            .and_then(|e| e.get("code"))
            .and_then(Value::as_i64)
            .map(provider_code_kind)
            .unwrap_or(GatewayErrorKind::Rejected)
    };

    Err(GatewayError::new(kind, message))
}

fn provider_code_kind(code: i64) -> GatewayErrorKind {
    match code {
        131026 | 131030 | 131021 | 131009 => GatewayErrorKind::InvalidRecipient,
        132001 | 132015 | 132016 | 132007 => GatewayErrorKind::InvalidTemplate,
        132000 | 132012 | 131008 => GatewayErrorKind::MalformedVariables,
        4 | 80007 | 130429 | 131048 | 131056 => GatewayErrorKind::RateLimited,
        131000 | 1 | 2 | 131016 => GatewayErrorKind::ServerError,
        _ => GatewayErrorKind::Rejected,
    }
}

//! Rule actions.
//!
//! An action fires when its rule transitions to `Firing` (or back to
//! `Armed`, for cleared actions). Webhook actions carry their own cooldown,
//! timeout, and delivery statistics, independent of the rule's firing
//! counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::value::Value;

/// HTTP method for webhook actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Webhook authentication descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// No authentication.
    #[default]
    None,
    /// HTTP basic authentication.
    Basic { username: String, password: String },
    /// Bearer token.
    Bearer { token: String },
    /// Arbitrary header.
    Header { name: String, value: String },
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Outbound webhook call definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAction {
    /// Target URL.
    pub url: String,

    /// HTTP method.
    #[serde(default)]
    pub method: HttpMethod,

    /// Content-Type header value.
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Body template. Placeholders `{rule}`, `{device}`, `{tag}`, `{value}`
    /// and `{timestamp}` are substituted at dispatch time. Empty for no body.
    #[serde(default)]
    pub body: String,

    /// Authentication descriptor.
    #[serde(default)]
    pub auth: WebhookAuth,

    /// Per-call timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Minimum interval between sends for this action. An errored send also
    /// starts the interval, so a failing endpoint is not hammered.
    #[serde(default)]
    pub cooldown_ms: u64,
}

/// One side effect dispatched on rule fire/clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Force an out-of-band publish of a tag's current value.
    PublishOverride { device: String, tag: String },

    /// Outbound webhook call.
    Webhook(WebhookAction),

    /// Write a value back to a controller tag.
    WriteBack {
        device: String,
        tag: String,
        value: Value,
    },
}

impl Action {
    /// Validate configuration-level constraints.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Webhook(w) => {
                if w.url.is_empty() {
                    return Err(GatewayError::Config("webhook url is empty".to_string()));
                }
                if !w.url.starts_with("http://") && !w.url.starts_with("https://") {
                    return Err(GatewayError::invalid("webhook url", &w.url));
                }
                if w.timeout_ms == 0 {
                    return Err(GatewayError::invalid("webhook timeout_ms", "must be > 0"));
                }
                Ok(())
            }
            Self::PublishOverride { device, tag } | Self::WriteBack { device, tag, .. } => {
                if device.is_empty() || tag.is_empty() {
                    return Err(GatewayError::Config(
                        "action device/tag must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Delivery statistics for one webhook action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushStatus {
    /// HTTP status of the last completed call.
    pub last_http_status: Option<u16>,

    /// Number of dispatch attempts.
    pub send_count: u64,

    /// Last dispatch error.
    pub last_error: Option<String>,

    /// Time of the last dispatch attempt.
    pub last_send: Option<DateTime<Utc>>,
}

/// Substitution context for webhook body templates.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub rule: String,
    pub device: String,
    pub tag: String,
    pub value: String,
    pub timestamp: String,
}

impl TemplateContext {
    /// Render a body template with this context.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{rule}", &self.rule)
            .replace("{device}", &self.device)
            .replace("{tag}", &self.tag)
            .replace("{value}", &self.value)
            .replace("{timestamp}", &self.timestamp)
    }
}

/// Perform a webhook call and return the HTTP status code.
pub async fn send_webhook(
    client: &reqwest::Client,
    action: &WebhookAction,
    body: String,
) -> Result<u16> {
    let mut request = client
        .request(action.method.into(), &action.url)
        .header(reqwest::header::CONTENT_TYPE, &action.content_type)
        .timeout(std::time::Duration::from_millis(action.timeout_ms));

    match &action.auth {
        WebhookAuth::None => {}
        WebhookAuth::Basic { username, password } => {
            request = request.basic_auth(username, Some(password));
        }
        WebhookAuth::Bearer { token } => {
            request = request.bearer_auth(token);
        }
        WebhookAuth::Header { name, value } => {
            request = request.header(name.as_str(), value.as_str());
        }
    }

    if !body.is_empty() {
        request = request.body(body);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(format!("webhook {}: {}", action.url, e))
        } else {
            GatewayError::Publish(format!("webhook {}: {}", action.url, e))
        }
    })?;

    Ok(response.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_render() {
        let ctx = TemplateContext {
            rule: "overheat".to_string(),
            device: "plc1".to_string(),
            tag: "Temp".to_string(),
            value: "98.5".to_string(),
            timestamp: "2025-06-01T12:00:00Z".to_string(),
        };
        let body = ctx.render(r#"{"rule":"{rule}","tag":"{device}/{tag}","v":{value}}"#);
        assert_eq!(body, r#"{"rule":"overheat","tag":"plc1/Temp","v":98.5}"#);
    }

    #[test]
    fn test_webhook_validation() {
        let mut w = WebhookAction {
            url: "https://hooks.example/alert".to_string(),
            method: HttpMethod::Post,
            content_type: default_content_type(),
            body: String::new(),
            auth: WebhookAuth::None,
            timeout_ms: 5_000,
            cooldown_ms: 0,
        };
        assert!(Action::Webhook(w.clone()).validate().is_ok());

        w.url = "ftp://nope".to_string();
        assert!(Action::Webhook(w.clone()).validate().is_err());

        w.url = "https://hooks.example/alert".to_string();
        w.timeout_ms = 0;
        assert!(Action::Webhook(w).validate().is_err());
    }

    #[test]
    fn test_action_serde_round_trip() {
        let toml_src = r#"
type = "webhook"
url = "https://hooks.example/alert"
method = "put"
body = "{\"tag\":\"{tag}\"}"

[auth]
scheme = "bearer"
token = "t0ken"
"#;
        let action: Action = toml::from_str(toml_src).unwrap();
        match &action {
            Action::Webhook(w) => {
                assert_eq!(w.method, HttpMethod::Put);
                assert_eq!(w.auth, WebhookAuth::Bearer { token: "t0ken".to_string() });
                assert_eq!(w.timeout_ms, 5_000);
            }
            _ => panic!("expected webhook"),
        }
    }

    #[test]
    fn test_write_back_validation() {
        let a = Action::WriteBack {
            device: String::new(),
            tag: "Reset".to_string(),
            value: Value::Bool(true),
        };
        assert!(a.validate().is_err());
    }
}

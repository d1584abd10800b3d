// Billing module - balance admission checks against the billing service

use serde::Deserialize;
use std::time::Duration;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(String),
}

#[derive(Debug, Deserialize)]
struct BalanceCheck {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    balance: f64,
    #[serde(default)]
    quota: f64,
    #[serde(default)]
    used: f64,
    #[serde(default)]
    message: String,
}

pub struct BillingClient {
    endpoint: String,
    http_client: reqwest::Client,
}

impl BillingClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint,
            http_client,
        })
    }

    /// Ask the billing service whether `user_id` may spend. Only an explicit
    /// refusal denies; any failure to get an answer admits the request.
    pub async fn check_balance(&self, user_id: &str) -> Admission {
        let url = format!(
            "{}/api/v1/billing/check/{}",
            self.endpoint,
            urlencoding::encode(user_id)
        );

        let response = match self.http_client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[Billing] Check failed for {}, allowing request: {}", user_id, e);
                return Admission::Allowed;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let message = response
                .json::<BalanceCheck>()
                .await
                .ok()
                .map(|c| c.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "insufficient balance".to_string());
            return Admission::Denied(message);
        }
        if !status.is_success() {
            tracing::warn!(
                "[Billing] Service returned {} for {}, allowing request",
                status,
                user_id
            );
            return Admission::Allowed;
        }

        match response.json::<BalanceCheck>().await {
            Ok(check) if check.allowed => {
                tracing::debug!(
                    "[Billing] {} allowed (balance={}, quota={}, used={})",
                    user_id,
                    check.balance,
                    check.quota,
                    check.used
                );
                Admission::Allowed
            }
            Ok(check) => {
                let message = if check.message.is_empty() {
                    format!("balance {} is insufficient", check.balance)
                } else {
                    check.message
                };
                Admission::Denied(message)
            }
            Err(e) => {
                tracing::warn!("[Billing] Unreadable response for {}, allowing request: {}", user_id, e);
                Admission::Allowed
            }
        }
    }
}

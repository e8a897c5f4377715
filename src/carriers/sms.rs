//! Twilio-shaped REST SMS carrier, following the same `reqwest`
//! POST-and-parse conventions as [`crate::model::openai_client`]. No pack
//! example wires up SMS specifically; this generalizes the HTTP client
//! pattern already used for the model provider to a second REST-style
//! carrier, rather than introducing a dedicated Twilio SDK dependency the
//! rest of the workspace has no other use for.

use crate::carriers::{Carrier, CarrierError, CarrierReceipt, OutboundEnvelope};
use async_trait::async_trait;
use overlord_store::models::Channel;
use serde::Deserialize;
use std::time::Duration;

pub struct RestSmsCarrier {
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
    http: reqwest::Client,
}

impl RestSmsCarrier {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>, from_number: impl Into<String>, timeout: Duration) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
            http: reqwest::Client::builder().timeout(timeout).build().expect("http client"),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct MessageResponse {
    sid: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
    code: i64,
}

#[async_trait]
impl Carrier for RestSmsCarrier {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, envelope: OutboundEnvelope) -> Result<CarrierReceipt, CarrierError> {
        let url = format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid);
        let params = [("To", envelope.to.as_str()), ("From", self.from_number.as_str()), ("Body", envelope.body.as_str())];

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CarrierError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let parsed: MessageResponse = response.json().await.map_err(|e| CarrierError::Transient(e.to_string()))?;
            return Ok(CarrierReceipt { external_id: parsed.sid });
        }

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CarrierError::Transient(format!("sms carrier returned {status}")));
        }

        let detail = response.json::<ErrorResponse>().await.ok();
        match detail {
            // Twilio error codes 21211/21614 mean invalid/unreachable number;
            // 21610 means the recipient has opted out. Both are terminal.
            Some(err) if matches!(err.code, 21211 | 21614 | 21610) => Err(CarrierError::Permanent(err.message)),
            Some(err) => Err(CarrierError::Permanent(err.message)),
            None => Err(CarrierError::Permanent(format!("sms carrier returned {status}"))),
        }
    }
}

//! SMTP email carrier, grounded in the `email` feature of the
//! `Toasterson-akh-medu` example — the pack's only existing SMTP-sending
//! code — adapted from raw-message-send to the multipart HTML+text bodies
//! handover dossiers require, and reused here for ordinary outbound
//! touches. Feature-gated behind `email-carrier` so a deployment without
//! SMTP credentials still builds.

#![cfg(feature = "email-carrier")]

use crate::carriers::{Carrier, CarrierError, CarrierReceipt, OutboundEnvelope};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use overlord_store::models::Channel;

pub struct SmtpEmailCarrier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailCarrier {
    pub fn new(smtp_host: &str, username: &str, password: &str, from_email: &str) -> Result<Self, CarrierError> {
        let creds = Credentials::new(username.to_string(), password.to_string());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
            .map_err(|e| CarrierError::Permanent(format!("invalid smtp relay config: {e}")))?
            .credentials(creds)
            .build();
        let from = from_email.parse().map_err(|e| CarrierError::Permanent(format!("invalid from address: {e}")))?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Carrier for SmtpEmailCarrier {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, envelope: OutboundEnvelope) -> Result<CarrierReceipt, CarrierError> {
        let to: Mailbox = envelope.to.parse().map_err(|e| CarrierError::Permanent(format!("invalid recipient address: {e}")))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(envelope.subject.clone().unwrap_or_default())
            .multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(envelope.body.clone()))
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(plain_to_html(&envelope.body))),
            )
            .map_err(|e| CarrierError::Permanent(format!("failed to build message: {e}")))?;

        match self.transport.send(message).await {
            Ok(response) => {
                let external_id = response.message().next().unwrap_or_default().trim().to_string();
                Ok(CarrierReceipt { external_id: if external_id.is_empty() { uuid::Uuid::new_v4().to_string() } else { external_id } })
            }
            // lettre's transport error doesn't expose a permanent/transient
            // split we can trust at this layer; treat every send failure as
            // retryable and let bounce webhooks (handled by the Reply
            // Ingester) mark a communication permanently failed instead.
            Err(err) => Err(CarrierError::Transient(err.to_string())),
        }
    }
}

fn plain_to_html(body: &str) -> String {
    let escaped = body.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;");
    format!("<p>{}</p>", escaped.replace('\n', "</p><p>"))
}

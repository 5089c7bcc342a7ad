//! Builds a `lettre::Message` from a `MessagePayload` and its resolved
//! attachments: RFC 2047 header encoding via `lettre`'s own builder, an
//! `X-Mail-ID` header carrying the message's surrogate key for bounce
//! correlation, and multipart/mixed-over-multipart/alternative when both
//! a plain and an HTML/alt body are present.

use crate::error::{RelayError, RelayResult};
use crate::types::{ContentType, Message, ResolvedAttachment};
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::{Message as LettreMessage, Address};

pub fn compose(message: &Message, attachments: &[ResolvedAttachment]) -> RelayResult<LettreMessage> {
    let payload = &message.payload;

    let mut builder = LettreMessage::builder()
        .from(parse_mailbox(&payload.from)?)
        .subject(payload.subject.clone())
        .message_id(Some(message_id(&message.id)))
        .header(lettre::message::header::ContentTransferEncoding::Base64)
        .header(XMailId(message.pk.to_string()));

    for to in &payload.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in &payload.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }
    for bcc in &payload.bcc {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }
    if let Some(reply_to) = &payload.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }
    if let Some(return_path) = &payload.return_path {
        builder = builder.header(lettre::message::header::ReturnPath(Some(parse_address(return_path)?)));
    }

    let body_part = match payload.content_type {
        ContentType::Html => SinglePart::html(payload.body.clone()),
        ContentType::Plain => SinglePart::plain(payload.body.clone()),
    };

    let content = if let Some(alt) = &payload.body_alt {
        let (plain, html) = match payload.content_type {
            ContentType::Html => (alt.clone(), payload.body.clone()),
            ContentType::Plain => (payload.body.clone(), alt.clone()),
        };
        MultiPart::alternative()
            .singlepart(SinglePart::plain(plain))
            .singlepart(SinglePart::html(html))
    } else {
        MultiPart::mixed().singlepart(body_part)
    };

    let content = attachments.iter().fold(content, |acc, attachment| {
        acc.singlepart(
            Attachment::new(attachment.filename.clone())
                .body(attachment.bytes.clone(), attachment.mime_type.clone()),
        )
    });

    let mut composed = builder
        .multipart(content)
        .map_err(|e| RelayError::internal(format!("compose message {}: {e}", message.id)))?;

    // Arbitrary caller-supplied headers can't go through the typed `Header`
    // trait (its name is fixed per-type), so they're inserted as raw pairs
    // directly on the built message.
    for (key, value) in &payload.headers {
        composed.headers_mut().insert_raw(lettre::message::header::Raw::new(
            lettre::message::header::HeaderName::new_from_ascii_str(key),
            value.clone(),
        ));
    }

    Ok(composed)
}

/// Builds an RFC 5322 `Message-ID` from the queue id and the relay host's
/// hostname, falling back to `localhost` when it can't be read (containers
/// without `/etc/hostname` set, sandboxed test runs).
fn message_id(queue_id: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{queue_id}@{host}")
}

fn parse_mailbox(raw: &str) -> RelayResult<lettre::message::Mailbox> {
    raw.trim()
        .parse()
        .map_err(|e| RelayError::validation("address", format!("{raw}: {e}")))
}

fn parse_address(raw: &str) -> RelayResult<Address> {
    raw.trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| RelayError::validation("address", format!("{raw}: {e}")))
}

struct XMailId(String);

impl lettre::message::header::Header for XMailId {
    fn name() -> lettre::message::header::HeaderName {
        lettre::message::header::HeaderName::new_from_ascii_str("X-Mail-ID")
    }

    fn parse(s: &str) -> Result<Self, lettre::message::header::Error> {
        Ok(XMailId(s.to_string()))
    }

    fn display(&self) -> lettre::message::header::HeaderValue {
        lettre::message::header::HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessagePayload, Priority};
    use uuid::Uuid;

    fn base_message() -> Message {
        Message {
            id: "M1".to_string(),
            pk: Uuid::new_v4(),
            tenant_id: None,
            account_id: "A".to_string(),
            priority: Priority::Medium,
            batch_code: None,
            deferred_ts: chrono::Utc::now(),
            retry_count: 0,
            last_error: None,
            payload: MessagePayload {
                from: "sender@example.com".to_string(),
                to: vec!["recipient@example.com".to_string()],
                subject: "hello".to_string(),
                body: "plain body".to_string(),
                ..Default::default()
            },
            created_ts: chrono::Utc::now(),
            sent_ts: None,
            error_ts: None,
            bounce_ts: None,
            reported_ts: None,
        }
    }

    #[test]
    fn composes_simple_plain_message() {
        let message = base_message();
        let composed = compose(&message, &[]).unwrap();
        assert_eq!(composed.headers().get_raw("X-Mail-ID").unwrap(), message.pk.to_string());
        assert!(composed.headers().get_raw("Message-ID").unwrap().starts_with("<M1@"));
    }

    #[test]
    fn x_mail_id_uses_surrogate_key_not_client_id() {
        // Two tenants can both submit id="M1"; the header must disambiguate
        // them by surrogate key, not echo the client-supplied id.
        let mut a = base_message();
        a.id = "M1".to_string();
        a.pk = Uuid::new_v4();
        let mut b = base_message();
        b.id = "M1".to_string();
        b.pk = Uuid::new_v4();

        let composed_a = compose(&a, &[]).unwrap();
        let composed_b = compose(&b, &[]).unwrap();
        assert_ne!(
            composed_a.headers().get_raw("X-Mail-ID"),
            composed_b.headers().get_raw("X-Mail-ID")
        );
    }

    #[test]
    fn message_id_embeds_queue_id() {
        let id = message_id("M42");
        assert!(id.starts_with("M42@"));
    }

    #[test]
    fn rejects_malformed_sender_address() {
        let mut message = base_message();
        message.payload.from = "not-an-address".to_string();
        assert!(compose(&message, &[]).is_err());
    }
}

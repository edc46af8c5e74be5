use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Router,
};
use chrono::Utc;
use propline_agent::IntakeRuntime;
use propline_core::domain::message::{InboundMessage, MessageId};
use serde::Deserialize;
use tracing::debug;

#[derive(Clone)]
pub struct WebhookState {
    runtime: Arc<IntakeRuntime>,
}

/// Form-encoded inbound event as the messaging provider posts it.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
    #[serde(rename = "MediaUrl0", default)]
    pub media_url0: Option<String>,
}

impl InboundForm {
    pub fn into_message(self) -> InboundMessage {
        let has_media = self
            .num_media
            .as_deref()
            .and_then(|count| count.trim().parse::<u32>().ok())
            .is_some_and(|count| count > 0);
        let media_ref = if has_media {
            self.media_url0.filter(|url| !url.trim().is_empty())
        } else {
            None
        };

        InboundMessage {
            message_id: MessageId(self.message_sid),
            sender: self.from,
            body: self.body,
            media_ref,
            received_at: Utc::now(),
        }
    }
}

pub fn router(runtime: Arc<IntakeRuntime>) -> Router {
    Router::new().route("/api/whatsapp", post(inbound)).with_state(WebhookState { runtime })
}

/// Always answers 200 with a reply envelope; failures are already plain text.
pub async fn inbound(State(state): State<WebhookState>, Form(form): Form<InboundForm>) -> Response {
    let message = form.into_message();
    let correlation_id = message.message_id.0.clone();
    let turn = state.runtime.handle_inbound(message).await;

    debug!(
        event_name = "webhook.reply_rendered",
        correlation_id = %correlation_id,
        outcome = turn.outcome.as_str(),
        "reply envelope rendered"
    );
    twiml(&turn.reply)
}

pub fn twiml(reply: &str) -> Response {
    let body = format!("<Response><Message>{}</Message></Response>", escape_xml(reply));
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use propline_agent::{ExtractionInvoker, IntakeRuntime, RuleBasedExtractor};
    use propline_core::audit::InMemoryAuditSink;
    use propline_db::{DualStoreWriter, InMemoryGraphStore, InMemoryIntakeRepository};
    use tower::ServiceExt;

    use super::{escape_xml, router, InboundForm};

    fn runtime() -> Arc<IntakeRuntime> {
        let writer = DualStoreWriter::new(
            Arc::new(InMemoryIntakeRepository::default()),
            Arc::new(InMemoryGraphStore::default()),
            1,
        );
        let invoker = ExtractionInvoker::new(
            Arc::new(RuleBasedExtractor::new()),
            std::time::Duration::from_secs(1),
            0,
        );
        Arc::new(IntakeRuntime::new(writer, invoker, Arc::new(InMemoryAuditSink::default()), "RESET"))
    }

    async fn post_form(app: axum::Router, body: &str) -> (StatusCode, String, String) {
        let response = app
            .oneshot(
                Request::post("/api/whatsapp")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, content_type, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(escape_xml("Tom & <Jerry> \"quoted\""), "Tom &amp; &lt;Jerry&gt; &quot;quoted&quot;");
    }

    #[test]
    fn media_ref_requires_a_positive_media_count() {
        let form = InboundForm {
            from: "whatsapp:+2348011111111".to_string(),
            body: String::new(),
            message_sid: "SM1".to_string(),
            num_media: Some("0".to_string()),
            media_url0: Some("https://media.example/1".to_string()),
        };
        assert_eq!(form.clone().into_message().media_ref, None);

        let with_media = InboundForm { num_media: Some("1".to_string()), ..form };
        assert_eq!(with_media.into_message().media_ref.as_deref(), Some("https://media.example/1"));
    }

    #[tokio::test]
    async fn webhook_replies_with_an_envelope_and_advances_the_step() {
        let app = router(runtime());

        let (status, content_type, body) = post_form(
            app.clone(),
            "From=whatsapp%3A%2B2348012345678&Body=hi&MessageSid=SM-hook-1&NumMedia=0",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/xml");
        assert!(body.starts_with("<Response><Message>"));
        assert!(body.ends_with("</Message></Response>"));

        let (_, _, body) = post_form(
            app,
            "From=whatsapp%3A%2B2348012345678&Body=John+Doe&MessageSid=SM-hook-2&NumMedia=0",
        )
        .await;
        assert!(body.contains("NIN"), "expected identity prompt, got {body}");
    }

    #[tokio::test]
    async fn unusable_sender_still_gets_a_plain_reply() {
        let (status, content_type, body) =
            post_form(router(runtime()), "From=whatsapp%3A&Body=hello&MessageSid=SM-bad").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/xml");
        assert!(body.contains("<Message>"));
    }
}

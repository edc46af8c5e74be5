use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use propline_core::config::LlmConfig;
use propline_core::errors::IntakeError;
use propline_core::flows::IntakeStep;
use propline_core::reconcile::ExtractionDelta;
use propline_core::validation::identity_kind_hint;
use propline_core::IdentityKind;

use crate::llm::{CompletionRequest, LlmClient};

pub const REQUIRED_KEYS: [&str; 6] =
    ["name", "identity_document", "address", "role", "preferences", "reply"];

/// Parsed, schema-checked extraction result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    pub delta: ExtractionDelta,
    /// Reply phrased by the capability; only trusted when the step advances.
    pub reply: Option<String>,
}

/// Calls the extraction capability for exactly one step and validates what
/// comes back before any field reaches the merger.
pub struct ExtractionInvoker {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
    max_retries: u32,
}

impl ExtractionInvoker {
    pub fn new(client: Arc<dyn LlmClient>, timeout: Duration, max_retries: u32) -> Self {
        Self { client, timeout, max_retries }
    }

    pub fn from_config(client: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self::new(client, Duration::from_secs(config.timeout_secs.max(1)), config.max_retries)
    }

    /// Upper bound on one extraction, retries included.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider(&self) -> &'static str {
        self.client.provider()
    }

    pub fn build_request(step: IntakeStep, text: &str) -> CompletionRequest {
        CompletionRequest { step, system: system_prompt(step), user: text.trim().to_string() }
    }

    /// The whole call, retries included, is bounded by the configured timeout.
    pub async fn extract(&self, step: IntakeStep, text: &str) -> Result<Extraction, IntakeError> {
        let request = Self::build_request(step, text);
        let attempts = self.max_retries.saturating_add(1);

        let call = async {
            let mut last_error = None;
            for attempt in 1..=attempts {
                match self.client.complete(&request).await {
                    Ok(raw) => return Ok(raw),
                    Err(error) => {
                        debug!(
                            event_name = "extraction.attempt_failed",
                            provider = self.client.provider(),
                            step = %step,
                            attempt,
                            error = %error,
                            "extraction attempt failed"
                        );
                        last_error = Some(error);
                    }
                }
            }
            Err(last_error.map(|error| error.to_string()).unwrap_or_default())
        };

        let raw = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(message)) => {
                warn!(
                    event_name = "extraction.unavailable",
                    provider = self.client.provider(),
                    step = %step,
                    error = %message,
                    "extraction capability unavailable"
                );
                return Err(IntakeError::OracleUnavailable(message));
            }
            Err(_) => {
                warn!(
                    event_name = "extraction.timeout",
                    provider = self.client.provider(),
                    step = %step,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "extraction capability timed out"
                );
                return Err(IntakeError::OracleUnavailable(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        parse_extraction(&raw).map_err(|error| {
            warn!(
                event_name = "extraction.malformed",
                provider = self.client.provider(),
                step = %step,
                error = %error,
                "extraction output rejected"
            );
            error
        })
    }
}

/// System prompt naming only the active step's field.
pub fn system_prompt(step: IntakeStep) -> String {
    let target = match step {
        IntakeStep::Name => "`name`: the sender's full name.".to_string(),
        IntakeStep::Identity => format!(
            "`identity_document`: either a NIN ({}) or a CAC registration number ({}). \
             Copy it exactly; do not guess missing digits.",
            identity_kind_hint(IdentityKind::Nin),
            identity_kind_hint(IdentityKind::Cac)
        ),
        IntakeStep::Address => "`address`: the street address of the property being listed, \
             and `role`: whether the sender is the owner, agent, landlord or caretaker if they say so. \
             An ID number is never an address."
            .to_string(),
        IntakeStep::Preferences => {
            "`preferences`: the sender's tenant or listing preferences, as free text.".to_string()
        }
        IntakeStep::Done => "nothing; the registration is already complete.".to_string(),
    };
    let next = match step.next() {
        IntakeStep::Done => "tell them the registration is complete".to_string(),
        following => format!("ask for the {following} step"),
    };

    format!(
        "You extract data for a property listing service chatting over WhatsApp.\n\
         Extract only {target}\n\
         Every other field must be null, even if the message mentions it.\n\
         Never invent values and never output placeholders such as Unknown, Pending or N/A; use null.\n\
         Respond with a single JSON object with exactly these keys: \
         \"name\", \"identity_document\", \"address\", \"role\", \"preferences\", \"reply\". \
         Each value is a string or null. No other keys, no prose outside the JSON.\n\
         In \"reply\", if you extracted the field, briefly confirm it and {next}; \
         otherwise politely ask for the {step} again."
    )
}

/// Locates the JSON object in `raw` and checks it against the strict schema.
pub fn parse_extraction(raw: &str) -> Result<Extraction, IntakeError> {
    let candidate = locate_json(raw);
    let value: Value = serde_json::from_str(candidate)
        .map_err(|error| IntakeError::OracleMalformedOutput(format!("invalid JSON: {error}")))?;
    let Value::Object(object) = value else {
        return Err(IntakeError::OracleMalformedOutput("expected a JSON object".to_string()));
    };

    if let Some(unknown) = object.keys().find(|key| !REQUIRED_KEYS.contains(&key.as_str())) {
        return Err(IntakeError::OracleMalformedOutput(format!("unknown key `{unknown}`")));
    }

    Ok(Extraction {
        delta: ExtractionDelta {
            name: string_or_null(&object, "name")?,
            identity_document: string_or_null(&object, "identity_document")?,
            address: string_or_null(&object, "address")?,
            role: string_or_null(&object, "role")?,
            preferences: string_or_null(&object, "preferences")?,
        },
        reply: string_or_null(&object, "reply")?
            .map(|reply| reply.trim().to_string())
            .filter(|reply| !reply.is_empty()),
    })
}

fn string_or_null(object: &Map<String, Value>, key: &str) -> Result<Option<String>, IntakeError> {
    match object.get(key) {
        None => Err(IntakeError::OracleMalformedOutput(format!("missing key `{key}`"))),
        Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(IntakeError::OracleMalformedOutput(format!(
            "key `{key}` must be a string or null, got {}",
            json_type(other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Models wrap JSON in markdown fences or chatter; take the fenced block if
/// there is one, else the outermost braces.
fn locate_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let body_start = after_fence.find('\n').map_or(0, |newline| newline + 1);
        let body = &after_fence[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use propline_core::errors::IntakeError;
    use propline_core::flows::IntakeStep;

    use super::{parse_extraction, system_prompt, ExtractionInvoker};
    use crate::llm::{CompletionRequest, LlmClient};

    struct ScriptedClient {
        responses: Vec<Result<String, String>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<String, String>>) -> Self {
            Self { responses, calls: AtomicU32::new(0), delay: Duration::ZERO }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            tokio::time::sleep(self.delay).await;
            match self.responses.get(index).or_else(|| self.responses.last()) {
                Some(Ok(raw)) => Ok(raw.clone()),
                Some(Err(message)) => Err(anyhow::anyhow!(message.clone())),
                None => Err(anyhow::anyhow!("no scripted response")),
            }
        }
    }

    const VALID: &str = r#"{"name":"John Doe","identity_document":null,"address":null,"role":null,"preferences":null,"reply":"Thanks John! Now your NIN."}"#;

    #[test]
    fn prompt_names_only_the_active_field() {
        let prompt = system_prompt(IntakeStep::Identity);
        assert!(prompt.contains("Extract only `identity_document`"));
        assert!(!prompt.contains("Extract only `address`"));
        assert!(prompt.contains("ask for the address step"));
    }

    #[test]
    fn accepts_fenced_and_wrapped_json() {
        let fenced = format!("Sure!\n```json\n{VALID}\n```\n");
        let parsed = parse_extraction(&fenced).expect("fenced");
        assert_eq!(parsed.delta.name.as_deref(), Some("John Doe"));
        assert_eq!(parsed.reply.as_deref(), Some("Thanks John! Now your NIN."));

        let wrapped = format!("Here you go: {VALID} hope that helps");
        assert!(parse_extraction(&wrapped).is_ok());
    }

    #[test]
    fn rejects_schema_violations() {
        let missing = r#"{"name":"John","address":null,"role":null,"preferences":null,"reply":null}"#;
        let unknown = r#"{"name":null,"identity_document":null,"address":null,"role":null,"preferences":null,"reply":null,"phone":"1"}"#;
        let wrong_type = r#"{"name":42,"identity_document":null,"address":null,"role":null,"preferences":null,"reply":null}"#;

        for raw in [missing, unknown, wrong_type, "not json at all", "[1,2]"] {
            assert!(
                matches!(parse_extraction(raw), Err(IntakeError::OracleMalformedOutput(_))),
                "expected malformed output for {raw}"
            );
        }
    }

    #[tokio::test]
    async fn transport_errors_are_retried_then_reported_unavailable() {
        let flaky = Arc::new(ScriptedClient::new(vec![
            Err("connection refused".to_string()),
            Ok(VALID.to_string()),
        ]));
        let invoker = ExtractionInvoker::new(flaky.clone(), Duration::from_secs(2), 1);
        let extraction = invoker.extract(IntakeStep::Name, "John Doe").await.expect("retry");
        assert_eq!(extraction.delta.name.as_deref(), Some("John Doe"));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let down = Arc::new(ScriptedClient::new(vec![Err("connection refused".to_string())]));
        let invoker = ExtractionInvoker::new(down, Duration::from_secs(2), 2);
        assert!(matches!(
            invoker.extract(IntakeStep::Name, "John Doe").await,
            Err(IntakeError::OracleUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn slow_capability_times_out() {
        let mut slow = ScriptedClient::new(vec![Ok(VALID.to_string())]);
        slow.delay = Duration::from_millis(200);
        let invoker = ExtractionInvoker::new(Arc::new(slow), Duration::from_millis(20), 0);

        let error = invoker.extract(IntakeStep::Name, "John Doe").await.expect_err("timeout");
        assert!(matches!(error, IntakeError::OracleUnavailable(message) if message.contains("timed out")));
    }
}

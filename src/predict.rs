use std::env;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::actions::ActionPayload;
use crate::device::ScreenCapture;
use crate::error::DriveError;

/// Immutable pair tying a continuation token to the call it answers.
///
/// The service rejects a continuation that carries one half without the
/// other, so the type offers no way to build such a value: both parts go in
/// at construction and neither can be swapped afterwards. The control loop
/// threads handles through without looking inside; only this module reads
/// the fields.
#[derive(Clone, Debug)]
pub struct ConversationHandle {
    token: String,
    call_ref: String,
}

impl ConversationHandle {
    pub fn new(token: impl Into<String>, call_ref: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            call_ref: call_ref.into(),
        }
    }
}

/// One proposed device input, tied to the prediction turn that issued it.
#[derive(Clone, Debug)]
pub struct PendingCall {
    pub call_id: String,
    pub action: ActionPayload,
}

/// Parsed result of one prediction turn.
#[derive(Clone, Debug)]
pub struct Prediction {
    /// Proposed actions, in the order the service returned them.
    pub calls: Vec<PendingCall>,
    /// Commentary text, one entry per message item, empties dropped.
    pub messages: Vec<String>,
    /// Token identifying this turn for the next request.
    pub response_id: String,
}

impl Prediction {
    /// Handle for continuing the conversation after acting on the first
    /// pending call. `None` when the turn proposed no action.
    pub fn continuation(&self) -> Option<ConversationHandle> {
        self.calls
            .first()
            .map(|call| ConversationHandle::new(&self.response_id, &call.call_id))
    }
}

/// Seam over the action-prediction service.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// One prediction turn. Fresh mode when `prior` is absent, continuation
    /// mode otherwise.
    async fn predict(
        &self,
        instruction: &str,
        screen: &ScreenCapture,
        prior: Option<&ConversationHandle>,
    ) -> Result<Prediction, DriveError>;
}

#[derive(Clone)]
pub struct ComputerUseConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    /// Device display geometry in pixels, declared on every call so the
    /// predicted coordinates stay calibrated to the real panel.
    pub display: (u32, u32),
    pub environment: String,
}

impl Default for ComputerUseConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("COMPUTER_USE_MODEL")
                .unwrap_or_else(|_| "computer-use-preview".to_string()),
            display: (720, 1520),
            environment: "browser".to_string(),
        }
    }
}

/// Client for the computer-use prediction endpoint.
#[derive(Clone)]
pub struct ComputerUseClient {
    http: Client,
    cfg: ComputerUseConfig,
}

impl ComputerUseClient {
    pub fn new(cfg: ComputerUseConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY is not set");
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    fn tool_declaration(&self) -> Value {
        json!([{
            "type": "computer_use_preview",
            "display_width": self.cfg.display.0,
            "display_height": self.cfg.display.1,
            "environment": self.cfg.environment,
        }])
    }

    fn fresh_request(&self, instruction: &str, screen: &ScreenCapture) -> Value {
        json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "tools": self.tool_declaration(),
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_text", "text": task_prompt(instruction) },
                    { "type": "input_image", "image_url": screen.uri, "detail": "high" },
                ],
            }],
        })
    }

    fn continuation_request(&self, prior: &ConversationHandle, screen: &ScreenCapture) -> Value {
        json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "previous_response_id": prior.token,
            "tools": self.tool_declaration(),
            "input": [{
                "type": "computer_call_output",
                "call_id": prior.call_ref,
                "output": {
                    "type": "computer_screenshot",
                    "image_url": screen.uri,
                },
            }],
        })
    }

    async fn post(&self, body: &Value) -> Result<Value> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("prediction service error {status}: {text}");
        }
        serde_json::from_str(&text).context("invalid prediction response JSON")
    }
}

fn task_prompt(instruction: &str) -> String {
    format!(
        "You are controlling an Android device through a browser interface. \
         Please complete this task: \"{instruction}\".\n\n\
         You can see the current screen in the image. Analyze what you see and \
         determine the next action needed to complete the task.\n\n\
         Available actions:\n\
         - click(x, y): tap at coordinates\n\
         - type(text): type text into the focused field\n\
         - scroll(x, y, scroll_x, scroll_y): scroll from a point\n\
         - keypress(keys): press keys like \"back\", \"home\", \"enter\"\n\
         - wait(ms): wait for the screen to settle\n\n\
         Take your time to analyze the screen and plan your actions carefully."
    )
}

fn parse_response(v: Value) -> Result<Prediction> {
    let response_id = v
        .get("id")
        .and_then(Value::as_str)
        .context("missing id")?
        .to_string();

    let outputs = v
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut calls = Vec::new();
    let mut messages = Vec::new();
    for item in outputs {
        match item.get("type").and_then(Value::as_str) {
            Some("computer_call") => {
                let call_id = item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let action = item
                    .get("action")
                    .cloned()
                    .map(|a| serde_json::from_value(a).unwrap_or_default())
                    .unwrap_or_default();
                calls.push(PendingCall { call_id, action });
            }
            Some("message") => {
                let text = item
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                if !text.is_empty() {
                    messages.push(text);
                }
            }
            _ => {}
        }
    }

    Ok(Prediction {
        calls,
        messages,
        response_id,
    })
}

#[async_trait]
impl Predictor for ComputerUseClient {
    async fn predict(
        &self,
        instruction: &str,
        screen: &ScreenCapture,
        prior: Option<&ConversationHandle>,
    ) -> Result<Prediction, DriveError> {
        let body = match prior {
            None => self.fresh_request(instruction, screen),
            Some(handle) => {
                // A half-empty handle would desynchronize the service's
                // conversation history. Refuse before anything hits the wire.
                if handle.token.is_empty() {
                    return Err(DriveError::Protocol("continuation token".into()));
                }
                if handle.call_ref.is_empty() {
                    return Err(DriveError::Protocol("call reference".into()));
                }
                self.continuation_request(handle, screen)
            }
        };
        debug!(continuation = prior.is_some(), "requesting prediction");
        let v = self
            .post(&body)
            .await
            .map_err(|e| DriveError::Prediction(e.to_string()))?;
        parse_response(v).map_err(|e| DriveError::Prediction(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> ComputerUseClient {
        ComputerUseClient::new(ComputerUseConfig {
            api_base: "http://127.0.0.1:9".into(),
            api_key: "test-key".into(),
            model: "computer-use-preview".into(),
            display: (720, 1520),
            environment: "browser".into(),
        })
        .unwrap()
    }

    fn screen() -> ScreenCapture {
        ScreenCapture::new("data:image/png;base64,aGVsbG8=")
    }

    #[test]
    fn fresh_request_declares_display_and_screen() {
        let client = test_client();
        let body = client.fresh_request("open settings", &screen());

        assert_eq!(body["model"], "computer-use-preview");
        assert_eq!(body["truncation"], "auto");
        assert_eq!(body["tools"][0]["type"], "computer_use_preview");
        assert_eq!(body["tools"][0]["display_width"], 720);
        assert_eq!(body["tools"][0]["display_height"], 1520);
        assert_eq!(body["tools"][0]["environment"], "browser");

        let content = &body["input"][0]["content"];
        assert_eq!(content[0]["type"], "input_text");
        assert!(content[0]["text"]
            .as_str()
            .unwrap()
            .contains("open settings"));
        assert_eq!(content[1]["type"], "input_image");
        assert_eq!(content[1]["image_url"], "data:image/png;base64,aGVsbG8=");
        assert_eq!(content[1]["detail"], "high");
    }

    #[test]
    fn continuation_request_carries_both_handle_parts() {
        let client = test_client();
        let handle = ConversationHandle::new("resp-1", "call-1");
        let body = client.continuation_request(&handle, &screen());

        assert_eq!(body["previous_response_id"], "resp-1");
        assert_eq!(body["input"][0]["type"], "computer_call_output");
        assert_eq!(body["input"][0]["call_id"], "call-1");
        assert_eq!(body["input"][0]["output"]["type"], "computer_screenshot");
        assert_eq!(
            body["input"][0]["output"]["image_url"],
            "data:image/png;base64,aGVsbG8="
        );
        // The tool declaration is repeated so the service keeps the same
        // display calibration across turns.
        assert_eq!(body["tools"][0]["display_width"], 720);
    }

    #[test]
    fn parse_keeps_call_order_and_joins_messages() {
        let v = json!({
            "id": "resp-9",
            "output": [
                { "type": "message", "content": [
                    { "type": "output_text", "text": "Opening the app" },
                    { "type": "output_text", "text": "now" },
                ]},
                { "type": "computer_call", "call_id": "call-a",
                  "action": { "type": "click", "x": 100, "y": 200 } },
                { "type": "reasoning", "summary": [] },
                { "type": "computer_call", "call_id": "call-b",
                  "action": { "type": "wait" } },
                { "type": "message", "content": [] },
            ],
        });
        let prediction = parse_response(v).unwrap();

        assert_eq!(prediction.response_id, "resp-9");
        assert_eq!(prediction.calls.len(), 2);
        assert_eq!(prediction.calls[0].call_id, "call-a");
        assert_eq!(prediction.calls[1].call_id, "call-b");
        assert_eq!(prediction.calls[0].action.kind, "click");
        assert_eq!(prediction.messages, vec!["Opening the app now"]);
    }

    #[test]
    fn parse_rejects_response_without_id() {
        let v = json!({ "output": [] });
        assert!(parse_response(v).is_err());
    }

    #[test]
    fn continuation_handle_pairs_token_with_first_call() {
        let prediction = Prediction {
            calls: vec![
                PendingCall {
                    call_id: "call-a".into(),
                    action: ActionPayload::default(),
                },
                PendingCall {
                    call_id: "call-b".into(),
                    action: ActionPayload::default(),
                },
            ],
            messages: vec![],
            response_id: "resp-1".into(),
        };
        let handle = prediction.continuation().unwrap();
        assert_eq!(handle.token, "resp-1");
        assert_eq!(handle.call_ref, "call-a");

        let empty = Prediction {
            calls: vec![],
            messages: vec![],
            response_id: "resp-2".into(),
        };
        assert!(empty.continuation().is_none());
    }

    #[tokio::test]
    async fn half_empty_handle_fails_before_any_network() {
        // The base URL is unreachable; reaching the wire would error as
        // Prediction, not Protocol.
        let client = test_client();

        let no_token = ConversationHandle::new("", "call-1");
        let err = client
            .predict("task", &screen(), Some(&no_token))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::Protocol(ref part) if part == "continuation token"));

        let no_call = ConversationHandle::new("resp-1", "");
        let err = client
            .predict("task", &screen(), Some(&no_call))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::Protocol(ref part) if part == "call reference"));
    }
}

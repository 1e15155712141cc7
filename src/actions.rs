use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::device::{DeviceBackend, DeviceError};
use crate::error::DriveError;

const DEFAULT_WAIT_MS: u64 = 1000;

/// Wire shape of one proposed action: a tag plus whichever fields the
/// service chose to fill in. Nothing here is trusted; validation happens in
/// [`ActionPayload::decode`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathPoint>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: i64,
    pub y: i64,
}

/// One validated device input primitive. The set is closed: consumers match
/// exhaustively, so adding a variant forces every site to say what it does
/// with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { x: i64, y: i64 },
    Type { text: String },
    Keypress { keys: Vec<String> },
    Wait { ms: u64 },
    Scroll { x: i64, y: i64, dx: i64, dy: i64 },
    Drag { path: Vec<PathPoint> },
    Screenshot,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Keypress { .. } => "keypress",
            Action::Wait { .. } => "wait",
            Action::Scroll { .. } => "scroll",
            Action::Drag { .. } => "drag",
            Action::Screenshot => "screenshot",
        }
    }
}

impl ActionPayload {
    /// Validate this payload into a concrete [`Action`].
    ///
    /// Coordinates and text are required where an input primitive cannot
    /// work without them; wait and scroll fall back to defaults instead.
    pub fn decode(&self) -> Result<Action, DriveError> {
        let malformed = |detail: &str| DriveError::MalformedAction {
            kind: self.kind.clone(),
            detail: detail.to_string(),
        };
        match self.kind.as_str() {
            "click" => match (self.x, self.y) {
                (Some(x), Some(y)) => Ok(Action::Click { x, y }),
                _ => Err(malformed("click requires both x and y")),
            },
            "type" => match self.text.as_deref() {
                Some(text) if !text.is_empty() => Ok(Action::Type {
                    text: text.to_string(),
                }),
                _ => Err(malformed("type requires non-empty text")),
            },
            "keypress" => match self.keys.as_deref() {
                Some(keys) if !keys.is_empty() => Ok(Action::Keypress {
                    keys: keys.to_vec(),
                }),
                _ => Err(malformed("keypress requires a non-empty key list")),
            },
            "wait" => Ok(Action::Wait {
                ms: self.ms.unwrap_or(DEFAULT_WAIT_MS),
            }),
            "scroll" => Ok(Action::Scroll {
                x: self.x.unwrap_or(0),
                y: self.y.unwrap_or(0),
                dx: self.scroll_x.unwrap_or(0),
                dy: self.scroll_y.unwrap_or(0),
            }),
            "drag" => Ok(Action::Drag {
                path: self.path.clone().unwrap_or_default(),
            }),
            "screenshot" => Ok(Action::Screenshot),
            _ => Err(malformed("unrecognized action type")),
        }
    }
}

/// What became of one translated action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Input was injected into the device.
    Applied,
    /// The backend refused the input; the run carries on.
    SoftFailed(String),
    /// The backend has no native equivalent for this primitive.
    Unsupported(&'static str),
    /// Nothing to do. A capture follows every action anyway, so an explicit
    /// screenshot request needs no device call.
    Noop,
}

/// Map one validated action onto the device backend.
///
/// Backend refusals are downgraded to soft failures so a single rejected
/// input cannot abort the run.
pub async fn apply<D>(device: &D, session_id: &str, action: &Action) -> ActionOutcome
where
    D: DeviceBackend + ?Sized,
{
    match action {
        Action::Click { x, y } => applied_or_soft(device.click(session_id, *x, *y).await),
        Action::Type { text } => applied_or_soft(device.type_text(session_id, text).await),
        Action::Keypress { keys } => applied_or_soft(device.press_keys(session_id, keys).await),
        Action::Wait { ms } => {
            sleep(Duration::from_millis(*ms)).await;
            ActionOutcome::Applied
        }
        Action::Scroll { .. } => {
            warn!(kind = "scroll", "no device equivalent, skipping");
            ActionOutcome::Unsupported("scroll")
        }
        Action::Drag { path } => {
            warn!(kind = "drag", points = path.len(), "no device equivalent, skipping");
            ActionOutcome::Unsupported("drag")
        }
        Action::Screenshot => {
            debug!("screenshot request folded into the post-action capture");
            ActionOutcome::Noop
        }
    }
}

fn applied_or_soft(result: Result<(), DeviceError>) -> ActionOutcome {
    match result {
        Ok(()) => ActionOutcome::Applied,
        Err(err) => {
            warn!(%err, "device rejected action, continuing");
            ActionOutcome::SoftFailed(err.to_string())
        }
    }
}

// Wire types shared by the relay, its HTTP clients, and WebSocket subscribers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Trigger commands
// ---------------------------------------------------------------------------

pub const COMMAND_EXPRESSION: &str = "expression";
pub const COMMAND_MOTION: &str = "motion";
pub const COMMAND_SPEAK: &str = "speak";

/// Expression name that puts the avatar's face back to rest. Expressions do
/// not revert on their own.
pub const NEUTRAL_EXPRESSION: &str = "normal";

/// Body of `POST /api/v1/live2d/trigger-action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCommand {
    pub command_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Live2D motion priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MotionPriority {
    Idle = 1,
    #[default]
    Normal = 2,
    Force = 3,
}

impl TryFrom<u8> for MotionPriority {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MotionPriority::Idle),
            2 => Ok(MotionPriority::Normal),
            3 => Ok(MotionPriority::Force),
            other => Err(other),
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl TriggerCommand {
    pub fn new(command_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
        }
    }

    /// Switch the avatar's facial expression.
    pub fn expression(name: impl Into<String>) -> Self {
        Self::new(COMMAND_EXPRESSION, object(json!({ "name": name.into() })))
    }

    /// Play motion `index` from motion group `group`.
    pub fn motion(group: impl Into<String>, index: u32, priority: MotionPriority) -> Self {
        Self::new(
            COMMAND_MOTION,
            object(json!({
                "group": group.into(),
                "index": index,
                "priority": priority as u8,
            })),
        )
    }

    /// Lip-sync to the audio file at `audio_url`.
    pub fn speak(audio_url: impl Into<String>) -> Self {
        Self::new(COMMAND_SPEAK, object(json!({ "audioUrl": audio_url.into() })))
    }
}

/// What WebSocket subscribers receive for each trigger command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Map<String, Value>,
}

impl From<TriggerCommand> for RelayMessage {
    fn from(cmd: TriggerCommand) -> Self {
        Self {
            kind: cmd.command_type,
            data: cmd.payload,
        }
    }
}

/// Response of the trigger endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub message: String,
    pub command: TriggerCommand,
    /// Subscribers connected when the command was published.
    #[serde(default)]
    pub delivered_to: usize,
}

// ---------------------------------------------------------------------------
// Hit-area interactions
// ---------------------------------------------------------------------------

pub const HIT_AREA_HEAD: &str = "Head";
pub const HIT_AREA_BODY: &str = "Body";

/// Body of `POST /api/v1/live2d/interaction`, sent when the user taps the
/// avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPayload {
    pub model_id: String,
    pub hit_areas: Vec<String>,
    pub timestamp: String,
}

fn default_action_priority() -> u8 {
    MotionPriority::Force as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendAction {
    /// `talk`, `motion`, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_action_priority")]
    pub priority: u8,
}

impl BackendAction {
    pub fn talk(expression: impl Into<String>) -> Self {
        Self {
            kind: "talk".into(),
            expression: Some(expression.into()),
            group: None,
            index: 0,
            priority: default_action_priority(),
        }
    }

    pub fn motion(group: impl Into<String>) -> Self {
        Self {
            kind: "motion".into(),
            expression: None,
            group: Some(group.into()),
            index: 0,
            priority: default_action_priority(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub status: String,
    pub action: Option<BackendAction>,
}

impl InteractionResponse {
    pub fn success(action: BackendAction) -> Self {
        Self {
            status: "success".into(),
            action: Some(action),
        }
    }

    pub fn ignored() -> Self {
        Self {
            status: "ignored".into(),
            action: None,
        }
    }
}

/// Map tapped hit areas to an avatar reaction. Head takes precedence over
/// Body; anything else is ignored.
pub fn react_to_hit(hit_areas: &[String]) -> InteractionResponse {
    let hit = |area: &str| hit_areas.iter().any(|a| a == area);
    if hit(HIT_AREA_HEAD) {
        InteractionResponse::success(BackendAction::talk("Happy"))
    } else if hit(HIT_AREA_BODY) {
        InteractionResponse::success(BackendAction::motion("Tap@Body"))
    } else {
        InteractionResponse::ignored()
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

// ========================= Identifiers =========================

/// Identifier of the browser tab under control. Fixed for the lifetime of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ========================= Page model =========================

/// One interactive element of a page scan. The `id` is only valid for the scan
/// that produced it and the DOM snapshot at that moment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractableElement {
    pub id: u32,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Title and URL of the page at observation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub title: String,
    pub url: String,
}

/// Result of dispatching one action to the executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub message: String,
}

// ========================= Actions =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// One action decided by the model. Produced only by response extraction
/// (`crate::extract`); `Other` carries unrecognized verbs through to the
/// executor instead of rejecting them at the parser.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionCommand {
    Navigate { url: String },
    Click { element_id: u32 },
    Input { element_id: u32, text: String },
    Scroll { direction: ScrollDirection },
    Finish,
    Other { verb: String },
}

impl ActionCommand {
    /// Wire shape shared with the executor and the history log,
    /// e.g. `{"action":"click","elementId":3}`.
    pub fn to_json(&self) -> Value {
        match self {
            ActionCommand::Navigate { url } => json!({"action": "navigate", "url": url}),
            ActionCommand::Click { element_id } => {
                json!({"action": "click", "elementId": element_id})
            }
            ActionCommand::Input { element_id, text } => {
                json!({"action": "input", "elementId": element_id, "text": text})
            }
            ActionCommand::Scroll { direction } => {
                json!({"action": "scroll", "direction": direction.as_str()})
            }
            ActionCommand::Finish => json!({"action": "finish"}),
            ActionCommand::Other { verb } => json!({"action": verb}),
        }
    }

    /// The verb as the model spelled it.
    pub fn verb(&self) -> &str {
        match self {
            ActionCommand::Navigate { .. } => "navigate",
            ActionCommand::Click { .. } => "click",
            ActionCommand::Input { .. } => "input",
            ActionCommand::Scroll { .. } => "scroll",
            ActionCommand::Finish => "finish",
            ActionCommand::Other { verb } => verb,
        }
    }
}

impl Serialize for ActionCommand {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for ActionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ========================= Controller <-> UI =========================

/// Fire-and-forget notifications to the UI layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Short status text ("Scanning current page...").
    Status(String),
    /// One appended log line (mirrors a history entry).
    LogLine(String),
    /// Final textual response for the run.
    Response(String),
    /// The run stopped and the user has to take over.
    InterventionNeeded(String),
}

/// Reply to a start-goal request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReply {
    Accepted,
    Busy,
}

/// Reply to an end-task request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReply {
    Stopping,
    AlreadyStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_shapes() {
        let click = ActionCommand::Click { element_id: 3 };
        assert_eq!(click.to_json().to_string(), r#"{"action":"click","elementId":3}"#);

        let input = ActionCommand::Input { element_id: 2, text: "hi".into() };
        let v = input.to_json();
        assert_eq!(v["action"], "input");
        assert_eq!(v["elementId"], 2);
        assert_eq!(v["text"], "hi");

        assert_eq!(ActionCommand::Finish.to_json().to_string(), r#"{"action":"finish"}"#);
    }

    #[test]
    fn unknown_verb_keeps_its_spelling() {
        let cmd = ActionCommand::Other { verb: "hover".into() };
        assert_eq!(cmd.to_json()["action"], "hover");
        assert_eq!(cmd.verb(), "hover");
    }

    #[test]
    fn scroll_serializes_direction() {
        let cmd = ActionCommand::Scroll { direction: ScrollDirection::Up };
        assert_eq!(cmd.to_json()["direction"], "up");
    }

    #[test]
    fn element_roundtrips_through_json() {
        let el = InteractableElement {
            id: 1,
            tag: "a".into(),
            text: Some("Settings".into()),
            attributes: BTreeMap::from([("href".to_string(), "/settings".to_string())]),
            x: 10,
            y: 20,
            width: 80,
            height: 24,
        };
        let v = serde_json::to_value(&el).unwrap();
        let back: InteractableElement = serde_json::from_value(v).unwrap();
        assert_eq!(back, el);
    }
}

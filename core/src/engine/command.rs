//! Command wire format
//!
//! `{type: <domain>, cmd|action: <op>, ...fields}`. The top-level `type` is
//! a closed set; sub-discriminants stay in `fields` for the handler.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level command discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    Base,
    Ask,
    File,
    Browser,
    Coder,
    Advance,
    Mcp,
    Plan,
    External,
    Approval,
    AskApproval,
}

impl CommandType {
    pub const ALL: [CommandType; 11] = [
        Self::Base,
        Self::Ask,
        Self::File,
        Self::Browser,
        Self::Coder,
        Self::Advance,
        Self::Mcp,
        Self::Plan,
        Self::External,
        Self::Approval,
        Self::AskApproval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Ask => "ask",
            Self::File => "file",
            Self::Browser => "browser",
            Self::Coder => "coder",
            Self::Advance => "advance",
            Self::Mcp => "mcp",
            Self::Plan => "plan",
            Self::External => "external",
            Self::Approval => "approval",
            Self::AskApproval => "askApproval",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Types that never go through the approval gate
    pub fn is_approval_exempt(&self) -> bool {
        matches!(
            self,
            Self::Base | Self::Approval | Self::Ask | Self::External | Self::AskApproval
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool names that are shorthands for a `base` sub-command
const BASE_ALIASES: &[(&str, &str)] = &[
    ("thinking", "think"),
    ("think", "think"),
    ("log", "log"),
    ("plan", "plan"),
    ("complete", "complete"),
    ("complete_parallel_node", "complete_parallel_node"),
];

/// Fields that, in this order, make up the approval key
const KEY_FIELDS: [&str; 3] = ["cmd", "askType", "action"];

/// One dispatchable action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Command {
    pub fn new(kind: CommandType) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build a command from a parsed tool invocation.
    ///
    /// An explicit `type` param wins; otherwise the tool name is mapped.
    /// Returns `None` for names that match no command type.
    pub fn from_tool_use(name: &str, params: &Map<String, Value>) -> Option<Self> {
        let mut fields = params.clone();
        if let Some(Value::String(kind)) = fields.shift_remove("type") {
            return CommandType::from_name(&kind).map(|kind| Self { kind, fields });
        }

        if let Some((_, cmd)) = BASE_ALIASES.iter().find(|(alias, _)| *alias == name) {
            if !fields.contains_key("cmd") {
                fields.insert("cmd".to_string(), Value::String((*cmd).to_string()));
            }
            return Some(Self {
                kind: CommandType::Base,
                fields,
            });
        }

        CommandType::from_name(name).map(|kind| Self { kind, fields })
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// `cmd` or `action`, whichever the domain uses
    pub fn op(&self) -> Option<&str> {
        self.str_field("cmd").or_else(|| self.str_field("action"))
    }

    /// Canonical key used by approval predicates, e.g. `file.read`
    pub fn approval_key(&self) -> String {
        let mut key = self.kind.as_str().to_string();
        for field in KEY_FIELDS {
            if let Some(value) = self.str_field(field) {
                key.push('.');
                key.push_str(value);
            }
        }
        key
    }

    /// Decode the fields into a handler's typed operation
    pub fn parse_op<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Wrap this command in a request for user approval
    pub fn ask_approval(&self) -> Self {
        let original = serde_json::to_value(self).unwrap_or(Value::Null);
        Self::new(CommandType::AskApproval)
            .with("key", self.approval_key())
            .with("original", original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn test_wire_format() {
        let command: Command =
            serde_json::from_value(json!({"type": "file", "cmd": "read", "path": "a.txt"})).unwrap();
        assert_eq!(command.kind, CommandType::File);
        assert_eq!(command.str_field("path"), Some("a.txt"));

        let encoded = serde_json::to_value(&command).unwrap();
        assert_eq!(encoded["type"], "file");

        let ask: Command = serde_json::from_value(json!({"type": "askApproval"})).unwrap();
        assert_eq!(ask.kind, CommandType::AskApproval);
        assert!(serde_json::from_value::<Command>(json!({"type": "teleport"})).is_err());
    }

    #[test]
    fn test_tool_name_mapping() {
        let command = Command::from_tool_use("thinking", &params(json!({"content": "x"}))).unwrap();
        assert_eq!(command.kind, CommandType::Base);
        assert_eq!(command.op(), Some("think"));

        let command = Command::from_tool_use("coder", &params(json!({"cmd": "cmd", "command": "ls"}))).unwrap();
        assert_eq!(command.kind, CommandType::Coder);

        let command = Command::from_tool_use("anything", &params(json!({"type": "mcp", "cmd": "list"}))).unwrap();
        assert_eq!(command.kind, CommandType::Mcp);
        assert!(!command.fields.contains_key("type"));

        assert!(Command::from_tool_use("teleport", &Map::new()).is_none());
        assert!(Command::from_tool_use("x", &params(json!({"type": "nope"}))).is_none());
    }

    #[test]
    fn test_approval_key_priority() {
        let command = Command::new(CommandType::File).with("cmd", "read");
        assert_eq!(command.approval_key(), "file.read");

        let command = Command::new(CommandType::Browser).with("action", "open");
        assert_eq!(command.approval_key(), "browser.open");

        let command = Command::new(CommandType::Advance)
            .with("action", "add")
            .with("cmd", "memory");
        assert_eq!(command.approval_key(), "advance.memory.add");

        assert_eq!(Command::new(CommandType::Plan).approval_key(), "plan");
    }

    #[test]
    fn test_ask_approval_wraps_original() {
        let original = Command::new(CommandType::Coder).with("cmd", "cmd").with("command", "ls");
        let wrapped = original.ask_approval();
        assert_eq!(wrapped.kind, CommandType::AskApproval);
        assert_eq!(wrapped.str_field("key"), Some("coder.cmd"));

        let restored: Command = serde_json::from_value(wrapped.fields["original"].clone()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_exempt_types() {
        let exempt: Vec<&str> = CommandType::ALL
            .iter()
            .filter(|kind| kind.is_approval_exempt())
            .map(CommandType::as_str)
            .collect();
        assert_eq!(exempt, vec!["base", "ask", "external", "approval", "askApproval"]);
    }
}

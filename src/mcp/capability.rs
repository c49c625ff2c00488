//! Capability sets exchanged during initialisation.
//!
//! A capability set is a JSON object keyed by namespace (`tools`,
//! `resources`, `prompts`, `progress`, ...). Each namespace value is an
//! object of per-operation flags. Unknown namespaces are carried through
//! untouched so newer peers can advertise things this runtime does not use.
//!
//! Support rules:
//!
//! - a namespace that is absent means nothing in it is supported
//! - inside a present namespace, an operation flag that is absent means
//!   supported (so `"tools": {}` allows list and call)
//! - `listChanged` flags must be explicitly `true`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Namespaced capability flags advertised by one side of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(Map<String, Value>);

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a namespace, builder style.
    ///
    /// Descriptors that do not serialise to a JSON object are stored as an
    /// empty object.
    #[must_use]
    pub fn with(mut self, namespace: &str, descriptor: impl Serialize) -> Self {
        self.insert(namespace, descriptor);
        self
    }

    /// Adds (or replaces) a namespace.
    pub fn insert(&mut self, namespace: &str, descriptor: impl Serialize) {
        let value = match serde_json::to_value(descriptor) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(Map::new()),
        };
        self.0.insert(namespace.to_string(), value);
    }

    /// Returns the descriptor for a namespace.
    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.0.get(namespace)
    }

    /// Returns `true` if no namespace is advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Advertised namespace names.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns `true` if this set allows `operation`.
    #[must_use]
    pub fn supports(&self, operation: Operation) -> bool {
        let Some(descriptor) = self.0.get(operation.namespace()) else {
            return false;
        };

        let Some(flag) = operation.flag() else {
            return !descriptor.is_null() && descriptor.as_bool() != Some(false);
        };

        match descriptor.get(flag).and_then(Value::as_bool) {
            Some(enabled) => enabled,
            None => !operation.needs_explicit_flag() && descriptor.is_object(),
        }
    }
}

/// An operation gated by capability negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListTools,
    CallTool,
    ToolsListChanged,
    ListResources,
    ReadResource,
    ResourcesListChanged,
    ListPrompts,
    GetPrompt,
    PromptsListChanged,
    /// Receiving `notifications/progress`.
    Progress,
}

impl Operation {
    /// The namespace this operation belongs to.
    #[must_use]
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::ListTools | Self::CallTool | Self::ToolsListChanged => "tools",
            Self::ListResources | Self::ReadResource | Self::ResourcesListChanged => "resources",
            Self::ListPrompts | Self::GetPrompt | Self::PromptsListChanged => "prompts",
            Self::Progress => "progress",
        }
    }

    /// The flag inside the namespace, if any.
    #[must_use]
    pub const fn flag(self) -> Option<&'static str> {
        match self {
            Self::ListTools | Self::ListResources | Self::ListPrompts => Some("list"),
            Self::CallTool => Some("call"),
            Self::ReadResource => Some("read"),
            Self::GetPrompt => Some("get"),
            Self::ToolsListChanged | Self::ResourcesListChanged | Self::PromptsListChanged => {
                Some("listChanged")
            }
            Self::Progress => None,
        }
    }

    const fn needs_explicit_flag(self) -> bool {
        matches!(
            self,
            Self::ToolsListChanged | Self::ResourcesListChanged | Self::PromptsListChanged
        )
    }

    /// Maps a request method to the operation that gates it.
    #[must_use]
    pub fn for_method(method: &str) -> Option<Self> {
        use super::protocol::methods;

        match method {
            methods::TOOLS_LIST => Some(Self::ListTools),
            methods::TOOLS_CALL => Some(Self::CallTool),
            methods::RESOURCES_LIST => Some(Self::ListResources),
            methods::RESOURCES_READ => Some(Self::ReadResource),
            methods::PROMPTS_LIST => Some(Self::ListPrompts),
            methods::PROMPTS_GET => Some(Self::GetPrompt),
            _ => None,
        }
    }

    /// Human-readable name, used in errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ListTools => "tools/list",
            Self::CallTool => "tools/call",
            Self::ToolsListChanged => "tools list_changed",
            Self::ListResources => "resources/list",
            Self::ReadResource => "resources/read",
            Self::ResourcesListChanged => "resources list_changed",
            Self::ListPrompts => "prompts/list",
            Self::GetPrompt => "prompts/get",
            Self::PromptsListChanged => "prompts list_changed",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tool capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    pub list: bool,
    pub call: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Resource capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    pub list: bool,
    pub read: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Prompt capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    pub list: bool,
    pub get: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

/// Helper for serde `skip_serializing_if`.
#[allow(clippy::trivially_copy_pass_by_ref)] // serde requires &T signature
const fn is_false(b: &bool) -> bool {
    !*b
}

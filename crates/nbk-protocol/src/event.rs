use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::kernel_info::KernelInfo;

/// Identifies an event kind (e.g., `CommandSucceeded`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub const ASSEMBLY_PRODUCED: &'static str = "AssemblyProduced";
    pub const CODE_SUBMISSION_RECEIVED: &'static str = "CodeSubmissionReceived";
    pub const COMMAND_FAILED: &'static str = "CommandFailed";
    pub const COMMAND_SUCCEEDED: &'static str = "CommandSucceeded";
    pub const COMPLETE_CODE_SUBMISSION_RECEIVED: &'static str = "CompleteCodeSubmissionReceived";
    pub const COMPLETIONS_PRODUCED: &'static str = "CompletionsProduced";
    pub const DIAGNOSTICS_PRODUCED: &'static str = "DiagnosticsProduced";
    pub const DISPLAYED_VALUE_PRODUCED: &'static str = "DisplayedValueProduced";
    pub const DISPLAYED_VALUE_UPDATED: &'static str = "DisplayedValueUpdated";
    pub const DOCUMENT_OPENED: &'static str = "DocumentOpened";
    pub const ERROR_PRODUCED: &'static str = "ErrorProduced";
    pub const HOVER_TEXT_PRODUCED: &'static str = "HoverTextProduced";
    pub const INCOMPLETE_CODE_SUBMISSION_RECEIVED: &'static str =
        "IncompleteCodeSubmissionReceived";
    pub const INPUT_PRODUCED: &'static str = "InputProduced";
    pub const INPUTS_PRODUCED: &'static str = "InputsProduced";
    pub const KERNEL_EXTENSION_LOADED: &'static str = "KernelExtensionLoaded";
    pub const KERNEL_INFO_PRODUCED: &'static str = "KernelInfoProduced";
    pub const KERNEL_READY: &'static str = "KernelReady";
    pub const PACKAGE_ADDED: &'static str = "PackageAdded";
    pub const PROJECT_OPENED: &'static str = "ProjectOpened";
    pub const RETURN_VALUE_PRODUCED: &'static str = "ReturnValueProduced";
    pub const SIGNATURE_HELP_PRODUCED: &'static str = "SignatureHelpProduced";
    pub const STANDARD_ERROR_VALUE_PRODUCED: &'static str = "StandardErrorValueProduced";
    pub const STANDARD_OUTPUT_VALUE_PRODUCED: &'static str = "StandardOutputValueProduced";
    pub const VALUE_INFOS_PRODUCED: &'static str = "ValueInfosProduced";
    pub const VALUE_PRODUCED: &'static str = "ValueProduced";

    pub const CATALOG: &'static [&'static str] = &[
        Self::ASSEMBLY_PRODUCED,
        Self::CODE_SUBMISSION_RECEIVED,
        Self::COMMAND_FAILED,
        Self::COMMAND_SUCCEEDED,
        Self::COMPLETE_CODE_SUBMISSION_RECEIVED,
        Self::COMPLETIONS_PRODUCED,
        Self::DIAGNOSTICS_PRODUCED,
        Self::DISPLAYED_VALUE_PRODUCED,
        Self::DISPLAYED_VALUE_UPDATED,
        Self::DOCUMENT_OPENED,
        Self::ERROR_PRODUCED,
        Self::HOVER_TEXT_PRODUCED,
        Self::INCOMPLETE_CODE_SUBMISSION_RECEIVED,
        Self::INPUT_PRODUCED,
        Self::INPUTS_PRODUCED,
        Self::KERNEL_EXTENSION_LOADED,
        Self::KERNEL_INFO_PRODUCED,
        Self::KERNEL_READY,
        Self::PACKAGE_ADDED,
        Self::PROJECT_OPENED,
        Self::RETURN_VALUE_PRODUCED,
        Self::SIGNATURE_HELP_PRODUCED,
        Self::STANDARD_ERROR_VALUE_PRODUCED,
        Self::STANDARD_OUTPUT_VALUE_PRODUCED,
        Self::VALUE_INFOS_PRODUCED,
        Self::VALUE_PRODUCED,
    ];

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `CommandSucceeded` and `CommandFailed` end a command's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.as_str(), Self::COMMAND_SUCCEEDED | Self::COMMAND_FAILED)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for EventType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Typed view of an event payload. Implemented by the payloads the kernel core
/// itself produces or inspects; everything else travels as raw JSON.
pub trait KernelEventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSucceeded {}

impl KernelEventPayload for CommandSucceeded {
    const EVENT_TYPE: &'static str = EventType::COMMAND_SUCCEEDED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailed {
    #[serde(default = "CommandFailed::default_message")]
    pub message: String,
}

impl CommandFailed {
    pub const DEFAULT_MESSAGE: &'static str = "Command Failed";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn default_message() -> String {
        Self::DEFAULT_MESSAGE.to_string()
    }
}

impl Default for CommandFailed {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MESSAGE)
    }
}

impl KernelEventPayload for CommandFailed {
    const EVENT_TYPE: &'static str = EventType::COMMAND_FAILED;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfoProduced {
    pub kernel_info: KernelInfo,
}

impl KernelEventPayload for KernelInfoProduced {
    const EVENT_TYPE: &'static str = EventType::KERNEL_INFO_PRODUCED;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelReady {
    #[serde(default)]
    pub kernel_infos: Vec<KernelInfo>,
}

impl KernelEventPayload for KernelReady {
    const EVENT_TYPE: &'static str = EventType::KERNEL_READY;
}

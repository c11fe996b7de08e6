use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a command kind (e.g., `SubmitCode`). Kernels may register handlers for
/// names outside the built-in catalog.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandType(String);

impl CommandType {
    pub const ADD_PACKAGE: &'static str = "AddPackage";
    pub const ADD_PACKAGE_SOURCE: &'static str = "AddPackageSource";
    pub const CANCEL: &'static str = "Cancel";
    pub const COMPILE_PROJECT: &'static str = "CompileProject";
    pub const DISPLAY_ERROR: &'static str = "DisplayError";
    pub const DISPLAY_VALUE: &'static str = "DisplayValue";
    pub const IMPORT_DOCUMENT: &'static str = "ImportDocument";
    pub const OPEN_DOCUMENT: &'static str = "OpenDocument";
    pub const OPEN_PROJECT: &'static str = "OpenProject";
    pub const QUIT: &'static str = "Quit";
    pub const REQUEST_COMPLETIONS: &'static str = "RequestCompletions";
    pub const REQUEST_DIAGNOSTICS: &'static str = "RequestDiagnostics";
    pub const REQUEST_HOVER_TEXT: &'static str = "RequestHoverText";
    pub const REQUEST_INPUT: &'static str = "RequestInput";
    pub const REQUEST_INPUTS: &'static str = "RequestInputs";
    pub const REQUEST_KERNEL_INFO: &'static str = "RequestKernelInfo";
    pub const REQUEST_SIGNATURE_HELP: &'static str = "RequestSignatureHelp";
    pub const REQUEST_VALUE: &'static str = "RequestValue";
    pub const REQUEST_VALUE_INFOS: &'static str = "RequestValueInfos";
    pub const SEND_EDITABLE_CODE: &'static str = "SendEditableCode";
    pub const SEND_VALUE: &'static str = "SendValue";
    pub const SUBMIT_CODE: &'static str = "SubmitCode";
    pub const UPDATE_DISPLAYED_VALUE: &'static str = "UpdateDisplayedValue";

    pub const CATALOG: &'static [&'static str] = &[
        Self::ADD_PACKAGE,
        Self::ADD_PACKAGE_SOURCE,
        Self::CANCEL,
        Self::COMPILE_PROJECT,
        Self::DISPLAY_ERROR,
        Self::DISPLAY_VALUE,
        Self::IMPORT_DOCUMENT,
        Self::OPEN_DOCUMENT,
        Self::OPEN_PROJECT,
        Self::QUIT,
        Self::REQUEST_COMPLETIONS,
        Self::REQUEST_DIAGNOSTICS,
        Self::REQUEST_HOVER_TEXT,
        Self::REQUEST_INPUT,
        Self::REQUEST_INPUTS,
        Self::REQUEST_KERNEL_INFO,
        Self::REQUEST_SIGNATURE_HELP,
        Self::REQUEST_VALUE,
        Self::REQUEST_VALUE_INFOS,
        Self::SEND_EDITABLE_CODE,
        Self::SEND_VALUE,
        Self::SUBMIT_CODE,
        Self::UPDATE_DISPLAYED_VALUE,
    ];

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Language-service requests that kernels commonly do not implement; dispatching
    /// one to a kernel without a handler completes quietly instead of failing.
    pub fn is_language_service_request(&self) -> bool {
        matches!(
            self.as_str(),
            Self::REQUEST_COMPLETIONS
                | Self::REQUEST_SIGNATURE_HELP
                | Self::REQUEST_DIAGNOSTICS
                | Self::REQUEST_HOVER_TEXT
        )
    }
}

impl From<&str> for CommandType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CommandType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for CommandType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for CommandType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for CommandType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CommandType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Command payload: routing fields shared by every command plus the type-specific
/// fields, which this crate treats as opaque JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kernel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_uri: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl KernelCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targeting(kernel_name: impl Into<String>) -> Self {
        Self {
            target_kernel_name: Some(kernel_name.into()),
            ..Self::default()
        }
    }

    pub fn with_target_kernel_name(mut self, kernel_name: impl Into<String>) -> Self {
        self.target_kernel_name = Some(kernel_name.into());
        self
    }

    pub fn with_destination_uri(mut self, uri: impl Into<String>) -> Self {
        self.destination_uri = Some(uri.into());
        self
    }

    pub fn with_origin_uri(mut self, uri: impl Into<String>) -> Self {
        self.origin_uri = Some(uri.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routing_fields_serialize_in_camel_case_next_to_payload() {
        let command = KernelCommand::targeting("js")
            .with_destination_uri("kernel://remote/js")
            .with_field("code", "1 + 1");
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({
                "targetKernelName": "js",
                "destinationUri": "kernel://remote/js",
                "code": "1 + 1"
            })
        );
        let back: KernelCommand = serde_json::from_value(value).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn language_service_requests_are_recognized() {
        assert!(CommandType::from(CommandType::REQUEST_HOVER_TEXT).is_language_service_request());
        assert!(!CommandType::from(CommandType::SUBMIT_CODE).is_language_service_request());
    }
}

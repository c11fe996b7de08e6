use serde::{Deserialize, Serialize};

use crate::command::CommandType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommandInfo {
    pub name: CommandType,
}

impl KernelCommandInfo {
    pub fn new(name: impl Into<CommandType>) -> Self {
        Self { name: name.into() }
    }
}

/// Descriptor published by every kernel in `KernelInfoProduced` and `KernelReady`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub local_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<String>,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub is_composite: bool,
    #[serde(default)]
    pub supported_kernel_commands: Vec<KernelCommandInfo>,
}

impl KernelInfo {
    pub fn new(local_name: impl Into<String>, uri: impl Into<String>) -> Self {
        let local_name = local_name.into();
        Self {
            display_name: local_name.clone(),
            local_name,
            aliases: Vec::new(),
            language_name: None,
            language_version: None,
            description: None,
            uri: uri.into(),
            remote_uri: None,
            is_proxy: false,
            is_composite: false,
            supported_kernel_commands: Vec::new(),
        }
    }

    pub fn add_aliases<I, S>(&mut self, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for alias in aliases {
            let alias = alias.into();
            if !self.aliases.contains(&alias) {
                self.aliases.push(alias);
            }
        }
    }

    pub fn supports(&self, command_type: &CommandType) -> bool {
        self.supported_kernel_commands
            .iter()
            .any(|info| &info.name == command_type)
    }

    /// Adds `command_type` to the supported list; returns false when it was already there.
    pub fn add_supported_command(&mut self, command_type: &CommandType) -> bool {
        if self.supports(command_type) {
            return false;
        }
        self.supported_kernel_commands
            .push(KernelCommandInfo::new(command_type.clone()));
        true
    }

    /// Folds a remote kernel's descriptor into this (proxy) descriptor.
    pub fn merge_from_remote(&mut self, remote: &KernelInfo) {
        if remote.language_name.is_some() {
            self.language_name = remote.language_name.clone();
        }
        if remote.language_version.is_some() {
            self.language_version = remote.language_version.clone();
        }
        self.display_name = remote.display_name.clone();
        if self.description.as_deref().is_none_or(str::is_empty) {
            self.description = remote.description.clone();
        }
        for command in &remote.supported_kernel_commands {
            self.add_supported_command(&command.name);
        }
    }
}

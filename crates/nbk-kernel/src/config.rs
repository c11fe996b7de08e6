use nbk_protocol::CommandType;

pub const DEFAULT_HOST_URI: &str = "kernel://local";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// URI the host's composite kernel is addressed by; children live beneath it.
    pub uri: String,
    /// Command types that are always queued by the host scheduler, even when idle.
    pub trampoline_commands: Vec<CommandType>,
    /// Whether `connect` forwards every kernel event through the default connector.
    pub forward_kernel_events: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_HOST_URI.to_string(),
            trampoline_commands: vec![
                CommandType::from(CommandType::REQUEST_INPUT),
                CommandType::from(CommandType::SEND_EDITABLE_CODE),
            ],
            forward_kernel_events: true,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `NBK_HOST_URI` and `NBK_TRAMPOLINE_COMMANDS` (comma separated).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(uri) = lookup("NBK_HOST_URI").filter(|uri| !uri.trim().is_empty()) {
            config.uri = uri.trim().to_string();
        }
        if let Some(commands) = lookup("NBK_TRAMPOLINE_COMMANDS") {
            config.trampoline_commands = commands
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(CommandType::from)
                .collect();
        }
        config
    }

    pub fn must_trampoline(&self, command_type: &CommandType) -> bool {
        self.trampoline_commands.contains(command_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let config = HostConfig::from_lookup(|key| match key {
            "NBK_HOST_URI" => Some("kernel://vscode".into()),
            "NBK_TRAMPOLINE_COMMANDS" => Some("RequestInput, SubmitCode,".into()),
            _ => None,
        });
        assert_eq!(config.uri, "kernel://vscode");
        assert!(config.must_trampoline(&CommandType::from(CommandType::SUBMIT_CODE)));
        assert!(!config.must_trampoline(&CommandType::from(CommandType::SEND_EDITABLE_CODE)));
    }

    #[test]
    fn defaults_trampoline_interactive_commands() {
        let config = HostConfig::from_lookup(|_| None);
        assert_eq!(config.uri, DEFAULT_HOST_URI);
        assert!(config.must_trampoline(&CommandType::from(CommandType::REQUEST_INPUT)));
        assert!(config.forward_kernel_events);
    }
}

//! Global CLI options.

use clap::Args;
use nbk_kernel::HostConfig;

#[derive(Args, Debug, Clone)]
pub struct HostOpts {
    /// URI the host is addressed by (env: NBK_HOST_URI, default: kernel://local)
    #[arg(long, global = true, env = "NBK_HOST_URI")]
    pub host_uri: Option<String>,

    /// Name of the root composite kernel (env: NBK_KERNEL_NAME)
    #[arg(long, global = true, env = "NBK_KERNEL_NAME", default_value = "root")]
    pub kernel_name: String,
}

impl HostOpts {
    pub fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::from_env();
        if let Some(uri) = &self.host_uri {
            config.uri = uri.clone();
        }
        config
    }
}

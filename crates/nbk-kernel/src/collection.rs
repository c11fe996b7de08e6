use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use nbk_protocol::create_kernel_uri;

use crate::error::KernelError;
use crate::kernel::Kernel;

/// Child registry of a [`CompositeKernel`](crate::CompositeKernel), indexed by local
/// name, alias and URI. Proxies are also indexed by their remote URI.
#[derive(Default)]
pub struct KernelCollection {
    kernels: IndexMap<String, Arc<dyn Kernel>>,
    by_alias: HashMap<String, Arc<dyn Kernel>>,
    by_uri: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when `name` or any of `aliases` is already taken by a name or alias.
    pub fn validate(&self, name: &str, aliases: &[String]) -> Result<(), KernelError> {
        if self.by_alias.contains_key(name) {
            return Err(KernelError::DuplicateKernelName(name.to_string()));
        }
        for alias in aliases {
            if alias != name && self.by_alias.contains_key(alias) {
                return Err(KernelError::DuplicateAlias(alias.clone()));
            }
        }
        Ok(())
    }

    /// Adds `kernel` under its local name and the aliases in its descriptor.
    pub fn add(&mut self, kernel: Arc<dyn Kernel>) -> Result<(), KernelError> {
        let info = kernel.kernel_info();
        self.validate(&info.local_name, &info.aliases)?;
        self.kernels.insert(info.local_name.clone(), kernel.clone());
        self.by_alias.insert(info.local_name.clone(), kernel.clone());
        for alias in &info.aliases {
            self.by_alias.insert(alias.clone(), kernel.clone());
        }
        self.index_uris(&kernel);
        Ok(())
    }

    /// Re-addresses every child as `{host_uri}/{local_name}` and rebuilds the URI index.
    pub fn notify_that_host_was_set(&mut self, host_uri: &str) {
        let base = host_uri.trim_end_matches('/');
        for (name, kernel) in &self.kernels {
            kernel.core().set_uri(format!("{base}/{name}"));
        }
        self.by_uri.clear();
        let kernels: Vec<_> = self.kernels.values().cloned().collect();
        for kernel in &kernels {
            self.index_uris(kernel);
        }
    }

    fn index_uris(&mut self, kernel: &Arc<dyn Kernel>) {
        let info = kernel.kernel_info();
        self.by_uri
            .insert(create_kernel_uri(&info.uri), kernel.clone());
        if let Some(remote) = info.remote_uri.as_deref() {
            self.by_uri
                .insert(create_kernel_uri(remote), kernel.clone());
        }
    }

    pub fn try_get_by_alias(&self, alias: &str) -> Option<Arc<dyn Kernel>> {
        self.by_alias.get(alias).cloned()
    }

    pub fn try_get_by_uri(&self, uri: &str) -> Option<Arc<dyn Kernel>> {
        self.by_uri.get(&create_kernel_uri(uri)).cloned()
    }

    /// The only child, when there is exactly one.
    pub fn single(&self) -> Option<Arc<dyn Kernel>> {
        if self.kernels.len() == 1 {
            self.kernels.values().next().cloned()
        } else {
            None
        }
    }

    pub fn count(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Kernel>> {
        self.kernels.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimpleKernel;

    #[test]
    fn names_and_aliases_share_one_namespace() {
        let mut collection = KernelCollection::new();
        let csharp = SimpleKernel::new("csharp");
        csharp.update_info(|info| info.add_aliases(["cs"]));
        collection.add(csharp).unwrap();

        let err = collection.add(SimpleKernel::new("cs")).unwrap_err();
        assert_eq!(err.to_string(), "kernel with name cs already exists");

        let fsharp = SimpleKernel::new("fsharp");
        fsharp.update_info(|info| info.add_aliases(["csharp"]));
        let err = collection.add(fsharp).unwrap_err();
        assert_eq!(err.to_string(), "kernel with alias csharp already exists");
        assert_eq!(collection.count(), 1);
    }

    #[test]
    fn host_assignment_readdresses_children() {
        let mut collection = KernelCollection::new();
        collection.add(SimpleKernel::new("js")).unwrap();
        assert!(collection.try_get_by_uri("kernel://local/js").is_some());

        collection.notify_that_host_was_set("kernel://vscode/");
        assert!(collection.try_get_by_uri("kernel://local/js").is_none());
        let js = collection.try_get_by_uri("kernel://vscode/js").unwrap();
        assert_eq!(js.uri(), "kernel://vscode/js");
        assert!(collection.single().is_some());
    }
}

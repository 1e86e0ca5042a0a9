use std::sync::Arc;

use crate::config::Config;
use crate::dlfcn::ModuleRegistry;
use crate::host::MemHost;
use crate::platform::Host;
use crate::sockfd::SocketTable;

/// Per-process emulation state: the platform, the socket-descriptor table,
/// the global module list and the directory stream counter.
///
/// Methods take `&mut self`; callers that share one `Process` between
/// threads wrap it in a lock, as the `w32_` surface does.
pub struct Process {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) config: Config,
    pub(crate) sockets: SocketTable,
    pub(crate) modules: ModuleRegistry,
    next_dir_id: u64,
}

impl Process {
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let sockets = SocketTable::new(&config.descriptors);
        Self { host, config, sockets, modules: ModuleRegistry::new(), next_dir_id: 0 }
    }

    /// Process over a fresh [`MemHost`] with default configuration.
    pub fn in_memory() -> (Self, Arc<MemHost>) {
        let host = Arc::new(MemHost::new());
        (Self::new(host.clone(), Config::default()), host)
    }

    /// Process over the native platform.
    #[cfg(windows)]
    pub fn native(config: Config) -> Self {
        Self::new(Arc::new(crate::win32::Win32Host::new()), config)
    }

    pub fn host(&self) -> &dyn Host {
        &*self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketTable {
        &mut self.sockets
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub(crate) fn next_dir_id(&mut self) -> u64 {
        self.next_dir_id += 1;
        self.next_dir_id
    }
}

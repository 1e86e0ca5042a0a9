//! `dlopen` and friends over `LoadLibrary`.
//!
//! Modules opened with [`RTLD_GLOBAL`] are kept, with a reference count, in
//! load order; `dlsym` on the program handle searches them after the program
//! itself.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::path::is_sep;
use crate::platform::{ModuleHandle, ModuleLoader};
use crate::process::Process;

pub const RTLD_LAZY: i32 = 0x01;
pub const RTLD_NOW: i32 = 0x02;
pub const RTLD_GLOBAL: i32 = 0x04;
pub const RTLD_LOCAL: i32 = 0x08;

thread_local! {
    static DLERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_dlerror(message: String) {
    log::debug!("dlerror: {message}");
    DLERROR.with(|cell| *cell.borrow_mut() = Some(message));
}

/// Last module error of the calling thread. The message stays until the
/// next failure replaces it.
pub fn dlerror() -> Option<String> {
    DLERROR.with(|cell| cell.borrow().clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalModule {
    pub handle: ModuleHandle,
    pub references: usize,
    pub name: String,
}

/// Global module list; the mutex is the process-wide module lock.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<GlobalModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GlobalModule>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference on `handle`, appending it on first use.
    pub fn acquire(&self, handle: ModuleHandle, name: &str) -> Result<()> {
        let mut modules = self.lock();
        if let Some(module) = modules.iter_mut().find(|m| m.handle == handle) {
            module.references += 1;
            return Ok(());
        }
        modules.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        modules.push(GlobalModule { handle, references: 1, name: name.to_string() });
        Ok(())
    }

    /// Drop a reference; returns true when the record went away.
    pub fn release(&self, handle: ModuleHandle) -> bool {
        let mut modules = self.lock();
        let Some(index) = modules.iter().position(|m| m.handle == handle) else {
            return false;
        };
        modules[index].references -= 1;
        if modules[index].references == 0 {
            modules.remove(index);
            return true;
        }
        false
    }

    pub fn find(&self, handle: ModuleHandle) -> Option<GlobalModule> {
        self.lock().iter().find(|m| m.handle == handle).cloned()
    }

    /// Handles in load order.
    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.lock().iter().map(|m| m.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// First global module exporting `name`, in load order.
    fn search<L>(&self, loader: &L, name: &str) -> Option<usize>
    where
        L: ModuleLoader + ?Sized,
    {
        self.lock().iter().find_map(|m| loader.symbol(m.handle, name))
    }
}

/// Backslash delimited form of `file`; separator runs collapse except at the
/// very start, so `//server/x` keeps its UNC prefix.
pub fn module_path(file: &str) -> String {
    let mut path = String::with_capacity(file.len());
    let mut previous_sep = false;
    for (index, c) in file.chars().enumerate() {
        if is_sep(c) {
            if !(previous_sep && index > 1) {
                path.push('\\');
            }
            previous_sep = true;
        } else {
            path.push(c);
            previous_sep = false;
        }
    }
    path
}

impl Process {
    /// `dlopen`; `None` names the running program.
    pub fn dlopen(&mut self, file: Option<&str>, mode: i32) -> Result<ModuleHandle> {
        let Some(file) = file else {
            return Ok(self.host.program_module());
        };
        if file.is_empty() {
            set_dlerror("missing file".to_string());
            return Err(Error::InvalidArgument("missing file"));
        }

        let path = module_path(file);
        let handle = self.host.load_library(&path).map_err(|err| {
            let err = Error::Module { file: path.clone(), reason: err.to_string() };
            set_dlerror(err.to_string());
            err
        })?;

        if mode & RTLD_GLOBAL != 0 {
            if self.modules.acquire(handle, &path).is_err() {
                let err = Error::Module { file: path.clone(), reason: "memory allocation error".into() };
                set_dlerror(err.to_string());
                if let Err(native) = self.host.free_library(handle) {
                    log::warn!("{path}: release after failed registration: {native}");
                }
                return Err(err);
            }
        }
        log::debug!("dlopen({path}) = {handle:#x}");
        Ok(handle)
    }

    pub fn dlsym(&self, handle: ModuleHandle, name: &str) -> Option<usize> {
        self.host.symbol(handle, name).or_else(|| {
            (handle == self.host.program_module() && !self.modules.is_empty())
                .then(|| self.modules.search(&*self.host, name))
                .flatten()
        })
    }

    pub fn dlclose(&mut self, handle: ModuleHandle) -> Result<()> {
        if let Err(native) = self.host.free_library(handle) {
            let err = match self.modules.find(handle) {
                Some(module) => Error::Module { file: module.name, reason: native.to_string() },
                None => Error::Io(native.to_string()),
            };
            set_dlerror(match &err {
                Error::Io(reason) => reason.clone(),
                other => other.to_string(),
            });
            return Err(err);
        }
        if self.modules.release(handle) {
            log::debug!("dlclose({handle:#x}): removed from the global list");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_path() {
        assert_eq!(module_path("c:/lib//sub\\\\m.dll"), "c:\\lib\\sub\\m.dll");
        assert_eq!(module_path("//server/share/m.dll"), "\\\\server\\share\\m.dll");
        assert_eq!(module_path("m.dll"), "m.dll");
    }

    #[test]
    fn test_registry_refcounts() {
        let registry = ModuleRegistry::new();
        registry.acquire(0x10, "a.dll").unwrap();
        registry.acquire(0x20, "b.dll").unwrap();
        registry.acquire(0x10, "a.dll").unwrap();
        assert_eq!(registry.handles(), vec![0x10, 0x20]);
        assert_eq!(registry.find(0x10).unwrap().references, 2);

        assert!(!registry.release(0x10));
        assert!(registry.release(0x10));
        assert_eq!(registry.handles(), vec![0x20]);
        assert!(!registry.release(0x99));
    }

    #[test]
    fn test_dlerror_is_per_thread() {
        set_dlerror("x.dll : gone".into());
        assert_eq!(dlerror().as_deref(), Some("x.dll : gone"));
        assert_eq!(std::thread::spawn(dlerror).join().unwrap(), None);
    }
}

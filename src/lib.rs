#![allow(clippy::new_without_default)]

//! POSIX directory streams, socket descriptors and dynamic modules emulated
//! over the Win32 API.
//!
//! The native platform is reached through the traits in [`platform`]; the
//! [`win32`] backend talks to Windows, [`host::MemHost`] keeps everything in
//! memory so the emulation runs (and is tested) anywhere.

pub mod config;
pub mod dirent;
pub mod dlfcn;
pub mod error;
pub mod ffi;
pub mod filesystem;
pub mod host;
pub mod path;
pub mod platform;
pub mod process;
pub mod reparse;
pub mod sockaddr;
pub mod socket;
pub mod sockfd;
pub mod system;
mod unc;

#[cfg(windows)]
pub mod win32;

pub use config::{Config, DescriptorLimits};
pub use dirent::{alphasort, versionsort, DirEntry, DirStream, Dirent};
pub use dlfcn::{dlerror, ModuleRegistry, RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};
pub use error::{Error, Result};
pub use filesystem::{Inode, InodeKind, MemFileSystem};
pub use host::MemHost;
pub use platform::{
    AddrHints, AddrInfo, FileAttributes, Host, HostEntry, NativeError, PollEvents, PollFd, RawSocket,
};
pub use process::Process;
pub use sockfd::{Descriptor, SocketTable};

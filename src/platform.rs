//! The native platform as seen by the emulation layer.
//!
//! Each trait is the narrowest slice of Win32 that one subsystem consumes:
//! [`DirectoryApi`] for directory streams, [`SocketApi`] and [`CrtApi`] for the
//! socket-descriptor table, [`ModuleLoader`] for `dlopen`.

use core::fmt;
use std::net::{IpAddr, SocketAddr};

use bitflags::bitflags;

/// Native socket handle (`SOCKET`, pointer sized on Windows).
pub type RawSocket = u64;

/// Native module handle (`HMODULE`).
pub type ModuleHandle = usize;

bitflags! {
    /// `FILE_ATTRIBUTE_*` bits as reported by the directory search.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        /// Volume label pseudo-entry; undocumented but still returned.
        const VOLUME = 0x0000_0008;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const DEVICE = 0x0000_0040;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
    }
}

bitflags! {
    /// File-system flags from the volume information query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VolumeFlags: u32 {
        const CASE_SENSITIVE = 0x0000_0001;
        const CASE_PRESERVED = 0x0000_0002;
        const UNICODE_ON_DISK = 0x0000_0004;
        const PERSISTENT_ACLS = 0x0000_0008;
        const SUPPORTS_REPARSE_POINTS = 0x0000_0080;
    }
}

bitflags! {
    /// `WSAPoll` event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: i16 {
        const ERR = 0x0001;
        const HUP = 0x0002;
        const NVAL = 0x0004;
        const WRNORM = 0x0010;
        const OUT = 0x0010;
        const RDNORM = 0x0100;
        const RDBAND = 0x0200;
        const IN = 0x0300;
        const PRI = 0x0400;
    }
}

/// Win32 / Winsock failure, reduced to the cases the emulation tells apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeError {
    FileNotFound,
    PathNotFound,
    TooManyOpenFiles,
    AccessDenied,
    InvalidHandle,
    NotEnoughMemory,
    InvalidDrive,
    NoMoreFiles,
    SharingViolation,
    NotSupported,
    MoreData,
    NotAReparsePoint,
    NotInitialised,
    WouldBlock,
    NotSocket,
    NotConnected,
    Interrupted,
    InvalidArgument,
    Fault,
    NoProtocolOption,
    AddressInUse,
    ConnectionRefused,
    HostNotFound,
    TryAgain,
    NoRecovery,
    NoData,
    Other(u32),
}

impl NativeError {
    /// Classify a `GetLastError()` / `WSAGetLastError()` value.
    pub fn from_code(code: u32) -> Self {
        match code {
            2 => NativeError::FileNotFound,
            3 => NativeError::PathNotFound,
            4 | 10024 => NativeError::TooManyOpenFiles,
            5 | 10013 => NativeError::AccessDenied,
            6 | 10009 => NativeError::InvalidHandle,
            8 | 14 | 10055 => NativeError::NotEnoughMemory,
            15 => NativeError::InvalidDrive,
            18 => NativeError::NoMoreFiles,
            32 => NativeError::SharingViolation,
            50 | 10045 => NativeError::NotSupported,
            234 => NativeError::MoreData,
            4390 => NativeError::NotAReparsePoint,
            10093 => NativeError::NotInitialised,
            10035 => NativeError::WouldBlock,
            10038 => NativeError::NotSocket,
            10057 => NativeError::NotConnected,
            10004 => NativeError::Interrupted,
            87 | 10022 => NativeError::InvalidArgument,
            10014 => NativeError::Fault,
            10042 => NativeError::NoProtocolOption,
            10048 => NativeError::AddressInUse,
            10061 => NativeError::ConnectionRefused,
            11001 => NativeError::HostNotFound,
            11002 => NativeError::TryAgain,
            11003 => NativeError::NoRecovery,
            11004 => NativeError::NoData,
            other => NativeError::Other(other),
        }
    }

    /// Winsock code of a socket or lookup failure; Win32 code otherwise.
    pub fn code(self) -> u32 {
        match self {
            NativeError::FileNotFound => 2,
            NativeError::PathNotFound => 3,
            NativeError::TooManyOpenFiles => 10024,
            NativeError::AccessDenied => 10013,
            NativeError::InvalidHandle => 10009,
            NativeError::NotEnoughMemory => 10055,
            NativeError::InvalidDrive => 15,
            NativeError::NoMoreFiles => 18,
            NativeError::SharingViolation => 32,
            NativeError::NotSupported => 10045,
            NativeError::MoreData => 234,
            NativeError::NotAReparsePoint => 4390,
            NativeError::NotInitialised => 10093,
            NativeError::WouldBlock => 10035,
            NativeError::NotSocket => 10038,
            NativeError::NotConnected => 10057,
            NativeError::Interrupted => 10004,
            NativeError::InvalidArgument => 10022,
            NativeError::Fault => 10014,
            NativeError::NoProtocolOption => 10042,
            NativeError::AddressInUse => 10048,
            NativeError::ConnectionRefused => 10061,
            NativeError::HostNotFound => 11001,
            NativeError::TryAgain => 11002,
            NativeError::NoRecovery => 11003,
            NativeError::NoData => 11004,
            NativeError::Other(code) => code,
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::FileNotFound => f.write_str("the system cannot find the file specified"),
            NativeError::PathNotFound => f.write_str("the system cannot find the path specified"),
            NativeError::TooManyOpenFiles => f.write_str("too many open files"),
            NativeError::AccessDenied => f.write_str("access is denied"),
            NativeError::InvalidHandle => f.write_str("the handle is invalid"),
            NativeError::NotEnoughMemory => f.write_str("not enough memory"),
            NativeError::InvalidDrive => f.write_str("the system cannot find the drive specified"),
            NativeError::NoMoreFiles => f.write_str("there are no more files"),
            NativeError::SharingViolation => f.write_str("sharing violation"),
            NativeError::NotSupported => f.write_str("the request is not supported"),
            NativeError::MoreData => f.write_str("more data is available"),
            NativeError::NotAReparsePoint => f.write_str("not a reparse point"),
            NativeError::NotInitialised => f.write_str("winsock not initialised"),
            NativeError::WouldBlock => f.write_str("operation would block"),
            NativeError::NotSocket => f.write_str("not a socket"),
            NativeError::NotConnected => f.write_str("socket is not connected"),
            NativeError::Interrupted => f.write_str("interrupted function call"),
            NativeError::InvalidArgument => f.write_str("invalid argument"),
            NativeError::Fault => f.write_str("bad address"),
            NativeError::NoProtocolOption => f.write_str("bad protocol option"),
            NativeError::AddressInUse => f.write_str("address already in use"),
            NativeError::ConnectionRefused => f.write_str("connection refused"),
            NativeError::HostNotFound => f.write_str("host not found"),
            NativeError::TryAgain => f.write_str("nonauthoritative host not found"),
            NativeError::NoRecovery => f.write_str("nonrecoverable error"),
            NativeError::NoData => f.write_str("valid name, no data record of requested type"),
            NativeError::Other(code) => write!(f, "system error {code}"),
        }
    }
}

/// One record of the bulk directory search (`WIN32_FIND_DATA`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    pub name: String,
    pub attributes: FileAttributes,
    pub size: u64,
    /// Creation time, seconds since the Unix epoch.
    pub created: i64,
    /// Last write time, seconds since the Unix epoch.
    pub modified: i64,
    /// Reparse tag (`dwReserved0`); meaningful only with `REPARSE_POINT`.
    pub reparse_tag: u32,
}

/// Search results; dropping the iterator closes the native search handle.
pub type FindIter<'a> = Box<dyn Iterator<Item = Result<FindData, NativeError>> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    Disk,
    PrintQueue,
    Device,
    Ipc,
    Other(u32),
}

impl ShareKind {
    /// Decode `shi_type`, ignoring the `STYPE_SPECIAL`/`STYPE_TEMPORARY` bits.
    pub fn from_type(share_type: u32) -> Self {
        match share_type & 0x0fff_ffff {
            0 => ShareKind::Disk,
            1 => ShareKind::PrintQueue,
            2 => ShareKind::Device,
            3 => ShareKind::Ipc,
            other => ShareKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub name: String,
    pub kind: ShareKind,
}

/// One page of `NetShareEnum`; `resume` is set while more data remains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharePage {
    pub shares: Vec<ShareInfo>,
    pub resume: Option<u32>,
}

/// Saved Wow64 redirection state, handed back on revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionCookie(pub usize);

pub trait DirectoryApi {
    /// Absolute, backslash delimited form of `path` (`GetFullPathName`).
    fn full_path(&self, path: &str) -> Option<String>;

    fn file_attributes(&self, path: &str) -> Result<FileAttributes, NativeError>;

    /// `FindFirstFile`/`FindNextFile` over `pattern`.
    fn find_files<'a>(&'a self, pattern: &str) -> Result<FindIter<'a>, NativeError>;

    /// Raw `REPARSE_DATA_BUFFER` of the reparse point at `path`.
    fn read_reparse_point(&self, path: &str) -> Result<Vec<u8>, NativeError>;

    /// Mount paths of a `\\?\Volume{guid}\` name.
    fn volume_path_names(&self, volume: &str) -> Result<Vec<String>, NativeError>;

    /// Target of a `.lnk` shell shortcut, when the platform can read one.
    fn read_shortcut(&self, _path: &str) -> Option<String> {
        None
    }

    /// Flags of the volume mounted at `root` (`X:\` or `\\server\share\`).
    fn volume_flags(&self, root: &str) -> Option<VolumeFlags>;

    /// Current drive letter.
    fn current_drive(&self) -> Option<char>;

    fn computer_name(&self) -> Option<String>;

    /// `NetShareEnum`; `server == None` queries the local machine.
    fn enum_shares(&self, server: Option<&str>, resume: u32) -> Result<SharePage, NativeError>;

    /// `None` when redirection could not be disabled.
    fn disable_fs_redirection(&self) -> Option<RedirectionCookie>;

    fn revert_fs_redirection(&self, cookie: RedirectionCookie) -> bool;
}

/// Native socket entry of a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePollFd {
    pub socket: RawSocket,
    pub events: PollEvents,
    pub revents: PollEvents,
}

/// Descriptor entry of a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: i32,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: i32, events: PollEvents) -> Self {
        Self { fd, events, revents: PollEvents::empty() }
    }
}

/// `getaddrinfo` hints; zero fields are unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrHints {
    pub flags: i32,
    pub family: i32,
    pub kind: i32,
    pub protocol: i32,
}

/// One `getaddrinfo` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: i32,
    pub kind: i32,
    pub protocol: i32,
    pub canonical_name: Option<String>,
    pub address: SocketAddr,
}

/// `gethostbyname` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub aliases: Vec<String>,
    pub addresses: Vec<IpAddr>,
}

pub trait SocketApi {
    /// `WSAStartup`.
    fn startup(&self) -> Result<(), NativeError>;
    fn socket(&self, domain: i32, kind: i32, protocol: i32) -> Result<RawSocket, NativeError>;
    fn bind(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError>;
    fn listen(&self, socket: RawSocket, backlog: i32) -> Result<(), NativeError>;
    fn connect(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError>;
    fn accept(&self, listener: RawSocket) -> Result<RawSocket, NativeError>;
    fn peer_name(&self, socket: RawSocket) -> Result<SocketAddr, NativeError>;
    /// `getsockopt` into `value`; returns the option length.
    fn get_option(
        &self,
        socket: RawSocket,
        level: i32,
        name: i32,
        value: &mut [u8],
    ) -> Result<usize, NativeError>;
    fn set_option(&self, socket: RawSocket, level: i32, name: i32, value: &[u8]) -> Result<(), NativeError>;
    fn send(&self, socket: RawSocket, buf: &[u8], flags: i32) -> Result<usize, NativeError>;
    fn recv(&self, socket: RawSocket, buf: &mut [u8], flags: i32) -> Result<usize, NativeError>;
    fn shutdown(&self, socket: RawSocket, how: i32) -> Result<(), NativeError>;
    fn close_socket(&self, socket: RawSocket) -> Result<(), NativeError>;
    fn set_inheritable(&self, socket: RawSocket, inherit: bool);
    fn set_nonblocking(&self, socket: RawSocket, nonblocking: bool) -> Result<(), NativeError>;
    /// `WSAPoll`; returns the number of sockets with events. Like `WSAPoll`,
    /// implementations may reject `PRI` in `events`.
    fn poll(&self, fds: &mut [NativePollFd], timeout_ms: i32) -> Result<usize, NativeError>;
    /// `getaddrinfo`.
    fn addr_info(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrHints,
    ) -> Result<Vec<AddrInfo>, NativeError>;
    /// `gethostbyname`; IPv4 only.
    fn host_by_name(&self, name: &str) -> Result<HostEntry, NativeError>;
}

/// The C runtime's descriptor table.
pub trait CrtApi {
    /// `_open_osfhandle`.
    fn open_osfhandle(&self, handle: RawSocket) -> Option<i32>;
    /// `_get_osfhandle`.
    fn get_osfhandle(&self, fd: i32) -> Option<RawSocket>;
    /// `_close`: release the descriptor; false if it was not open.
    fn close_fd(&self, fd: i32) -> bool;
    /// A socket shows up as a pipe that has no named-pipe information.
    fn is_socket_handle(&self, handle: RawSocket) -> bool;
}

pub trait ModuleLoader {
    fn load_library(&self, path: &str) -> Result<ModuleHandle, NativeError>;
    fn free_library(&self, module: ModuleHandle) -> Result<(), NativeError>;
    fn symbol(&self, module: ModuleHandle, name: &str) -> Option<usize>;
    /// Handle of the running executable (`GetModuleHandle(NULL)`).
    fn program_module(&self) -> ModuleHandle;
}

/// Everything a [`crate::Process`] needs from the platform.
pub trait Host: DirectoryApi + SocketApi + CrtApi + ModuleLoader + Send + Sync {}

impl<T> Host for T where T: DirectoryApi + SocketApi + CrtApi + ModuleLoader + Send + Sync {}

//! In-memory platform: a [`MemFileSystem`] plus loopback sockets, a CRT
//! descriptor table and a module table.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::filesystem::MemFileSystem;
use crate::platform::{
    AddrHints, AddrInfo, CrtApi, DirectoryApi, FileAttributes, FindIter, HostEntry, ModuleHandle,
    ModuleLoader, NativeError, NativePollFd, PollEvents, RawSocket, RedirectionCookie, SharePage,
    SocketApi, VolumeFlags,
};
use crate::sockaddr::{family, AF_UNSPEC};

const ERROR_MOD_NOT_FOUND: u32 = 126;
const WSAESHUTDOWN: u32 = 10058;
const WSAEISCONN: u32 = 10056;
const WSATYPE_NOT_FOUND: u32 = 10109;
const MSG_PEEK: i32 = 0x2;

const SOL_SOCKET: i32 = 0xffff;
const SO_ACCEPTCONN: i32 = 0x0002;
const SO_ERROR: i32 = 0x1007;
const SO_TYPE: i32 = 0x1008;

const SOCK_STREAM: i32 = 1;
const SOCK_DGRAM: i32 = 2;
const IPPROTO_TCP: i32 = 6;
const IPPROTO_UDP: i32 = 17;
const AI_PASSIVE: i32 = 0x1;
const AI_CANONNAME: i32 = 0x2;

/// First ephemeral port handed out by `bind` to port 0 and by `connect`.
const EPHEMERAL_PORTS: u16 = 49152;

const SD_RECEIVE: i32 = 0;
const SD_SEND: i32 = 1;
const SD_BOTH: i32 = 2;

/// Handle returned by `program_module`.
pub const PROGRAM_MODULE: ModuleHandle = 0x0040_0000;

#[derive(Debug, Default)]
struct MemSocket {
    kind: i32,
    local: Option<SocketAddr>,
    listening: bool,
    peer: Option<RawSocket>,
    backlog: VecDeque<RawSocket>,
    inbox: VecDeque<u8>,
    read_shut: bool,
    write_shut: bool,
    nonblocking: bool,
    inheritable: bool,
    /// `SO_ERROR`, set by a failed non-blocking connect.
    pending_error: Option<NativeError>,
    options: HashMap<(i32, i32), Vec<u8>>,
}

#[derive(Debug)]
struct Network {
    started: bool,
    startups: usize,
    next_handle: RawSocket,
    next_port: u16,
    sockets: HashMap<RawSocket, MemSocket>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl Network {
    fn allocate(&mut self, kind: i32) -> RawSocket {
        let handle = self.next_handle;
        self.next_handle += 4;
        self.sockets.insert(handle, MemSocket { kind, inheritable: true, ..MemSocket::default() });
        handle
    }

    fn ephemeral(&mut self, ip: IpAddr) -> SocketAddr {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORTS);
        SocketAddr::new(ip, port)
    }

    /// Listening socket that accepts connections to `addr`.
    fn listener_for(&self, addr: &SocketAddr) -> Option<RawSocket> {
        self.sockets.iter().find_map(|(&handle, s)| {
            let local = s.local.filter(|_| s.listening)?;
            let matches = local.port() == addr.port()
                && (local.ip() == addr.ip() || local.ip().is_unspecified());
            matches.then_some(handle)
        })
    }

    fn lookup(&self, name: &str) -> Option<Vec<IpAddr>> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Some(vec![ip]);
        }
        self.hosts.get(&name.to_ascii_lowercase()).cloned()
    }

    fn get(&self, socket: RawSocket) -> Result<&MemSocket, NativeError> {
        self.sockets.get(&socket).ok_or(NativeError::NotSocket)
    }

    fn get_mut(&mut self, socket: RawSocket) -> Result<&mut MemSocket, NativeError> {
        self.sockets.get_mut(&socket).ok_or(NativeError::NotSocket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrtObject {
    File(RawSocket),
    Socket(RawSocket),
}

#[derive(Debug)]
struct Crt {
    fds: BTreeMap<i32, CrtObject>,
    max_fds: i32,
    next_file_handle: RawSocket,
    refuse_wrapping: bool,
}

impl Crt {
    fn lowest_free(&self) -> Option<i32> {
        (0..self.max_fds).find(|fd| !self.fds.contains_key(fd))
    }
}

#[derive(Debug, Clone)]
struct Module {
    handle: ModuleHandle,
    symbols: HashMap<String, usize>,
    references: usize,
    refuse_unload: bool,
}

#[derive(Debug)]
struct Modules {
    by_path: HashMap<String, Module>,
    program_symbols: HashMap<String, usize>,
    next_handle: ModuleHandle,
    loads: Vec<String>,
}

impl Modules {
    fn by_handle(&mut self, handle: ModuleHandle) -> Option<&mut Module> {
        self.by_path.values_mut().find(|m| m.handle == handle)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Platform backed entirely by memory.
#[derive(Debug)]
pub struct MemHost {
    fs: MemFileSystem,
    net: Mutex<Network>,
    crt: Mutex<Crt>,
    modules: Mutex<Modules>,
}

impl Deref for MemHost {
    type Target = MemFileSystem;

    fn deref(&self) -> &MemFileSystem {
        &self.fs
    }
}

impl MemHost {
    pub fn new() -> Self {
        let mut fds = BTreeMap::new();
        for (fd, handle) in [(0, 0x3), (1, 0x7), (2, 0xb)] {
            fds.insert(fd, CrtObject::File(handle));
        }
        Self {
            fs: MemFileSystem::new(),
            net: Mutex::new(Network {
                started: false,
                startups: 0,
                next_handle: 0x200,
                next_port: EPHEMERAL_PORTS,
                sockets: HashMap::new(),
                hosts: HashMap::from([(
                    "localhost".to_string(),
                    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                )]),
            }),
            crt: Mutex::new(Crt { fds, max_fds: 2048, next_file_handle: 0x1001, refuse_wrapping: false }),
            modules: Mutex::new(Modules {
                by_path: HashMap::new(),
                program_symbols: HashMap::new(),
                next_handle: 0x1000_0000,
                loads: vec![],
            }),
        }
    }

    pub fn fs(&self) -> &MemFileSystem {
        &self.fs
    }

    // --------------------
    // Sockets
    // --------------------

    /// Value of the next socket handle; handles advance in steps of four.
    pub fn set_next_socket(&self, handle: RawSocket) {
        lock(&self.net).next_handle = handle & !3;
    }

    /// Number of `WSAStartup` calls seen.
    pub fn startup_count(&self) -> usize {
        lock(&self.net).startups
    }

    pub fn is_open_socket(&self, socket: RawSocket) -> bool {
        lock(&self.net).sockets.contains_key(&socket)
    }

    pub fn is_inheritable(&self, socket: RawSocket) -> Option<bool> {
        lock(&self.net).sockets.get(&socket).map(|s| s.inheritable)
    }

    pub fn is_nonblocking(&self, socket: RawSocket) -> Option<bool> {
        lock(&self.net).sockets.get(&socket).map(|s| s.nonblocking)
    }

    /// Local address of `socket`, once bound or connected.
    pub fn local_addr(&self, socket: RawSocket) -> Option<SocketAddr> {
        lock(&self.net).sockets.get(&socket).and_then(|s| s.local)
    }

    /// Make `name` resolve to `addresses`.
    pub fn add_host(&self, name: &str, addresses: &[IpAddr]) {
        lock(&self.net).hosts.insert(name.to_ascii_lowercase(), addresses.to_vec());
    }

    // --------------------
    // CRT
    // --------------------

    /// Open a plain file descriptor.
    pub fn open_file(&self) -> Option<i32> {
        let mut crt = lock(&self.crt);
        let fd = crt.lowest_free()?;
        let handle = crt.next_file_handle;
        crt.next_file_handle += 2;
        crt.fds.insert(fd, CrtObject::File(handle));
        Some(fd)
    }

    /// Open a plain file at `fd`, replacing what was there (`dup2`).
    pub fn open_file_at(&self, fd: i32) {
        let mut crt = lock(&self.crt);
        let handle = crt.next_file_handle;
        crt.next_file_handle += 2;
        crt.fds.insert(fd, CrtObject::File(handle));
    }

    /// Number of open CRT descriptors.
    pub fn open_fds(&self) -> usize {
        lock(&self.crt).fds.len()
    }

    pub fn set_max_fds(&self, max: i32) {
        lock(&self.crt).max_fds = max;
    }

    /// Make `_open_osfhandle` fail.
    pub fn refuse_osfhandle(&self, refuse: bool) {
        lock(&self.crt).refuse_wrapping = refuse;
    }

    // --------------------
    // Modules
    // --------------------

    pub fn add_module(&self, path: &str, symbols: &[(&str, usize)]) -> ModuleHandle {
        let mut modules = lock(&self.modules);
        let handle = modules.next_handle;
        modules.next_handle += 0x1_0000;
        modules.by_path.insert(
            path.to_ascii_lowercase(),
            Module {
                handle,
                symbols: symbols.iter().map(|(name, addr)| (name.to_string(), *addr)).collect(),
                references: 0,
                refuse_unload: false,
            },
        );
        handle
    }

    pub fn add_program_symbol(&self, name: &str, address: usize) {
        lock(&self.modules).program_symbols.insert(name.to_string(), address);
    }

    /// Make `FreeLibrary` of `module` fail.
    pub fn refuse_unload(&self, module: ModuleHandle) {
        if let Some(m) = lock(&self.modules).by_handle(module) {
            m.refuse_unload = true;
        }
    }

    /// Native reference count of `module`.
    pub fn module_references(&self, module: ModuleHandle) -> usize {
        lock(&self.modules).by_handle(module).map_or(0, |m| m.references)
    }

    /// Paths handed to `LoadLibrary`, in call order.
    pub fn module_loads(&self) -> Vec<String> {
        lock(&self.modules).loads.clone()
    }
}

impl DirectoryApi for MemHost {
    fn full_path(&self, path: &str) -> Option<String> {
        self.fs.full_path(path)
    }

    fn file_attributes(&self, path: &str) -> Result<FileAttributes, NativeError> {
        self.fs.file_attributes(path)
    }

    fn find_files<'a>(&'a self, pattern: &str) -> Result<FindIter<'a>, NativeError> {
        self.fs.find_files(pattern)
    }

    fn read_reparse_point(&self, path: &str) -> Result<Vec<u8>, NativeError> {
        self.fs.read_reparse_point(path)
    }

    fn volume_path_names(&self, volume: &str) -> Result<Vec<String>, NativeError> {
        self.fs.volume_path_names(volume)
    }

    fn read_shortcut(&self, path: &str) -> Option<String> {
        self.fs.read_shortcut(path)
    }

    fn volume_flags(&self, root: &str) -> Option<VolumeFlags> {
        self.fs.volume_flags(root)
    }

    fn current_drive(&self) -> Option<char> {
        self.fs.current_drive()
    }

    fn computer_name(&self) -> Option<String> {
        self.fs.computer_name()
    }

    fn enum_shares(&self, server: Option<&str>, resume: u32) -> Result<SharePage, NativeError> {
        self.fs.enum_shares(server, resume)
    }

    fn disable_fs_redirection(&self) -> Option<RedirectionCookie> {
        self.fs.disable_fs_redirection()
    }

    fn revert_fs_redirection(&self, cookie: RedirectionCookie) -> bool {
        self.fs.revert_fs_redirection(cookie)
    }
}

impl SocketApi for MemHost {
    fn startup(&self) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        net.startups += 1;
        net.started = true;
        Ok(())
    }

    fn socket(&self, _domain: i32, kind: i32, _protocol: i32) -> Result<RawSocket, NativeError> {
        let mut net = lock(&self.net);
        if !net.started {
            return Err(NativeError::NotInitialised);
        }
        Ok(net.allocate(kind))
    }

    fn bind(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        if net.get(socket)?.local.is_some() {
            return Err(NativeError::InvalidArgument);
        }
        let local = if addr.port() == 0 {
            net.ephemeral(addr.ip())
        } else {
            let taken = net.sockets.values().filter_map(|s| s.local).any(|l| l == *addr);
            if taken {
                return Err(NativeError::AddressInUse);
            }
            *addr
        };
        net.get_mut(socket)?.local = Some(local);
        Ok(())
    }

    fn listen(&self, socket: RawSocket, _backlog: i32) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        let target = net.get_mut(socket)?;
        if target.local.is_none() || target.peer.is_some() {
            return Err(NativeError::InvalidArgument);
        }
        target.listening = true;
        Ok(())
    }

    fn connect(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        let client = net.get(socket)?;
        if client.peer.is_some() {
            return Err(NativeError::Other(WSAEISCONN));
        }
        let (nonblocking, kind, bound) = (client.nonblocking, client.kind, client.local);
        let Some(listener) = net.listener_for(addr) else {
            if nonblocking {
                net.get_mut(socket)?.pending_error = Some(NativeError::ConnectionRefused);
                return Err(NativeError::WouldBlock);
            }
            return Err(NativeError::ConnectionRefused);
        };
        let local = match bound {
            Some(local) => local,
            None => net.ephemeral(addr.ip()),
        };
        let server = net.allocate(kind);
        let accepted = net.get_mut(server)?;
        accepted.local = Some(*addr);
        accepted.peer = Some(socket);
        let client = net.get_mut(socket)?;
        client.local = Some(local);
        client.peer = Some(server);
        net.get_mut(listener)?.backlog.push_back(server);
        Ok(())
    }

    fn accept(&self, listener: RawSocket) -> Result<RawSocket, NativeError> {
        let mut net = lock(&self.net);
        let listener = net.get_mut(listener)?;
        if !listener.listening {
            return Err(NativeError::InvalidArgument);
        }
        listener.backlog.pop_front().ok_or(NativeError::WouldBlock)
    }

    fn peer_name(&self, socket: RawSocket) -> Result<SocketAddr, NativeError> {
        let net = lock(&self.net);
        let peer = net.get(socket)?.peer.ok_or(NativeError::NotConnected)?;
        net.sockets.get(&peer).and_then(|p| p.local).ok_or(NativeError::NotConnected)
    }

    fn get_option(
        &self,
        socket: RawSocket,
        level: i32,
        name: i32,
        value: &mut [u8],
    ) -> Result<usize, NativeError> {
        let mut net = lock(&self.net);
        let target = net.get_mut(socket)?;
        let stored = match (level, name) {
            (SOL_SOCKET, SO_TYPE) => target.kind.to_ne_bytes().to_vec(),
            (SOL_SOCKET, SO_ACCEPTCONN) => i32::from(target.listening).to_ne_bytes().to_vec(),
            (SOL_SOCKET, SO_ERROR) => {
                let code = target.pending_error.take().map_or(0, NativeError::code);
                (code as i32).to_ne_bytes().to_vec()
            }
            key => target.options.get(&key).cloned().ok_or(NativeError::NoProtocolOption)?,
        };
        if value.len() < stored.len() {
            return Err(NativeError::Fault);
        }
        value[..stored.len()].copy_from_slice(&stored);
        Ok(stored.len())
    }

    fn set_option(&self, socket: RawSocket, level: i32, name: i32, value: &[u8]) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        let target = net.get_mut(socket)?;
        if level == SOL_SOCKET && matches!(name, SO_TYPE | SO_ACCEPTCONN | SO_ERROR) {
            return Err(NativeError::NoProtocolOption);
        }
        target.options.insert((level, name), value.to_vec());
        Ok(())
    }

    fn send(&self, socket: RawSocket, buf: &[u8], _flags: i32) -> Result<usize, NativeError> {
        let mut net = lock(&self.net);
        let sender = net.get(socket)?;
        if sender.write_shut {
            return Err(NativeError::Other(WSAESHUTDOWN));
        }
        let peer = sender.peer.ok_or(NativeError::NotConnected)?;
        let receiver = net.get_mut(peer).map_err(|_| NativeError::NotConnected)?;
        if !receiver.read_shut {
            receiver.inbox.extend(buf.iter().copied());
        }
        Ok(buf.len())
    }

    fn recv(&self, socket: RawSocket, buf: &mut [u8], flags: i32) -> Result<usize, NativeError> {
        let mut net = lock(&self.net);
        let peer = net.get(socket)?.peer.ok_or(NativeError::NotConnected)?;
        let peer_done = net.sockets.get(&peer).map_or(true, |p| p.write_shut);
        let receiver = net.get_mut(socket)?;
        if receiver.inbox.is_empty() {
            return if peer_done || receiver.read_shut { Ok(0) } else { Err(NativeError::WouldBlock) };
        }
        let len = buf.len().min(receiver.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(receiver.inbox.iter()) {
            *slot = *byte;
        }
        if flags & MSG_PEEK == 0 {
            receiver.inbox.drain(..len);
        }
        Ok(len)
    }

    fn shutdown(&self, socket: RawSocket, how: i32) -> Result<(), NativeError> {
        let mut net = lock(&self.net);
        let target = net.get_mut(socket)?;
        match how {
            SD_RECEIVE => target.read_shut = true,
            SD_SEND => target.write_shut = true,
            SD_BOTH => {
                target.read_shut = true;
                target.write_shut = true;
            }
            _ => return Err(NativeError::InvalidArgument),
        }
        Ok(())
    }

    fn close_socket(&self, socket: RawSocket) -> Result<(), NativeError> {
        lock(&self.net).sockets.remove(&socket).map(|_| ()).ok_or(NativeError::NotSocket)
    }

    fn set_inheritable(&self, socket: RawSocket, inherit: bool) {
        if let Some(s) = lock(&self.net).sockets.get_mut(&socket) {
            s.inheritable = inherit;
        }
    }

    fn set_nonblocking(&self, socket: RawSocket, nonblocking: bool) -> Result<(), NativeError> {
        lock(&self.net).get_mut(socket)?.nonblocking = nonblocking;
        Ok(())
    }

    fn poll(&self, fds: &mut [NativePollFd], _timeout_ms: i32) -> Result<usize, NativeError> {
        let net = lock(&self.net);
        // WSAPoll fails the whole call on POLLPRI
        if fds.iter().any(|entry| entry.events.contains(PollEvents::PRI)) {
            return Err(NativeError::InvalidArgument);
        }
        let mut ready = 0;
        for entry in fds.iter_mut() {
            entry.revents = match net.sockets.get(&entry.socket) {
                None => PollEvents::NVAL,
                Some(s) => {
                    let peer_alive = s.peer.map_or(false, |p| net.sockets.contains_key(&p));
                    let mut events = PollEvents::empty();
                    if !s.inbox.is_empty() || !s.backlog.is_empty() {
                        events |= PollEvents::RDNORM;
                    }
                    if peer_alive && !s.write_shut {
                        events |= PollEvents::WRNORM;
                    }
                    let mut revents = events & entry.events;
                    if s.peer.is_some() && !peer_alive {
                        revents |= PollEvents::HUP;
                    }
                    if s.pending_error.is_some() {
                        revents |= PollEvents::ERR | PollEvents::HUP;
                    }
                    revents
                }
            };
            if !entry.revents.is_empty() {
                ready += 1;
            }
        }
        Ok(ready)
    }

    fn addr_info(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrHints,
    ) -> Result<Vec<AddrInfo>, NativeError> {
        let net = lock(&self.net);
        if !net.started {
            return Err(NativeError::NotInitialised);
        }
        let ips = match node {
            Some(name) => net.lookup(name).ok_or(NativeError::HostNotFound)?,
            None if hints.flags & AI_PASSIVE != 0 => vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            None => vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        };
        let port = match service {
            None => 0,
            Some(service) => service
                .parse::<u16>()
                .ok()
                .or_else(|| well_known_port(service))
                .ok_or(NativeError::Other(WSATYPE_NOT_FOUND))?,
        };
        let kind = if hints.kind == 0 { SOCK_STREAM } else { hints.kind };
        let protocol = match (hints.protocol, kind) {
            (0, SOCK_DGRAM) => IPPROTO_UDP,
            (0, _) => IPPROTO_TCP,
            (protocol, _) => protocol,
        };
        let mut results: Vec<AddrInfo> = ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .filter(|addr| hints.family == AF_UNSPEC || hints.family == family(addr))
            .map(|address| AddrInfo {
                family: family(&address),
                kind,
                protocol,
                canonical_name: None,
                address,
            })
            .collect();
        if results.is_empty() {
            return Err(NativeError::NoData);
        }
        if hints.flags & AI_CANONNAME != 0 {
            results[0].canonical_name = node.map(str::to_string);
        }
        Ok(results)
    }

    fn host_by_name(&self, name: &str) -> Result<HostEntry, NativeError> {
        let net = lock(&self.net);
        if !net.started {
            return Err(NativeError::NotInitialised);
        }
        let addresses: Vec<IpAddr> = net
            .lookup(name)
            .ok_or(NativeError::HostNotFound)?
            .into_iter()
            .filter(IpAddr::is_ipv4)
            .collect();
        if addresses.is_empty() {
            return Err(NativeError::NoData);
        }
        Ok(HostEntry { name: name.to_string(), aliases: vec![], addresses })
    }
}

fn well_known_port(service: &str) -> Option<u16> {
    match service {
        "ftp" => Some(21),
        "ssh" => Some(22),
        "smtp" => Some(25),
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

impl CrtApi for MemHost {
    fn open_osfhandle(&self, handle: RawSocket) -> Option<i32> {
        let mut crt = lock(&self.crt);
        if crt.refuse_wrapping {
            return None;
        }
        let fd = crt.lowest_free()?;
        crt.fds.insert(fd, CrtObject::Socket(handle));
        Some(fd)
    }

    fn get_osfhandle(&self, fd: i32) -> Option<RawSocket> {
        lock(&self.crt).fds.get(&fd).map(|object| match object {
            CrtObject::File(handle) | CrtObject::Socket(handle) => *handle,
        })
    }

    fn close_fd(&self, fd: i32) -> bool {
        lock(&self.crt).fds.remove(&fd).is_some()
    }

    fn is_socket_handle(&self, handle: RawSocket) -> bool {
        lock(&self.net).sockets.contains_key(&handle)
    }
}

impl ModuleLoader for MemHost {
    fn load_library(&self, path: &str) -> Result<ModuleHandle, NativeError> {
        let mut modules = lock(&self.modules);
        modules.loads.push(path.to_string());
        let module = modules
            .by_path
            .get_mut(&path.to_ascii_lowercase())
            .ok_or(NativeError::Other(ERROR_MOD_NOT_FOUND))?;
        module.references += 1;
        Ok(module.handle)
    }

    fn free_library(&self, module: ModuleHandle) -> Result<(), NativeError> {
        let mut modules = lock(&self.modules);
        let module = modules.by_handle(module).ok_or(NativeError::InvalidHandle)?;
        if module.refuse_unload || module.references == 0 {
            return Err(NativeError::InvalidHandle);
        }
        module.references -= 1;
        Ok(())
    }

    fn symbol(&self, module: ModuleHandle, name: &str) -> Option<usize> {
        let mut modules = lock(&self.modules);
        if module == PROGRAM_MODULE {
            return modules.program_symbols.get(name).copied();
        }
        let module = modules.by_handle(module)?;
        if module.references == 0 {
            return None;
        }
        module.symbols.get(name).copied()
    }

    fn program_module(&self) -> ModuleHandle {
        PROGRAM_MODULE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockaddr::{AF_INET, AF_INET6};

    #[test]
    fn test_socket_requires_startup() {
        let host = MemHost::new();
        assert_eq!(host.socket(2, 1, 0), Err(NativeError::NotInitialised));
        host.startup().unwrap();
        assert_eq!(host.socket(2, 1, 0), Ok(0x200));
        assert_eq!(host.socket(2, 1, 0), Ok(0x204));
    }

    #[test]
    fn test_loopback_stream() {
        let host = MemHost::new();
        host.startup().unwrap();
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let listener = host.socket(2, 1, 0).unwrap();
        host.bind(listener, &addr).unwrap();
        host.listen(listener, 5).unwrap();
        let client = host.socket(2, 1, 0).unwrap();
        host.connect(client, &addr).unwrap();
        let server = host.accept(listener).unwrap();
        assert_eq!(host.accept(listener), Err(NativeError::WouldBlock));
        assert_eq!(host.peer_name(client), Ok(addr));
        assert_eq!(host.peer_name(server), Ok(host.local_addr(client).unwrap()));

        assert_eq!(host.send(client, b"ping", 0), Ok(4));
        let mut buf = [0u8; 8];
        assert_eq!(host.recv(server, &mut buf, MSG_PEEK), Ok(4));
        assert_eq!(host.recv(server, &mut buf, 0), Ok(4));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(host.recv(server, &mut buf, 0), Err(NativeError::WouldBlock));

        host.shutdown(client, SD_SEND).unwrap();
        assert_eq!(host.recv(server, &mut buf, 0), Ok(0));
    }

    #[test]
    fn test_bind_and_connect_failures() {
        let host = MemHost::new();
        host.startup().unwrap();
        let addr: SocketAddr = "0.0.0.0:8000".parse().unwrap();
        let first = host.socket(2, 1, 0).unwrap();
        let second = host.socket(2, 1, 0).unwrap();
        host.bind(first, &addr).unwrap();
        assert_eq!(host.bind(second, &addr), Err(NativeError::AddressInUse));
        assert_eq!(host.accept(first), Err(NativeError::InvalidArgument));

        let target: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        assert_eq!(host.connect(second, &target), Err(NativeError::ConnectionRefused));
        host.listen(first, 1).unwrap();
        host.connect(second, &target).unwrap();
        assert_eq!(host.connect(second, &target), Err(NativeError::Other(WSAEISCONN)));
    }

    #[test]
    fn test_socket_options() {
        let host = MemHost::new();
        host.startup().unwrap();
        let socket = host.socket(2, SOCK_DGRAM, 0).unwrap();
        let mut value = [0u8; 4];
        assert_eq!(host.get_option(socket, SOL_SOCKET, SO_TYPE, &mut value), Ok(4));
        assert_eq!(i32::from_ne_bytes(value), SOCK_DGRAM);
        assert_eq!(host.get_option(socket, SOL_SOCKET, SO_TYPE, &mut [0u8; 2]), Err(NativeError::Fault));
        assert_eq!(host.get_option(socket, 6, 1, &mut value), Err(NativeError::NoProtocolOption));
        host.set_option(socket, 6, 1, &1i32.to_ne_bytes()).unwrap();
        assert_eq!(host.get_option(socket, 6, 1, &mut value), Ok(4));
        assert_eq!(host.set_option(socket, SOL_SOCKET, SO_TYPE, &value), Err(NativeError::NoProtocolOption));
    }

    #[test]
    fn test_name_lookups() {
        let host = MemHost::new();
        assert_eq!(host.host_by_name("localhost"), Err(NativeError::NotInitialised));
        host.startup().unwrap();
        host.add_host("Server.Example", &["192.0.2.7".parse().unwrap(), "2001:db8::7".parse().unwrap()]);

        let entry = host.host_by_name("server.example").unwrap();
        assert_eq!(entry.addresses, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(host.host_by_name("nowhere"), Err(NativeError::HostNotFound));

        let hints = AddrHints { family: AF_INET6, flags: AI_CANONNAME, ..AddrHints::default() };
        let found = host.addr_info(Some("server.example"), Some("https"), &hints).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "[2001:db8::7]:443".parse::<SocketAddr>().unwrap());
        assert_eq!(found[0].protocol, IPPROTO_TCP);
        assert_eq!(found[0].canonical_name.as_deref(), Some("server.example"));

        let passive = AddrHints { flags: AI_PASSIVE, kind: SOCK_DGRAM, ..AddrHints::default() };
        let any = host.addr_info(None, Some("53"), &passive).unwrap();
        assert_eq!(any[0].address, "0.0.0.0:53".parse::<SocketAddr>().unwrap());
        assert_eq!(any[0].protocol, IPPROTO_UDP);
        assert_eq!(
            host.addr_info(None, Some("gopherish"), &AddrHints::default()),
            Err(NativeError::Other(WSATYPE_NOT_FOUND))
        );
        let v4_only = AddrHints { family: AF_INET, ..AddrHints::default() };
        assert_eq!(host.addr_info(Some("::1"), None, &v4_only), Err(NativeError::NoData));
    }

    #[test]
    fn test_crt_table() {
        let host = MemHost::new();
        let fd = host.open_file().unwrap();
        assert_eq!(fd, 3);
        assert_eq!(host.open_osfhandle(0x200), Some(4));
        assert_eq!(host.get_osfhandle(4), Some(0x200));
        assert!(host.close_fd(3));
        assert_eq!(host.open_osfhandle(0x204), Some(3));
        host.refuse_osfhandle(true);
        assert_eq!(host.open_osfhandle(0x208), None);
    }

    #[test]
    fn test_module_table() {
        let host = MemHost::new();
        let handle = host.add_module("c:\\lib\\m.dll", &[("entry", 0x1234)]);
        assert_eq!(host.symbol(handle, "entry"), None);
        assert_eq!(host.load_library("C:\\LIB\\M.DLL"), Ok(handle));
        assert_eq!(host.symbol(handle, "entry"), Some(0x1234));
        host.free_library(handle).unwrap();
        assert_eq!(host.free_library(handle), Err(NativeError::InvalidHandle));
        assert!(host.load_library("c:\\lib\\none.dll").is_err());
    }
}

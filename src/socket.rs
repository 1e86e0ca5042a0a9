//! Descriptor based socket calls.
//!
//! Every call resolves its descriptor through the socket table first; a
//! descriptor with no socket behind it fails with `EBADF`.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::platform::{
    AddrHints, AddrInfo, Host, HostEntry, NativeError, NativePollFd, PollEvents, PollFd, RawSocket,
};
use crate::process::Process;
use crate::sockfd::Descriptor;

pub const WSAHOST_NOT_FOUND: i32 = 11001;
pub const WSATRY_AGAIN: i32 = 11002;
pub const WSANO_RECOVERY: i32 = 11003;
pub const WSANO_DATA: i32 = 11004;

thread_local! {
    static H_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Lookup error of the calling thread's last `gethostbyname`.
pub fn h_errno() -> i32 {
    H_ERRNO.with(Cell::get)
}

pub(crate) fn host_error_message(code: i32) -> &'static CStr {
    match code {
        0 => c"no error",
        WSAHOST_NOT_FOUND => c"host not found",
        WSATRY_AGAIN => c"try again",
        WSANO_RECOVERY => c"no recovery",
        WSANO_DATA => c"no data",
        _ => c"no address",
    }
}

pub fn hstrerror(code: i32) -> &'static str {
    host_error_message(code).to_str().unwrap_or("no address")
}

/// Print `msg` and the text of [`h_errno`] to stderr; an empty `msg`
/// prints the text alone.
pub fn herror(msg: &str) {
    match msg {
        "" => eprintln!("{}", hstrerror(h_errno())),
        msg => eprintln!("{msg}: {}", hstrerror(h_errno())),
    }
}

/// Descriptor set of `select`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet(BTreeSet<i32>);

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: i32) {
        self.0.insert(fd);
    }

    pub fn remove(&mut self, fd: i32) {
        self.0.remove(&fd);
    }

    pub fn contains(&self, fd: i32) -> bool {
        self.0.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().copied()
    }
}

impl Process {
    /// Native handle behind `fd`.
    pub fn socket_handle(&self, fd: i32) -> Result<RawSocket> {
        self.sockets.lookup(fd, &*self.host).ok_or(Error::BadDescriptor)
    }

    /// Run a Winsock call, starting Winsock and retrying once if it was not
    /// started yet.
    fn with_startup<T>(
        &self,
        call: impl Fn(&dyn Host) -> core::result::Result<T, NativeError>,
    ) -> core::result::Result<T, NativeError> {
        match call(&*self.host) {
            Err(NativeError::NotInitialised) => {
                log::debug!("winsock not started, starting it");
                self.host.startup()?;
                call(&*self.host)
            }
            other => other,
        }
    }

    /// Give a fresh native socket a descriptor: handles below the table's
    /// capacity are wrapped by the CRT, larger ones are their own descriptor.
    fn adopt(&mut self, socket: RawSocket) -> Result<i32> {
        let wrapped = if socket < self.sockets.capacity() as RawSocket {
            self.host.open_osfhandle(socket)
        } else {
            i32::try_from(socket).ok()
        };
        let Some(fd) = wrapped else {
            if let Err(err) = self.host.close_socket(socket) {
                log::debug!("closing unadoptable socket {socket:#x}: {err}");
            }
            return Err(Error::TooManyOpenFiles);
        };
        self.host.set_inheritable(socket, false);
        if self.sockets.is_crt_descriptor(fd) {
            self.sockets.register(fd, socket);
        }
        log::debug!("socket {socket:#x} is descriptor {fd}");
        Ok(fd)
    }

    pub fn socket(&mut self, domain: i32, kind: i32, protocol: i32) -> Result<i32> {
        let socket = self
            .with_startup(|host| host.socket(domain, kind, protocol))
            .map_err(Error::from_socket)?;
        self.adopt(socket)
    }

    pub fn bind(&mut self, fd: i32, addr: &SocketAddr) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.bind(socket, addr).map_err(Error::from_socket)
    }

    pub fn listen(&mut self, fd: i32, backlog: i32) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.listen(socket, backlog).map_err(Error::from_socket)
    }

    /// A non-blocking connect that cannot finish at once fails with
    /// `WouldBlock`; `select` on the write and except sets reports the
    /// outcome.
    pub fn connect(&mut self, fd: i32, addr: &SocketAddr) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.connect(socket, addr).map_err(Error::from_socket)
    }

    pub fn accept(&mut self, fd: i32) -> Result<i32> {
        let listener = self.socket_handle(fd)?;
        let socket = self.host.accept(listener).map_err(Error::from_socket)?;
        self.adopt(socket)
    }

    pub fn getpeername(&mut self, fd: i32) -> Result<SocketAddr> {
        let socket = self.socket_handle(fd)?;
        self.host.peer_name(socket).map_err(Error::from_socket)
    }

    /// Copy the option into `value`, returning its length.
    pub fn getsockopt(&mut self, fd: i32, level: i32, name: i32, value: &mut [u8]) -> Result<usize> {
        let socket = self.socket_handle(fd)?;
        self.host.get_option(socket, level, name, value).map_err(Error::from_socket)
    }

    pub fn setsockopt(&mut self, fd: i32, level: i32, name: i32, value: &[u8]) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.set_option(socket, level, name, value).map_err(Error::from_socket)
    }

    pub fn send(&mut self, fd: i32, buf: &[u8], flags: i32) -> Result<usize> {
        let socket = self.socket_handle(fd)?;
        self.host.send(socket, buf, flags).map_err(Error::from_socket)
    }

    pub fn recv(&mut self, fd: i32, buf: &mut [u8], flags: i32) -> Result<usize> {
        let socket = self.socket_handle(fd)?;
        self.host.recv(socket, buf, flags).map_err(Error::from_socket)
    }

    pub fn shutdown(&mut self, fd: i32, how: i32) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.shutdown(socket, how).map_err(Error::from_socket)
    }

    pub fn set_blocking(&mut self, fd: i32, blocking: bool) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.host.set_nonblocking(socket, !blocking).map_err(Error::from_socket)
    }

    /// Close the socket behind `fd`, drop its table entry and release the
    /// CRT descriptor that wrapped it.
    pub fn sockclose(&mut self, fd: i32) -> Result<()> {
        let socket = self.socket_handle(fd)?;
        self.sockets.unregister(fd, Some(socket));
        let closed = self.host.close_socket(socket).map_err(Error::from_socket);
        // `_close` also closes the wrapped handle; closesocket has already
        // done that, so its own failure is expected and ignored.
        if self.sockets.is_crt_descriptor(fd) && !self.host.close_fd(fd) {
            log::debug!("descriptor {fd} was not open in the CRT");
        }
        closed
    }

    /// `getaddrinfo` for `node` and `service`.
    pub fn getaddrinfo(
        &mut self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrHints,
    ) -> Result<Vec<AddrInfo>> {
        self.with_startup(|host| host.addr_info(node, service, hints))
            .map_err(|err| Error::from_lookup(err, node.or(service).unwrap_or_default()))
    }

    /// `gethostbyname`; also sets [`h_errno`].
    pub fn gethostbyname(&mut self, name: &str) -> Result<HostEntry> {
        let found = self.with_startup(|host| host.host_by_name(name));
        H_ERRNO.with(|cell| cell.set(found.as_ref().err().map_or(0, |err| err.code() as i32)));
        found.map_err(|err| Error::from_lookup(err, name))
    }

    /// Poll descriptors of any kind. Negative descriptors are skipped and
    /// plain files are always ready for what they were asked about.
    pub fn poll(&mut self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
        let mut native = Vec::new();
        let mut owners = Vec::new();
        for (index, entry) in fds.iter_mut().enumerate() {
            entry.revents = PollEvents::empty();
            match self.sockets.resolve(entry.fd, &*self.host) {
                None => {}
                Some(Descriptor::File(_)) => {
                    entry.revents = entry.events & (PollEvents::IN | PollEvents::OUT);
                }
                Some(Descriptor::Socket(socket)) => {
                    // WSAPoll rejects POLLPRI; errors are reported regardless
                    native.push(NativePollFd {
                        socket,
                        events: entry.events.difference(PollEvents::PRI),
                        revents: PollEvents::empty(),
                    });
                    owners.push(index);
                }
            }
        }

        let files_ready = fds.iter().any(|e| !e.revents.is_empty());
        if !native.is_empty() {
            let timeout = if files_ready { 0 } else { timeout_ms };
            self.host.poll(&mut native, timeout).map_err(Error::from_socket)?;
            for (index, result) in owners.into_iter().zip(native) {
                fds[index].revents = result.revents;
            }
        }
        Ok(fds.iter().filter(|e| !e.revents.is_empty()).count())
    }

    /// `select` over [`Process::poll`]; descriptors at or above `nfds` are
    /// ignored. A socket error (such as a failed connect) marks the except
    /// set. Returns the number of bits left set.
    pub fn select(
        &mut self,
        nfds: i32,
        mut readfds: Option<&mut FdSet>,
        mut writefds: Option<&mut FdSet>,
        mut exceptfds: Option<&mut FdSet>,
        timeout_ms: i32,
    ) -> Result<usize> {
        if nfds < 0 {
            return Err(Error::InvalidArgument("negative nfds"));
        }
        let wanted =
            |set: &Option<&mut FdSet>, fd: i32| set.as_ref().map_or(false, |s| s.contains(fd));

        let mut polled: Vec<PollFd> = Vec::new();
        for fd in 0..nfds {
            let mut events = PollEvents::empty();
            if wanted(&readfds, fd) {
                events |= PollEvents::IN;
            }
            if wanted(&writefds, fd) {
                events |= PollEvents::OUT;
            }
            if wanted(&exceptfds, fd) {
                events |= PollEvents::PRI;
            }
            if !events.is_empty() {
                polled.push(PollFd::new(fd, events));
            }
        }
        self.poll(&mut polled, timeout_ms)?;

        for set in [readfds.as_deref_mut(), writefds.as_deref_mut(), exceptfds.as_deref_mut()]
            .into_iter()
            .flatten()
        {
            set.clear();
        }
        let mut count = 0;
        for entry in &polled {
            let failed = entry.revents.intersects(PollEvents::ERR | PollEvents::NVAL);
            let mut mark = |set: &mut Option<&mut FdSet>, ready: bool| {
                if let (Some(set), true) = (set.as_mut(), ready) {
                    set.insert(entry.fd);
                    count += 1;
                }
            };
            mark(
                &mut readfds,
                entry.events.intersects(PollEvents::IN)
                    && (entry.revents.intersects(PollEvents::IN | PollEvents::HUP) || failed),
            );
            mark(
                &mut writefds,
                entry.events.contains(PollEvents::OUT)
                    && (entry.revents.contains(PollEvents::OUT) || failed),
            );
            mark(
                &mut exceptfds,
                entry.events.contains(PollEvents::PRI)
                    && entry.revents.intersects(PollEvents::PRI | PollEvents::ERR),
            );
        }
        Ok(count)
    }
}

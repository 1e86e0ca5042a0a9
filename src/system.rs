//! The `w32_` C surface over one process-wide [`Process`].
//!
//! Calls return `NULL` or `-1` on failure and leave the errno in a
//! thread-local cell read back with [`w32_errno`].

use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::{c_char, c_int, c_long, c_void, CStr, CString};
use std::net::{IpAddr, SocketAddr};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::config::Config;
use crate::dirent::{DirStream, Dirent, RawDirent};
use crate::dlfcn::dlerror;
use crate::error::Error;
use crate::ffi::{cstr_arg, errno, fail};
use crate::platform::{AddrHints, HostEntry};
use crate::process::Process;
use crate::sockaddr::{self, SockAddrBuf, AF_INET};
use crate::socket::{h_errno, herror, host_error_message, WSANO_RECOVERY};

/// `DIR`: a stream together with the record `w32_readdir` hands out.
pub struct Dir {
    stream: DirStream,
    raw: RawDirent,
}

lazy_static! {
    static ref GLOBAL_PROC: Mutex<Option<Process>> = Mutex::new(None);
    /// Addresses of the `DIR` objects that are currently open.
    static ref OPEN_DIRS: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
}

/// `struct addrinfo` in the Winsock field order.
#[repr(C)]
pub struct RawAddrInfo {
    pub ai_flags: c_int,
    pub ai_family: c_int,
    pub ai_socktype: c_int,
    pub ai_protocol: c_int,
    pub ai_addrlen: usize,
    pub ai_canonname: *mut c_char,
    pub ai_addr: *mut c_void,
    pub ai_next: *mut RawAddrInfo,
}

/// One `w32_getaddrinfo` result. `info` comes first so a `RawAddrInfo`
/// pointer is also a pointer to its node.
#[repr(C)]
struct AddrInfoNode {
    info: RawAddrInfo,
    addr: SockAddrBuf,
    canonname: Option<CString>,
}

/// `struct hostent`.
#[repr(C)]
pub struct RawHostEnt {
    pub h_name: *mut c_char,
    pub h_aliases: *mut *mut c_char,
    pub h_addrtype: i16,
    pub h_length: i16,
    pub h_addr_list: *mut *mut c_char,
}

/// Storage the pointers of a `RawHostEnt` point into.
struct HostEntBuf {
    raw: RawHostEnt,
    _name: CString,
    _aliases: Vec<CString>,
    _alias_ptrs: Vec<*mut c_char>,
    _addrs: Vec<[u8; 4]>,
    _addr_ptrs: Vec<*mut c_char>,
}

impl HostEntBuf {
    fn new(entry: HostEntry) -> Box<Self> {
        let name = CString::new(entry.name).unwrap_or_default();
        let aliases: Vec<CString> =
            entry.aliases.into_iter().filter_map(|alias| CString::new(alias).ok()).collect();
        let mut alias_ptrs: Vec<*mut c_char> =
            aliases.iter().map(|alias| alias.as_ptr().cast_mut()).collect();
        alias_ptrs.push(ptr::null_mut());
        let addrs: Vec<[u8; 4]> = entry
            .addresses
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4.octets()),
                IpAddr::V6(_) => None,
            })
            .collect();
        let mut addr_ptrs: Vec<*mut c_char> =
            addrs.iter().map(|addr| addr.as_ptr().cast::<c_char>().cast_mut()).collect();
        addr_ptrs.push(ptr::null_mut());
        Box::new(HostEntBuf {
            raw: RawHostEnt {
                h_name: name.as_ptr().cast_mut(),
                h_aliases: alias_ptrs.as_mut_ptr(),
                h_addrtype: AF_INET as i16,
                h_length: 4,
                h_addr_list: addr_ptrs.as_mut_ptr(),
            },
            _name: name,
            _aliases: aliases,
            _alias_ptrs: alias_ptrs,
            _addrs: addrs,
            _addr_ptrs: addr_ptrs,
        })
    }
}

thread_local! {
    static DLERROR_BUF: RefCell<CString> = RefCell::new(CString::default());
    static HOSTENT_BUF: RefCell<Option<Box<HostEntBuf>>> = const { RefCell::new(None) };
}

fn default_process() -> Process {
    let config = Config::from_env();
    #[cfg(windows)]
    {
        Process::native(config)
    }
    #[cfg(not(windows))]
    {
        Process::new(std::sync::Arc::new(crate::host::MemHost::new()), config)
    }
}

/// Run `f` on the process, creating it on first use.
fn with_proc<T>(f: impl FnOnce(&mut Process) -> T) -> T {
    let mut guard = GLOBAL_PROC.lock().unwrap_or_else(PoisonError::into_inner);
    f(guard.get_or_insert_with(default_process))
}

/// Replace the process behind the C surface, returning the previous one.
pub fn install(process: Process) -> Option<Process> {
    GLOBAL_PROC.lock().unwrap_or_else(PoisonError::into_inner).replace(process)
}

fn open_dirs() -> MutexGuard<'static, HashSet<usize>> {
    OPEN_DIRS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Borrow an open `DIR`; `None` for null or unknown pointers.
///
/// # Safety
///
/// A pointer found in the open set came from `Box::into_raw` and has not
/// been freed; the caller must not use the same `DIR` from two threads.
unsafe fn dir_mut<'a>(dir: *mut Dir) -> Option<&'a mut Dir> {
    if dir.is_null() || !open_dirs().contains(&(dir as usize)) {
        return None;
    }
    Some(&mut *dir)
}

#[no_mangle]
pub extern "C" fn w32_errno() -> c_int {
    errno()
}

/// # Safety
///
/// `path` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn w32_opendir(path: *const c_char) -> *mut Dir {
    let path = match cstr_arg(path) {
        Ok(path) => path,
        Err(err) => return fail(err, ptr::null_mut()),
    };
    match with_proc(|proc| proc.opendir(&path)) {
        Ok(stream) => {
            let dir = Box::into_raw(Box::new(Dir { stream, raw: RawDirent::zeroed() }));
            open_dirs().insert(dir as usize);
            dir
        }
        Err(err) => fail(err, ptr::null_mut()),
    }
}

/// Next record, or null at the end of the stream with errno untouched.
///
/// # Safety
///
/// `dir` must be null or a pointer returned by [`w32_opendir`].
#[no_mangle]
pub unsafe extern "C" fn w32_readdir(dir: *mut Dir) -> *mut RawDirent {
    let Some(dir) = dir_mut(dir) else {
        return fail(Error::BadDescriptor, ptr::null_mut());
    };
    match dir.stream.read() {
        Some(entry) => {
            dir.raw.fill_from(entry);
            &mut dir.raw
        }
        None => ptr::null_mut(),
    }
}

/// Reentrant read into `entry`; `*result` is `entry`, or null at the end.
/// Returns 0 or an errno value.
///
/// # Safety
///
/// `dir` as for [`w32_readdir`]; `entry` and `result` must be null or valid
/// for writes.
#[no_mangle]
pub unsafe extern "C" fn w32_readdir_r(
    dir: *mut Dir,
    entry: *mut RawDirent,
    result: *mut *mut RawDirent,
) -> c_int {
    if entry.is_null() || result.is_null() {
        return Error::BadAddress.errno();
    }
    *result = ptr::null_mut();
    let Some(dir) = dir_mut(dir) else {
        return Error::BadDescriptor.errno();
    };
    let mut next = Dirent::default();
    match dir.stream.read_into(&mut next) {
        Ok(true) => {
            (*entry).fill_from(&next);
            *result = entry;
            0
        }
        Ok(false) => 0,
        Err(err) => {
            log::debug!("readdir_r: {err}");
            err.errno()
        }
    }
}

/// # Safety
///
/// `dir` as for [`w32_readdir`].
#[no_mangle]
pub unsafe extern "C" fn w32_seekdir(dir: *mut Dir, pos: c_long) {
    let Some(dir) = dir_mut(dir) else {
        return fail(Error::BadDescriptor, ());
    };
    if let Err(err) = dir.stream.seek(i64::from(pos)) {
        fail(err, ())
    }
}

/// # Safety
///
/// `dir` as for [`w32_readdir`].
#[no_mangle]
pub unsafe extern "C" fn w32_rewinddir(dir: *mut Dir) {
    match dir_mut(dir) {
        Some(dir) => dir.stream.rewind(),
        None => fail(Error::BadDescriptor, ()),
    }
}

/// # Safety
///
/// `dir` as for [`w32_readdir`].
#[no_mangle]
pub unsafe extern "C" fn w32_telldir(dir: *mut Dir) -> c_long {
    match dir_mut(dir) {
        Some(dir) => c_long::try_from(dir.stream.tell()).unwrap_or(c_long::MAX),
        None => fail(Error::BadDescriptor, -1),
    }
}

/// # Safety
///
/// `dir` as for [`w32_readdir`]; it is invalid once this returns 0.
#[no_mangle]
pub unsafe extern "C" fn w32_closedir(dir: *mut Dir) -> c_int {
    if dir.is_null() || !open_dirs().remove(&(dir as usize)) {
        return fail(Error::BadDescriptor, -1);
    }
    let dir = Box::from_raw(dir);
    dir.stream.close();
    0
}

#[no_mangle]
pub extern "C" fn w32_socket(domain: c_int, kind: c_int, protocol: c_int) -> c_int {
    with_proc(|proc| proc.socket(domain, kind, protocol)).unwrap_or_else(|err| fail(err, -1))
}

/// Decode a `sockaddr` argument.
///
/// # Safety
///
/// `addr` must be null or valid for `len` bytes of reads.
unsafe fn sockaddr_arg(addr: *const c_void, len: c_int) -> crate::error::Result<SocketAddr> {
    if addr.is_null() {
        return Err(Error::BadAddress);
    }
    let len = usize::try_from(len).map_err(|_| Error::InvalidArgument("negative address length"))?;
    let bytes = std::slice::from_raw_parts(addr.cast::<u8>(), len);
    sockaddr::decode(bytes).ok_or(Error::InvalidArgument("unsupported address"))
}

/// Copy `addr` into `out`, truncated to `*addrlen`, and store its full
/// length in `*addrlen`. Does nothing if either pointer is null.
///
/// # Safety
///
/// `out` must be valid for `*addrlen` bytes of writes.
unsafe fn sockaddr_out(addr: &SocketAddr, out: *mut c_void, addrlen: *mut c_int) {
    if out.is_null() || addrlen.is_null() {
        return;
    }
    let encoded = SockAddrBuf::encode(addr);
    let room = usize::try_from(*addrlen).unwrap_or(0).min(encoded.len());
    ptr::copy_nonoverlapping(encoded.as_ptr(), out.cast::<u8>(), room);
    *addrlen = encoded.len() as c_int;
}

fn status(result: crate::error::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => fail(err, -1),
    }
}

/// # Safety
///
/// `addr` must be null or valid for `addrlen` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn w32_bind(fd: c_int, addr: *const c_void, addrlen: c_int) -> c_int {
    match sockaddr_arg(addr, addrlen) {
        Ok(addr) => status(with_proc(|proc| proc.bind(fd, &addr))),
        Err(err) => fail(err, -1),
    }
}

#[no_mangle]
pub extern "C" fn w32_listen(fd: c_int, backlog: c_int) -> c_int {
    status(with_proc(|proc| proc.listen(fd, backlog)))
}

/// # Safety
///
/// `addr` must be null or valid for `addrlen` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn w32_connect(fd: c_int, addr: *const c_void, addrlen: c_int) -> c_int {
    match sockaddr_arg(addr, addrlen) {
        Ok(addr) => status(with_proc(|proc| proc.connect(fd, &addr))),
        Err(err) => fail(err, -1),
    }
}

/// The peer address is written to `addr` when both `addr` and `addrlen`
/// are non-null.
///
/// # Safety
///
/// `addrlen` must be null or valid for reads and writes, `addr` valid for
/// `*addrlen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn w32_accept(fd: c_int, addr: *mut c_void, addrlen: *mut c_int) -> c_int {
    let accepted = with_proc(|proc| -> crate::error::Result<(c_int, Option<SocketAddr>)> {
        let client = proc.accept(fd)?;
        Ok((client, proc.getpeername(client).ok()))
    });
    match accepted {
        Ok((client, peer)) => {
            match peer {
                Some(peer) => sockaddr_out(&peer, addr, addrlen),
                None if !addrlen.is_null() => *addrlen = 0,
                None => {}
            }
            client
        }
        Err(err) => fail(err, -1),
    }
}

/// # Safety
///
/// As for [`w32_accept`].
#[no_mangle]
pub unsafe extern "C" fn w32_getpeername(fd: c_int, addr: *mut c_void, addrlen: *mut c_int) -> c_int {
    if addr.is_null() || addrlen.is_null() {
        return fail(Error::BadAddress, -1);
    }
    match with_proc(|proc| proc.getpeername(fd)) {
        Ok(peer) => {
            sockaddr_out(&peer, addr, addrlen);
            0
        }
        Err(err) => fail(err, -1),
    }
}

/// # Safety
///
/// `optlen` must be valid for reads and writes, `optval` valid for
/// `*optlen` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn w32_getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    optval: *mut c_void,
    optlen: *mut c_int,
) -> c_int {
    if optval.is_null() || optlen.is_null() {
        return fail(Error::BadAddress, -1);
    }
    let len = usize::try_from(*optlen).unwrap_or(0);
    let value = std::slice::from_raw_parts_mut(optval.cast::<u8>(), len);
    match with_proc(|proc| proc.getsockopt(fd, level, name, value)) {
        Ok(written) => {
            *optlen = written as c_int;
            0
        }
        Err(err) => fail(err, -1),
    }
}

/// # Safety
///
/// `optval` must be valid for `optlen` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn w32_setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    optval: *const c_void,
    optlen: c_int,
) -> c_int {
    let Ok(len) = usize::try_from(optlen) else {
        return fail(Error::InvalidArgument("negative option length"), -1);
    };
    if optval.is_null() && len > 0 {
        return fail(Error::BadAddress, -1);
    }
    let value: &[u8] = if len == 0 { &[] } else { std::slice::from_raw_parts(optval.cast(), len) };
    status(with_proc(|proc| proc.setsockopt(fd, level, name, value)))
}

/// # Safety
///
/// `buf` must be valid for `len` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn w32_send(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize {
    if buf.is_null() && len > 0 {
        return fail(Error::BadAddress, -1);
    }
    let data: &[u8] = if len == 0 { &[] } else { std::slice::from_raw_parts(buf.cast(), len) };
    match with_proc(|proc| proc.send(fd, data, flags)) {
        Ok(sent) => isize::try_from(sent).unwrap_or(isize::MAX),
        Err(err) => fail(err, -1),
    }
}

/// # Safety
///
/// `buf` must be valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn w32_recv(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize {
    if buf.is_null() && len > 0 {
        return fail(Error::BadAddress, -1);
    }
    let data: &mut [u8] =
        if len == 0 { &mut [] } else { std::slice::from_raw_parts_mut(buf.cast(), len) };
    match with_proc(|proc| proc.recv(fd, data, flags)) {
        Ok(received) => isize::try_from(received).unwrap_or(isize::MAX),
        Err(err) => fail(err, -1),
    }
}

#[no_mangle]
pub extern "C" fn w32_shutdown(fd: c_int, how: c_int) -> c_int {
    status(with_proc(|proc| proc.shutdown(fd, how)))
}

#[no_mangle]
pub extern "C" fn w32_sockclose(fd: c_int) -> c_int {
    status(with_proc(|proc| proc.sockclose(fd)))
}

/// Returns 0 and a list for [`w32_freeaddrinfo`], or the lookup error code.
///
/// # Safety
///
/// `node` and `service` must be null or NUL terminated, `hints` null or a
/// valid `RawAddrInfo`, `res` valid for writes.
#[no_mangle]
pub unsafe extern "C" fn w32_getaddrinfo(
    node: *const c_char,
    service: *const c_char,
    hints: *const RawAddrInfo,
    res: *mut *mut RawAddrInfo,
) -> c_int {
    if res.is_null() || (node.is_null() && service.is_null()) {
        return fail(Error::BadAddress, WSANO_RECOVERY);
    }
    *res = ptr::null_mut();
    let node = (!node.is_null()).then(|| CStr::from_ptr(node).to_string_lossy().into_owned());
    let service = (!service.is_null()).then(|| CStr::from_ptr(service).to_string_lossy().into_owned());
    let hints = hints.as_ref().map_or_else(AddrHints::default, |h| AddrHints {
        flags: h.ai_flags,
        family: h.ai_family,
        kind: h.ai_socktype,
        protocol: h.ai_protocol,
    });
    let found = with_proc(|proc| proc.getaddrinfo(node.as_deref(), service.as_deref(), &hints));
    let results = match found {
        Ok(results) => results,
        Err(Error::HostLookup { code, .. }) => return code,
        Err(err) => return fail(err, WSANO_RECOVERY),
    };

    let mut head: *mut RawAddrInfo = ptr::null_mut();
    for result in results.into_iter().rev() {
        let addr = SockAddrBuf::encode(&result.address);
        let node = Box::into_raw(Box::new(AddrInfoNode {
            info: RawAddrInfo {
                ai_flags: hints.flags,
                ai_family: result.family,
                ai_socktype: result.kind,
                ai_protocol: result.protocol,
                ai_addrlen: addr.len(),
                ai_canonname: ptr::null_mut(),
                ai_addr: ptr::null_mut(),
                ai_next: head,
            },
            addr,
            canonname: result.canonical_name.and_then(|name| CString::new(name).ok()),
        }));
        (*node).info.ai_addr = ptr::addr_of_mut!((*node).addr).cast();
        (*node).info.ai_canonname =
            (*node).canonname.as_ref().map_or(ptr::null_mut(), |name| name.as_ptr().cast_mut());
        head = node.cast();
    }
    *res = head;
    0
}

/// # Safety
///
/// `list` must be null or a list returned by [`w32_getaddrinfo`] that has
/// not been freed.
#[no_mangle]
pub unsafe extern "C" fn w32_freeaddrinfo(list: *mut RawAddrInfo) {
    let mut at = list;
    while !at.is_null() {
        let node = Box::from_raw(at.cast::<AddrInfoNode>());
        at = node.info.ai_next;
    }
}

/// The entry stays valid until the next call on the same thread. Null on
/// failure with [`w32_h_errno`] set.
///
/// # Safety
///
/// `name` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn w32_gethostbyname(name: *const c_char) -> *mut RawHostEnt {
    let name = match cstr_arg(name) {
        Ok(name) => name,
        Err(err) => return fail(err, ptr::null_mut()),
    };
    match with_proc(|proc| proc.gethostbyname(&name)) {
        Ok(entry) => HOSTENT_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            let entry = buf.insert(HostEntBuf::new(entry));
            &mut entry.raw as *mut RawHostEnt
        }),
        Err(err) => fail(err, ptr::null_mut()),
    }
}

#[no_mangle]
pub extern "C" fn w32_h_errno() -> c_int {
    h_errno()
}

#[no_mangle]
pub extern "C" fn w32_hstrerror(code: c_int) -> *const c_char {
    host_error_message(code).as_ptr()
}

/// # Safety
///
/// `msg` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn w32_herror(msg: *const c_char) {
    let msg = if msg.is_null() { String::new() } else { CStr::from_ptr(msg).to_string_lossy().into_owned() };
    herror(&msg);
}

/// A null `file` opens the running program.
///
/// # Safety
///
/// `file` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn w32_dlopen(file: *const c_char, mode: c_int) -> *mut c_void {
    let file = if file.is_null() {
        None
    } else {
        match cstr_arg(file) {
            Ok(file) => Some(file),
            Err(err) => return fail(err, ptr::null_mut()),
        }
    };
    match with_proc(|proc| proc.dlopen(file.as_deref(), mode)) {
        Ok(handle) => handle as *mut c_void,
        Err(err) => fail(err, ptr::null_mut()),
    }
}

/// # Safety
///
/// `name` must be null or a NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn w32_dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    let name = match cstr_arg(name) {
        Ok(name) => name,
        Err(err) => return fail(err, ptr::null_mut()),
    };
    match with_proc(|proc| proc.dlsym(handle as usize, &name)) {
        Some(address) => address as *mut c_void,
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn w32_dlclose(handle: *mut c_void) -> c_int {
    match with_proc(|proc| proc.dlclose(handle as usize)) {
        Ok(()) => 0,
        Err(err) => fail(err, -1),
    }
}

/// Last module error of the calling thread, or null if there was none. The
/// string stays valid until the next call on the same thread.
#[no_mangle]
pub extern "C" fn w32_dlerror() -> *const c_char {
    let Some(message) = dlerror() else {
        return ptr::null();
    };
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    DLERROR_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        *buf = message;
        buf.as_ptr()
    })
}

//! The Win32 backend of the platform traits.

use std::ffi::{c_void, CStr, CString};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, FreeLibrary, GetLastError, SetHandleInformation, FILETIME, HANDLE,
    HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE, MAX_PATH,
};
use windows_sys::Win32::Networking::WinSock::{
    accept, bind, closesocket, connect, freeaddrinfo, getaddrinfo, gethostbyname, getpeername,
    getsockopt, ioctlsocket, listen, recv, send, setsockopt, shutdown, socket, WSAGetLastError,
    WSAPoll, WSAStartup, ADDRINFOA, FIONBIO, INVALID_SOCKET, SOCKADDR, SOCKET, SOCKET_ERROR,
    WSADATA, WSAPOLLFD,
};
use windows_sys::Win32::NetworkManagement::NetManagement::NetApiBufferFree;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FindClose, FindFirstFileW, FindNextFileW, GetFileAttributesW, GetFileType,
    GetFullPathNameW, GetVolumeInformationW, GetVolumePathNamesForVolumeNameW,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, FILE_TYPE_PIPE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING, WIN32_FIND_DATAW,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress, LoadLibraryW};
use windows_sys::Win32::System::Pipes::GetNamedPipeInfo;
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::platform::{
    AddrHints, AddrInfo, CrtApi, DirectoryApi, FileAttributes, FindData, FindIter, HostEntry,
    ModuleHandle, ModuleLoader, NativeError, NativePollFd, PollEvents, RawSocket,
    RedirectionCookie, ShareInfo, ShareKind, SharePage, SocketApi, VolumeFlags,
};
use crate::sockaddr::{self, SockAddrBuf};

const FSCTL_GET_REPARSE_POINT: u32 = 0x0009_00a8;
const MAXIMUM_REPARSE_DATA_BUFFER_SIZE: usize = 16 * 1024;
const ERROR_MORE_DATA: u32 = 234;
const MAX_PREFERRED_LENGTH: u32 = u32::MAX;
/// 100ns intervals between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE: i64 = 116_444_736_000_000_000;

#[repr(C)]
struct ShareInfo1 {
    shi1_netname: *mut u16,
    shi1_type: u32,
    shi1_remark: *mut u16,
}

#[link(name = "netapi32")]
extern "system" {
    fn NetShareEnum(
        servername: *const u16,
        level: u32,
        bufptr: *mut *mut u8,
        prefmaxlen: u32,
        entriesread: *mut u32,
        totalentries: *mut u32,
        resume_handle: *mut u32,
    ) -> u32;
}

#[link(name = "kernel32")]
extern "system" {
    fn GetComputerNameW(buffer: *mut u16, size: *mut u32) -> i32;
    fn GetCurrentDirectoryW(length: u32, buffer: *mut u16) -> u32;
}

extern "C" {
    fn _open_osfhandle(osfhandle: isize, flags: i32) -> i32;
    fn _get_osfhandle(fd: i32) -> isize;
    fn _close(fd: i32) -> i32;
}

type Wow64Disable = unsafe extern "system" fn(*mut *mut c_void) -> i32;
type Wow64Revert = unsafe extern "system" fn(*mut c_void) -> i32;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Owned `PWSTR` up to its terminator.
unsafe fn from_wide_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

fn last_error() -> NativeError {
    NativeError::from_code(unsafe { GetLastError() })
}

fn last_socket_error() -> NativeError {
    NativeError::from_code(unsafe { WSAGetLastError() } as u32)
}

fn socket_result(ret: i32) -> Result<(), NativeError> {
    match ret {
        SOCKET_ERROR => Err(last_socket_error()),
        _ => Ok(()),
    }
}

fn c_string(s: &str) -> Result<CString, NativeError> {
    CString::new(s).map_err(|_| NativeError::InvalidArgument)
}

/// Copy a NULL terminated `char **` list.
unsafe fn string_list(list: *const *const u8) -> Vec<String> {
    let mut out = Vec::new();
    if list.is_null() {
        return out;
    }
    let mut at = list;
    while !(*at).is_null() {
        out.push(CStr::from_ptr((*at).cast()).to_string_lossy().into_owned());
        at = at.add(1);
    }
    out
}

fn unix_time(time: &FILETIME) -> i64 {
    let ticks = (i64::from(time.dwHighDateTime) << 32) | i64::from(time.dwLowDateTime);
    (ticks - EPOCH_DIFFERENCE) / 10_000_000
}

fn find_data(data: &WIN32_FIND_DATAW) -> FindData {
    FindData {
        name: from_wide(&data.cFileName),
        attributes: FileAttributes::from_bits_retain(data.dwFileAttributes),
        size: (u64::from(data.nFileSizeHigh) << 32) | u64::from(data.nFileSizeLow),
        created: unix_time(&data.ftCreationTime),
        modified: unix_time(&data.ftLastWriteTime),
        reparse_tag: data.dwReserved0,
    }
}

/// An open `FindFirstFile` search.
struct Search {
    handle: HANDLE,
    first: Option<WIN32_FIND_DATAW>,
    done: bool,
}

impl Iterator for Search {
    type Item = Result<FindData, NativeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(data) = self.first.take() {
            return Some(Ok(find_data(&data)));
        }
        if self.done {
            return None;
        }
        let mut data: WIN32_FIND_DATAW = unsafe { mem::zeroed() };
        if unsafe { FindNextFileW(self.handle, &mut data) } == 0 {
            self.done = true;
            return match last_error() {
                NativeError::NoMoreFiles => None,
                err => Some(Err(err)),
            };
        }
        Some(Ok(find_data(&data)))
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        unsafe { FindClose(self.handle) };
    }
}

/// The running Windows process.
pub struct Win32Host {
    disable: Option<Wow64Disable>,
    revert: Option<Wow64Revert>,
}

impl Win32Host {
    pub fn new() -> Self {
        // Wow64 redirection is only exported by 64-bit aware kernels.
        let kernel32 = unsafe { GetModuleHandleW(wide("kernel32.dll").as_ptr()) };
        let (disable, revert) = if kernel32 == 0 {
            (None, None)
        } else {
            unsafe {
                (
                    GetProcAddress(kernel32, b"Wow64DisableWow64FsRedirection\0".as_ptr())
                        .map(|f| mem::transmute::<_, Wow64Disable>(f)),
                    GetProcAddress(kernel32, b"Wow64RevertWow64FsRedirection\0".as_ptr())
                        .map(|f| mem::transmute::<_, Wow64Revert>(f)),
                )
            }
        };
        Self { disable, revert }
    }
}

impl DirectoryApi for Win32Host {
    fn full_path(&self, path: &str) -> Option<String> {
        let path = wide(path);
        let mut buf = vec![0u16; MAX_PATH as usize];
        loop {
            let len = unsafe {
                GetFullPathNameW(path.as_ptr(), buf.len() as u32, buf.as_mut_ptr(), ptr::null_mut())
            } as usize;
            if len == 0 {
                return None;
            }
            if len < buf.len() {
                return Some(from_wide(&buf[..len]));
            }
            buf.resize(len, 0);
        }
    }

    fn file_attributes(&self, path: &str) -> Result<FileAttributes, NativeError> {
        let attributes = unsafe { GetFileAttributesW(wide(path).as_ptr()) };
        if attributes == INVALID_FILE_ATTRIBUTES {
            return Err(last_error());
        }
        Ok(FileAttributes::from_bits_retain(attributes))
    }

    fn find_files<'a>(&'a self, pattern: &str) -> Result<FindIter<'a>, NativeError> {
        let mut data: WIN32_FIND_DATAW = unsafe { mem::zeroed() };
        let handle = unsafe { FindFirstFileW(wide(pattern).as_ptr(), &mut data) };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }
        Ok(Box::new(Search { handle, first: Some(data), done: false }))
    }

    fn read_reparse_point(&self, path: &str) -> Result<Vec<u8>, NativeError> {
        let handle = unsafe {
            CreateFileW(
                wide(path).as_ptr(),
                0,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OPEN_REPARSE_POINT | FILE_FLAG_BACKUP_SEMANTICS,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }
        let mut buffer = vec![0u8; MAXIMUM_REPARSE_DATA_BUFFER_SIZE];
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                handle,
                FSCTL_GET_REPARSE_POINT,
                ptr::null(),
                0,
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                &mut returned,
                ptr::null_mut(),
            )
        };
        let result = if ok == 0 { Err(last_error()) } else { Ok(()) };
        unsafe { CloseHandle(handle) };
        result?;
        buffer.truncate(returned as usize);
        Ok(buffer)
    }

    fn volume_path_names(&self, volume: &str) -> Result<Vec<String>, NativeError> {
        let volume = wide(volume);
        let mut buf = vec![0u16; MAX_PATH as usize];
        loop {
            let mut needed = 0u32;
            let ok = unsafe {
                GetVolumePathNamesForVolumeNameW(
                    volume.as_ptr(),
                    buf.as_mut_ptr(),
                    buf.len() as u32,
                    &mut needed,
                )
            };
            if ok != 0 {
                break;
            }
            match unsafe { GetLastError() } {
                ERROR_MORE_DATA if needed as usize > buf.len() => buf.resize(needed as usize, 0),
                code => return Err(NativeError::from_code(code)),
            }
        }
        // double NUL terminated list
        Ok(buf
            .split(|&c| c == 0)
            .take_while(|name| !name.is_empty())
            .map(String::from_utf16_lossy)
            .collect())
    }

    fn volume_flags(&self, root: &str) -> Option<VolumeFlags> {
        let mut flags = 0u32;
        let ok = unsafe {
            GetVolumeInformationW(
                wide(root).as_ptr(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut flags,
                ptr::null_mut(),
                0,
            )
        };
        (ok != 0).then(|| VolumeFlags::from_bits_retain(flags))
    }

    fn current_drive(&self) -> Option<char> {
        let mut buf = [0u16; MAX_PATH as usize];
        let len = unsafe { GetCurrentDirectoryW(buf.len() as u32, buf.as_mut_ptr()) } as usize;
        if len < 2 || len > buf.len() || buf[1] != u16::from(b':') {
            return None;
        }
        char::from_u32(u32::from(buf[0])).filter(char::is_ascii_alphabetic)
    }

    fn computer_name(&self) -> Option<String> {
        let mut buf = [0u16; 64];
        let mut size = buf.len() as u32;
        if unsafe { GetComputerNameW(buf.as_mut_ptr(), &mut size) } == 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..size as usize]))
    }

    fn enum_shares(&self, server: Option<&str>, resume: u32) -> Result<SharePage, NativeError> {
        let server = server.map(wide);
        let mut buffer: *mut u8 = ptr::null_mut();
        let (mut read, mut total, mut resume_handle) = (0u32, 0u32, resume);
        let status = unsafe {
            NetShareEnum(
                server.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                1,
                &mut buffer,
                MAX_PREFERRED_LENGTH,
                &mut read,
                &mut total,
                &mut resume_handle,
            )
        };
        if status != 0 && status != ERROR_MORE_DATA {
            return Err(NativeError::from_code(status));
        }
        let mut page = SharePage::default();
        if !buffer.is_null() {
            let records =
                unsafe { std::slice::from_raw_parts(buffer.cast::<ShareInfo1>(), read as usize) };
            page.shares = records
                .iter()
                .map(|info| ShareInfo {
                    name: unsafe { from_wide_ptr(info.shi1_netname) },
                    kind: ShareKind::from_type(info.shi1_type),
                })
                .collect();
            unsafe { NetApiBufferFree(buffer.cast()) };
        }
        if status == ERROR_MORE_DATA {
            page.resume = Some(resume_handle);
        }
        Ok(page)
    }

    fn disable_fs_redirection(&self) -> Option<RedirectionCookie> {
        let disable = self.disable?;
        let mut old: *mut c_void = ptr::null_mut();
        (unsafe { disable(&mut old) } != 0).then(|| RedirectionCookie(old as usize))
    }

    fn revert_fs_redirection(&self, cookie: RedirectionCookie) -> bool {
        self.revert.map_or(false, |revert| unsafe { revert(cookie.0 as *mut c_void) } != 0)
    }
}

impl SocketApi for Win32Host {
    fn startup(&self) -> Result<(), NativeError> {
        let mut data: WSADATA = unsafe { mem::zeroed() };
        match unsafe { WSAStartup(0x0202, &mut data) } {
            0 => Ok(()),
            code => Err(NativeError::from_code(code as u32)),
        }
    }

    fn socket(&self, domain: i32, kind: i32, protocol: i32) -> Result<RawSocket, NativeError> {
        let handle = unsafe { socket(domain, kind, protocol) };
        if handle == INVALID_SOCKET {
            return Err(last_socket_error());
        }
        Ok(handle as RawSocket)
    }

    fn bind(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError> {
        let name = SockAddrBuf::encode(addr);
        socket_result(unsafe {
            bind(socket as SOCKET, name.as_ptr().cast::<SOCKADDR>(), name.len() as i32)
        })
    }

    fn listen(&self, socket: RawSocket, backlog: i32) -> Result<(), NativeError> {
        socket_result(unsafe { listen(socket as SOCKET, backlog) })
    }

    fn connect(&self, socket: RawSocket, addr: &SocketAddr) -> Result<(), NativeError> {
        let name = SockAddrBuf::encode(addr);
        socket_result(unsafe {
            connect(socket as SOCKET, name.as_ptr().cast::<SOCKADDR>(), name.len() as i32)
        })
    }

    fn peer_name(&self, socket: RawSocket) -> Result<SocketAddr, NativeError> {
        let mut name = SockAddrBuf::storage();
        let mut len = name.len() as i32;
        socket_result(unsafe {
            getpeername(socket as SOCKET, name.as_mut_ptr().cast::<SOCKADDR>(), &mut len)
        })?;
        name.set_len(len as usize);
        name.decode().ok_or(NativeError::NotSupported)
    }

    fn get_option(
        &self,
        socket: RawSocket,
        level: i32,
        name: i32,
        value: &mut [u8],
    ) -> Result<usize, NativeError> {
        let mut len = value.len().min(i32::MAX as usize) as i32;
        socket_result(unsafe {
            getsockopt(socket as SOCKET, level, name, value.as_mut_ptr(), &mut len)
        })?;
        Ok(len as usize)
    }

    fn set_option(&self, socket: RawSocket, level: i32, name: i32, value: &[u8]) -> Result<(), NativeError> {
        let len = value.len().min(i32::MAX as usize) as i32;
        socket_result(unsafe { setsockopt(socket as SOCKET, level, name, value.as_ptr(), len) })
    }

    fn accept(&self, listener: RawSocket) -> Result<RawSocket, NativeError> {
        let handle = unsafe { accept(listener as SOCKET, ptr::null_mut(), ptr::null_mut()) };
        if handle == INVALID_SOCKET {
            return Err(last_socket_error());
        }
        Ok(handle as RawSocket)
    }

    fn send(&self, socket: RawSocket, buf: &[u8], flags: i32) -> Result<usize, NativeError> {
        let len = buf.len().min(i32::MAX as usize) as i32;
        match unsafe { send(socket as SOCKET, buf.as_ptr(), len, flags) } {
            SOCKET_ERROR => Err(last_socket_error()),
            sent => Ok(sent as usize),
        }
    }

    fn recv(&self, socket: RawSocket, buf: &mut [u8], flags: i32) -> Result<usize, NativeError> {
        let len = buf.len().min(i32::MAX as usize) as i32;
        match unsafe { recv(socket as SOCKET, buf.as_mut_ptr(), len, flags) } {
            SOCKET_ERROR => Err(last_socket_error()),
            received => Ok(received as usize),
        }
    }

    fn shutdown(&self, socket: RawSocket, how: i32) -> Result<(), NativeError> {
        match unsafe { shutdown(socket as SOCKET, how) } {
            SOCKET_ERROR => Err(last_socket_error()),
            _ => Ok(()),
        }
    }

    fn close_socket(&self, socket: RawSocket) -> Result<(), NativeError> {
        match unsafe { closesocket(socket as SOCKET) } {
            SOCKET_ERROR => Err(last_socket_error()),
            _ => Ok(()),
        }
    }

    fn set_inheritable(&self, socket: RawSocket, inherit: bool) {
        let flags = if inherit { HANDLE_FLAG_INHERIT } else { 0 };
        if unsafe { SetHandleInformation(socket as HANDLE, HANDLE_FLAG_INHERIT, flags) } == 0 {
            log::debug!("socket {socket:#x}: inheritance unchanged: {}", last_error());
        }
    }

    fn set_nonblocking(&self, socket: RawSocket, nonblocking: bool) -> Result<(), NativeError> {
        let mut mode = u32::from(nonblocking);
        match unsafe { ioctlsocket(socket as SOCKET, FIONBIO, &mut mode) } {
            SOCKET_ERROR => Err(last_socket_error()),
            _ => Ok(()),
        }
    }

    fn poll(&self, fds: &mut [NativePollFd], timeout_ms: i32) -> Result<usize, NativeError> {
        let mut native: Vec<WSAPOLLFD> = fds
            .iter()
            .map(|fd| WSAPOLLFD { fd: fd.socket as SOCKET, events: fd.events.bits(), revents: 0 })
            .collect();
        let ready = unsafe { WSAPoll(native.as_mut_ptr(), native.len() as u32, timeout_ms) };
        if ready == SOCKET_ERROR {
            return Err(last_socket_error());
        }
        for (fd, result) in fds.iter_mut().zip(&native) {
            fd.revents = PollEvents::from_bits_retain(result.revents);
        }
        Ok(ready as usize)
    }

    fn addr_info(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: &AddrHints,
    ) -> Result<Vec<AddrInfo>, NativeError> {
        let node = node.map(c_string).transpose()?;
        let service = service.map(c_string).transpose()?;
        let mut request: ADDRINFOA = unsafe { mem::zeroed() };
        request.ai_flags = hints.flags;
        request.ai_family = hints.family;
        request.ai_socktype = hints.kind;
        request.ai_protocol = hints.protocol;

        let mut list: *mut ADDRINFOA = ptr::null_mut();
        let ret = unsafe {
            getaddrinfo(
                node.as_ref().map_or(ptr::null(), |n| n.as_ptr().cast()),
                service.as_ref().map_or(ptr::null(), |s| s.as_ptr().cast()),
                &request,
                &mut list,
            )
        };
        if ret != 0 {
            return Err(NativeError::from_code(ret as u32));
        }
        let mut results = Vec::new();
        let mut at = list;
        while !at.is_null() {
            let info = unsafe { &*at };
            let bytes = unsafe {
                std::slice::from_raw_parts(info.ai_addr.cast::<u8>(), info.ai_addrlen)
            };
            if let Some(address) = sockaddr::decode(bytes) {
                let canonical_name = (!info.ai_canonname.is_null()).then(|| unsafe {
                    CStr::from_ptr(info.ai_canonname.cast()).to_string_lossy().into_owned()
                });
                results.push(AddrInfo {
                    family: info.ai_family,
                    kind: info.ai_socktype,
                    protocol: info.ai_protocol,
                    canonical_name,
                    address,
                });
            }
            at = info.ai_next;
        }
        unsafe { freeaddrinfo(list) };
        Ok(results)
    }

    fn host_by_name(&self, name: &str) -> Result<HostEntry, NativeError> {
        let name = c_string(name)?;
        let entry = unsafe { gethostbyname(name.as_ptr().cast()) };
        if entry.is_null() {
            return Err(last_socket_error());
        }
        let entry = unsafe { &*entry };
        let addresses = if entry.h_length == 4 {
            let mut addresses = Vec::new();
            let mut at = entry.h_addr_list as *const *const u8;
            unsafe {
                while !at.is_null() && !(*at).is_null() {
                    let octets: [u8; 4] = *(*at).cast::<[u8; 4]>();
                    addresses.push(IpAddr::V4(Ipv4Addr::from(octets)));
                    at = at.add(1);
                }
            }
            addresses
        } else {
            Vec::new()
        };
        Ok(HostEntry {
            name: unsafe { CStr::from_ptr(entry.h_name.cast()) }.to_string_lossy().into_owned(),
            aliases: unsafe { string_list(entry.h_aliases as *const *const u8) },
            addresses,
        })
    }
}

impl CrtApi for Win32Host {
    fn open_osfhandle(&self, handle: RawSocket) -> Option<i32> {
        let fd = unsafe { _open_osfhandle(handle as isize, 0) };
        (fd >= 0).then_some(fd)
    }

    fn get_osfhandle(&self, fd: i32) -> Option<RawSocket> {
        let handle = unsafe { _get_osfhandle(fd) };
        (handle != INVALID_HANDLE_VALUE && handle != -2).then_some(handle as RawSocket)
    }

    fn close_fd(&self, fd: i32) -> bool {
        unsafe { _close(fd) == 0 }
    }

    fn is_socket_handle(&self, handle: RawSocket) -> bool {
        let handle = handle as HANDLE;
        unsafe {
            GetFileType(handle) == FILE_TYPE_PIPE
                && GetNamedPipeInfo(
                    handle,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                ) == 0
        }
    }
}

impl ModuleLoader for Win32Host {
    fn load_library(&self, path: &str) -> Result<ModuleHandle, NativeError> {
        let module = unsafe { LoadLibraryW(wide(path).as_ptr()) };
        if module == 0 {
            return Err(last_error());
        }
        Ok(module as ModuleHandle)
    }

    fn free_library(&self, module: ModuleHandle) -> Result<(), NativeError> {
        if unsafe { FreeLibrary(module as _) } == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn symbol(&self, module: ModuleHandle, name: &str) -> Option<usize> {
        let mut name = name.as_bytes().to_vec();
        name.push(0);
        unsafe { GetProcAddress(module as _, name.as_ptr()) }.map(|f| f as usize)
    }

    fn program_module(&self) -> ModuleHandle {
        unsafe { GetModuleHandleW(ptr::null()) as ModuleHandle }
    }
}

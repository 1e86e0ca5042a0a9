//! Mapping between small POSIX descriptors and native socket handles.
//!
//! Winsock handles are kernel handles, not CRT descriptors. A socket whose
//! handle value is below the hard limit is wrapped in a CRT descriptor and
//! recorded here under that descriptor; larger handles are used as
//! descriptors directly. Lookups of unrecorded descriptors fall back to the
//! CRT's own table below the soft limit.

use crate::config::DescriptorLimits;
use crate::platform::{CrtApi, RawSocket};

/// Lowest descriptor the pipe-handle socket check looks at.
const SOCKET_CHECK_FLOOR: i32 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    Vacant,
    Socket(RawSocket),
}

/// What a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    File(i32),
    Socket(RawSocket),
}

#[derive(Debug)]
pub struct SocketTable {
    slots: Vec<Slot>,
    hard_limit: usize,
    soft_limit: usize,
}

impl SocketTable {
    pub fn new(limits: &DescriptorLimits) -> Self {
        Self {
            slots: Vec::new(),
            hard_limit: limits.hard_limit,
            soft_limit: limits.soft_limit.min(limits.hard_limit),
        }
    }

    /// Allocate the slots once. An allocation failure leaves the table
    /// unallocated; lookups then go to the CRT.
    pub fn init(&mut self) {
        if self.is_initialised() {
            return;
        }
        let mut slots = Vec::new();
        if slots.try_reserve_exact(self.hard_limit).is_err() {
            log::warn!("socket table: cannot allocate {} slots", self.hard_limit);
            return;
        }
        slots.resize(self.hard_limit, Slot::Vacant);
        self.slots = slots;
    }

    pub fn is_initialised(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.hard_limit
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    fn index(&self, fd: i32) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.hard_limit)
    }

    fn slot(&self, fd: i32) -> Option<Slot> {
        self.index(fd).and_then(|i| self.slots.get(i)).copied()
    }

    fn beyond_table(&self, fd: i32) -> bool {
        usize::try_from(fd).map_or(false, |i| i >= self.hard_limit)
    }

    fn below_soft_limit(&self, fd: i32) -> bool {
        usize::try_from(fd).map_or(false, |i| i < self.soft_limit)
    }

    /// Record `handle` under `fd`, raising the soft limit past `fd` if needed.
    pub fn register(&mut self, fd: i32, handle: RawSocket) {
        debug_assert!(self.index(fd).is_some(), "descriptor {fd} outside the socket table");
        self.init();
        let Some(index) = self.index(fd) else {
            log::warn!("socket table: descriptor {fd} out of range, not recorded");
            return;
        };
        if index >= self.soft_limit {
            self.soft_limit = (index + 1).min(self.hard_limit);
        }
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Socket(handle);
            log::trace!("socket table: {fd} -> {handle:#x}");
        }
    }

    /// True when `fd` is a CRT descriptor rather than a raw handle value.
    pub fn is_crt_descriptor(&self, fd: i32) -> bool {
        self.index(fd).is_some()
    }

    /// Native handle behind `fd`.
    pub fn lookup<C>(&self, fd: i32, crt: &C) -> Option<RawSocket>
    where
        C: CrtApi + ?Sized,
    {
        if self.beyond_table(fd) {
            return Some(fd as RawSocket);
        }
        if let Some(Slot::Socket(handle)) = self.slot(fd) {
            return Some(handle);
        }
        if self.below_soft_limit(fd) {
            return crt.get_osfhandle(fd);
        }
        None
    }

    /// Forget `fd`, provided it still maps to `handle` (any handle if `None`).
    pub fn unregister(&mut self, fd: i32, handle: Option<RawSocket>) {
        let Some(index) = self.index(fd) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(index) {
            let matches = match (handle, *slot) {
                (None, _) => true,
                (Some(wanted), Slot::Socket(current)) => wanted == current,
                (Some(_), Slot::Vacant) => false,
            };
            if matches {
                *slot = Slot::Vacant;
            }
        }
    }

    /// Guess whether `fd` names a socket, returning its handle.
    ///
    /// Socket handles and CRT descriptors share the same small integers, so
    /// an unrecorded descriptor is classified by probing: a 4-aligned value
    /// of at least 0x80 whose object looks like a socket is taken as a raw
    /// handle, and anything the CRT does not know is assumed to be one. A
    /// file handle can pass for a socket and vice versa.
    pub fn is_socket<C>(&self, fd: i32, crt: &C) -> Option<RawSocket>
    where
        C: CrtApi + ?Sized,
    {
        if fd < 0 {
            return None;
        }
        if self.beyond_table(fd) {
            return Some(fd as RawSocket);
        }
        if let Some(Slot::Socket(handle)) = self.slot(fd) {
            return Some(handle);
        }
        let raw = fd as RawSocket;
        if fd >= SOCKET_CHECK_FLOOR && fd & 0x3 == 0 && crt.is_socket_handle(raw) {
            return Some(raw);
        }
        if !self.below_soft_limit(fd) || crt.get_osfhandle(fd).is_none() {
            return Some(raw);
        }
        None
    }

    /// Classify `fd`; `None` for negative descriptors.
    pub fn resolve<C>(&self, fd: i32, crt: &C) -> Option<Descriptor>
    where
        C: CrtApi + ?Sized,
    {
        if fd < 0 {
            return None;
        }
        Some(match self.is_socket(fd, crt) {
            Some(handle) => Descriptor::Socket(handle),
            None => Descriptor::File(fd),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;
    use crate::platform::SocketApi;

    fn table() -> SocketTable {
        SocketTable::new(&DescriptorLimits::default())
    }

    #[test]
    fn test_register_lookup_unregister() {
        let host = MemHost::new();
        let mut sockets = table();
        assert!(!sockets.is_initialised());
        sockets.register(5, 0x1234);
        assert!(sockets.is_initialised());
        assert_eq!(sockets.lookup(5, &host), Some(0x1234));

        // wrong handle leaves the slot alone
        sockets.unregister(5, Some(0x9999));
        assert_eq!(sockets.lookup(5, &host), Some(0x1234));

        sockets.unregister(5, Some(0x1234));
        assert_eq!(sockets.lookup(5, &host), None);
        assert_eq!(sockets.lookup(1, &host), host.get_osfhandle(1));
    }

    #[test]
    fn test_beyond_hard_limit_is_the_handle() {
        let host = MemHost::new();
        let sockets = table();
        assert_eq!(sockets.lookup(9000, &host), Some(9000));
        assert_eq!(sockets.is_socket(9000, &host), Some(9000));
        assert_eq!(sockets.lookup(600, &host), None);
    }

    #[test]
    fn test_soft_limit_rises() {
        let host = MemHost::new();
        let mut sockets = table();
        sockets.register(700, 0x2c0);
        assert_eq!(sockets.soft_limit(), 701);
        sockets.unregister(700, None);
        // 690 is now below the soft limit and unknown to the CRT
        assert_eq!(sockets.lookup(690, &host), None);
        assert_eq!(sockets.is_socket(690, &host), Some(690));
    }

    #[test]
    fn test_registered_descriptor_stays_below_soft_limit() {
        let host = MemHost::new();
        let mut sockets = table();
        sockets.register(700, 0x2c0);
        sockets.unregister(700, Some(0x2c0));
        // the CRT hands 700 out again, this time for a file
        host.open_file_at(700);
        assert_eq!(sockets.lookup(700, &host), host.get_osfhandle(700));
        assert_eq!(sockets.resolve(700, &host), Some(Descriptor::File(700)));
    }

    #[test]
    fn test_soft_limit_capped_at_hard_limit() {
        let limits = DescriptorLimits { hard_limit: 16, soft_limit: 4 };
        let mut sockets = SocketTable::new(&limits);
        sockets.register(15, 0x40);
        assert_eq!(sockets.soft_limit(), 16);
        assert!(sockets.is_crt_descriptor(15));
        assert!(!sockets.is_crt_descriptor(16));
    }

    #[test]
    fn test_is_socket_classification() {
        let host = MemHost::new();
        let sockets = table();
        assert_eq!(sockets.is_socket(-1, &host), None);
        // stdin is a CRT file
        assert_eq!(sockets.resolve(0, &host), Some(Descriptor::File(0)));
        // nothing open at 40: assumed raw socket
        assert_eq!(sockets.resolve(40, &host), Some(Descriptor::Socket(40)));

        host.startup().unwrap();
        host.set_next_socket(0x100);
        let raw = host.socket(2, 1, 0).unwrap();
        assert_eq!(sockets.is_socket(raw as i32, &host), Some(raw));
    }

    #[test]
    fn test_uninitialised_table_uses_crt() {
        let host = MemHost::new();
        let sockets = table();
        assert_eq!(sockets.lookup(2, &host), host.get_osfhandle(2));
        assert_eq!(sockets.resolve(-3, &host), None);
    }
}

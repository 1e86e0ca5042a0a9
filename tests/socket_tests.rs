#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use libw32::platform::{CrtApi, SocketApi};
    use libw32::socket::{h_errno, hstrerror, FdSet, WSAHOST_NOT_FOUND};
    use libw32::{
        AddrHints, Config, DescriptorLimits, Descriptor, Error, MemHost, PollEvents, PollFd, Process,
        SocketTable,
    };

    const AF_INET: i32 = 2;
    const SOCK_STREAM: i32 = 1;
    const MSG_PEEK: i32 = 2;
    const SOL_SOCKET: i32 = 0xffff;
    const SO_ERROR: i32 = 0x1007;
    const WSAECONNREFUSED: i32 = 10061;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Listening descriptor plus a connected (client, server) descriptor pair.
    fn connected(proc: &mut Process, host: &MemHost) -> (i32, i32, i32) {
        let listener = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        proc.bind(listener, &loopback(0)).unwrap();
        proc.listen(listener, 4).unwrap();
        let addr = host.local_addr(proc.socket_handle(listener).unwrap()).unwrap();
        let client = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        proc.connect(client, &addr).unwrap();
        let server = proc.accept(listener).unwrap();
        (listener, client, server)
    }

    // Descriptor table
    //-------------

    #[test]
    fn register_lookup_until_unregister() {
        let (_proc, host) = Process::in_memory();
        let mut table = SocketTable::new(&DescriptorLimits::default());
        for (fd, handle) in [(3, 0x1f0u64), (100, 0x2000), (511, 0x30)] {
            table.register(fd, handle);
            assert_eq!(table.lookup(fd, &*host), Some(handle));
            table.unregister(fd, Some(handle));
            assert_eq!(table.lookup(fd, &*host), host.get_osfhandle(fd));
        }
        // stdout still resolves through the CRT
        assert!(table.lookup(1, &*host).is_some());
    }

    #[test]
    fn limits_come_from_config() {
        let config = Config::from_toml("[descriptors]\nhard_limit = 64\nsoft_limit = 16").unwrap();
        let host = std::sync::Arc::new(MemHost::new());
        let mut proc = Process::new(host.clone(), config);
        assert_eq!(proc.sockets().capacity(), 64);
        assert_eq!(proc.sockets().soft_limit(), 16);

        // handles at or above the capacity are their own descriptor
        host.startup().unwrap();
        host.set_next_socket(0x400);
        let fd = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        assert_eq!(fd, 0x400);
        assert_eq!(proc.socket_handle(fd), Ok(0x400));
        assert!(!proc.sockets().is_initialised());
    }

    // Socket calls
    //-------------

    #[test]
    fn socket_starts_winsock_once() {
        let (mut proc, host) = Process::in_memory();
        assert_eq!(host.startup_count(), 0);
        let a = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let b = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        assert_eq!(host.startup_count(), 1);
        assert_eq!((a, b), (3, 4));

        let raw = proc.socket_handle(a).unwrap();
        assert!(host.is_open_socket(raw));
        assert_eq!(host.is_inheritable(raw), Some(false));
        assert_eq!(proc.sockets().resolve(a, &*host), Some(Descriptor::Socket(raw)));
    }

    #[test]
    fn unwrappable_socket_is_closed() {
        let (mut proc, host) = Process::in_memory();
        host.startup().unwrap();
        host.refuse_osfhandle(true);
        host.set_next_socket(0x300);
        assert_eq!(proc.socket(AF_INET, SOCK_STREAM, 0), Err(Error::TooManyOpenFiles));
        assert!(!host.is_open_socket(0x300));
    }

    #[test]
    fn send_and_recv_between_peers() {
        let (mut proc, host) = Process::in_memory();
        let (_listener, client, server) = connected(&mut proc, &host);

        proc.send(client, b"hello", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(proc.recv(server, &mut buf, MSG_PEEK), Ok(5));
        assert_eq!(proc.recv(server, &mut buf[..3], 0), Ok(3));
        assert_eq!(&buf[..3], b"hel");
        assert_eq!(proc.recv(server, &mut buf, 0), Ok(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(proc.recv(server, &mut buf, 0), Err(Error::WouldBlock));

        assert_eq!(proc.send(server, b"back", 0), Ok(4));
        assert_eq!(proc.recv(client, &mut buf, 0), Ok(4));

        proc.shutdown(client, 1).unwrap();
        assert_eq!(proc.recv(server, &mut buf, 0), Ok(0));
    }

    #[test]
    fn accept_without_pending_connection_would_block() {
        let (mut proc, _host) = Process::in_memory();
        let listener = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        assert_eq!(proc.accept(listener).unwrap_err().errno(), libc::EINVAL);

        proc.bind(listener, &loopback(0)).unwrap();
        proc.listen(listener, 1).unwrap();
        let err = proc.accept(listener).unwrap_err();
        assert_eq!(err, Error::WouldBlock);
        assert_eq!(err.errno(), libc::EAGAIN);
    }

    #[test]
    fn bind_listen_connect_and_peer_names() {
        let (mut proc, host) = Process::in_memory();
        let listener = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        proc.bind(listener, &loopback(8080)).unwrap();
        proc.listen(listener, 4).unwrap();

        let other = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let err = proc.bind(other, &loopback(8080)).unwrap_err();
        assert_eq!(err, Error::AddressInUse);
        assert_eq!(err.errno(), libc::EADDRINUSE);
        assert_eq!(proc.getpeername(other).unwrap_err().errno(), libc::ENOTCONN);

        proc.connect(other, &loopback(8080)).unwrap();
        let server = proc.accept(listener).unwrap();
        assert_eq!(proc.getpeername(other), Ok(loopback(8080)));
        let client_addr = host.local_addr(proc.socket_handle(other).unwrap()).unwrap();
        assert_eq!(proc.getpeername(server), Ok(client_addr));

        let refused = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let err = proc.connect(refused, &loopback(9)).unwrap_err();
        assert_eq!(err.errno(), libc::ECONNREFUSED);
    }

    #[test]
    fn socket_options_round_trip() {
        let (mut proc, _host) = Process::in_memory();
        let fd = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let (level, name) = (SOL_SOCKET, 0x0004);
        proc.setsockopt(fd, level, name, &1i32.to_ne_bytes()).unwrap();
        let mut value = [0u8; 4];
        assert_eq!(proc.getsockopt(fd, level, name, &mut value), Ok(4));
        assert_eq!(i32::from_ne_bytes(value), 1);
        assert_eq!(proc.getsockopt(fd, level, SO_ERROR, &mut value), Ok(4));
        assert_eq!(i32::from_ne_bytes(value), 0);
        assert_eq!(proc.getsockopt(fd, level, SO_ERROR, &mut [0u8; 1]).unwrap_err().errno(), libc::EFAULT);
    }

    #[test]
    fn shutdown_and_blocking_mode() {
        let (mut proc, host) = Process::in_memory();
        let (_listener, client, server) = connected(&mut proc, &host);
        proc.set_blocking(server, false).unwrap();
        assert_eq!(host.is_nonblocking(proc.socket_handle(server).unwrap()), Some(true));

        proc.shutdown(server, 1).unwrap();
        assert!(matches!(proc.send(server, b"x", 0), Err(Error::Io(_))));
        let mut buf = [0u8; 1];
        assert_eq!(proc.recv(client, &mut buf, 0), Ok(0));
        let err = proc.shutdown(server, 7).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn unknown_descriptors_are_bad() {
        let (mut proc, _host) = Process::in_memory();
        let mut buf = [0u8; 4];
        assert_eq!(proc.send(600, b"x", 0), Err(Error::BadDescriptor));
        assert_eq!(proc.recv(-1, &mut buf, 0), Err(Error::BadDescriptor));
        assert_eq!(proc.sockclose(-1).unwrap_err().errno(), libc::EBADF);
    }

    #[test]
    fn sockclose_releases_the_socket() {
        let (mut proc, host) = Process::in_memory();
        let fd = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        let raw = proc.socket_handle(fd).unwrap();
        proc.sockclose(fd).unwrap();
        assert!(!host.is_open_socket(raw));
        assert_eq!(host.get_osfhandle(fd), None);
        // the descriptor is gone from both the table and the CRT
        assert_eq!(proc.sockclose(fd), Err(Error::BadDescriptor));
    }

    #[test]
    fn sockclose_frees_the_crt_descriptor_for_reuse() {
        let (mut proc, host) = Process::in_memory();
        host.set_max_fds(8);
        let open = host.open_fds();
        for _ in 0..10 {
            let fd = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
            assert_eq!(fd, 3);
            proc.sockclose(fd).unwrap();
            assert_eq!(host.open_fds(), open);
        }
        let fds: Vec<i32> = (0..5).map(|_| proc.socket(AF_INET, SOCK_STREAM, 0).unwrap()).collect();
        assert_eq!(fds, vec![3, 4, 5, 6, 7]);
        assert_eq!(proc.socket(AF_INET, SOCK_STREAM, 0), Err(Error::TooManyOpenFiles));
    }

    // poll and select
    //-------------

    #[test]
    fn poll_mixes_files_and_sockets() {
        let (mut proc, host) = Process::in_memory();
        let (listener, client, server) = connected(&mut proc, &host);
        let file = host.open_file().unwrap();

        let mut fds = [
            PollFd::new(server, PollEvents::IN | PollEvents::OUT),
            PollFd::new(file, PollEvents::IN),
            PollFd::new(-1, PollEvents::IN),
            PollFd::new(listener, PollEvents::IN),
        ];
        assert_eq!(proc.poll(&mut fds, 0), Ok(2));
        assert_eq!(fds[0].revents, PollEvents::OUT);
        assert_eq!(fds[1].revents, PollEvents::IN);
        assert!(fds[2].revents.is_empty());
        assert!(fds[3].revents.is_empty());

        proc.send(client, b"ping", 0).unwrap();
        proc.poll(&mut fds, 0).unwrap();
        assert!(fds[0].revents.contains(PollEvents::RDNORM | PollEvents::OUT));

        // out of band data is never reported, but asking for it is allowed
        fds[0].events |= PollEvents::PRI;
        proc.poll(&mut fds, 0).unwrap();
        assert!(!fds[0].revents.contains(PollEvents::PRI));

        proc.sockclose(client).unwrap();
        proc.poll(&mut fds, 0).unwrap();
        assert!(fds[0].revents.contains(PollEvents::HUP));
        assert!(!fds[0].revents.contains(PollEvents::OUT));
    }

    #[test]
    fn select_reports_ready_descriptors() {
        let (mut proc, host) = Process::in_memory();
        let (listener, client, server) = connected(&mut proc, &host);
        let file = host.open_file().unwrap();

        let mut read = FdSet::new();
        read.insert(server);
        read.insert(file);
        read.insert(listener);
        let mut write = FdSet::new();
        write.insert(server);

        let nfds = server.max(file).max(listener) + 1;
        assert_eq!(proc.select(nfds, Some(&mut read), Some(&mut write), None, 0), Ok(2));
        assert_eq!(read.iter().collect::<Vec<_>>(), vec![file]);
        assert!(write.contains(server));

        proc.send(client, b"!", 0).unwrap();
        read.insert(server);
        read.insert(listener);
        assert_eq!(proc.select(nfds, Some(&mut read), None, None, 0), Ok(2));
        assert!(read.contains(server) && read.contains(file));
        assert!(!read.contains(listener));

        // descriptors at or above nfds are not looked at
        let mut high = FdSet::new();
        high.insert(server);
        assert_eq!(proc.select(server, Some(&mut high), None, None, 0), Ok(0));
        assert!(high.is_empty());
        assert!(matches!(proc.select(-1, None, None, None, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn select_except_set_on_healthy_socket() {
        let (mut proc, host) = Process::in_memory();
        let (_listener, client, server) = connected(&mut proc, &host);
        let mut except = FdSet::new();
        except.insert(server);
        except.insert(client);
        let nfds = server.max(client) + 1;
        assert_eq!(proc.select(nfds, None, None, Some(&mut except), 0), Ok(0));
        assert!(except.is_empty());

        let mut write = FdSet::new();
        write.insert(client);
        except.insert(client);
        assert_eq!(proc.select(nfds, None, Some(&mut write), Some(&mut except), 0), Ok(1));
        assert!(write.contains(client));
        assert!(except.is_empty());
    }

    #[test]
    fn select_reports_failed_connect_in_except_set() {
        let (mut proc, _host) = Process::in_memory();
        let fd = proc.socket(AF_INET, SOCK_STREAM, 0).unwrap();
        proc.set_blocking(fd, false).unwrap();
        assert_eq!(proc.connect(fd, &loopback(9)), Err(Error::WouldBlock));

        let mut write = FdSet::new();
        write.insert(fd);
        let mut except = FdSet::new();
        except.insert(fd);
        assert_eq!(proc.select(fd + 1, None, Some(&mut write), Some(&mut except), 0), Ok(2));
        assert!(write.contains(fd) && except.contains(fd));

        let mut value = [0u8; 4];
        proc.getsockopt(fd, SOL_SOCKET, SO_ERROR, &mut value).unwrap();
        assert_eq!(i32::from_ne_bytes(value), WSAECONNREFUSED);
        // reading SO_ERROR clears it
        proc.getsockopt(fd, SOL_SOCKET, SO_ERROR, &mut value).unwrap();
        assert_eq!(i32::from_ne_bytes(value), 0);
    }

    // Name lookups
    //-------------

    #[test]
    fn lookups_start_winsock() {
        let (mut proc, host) = Process::in_memory();
        host.add_host("build.example", &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        assert_eq!(host.startup_count(), 0);

        let found = proc.getaddrinfo(Some("build.example"), Some("http"), &AddrHints::default()).unwrap();
        assert_eq!(host.startup_count(), 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "10.0.0.7:80".parse::<SocketAddr>().unwrap());
        assert_eq!(found[0].family, AF_INET);

        let entry = proc.gethostbyname("localhost").unwrap();
        assert_eq!(entry.addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(h_errno(), 0);
        assert_eq!(host.startup_count(), 1);
    }

    #[test]
    fn failed_lookups_set_h_errno() {
        let (mut proc, _host) = Process::in_memory();
        let err = proc.gethostbyname("nowhere.invalid").unwrap_err();
        assert_eq!(err, Error::HostLookup { host: "nowhere.invalid".into(), code: WSAHOST_NOT_FOUND });
        assert_eq!(h_errno(), WSAHOST_NOT_FOUND);
        assert_eq!(hstrerror(h_errno()), "host not found");

        let err = proc.getaddrinfo(Some("nowhere.invalid"), None, &AddrHints::default()).unwrap_err();
        assert!(matches!(err, Error::HostLookup { code: WSAHOST_NOT_FOUND, .. }));
        proc.gethostbyname("localhost").unwrap();
        assert_eq!(h_errno(), 0);
    }
}

#![allow(dead_code)]

use bluemgmt::{Connection, ConnectionConfig, Event, EventCode, Socket};
use std::time::Duration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Connected pair of non-blocking sequential packet sockets.
pub fn socket_pair() -> (Socket, Socket) {
    let mut fds = [0; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair failed: {}", std::io::Error::last_os_error());
    unsafe { (Socket::from_raw_fd(fds[0]).unwrap(), Socket::from_raw_fd(fds[1]).unwrap()) }
}

/// Connection whose socket is connected to a fake kernel.
pub fn pair(config: ConnectionConfig) -> (Connection, Kernel) {
    init_logger();
    let (local, remote) = socket_pair();
    let conn = Connection::from_socket(local, config).unwrap();
    (conn, Kernel { socket: remote })
}

pub fn short_timeout(ms: u64) -> ConnectionConfig {
    ConnectionConfig { command_timeout: Duration::from_millis(ms), ..Default::default() }
}

/// Command as received by the fake kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub opcode: u16,
    pub index: u16,
    pub params: Vec<u8>,
}

/// Kernel side of the management socket.
pub struct Kernel {
    pub socket: Socket,
}

impl Kernel {
    pub async fn recv(&self) -> Received {
        tokio::time::timeout(Duration::from_secs(5), self.recv_inner())
            .await
            .expect("no command received")
            .expect("connection closed")
    }

    /// Receives the next command, or `None` once the connection side is closed.
    async fn recv_inner(&self) -> Option<Received> {
        let mut buf = vec![0; 2048];
        let n = self.socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        let frame = Event::decode(&buf[..n]).unwrap();
        Some(Received { opcode: frame.code(), index: frame.index(), params: frame.payload().to_vec() })
    }

    /// Returns a command if one arrives within the specified time.
    pub async fn try_recv(&self, wait: Duration) -> Option<Received> {
        tokio::time::timeout(wait, self.recv_inner()).await.ok().flatten()
    }

    pub async fn send_raw(&self, frame: &[u8]) {
        self.socket.write_all(frame).await.unwrap();
    }

    pub async fn send(&self, code: impl Into<u16>, index: u16, payload: &[u8]) {
        self.send_raw(&Event::new(code, index, payload).unwrap().encode()).await;
    }

    pub async fn complete(&self, index: u16, opcode: impl Into<u16>, status: u8, result: &[u8]) {
        let mut payload = opcode.into().to_le_bytes().to_vec();
        payload.push(status);
        payload.extend_from_slice(result);
        self.send(EventCode::CommandComplete, index, &payload).await;
    }

    pub async fn status(&self, index: u16, opcode: impl Into<u16>, status: u8) {
        let mut payload = opcode.into().to_le_bytes().to_vec();
        payload.push(status);
        self.send(EventCode::CommandStatus, index, &payload).await;
    }

    /// Answers the next command with a successful completion.
    pub async fn answer(&self, result: &[u8]) -> Received {
        let cmd = self.recv().await;
        self.complete(cmd.index, cmd.opcode, 0x00, result).await;
        cmd
    }
}

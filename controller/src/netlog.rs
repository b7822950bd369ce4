//! Forwards log lines as UDP datagrams to the configured log server.

use std::{
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{Arc, OnceLock},
};

pub const LOG_PORT: u16 = 9911;

/// `None` while the stored server address is unset (leading zero octet).
pub fn log_destination(server: [u8; 4]) -> Option<SocketAddr> {
    (server[0] != 0)
        .then(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(server), LOG_PORT)))
}

/// Attaches `sink` to the stored log server, if one is set, and reports
/// the outcome through the log itself.
pub fn attach_configured(sink: &UdpLogSink, server: [u8; 4]) {
    match sink.attach(server) {
        Ok(true) => log::info!("forwarding log lines to {}", Ipv4Addr::from(server)),
        Ok(false) => {}
        Err(err) => log::warn!("log server unavailable: {err}"),
    }
}

/// Cloneable handle to a sink that is attached once the network is up.
/// Until then every line is dropped.
#[derive(Debug, Clone, Default)]
pub struct UdpLogSink {
    target: Arc<OnceLock<(UdpSocket, SocketAddr)>>,
}

impl UdpLogSink {
    /// Attaches to the server in the stored record. Returns `false` when no
    /// server is set or a sink is already attached.
    pub fn attach(&self, server: [u8; 4]) -> io::Result<bool> {
        match log_destination(server) {
            Some(dest) => self.attach_to(dest),
            None => Ok(false),
        }
    }

    pub fn attach_to(&self, dest: SocketAddr) -> io::Result<bool> {
        if self.target.get().is_some() {
            return Ok(false);
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        Ok(self.target.set((socket, dest)).is_ok())
    }

    pub fn is_attached(&self) -> bool {
        self.target.get().is_some()
    }

    /// Best effort; a lost datagram is not worth reporting through the log.
    pub fn send(&self, line: &[u8]) {
        if let Some((socket, dest)) = self.target.get() {
            let _ = socket.send_to(line, dest);
        }
    }

    pub fn writer(&self) -> UdpLogWriter {
        UdpLogWriter { sink: self.clone() }
    }
}

/// One datagram per `write` call.
pub struct UdpLogWriter {
    sink: UdpLogSink,
}

impl Write for UdpLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.send(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn unset_server_has_no_destination() {
        assert_eq!(log_destination([0, 0, 0, 0]), None);
        assert_eq!(log_destination([0, 168, 1, 2]), None);
        assert_eq!(
            log_destination([192, 168, 1, 2]),
            Some("192.168.1.2:9911".parse().unwrap())
        );
    }

    #[test]
    fn unset_server_leaves_sink_detached() {
        let sink = UdpLogSink::default();
        assert!(!sink.attach([0, 0, 0, 0]).unwrap());
        assert!(!sink.is_attached());
        sink.send(b"dropped\n");
    }

    #[test]
    fn each_write_becomes_one_datagram() {
        let (socket, addr) = receiver();
        let sink = UdpLogSink::default();
        assert!(sink.attach_to(addr).unwrap());

        let mut writer = sink.clone().writer();
        writer.write_all(b"INFO relay ON\n").unwrap();

        let mut buf = [0u8; 64];
        let len = socket.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"INFO relay ON\n");
    }

    #[test]
    fn first_attachment_wins() {
        let (_socket, addr) = receiver();
        let sink = UdpLogSink::default();
        assert!(sink.attach_to(addr).unwrap());
        assert!(!sink.attach([10, 0, 0, 1]).unwrap());
    }
}

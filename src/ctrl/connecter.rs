use std::io::{self, prelude::*};
use std::net::*;
use std::time::Duration;

use thiserror::Error;

use super::wire::{self, WireError, RECORD_LEN};
use crate::rdma::info::ConnectionInfo;

/// Metadata exchange error. Every variant names the step that failed.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept")]
    Accept(#[source] io::Error),

    #[error("failed to connect with {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure the socket")]
    Configure(#[source] io::Error),

    #[error("failed to send local connection info")]
    Write(#[source] io::Error),

    #[error("failed to receive remote connection info")]
    Read(#[source] io::Error),

    #[error("peer closed after {got} of 78 record bytes")]
    ShortRead { got: usize },

    #[error("malformed remote connection info")]
    Malformed(#[source] WireError),

    #[error("cannot encode local connection info")]
    Encode(#[source] WireError),
}

/// How the client reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Total connect attempts per resolved address list. At least 1.
    pub attempts: u32,
    /// Sleep between two rounds of attempts.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            retry_interval: Duration::from_millis(200),
        }
    }
}

/// Server side of the rendezvous: a listening socket that hands out exactly
/// one connection.
pub struct MetadataListener {
    listener: TcpListener,
}

impl MetadataListener {
    /// The default TCP port.
    pub const DEFAULT_PORT: u16 = 18515;

    /// Listen on all interfaces at `port`. Port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> Result<Self, ExchangeError> {
        let inaddr_any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(inaddr_any).map_err(|source| ExchangeError::Bind {
            addr: inaddr_any.to_string(),
            source,
        })?;
        log::debug!("metadata channel listening on {}", inaddr_any);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one peer. The listening socket is closed afterwards.
    pub fn accept(self) -> Result<MetadataChannel, ExchangeError> {
        let (stream, peer) = self.listener.accept().map_err(ExchangeError::Accept)?;
        log::debug!("metadata channel accepted {}", peer);
        Ok(MetadataChannel { stream, peer })
    }
}

/// A connected byte stream that carries one [`ConnectionInfo`] each way.
pub struct MetadataChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl MetadataChannel {
    /// Resolve `host` and connect to the first address that accepts.
    ///
    /// Every resolved address is tried in each round; rounds repeat up to
    /// `opts.attempts` times with `opts.retry_interval` in between.
    pub fn connect(host: &str, port: u16, opts: &ConnectOptions) -> Result<Self, ExchangeError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| ExchangeError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .collect::<Vec<_>>();

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        let mut last_addr = format!("{}:{}", host, port);
        for attempt in 0..opts.attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(opts.retry_interval);
            }
            for addr in &addrs {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        log::debug!("metadata channel connected to {}", addr);
                        return Ok(Self { stream, peer: *addr });
                    }
                    Err(e) => {
                        log::debug!("connect to {} failed: {}", addr, e);
                        last_addr = addr.to_string();
                        last_err = e;
                    }
                }
            }
        }
        Err(ExchangeError::Connect {
            addr: last_addr,
            source: last_err,
        })
    }

    /// Address of the other side.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bound every subsequent read and write. `None` blocks indefinitely.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ExchangeError> {
        self.stream
            .set_read_timeout(timeout)
            .and_then(|_| self.stream.set_write_timeout(timeout))
            .map_err(ExchangeError::Configure)
    }

    /// Send `local`, then block until the peer's record arrives.
    ///
    /// Both sides send first. A record fits in the socket send buffer, so
    /// the write completes without the peer reading and neither side can
    /// deadlock.
    pub fn exchange(&mut self, local: &ConnectionInfo) -> Result<ConnectionInfo, ExchangeError> {
        exchange_on(&mut self.stream, local)
    }
}

/// Exchange over any byte stream.
pub fn exchange_on<S: Read + Write>(
    stream: &mut S,
    local: &ConnectionInfo,
) -> Result<ConnectionInfo, ExchangeError> {
    let record = wire::encode(local).map_err(ExchangeError::Encode)?;
    stream.write_all(&record).map_err(ExchangeError::Write)?;
    stream.flush().map_err(ExchangeError::Write)?;

    let mut buf = [0u8; RECORD_LEN];
    let mut got = 0;
    while got < RECORD_LEN {
        match stream.read(&mut buf[got..]) {
            Ok(0) => return Err(ExchangeError::ShortRead { got }),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExchangeError::Read(e)),
        }
    }
    wire::decode(&buf).map_err(ExchangeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::gid::Gid;

    /// In-memory stream: reads from `input`, collects writes in `output`.
    struct Pipe {
        input: io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn info(qpn: u32) -> ConnectionInfo {
        ConnectionInfo {
            lid: 7,
            qpn,
            psn: 0xabcdef,
            rkey: 0x1000,
            vaddr: 0x7f00_0001_0000,
            gid: Gid::new(0xfe80 << 48, 0x0202_c9ff_fe00_0001),
        }
    }

    #[test]
    fn sends_before_receiving() {
        let remote = info(0x99);
        let mut pipe = Pipe {
            input: io::Cursor::new(wire::encode(&remote).unwrap().to_vec()),
            output: Vec::new(),
        };
        let got = exchange_on(&mut pipe, &info(0x11)).unwrap();
        assert_eq!(got, remote);
        assert_eq!(pipe.output, wire::encode(&info(0x11)).unwrap());
    }

    #[test]
    fn short_record_is_an_error() {
        let mut record = wire::encode(&info(0x99)).unwrap().to_vec();
        record.truncate(40);
        let mut pipe = Pipe {
            input: io::Cursor::new(record),
            output: Vec::new(),
        };
        assert!(matches!(
            exchange_on(&mut pipe, &info(0x11)),
            Err(ExchangeError::ShortRead { got: 40 })
        ));
    }

    #[test]
    fn bad_local_info_is_not_sent() {
        let mut pipe = Pipe {
            input: io::Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        assert!(matches!(
            exchange_on(&mut pipe, &info(0x0100_0000)),
            Err(ExchangeError::Encode(_))
        ));
        assert!(pipe.output.is_empty());
    }
}

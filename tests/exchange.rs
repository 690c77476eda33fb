use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

use ibecho::ctrl::{ConnectOptions, ExchangeError, MetadataChannel, MetadataListener};
use ibecho::prelude::*;

fn info(lid: u16, qpn: u32) -> ConnectionInfo {
    ConnectionInfo {
        lid,
        qpn,
        psn: 0x00abcd,
        rkey: 0xdead_beef,
        vaddr: 0x7f00_1234_5000,
        gid: Gid::new(0xfe80_0000_0000_0000, 0x0200_5eff_fe00_0001),
    }
}

#[test]
fn loopback_exchange() -> anyhow::Result<()> {
    let listener = MetadataListener::bind(0)?;
    let port = listener.local_addr()?.port();
    let server_info = info(1, 0x11);
    let client_info = info(2, 0x12);

    let server = thread::spawn(move || -> Result<ConnectionInfo, ExchangeError> {
        let mut channel = listener.accept()?;
        channel.exchange(&server_info)
    });

    let mut channel = MetadataChannel::connect("127.0.0.1", port, &ConnectOptions::default())?;
    let from_server = channel.exchange(&client_info)?;
    let from_client = server.join().expect("server thread panicked")?;

    assert_eq!(from_server, server_info);
    assert_eq!(from_client, client_info);
    Ok(())
}

#[test]
fn short_record_leaves_remote_unpopulated() -> anyhow::Result<()> {
    let listener = MetadataListener::bind(0)?;
    let port = listener.local_addr()?.port();

    let peer = thread::spawn(move || -> std::io::Result<()> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        stream.write_all(b"0003:00004a:001234")?;
        // Take the server's record so that closing sends a plain FIN.
        let mut record = [0u8; 78];
        stream.read_exact(&mut record)?;
        Ok(())
    });

    let mut channel = listener.accept()?;
    let remote = channel.exchange(&info(1, 0x11));
    peer.join().expect("peer thread panicked")?;

    assert!(matches!(remote, Err(ExchangeError::ShortRead { got: 18 })));
    Ok(())
}

#[test]
fn connect_retries_until_attempts_run_out() -> anyhow::Result<()> {
    let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    let opts = ConnectOptions {
        attempts: 3,
        retry_interval: std::time::Duration::from_millis(10),
    };
    let err = MetadataChannel::connect("127.0.0.1", port, &opts)
        .err()
        .expect("nobody listens");
    assert!(matches!(err, ExchangeError::Connect { .. }));
    Ok(())
}

//! A PostgreSQL server that answers the startup handshake and a fixed number
//! of simple queries per connection, then reads everything and replies to
//! nothing.

use crate::models::ConnectionConfig;
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) struct StallingServer {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl StallingServer {
    /// Listen on a free local port; each connection gets `answered` replies.
    pub(crate) async fn start(answered: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, answered));
            }
        });
        Self { addr, accept }
    }

    pub(crate) fn config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::postgres(format!(
            "host=127.0.0.1 port={} user=tether dbname=tether sslmode=disable",
            self.addr.port()
        ));
        config.options.connect_timeout_secs = 2;
        config.options.ping_timeout_secs = 1;
        config
    }
}

impl Drop for StallingServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(mut socket: TcpStream, mut answered: usize) -> std::io::Result<()> {
    // Startup packet: length, protocol version, parameters
    let len = socket.read_i32().await?;
    let mut startup = vec![0; len as usize - 4];
    socket.read_exact(&mut startup).await?;

    let mut out = BytesMut::new();
    // AuthenticationOk
    out.put_u8(b'R');
    out.put_i32(8);
    out.put_i32(0);
    // BackendKeyData
    out.put_u8(b'K');
    out.put_i32(12);
    out.put_i32(1);
    out.put_i32(1);
    ready_for_query(&mut out);
    socket.write_all(&out).await?;

    loop {
        let tag = socket.read_u8().await?;
        let len = socket.read_i32().await?;
        let mut body = vec![0; len as usize - 4];
        socket.read_exact(&mut body).await?;

        match tag {
            b'X' => return Ok(()),
            b'Q' if answered > 0 => {
                answered -= 1;
                let command = b"SELECT 1\0";
                let mut out = BytesMut::new();
                out.put_u8(b'C');
                out.put_i32(4 + command.len() as i32);
                out.put_slice(command);
                ready_for_query(&mut out);
                socket.write_all(&out).await?;
            }
            _ => {}
        }
    }
}

fn ready_for_query(out: &mut BytesMut) {
    out.put_u8(b'Z');
    out.put_i32(5);
    out.put_u8(b'I');
}

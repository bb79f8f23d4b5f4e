//! Guest-initiated TCP connections proxied to host sockets.
//!
//! The guest link is a reliable stream, so segments sent to the guest are
//! never retransmitted. Data from the guest is acknowledged only once it has
//! been queued for the host socket; anything that cannot be queued is left
//! unacknowledged for the guest to retransmit.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use smoltcp::wire::{TcpControl, TcpRepr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tracing::debug;

use super::packet::seq_raw;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MSS: u16 = 536;
/// Receive window advertised to the guest.
pub const WINDOW: u16 = 65_535;
/// Host bytes buffered per connection before the host socket stops being read.
const BUFFER_LIMIT: usize = 256 * 1024;
const WRITE_QUEUE: usize = 64;

/// A guest connection: the guest's endpoint and the endpoint it addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub guest: SocketAddrV4,
    pub remote: SocketAddrV4,
}

#[derive(Debug)]
pub enum TcpEvent {
    Connected(ConnKey, mpsc::Sender<Bytes>),
    Refused(ConnKey),
    Data(ConnKey, Bytes),
    Eof(ConnKey),
    Reset(ConnKey),
}

/// A segment to deliver to the guest, from `key.remote` to `key.guest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub key: ConnKey,
    pub seq: u32,
    /// Every segment to the guest acknowledges this.
    pub ack: u32,
    pub control: TcpControl,
    /// MSS to announce; only set on SYN-ACK.
    pub mss: Option<u16>,
    pub payload: Bytes,
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[derive(Debug)]
struct Conn {
    established: bool,
    mss: usize,
    /// Next sequence number expected from the guest.
    guest_next: u32,
    /// Next sequence number we send.
    our_next: u32,
    /// Highest sequence number the guest has acknowledged.
    guest_acked: u32,
    guest_window: u32,
    pending: BytesMut,
    host_eof: bool,
    fin_sent: bool,
    fin_acked: bool,
    guest_fin: bool,
    writer: Option<mpsc::Sender<Bytes>>,
    credit: Arc<Semaphore>,
    task: AbortHandle,
}

impl Conn {
    fn in_flight(&self) -> u32 {
        self.our_next
            .wrapping_sub(self.guest_acked)
            .saturating_sub(u32::from(self.fin_sent && !self.fin_acked))
    }

    fn segment(&self, key: ConnKey, control: TcpControl, payload: Bytes) -> Outgoing {
        Outgoing {
            key,
            seq: self.our_next,
            ack: self.guest_next,
            control,
            mss: None,
            payload,
        }
    }

    fn ack(&self, key: ConnKey) -> Outgoing {
        self.segment(key, TcpControl::None, Bytes::new())
    }

    fn closed(&self) -> bool {
        self.fin_acked && self.guest_fin
    }
}

/// The table of proxied connections.
///
/// Dropping it aborts every connection's host task.
#[derive(Debug)]
pub struct TcpNat {
    conns: HashMap<ConnKey, Conn>,
    tasks: JoinSet<()>,
    events: mpsc::Sender<TcpEvent>,
    max_mss: u16,
    next_isn: u32,
}

impl TcpNat {
    pub fn new(events: mpsc::Sender<TcpEvent>, mtu: u16) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        Self {
            conns: HashMap::new(),
            tasks: JoinSet::new(),
            events,
            max_mss: mtu.saturating_sub(40),
            next_isn: seed,
        }
    }

    #[cfg(test)]
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.conns.contains_key(key)
    }

    /// Handle a segment from the guest. `host` is where a new connection goes.
    pub fn segment(
        &mut self,
        key: ConnKey,
        host: SocketAddrV4,
        segment: &TcpRepr<'_>,
    ) -> Vec<Outgoing> {
        while self.tasks.try_join_next().is_some() {}

        if !self.conns.contains_key(&key) {
            return self.open(key, host, segment);
        }
        if segment.control == TcpControl::Rst {
            if let Some(conn) = self.conns.remove(&key) {
                conn.task.abort();
            }
            return Vec::new();
        }
        let Some(conn) = self.conns.get_mut(&key) else {
            return Vec::new();
        };
        if !conn.established || segment.control == TcpControl::Syn {
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(ack) = segment.ack_number.map(seq_raw)
            && seq_lt(conn.guest_acked, ack)
            && seq_le(ack, conn.our_next)
        {
            let mut acked = ack.wrapping_sub(conn.guest_acked);
            if conn.fin_sent && ack == conn.our_next {
                conn.fin_acked = true;
                acked = acked.saturating_sub(1);
            }
            conn.credit.add_permits(acked as usize);
            conn.guest_acked = ack;
        }
        conn.guest_window = u32::from(segment.window_len);

        if seq_raw(segment.seq_number) != conn.guest_next {
            // Retransmission or out of order: repeat what we have.
            if segment.segment_len() > 0 {
                out.push(conn.ack(key));
            }
        } else {
            let mut advanced = false;
            if !segment.payload.is_empty() && !conn.guest_fin {
                let data = Bytes::copy_from_slice(segment.payload);
                let queued = conn
                    .writer
                    .as_ref()
                    .is_some_and(|w| w.try_send(data).is_ok());
                if !queued {
                    return out;
                }
                conn.guest_next = conn.guest_next.wrapping_add(segment.payload.len() as u32);
                advanced = true;
            }
            if segment.control == TcpControl::Fin && !conn.guest_fin {
                conn.guest_fin = true;
                conn.guest_next = conn.guest_next.wrapping_add(1);
                // Dropping the sender shuts down the host socket's write half.
                conn.writer = None;
                advanced = true;
            }
            if advanced {
                out.push(conn.ack(key));
            }
        }

        Self::flush(key, conn, &mut out);
        if conn.closed() {
            self.remove(&key);
        }
        out
    }

    /// Handle a report from a connection's host task.
    pub fn event(&mut self, event: TcpEvent) -> Vec<Outgoing> {
        let mut out = Vec::new();
        match event {
            TcpEvent::Connected(key, writer) => {
                let Some(conn) = self.conns.get_mut(&key) else {
                    return out;
                };
                conn.writer = Some(writer);
                conn.established = true;
                let mut syn_ack = conn.segment(key, TcpControl::Syn, Bytes::new());
                syn_ack.mss = Some(self.max_mss);
                conn.our_next = conn.our_next.wrapping_add(1);
                conn.guest_acked = conn.our_next;
                out.push(syn_ack);
            }
            TcpEvent::Refused(key) => {
                if let Some(conn) = self.conns.remove(&key) {
                    out.push(conn.segment(key, TcpControl::Rst, Bytes::new()));
                }
            }
            TcpEvent::Data(key, payload) => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.pending.extend_from_slice(&payload);
                    Self::flush(key, conn, &mut out);
                }
            }
            TcpEvent::Eof(key) => {
                if let Some(conn) = self.conns.get_mut(&key) {
                    conn.host_eof = true;
                    Self::flush(key, conn, &mut out);
                    if conn.closed() {
                        self.remove(&key);
                    }
                }
            }
            TcpEvent::Reset(key) => {
                if let Some(conn) = self.conns.remove(&key) {
                    conn.task.abort();
                    out.push(conn.segment(key, TcpControl::Rst, Bytes::new()));
                }
            }
        }
        out
    }

    fn open(
        &mut self,
        key: ConnKey,
        host: SocketAddrV4,
        segment: &TcpRepr<'_>,
    ) -> Vec<Outgoing> {
        if segment.control != TcpControl::Syn || segment.ack_number.is_some() {
            return Vec::new();
        }

        let isn = self.next_isn;
        self.next_isn = self.next_isn.wrapping_add(64_000);
        let mss = segment.max_seg_size.unwrap_or(DEFAULT_MSS).min(self.max_mss).max(1);
        let credit = Arc::new(Semaphore::new(BUFFER_LIMIT));
        let task = self.tasks.spawn(proxy(
            key,
            host,
            usize::from(mss),
            Arc::clone(&credit),
            self.events.clone(),
        ));
        debug!(guest = %key.guest, remote = %key.remote, %host, "tcp connection opening");

        self.conns.insert(
            key,
            Conn {
                established: false,
                mss: usize::from(mss),
                guest_next: seq_raw(segment.seq_number).wrapping_add(1),
                our_next: isn,
                guest_acked: isn,
                guest_window: u32::from(segment.window_len),
                pending: BytesMut::new(),
                host_eof: false,
                fin_sent: false,
                fin_acked: false,
                guest_fin: false,
                writer: None,
                credit,
                task,
            },
        );
        Vec::new()
    }

    /// Send buffered host data as far as the guest's window allows.
    fn flush(key: ConnKey, conn: &mut Conn, out: &mut Vec<Outgoing>) {
        if !conn.established {
            return;
        }
        while !conn.pending.is_empty() {
            let room = conn.guest_window.saturating_sub(conn.in_flight()) as usize;
            let len = conn.pending.len().min(conn.mss).min(room);
            if len == 0 {
                break;
            }
            let payload = conn.pending.split_to(len).freeze();
            out.push(conn.segment(key, TcpControl::Psh, payload));
            conn.our_next = conn.our_next.wrapping_add(len as u32);
        }
        if conn.host_eof && conn.pending.is_empty() && !conn.fin_sent {
            out.push(conn.segment(key, TcpControl::Fin, Bytes::new()));
            conn.our_next = conn.our_next.wrapping_add(1);
            conn.fin_sent = true;
        }
    }

    /// Forget a cleanly closed connection. Its task finishes on its own once
    /// queued guest data has been written.
    fn remove(&mut self, key: &ConnKey) {
        if self.conns.remove(key).is_some() {
            debug!(guest = %key.guest, remote = %key.remote, "tcp connection closed");
        }
    }
}

/// Connect to `host`, then pump bytes both ways until either side is done.
async fn proxy(
    key: ConnKey,
    host: SocketAddrV4,
    mss: usize,
    credit: Arc<Semaphore>,
    events: mpsc::Sender<TcpEvent>,
) {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(host)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%host, error = %e, "tcp connect failed");
            let _ = events.send(TcpEvent::Refused(key)).await;
            return;
        }
        Err(_) => {
            debug!(%host, "tcp connect timed out");
            let _ = events.send(TcpEvent::Refused(key)).await;
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
    if events.send(TcpEvent::Connected(key, tx)).await.is_err() {
        return;
    }

    let read = async {
        let mut buf = vec![0u8; mss];
        loop {
            let Ok(permit) = credit.acquire_many(mss as u32).await else {
                return;
            };
            permit.forget();
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = events.send(TcpEvent::Eof(key)).await;
                    return;
                }
                Ok(n) => {
                    credit.add_permits(mss - n);
                    let payload = Bytes::copy_from_slice(buf.get(..n).unwrap_or_default());
                    if events.send(TcpEvent::Data(key, payload)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(%host, error = %e, "tcp read failed");
                    let _ = events.send(TcpEvent::Reset(key)).await;
                    return;
                }
            }
        }
    };

    let write = async {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                debug!(%host, error = %e, "tcp write failed");
                let _ = events.send(TcpEvent::Reset(key)).await;
                return;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(read, write);
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::network::packet::TcpHeader;

    const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 107, 2);
    const NAT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 107, 254);

    struct Guest {
        key: ConnKey,
        seq: u32,
    }

    impl Guest {
        fn new(port: u16) -> Self {
            Self {
                key: ConnKey {
                    guest: SocketAddrV4::new(GUEST_IP, 40000),
                    remote: SocketAddrV4::new(NAT_IP, port),
                },
                seq: 1000,
            }
        }

        fn send<'a>(
            &mut self,
            control: TcpControl,
            ack: Option<u32>,
            payload: &'a [u8],
        ) -> TcpRepr<'a> {
            let header = TcpHeader {
                src_port: self.key.guest.port(),
                dst_port: self.key.remote.port(),
                control,
                seq: self.seq,
                ack,
                window: WINDOW,
            };
            let mss = (control == TcpControl::Syn).then_some(1460);
            let segment = header.repr(mss, payload);
            self.seq = self.seq.wrapping_add(segment.segment_len() as u32);
            segment
        }
    }

    fn feed(nat: &mut TcpNat, host: SocketAddrV4, segment: &TcpRepr<'_>) -> Vec<Outgoing> {
        nat.segment(Guest::new(0).key, host, segment)
    }

    async fn next(nat: &mut TcpNat, rx: &mut mpsc::Receiver<TcpEvent>) -> Vec<Outgoing> {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        nat.event(event)
    }

    async fn listen() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let std::net::SocketAddr::V4(host) = listener.local_addr().unwrap() else {
            panic!("expected ipv4");
        };
        (listener, host)
    }

    #[tokio::test]
    async fn refused_connection_is_reset() {
        let (listener, host) = listen().await;
        drop(listener);

        let (tx, mut rx) = mpsc::channel(16);
        let mut nat = TcpNat::new(tx, 1500);
        let mut guest = Guest::new(0);
        assert!(feed(&mut nat, host, &guest.send(TcpControl::Syn, None, b"")).is_empty());
        assert_eq!(nat.connections(), 1);

        let out = next(&mut nat, &mut rx).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].control, TcpControl::Rst);
        assert_eq!(out[0].ack, 1001);
        assert_eq!(nat.connections(), 0);
    }

    #[tokio::test]
    async fn proxies_data_both_ways_and_closes() {
        let (listener, host) = listen().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut nat = TcpNat::new(tx, 1500);
        let mut guest = Guest::new(0);

        feed(&mut nat, host, &guest.send(TcpControl::Syn, None, b""));
        let out = next(&mut nat, &mut rx).await;
        let syn_ack = &out[0];
        assert_eq!(syn_ack.control, TcpControl::Syn);
        assert_eq!(syn_ack.ack, 1001);
        assert_eq!(syn_ack.mss, Some(1460));
        let mut server_seq = syn_ack.seq.wrapping_add(1);

        let ack = guest.send(TcpControl::None, Some(server_seq), b"");
        assert!(feed(&mut nat, host, &ack).is_empty());
        let out = feed(&mut nat, host, &guest.send(TcpControl::Psh, Some(server_seq), b"ping"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ack, 1005);

        let mut received = Vec::new();
        let mut fin = false;
        while !fin {
            for segment in next(&mut nat, &mut rx).await {
                received.extend_from_slice(&segment.payload);
                server_seq = segment.seq.wrapping_add(segment.payload.len() as u32);
                if segment.control == TcpControl::Fin {
                    fin = true;
                    server_seq = server_seq.wrapping_add(1);
                }
            }
        }
        assert_eq!(received, b"pong");

        let out = feed(&mut nat, host, &guest.send(TcpControl::Fin, Some(server_seq), b""));
        assert_eq!(out[0].ack, 1006);
        assert_eq!(nat.connections(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn retransmitted_data_is_acked_again_without_rewriting() {
        let (listener, host) = listen().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            data
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut nat = TcpNat::new(tx, 1500);
        let mut guest = Guest::new(0);
        feed(&mut nat, host, &guest.send(TcpControl::Syn, None, b""));
        let out = next(&mut nat, &mut rx).await;
        let server_seq = out[0].seq.wrapping_add(1);

        let first = guest.send(TcpControl::Psh, Some(server_seq), b"abc");
        assert_eq!(feed(&mut nat, host, &first)[0].ack, 1004);
        let again = feed(&mut nat, host, &first);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].ack, 1004);
        assert!(again[0].payload.is_empty());

        feed(&mut nat, host, &guest.send(TcpControl::Fin, Some(server_seq), b""));
        assert_eq!(server.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn guest_reset_drops_connection() {
        let (_listener, host) = listen().await;
        let (tx, _rx) = mpsc::channel(16);
        let mut nat = TcpNat::new(tx, 1500);
        let mut guest = Guest::new(0);
        feed(&mut nat, host, &guest.send(TcpControl::Syn, None, b""));
        assert!(nat.contains(&guest.key));
        assert!(feed(&mut nat, host, &guest.send(TcpControl::Rst, None, b"")).is_empty());
        assert!(!nat.contains(&guest.key));
    }

    #[tokio::test]
    async fn stray_segment_without_connection_is_ignored() {
        let (tx, _rx) = mpsc::channel(16);
        let mut nat = TcpNat::new(tx, 1500);
        let mut guest = Guest::new(0);
        let host = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let stray = guest.send(TcpControl::None, Some(1), b"data");
        assert!(feed(&mut nat, host, &stray).is_empty());
        assert_eq!(nat.connections(), 0);
    }
}

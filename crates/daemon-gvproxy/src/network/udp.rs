//! UDP relay from guest flows to host sockets.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Idle time after which an ordinary flow is torn down.
pub const FLOW_IDLE: Duration = Duration::from_secs(60);
/// Idle time for flows carrying DNS to the upstream resolver.
pub const DNS_IDLE: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = 65_535;
/// Guest datagrams queued per flow before new ones are dropped.
const SEND_QUEUE: usize = 64;

/// A guest flow: the guest's endpoint and the endpoint it addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub guest: SocketAddrV4,
    pub remote: SocketAddrV4,
}

#[derive(Debug)]
pub enum UdpEvent {
    /// A datagram from the host side, to be delivered as if from `key.remote`.
    Datagram { key: FlowKey, payload: Bytes },
    /// The flow went idle or its socket failed.
    Closed { key: FlowKey, id: u64 },
}

#[derive(Debug)]
struct Flow {
    id: u64,
    outgoing: mpsc::Sender<Bytes>,
}

/// One connected host socket per guest flow.
///
/// Each flow's task writes queued guest datagrams and reads host replies
/// until the flow goes idle. Dropping the relay aborts every flow's task.
#[derive(Debug)]
pub struct UdpNat {
    flows: HashMap<FlowKey, Flow>,
    tasks: JoinSet<()>,
    events: mpsc::Sender<UdpEvent>,
    next_id: u64,
}

impl UdpNat {
    pub fn new(events: mpsc::Sender<UdpEvent>) -> Self {
        Self {
            flows: HashMap::new(),
            tasks: JoinSet::new(),
            events,
            next_id: 0,
        }
    }

    #[cfg(test)]
    pub fn flows(&self) -> usize {
        self.flows.len()
    }

    /// Queue `payload` for `key` towards `host`, opening the flow if needed.
    ///
    /// Never waits. A datagram arriving while the flow's queue is full is
    /// dropped, as a congested link would.
    pub fn send(
        &mut self,
        key: FlowKey,
        host: SocketAddrV4,
        idle: Duration,
        payload: &[u8],
    ) -> io::Result<()> {
        while self.tasks.try_join_next().is_some() {}

        let datagram = Bytes::copy_from_slice(payload);
        let datagram = match self.flows.get(&key) {
            Some(flow) => match flow.outgoing.try_send(datagram) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    trace!(?key, "udp send queue full, dropping datagram");
                    return Ok(());
                }
                // The flow's task is gone; start over with a fresh socket.
                Err(TrySendError::Closed(datagram)) => datagram,
            },
            None => datagram,
        };
        let outgoing = self.open(key, host, idle)?;
        outgoing
            .try_send(datagram)
            .map_err(|_| io::Error::other("udp flow closed before its first datagram"))
    }

    /// Forget a flow reported closed, unless it has since been reopened.
    pub fn close(&mut self, key: &FlowKey, id: u64) {
        if self.flows.get(key).is_some_and(|flow| flow.id == id) {
            self.flows.remove(key);
            debug!(guest = %key.guest, remote = %key.remote, "udp flow closed");
        }
    }

    fn open(
        &mut self,
        key: FlowKey,
        host: SocketAddrV4,
        idle: Duration,
    ) -> io::Result<mpsc::Sender<Bytes>> {
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_socket.connect(host)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(guest = %key.guest, remote = %key.remote, %host, "udp flow opened");

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = mpsc::channel(SEND_QUEUE);
        self.flows.insert(
            key,
            Flow {
                id,
                outgoing: tx.clone(),
            },
        );
        self.tasks
            .spawn(relay(key, id, host, socket, idle, rx, self.events.clone()));
        Ok(tx)
    }
}

/// Pump one flow until it idles out or its socket fails.
async fn relay(
    key: FlowKey,
    id: u64,
    host: SocketAddrV4,
    socket: UdpSocket,
    idle: Duration,
    mut outgoing: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<UdpEvent>,
) {
    let write = async {
        while let Some(datagram) = outgoing.recv().await {
            if let Err(e) = socket.send(&datagram).await {
                debug!(%host, error = %e, "udp flow send failed");
                return;
            }
        }
    };

    let read = async {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(idle, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let payload = Bytes::copy_from_slice(buf.get(..n).unwrap_or_default());
                    if events.send(UdpEvent::Datagram { key, payload }).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    debug!(%host, error = %e, "udp flow receive failed");
                    return;
                }
                Err(_) => return,
            }
        }
    };

    tokio::select! {
        () = write => {}
        () = read => {}
    }
    // Later guest datagrams must find the flow closed and reopen it.
    drop(outgoing);
    let _ = events.send(UdpEvent::Closed { key, id }).await;
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use orca_core::OracleId;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::messages::Message;

/// Inbound frames, tagged with the authenticated sender
pub type Inbox = mpsc::Receiver<(OracleId, Vec<u8>)>;

/// Outbound side of the transport.
///
/// Delivery between distinct oracles is unreliable and unordered. Delivery to
/// oneself is FIFO.
pub trait NetworkEndpoint: Send + Sync + 'static {
    fn send_to(&self, to: OracleId, message: &Message);

    /// Send to every oracle, including oneself
    fn broadcast(&self, message: &Message);
}

/// Decides whether a frame may travel from one oracle to another
pub type LinkFilter = Arc<dyn Fn(OracleId, OracleId, &Message) -> bool + Send + Sync>;

/// Process-local network connecting `n` oracles
pub struct InMemoryNetwork {
    inboxes: Vec<mpsc::Sender<(OracleId, Vec<u8>)>>,
    filter: RwLock<Option<LinkFilter>>,
    disconnected: Vec<AtomicBool>,
}

impl InMemoryNetwork {
    pub fn new(n: usize, capacity: usize) -> (Arc<Self>, Vec<Inbox>) {
        let (inboxes, receivers) = (0..n).map(|_| mpsc::channel(capacity)).unzip();
        let network = InMemoryNetwork {
            inboxes,
            filter: RwLock::new(None),
            disconnected: (0..n).map(|_| AtomicBool::new(false)).collect(),
        };
        (Arc::new(network), receivers)
    }

    pub fn endpoint(self: &Arc<Self>, id: OracleId) -> InMemoryEndpoint {
        InMemoryEndpoint {
            network: Arc::clone(self),
            id,
        }
    }

    /// Install a filter applied to every link between distinct oracles
    pub fn set_filter(&self, filter: LinkFilter) {
        if let Ok(mut slot) = self.filter.write() {
            *slot = Some(filter);
        }
    }

    pub fn clear_filter(&self) {
        if let Ok(mut slot) = self.filter.write() {
            *slot = None;
        }
    }

    /// Drop all traffic to and from `id`, loopback included
    pub fn disconnect(&self, id: OracleId) {
        if let Some(flag) = self.disconnected.get(id.index()) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn reconnect(&self, id: OracleId) {
        if let Some(flag) = self.disconnected.get(id.index()) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn is_disconnected(&self, id: OracleId) -> bool {
        self.disconnected
            .get(id.index())
            .map_or(true, |flag| flag.load(Ordering::SeqCst))
    }

    fn allows(&self, from: OracleId, to: OracleId, message: &Message) -> bool {
        if self.is_disconnected(from) || self.is_disconnected(to) {
            return false;
        }
        if from == to {
            return true;
        }
        match self.filter.read() {
            Ok(filter) => filter.as_ref().map_or(true, |f| f(from, to, message)),
            Err(_) => false,
        }
    }

    fn deliver(&self, from: OracleId, to: OracleId, frame: Vec<u8>) {
        let Some(inbox) = self.inboxes.get(to.index()) else {
            debug!("Dropping frame from {} to unknown {}", from, to);
            return;
        };
        if let Err(e) = inbox.try_send((from, frame)) {
            debug!("Dropping frame from {} to {}: {}", from, to, e);
        }
    }
}

/// One oracle's handle onto an `InMemoryNetwork`
#[derive(Clone)]
pub struct InMemoryEndpoint {
    network: Arc<InMemoryNetwork>,
    id: OracleId,
}

impl InMemoryEndpoint {
    fn encode(&self, message: &Message) -> Option<Vec<u8>> {
        match message.encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("Failed to encode outbound message: {}", e);
                None
            }
        }
    }
}

impl NetworkEndpoint for InMemoryEndpoint {
    fn send_to(&self, to: OracleId, message: &Message) {
        if !self.network.allows(self.id, to, message) {
            return;
        }
        if let Some(frame) = self.encode(message) {
            self.network.deliver(self.id, to, frame);
        }
    }

    fn broadcast(&self, message: &Message) {
        let Some(frame) = self.encode(message) else {
            return;
        };
        for to in OracleId::all(self.network.inboxes.len()) {
            if self.network.allows(self.id, to, message) {
                self.network.deliver(self.id, to, frame.clone());
            }
        }
    }
}

/// sACN transmitter: per-universe sequenced data packets and the periodic
/// universe-discovery advertisement.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sacn_protocol::packets::{DataPacket, DiscoveryPacket};
use sacn_protocol::{
    discovery_addr, is_valid_universe, universe_addr, Cid, DEFAULT_PRIORITY,
    DISCOVERY_INTERVAL_SECS, UNIVERSES_PER_PAGE, UNIVERSE_SIZE,
};

use crate::error::{NetError, Result};
use crate::lock;
use crate::transport::{bind_sender, DatagramSink, SocketOptions};

pub struct Transmitter<S: DatagramSink> {
    cid: Cid,
    source_name: String,
    priority: u8,
    discovery_interval: Duration,
    /// `None` once closed
    socket: Mutex<Option<Arc<S>>>,
    /// Next sequence number per universe
    sequences: Mutex<HashMap<u16, u8>>,
    universes: Mutex<BTreeSet<u16>>,
    cancel: CancellationToken,
}

impl Transmitter<UdpSocket> {
    /// Bind a multicast sender socket and wrap it with a fresh random CID.
    pub fn bind(source_name: impl Into<String>, options: &SocketOptions) -> Result<Self> {
        let socket = bind_sender(options)?;
        Ok(Self::new(socket, source_name))
    }
}

impl<S: DatagramSink> Transmitter<S> {
    pub fn new(sink: S, source_name: impl Into<String>) -> Self {
        Self {
            cid: Cid::random(),
            source_name: source_name.into(),
            priority: DEFAULT_PRIORITY,
            discovery_interval: Duration::from_secs(DISCOVERY_INTERVAL_SECS),
            socket: Mutex::new(Some(Arc::new(sink))),
            sequences: Mutex::new(HashMap::new()),
            universes: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cid(mut self, cid: Cid) -> Self {
        self.cid = cid;
        self
    }

    /// Values above 200 go out as 200.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Multicast one frame of `dmx` to the universe's group.
    pub async fn send_data(&self, universe: u16, dmx: &[u8]) -> Result<()> {
        self.send_data_to(universe_addr(universe).into(), universe, dmx).await
    }

    /// Send one frame of `dmx` to an explicit (usually unicast) target.
    pub async fn send_data_to(&self, target: SocketAddr, universe: u16, dmx: &[u8]) -> Result<()> {
        if !is_valid_universe(universe) {
            return Err(NetError::InvalidUniverse(universe));
        }
        let socket = self.socket()?;

        let mut buf = [0u8; DataPacket::MAX_SIZE];
        let (len, sequence) = {
            let mut sequences = lock(&self.sequences);
            let next = sequences.entry(universe).or_insert(0);
            let sequence = *next;
            *next = next.wrapping_add(1);

            let mut packet = DataPacket::new(self.cid, self.source_name.as_str(), universe, sequence, dmx);
            packet.priority = self.priority;
            (packet.serialize(&mut buf), sequence)
        };

        socket.send_to(&buf[..len], target).await?;
        debug!(universe, sequence, slots = dmx.len().min(UNIVERSE_SIZE), %target, "Sent data packet");
        Ok(())
    }

    /// Add a universe to the discovery advertisement. Idempotent.
    pub fn register_universe(&self, universe: u16) -> Result<()> {
        if !is_valid_universe(universe) {
            return Err(NetError::InvalidUniverse(universe));
        }
        if lock(&self.universes).insert(universe) {
            debug!(universe, "Universe registered");
        }
        Ok(())
    }

    pub fn unregister_universe(&self, universe: u16) {
        if lock(&self.universes).remove(&universe) {
            debug!(universe, "Universe unregistered");
        }
    }

    /// Registered universes, ascending.
    pub fn universes(&self) -> Vec<u16> {
        lock(&self.universes).iter().copied().collect()
    }

    pub fn discovery_pages(&self) -> Vec<DiscoveryPacket> {
        paginate(self.cid, &self.source_name, &self.universes())
    }

    /// Broadcast one full discovery cycle. Returns the number of pages sent.
    pub async fn send_discovery(&self) -> Result<usize> {
        let socket = self.socket()?;
        let pages = self.discovery_pages();
        let target: SocketAddr = discovery_addr().into();

        let mut buf = Vec::with_capacity(DiscoveryPacket::MAX_SIZE);
        for page in &pages {
            page.serialize(&mut buf);
            socket.send_to(&buf, target).await?;
        }

        if !pages.is_empty() {
            debug!(pages = pages.len(), universes = lock(&self.universes).len(), "Sent universe discovery");
        }
        Ok(pages.len())
    }

    /// Spawn the discovery broadcaster: one cycle right away, then one every
    /// discovery interval until `close`.
    pub fn start_discovery(self: &Arc<Self>) -> JoinHandle<()> {
        let transmitter = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transmitter.discovery_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match transmitter.send_discovery().await {
                            Ok(_) => {}
                            Err(NetError::Closed) => break,
                            Err(e) => warn!("Universe discovery send failed: {}", e),
                        }
                    }
                }
            }

            debug!("Discovery broadcaster stopped");
        })
    }

    /// Stop discovery and release the socket. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
        if lock(&self.socket).take().is_some() {
            info!(cid = %self.cid, name = %self.source_name, "Transmitter closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.socket).is_none()
    }

    fn socket(&self) -> Result<Arc<S>> {
        lock(&self.socket).clone().ok_or(NetError::Closed)
    }
}

/// Split a sorted universe list into discovery pages of at most 512
/// entries. Every page carries the same `last_page`. An empty list yields
/// no pages.
///
/// Page numbers are one byte, so at most 256 pages (131072 entries) can be
/// numbered. The valid universe range needs 125.
pub(crate) fn paginate(cid: Cid, source_name: &str, universes: &[u16]) -> Vec<DiscoveryPacket> {
    let chunks = universes.chunks(UNIVERSES_PER_PAGE);
    let last_page = chunks.len().saturating_sub(1) as u8;

    chunks
        .enumerate()
        .map(|(page, chunk)| DiscoveryPacket {
            cid,
            source_name: source_name.to_string(),
            page: page as u8,
            last_page,
            universes: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sacn_protocol::packets::Packet;
    use sacn_protocol::{MAX_UNIVERSE, MIN_UNIVERSE};
    use std::io;

    type Sent = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Sent,
    }

    impl DatagramSink for RecordingSink {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((target, buf.to_vec()));
            Ok(buf.len())
        }
    }

    fn transmitter() -> (Transmitter<RecordingSink>, Sent) {
        let sink = RecordingSink::default();
        let sent = Arc::clone(&sink.sent);
        let tx = Transmitter::new(sink, "Test Source").with_cid(Cid::from_bytes([7; 16]));
        (tx, sent)
    }

    fn decode(bytes: &[u8]) -> Packet {
        Packet::deserialize(bytes).expect("transmitter emits valid packets")
    }

    fn data_sequences(sent: &Sent) -> Vec<(u16, u8)> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| match decode(bytes) {
                Packet::Data(p) => (p.universe, p.sequence),
                other => panic!("expected data packet, got {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequence_wraps_after_256_sends() {
        let (tx, sent) = transmitter();
        for _ in 0..257 {
            tx.send_data(1, &[0xFF; 512]).await.unwrap();
        }

        let sequences: Vec<u8> = data_sequences(&sent).into_iter().map(|(_, s)| s).collect();
        let expected: Vec<u8> = (0..=255u8).chain(std::iter::once(0)).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn test_per_universe_counters_are_independent() {
        let (tx, sent) = transmitter();
        tx.send_data(1, &[1]).await.unwrap();
        tx.send_data(1, &[1]).await.unwrap();
        tx.send_data(2, &[2]).await.unwrap();
        tx.send_data(1, &[1]).await.unwrap();

        assert_eq!(data_sequences(&sent), vec![(1, 0), (1, 1), (2, 0), (1, 2)]);
    }

    #[tokio::test]
    async fn test_data_goes_to_universe_group() {
        let (tx, sent) = transmitter();
        tx.send_data(0x0102, &[9; 3]).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].0, "239.255.1.2:5568".parse::<SocketAddr>().unwrap());
        let Packet::Data(packet) = decode(&sent[0].1) else {
            panic!("expected data packet");
        };
        assert_eq!(packet.source_name, "Test Source");
        assert_eq!(packet.cid, Cid::from_bytes([7; 16]));
        assert_eq!(packet.priority, 100);
        assert_eq!(packet.dmx(), &[9, 9, 9]);
    }

    #[tokio::test]
    async fn test_unicast_target_and_priority() {
        let (tx, sent) = transmitter();
        let tx = tx.with_priority(150);
        let target: SocketAddr = "192.168.1.50:5568".parse().unwrap();
        tx.send_data_to(target, 7, &[0; 512]).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].0, target);
        assert_eq!(sent[0].1.len(), DataPacket::MAX_SIZE);
        let Packet::Data(packet) = decode(&sent[0].1) else {
            panic!("expected data packet");
        };
        assert_eq!(packet.priority, 150);
        assert_eq!(packet.universe, 7);
    }

    #[tokio::test]
    async fn test_invalid_universe_is_rejected() {
        let (tx, sent) = transmitter();
        assert!(matches!(tx.send_data(0, &[]).await, Err(NetError::InvalidUniverse(0))));
        assert!(matches!(tx.send_data(64000, &[]).await, Err(NetError::InvalidUniverse(64000))));
        assert!(matches!(tx.register_universe(0), Err(NetError::InvalidUniverse(0))));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (tx, sent) = transmitter();
        tx.send_data(1, &[1]).await.unwrap();

        tx.close();
        tx.close();
        assert!(tx.is_closed());
        assert!(matches!(tx.send_data(1, &[1]).await, Err(NetError::Closed)));
        assert!(matches!(tx.send_discovery().await, Err(NetError::Closed)));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_register_is_idempotent_and_sorted() {
        let (tx, _) = transmitter();
        for u in [30, 10, 20, 10, 30] {
            tx.register_universe(u).unwrap();
        }
        assert_eq!(tx.universes(), vec![10, 20, 30]);

        tx.unregister_universe(20);
        tx.unregister_universe(99);
        assert_eq!(tx.universes(), vec![10, 30]);
    }

    #[test]
    fn test_paginate_thousand_universes() {
        let universes: Vec<u16> = (1..=1000).collect();
        let pages = paginate(Cid::default(), "src", &universes);

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].universes.len(), 512);
        assert_eq!(pages[1].universes.len(), 488);
        assert_eq!((pages[0].page, pages[0].last_page), (0, 1));
        assert_eq!((pages[1].page, pages[1].last_page), (1, 1));
        assert_eq!(pages[1].universes[0], 513);
    }

    #[test]
    fn test_paginate_full_universe_range_fits_page_numbers() {
        let universes: Vec<u16> = (MIN_UNIVERSE..=MAX_UNIVERSE).collect();
        let pages = paginate(Cid::default(), "src", &universes);

        assert_eq!(pages.len(), 125);
        for (n, page) in pages.iter().enumerate() {
            assert_eq!(usize::from(page.page), n);
            assert_eq!(page.last_page, 124);
        }
        assert_eq!(pages[124].universes.last(), Some(&MAX_UNIVERSE));
    }

    #[test]
    fn test_paginate_small_and_empty() {
        let pages = paginate(Cid::default(), "src", &[5]);
        assert_eq!(pages.len(), 1);
        assert_eq!((pages[0].page, pages[0].last_page), (0, 0));

        assert!(paginate(Cid::default(), "src", &[]).is_empty());
    }

    #[tokio::test]
    async fn test_discovery_with_no_universes_sends_nothing() {
        let (tx, sent) = transmitter();
        assert_eq!(tx.send_discovery().await.unwrap(), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_pages_on_the_wire() {
        let (tx, sent) = transmitter();
        for u in (1..=600).rev() {
            tx.register_universe(u).unwrap();
        }
        assert_eq!(tx.send_discovery().await.unwrap(), 2);

        let sent = sent.lock().unwrap();
        let expected_target: SocketAddr = "239.255.250.214:5568".parse().unwrap();
        let mut all = Vec::new();
        for (target, bytes) in sent.iter() {
            assert_eq!(*target, expected_target);
            let Packet::Discovery(page) = decode(bytes) else {
                panic!("expected discovery packet");
            };
            assert_eq!(page.last_page, 1);
            all.extend(page.universes);
        }
        assert_eq!(all, (1..=600).collect::<Vec<u16>>());
    }

    #[tokio::test]
    async fn test_discovery_task_sends_immediately_and_stops_on_close() {
        let (tx, sent) = transmitter();
        let tx = Arc::new(tx.with_discovery_interval(Duration::from_secs(3600)));
        tx.register_universe(1).unwrap();

        let handle = tx.start_discovery();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);

        tx.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("discovery task stops")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_never_share_a_sequence() {
        let (tx, sent) = transmitter();
        let tx = Arc::new(tx);

        // Two tasks share universe 1; universes 2 and 3 get one task each
        let plan: [(u16, usize); 4] = [(1, 100), (1, 100), (2, 120), (3, 80)];
        let tasks: Vec<_> = plan
            .iter()
            .map(|&(universe, count)| {
                let tx = Arc::clone(&tx);
                tokio::spawn(async move {
                    for _ in 0..count {
                        tx.send_data(universe, &[universe as u8; 32]).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut by_universe: HashMap<u16, Vec<u8>> = HashMap::new();
        for (universe, sequence) in data_sequences(&sent) {
            by_universe.entry(universe).or_default().push(sequence);
        }

        for (universe, total) in [(1u16, 200usize), (2, 120), (3, 80)] {
            let mut sequences = by_universe.remove(&universe).unwrap();
            sequences.sort_unstable();
            let expected: Vec<u8> = (0..total).map(|n| n as u8).collect();
            assert_eq!(sequences, expected, "universe {}", universe);
        }
        assert!(by_universe.is_empty());
    }
}

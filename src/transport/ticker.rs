//! Periodic engine ticks, liveness sweep and deferred teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{lock, ConnectionPhase};
use super::demux::Demultiplexer;
use super::frame::encode_datagram;
use super::socket::Liveness;
use crate::core::constants::{FRAME_TAG_CONNECT, UNASSIGNED_CONNECTION_ID};
use crate::core::DatagramSink;

/// Re-sends the datagram hello until the server's accept reply binds the client.
pub struct HelloBeacon {
    sink: Arc<dyn DatagramSink>,
    server: SocketAddr,
    interval: Duration,
    last_sent: Option<Instant>,
}

impl HelloBeacon {
    /// Beacon towards `server` every `interval`.
    pub fn new(sink: Arc<dyn DatagramSink>, server: SocketAddr, interval: Duration) -> Self {
        Self {
            sink,
            server,
            interval,
            last_sent: None,
        }
    }

    fn poll(&mut self, now: Instant) {
        if self.last_sent.is_some_and(|at| now.duration_since(at) < self.interval) {
            return;
        }
        let hello = encode_datagram(UNASSIGNED_CONNECTION_ID, &[FRAME_TAG_CONNECT]);
        if let Err(e) = self.sink.write_datagram(&hello, self.server) {
            trace!("hello to {} failed: {}", self.server, e);
        }
        self.last_sent = Some(now);
    }
}

/// Drives every engine's clock independent of datagram arrival.
pub struct TickDriver {
    demux: Arc<Demultiplexer>,
    clock: Instant,
    beacon: Option<HelloBeacon>,
}

impl TickDriver {
    /// Create a driver whose engine clock starts now.
    pub fn new(demux: Arc<Demultiplexer>) -> Self {
        Self {
            demux,
            clock: Instant::now(),
            beacon: None,
        }
    }

    /// Send hellos while the client is unbound.
    pub fn with_beacon(mut self, beacon: HelloBeacon) -> Self {
        self.beacon = Some(beacon);
        self
    }

    /// Milliseconds since the driver started, wrapping at `u32::MAX`.
    fn now_ms(&self) -> u32 {
        (self.clock.elapsed().as_millis() & u128::from(u32::MAX)) as u32
    }

    /// Run one tick.
    ///
    /// 1. Snapshot the registry.
    /// 2. Tick every engine; a failing engine starts a disconnect.
    /// 3. Tear down connections whose control stream closed.
    /// 4. Remove connections that were already `Disconnecting` in the snapshot.
    pub fn tick(&mut self) {
        let now = self.now_ms();
        self.tick_at(now);
    }

    /// Run one tick with an explicit engine clock.
    pub(crate) fn tick_at(&mut self, now: u32) {
        if self.demux.client_binding().is_some() {
            self.beacon = None;
        } else if let Some(beacon) = self.beacon.as_mut() {
            beacon.poll(Instant::now());
        }

        let registry = self.demux.registry();
        let snapshot = registry.snapshot();
        if snapshot.is_empty() {
            return;
        }

        for handle in &snapshot {
            let result = lock(&handle.engine).tick(now);
            if let Err(e) = result {
                warn!("connection {}: engine failed: {}", handle.id, e);
                self.demux.begin_disconnect(handle.id);
            }
        }

        for handle in &snapshot {
            if !handle.phase.is_live() {
                continue;
            }
            let Some(control) = handle.control.as_ref() else {
                continue;
            };
            if control.probe() == Liveness::Closed {
                info!("connection {}: control stream closed by {}", handle.id, control.peer());
                self.demux.begin_disconnect(handle.id);
                registry.remove(handle.id);
            }
        }

        for handle in &snapshot {
            if handle.phase == ConnectionPhase::Disconnecting && registry.remove(handle.id).is_some() {
                debug!("connection {}: removed", handle.id);
            }
        }
    }

    /// Run [`tick`](Self::tick) every `period` until `shutdown` fires.
    pub fn spawn(mut self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => self.tick(),
                }
            }
            trace!("tick driver stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock};

    use super::*;
    use crate::core::{ArqEngine, EngineError, EngineFactory};
    use crate::test_util::{addr, CaptureSink, PassthroughFactory};
    use crate::transport::demux::Role;
    use crate::core::constants::FRAME_TAG_DATA;
    use crate::transport::engine::{EngineOutput, EngineSettings, KcpEngineFactory};
    use crate::transport::events::{EventKind, EventQueue, TransportEvent};
    use crate::transport::frame::split_datagram;
    use crate::transport::{ConnectionId, Registry};

    fn demux_with(factory: Arc<dyn EngineFactory>) -> Arc<Demultiplexer> {
        Arc::new(Demultiplexer::new(
            Role::Server {
                data_port: 5555,
                max_connections: 10,
            },
            Arc::new(Registry::new()),
            Arc::new(EventQueue::new()),
            factory,
            EngineSettings::default(),
            Arc::new(CaptureSink::new()),
        ))
    }

    fn drain(events: &EventQueue) -> Vec<TransportEvent> {
        std::iter::from_fn(|| events.try_dequeue()).collect()
    }

    #[derive(Default)]
    struct TickLog(Mutex<Vec<u32>>);

    struct CountingEngine {
        log: Arc<TickLog>,
        fail: bool,
    }

    impl ArqEngine for CountingEngine {
        fn input(&mut self, _data: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }
        fn send(&mut self, frame: &[u8]) -> Result<usize, EngineError> {
            Ok(frame.len())
        }
        fn peek_size(&self) -> Option<usize> {
            None
        }
        fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, EngineError> {
            Err(EngineError::Rejected("empty".into()))
        }
        fn tick(&mut self, now_ms: u32) -> Result<(), EngineError> {
            self.log.0.lock().unwrap().push(now_ms);
            if self.fail {
                return Err(EngineError::Rejected("broken".into()));
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct CountingFactory {
        log: Arc<TickLog>,
        fail: bool,
    }

    impl EngineFactory for CountingFactory {
        fn create(
            &self,
            _id: ConnectionId,
            _settings: &EngineSettings,
            _output: EngineOutput,
        ) -> Box<dyn ArqEngine> {
            Box::new(CountingEngine {
                log: Arc::clone(&self.log),
                fail: self.fail,
            })
        }
    }

    #[test]
    fn test_ticks_every_engine() {
        let log = Arc::new(TickLog::default());
        let demux = demux_with(Arc::new(CountingFactory {
            log: log.clone(),
            fail: false,
        }));
        for port in 0..3 {
            demux
                .register(addr(7000 + port), None, ConnectionPhase::Connected)
                .unwrap();
        }

        let mut driver = TickDriver::new(demux.clone());
        driver.tick();
        driver.tick();
        assert_eq!(log.0.lock().unwrap().len(), 6);
        assert_eq!(demux.registry().len(), 3);
    }

    #[test]
    fn test_disconnecting_removed_on_next_tick() {
        let demux = demux_with(Arc::new(PassthroughFactory));
        let id = demux
            .register(addr(7000), None, ConnectionPhase::Connected)
            .unwrap();
        assert!(demux.begin_disconnect(id));

        let mut driver = TickDriver::new(demux.clone());
        driver.tick();
        assert!(demux.registry().is_empty());

        let events = drain(demux.events());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Disconnect);
    }

    #[test]
    fn test_engine_failure_disconnects_once() {
        let log = Arc::new(TickLog::default());
        let demux = demux_with(Arc::new(CountingFactory {
            log: log.clone(),
            fail: true,
        }));
        demux
            .register(addr(7000), None, ConnectionPhase::Connected)
            .unwrap();

        let mut driver = TickDriver::new(demux.clone());
        driver.tick();
        assert_eq!(demux.registry().len(), 1);
        driver.tick();
        assert!(demux.registry().is_empty());

        let kinds: Vec<_> = drain(demux.events()).iter().map(TransportEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Disconnect]);
    }

    #[tokio::test]
    async fn test_closed_control_stream_tears_down() {
        use tokio::net::{TcpListener, TcpStream};

        use crate::transport::ControlStream;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let demux = demux_with(Arc::new(PassthroughFactory));
        let control = Arc::new(ControlStream::new(stream, peer));
        demux
            .register(peer, Some(control), ConnectionPhase::Connected)
            .unwrap();

        let mut driver = TickDriver::new(demux.clone());
        driver.tick();
        assert_eq!(demux.registry().len(), 1);

        drop(client);
        for _ in 0..100 {
            driver.tick();
            if demux.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(demux.registry().is_empty());
        let kinds: Vec<_> = drain(demux.events()).iter().map(TransportEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Disconnect]);
    }

    #[test]
    fn test_dead_kcp_link_disconnects_once() {
        let demux = Arc::new(Demultiplexer::new(
            Role::Server {
                data_port: 5555,
                max_connections: 10,
            },
            Arc::new(Registry::new()),
            Arc::new(EventQueue::new()),
            Arc::new(KcpEngineFactory),
            EngineSettings::turbo(),
            Arc::new(CaptureSink::new()),
        ));
        demux.on_datagram(addr(7000), &encode_datagram(0, &[FRAME_TAG_CONNECT]));
        let id = ConnectionId::new(1);
        assert_eq!(demux.registry().phase(id), Some(ConnectionPhase::Connected));
        drain(demux.events());

        // The peer vanished after its hello: nothing ever acknowledges this frame.
        let handle = demux.registry().find_by_id(id).unwrap();
        lock(&handle.engine).send(&[FRAME_TAG_DATA, b'x']).unwrap();

        let mut driver = TickDriver::new(demux.clone());
        let mut now = 0u32;
        for _ in 0..1000 {
            driver.tick_at(now);
            if !demux.events().is_empty() {
                break;
            }
            now += 10_000;
        }

        let kinds: Vec<_> = drain(demux.events()).iter().map(TransportEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Disconnect]);
        assert_eq!(demux.registry().phase(id), Some(ConnectionPhase::Disconnecting));

        driver.tick_at(now + 10_000);
        assert!(demux.registry().is_empty());
        assert!(demux.events().is_empty());
    }

    #[test]
    fn test_beacon_until_bound() {
        let sink = Arc::new(CaptureSink::new());
        let binding = Arc::new(OnceLock::new());
        let demux = Arc::new(Demultiplexer::new(
            Role::Client {
                binding: binding.clone(),
            },
            Arc::new(Registry::new()),
            Arc::new(EventQueue::new()),
            Arc::new(PassthroughFactory),
            EngineSettings::default(),
            sink.clone(),
        ));
        let beacon = HelloBeacon::new(sink.clone(), addr(5555), Duration::ZERO);
        let mut driver = TickDriver::new(demux).with_beacon(beacon);

        driver.tick();
        driver.tick();
        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(split_datagram(&sent[0].0), Some((0, &[FRAME_TAG_CONNECT][..])));
        assert_eq!(sent[0].1, addr(5555));

        binding.set(ConnectionId::new(1)).unwrap();
        driver.tick();
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_beacon_respects_interval() {
        let sink = Arc::new(CaptureSink::new());
        let mut beacon = HelloBeacon::new(sink.clone(), addr(5555), Duration::from_secs(60));
        let now = Instant::now();
        beacon.poll(now);
        beacon.poll(now + Duration::from_secs(1));
        assert_eq!(sink.take().len(), 1);
        beacon.poll(now + Duration::from_secs(61));
        assert_eq!(sink.take().len(), 1);
    }
}

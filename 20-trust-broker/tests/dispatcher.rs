use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use trust_broker::{
    anchor::{AnchorError, TrustAnchor, UnavailableAnchor},
    backing::{MemoryBacking, StoreHandle},
    config::{DispatchConfig, FlushPolicy},
    dispatcher::{Dispatcher, ShutdownHandle},
    packet::{Operation, PacketHeader, RequestEnvelope, ResponseEnvelope, ResultCode},
    pool::WorkerPool,
    record::{Handle, KeyRecord, Layout, ROOT_HANDLE, encode_record},
    store::KeyStore,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    pool: Arc<WorkerPool>,
    store: Arc<StoreHandle>,
    backing: MemoryBacking,
    shutdown: ShutdownHandle,
    server: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(
        config: DispatchConfig,
        policy: FlushPolicy,
        anchor: Box<dyn TrustAnchor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let backing = MemoryBacking::new();
        let store = Arc::new(StoreHandle::new(
            KeyStore::new(Layout::Legacy),
            backing.clone(),
            policy,
        ));
        let dispatcher = Dispatcher::new(listener, Arc::clone(&store), anchor, config);
        let addr = dispatcher.local_addr()?;
        let pool = dispatcher.pool();
        let shutdown = dispatcher.shutdown_handle()?;
        let server = thread::spawn(move || dispatcher.run());
        Ok(Self {
            addr,
            pool,
            store,
            backing,
            shutdown,
            server,
        })
    }

    fn with_threads(max_threads: usize) -> Result<Self> {
        let config = DispatchConfig {
            max_threads,
            ..DispatchConfig::default()
        };
        Self::start(config, FlushPolicy::WriteThrough, Box::new(UnavailableAnchor))
    }

    fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        self.server
            .join()
            .map_err(|_| anyhow!("dispatcher thread panicked"))?
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        Ok(Self { stream })
    }

    fn call(&mut self, operation: u32, context: u32, payload: Vec<u8>) -> Result<ResponseEnvelope> {
        let request = RequestEnvelope::new(operation, context, payload);
        self.stream.write_all(&request.encode())?;
        Ok(ResponseEnvelope::read_from(&mut self.stream)?)
    }

    fn open(&mut self) -> Result<u32> {
        let response = self.call(Operation::OPEN_CONTEXT, 0, Vec::new())?;
        assert_eq!(response.code, ResultCode::Success);
        Ok(response.context)
    }
}

fn assert_closed_by_server(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .expect("set timeout");
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) => {}
        other => panic!("expected the server to close the connection, got {other:?}"),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn refuses_connections_beyond_the_thread_limit() -> Result<()> {
    let harness = Harness::with_threads(2)?;

    let mut first = Client::connect(harness.addr)?;
    let mut second = Client::connect(harness.addr)?;
    first.open()?;
    second.open()?;
    assert_eq!(harness.pool.active_count(), 2);

    let mut refused = TcpStream::connect(harness.addr)?;
    assert_closed_by_server(&mut refused);
    assert_eq!(harness.pool.active_count(), 2);

    drop(first);
    assert!(wait_until(|| harness.pool.active_count() == 1));

    let mut third = Client::connect(harness.addr)?;
    third.open()?;
    assert_eq!(harness.pool.active_count(), 2);

    harness.stop()
}

#[test]
fn registry_round_trip_over_the_wire() -> Result<()> {
    let harness = Harness::with_threads(4)?;
    let mut client = Client::connect(harness.addr)?;
    let context = client.open()?;

    let parent = Handle([0x11; 16]);
    let child = Handle([0x22; 16]);
    let records = [
        KeyRecord::new(parent, ROOT_HANDLE).with_public(vec![1, 2, 3]),
        KeyRecord::new(child, parent).with_private(vec![4; 40]).with_cache_flags(2),
    ];
    for record in &records {
        let payload = encode_record(record, Layout::Versioned)?;
        let response = client.call(Operation::REGISTER_KEY, context, payload)?;
        assert_eq!(response.code, ResultCode::Success);
    }
    assert_eq!(harness.store.len(), 2);
    assert!(!harness.backing.contents().is_empty());

    let listed = client.call(Operation::ENUMERATE_KEYS, context, Vec::new())?;
    assert_eq!(listed.code, ResultCode::Success);
    assert_eq!(&listed.payload[..4], &2u32.to_be_bytes());
    assert_eq!(&listed.payload[4..20], parent.as_bytes());
    assert_eq!(&listed.payload[20..36], child.as_bytes());

    let fetched = client.call(Operation::GET_REGISTERED_KEY, context, child.as_bytes().to_vec())?;
    assert_eq!(fetched.code, ResultCode::Success);
    assert_eq!(fetched.payload, encode_record(&records[1], Layout::Versioned)?);

    let blocked = client.call(Operation::UNREGISTER_KEY, context, parent.as_bytes().to_vec())?;
    assert_eq!(blocked.code, ResultCode::HasChildren);

    for handle in [child, parent] {
        let response = client.call(Operation::UNREGISTER_KEY, context, handle.as_bytes().to_vec())?;
        assert_eq!(response.code, ResultCode::Success);
    }
    assert!(harness.store.is_empty());
    assert_eq!(harness.backing.contents(), vec![0, 0, 0, 0]);

    harness.stop()
}

#[test]
fn requests_without_a_context_are_refused() -> Result<()> {
    let harness = Harness::with_threads(2)?;
    let mut client = Client::connect(harness.addr)?;

    let response = client.call(Operation::ENUMERATE_KEYS, 7, Vec::new())?;
    assert_eq!(response.code, ResultCode::UnknownContext);

    // The connection survives a refused request.
    let context = client.open()?;
    let response = client.call(Operation::ENUMERATE_KEYS, context, Vec::new())?;
    assert_eq!(response.code, ResultCode::Success);

    harness.stop()
}

#[test]
fn oversized_packet_drops_only_that_connection() -> Result<()> {
    let config = DispatchConfig {
        max_threads: 2,
        max_payload: 64,
        ..DispatchConfig::default()
    };
    let harness = Harness::start(config, FlushPolicy::WriteThrough, Box::new(UnavailableAnchor))?;

    let mut bystander = Client::connect(harness.addr)?;
    let context = bystander.open()?;

    let mut offender = TcpStream::connect(harness.addr)?;
    let header = PacketHeader {
        operation: Operation::REGISTER_KEY,
        payload_len: 1 << 20,
        context: 0,
    };
    offender.write_all(&header.to_bytes())?;
    assert_closed_by_server(&mut offender);
    assert!(wait_until(|| harness.pool.active_count() == 1));

    let response = bystander.call(Operation::ENUMERATE_KEYS, context, Vec::new())?;
    assert_eq!(response.code, ResultCode::Success);

    harness.stop()
}

#[derive(Clone, Default)]
struct RecordingAnchor {
    calls: Arc<Mutex<Vec<(u32, u32, Vec<u8>)>>>,
}

impl TrustAnchor for RecordingAnchor {
    fn execute(&self, context: u32, ordinal: u32, payload: &[u8]) -> Result<Vec<u8>, AnchorError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((context, ordinal, payload.to_vec()));
        Ok(vec![0xAB; 3])
    }
}

#[test]
fn unknown_operations_reach_the_trust_anchor() -> Result<()> {
    let anchor = RecordingAnchor::default();
    let harness = Harness::start(
        DispatchConfig::default(),
        FlushPolicy::WriteThrough,
        Box::new(anchor.clone()),
    )?;
    let mut client = Client::connect(harness.addr)?;
    let context = client.open()?;

    let response = client.call(0x0000_00A0, context, vec![1, 2, 3, 4])?;
    assert_eq!(response.code, ResultCode::Success);
    assert_eq!(response.context, context);
    assert_eq!(response.payload, vec![0xAB; 3]);

    let calls = anchor.calls.lock().expect("calls lock").clone();
    assert_eq!(calls, vec![(context, 0xA0, vec![1, 2, 3, 4])]);

    harness.stop()
}

#[test]
fn explicit_flush_defers_persistence() -> Result<()> {
    let harness = Harness::start(
        DispatchConfig::default(),
        FlushPolicy::Explicit,
        Box::new(UnavailableAnchor),
    )?;
    let mut client = Client::connect(harness.addr)?;
    let context = client.open()?;

    let record = KeyRecord::new(Handle([0x33; 16]), ROOT_HANDLE);
    let response = client.call(
        Operation::REGISTER_KEY,
        context,
        encode_record(&record, Layout::Versioned)?,
    )?;
    assert_eq!(response.code, ResultCode::Success);
    assert!(harness.backing.contents().is_empty());
    assert!(harness.store.is_dirty());

    let response = client.call(Operation::FLUSH_STORE, context, Vec::new())?;
    assert_eq!(response.code, ResultCode::Success);
    let persisted = KeyStore::load_bytes(&harness.backing.contents())?;
    assert!(persisted.contains(&record.handle));

    harness.stop()
}

#[test]
fn shutdown_closes_clients_and_flushes() -> Result<()> {
    let harness = Harness::start(
        DispatchConfig::default(),
        FlushPolicy::Explicit,
        Box::new(UnavailableAnchor),
    )?;
    let mut client = Client::connect(harness.addr)?;
    let context = client.open()?;
    let record = KeyRecord::new(Handle([0x44; 16]), ROOT_HANDLE);
    client.call(
        Operation::REGISTER_KEY,
        context,
        encode_record(&record, Layout::Versioned)?,
    )?;

    let backing = harness.backing.clone();
    let pool = Arc::clone(&harness.pool);
    harness.stop()?;

    assert_eq!(pool.active_count(), 0);
    assert_closed_by_server(&mut client.stream);
    let persisted = KeyStore::load_bytes(&backing.contents())?;
    assert!(persisted.contains(&record.handle));
    Ok(())
}

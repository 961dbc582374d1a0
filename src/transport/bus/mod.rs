//! Message-bus transport
//!
//! Sends each flushed bundle as one length-prefixed OSC bundle over a
//! persistent TCP stream and applies inbound address-keyed values back onto
//! the property groups. The client runs on its own thread with a
//! current-thread tokio runtime and reconnects every 100 ms while the server
//! is unreachable.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use rosc::{OscMessage, OscType};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, BusConfig};
use crate::error::{Result, SyncError};

use super::{ChangeBatch, ConnectionState, RemoteValue, Transport, TransportSink};

pub mod codec;


use codec::Target;

struct BusInner {
    config: BusConfig,
    /// Pause between connection attempts
    reconnect_backoff: Duration,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    sink: RwLock<Option<Arc<dyn TransportSink>>>,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// OSC-over-TCP client transport
pub struct BusTransport {
    inner: Arc<BusInner>,
    /// Bounded wait for the first connection attempt
    first_attempt: Duration,
    worker: Mutex<Option<Worker>>,
}

impl BusTransport {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config: config.transport.bus.clone(),
                reconnect_backoff: config.timing.reconnect_backoff(),
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                sink: RwLock::new(None),
            }),
            first_attempt: config.timing.join_timeout(),
            worker: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.inner.config.host, self.inner.config.port)
    }
}

impl Transport for BusTransport {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn connect(&self, sink: Arc<dyn TransportSink>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SyncError::AlreadyConnected);
        }

        *self.inner.sink.write() = Some(sink);
        self.inner.set_state(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (first_tx, first_rx) = bounded::<bool>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let endpoint = self.endpoint();

        let handle = thread::Builder::new()
            .name("midibox-bus".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(run(inner, endpoint, shutdown_rx, first_tx)),
                    Err(e) => error!("Failed to start bus runtime: {}", e),
                }
                drop(done_tx);
            })?;

        match first_rx.recv_timeout(self.first_attempt) {
            Ok(true) => info!("Bus transport connected to {}", self.endpoint()),
            _ => warn!("Bus server {} not reachable yet, retrying in background", self.endpoint()),
        }

        *worker = Some(Worker {
            shutdown: shutdown_tx,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    fn disconnect(&self, timeout: Duration) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.shutdown.send(true);
            match worker.done.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Bus thread did not exit within {:?}, detaching", timeout);
                }
                _ => {
                    let _ = worker.handle.join();
                }
            }
        }

        *self.inner.outbound.lock() = None;
        *self.inner.sink.write() = None;
        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn write(&self, batch: &ChangeBatch) {
        if batch.changes.is_empty() {
            return;
        }
        let state = self.inner.state();
        if state != ConnectionState::Synced {
            warn!("Dropping {} property changes while {}", batch.changes.len(), state);
            return;
        }
        match codec::encode_changes(&self.inner.config.prefix, &batch.changes) {
            Ok(body) => self.inner.send(body),
            Err(e) => error!("Failed to encode bundle: {}", e),
        }
    }

    fn initialize(&self) {
        let addr = codec::initialize_address(&self.inner.config.prefix);
        match codec::encode_message(addr, Vec::new()) {
            Ok(body) => self.inner.send(body),
            Err(e) => error!("Failed to encode initialize: {}", e),
        }
    }

    fn send_raw(&self, bytes: &[u8]) {
        let addr = codec::midi_address(&self.inner.config.prefix);
        match codec::encode_message(addr, vec![OscType::Blob(bytes.to_vec())]) {
            Ok(body) => self.inner.send(body),
            Err(e) => error!("Failed to encode MIDI blob: {}", e),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl Drop for BusTransport {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            let _ = self.disconnect(self.first_attempt);
        }
    }
}

impl BusInner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Queue one frame body for the connected stream
    fn send(&self, body: Vec<u8>) {
        let framed = codec::frame(&body, self.config.byte_order);
        match self.outbound.lock().as_ref() {
            Some(tx) if tx.send(framed).is_ok() => {}
            _ => warn!("Bus not connected, message dropped"),
        }
    }

    fn handle_frame(&self, body: &[u8]) {
        let messages = match codec::decode_messages(body) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping inbound bus frame: {}", e);
                return;
            }
        };

        let Some(sink) = self.sink.read().clone() else { return };
        let mut values = Vec::new();
        for OscMessage { addr, args } in messages {
            match codec::parse_address(&self.config.prefix, &addr) {
                Some(Target::Property(group, name)) => match args.first().and_then(codec::from_osc) {
                    Some(value) => values.push(RemoteValue { group, name, value }),
                    None => debug!("No usable argument for {}", addr),
                },
                Some(Target::Midi) => {
                    if let Some(OscType::Blob(bytes)) = args.first() {
                        sink.raw_message(bytes);
                    }
                }
                Some(Target::Initialize) | None => debug!("Ignoring bus message {}", addr),
            }
        }

        if !values.is_empty() {
            sink.apply_remote(values, true);
        }
    }
}

/// Client loop: connect, run a session, reconnect until shutdown
async fn run(
    inner: Arc<BusInner>,
    endpoint: String,
    mut shutdown: watch::Receiver<bool>,
    first: crossbeam::channel::Sender<bool>,
) {
    let mut reported = false;
    let mut report = |ok: bool| {
        if !reported {
            reported = true;
            let _ = first.try_send(ok);
        }
    };

    while !*shutdown.borrow() {
        let connected = tokio::select! {
            r = TcpStream::connect(&endpoint) => r,
            _ = shutdown.changed() => break,
        };

        let stream = match connected {
            Ok(s) => s,
            Err(e) => {
                report(false);
                debug!("Bus connect to {} failed: {}", endpoint, e);
                tokio::select! {
                    _ = tokio::time::sleep(inner.reconnect_backoff) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.outbound.lock() = Some(tx);
        inner.set_state(ConnectionState::Synced);
        info!("OSC client connected to {}", endpoint);
        report(true);

        let stop = session(&inner, stream, rx, &mut shutdown).await;

        *inner.outbound.lock() = None;
        if stop {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        warn!("Bus connection to {} lost, reconnecting", endpoint);
    }
}

/// Pump one connection; true when it ended because of shutdown
async fn session(
    inner: &Arc<BusInner>,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (reader, mut writer) = stream.into_split();
    let mut reader_task = tokio::spawn(read_loop(Arc::clone(inner), reader));

    let stop = loop {
        tokio::select! {
            _ = &mut reader_task => break false,
            Some(frame) = outbound.recv() => {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Bus write failed: {}", e);
                    break false;
                }
            }
            _ = shutdown.changed() => break true,
        }
    };

    reader_task.abort();
    let _ = writer.shutdown().await;
    stop
}

async fn read_loop(inner: Arc<BusInner>, mut reader: OwnedReadHalf) {
    let order = inner.config.byte_order;
    loop {
        let mut prefix = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut prefix).await {
            debug!("Bus read ended: {}", e);
            return;
        }
        let len = codec::frame_len(prefix, order);
        if len > inner.config.max_frame_bytes {
            warn!("Bus frame of {} bytes exceeds limit, closing", len);
            return;
        }
        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            debug!("Bus read ended mid-frame: {}", e);
            return;
        }
        inner.handle_frame(&body);
    }
}

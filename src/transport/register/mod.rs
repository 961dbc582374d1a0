//! Register-sync transport
//!
//! Mirrors each General/Layer group as a fixed-length register block read
//! from the device over SysEx. Local changes are patched into the mirror and
//! sent as one diff-write per block; device-initiated pushes are patched in
//! and decoded back into property values.
//!
//! Threads: the MIDI driver's callback thread delivers inbound frames, the
//! watchdog thread probes and reconnects, and callers issue writes. One
//! mutex guards the blocks and the single pending-read slot.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ProtocolConfig, TimingConfig};
use crate::error::{Result, SyncError};
use crate::midi::format_hex;
use crate::property::LAYERS;

use super::{ChangeBatch, ConnectionState, RemoteValue, Transport, TransportSink};

pub mod frame;
pub mod layout;
pub mod link;
mod watchdog;

#[cfg(test)]
pub(crate) mod fake;

use frame::{Command, Frame, FrameCodec};
use link::{LinkOpener, MidiLink, MidirOpener};
use watchdog::Supervisor;

/// Correlation key of the single outstanding read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    group: u8,
    offset: u8,
    len: u8,
}

#[derive(Default)]
struct SyncState {
    /// Register mirror keyed by wire group index; empty until the first resync
    blocks: BTreeMap<u8, Vec<u8>>,
    pending: Option<PendingRequest>,
    response: Option<Vec<u8>>,
    /// Device-initiated updates held back while a resync reads the blocks
    deferred: Option<Vec<Frame>>,
}

struct Inner {
    opener: Box<dyn LinkOpener>,
    codec: FrameCodec,
    protocol: ProtocolConfig,
    timing: TimingConfig,
    keep_alive: bool,
    link: Mutex<Option<Box<dyn MidiLink>>>,
    sync: Mutex<SyncState>,
    response_ready: Condvar,
    state: RwLock<ConnectionState>,
    last_activity: Mutex<Instant>,
    sink: RwLock<Option<Arc<dyn TransportSink>>>,
    shutdown: AtomicBool,
}

/// Register-sync transport over a MIDI link
pub struct RegisterTransport {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl RegisterTransport {
    pub fn from_config(config: &AppConfig) -> Self {
        let opener = MidirOpener::new(config.transport.register.clone());
        Self::with_opener(Box::new(opener), config)
    }

    /// Build with a custom link opener
    pub fn with_opener(opener: Box<dyn LinkOpener>, config: &AppConfig) -> Self {
        let inner = Inner {
            opener,
            codec: FrameCodec::new(&config.protocol),
            protocol: config.protocol.clone(),
            timing: config.timing.clone(),
            keep_alive: config.keep_alive,
            link: Mutex::new(None),
            sync: Mutex::new(SyncState::default()),
            response_ready: Condvar::new(),
            state: RwLock::new(ConnectionState::Disconnected),
            last_activity: Mutex::new(Instant::now()),
            sink: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            supervisor: Mutex::new(None),
        }
    }
}

/// Copy an update's bytes into its block; the patched span, or None when out of bounds
fn patch_block(block: &mut [u8], frame: &Frame) -> Option<(usize, usize)> {
    let start = frame.offset as usize;
    let end = start + frame.data.len();
    if end > block.len() {
        warn!(
            "Update for block {} at {}+{} exceeds block length {}",
            frame.group,
            start,
            frame.data.len(),
            block.len()
        );
        return None;
    }
    block[start..end].copy_from_slice(&frame.data);
    Some((start, end))
}

impl Transport for RegisterTransport {
    fn name(&self) -> &'static str {
        "register"
    }

    fn connect(&self, sink: Arc<dyn TransportSink>) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Err(SyncError::AlreadyConnected);
        }

        let inner = &self.inner;
        inner.shutdown.store(false, Ordering::SeqCst);
        *inner.sink.write() = Some(sink);

        match inner.open_and_sync(inner.timing.read_retries) {
            Ok(()) => inner.emit_all(),
            Err(e) => {
                warn!("Midibox connect failed, retrying in background: {}", e);
                inner.close_link();
                inner.set_state(ConnectionState::Connecting);
            }
        }

        *supervisor = Some(Supervisor::spawn(Arc::clone(inner))?);
        Ok(())
    }

    fn disconnect(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::SeqCst);
        inner.response_ready.notify_all();

        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.stop(timeout);
        }

        inner.close_link();
        inner.sync.lock().blocks.clear();
        inner.set_state(ConnectionState::Disconnected);
        *inner.sink.write() = None;
        info!("Midibox disconnected");
        Ok(())
    }

    fn write(&self, batch: &ChangeBatch) {
        self.inner.write_batch(batch);
    }

    fn send_raw(&self, bytes: &[u8]) {
        if let Err(e) = self.inner.send(bytes) {
            warn!("Raw MIDI not sent: {}", e);
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl Drop for RegisterTransport {
    fn drop(&mut self) {
        if self.supervisor.get_mut().is_some() {
            let _ = self.disconnect(self.inner.timing.join_timeout());
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Register transport {} -> {}", *current, state);
            *current = state;
        }
    }

    fn sink(&self) -> Option<Arc<dyn TransportSink>> {
        self.sink.read().clone()
    }

    fn emit_all(&self) {
        if let Some(sink) = self.sink() {
            sink.emit_all();
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn block_len(&self, index: u8) -> usize {
        if index == self.protocol.general_index {
            self.protocol.general_block_len as usize
        } else {
            self.protocol.layer_block_len as usize
        }
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut link = self.link.lock();
        let link = link.as_mut().ok_or(SyncError::NotConnected)?;
        debug!("MIDI out: {}", format_hex(bytes));
        link.send(bytes)
    }

    fn close_link(&self) {
        let link = self.link.lock().take();
        // Dropped outside the lock: closing the input joins the driver thread
        drop(link);
    }

    /// Open the ports and run a full resync
    fn open_and_sync(self: &Arc<Self>, retries: u32) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        self.open_link()?;
        self.resync(retries)
    }

    fn open_link(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let link = self.opener.open(Box::new(move |bytes| {
            if let Some(inner) = weak.upgrade() {
                inner.on_inbound(bytes);
            }
        }))?;
        *self.link.lock() = Some(link);
        self.touch();
        Ok(())
    }

    /// Read every block, load it silently into the properties and mark the transport synced
    fn resync(&self, retries: u32) -> Result<()> {
        self.sync.lock().deferred = Some(Vec::new());
        let blocks = match self.read_all_blocks(retries) {
            Ok(blocks) => blocks,
            Err(e) => {
                self.sync.lock().deferred = None;
                return Err(e);
            }
        };

        {
            let mut sync = self.sync.lock();
            sync.blocks = blocks;
            let deferred = sync.deferred.take().unwrap_or_default();
            if !deferred.is_empty() {
                debug!("Replaying {} updates received during resync", deferred.len());
            }
            for frame in &deferred {
                if let Some(block) = sync.blocks.get_mut(&frame.group) {
                    patch_block(block, frame);
                }
            }

            let gi = self.protocol.general_index;
            let values: Vec<RemoteValue> = sync
                .blocks
                .iter()
                .filter_map(|(index, block)| {
                    layout::block_address(*index, gi).map(|addr| layout::decode_block(addr, block))
                })
                .flatten()
                .collect();

            // Loaded under the mirror lock so later pushes land on top
            if let Some(sink) = self.sink() {
                sink.apply_remote(values, false);
            }
        }

        self.write_device_flags();
        self.set_state(ConnectionState::Synced);
        info!("Midibox synced");
        Ok(())
    }

    fn read_all_blocks(&self, retries: u32) -> Result<BTreeMap<u8, Vec<u8>>> {
        let gi = self.protocol.general_index;
        let mut blocks = BTreeMap::new();
        for index in std::iter::once(gi).chain(0..LAYERS as u8) {
            let len = self.block_len(index);
            blocks.insert(index, self.read_range(index, 0, len, retries)?);
        }
        Ok(blocks)
    }

    /// Read `[first, first + len)` of a block in chunks of at most `max_payload`
    ///
    /// Each chunk gets `retries + 1` attempts before the connection is declared lost.
    fn read_range(&self, group: u8, first: usize, len: usize, retries: u32) -> Result<Vec<u8>> {
        let max = self.protocol.max_payload as usize;
        let end = first + len;
        let mut out = Vec::with_capacity(len);
        let mut offset = first;

        while offset < end {
            let chunk = (end - offset).min(max);
            let mut attempt = 0;
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Err(SyncError::ConnectionLost("shutting down".into()));
                }
                match self.read_chunk(group, offset as u8, chunk as u8) {
                    Ok(data) => {
                        out.extend(data);
                        break;
                    }
                    Err(e @ SyncError::ReadTimeout { .. }) if attempt < retries => {
                        attempt += 1;
                        warn!("{}, retrying ({}/{})", e, attempt, retries);
                    }
                    Err(SyncError::ReadTimeout { .. }) => {
                        return Err(SyncError::ConnectionLost(format!(
                            "no response for read of block {} after {} attempts",
                            group,
                            attempt + 1
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            offset += chunk;
        }

        Ok(out)
    }

    /// One request/response exchange through the pending slot
    fn read_chunk(&self, group: u8, offset: u8, len: u8) -> Result<Vec<u8>> {
        let key = PendingRequest { group, offset, len };
        let timeout = SyncError::ReadTimeout { block: group, offset, len };
        let mut sync = self.sync.lock();

        let deadline = Instant::now() + self.timing.read_timeout();
        while sync.pending.is_some() {
            if self.response_ready.wait_until(&mut sync, deadline).timed_out() {
                return Err(timeout);
            }
        }

        sync.pending = Some(key);
        sync.response = None;
        if let Err(e) = self.send(&self.codec.read_request(group, offset, len)) {
            sync.pending = None;
            self.response_ready.notify_all();
            return Err(e);
        }

        let deadline = Instant::now() + self.timing.read_timeout();
        loop {
            if let Some(data) = sync.response.take() {
                sync.pending = None;
                self.response_ready.notify_all();
                return Ok(data);
            }
            if self.shutdown.load(Ordering::SeqCst)
                || self.response_ready.wait_until(&mut sync, deadline).timed_out()
            {
                sync.pending = None;
                self.response_ready.notify_all();
                return Err(timeout);
            }
        }
    }

    /// Inbound bytes from the MIDI driver thread
    fn on_inbound(&self, bytes: &[u8]) {
        self.touch();

        match self.codec.decode(bytes) {
            Ok(Some(frame)) => self.on_frame(frame),
            Ok(None) => {
                if let Some(sink) = self.sink() {
                    sink.raw_message(bytes);
                }
            }
            Err(e) => warn!("Dropping inbound frame: {} ({})", e, format_hex(bytes)),
        }
    }

    fn on_frame(&self, frame: Frame) {
        match frame.command {
            Command::ReadResponse | Command::Update => self.on_register_data(frame),
            Command::WriteAck => debug!("Write ack for block {} at {}", frame.group, frame.offset),
            Command::WriteNak => warn!(
                "Device rejected write to block {} at {}+{}",
                frame.group, frame.offset, frame.len
            ),
            other => debug!("Ignoring {:?} frame for block {}", other, frame.group),
        }
    }

    fn on_register_data(&self, frame: Frame) {
        let key = PendingRequest {
            group: frame.group,
            offset: frame.offset,
            len: frame.len,
        };
        let gi = self.protocol.general_index;

        let values = {
            let mut sync = self.sync.lock();
            if sync.pending == Some(key) && sync.response.is_none() {
                sync.response = Some(frame.data);
                self.response_ready.notify_all();
                return;
            }

            // Device-initiated update
            if let Some(deferred) = sync.deferred.as_mut() {
                debug!("Update for block {} during resync, deferred", frame.group);
                deferred.push(frame);
                return;
            }
            let Some(address) = layout::block_address(frame.group, gi) else {
                debug!("Update for unknown block {}", frame.group);
                return;
            };
            let Some(block) = sync.blocks.get_mut(&frame.group) else {
                debug!("Update for block {} before resync, ignored", frame.group);
                return;
            };
            let Some((start, end)) = patch_block(block, &frame) else {
                return;
            };
            layout::decode_range(address, block, start, end)
        };

        if let Some(sink) = self.sink() {
            sink.apply_remote(values, true);
        }
    }

    /// Patch a batch into the mirror and send one write per touched block
    fn write_batch(&self, batch: &ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        let state = self.state();
        if state != ConnectionState::Synced {
            warn!("Dropping {} property changes while {}", batch.changes.len(), state);
            return;
        }

        let gi = self.protocol.general_index;
        let mut sync = self.sync.lock();
        for owner in batch.touched_blocks() {
            let index = layout::block_index(owner, gi);
            let Some(block) = sync.blocks.get_mut(&index) else { continue };
            let before = block.clone();

            for change in batch.changes.iter().filter(|c| c.source.init_owner() == owner) {
                if !layout::encode_change(block, change) {
                    debug!("{} '{}' has no register", change.source, change.name);
                }
            }

            let result = if batch.full_push.contains(&owner) {
                let mut full = block.clone();
                full[layout::INIT] = 1;
                self.send_write(index, 0, &full)
            } else {
                match layout::diff_range(&before, block) {
                    Some((first, last)) => self.send_write(index, first, &block[first..=last]),
                    None => Ok(()),
                }
            };
            if let Err(e) = result {
                warn!("Write to block {} failed: {}", index, e);
            }
        }
    }

    /// Send a register write, split only when it exceeds the payload limit
    fn send_write(&self, group: u8, offset: usize, data: &[u8]) -> Result<()> {
        let max = self.protocol.max_payload as usize;
        for (i, chunk) in data.chunks(max).enumerate() {
            let at = (offset + i * max) as u8;
            self.send(&self.codec.write_request(group, at, chunk))?;
        }
        Ok(())
    }

    /// Keep-alive and raw-data flags of the General config byte
    fn write_device_flags(&self) {
        let gi = self.protocol.general_index;
        let mut sync = self.sync.lock();
        let Some(block) = sync.blocks.get_mut(&gi) else { return };
        let before = block.clone();
        layout::encode_device_flags(block, self.keep_alive);
        if let Some((first, last)) = layout::diff_range(&before, block) {
            if let Err(e) = self.send_write(gi, first, &block[first..=last]) {
                warn!("Device flags not written: {}", e);
            }
        }
    }

    /// 1-byte read of the General config, answered as an unsolicited update
    fn send_probe(&self) {
        let probe = self.codec.read_request(self.protocol.general_index, 0, 1);
        if let Err(e) = self.send(&probe) {
            debug!("Probe not sent: {}", e);
        }
    }
}

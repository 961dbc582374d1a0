//! In-process stand-in for the device, answering register reads from its own blocks

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::frame::{Command, Frame, FrameCodec};
use super::layout::{GENERAL_LAYOUT_LEN, LAYER_LAYOUT_LEN};
use super::link::{InboundCallback, LinkOpener, MidiLink};
use crate::config::{AppConfig, ProtocolConfig, TimingConfig};
use crate::error::{Result, SyncError};
use crate::property::LAYERS;
use crate::transport::{RemoteValue, TransportSink};

type SharedCallback = Arc<Mutex<InboundCallback>>;

struct FakeState {
    blocks: BTreeMap<u8, Vec<u8>>,
    present: bool,
    responsive: bool,
    /// Read requests left unanswered before the device starts answering again
    drop_reads: usize,
    sent: Vec<Vec<u8>>,
    opens: usize,
    inbound: Option<SharedCallback>,
    /// Updates pushed just before answering a read of the keyed block
    read_triggers: Vec<(u8, Frame)>,
}

/// Scripted device behind a fake MIDI link
#[derive(Clone)]
pub(crate) struct FakeDevice {
    codec: FrameCodec,
    general_index: u8,
    state: Arc<Mutex<FakeState>>,
}

/// Blocks as a freshly booted device reports them
pub(crate) fn factory_blocks(protocol: &ProtocolConfig) -> BTreeMap<u8, Vec<u8>> {
    let mut blocks = BTreeMap::new();

    let mut general = vec![0u8; protocol.general_block_len as usize];
    general[30..30 + 8].fill(127);
    blocks.insert(protocol.general_index, general);

    for l in 0..LAYERS as u8 {
        let mut layer = vec![0u8; protocol.layer_block_len as usize];
        layer[0] = 0b10;
        layer[3..6].copy_from_slice(&[0, 0, 68]);
        layer[6] = 21;
        layer[7] = 108;
        layer[8] = 100;
        layer[10..16].fill(64);
        blocks.insert(l, layer);
    }
    blocks
}

/// Configuration with short timings for tests
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.timing = TimingConfig {
        read_timeout_ms: 40,
        read_retries: 2,
        watchdog_tick_ms: 10,
        probe_after_ms: 60,
        stale_after_ms: 150,
        reconnect_backoff_ms: 20,
        reconnect_read_retries: 1,
        join_timeout_ms: 1000,
    };
    assert_eq!(config.protocol.general_block_len as usize, GENERAL_LAYOUT_LEN);
    assert_eq!(config.protocol.layer_block_len as usize, LAYER_LAYOUT_LEN);
    config
}

impl FakeDevice {
    pub(crate) fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            codec: FrameCodec::new(protocol),
            general_index: protocol.general_index,
            state: Arc::new(Mutex::new(FakeState {
                blocks: factory_blocks(protocol),
                present: true,
                responsive: true,
                drop_reads: 0,
                sent: Vec::new(),
                opens: 0,
                inbound: None,
                read_triggers: Vec::new(),
            })),
        }
    }

    pub(crate) fn opener(&self) -> Box<dyn LinkOpener> {
        Box::new(self.clone())
    }

    pub(crate) fn general_index(&self) -> u8 {
        self.general_index
    }

    pub(crate) fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    pub(crate) fn set_responsive(&self, responsive: bool) {
        self.state.lock().responsive = responsive;
    }

    pub(crate) fn drop_next_reads(&self, n: usize) {
        self.state.lock().drop_reads = n;
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub(crate) fn block(&self, index: u8) -> Vec<u8> {
        self.state.lock().blocks[&index].clone()
    }

    pub(crate) fn set_block_bytes(&self, index: u8, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.get_mut(&index) {
            block[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    pub(crate) fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Every frame the transport sent, decoded
    pub(crate) fn sent_frames(&self) -> Vec<Frame> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|b| self.codec.decode(b).ok().flatten())
            .collect()
    }

    pub(crate) fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn writes(&self) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.command == Command::WriteRequest)
            .collect()
    }

    pub(crate) fn read_requests(&self) -> usize {
        self.sent_frames()
            .iter()
            .filter(|f| f.command == Command::ReadRequest)
            .count()
    }

    /// Deliver bytes from the device as if they arrived on the input port
    pub(crate) fn push(&self, bytes: &[u8]) {
        let callback = self.state.lock().inbound.clone();
        if let Some(cb) = callback {
            let mut on_message = cb.lock();
            (*on_message)(bytes);
        }
    }

    /// Device-initiated register update
    pub(crate) fn push_update(&self, group: u8, offset: u8, data: &[u8]) {
        self.set_block_bytes(group, offset as usize, data);
        self.push(&self.codec.encode(&update_frame(group, offset, data)));
    }

    /// Push an update of `group` right before answering the next read of `trigger`
    pub(crate) fn update_on_read(&self, trigger: u8, group: u8, offset: u8, data: &[u8]) {
        self.state
            .lock()
            .read_triggers
            .push((trigger, update_frame(group, offset, data)));
    }

    fn answer(&self, request: &[u8]) {
        let Ok(Some(frame)) = self.codec.decode(request) else { return };
        let (offset, len) = (frame.offset as usize, frame.len as usize);
        let mut updates = Vec::new();

        let reply = {
            let mut state = self.state.lock();
            match frame.command {
                Command::ReadRequest => {
                    if !state.responsive {
                        return;
                    }
                    if state.drop_reads > 0 {
                        state.drop_reads -= 1;
                        return;
                    }
                    let (fire, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.read_triggers)
                        .into_iter()
                        .partition(|(trigger, _)| *trigger == frame.group);
                    state.read_triggers = keep;
                    for (_, update) in fire {
                        if let Some(block) = state.blocks.get_mut(&update.group) {
                            let at = update.offset as usize;
                            block[at..at + update.data.len()].copy_from_slice(&update.data);
                        }
                        updates.push(update);
                    }
                    let Some(block) = state.blocks.get(&frame.group) else { return };
                    Frame {
                        command: Command::ReadResponse,
                        group: frame.group,
                        offset: frame.offset,
                        len: frame.len,
                        data: block[offset..offset + len].to_vec(),
                    }
                }
                Command::WriteRequest => {
                    if let Some(block) = state.blocks.get_mut(&frame.group) {
                        block[offset..offset + len].copy_from_slice(&frame.data);
                        // Write-only init byte reads back as 0
                        block[2] = 0;
                    }
                    Frame {
                        command: Command::WriteAck,
                        group: frame.group,
                        offset: frame.offset,
                        len: 0,
                        data: Vec::new(),
                    }
                }
                _ => return,
            }
        };

        for update in &updates {
            self.push(&self.codec.encode(update));
        }
        self.push(&self.codec.encode(&reply));
    }
}

fn update_frame(group: u8, offset: u8, data: &[u8]) -> Frame {
    Frame {
        command: Command::ReadResponse,
        group,
        offset,
        len: data.len() as u8,
        data: data.to_vec(),
    }
}

struct FakeLink {
    device: FakeDevice,
    requests: Sender<Vec<u8>>,
}

impl MidiLink for FakeLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.device.state.lock();
        state.sent.push(bytes.to_vec());
        if !state.present {
            return Err(SyncError::Midi("device unplugged".into()));
        }
        drop(state);
        let _ = self.requests.send(bytes.to_vec());
        Ok(())
    }
}

impl LinkOpener for FakeDevice {
    fn open(&self, on_message: InboundCallback) -> Result<Box<dyn MidiLink>> {
        let mut state = self.state.lock();
        if !state.present {
            return Err(SyncError::PortNotFound {
                pattern: "fake".into(),
                available: String::new(),
            });
        }
        state.opens += 1;
        state.inbound = Some(Arc::new(Mutex::new(on_message)));
        drop(state);

        // Replies come from another thread, like a real driver's callback
        let (tx, rx) = unbounded::<Vec<u8>>();
        let device = self.clone();
        thread::spawn(move || {
            for request in rx {
                device.answer(&request);
            }
        });

        Ok(Box::new(FakeLink {
            device: self.clone(),
            requests: tx,
        }))
    }
}

/// Sink recording everything a transport delivers
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub applied: Mutex<Vec<(Vec<RemoteValue>, bool)>>,
    pub emits: AtomicUsize,
    pub raw: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub(crate) fn emit_count(&self) -> usize {
        self.emits.load(Ordering::SeqCst)
    }

    /// Last value delivered for (group, name) with notifications on
    pub(crate) fn last_notified(&self, group: crate::property::GroupAddress, name: &str) -> Option<RemoteValue> {
        self.applied
            .lock()
            .iter()
            .filter(|(_, notify)| *notify)
            .flat_map(|(values, _)| values.iter())
            .filter(|v| v.group == group && v.name == name)
            .last()
            .cloned()
    }
}

impl TransportSink for RecordingSink {
    fn apply_remote(&self, values: Vec<RemoteValue>, notify: bool) {
        self.applied.lock().push((values, notify));
    }

    fn emit_all(&self) {
        self.emits.fetch_add(1, Ordering::SeqCst);
    }

    fn raw_message(&self, bytes: &[u8]) {
        self.raw.lock().push(bytes.to_vec());
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub(crate) fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

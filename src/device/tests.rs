//! Device facade scenarios: a recording transport for flush semantics, the
//! fake register device for end-to-end behaviour

use super::*;
use crate::transport::register::fake::{test_config, wait_for, FakeDevice};
use crate::transport::register::frame::Command;
use crate::transport::RegisterTransport;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<ChangeBatch>>,
    raw: Mutex<Vec<Vec<u8>>>,
    sink: RwLock<Option<Arc<dyn TransportSink>>>,
    initialized: AtomicUsize,
}

impl Recorder {
    fn sink(&self) -> Arc<dyn TransportSink> {
        self.sink.read().clone().unwrap()
    }

    fn batches(&self) -> Vec<ChangeBatch> {
        self.batches.lock().clone()
    }
}

struct RecordingTransport(Arc<Recorder>);

impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn connect(&self, sink: Arc<dyn TransportSink>) -> Result<()> {
        *self.0.sink.write() = Some(sink);
        Ok(())
    }

    fn disconnect(&self, _timeout: Duration) -> Result<()> {
        *self.0.sink.write() = None;
        Ok(())
    }

    fn write(&self, batch: &ChangeBatch) {
        self.0.batches.lock().push(batch.clone());
    }

    fn initialize(&self) {
        self.0.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn send_raw(&self, bytes: &[u8]) {
        self.0.raw.lock().push(bytes.to_vec());
    }

    fn connection_state(&self) -> ConnectionState {
        if self.0.sink.read().is_some() {
            ConnectionState::Synced
        } else {
            ConnectionState::Disconnected
        }
    }
}

fn recording_device() -> (Device, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let device = Device::new(Box::new(RecordingTransport(recorder.clone())), Duration::from_secs(1));
    device.connect().unwrap();
    (device, recorder)
}

fn collect_events(device: &Device) -> Arc<Mutex<Vec<PropertyEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    device.subscribe_all(move |e| sink.lock().push(e.clone()));
    events
}

fn names(batch: &ChangeBatch) -> Vec<(GroupAddress, String, Value)> {
    batch
        .changes
        .iter()
        .map(|c| (c.source, c.name.clone(), c.value.clone()))
        .collect()
}

#[test]
fn test_defaults_after_construction() {
    let (device, _) = recording_device();
    assert_eq!(device.get(GroupAddress::Layer(0), "volume"), Some(Value::Int(100)));
    assert_eq!(device.get(GroupAddress::Pedal(7, 7), "cc"), Some(Value::Int(0)));
    assert_eq!(device.get(GroupAddress::General, "pedal_max3"), Some(Value::Int(127)));
    assert_eq!(device.get(GroupAddress::Layer(0), "nope"), None);
    assert_eq!(device.get(GroupAddress::Layer(8), "volume"), None);
}

#[test]
fn test_set_clamps_and_notifies_once() {
    let (device, recorder) = recording_device();
    let events = collect_events(&device);

    assert_eq!(device.set(GroupAddress::Layer(2), "volume", 150), Some(Value::Int(127)));
    assert_eq!(device.get(GroupAddress::Layer(2), "volume"), Some(Value::Int(127)));

    // Same value again after validation: nothing stored, nothing flushed
    assert_eq!(device.set(GroupAddress::Layer(2), "volume", 200), None);

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].origin, Origin::Local);
    assert_eq!(events[0].value, Value::Int(127));
    assert_eq!(recorder.batches().len(), 1);
}

#[test]
fn test_unknown_property_is_ignored() {
    let (device, recorder) = recording_device();
    assert_eq!(device.set(GroupAddress::Layer(0), "colour", 3), None);
    assert_eq!(device.set(GroupAddress::Pedal(9, 0), "cc", 3), None);
    assert!(recorder.batches().is_empty());
}

#[test]
fn test_nested_bundles_flush_once_in_order() {
    let (device, recorder) = recording_device();

    {
        let _outer = device.bundle();
        device.set(GroupAddress::Layer(0), "volume", 10);
        {
            let _inner = device.bundle();
            device.set(GroupAddress::Pedal(0, 1), "cc", 64);
            device.set(GroupAddress::General, "enable", true);
        }
        assert!(recorder.batches().is_empty());
        device.set(GroupAddress::Layer(0), "volume", 11);
    }

    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        names(&batches[0]),
        vec![
            (GroupAddress::Layer(0), "volume".to_string(), Value::Int(10)),
            (GroupAddress::Pedal(0, 1), "cc".to_string(), Value::Int(64)),
            (GroupAddress::General, "enable".to_string(), Value::Bool(true)),
            (GroupAddress::Layer(0), "volume".to_string(), Value::Int(11)),
        ]
    );
}

#[test]
fn test_transaction_closure_returns_value() {
    let (device, recorder) = recording_device();
    let changed = device.transaction(|d| {
        d.set(GroupAddress::Layer(1), "attack", 5).is_some() && d.set(GroupAddress::Layer(1), "decay", -5).is_some()
    });
    assert!(changed);
    assert_eq!(recorder.batches().len(), 1);
    assert_eq!(recorder.batches()[0].changes.len(), 2);
}

#[test]
fn test_remote_values_notify_without_echo() {
    let (device, recorder) = recording_device();
    let events = collect_events(&device);

    recorder.sink().apply_remote(
        vec![
            RemoteValue::new(GroupAddress::Layer(3), "volume", 80),
            RemoteValue::new(GroupAddress::Layer(3), "rangel", 21),
            RemoteValue::new(GroupAddress::Pedal(3, 2), "mode", 1),
        ],
        true,
    );

    let events = events.lock();
    let changed: Vec<_> = events.iter().map(|e| (e.group, e.name.as_str())).collect();
    assert_eq!(changed, vec![(GroupAddress::Layer(3), "volume"), (GroupAddress::Pedal(3, 2), "mode")]);
    assert!(events.iter().all(|e| e.origin == Origin::Remote));
    assert!(recorder.batches().is_empty());
}

#[test]
fn test_remote_range_pair_is_not_distorted() {
    let (device, recorder) = recording_device();

    // Both bounds above the stored upper bound of 108
    recorder.sink().apply_remote(
        vec![
            RemoteValue::new(GroupAddress::Layer(0), "rangel", 110),
            RemoteValue::new(GroupAddress::Layer(0), "rangeu", 120),
        ],
        true,
    );

    assert_eq!(device.get(GroupAddress::Layer(0), "rangel"), Some(Value::Int(110)));
    assert_eq!(device.get(GroupAddress::Layer(0), "rangeu"), Some(Value::Int(120)));
}

#[test]
fn test_silent_apply_then_emit_all() {
    let (device, recorder) = recording_device();
    let events = collect_events(&device);

    recorder
        .sink()
        .apply_remote(vec![RemoteValue::new(GroupAddress::Layer(5), "volume", 33)], false);
    assert!(events.lock().is_empty());
    assert_eq!(device.get(GroupAddress::Layer(5), "volume"), Some(Value::Int(33)));

    device.emit_all();
    let events = events.lock();
    // 1 general + 8 layers + 64 pedals, every property once
    let general = events.iter().filter(|e| e.group == GroupAddress::General).count();
    assert_eq!(general, 33);
    assert!(events
        .iter()
        .any(|e| e.group == GroupAddress::Layer(5) && e.name == "volume" && e.value == Value::Int(33)));
}

#[test]
fn test_group_subscription_and_unsubscribe() {
    let (device, _) = recording_device();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let id = device.subscribe(GroupAddress::Layer(4), move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    device.set(GroupAddress::Layer(4), "volume", 1);
    device.set(GroupAddress::Layer(5), "volume", 1);
    assert!(device.unsubscribe(id));
    device.set(GroupAddress::Layer(4), "volume", 2);

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_listener_may_write_back() {
    let (device, recorder) = recording_device();
    let device = Arc::new(device);
    let weak = Arc::downgrade(&device);
    device.subscribe(GroupAddress::Layer(0), move |e| {
        if e.name == "volume" {
            if let Some(d) = weak.upgrade() {
                d.set(GroupAddress::Layer(0), "volume_ch", e.value.clone());
            }
        }
    });

    device.set(GroupAddress::Layer(0), "volume", 42);

    assert_eq!(device.get(GroupAddress::Layer(0), "volume_ch"), Some(Value::Int(42)));
    // The listener runs inside the caller's scope, so both land in one flush
    assert_eq!(recorder.batches().len(), 1);
    assert_eq!(recorder.batches()[0].changes.len(), 2);
}

#[test]
fn test_initialize_marks_next_flush_full_push() {
    let (device, recorder) = recording_device();
    device.initialize();
    assert_eq!(recorder.initialized.load(Ordering::SeqCst), 1);

    device.set(GroupAddress::Pedal(1, 0), "cc", 7);
    device.set(GroupAddress::Layer(1), "volume", 7);
    device.set(GroupAddress::General, "enable", true);

    let batches = recorder.batches();
    assert_eq!(batches[0].full_push, vec![GroupAddress::Layer(1)]);
    assert!(batches[1].full_push.is_empty());
    assert_eq!(batches[2].full_push, vec![GroupAddress::General]);
}

#[test]
fn test_apply_preset_in_one_bundle() {
    let (device, recorder) = recording_device();
    let yaml = r#"
general: { enable: true }
layers:
  0: { program: hammond, volume: 90, bogus: 1, pedals: { 0: { cc: 64 } } }
  1: { rangel: 30, rangeu: 60 }
  9: { volume: 1 }
"#;
    let preset: PresetMap = serde_yaml::from_str(yaml).unwrap();

    let changed = device.apply_preset(&preset);

    assert_eq!(changed, 6);
    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(device.get(GroupAddress::Layer(0), "program"), Some(Value::from("hammond")));
    assert_eq!(device.get(GroupAddress::Pedal(0, 0), "cc"), Some(Value::Int(64)));
    assert_eq!(device.get(GroupAddress::Layer(1), "rangeu"), Some(Value::Int(60)));
    assert_eq!(device.get(GroupAddress::General, "enable"), Some(Value::Bool(true)));
}

#[test]
fn test_reset_layer_includes_pedals() {
    let (device, recorder) = recording_device();
    {
        let _scope = device.bundle();
        device.set(GroupAddress::Layer(6), "volume", 3);
        device.set(GroupAddress::Pedal(6, 5), "mode", 2);
        device.set(GroupAddress::Layer(7), "volume", 3);
    }

    assert_eq!(device.reset_layer(6), 2);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(
        names(&batches[1]),
        vec![
            (GroupAddress::Layer(6), "volume".to_string(), Value::Int(100)),
            (GroupAddress::Pedal(6, 5), "mode".to_string(), Value::Int(0)),
        ]
    );
    assert_eq!(device.get(GroupAddress::Layer(7), "volume"), Some(Value::Int(3)));
    assert_eq!(device.reset_layer(8), 0);
}

#[test]
fn test_all_sounds_off_on_every_layer_channel() {
    let (device, recorder) = recording_device();
    device.all_sounds_off();
    let raw = recorder.raw.lock();
    assert_eq!(raw.len(), 8);
    for (ch, msg) in raw.iter().enumerate() {
        assert_eq!(msg, &vec![0xB0 | ch as u8, 120, 0]);
    }
}

#[test]
fn test_key_capture_sets_range_and_forwards() {
    let (device, recorder) = recording_device();
    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let f = forwarded.clone();
    device.forward_raw(move |bytes| f.lock().push(bytes.to_vec()));

    device.request_key(2, "rangeu".parse().unwrap());
    let sink = recorder.sink();
    sink.raw_message(&[0xF8]);
    sink.raw_message(&[0x91, 72, 100]);
    sink.raw_message(&[0x91, 40, 100]);

    assert_eq!(device.get(GroupAddress::Layer(2), "rangeu"), Some(Value::Int(72)));
    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        names(&batches[0]),
        vec![(GroupAddress::Layer(2), "rangeu".to_string(), Value::Int(72))]
    );
    assert_eq!(forwarded.lock().len(), 3);
    assert!("volume".parse::<KeyBound>().is_err());
}

#[test]
fn test_send_raw_passes_through() {
    let (device, recorder) = recording_device();
    device.send_raw(&[0x90, 60, 1]);
    assert_eq!(*recorder.raw.lock(), vec![vec![0x90, 60, 1]]);
}

fn register_device() -> (Device, FakeDevice) {
    let config = test_config();
    let fake = FakeDevice::new(&config.protocol);
    let transport = RegisterTransport::with_opener(fake.opener(), &config);
    let device = Device::new(Box::new(transport), config.timing.join_timeout());
    device.connect().unwrap();
    assert_eq!(device.connection_state(), ConnectionState::Synced);
    fake.clear_sent();
    (device, fake)
}

#[test]
fn test_end_to_end_clamped_write() {
    let (device, fake) = register_device();

    device.set(GroupAddress::Layer(2), "volume", 150);

    assert!(wait_for(WAIT, || !fake.writes().is_empty()));
    let writes = fake.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!((writes[0].group, writes[0].offset, writes[0].data.clone()), (2, 8, vec![127]));
    assert!(wait_for(WAIT, || fake.block(2)[8] == 127));
    device.disconnect().unwrap();
}

#[test]
fn test_end_to_end_unsolicited_update() {
    let (device, fake) = register_device();
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    device.subscribe(GroupAddress::Layer(3), move |ev| e.lock().push((ev.name.clone(), ev.value.clone())));

    // rangel unchanged, rangeu and volume changed
    fake.push_update(3, 6, &[21, 100, 80]);

    assert_eq!(
        *events.lock(),
        vec![
            ("rangeu".to_string(), Value::Int(100)),
            ("volume".to_string(), Value::Int(80)),
        ]
    );
    std::thread::sleep(Duration::from_millis(50));
    assert!(fake.writes().is_empty());
    device.disconnect().unwrap();
}

#[test]
fn test_push_inside_bundle_keeps_unsent_local_value() {
    let (device, fake) = register_device();

    {
        let _scope = device.bundle();
        device.set(GroupAddress::Layer(3), "volume", 50);
        // Device moves transposition while the volume change is still queued
        fake.push_update(3, 10, &[70]);

        assert_eq!(device.get(GroupAddress::Layer(3), "transposition"), Some(Value::Int(6)));
        assert_eq!(device.get(GroupAddress::Layer(3), "volume"), Some(Value::Int(50)));
    }

    assert!(wait_for(WAIT, || fake.block(3)[8] == 50));
    assert_eq!(device.get(GroupAddress::Layer(3), "volume"), Some(Value::Int(50)));
    assert_eq!(fake.block(3)[10], 70);
    device.disconnect().unwrap();
}

#[test]
fn test_end_to_end_initialize_full_push() {
    let (device, fake) = register_device();

    device.initialize();
    device.set(GroupAddress::Layer(4), "volume", 50);

    assert!(wait_for(WAIT, || !fake.writes().is_empty()));
    let writes = fake.writes();
    assert_eq!(writes[0].command, Command::WriteRequest);
    assert_eq!((writes[0].group, writes[0].offset), (4, 0));
    let pushed: Vec<u8> = writes.iter().flat_map(|w| w.data.clone()).collect();
    assert_eq!(pushed.len(), 44);
    assert_eq!(pushed[2], 1);
    assert_eq!(pushed[8], 50);

    // Flag consumed: the next write is a diff again
    fake.clear_sent();
    device.set(GroupAddress::Layer(4), "volume", 51);
    assert!(wait_for(WAIT, || !fake.writes().is_empty()));
    assert_eq!(fake.writes()[0].data, vec![51]);
    device.disconnect().unwrap();
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use puente_modbus::cache::{CacheBuffer, CacheSettings, CacheStats, IngestOutcome};
use puente_modbus::reading::Reading;
use puente_modbus::sink::{SinkError, StorageSink};

/// Destino simulado: se puede tumbar y levantar, y cuenta lotes y escrituras.
#[derive(Clone, Default)]
struct MockSink {
    down: Arc<AtomicBool>,
    batch: bool,
    fail_batches: Arc<AtomicBool>,
    saved: Arc<Mutex<Vec<Reading>>>,
    batch_calls: Arc<AtomicUsize>,
    save_calls: Arc<AtomicUsize>,
    /// Latencia de cada llamada, como un servidor que no contesta.
    delay_ms: Arc<AtomicU64>,
}

impl MockSink {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn stall(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
    }

    fn saved_names(&self) -> Vec<String> {
        self.saved.lock().iter().map(|r| r.sensor_name.clone()).collect()
    }
}

impl StorageSink for MockSink {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn save(&mut self, reading: &Reading) -> Result<(), SinkError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.stall();
        if self.down.load(Ordering::SeqCst) {
            return Err(SinkError::Closed("mock"));
        }
        self.saved.lock().push(reading.clone());
        Ok(())
    }

    fn save_batch(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.stall();
        if self.down.load(Ordering::SeqCst) || self.fail_batches.load(Ordering::SeqCst) {
            return Err(SinkError::Closed("mock"));
        }
        self.saved.lock().extend_from_slice(readings);
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }
}

fn open(dir: &TempDir, sink: &MockSink, settings: CacheSettings) -> CacheBuffer {
    CacheBuffer::open(&dir.path().join("cache.db"), Box::new(sink.clone()), settings).unwrap()
}

fn reading(i: usize) -> Reading {
    Reading::new(&format!("sensor{}", i), 1, 20.0 + i as f64, 50.0)
}

#[test]
fn failing_sink_keeps_every_reading_until_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    sink.set_down(true);
    let cache = open(&dir, &sink, CacheSettings::default());

    for i in 0..5 {
        assert_eq!(cache.ingest(&reading(i)).unwrap(), IngestOutcome::Queued);
    }
    let entries = cache.pending_entries(100).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.retry_count == 0));

    let report = cache.flush_tick().unwrap();
    assert_eq!((report.attempted, report.delivered, report.failed), (5, 0, 5));
    assert!(cache.pending_entries(100).unwrap().iter().all(|e| e.retry_count == 1));

    sink.set_down(false);
    let report = cache.flush_tick().unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(report.stats, CacheStats::default());
    assert_eq!(
        sink.saved_names(),
        ["sensor0", "sensor1", "sensor2", "sensor3", "sensor4"]
    );
}

#[test]
fn healthy_sink_delivers_on_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    let cache = open(&dir, &sink, CacheSettings::default());

    assert_eq!(cache.ingest(&reading(0)).unwrap(), IngestOutcome::Delivered);
    assert_eq!(cache.stats().unwrap().total, 0);
    assert_eq!(sink.saved.lock().len(), 1);
}

#[test]
fn retry_cap_excludes_entries_without_deleting_them() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    sink.set_down(true);
    let settings = CacheSettings {
        batch_size: 100,
        max_retry: 3,
    };
    let cache = open(&dir, &sink, settings);
    cache.ingest(&reading(0)).unwrap();

    for _ in 0..3 {
        assert_eq!(cache.flush_tick().unwrap().attempted, 1);
    }
    assert_eq!(cache.flush_tick().unwrap().attempted, 0);

    sink.set_down(false);
    assert_eq!(cache.flush_tick().unwrap().attempted, 0);
    assert_eq!(
        cache.stats().unwrap(),
        CacheStats {
            total: 1,
            pending: 0,
            exhausted: 1
        }
    );
    assert_eq!(cache.dead_letters().unwrap()[0].retry_count, 3);
    assert!(sink.saved.lock().is_empty());
}

#[test]
fn flush_respects_batch_size_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    sink.set_down(true);
    let settings = CacheSettings {
        batch_size: 2,
        max_retry: 10,
    };
    let cache = open(&dir, &sink, settings);
    for i in 0..5 {
        cache.ingest(&reading(i)).unwrap();
    }

    sink.set_down(false);
    assert_eq!(cache.flush_tick().unwrap().delivered, 2);
    assert_eq!(sink.saved_names(), ["sensor0", "sensor1"]);
    assert_eq!(cache.stats().unwrap().pending, 3);
}

#[test]
fn batch_failure_degrades_to_single_rows() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink {
        batch: true,
        ..MockSink::default()
    };
    sink.set_down(true);
    let cache = open(&dir, &sink, CacheSettings::default());
    for i in 0..3 {
        cache.ingest(&reading(i)).unwrap();
    }

    sink.set_down(false);
    sink.fail_batches.store(true, Ordering::SeqCst);
    let report = cache.flush_tick().unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(sink.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.saved.lock().len(), 3);
}

#[test]
fn batch_ingest_uses_one_batch_call() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink {
        batch: true,
        ..MockSink::default()
    };
    let cache = open(&dir, &sink, CacheSettings::default());

    let readings: Vec<_> = (0..4).map(reading).collect();
    assert_eq!(cache.ingest_batch(&readings).unwrap(), 4);
    assert_eq!(sink.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().unwrap().total, 0);
}

#[test]
fn concurrent_ingest_and_flush_deliver_each_reading_once() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    let cache = open(&dir, &sink, CacheSettings::default());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    cache.ingest(&reading(w * 100 + i)).unwrap();
                }
            })
        })
        .collect();
    for _ in 0..20 {
        cache.flush_tick().unwrap();
    }
    for writer in writers {
        writer.join().unwrap();
    }
    cache.flush_tick().unwrap();

    let names = sink.saved_names();
    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(names.len(), 100);
    assert_eq!(unique.len(), 100);
    assert_eq!(cache.stats().unwrap().total, 0);
}

#[test]
fn ingest_does_not_wait_for_a_slow_flush() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MockSink::default();
    sink.set_down(true);
    let cache = open(&dir, &sink, CacheSettings::default());
    for i in 0..40 {
        cache.ingest(&reading(i)).unwrap();
    }
    let before = sink.save_calls.load(Ordering::SeqCst);

    // Cada envío tarda 50 ms y falla: el flush ocupa el destino unos 2 s
    sink.delay_ms.store(50, Ordering::SeqCst);
    let flusher = {
        let cache = cache.clone();
        thread::spawn(move || cache.flush_tick().unwrap())
    };
    while sink.save_calls.load(Ordering::SeqCst) == before {
        thread::sleep(Duration::from_millis(1));
    }

    let started = Instant::now();
    assert_eq!(cache.ingest(&reading(100)).unwrap(), IngestOutcome::Queued);
    assert!(started.elapsed() < Duration::from_millis(500));

    let report = flusher.join().unwrap();
    assert_eq!(report.failed, 40);
    let stats = cache.stats().unwrap();
    assert_eq!(stats.total, 41);

    // La lectura que no se envió sigue a 0 reintentos y entra en el próximo flush
    let nueva = cache
        .pending_entries(100)
        .unwrap()
        .into_iter()
        .find(|e| e.reading.sensor_name == "sensor100")
        .unwrap();
    assert_eq!(nueva.retry_count, 0);
}

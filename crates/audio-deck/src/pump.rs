//! Read-ahead buffer pump for pull-model output.
//!
//! Exclusive and multichannel devices pull from a decode mixer inside a real-time
//! callback, so file decoding must never happen there. Each opened file therefore
//! gets a push-style buffer stream, and a dedicated worker keeps that buffer topped up
//! from the decode source:
//! - one [`PumpEntry`] per buffer stream still being fed
//! - an auto-reset "data needed" [`Signal`] wakes the worker early
//! - a manual-reset pause gate parks the worker while output is paused
//!
//! When a source runs dry the pump ends the buffer stream and runs the player's
//! preload hook, which is how pull-model output stages the next track a full
//! read-ahead before the current one is heard to end.
//!
//! Lock order: the entry queue is never held while the engine or the hook is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine::{AudioEngine, Read, StreamHandle};
use crate::lock;

/// Worker poll interval while buffers are still draining.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Event flag with optional auto-reset.
pub struct Signal {
    raised: Mutex<bool>,
    cv: Condvar,
    auto_reset: bool,
}

impl Signal {
    pub fn new(auto_reset: bool, raised: bool) -> Self {
        Self {
            raised: Mutex::new(raised),
            cv: Condvar::new(),
            auto_reset,
        }
    }

    pub fn set(&self) {
        *lock(&self.raised) = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.raised) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.raised)
    }

    /// Block until raised.
    pub fn wait(&self) {
        let mut raised = lock(&self.raised);
        while !*raised {
            raised = self.cv.wait(raised).unwrap_or_else(|e| e.into_inner());
        }
        if self.auto_reset {
            *raised = false;
        }
    }

    /// Block until raised or `timeout` elapses. Returns whether the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let raised = lock(&self.raised);
        let (mut raised, _) = self
            .cv
            .wait_timeout_while(raised, timeout, |r| !*r)
            .unwrap_or_else(|e| e.into_inner());
        let was = *raised;
        if was && self.auto_reset {
            *raised = false;
        }
        was
    }
}

/// One buffer stream being fed from its decode source.
pub struct PumpEntry {
    pub source: StreamHandle,
    pub buffer: StreamHandle,
    /// Bytes kept queued in `buffer`.
    pub quota: usize,
    scratch: Vec<u8>,
}

enum Feed {
    Keep,
    Done,
}

struct PumpShared {
    engine: Arc<dyn AudioEngine>,
    entries: Mutex<Vec<PumpEntry>>,
    /// Serializes service passes between the worker and explicit callers.
    pass: Mutex<()>,
    data_needed: Signal,
    pause_gate: Signal,
    stop: AtomicBool,
    next_cue: AtomicBool,
    hook: Box<dyn Fn() + Send + Sync>,
}

/// Buffer pump with its worker thread.
pub struct BufferPump {
    shared: Arc<PumpShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferPump {
    /// Create a pump. `hook` stages the next preload; it may call back into the pump.
    pub fn new(engine: Arc<dyn AudioEngine>, hook: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            shared: Arc::new(PumpShared {
                engine,
                entries: Mutex::new(Vec::new()),
                pass: Mutex::new(()),
                data_needed: Signal::new(true, false),
                pause_gate: Signal::new(false, false),
                stop: AtomicBool::new(false),
                next_cue: AtomicBool::new(false),
                hook,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("deck-pump".into())
            .spawn(move || shared.run())?;
        *worker = Some(handle);
        tracing::debug!("buffer pump started");
        Ok(())
    }

    /// Queue `buffer` for feeding from `source`, prefilling it immediately.
    pub fn enqueue(&self, source: StreamHandle, buffer: StreamHandle, quota: usize) {
        let mut entry = PumpEntry {
            source,
            buffer,
            quota,
            scratch: vec![0; quota],
        };
        let engine = &self.shared.engine;
        match engine.read(source, &mut entry.scratch) {
            Ok(Read::Data(n)) => {
                if let Err(e) = engine.push_data(buffer, &entry.scratch[..n]) {
                    tracing::warn!(buffer = %buffer, "prefill push failed: {e}");
                }
            }
            Ok(Read::Ended) => {}
            Err(e) => tracing::warn!(source = %source, "prefill read failed: {e}"),
        }
        lock(&self.shared.entries).push(entry);
        tracing::debug!(source = %source, buffer = %buffer, quota, "pump entry queued");
        self.shared.data_needed.set();
    }

    /// Run one service pass on the calling thread, then any pending cue staging.
    pub fn run_once(&self) {
        self.shared.service();
        if self.shared.next_cue.swap(false, Ordering::SeqCst) {
            (self.shared.hook)();
        }
    }

    /// Wake the worker and open the pause gate.
    pub fn signal_all(&self) {
        self.shared.data_needed.set();
        self.shared.pause_gate.set();
    }

    /// Park the worker at the pause gate.
    pub fn close_gate(&self) {
        self.shared.pause_gate.reset();
    }

    pub fn is_gate_open(&self) -> bool {
        self.shared.pause_gate.is_set()
    }

    /// Ask the worker to stage the next cue track.
    pub fn request_next_cue(&self) {
        self.shared.next_cue.store(true, Ordering::SeqCst);
        self.shared.data_needed.set();
    }

    /// Entries still being fed.
    pub fn pending(&self) -> usize {
        lock(&self.shared.entries).len()
    }

    /// Stop and join the worker, then free every decode source still queued.
    ///
    /// Must not be called while holding a lock the preload hook takes.
    pub fn shutdown(&self) -> usize {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.signal_all();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("buffer pump worker panicked");
            }
        }
        let _pass = lock(&self.shared.pass);
        let entries = std::mem::take(&mut *lock(&self.shared.entries));
        for entry in &entries {
            if let Err(e) = self.shared.engine.free_stream(entry.source) {
                tracing::warn!(source = %entry.source, "free pump source: {e}");
            }
        }
        entries.len()
    }
}

impl PumpShared {
    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let remaining = self.service();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if remaining == 0 {
                self.data_needed.wait();
            } else {
                self.data_needed.wait_timeout(POLL_INTERVAL);
            }
            self.pause_gate.wait();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if self.next_cue.swap(false, Ordering::SeqCst) {
                (self.hook)();
            }
        }
        tracing::debug!("buffer pump stopped");
    }

    /// Top up every queued buffer once. Returns the number of entries left.
    fn service(&self) -> usize {
        let _pass = lock(&self.pass);
        let work = std::mem::take(&mut *lock(&self.entries));
        let mut kept = Vec::with_capacity(work.len());
        for mut entry in work {
            match self.feed(&mut entry) {
                Feed::Keep => kept.push(entry),
                Feed::Done => {}
            }
        }
        let mut entries = lock(&self.entries);
        kept.append(&mut entries);
        *entries = kept;
        entries.len()
    }

    fn feed(&self, entry: &mut PumpEntry) -> Feed {
        let Some(queued) = self.engine.push_queued(entry.buffer) else {
            // Buffer stream was freed by the player; the source is ours to release.
            if let Err(e) = self.engine.free_stream(entry.source) {
                tracing::warn!(source = %entry.source, "free orphaned pump source: {e}");
            }
            tracing::debug!(buffer = %entry.buffer, "pump entry dropped");
            return Feed::Done;
        };
        if queued >= entry.quota {
            return Feed::Keep;
        }
        let want = entry.quota - queued;
        match self.engine.read(entry.source, &mut entry.scratch[..want]) {
            Ok(Read::Data(n)) => {
                if let Err(e) = self.engine.push_data(entry.buffer, &entry.scratch[..n]) {
                    tracing::debug!(buffer = %entry.buffer, "push failed: {e}");
                }
                Feed::Keep
            }
            Ok(Read::Ended) | Err(_) => {
                if let Err(e) = self.engine.free_stream(entry.source) {
                    tracing::warn!(source = %entry.source, "free drained pump source: {e}");
                }
                (self.hook)();
                if let Err(e) = self.engine.push_end(entry.buffer) {
                    tracing::debug!(buffer = %entry.buffer, "end of buffer not signalled: {e}");
                }
                tracing::debug!(buffer = %entry.buffer, "pump source drained");
                Feed::Done
            }
        }
    }
}

impl Drop for BufferPump {
    fn drop(&mut self) {
        if lock(&self.worker).is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpenFlags;
    use crate::engine::memory::{MediaSpec, MemoryEngine};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn setup(seconds: f64) -> (Arc<MemoryEngine>, StreamHandle, StreamHandle) {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_media("a.flac", MediaSpec::new(1000, 1, seconds));
        let source = engine
            .open_file(
                Path::new("a.flac"),
                OpenFlags {
                    decode: true,
                    float: true,
                    software: false,
                },
            )
            .unwrap();
        let buffer = engine.create_push_stream(1000, 1).unwrap();
        (engine, source, buffer)
    }

    fn counting_hook() -> (Arc<AtomicUsize>, Box<dyn Fn() + Send + Sync>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn enqueue_prefills_up_to_quota() {
        let (engine, source, buffer) = setup(10.0);
        let pump = BufferPump::new(engine.clone(), Box::new(|| {}));

        pump.enqueue(source, buffer, 4000);

        assert_eq!(engine.push_queued(buffer), Some(4000));
        assert_eq!(pump.pending(), 1);
    }

    #[test]
    fn full_buffer_is_skipped_and_freed_buffer_releases_source() {
        let (engine, source, buffer) = setup(1.5);
        let (hits, hook) = counting_hook();
        let pump = BufferPump::new(engine.clone(), hook);

        // 1.5s of mono float at 1kHz is 6000 bytes; the prefill takes 4000.
        pump.enqueue(source, buffer, 4000);
        pump.run_once();
        assert_eq!(engine.push_queued(buffer), Some(4000));
        assert_eq!(pump.pending(), 1);

        engine.free_stream(buffer).unwrap();
        pump.run_once();

        assert_eq!(pump.pending(), 0);
        assert_eq!(engine.free_count(source), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn end_of_data_frees_source_then_signals_end() {
        let (engine, source, buffer) = setup(0.5);
        let (hits, hook) = counting_hook();
        let pump = BufferPump::new(engine.clone(), hook);

        pump.enqueue(source, buffer, 4000);
        assert_eq!(engine.push_queued(buffer), Some(2000));
        pump.run_once();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.free_count(source), 1);
        assert_eq!(pump.pending(), 0);
        assert!(engine.push_data(buffer, &[0; 4]).is_err());
    }

    #[test]
    fn next_cue_request_runs_hook_on_next_pass() {
        let (engine, _, _) = setup(1.0);
        let (hits, hook) = counting_hook();
        let pump = BufferPump::new(engine, hook);

        pump.request_next_cue();
        pump.run_once();
        pump.run_once();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_joins_worker_and_frees_sources() {
        let (engine, source, buffer) = setup(10.0);
        let pump = BufferPump::new(engine.clone(), Box::new(|| {}));
        pump.start().unwrap();
        pump.signal_all();
        pump.enqueue(source, buffer, 4000);

        assert_eq!(pump.shutdown(), 1);
        assert_eq!(engine.free_count(source), 1);
        assert_eq!(engine.invalid_frees(), 0);
    }

    #[test]
    fn auto_reset_signal_clears_after_wait() {
        let signal = Signal::new(true, true);
        signal.wait();
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));

        let gate = Signal::new(false, true);
        gate.wait();
        assert!(gate.is_set());
    }
}

//! Network stream opener and radio metadata helpers.
//!
//! Opening a network stream blocks for as long as the server takes to answer, so it
//! runs on a transient worker. The worker never gets interrupted; the player just
//! changes the wanted url and the worker checks it once the open returns:
//! - empty url: stop was pressed, the result is freed and the worker exits
//! - different url: the result is freed and the new url is opened
//! - same url: the result is handed to the player

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::engine::{AudioEngine, CodecTag, EngineError, FileCounter, OpenFlags, StreamHandle};
use crate::lock;
use crate::types::{PlayError, RadioFormat, RadioTags};

/// Poll step while waiting for the worker to finish.
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Outcome of one network open.
#[derive(Debug)]
pub struct RadioOpen {
    pub url: String,
    pub result: Result<StreamHandle, EngineError>,
}

/// Transient worker opening network streams off the caller's thread.
#[derive(Default)]
pub struct RadioOpener {
    wanted: Arc<Mutex<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RadioOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Url the worker should deliver. Empty when nothing is wanted.
    pub fn wanted(&self) -> String {
        lock(&self.wanted).clone()
    }

    pub fn set_wanted(&self, url: &str) {
        *lock(&self.wanted) = url.to_string();
    }

    /// Abandon any open in flight.
    pub fn clear(&self) {
        lock(&self.wanted).clear();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start a worker for the wanted url, reaping the previous finished one.
    ///
    /// `deliver` runs on the worker thread with the open that matched the wanted url.
    pub fn spawn(
        &self,
        engine: Arc<dyn AudioEngine>,
        flags: OpenFlags,
        deliver: impl FnOnce(RadioOpen) + Send + 'static,
    ) -> std::io::Result<()> {
        let mut worker = lock(&self.worker);
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                tracing::warn!("radio worker panicked");
            }
        }
        let wanted = self.wanted.clone();
        let handle = std::thread::Builder::new()
            .name("deck-radio".into())
            .spawn(move || {
                if let Some(open) = open_wanted(engine.as_ref(), &wanted, flags) {
                    deliver(open);
                }
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Wait up to `timeout` for the worker. Returns `false` if it is still running.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut worker = lock(&self.worker);
            match worker.as_ref() {
                None => return true,
                Some(h) if h.is_finished() => {
                    if let Some(h) = worker.take() {
                        if h.join().is_err() {
                            tracing::warn!("radio worker panicked");
                        }
                    }
                    return true;
                }
                Some(_) if Instant::now() >= deadline => return false,
                Some(_) => {}
            }
            drop(worker);
            std::thread::sleep(JOIN_POLL);
        }
    }
}

fn open_wanted(engine: &dyn AudioEngine, wanted: &Mutex<String>, flags: OpenFlags) -> Option<RadioOpen> {
    loop {
        let url = lock(wanted).clone();
        if url.is_empty() {
            return None;
        }
        tracing::debug!(%url, "opening network stream");
        let result = engine.open_url(&url, flags);

        let current = lock(wanted).clone();
        if current == url {
            return Some(RadioOpen { url, result });
        }
        if let Ok(stream) = result {
            if let Err(e) = engine.free_stream(stream) {
                tracing::warn!(stream = %stream, "free stale radio stream: {e}");
            }
        }
        if current.is_empty() {
            tracing::debug!(%url, "radio open abandoned");
            return None;
        }
        tracing::debug!(stale = %url, wanted = %current, "radio url changed while opening");
    }
}

/// Map a network open failure onto the public taxonomy.
pub fn classify(error: EngineError) -> PlayError {
    match error {
        EngineError::Init => PlayError::Device,
        EngineError::NoNetwork | EngineError::Timeout | EngineError::IllegalParam | EngineError::Unknown => {
            PlayError::Network
        }
        _ => PlayError::File,
    }
}

/// Text between `='` and `';` of a `StreamTitle='...';` meta string.
pub fn stream_title(meta: &str) -> Option<&str> {
    let start = meta.find("='")? + 2;
    let end = meta.find("';")?;
    meta.get(start..end).filter(|t| !t.is_empty())
}

/// Split stream meta into artist and title on the last `-`.
///
/// `None` for empty meta. Meta without a `StreamTitle` yields empty tags.
pub fn parse_radio_tags(meta: &str) -> Option<RadioTags> {
    if meta.is_empty() {
        return None;
    }
    let mut tags = RadioTags::default();
    if let Some(text) = stream_title(meta) {
        match text.rfind('-') {
            Some(split) => {
                tags.artist = text[..split].trim().to_string();
                tags.title = text[split + 1..].trim().to_string();
            }
            None => tags.title = text.trim().to_string(),
        }
    }
    Some(tags)
}

pub fn radio_format(codec: CodecTag) -> RadioFormat {
    match codec {
        CodecTag::Mp3 | CodecTag::WmaMp3 => RadioFormat::Mp3,
        CodecTag::Ogg => RadioFormat::Ogg,
        CodecTag::Wma => RadioFormat::Wma,
        CodecTag::Aac => RadioFormat::Aac,
        CodecTag::Mp4 => RadioFormat::Mp4,
        CodecTag::Pcm | CodecTag::Other => RadioFormat::Unknown,
    }
}

/// Bitrate in kbps: the `Bitrate=` header tag, else the network buffer fill rate, else 0.
pub fn estimate_bitrate(engine: &dyn AudioEngine, stream: StreamHandle) -> u32 {
    let from_header = engine.header_tags(stream).iter().find_map(|tag| {
        tag.strip_prefix("Bitrate=")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|bps| (bps / 1000) as u32)
    });
    if let Some(kbps) = from_header {
        return kbps;
    }
    let window_ms = u64::from(engine.net_buffer_ms());
    match engine.file_counter(stream, FileCounter::Buffered) {
        Some(buffered) if window_ms > 0 => (buffered * 8 / window_ms) as u32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryEngine, UrlSpec};
    use crossbeam_channel::unbounded;

    #[test]
    fn tags_split_on_last_dash() {
        let tags = parse_radio_tags("StreamTitle='Morning Show: BEFORE - Quixote (Album)';StreamUrl='';").unwrap();
        assert_eq!(tags.artist, "Morning Show: BEFORE");
        assert_eq!(tags.title, "Quixote (Album)");

        let tags = parse_radio_tags("StreamTitle='Jingle';").unwrap();
        assert_eq!(tags.artist, "");
        assert_eq!(tags.title, "Jingle");

        assert_eq!(parse_radio_tags(""), None);
        assert_eq!(parse_radio_tags("garbage"), Some(RadioTags::default()));
    }

    #[test]
    fn network_errors_collapse_to_network() {
        assert_eq!(classify(EngineError::Init), PlayError::Device);
        for e in [EngineError::NoNetwork, EngineError::Timeout, EngineError::IllegalParam, EngineError::Unknown] {
            assert_eq!(classify(e), PlayError::Network);
        }
        assert_eq!(classify(EngineError::Format), PlayError::File);
    }

    #[test]
    fn bitrate_prefers_header_then_buffer_fill() {
        let engine = MemoryEngine::new();
        engine.add_url(
            "http://wma",
            UrlSpec {
                header_tags: vec!["Bitrate=192000".into()],
                buffered_bytes: Some(10),
                ..UrlSpec::live(44_100, 2)
            },
        );
        engine.add_url(
            "http://mp3",
            UrlSpec {
                buffered_bytes: Some(80_000),
                ..UrlSpec::live(44_100, 2)
            },
        );
        engine.add_url("http://bare", UrlSpec::live(44_100, 2));

        let open = |url| engine.open_url(url, OpenFlags::default()).unwrap();
        assert_eq!(estimate_bitrate(&engine, open("http://wma")), 192);
        assert_eq!(estimate_bitrate(&engine, open("http://mp3")), 128);
        assert_eq!(estimate_bitrate(&engine, open("http://bare")), 0);
    }

    #[test]
    fn worker_discards_stale_url_and_delivers_latest() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_url(
            "http://slow",
            UrlSpec {
                connect_delay: Duration::from_millis(100),
                ..UrlSpec::live(44_100, 2)
            },
        );
        engine.add_url("http://fast", UrlSpec::live(48_000, 2));

        let opener = RadioOpener::new();
        opener.set_wanted("http://slow");
        let (tx, rx) = unbounded();
        opener
            .spawn(engine.clone(), OpenFlags::default(), move |open| {
                let _ = tx.send(open);
            })
            .unwrap();
        opener.set_wanted("http://fast");

        let open = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(open.url, "http://fast");
        let stream = open.result.unwrap();
        assert_eq!(engine.channel_info(stream).unwrap().rate, 48_000);
        assert!(opener.join_timeout(Duration::from_secs(5)));
        assert_eq!(engine.live_streams(), 1);
        assert_eq!(engine.invalid_frees(), 0);
    }

    #[test]
    fn cleared_url_abandons_open() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_url(
            "http://slow",
            UrlSpec {
                connect_delay: Duration::from_millis(50),
                ..UrlSpec::live(44_100, 2)
            },
        );
        let opener = RadioOpener::new();
        opener.set_wanted("http://slow");
        let (tx, rx) = unbounded();
        opener
            .spawn(engine.clone(), OpenFlags::default(), move |open| {
                let _ = tx.send(open);
            })
            .unwrap();
        opener.clear();

        assert!(opener.join_timeout(Duration::from_secs(5)));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.live_streams(), 0);
    }
}

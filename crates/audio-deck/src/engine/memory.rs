//! Deterministic in-process engine driven by a virtual clock.
//!
//! [`MemoryEngine`] keeps byte counters instead of samples, which is enough to
//! exercise every transition of the playback core:
//! - [`MemoryEngine::advance`] renders the active outputs, progresses volume slides
//!   and fires syncs in mixing order
//! - media is registered up front ([`MemoryEngine::add_media`]) or probed from real
//!   files through Symphonia
//! - every free is counted so tests can assert a handle was released exactly once

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use audio_deck_types::OutputDriver;
use symphonia::core::codecs::{CODEC_TYPE_AAC, CODEC_TYPE_MP3, CODEC_TYPE_VORBIS, CodecType};
use symphonia::core::{
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};

use super::{
    AttachFlags, AudioEngine, BufferedDevice, ChannelInfo, CodecTag, DeviceInfo, EffectKind,
    EffectParams, EngineError, EngineEvent, ExclusiveDevice, FadeEnd, FileCounter, FxHandle,
    MixerFlags, MultichannelDevice, OpenFlags, Read, StreamHandle, SyncCallback, SyncHandle,
    SyncKind, SyncSpec,
};

/// Rendering granularity of [`MemoryEngine::advance`].
const STEP_MS: u64 = 10;

/// Format and duration of a virtual media file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaSpec {
    pub rate: u32,
    pub channels: u16,
    pub seconds: f64,
    pub codec: CodecTag,
}

impl MediaSpec {
    pub fn new(rate: u32, channels: u16, seconds: f64) -> Self {
        Self {
            rate,
            channels,
            seconds,
            codec: CodecTag::Pcm,
        }
    }
}

/// Behaviour of a virtual network stream.
#[derive(Clone, Debug, PartialEq)]
pub struct UrlSpec {
    pub rate: u32,
    pub channels: u16,
    pub codec: CodecTag,
    /// Time the blocking open takes.
    pub connect_delay: Duration,
    /// Open fails with this code.
    pub error: Option<EngineError>,
    /// Bytes already downloaded when the open returns.
    pub buffered_bytes: Option<u64>,
    /// Total size; `None` for an endless stream.
    pub size: Option<u64>,
    pub meta: Option<String>,
    pub header_tags: Vec<String>,
}

impl UrlSpec {
    pub fn live(rate: u32, channels: u16) -> Self {
        Self {
            rate,
            channels,
            codec: CodecTag::Mp3,
            connect_delay: Duration::ZERO,
            error: None,
            buffered_bytes: None,
            size: None,
            meta: None,
            header_tags: Vec::new(),
        }
    }

    pub fn failing(error: EngineError) -> Self {
        Self {
            error: Some(error),
            ..Self::live(44_100, 2)
        }
    }
}

enum Body {
    File { len: u64, pos: u64 },
    Url { pos: u64, size: Option<u64>, buffered: Option<u64> },
    Push { queued: u64, consumed: u64, ended: bool },
    Mixer { sources: Vec<u32>, pos: u64, end_when_drained: bool, ended: bool },
}

struct Slide {
    from: f32,
    to: f32,
    total_ms: u64,
    elapsed_ms: u64,
    end: Option<FadeEnd>,
}

struct RegisteredSync {
    handle: u32,
    spec: SyncSpec,
    callback: SyncCallback,
}

struct Stream {
    info: ChannelInfo,
    sample_bytes: u32,
    decode: bool,
    body: Body,
    volume: f32,
    slide: Option<Slide>,
    syncs: Vec<RegisteredSync>,
    mixer: Option<u32>,
    playing: bool,
    meta: Option<String>,
    header_tags: Vec<String>,
}

impl Stream {
    fn new(info: ChannelInfo, sample_bytes: u32, decode: bool, body: Body) -> Self {
        Self {
            info,
            sample_bytes,
            decode,
            body,
            volume: 1.0,
            slide: None,
            syncs: Vec::new(),
            mixer: None,
            playing: false,
            meta: None,
            header_tags: Vec::new(),
        }
    }

    fn frame_bytes(&self) -> u64 {
        u64::from(self.info.channels.max(1)) * u64::from(self.sample_bytes)
    }

    fn bytes_per_second(&self) -> u64 {
        u64::from(self.info.rate) * self.frame_bytes()
    }

    fn bytes_for_ms(&self, ms: u64) -> u64 {
        u64::from(self.info.rate) * ms / 1000 * self.frame_bytes()
    }

    fn is_exhausted(&self) -> bool {
        match self.body {
            Body::File { len, pos } => pos >= len,
            Body::Url { pos, size, .. } => size.is_some_and(|s| pos >= s),
            Body::Push { queued, ended, .. } => ended && queued == 0,
            Body::Mixer { ended, .. } => ended,
        }
    }

    /// Consume up to `want` bytes as a mixer source.
    fn consume(&mut self, want: u64) {
        match &mut self.body {
            Body::File { len, pos } => *pos = (*pos + want).min(*len),
            Body::Url { pos, size, .. } => {
                *pos += want;
                if let Some(s) = size {
                    *pos = (*pos).min(*s);
                }
            }
            Body::Push {
                queued, consumed, ..
            } => {
                let take = want.min(*queued);
                *queued -= take;
                *consumed += take;
            }
            Body::Mixer { .. } => {}
        }
    }
}

struct Effect {
    stream: u32,
    params: Option<EffectParams>,
}

#[derive(Default)]
struct ExclusiveState {
    format: Option<ChannelInfo>,
    feed: Option<u32>,
    started: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultichannelLayout {
    pub enabled: Option<(u32, StreamHandle)>,
    pub mirrored: Vec<(u32, u32)>,
    pub joined: Vec<(u32, u32)>,
    pub float_channels: Vec<u32>,
    pub channel_rate: Option<u32>,
    pub device_rate: Option<u32>,
}

#[derive(Default)]
struct MultichannelState {
    device: Option<u32>,
    started: bool,
    layout: MultichannelLayout,
}

#[derive(Default)]
struct State {
    next_stream: u32,
    next_sync: u32,
    next_fx: u32,
    streams: HashMap<u32, Stream>,
    effects: HashMap<u32, Effect>,
    media: HashMap<PathBuf, MediaSpec>,
    urls: HashMap<String, UrlSpec>,
    devices: HashMap<&'static str, Vec<DeviceInfo>>,
    channel_names: Vec<String>,
    free_counts: BTreeMap<u32, u32>,
    invalid_frees: u32,
    buffered_device: Option<Option<u32>>,
    buffered_float: bool,
    exclusive: ExclusiveState,
    exclusive_rates: Vec<u32>,
    multichannel: MultichannelState,
    multichannel_rates: Vec<u32>,
    failing_inits: Vec<OutputDriver>,
    effect_calls: u32,
    failing_effects: Vec<u32>,
    proxy: Option<String>,
    user_agent: Option<String>,
    net_buffer_ms: u32,
    clock_ms: u64,
}

impl State {
    fn stream(&self, h: StreamHandle) -> Result<&Stream, EngineError> {
        self.streams.get(&h.0).ok_or(EngineError::Handle)
    }

    fn stream_mut(&mut self, h: StreamHandle) -> Result<&mut Stream, EngineError> {
        self.streams.get_mut(&h.0).ok_or(EngineError::Handle)
    }

    fn insert(&mut self, stream: Stream) -> StreamHandle {
        self.next_stream += 1;
        self.streams.insert(self.next_stream, stream);
        StreamHandle(self.next_stream)
    }

    fn detach(&mut self, source: u32) {
        let mixer = self.streams.get_mut(&source).and_then(|s| s.mixer.take());
        if let Some(m) = mixer {
            if let Some(Stream {
                body: Body::Mixer { sources, .. },
                ..
            }) = self.streams.get_mut(&m)
            {
                sources.retain(|s| *s != source);
            }
        }
    }

    fn free(&mut self, h: u32) -> Result<(), EngineError> {
        if !self.streams.contains_key(&h) {
            self.invalid_frees += 1;
            return Err(EngineError::Handle);
        }
        self.detach(h);
        if let Some(stream) = self.streams.remove(&h) {
            if let Body::Mixer { sources, .. } = stream.body {
                for s in sources {
                    if let Some(src) = self.streams.get_mut(&s) {
                        src.mixer = None;
                    }
                }
            }
        }
        self.effects.retain(|_, fx| fx.stream != h);
        if self.exclusive.feed == Some(h) {
            self.exclusive.feed = None;
        }
        *self.free_counts.entry(h).or_default() += 1;
        Ok(())
    }

    /// Free a stream together with every source attached to it.
    fn free_tree(&mut self, h: u32) {
        let sources = match self.streams.get(&h) {
            Some(Stream {
                body: Body::Mixer { sources, .. },
                ..
            }) => sources.clone(),
            _ => Vec::new(),
        };
        for s in sources {
            let _ = self.free(s);
        }
        let _ = self.free(h);
    }

    fn device_list(&self, driver: OutputDriver) -> &[DeviceInfo] {
        self.devices
            .get(driver.label())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn output_mixers(&self) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::new();
        if self.buffered_device.is_some() {
            out.extend(self.streams.iter().filter_map(|(h, s)| {
                (!s.decode && s.playing && matches!(s.body, Body::Mixer { .. })).then_some(*h)
            }));
        }
        if self.exclusive.started {
            out.extend(self.exclusive.feed);
        }
        if self.multichannel.started {
            if let Some((_, feed)) = self.multichannel.layout.enabled {
                out.push(feed.0);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

type Fired = (SyncCallback, EngineEvent);

fn take_syncs(stream: &mut Stream, h: u32, wanted: impl Fn(&SyncSpec) -> bool) -> Vec<Fired> {
    let mut fired = Vec::new();
    stream.syncs.retain(|sync| {
        if !wanted(&sync.spec) {
            return true;
        }
        fired.push((
            sync.callback.clone(),
            EngineEvent {
                sync: SyncHandle(sync.handle),
                stream: StreamHandle(h),
                kind: sync.spec.kind,
            },
        ));
        !sync.spec.one_time
    });
    fired
}

fn run(fired: Vec<Fired>) {
    for (callback, event) in fired {
        callback(event);
    }
}

/// Engine double with a virtual clock. See the module docs.
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Engine with a small default device set for every driver.
    pub fn new() -> Self {
        let mut state = State {
            buffered_float: true,
            net_buffer_ms: 5000,
            ..State::default()
        };
        state.devices.insert(
            OutputDriver::Buffered.label(),
            vec![
                DeviceInfo {
                    name: Some("No sound".into()),
                    enabled: true,
                    ..DeviceInfo::default()
                },
                DeviceInfo {
                    name: Some("Default".into()),
                    enabled: true,
                    is_default: true,
                    is_input: false,
                },
                DeviceInfo {
                    name: Some("Speakers".into()),
                    enabled: true,
                    ..DeviceInfo::default()
                },
            ],
        );
        state.devices.insert(
            OutputDriver::ExclusiveEvent.label(),
            vec![
                DeviceInfo {
                    name: Some("Microphone".into()),
                    enabled: true,
                    is_default: false,
                    is_input: true,
                },
                DeviceInfo {
                    name: Some("Speakers".into()),
                    enabled: true,
                    is_default: true,
                    is_input: false,
                },
            ],
        );
        state.devices.insert(
            OutputDriver::Multichannel.label(),
            vec![DeviceInfo {
                name: Some("Multichannel Interface".into()),
                enabled: true,
                ..DeviceInfo::default()
            }],
        );
        state.channel_names = (1..=8).map(|n| format!("Out {n}")).collect();
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a virtual media file.
    pub fn add_media(&self, path: impl Into<PathBuf>, spec: MediaSpec) {
        self.lock().media.insert(path.into(), spec);
    }

    pub fn add_url(&self, url: impl Into<String>, spec: UrlSpec) {
        self.lock().urls.insert(url.into(), spec);
    }

    /// Replace the device list reported for `driver`.
    pub fn set_devices(&self, driver: OutputDriver, devices: Vec<DeviceInfo>) {
        self.lock().devices.insert(driver.label(), devices);
    }

    /// Make the next device init for `driver` fail with [`EngineError::Init`].
    pub fn fail_init(&self, driver: OutputDriver, fail: bool) {
        let mut st = self.lock();
        st.failing_inits.retain(|d| *d != driver);
        if fail {
            st.failing_inits.push(driver);
        }
    }

    /// Make one upcoming effect creation fail with [`EngineError::NotAvailable`]
    /// after `skip` more effects have been created.
    pub fn fail_effect_after(&self, skip: u32) {
        let mut st = self.lock();
        let at = st.effect_calls + skip;
        st.failing_effects.push(at);
    }

    /// Rates the exclusive device grants; other rates fall back to the first entry.
    pub fn set_exclusive_rates(&self, rates: Vec<u32>) {
        self.lock().exclusive_rates = rates;
    }

    /// Rates the multichannel device accepts. Empty accepts everything.
    pub fn set_multichannel_rates(&self, rates: Vec<u32>) {
        self.lock().multichannel_rates = rates;
    }

    pub fn set_buffered_float(&self, supported: bool) {
        self.lock().buffered_float = supported;
    }

    /// Publish new stream metadata and fire meta syncs.
    pub fn set_meta(&self, stream: StreamHandle, meta: &str) {
        let fired = {
            let mut st = self.lock();
            match st.streams.get_mut(&stream.0) {
                Some(s) => {
                    s.meta = Some(meta.to_string());
                    take_syncs(s, stream.0, |spec| spec.kind == SyncKind::MetaChanged)
                }
                None => Vec::new(),
            }
        };
        run(fired);
    }

    /// Advance the virtual clock by `ms`, rendering outputs and firing syncs.
    pub fn advance(&self, ms: u64) {
        let mut left = ms;
        while left > 0 {
            let dt = left.min(STEP_MS);
            self.step(dt);
            left -= dt;
        }
    }

    fn step(&self, dt: u64) {
        let mut mix_fired = Vec::new();
        let mut late_fired = Vec::new();
        let mut drained = Vec::new();
        let mut slide_fired = Vec::new();
        {
            let mut st = self.lock();
            st.clock_ms += dt;

            let mut finished = Vec::new();
            for (h, s) in st.streams.iter_mut() {
                if let Some(slide) = s.slide.as_mut() {
                    slide.elapsed_ms += dt;
                    if slide.elapsed_ms >= slide.total_ms {
                        s.volume = slide.to;
                        let end = slide.end;
                        s.slide = None;
                        finished.push((*h, end));
                    } else {
                        let t = slide.elapsed_ms as f32 / slide.total_ms as f32;
                        s.volume = slide.from + (slide.to - slide.from) * t;
                    }
                }
            }
            for (h, end) in finished {
                if let Some(s) = st.streams.get_mut(&h) {
                    slide_fired.extend(take_syncs(s, h, |spec| spec.kind == SyncKind::SlideDone));
                }
                match end {
                    Some(FadeEnd::Pause) => {
                        if let Some(s) = st.streams.get_mut(&h) {
                            s.playing = false;
                        }
                    }
                    Some(FadeEnd::Free) => st.free_tree(h),
                    None => {}
                }
            }

            for m in st.output_mixers() {
                let (sources, old_pos, mixer_bytes, end_when_drained) = match st.streams.get(&m) {
                    Some(Stream {
                        body:
                            Body::Mixer {
                                sources,
                                pos,
                                ended: false,
                                end_when_drained,
                            },
                        ..
                    }) => {
                        let bytes = st.streams[&m].bytes_for_ms(dt);
                        (sources.clone(), *pos, bytes, *end_when_drained)
                    }
                    _ => continue,
                };
                for s in &sources {
                    if let Some(src) = st.streams.get_mut(s) {
                        let want = src.bytes_for_ms(dt);
                        src.consume(want);
                    }
                }
                let new_pos = old_pos + mixer_bytes;
                let all_done = sources
                    .iter()
                    .all(|s| st.streams.get(s).is_none_or(Stream::is_exhausted));
                if let Some(mixer) = st.streams.get_mut(&m) {
                    if let Body::Mixer { pos, .. } = &mut mixer.body {
                        *pos = new_pos;
                    }
                    let crossed = |spec: &SyncSpec| {
                        matches!(spec.kind, SyncKind::PreRoll(p) if p > old_pos && p <= new_pos)
                    };
                    mix_fired.extend(take_syncs(mixer, m, |spec| spec.mix_time && crossed(spec)));
                    late_fired.extend(take_syncs(mixer, m, |spec| !spec.mix_time && crossed(spec)));
                    if end_when_drained && all_done {
                        mix_fired.extend(take_syncs(mixer, m, |spec| {
                            spec.mix_time && spec.kind == SyncKind::EndOfTrack
                        }));
                        drained.push(m);
                    }
                }
            }
        }

        run(mix_fired);

        {
            let mut st = self.lock();
            for m in drained {
                let live_sources = match st.streams.get(&m) {
                    Some(Stream {
                        body: Body::Mixer { sources, .. },
                        ..
                    }) => sources
                        .iter()
                        .any(|s| st.streams.get(s).is_some_and(|src| !src.is_exhausted())),
                    _ => continue,
                };
                if let Some(mixer) = st.streams.get_mut(&m) {
                    if !live_sources {
                        if let Body::Mixer { ended, .. } = &mut mixer.body {
                            *ended = true;
                        }
                        if !mixer.decode {
                            mixer.playing = false;
                        }
                    }
                    late_fired.extend(take_syncs(mixer, m, |spec| {
                        !spec.mix_time && spec.kind == SyncKind::EndOfTrack
                    }));
                }
            }
        }

        run(late_fired);
        run(slide_fired);
    }

    /// Virtual time elapsed since creation.
    pub fn clock_ms(&self) -> u64 {
        self.lock().clock_ms
    }

    pub fn is_live(&self, stream: StreamHandle) -> bool {
        self.lock().streams.contains_key(&stream.0)
    }

    /// How many times `stream` was successfully freed.
    pub fn free_count(&self, stream: StreamHandle) -> u32 {
        self.lock().free_counts.get(&stream.0).copied().unwrap_or(0)
    }

    /// Frees attempted on handles that were not live.
    pub fn invalid_frees(&self) -> u32 {
        self.lock().invalid_frees
    }

    pub fn live_streams(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn volume(&self, stream: StreamHandle) -> Option<f32> {
        self.lock().streams.get(&stream.0).map(|s| s.volume)
    }

    pub fn is_sliding(&self, stream: StreamHandle) -> bool {
        self.lock()
            .streams
            .get(&stream.0)
            .is_some_and(|s| s.slide.is_some())
    }

    pub fn is_playing(&self, stream: StreamHandle) -> bool {
        self.lock()
            .streams
            .get(&stream.0)
            .is_some_and(|s| s.playing)
    }

    pub fn mixer_sources(&self, mixer: StreamHandle) -> Vec<StreamHandle> {
        match self.lock().streams.get(&mixer.0) {
            Some(Stream {
                body: Body::Mixer { sources, .. },
                ..
            }) => sources.iter().map(|s| StreamHandle(*s)).collect(),
            _ => Vec::new(),
        }
    }

    /// Effects attached to `stream` with their last parameters.
    pub fn effects_on(&self, stream: StreamHandle) -> Vec<(FxHandle, Option<EffectParams>)> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .effects
            .iter()
            .filter(|(_, fx)| fx.stream == stream.0)
            .map(|(h, fx)| (FxHandle(*h), fx.params))
            .collect();
        out.sort_by_key(|(h, _)| h.0);
        out
    }

    pub fn sync_count(&self, stream: StreamHandle) -> usize {
        self.lock()
            .streams
            .get(&stream.0)
            .map_or(0, |s| s.syncs.len())
    }

    pub fn exclusive_format(&self) -> Option<ChannelInfo> {
        self.lock().exclusive.format
    }

    pub fn exclusive_feed(&self) -> Option<StreamHandle> {
        self.lock().exclusive.feed.map(StreamHandle)
    }

    pub fn multichannel_layout(&self) -> MultichannelLayout {
        self.lock().multichannel.layout.clone()
    }

    pub fn multichannel_device(&self) -> Option<u32> {
        self.lock().multichannel.device
    }

    pub fn proxy(&self) -> Option<String> {
        self.lock().proxy.clone()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.lock().user_agent.clone()
    }

    pub fn buffered_device(&self) -> Option<Option<u32>> {
        self.lock().buffered_device
    }

    fn media_spec(&self, path: &Path) -> Result<MediaSpec, EngineError> {
        if let Some(spec) = self.lock().media.get(path).copied() {
            return Ok(spec);
        }
        let spec = probe_media(path)?;
        self.lock().media.insert(path.to_path_buf(), spec);
        Ok(spec)
    }

    fn init_fails(&self, driver: OutputDriver) -> bool {
        self.lock().failing_inits.contains(&driver)
    }
}

/// Read format and duration of a real file with Symphonia.
fn probe_media(path: &Path) -> Result<MediaSpec, EngineError> {
    let file = File::open(path).map_err(|_| EngineError::FileOpen)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|_| EngineError::Format)?;
    let track = probed.format.default_track().ok_or(EngineError::Format)?;
    let params = &track.codec_params;
    let rate = params.sample_rate.ok_or(EngineError::Format)?;
    let channels = params
        .channels
        .map(|c| c.count() as u16)
        .ok_or(EngineError::Format)?;
    let frames = params.n_frames.unwrap_or(0);
    Ok(MediaSpec {
        rate,
        channels,
        seconds: frames as f64 / f64::from(rate),
        codec: codec_tag(params.codec),
    })
}

fn codec_tag(codec: CodecType) -> CodecTag {
    match codec {
        CODEC_TYPE_MP3 => CodecTag::Mp3,
        CODEC_TYPE_VORBIS => CodecTag::Ogg,
        CODEC_TYPE_AAC => CodecTag::Aac,
        _ => CodecTag::Pcm,
    }
}

fn sample_bytes(float: bool) -> u32 {
    if float { 4 } else { 2 }
}

impl AudioEngine for MemoryEngine {
    fn open_file(&self, path: &Path, flags: OpenFlags) -> Result<StreamHandle, EngineError> {
        let spec = self.media_spec(path)?;
        let info = ChannelInfo {
            rate: spec.rate,
            channels: spec.channels,
            codec: spec.codec,
        };
        let mut stream = Stream::new(info, sample_bytes(flags.float), flags.decode, Body::File {
            len: 0,
            pos: 0,
        });
        let frames = (spec.seconds * f64::from(spec.rate)).round() as u64;
        stream.body = Body::File {
            len: frames * stream.frame_bytes(),
            pos: 0,
        };
        Ok(self.lock().insert(stream))
    }

    fn open_url(&self, url: &str, flags: OpenFlags) -> Result<StreamHandle, EngineError> {
        let spec = self
            .lock()
            .urls
            .get(url)
            .cloned()
            .ok_or(EngineError::NoNetwork)?;
        if !spec.connect_delay.is_zero() {
            std::thread::sleep(spec.connect_delay);
        }
        if let Some(e) = spec.error {
            return Err(e);
        }
        let info = ChannelInfo {
            rate: spec.rate,
            channels: spec.channels,
            codec: spec.codec,
        };
        let mut stream = Stream::new(info, sample_bytes(flags.float), flags.decode, Body::Url {
            pos: 0,
            size: spec.size,
            buffered: spec.buffered_bytes,
        });
        stream.meta = spec.meta;
        stream.header_tags = spec.header_tags;
        Ok(self.lock().insert(stream))
    }

    fn create_push_stream(&self, rate: u32, channels: u16) -> Result<StreamHandle, EngineError> {
        let info = ChannelInfo {
            rate,
            channels,
            codec: CodecTag::Pcm,
        };
        Ok(self.lock().insert(Stream::new(info, 4, true, Body::Push {
            queued: 0,
            consumed: 0,
            ended: false,
        })))
    }

    fn create_mixer(&self, rate: u32, channels: u16, flags: MixerFlags) -> Result<StreamHandle, EngineError> {
        let info = ChannelInfo {
            rate,
            channels,
            codec: CodecTag::Pcm,
        };
        Ok(self.lock().insert(Stream::new(
            info,
            sample_bytes(flags.float),
            flags.decode,
            Body::Mixer {
                sources: Vec::new(),
                pos: 0,
                end_when_drained: flags.end_when_drained,
                ended: false,
            },
        )))
    }

    fn mixer_attach(&self, mixer: StreamHandle, source: StreamHandle, _flags: AttachFlags) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.stream(source)?;
        if !matches!(st.stream(mixer)?.body, Body::Mixer { .. }) {
            return Err(EngineError::Handle);
        }
        st.detach(source.0);
        if let Body::Mixer { sources, ended, .. } = &mut st.stream_mut(mixer)?.body {
            sources.push(source.0);
            *ended = false;
        }
        st.stream_mut(source)?.mixer = Some(mixer.0);
        Ok(())
    }

    fn mixer_detach(&self, source: StreamHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.stream(source)?.mixer.is_none() {
            return Err(EngineError::Handle);
        }
        st.detach(source.0);
        Ok(())
    }

    fn mixer_of(&self, source: StreamHandle) -> Option<StreamHandle> {
        self.lock()
            .streams
            .get(&source.0)
            .and_then(|s| s.mixer)
            .map(StreamHandle)
    }

    fn free_stream(&self, stream: StreamHandle) -> Result<(), EngineError> {
        self.lock().free(stream.0)
    }

    fn channel_info(&self, stream: StreamHandle) -> Result<ChannelInfo, EngineError> {
        Ok(self.lock().stream(stream)?.info)
    }

    fn length_bytes(&self, stream: StreamHandle) -> Result<u64, EngineError> {
        match self.lock().stream(stream)?.body {
            Body::File { len, .. } => Ok(len),
            Body::Url { size: Some(s), .. } => Ok(s),
            _ => Err(EngineError::NotAvailable),
        }
    }

    fn position_bytes(&self, stream: StreamHandle) -> Result<u64, EngineError> {
        Ok(match self.lock().stream(stream)?.body {
            Body::File { pos, .. } | Body::Url { pos, .. } | Body::Mixer { pos, .. } => pos,
            Body::Push { consumed, .. } => consumed,
        })
    }

    fn set_position_bytes(&self, stream: StreamHandle, new_pos: u64) -> Result<(), EngineError> {
        let mut st = self.lock();
        match &mut st.stream_mut(stream)?.body {
            Body::File { len, pos } => *pos = new_pos.min(*len),
            Body::Mixer { pos, ended, .. } => {
                *pos = new_pos;
                *ended = false;
            }
            _ => return Err(EngineError::NotAvailable),
        }
        Ok(())
    }

    fn bytes_to_seconds(&self, stream: StreamHandle, bytes: u64) -> f64 {
        match self.lock().streams.get(&stream.0) {
            Some(s) if s.bytes_per_second() > 0 => bytes as f64 / s.bytes_per_second() as f64,
            _ => 0.0,
        }
    }

    fn seconds_to_bytes(&self, stream: StreamHandle, secs: f64) -> u64 {
        match self.lock().streams.get(&stream.0) {
            Some(s) => {
                let frames = (secs.max(0.0) * f64::from(s.info.rate)).floor() as u64;
                frames * s.frame_bytes()
            }
            None => 0,
        }
    }

    fn set_volume(&self, stream: StreamHandle, volume: f32) -> Result<(), EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        s.slide = None;
        s.volume = volume;
        Ok(())
    }

    fn slide_volume(&self, stream: StreamHandle, target: f32, ms: u32) -> Result<(), EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        s.slide = Some(Slide {
            from: s.volume,
            to: target,
            total_ms: u64::from(ms).max(1),
            elapsed_ms: 0,
            end: None,
        });
        Ok(())
    }

    fn fade_out(&self, stream: StreamHandle, ms: u32, end: FadeEnd) -> Result<(), EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        s.slide = Some(Slide {
            from: s.volume,
            to: 0.0,
            total_ms: u64::from(ms).max(1),
            elapsed_ms: 0,
            end: Some(end),
        });
        Ok(())
    }

    fn play(&self, stream: StreamHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.buffered_device.is_none() {
            return Err(EngineError::Init);
        }
        let s = st.stream_mut(stream)?;
        if s.decode {
            return Err(EngineError::NotAvailable);
        }
        s.playing = true;
        Ok(())
    }

    fn pause(&self, stream: StreamHandle) -> Result<(), EngineError> {
        self.lock().stream_mut(stream)?.playing = false;
        Ok(())
    }

    fn stop(&self, stream: StreamHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        s.playing = false;
        s.slide = None;
        Ok(())
    }

    fn set_sync(&self, stream: StreamHandle, spec: SyncSpec, callback: SyncCallback) -> Result<SyncHandle, EngineError> {
        let mut st = self.lock();
        st.stream(stream)?;
        st.next_sync += 1;
        let handle = st.next_sync;
        st.stream_mut(stream)?.syncs.push(RegisteredSync {
            handle,
            spec,
            callback,
        });
        Ok(SyncHandle(handle))
    }

    fn remove_sync(&self, stream: StreamHandle, sync: SyncHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        let before = s.syncs.len();
        s.syncs.retain(|r| r.handle != sync.0);
        if s.syncs.len() == before {
            return Err(EngineError::Handle);
        }
        Ok(())
    }

    fn read(&self, stream: StreamHandle, buf: &mut [u8]) -> Result<Read, EngineError> {
        let mut st = self.lock();
        let s = st.stream_mut(stream)?;
        let want = buf.len() as u64;
        let take = match &mut s.body {
            Body::File { len, pos } => {
                let take = want.min(len.saturating_sub(*pos));
                *pos += take;
                take
            }
            Body::Url { pos, size, .. } => {
                let take = size.map_or(want, |sz| want.min(sz.saturating_sub(*pos)));
                *pos += take;
                take
            }
            _ => return Err(EngineError::NotAvailable),
        };
        if take == 0 {
            return Ok(Read::Ended);
        }
        buf[..take as usize].fill(0);
        Ok(Read::Data(take as usize))
    }

    fn push_data(&self, stream: StreamHandle, data: &[u8]) -> Result<(), EngineError> {
        let mut st = self.lock();
        match &mut st.stream_mut(stream)?.body {
            Body::Push { queued, ended, .. } if !*ended => {
                *queued += data.len() as u64;
                Ok(())
            }
            _ => Err(EngineError::NotAvailable),
        }
    }

    fn push_end(&self, stream: StreamHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        match &mut st.stream_mut(stream)?.body {
            Body::Push { ended, .. } => {
                *ended = true;
                Ok(())
            }
            _ => Err(EngineError::NotAvailable),
        }
    }

    fn push_queued(&self, stream: StreamHandle) -> Option<usize> {
        match self.lock().streams.get(&stream.0)?.body {
            Body::Push { queued, .. } => Some(queued as usize),
            _ => None,
        }
    }

    fn add_effect(&self, stream: StreamHandle, _kind: EffectKind, _priority: i32) -> Result<FxHandle, EngineError> {
        let mut st = self.lock();
        st.stream(stream)?;
        let call = st.effect_calls;
        st.effect_calls += 1;
        if let Some(i) = st.failing_effects.iter().position(|&at| at == call) {
            st.failing_effects.swap_remove(i);
            return Err(EngineError::NotAvailable);
        }
        st.next_fx += 1;
        let h = st.next_fx;
        st.effects.insert(h, Effect {
            stream: stream.0,
            params: None,
        });
        Ok(FxHandle(h))
    }

    fn remove_effect(&self, stream: StreamHandle, fx: FxHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        match st.effects.get(&fx.0) {
            Some(e) if e.stream == stream.0 => {
                st.effects.remove(&fx.0);
                Ok(())
            }
            _ => Err(EngineError::Handle),
        }
    }

    fn set_effect_params(&self, fx: FxHandle, params: EffectParams) -> Result<(), EngineError> {
        let mut st = self.lock();
        let effect = st.effects.get_mut(&fx.0).ok_or(EngineError::Handle)?;
        effect.params = Some(params);
        Ok(())
    }

    fn fft(&self, stream: StreamHandle, out: &mut [f32]) -> Result<(), EngineError> {
        self.lock().stream(stream)?;
        out.fill(0.0);
        Ok(())
    }

    fn meta_tag(&self, stream: StreamHandle) -> Option<String> {
        self.lock().streams.get(&stream.0)?.meta.clone()
    }

    fn header_tags(&self, stream: StreamHandle) -> Vec<String> {
        self.lock()
            .streams
            .get(&stream.0)
            .map(|s| s.header_tags.clone())
            .unwrap_or_default()
    }

    fn file_counter(&self, stream: StreamHandle, counter: FileCounter) -> Option<u64> {
        match (&self.lock().streams.get(&stream.0)?.body, counter) {
            (Body::Url { buffered, .. }, FileCounter::Buffered) => *buffered,
            (Body::Url { size, .. }, FileCounter::Size) => *size,
            (Body::File { len, .. }, FileCounter::Buffered | FileCounter::Size) => Some(*len),
            _ => None,
        }
    }

    fn net_buffer_ms(&self) -> u32 {
        self.lock().net_buffer_ms
    }

    fn set_proxy(&self, address: Option<&str>) {
        self.lock().proxy = address.map(str::to_string);
    }

    fn set_user_agent(&self, agent: &str) {
        self.lock().user_agent = Some(agent.to_string());
    }

    fn device_info(&self, driver: OutputDriver, index: u32) -> Option<DeviceInfo> {
        self.lock().device_list(driver).get(index as usize).cloned()
    }

    fn channel_name(&self, channel: u32) -> Option<String> {
        let st = self.lock();
        st.multichannel.device?;
        st.channel_names.get(channel as usize).cloned()
    }

    fn buffered(&self) -> &dyn BufferedDevice {
        self
    }

    fn exclusive(&self) -> &dyn ExclusiveDevice {
        self
    }

    fn multichannel(&self) -> &dyn MultichannelDevice {
        self
    }

    fn shutdown(&self) {
        let mut st = self.lock();
        st.streams.clear();
        st.effects.clear();
        st.buffered_device = None;
        st.exclusive = ExclusiveState::default();
        st.multichannel = MultichannelState::default();
    }
}

impl BufferedDevice for MemoryEngine {
    fn init(&self, device: Option<u32>, _rate: u32, _window: Option<u64>, _buffer_ms: u32) -> Result<(), EngineError> {
        if self.init_fails(OutputDriver::Buffered) {
            return Err(EngineError::Init);
        }
        let mut st = self.lock();
        if let Some(index) = device {
            match st.device_list(OutputDriver::Buffered).get(index as usize) {
                Some(d) if d.enabled => {}
                _ => return Err(EngineError::Init),
            }
        }
        st.buffered_device = Some(device);
        Ok(())
    }

    fn supports_float(&self) -> bool {
        self.lock().buffered_float
    }
}

impl ExclusiveDevice for MemoryEngine {
    fn init(&self, device: u32, rate: u32, channels: u16, _event_driven: bool) -> Result<ChannelInfo, EngineError> {
        if self.init_fails(OutputDriver::ExclusiveEvent) {
            return Err(EngineError::Init);
        }
        let mut st = self.lock();
        match st.device_list(OutputDriver::ExclusiveEvent).get(device as usize) {
            Some(d) if d.enabled && !d.is_input => {}
            _ => return Err(EngineError::Init),
        }
        let granted = match st.exclusive_rates.first() {
            Some(first) if !st.exclusive_rates.contains(&rate) => *first,
            _ => rate,
        };
        let format = ChannelInfo {
            rate: granted,
            channels,
            codec: CodecTag::Pcm,
        };
        st.exclusive = ExclusiveState {
            format: Some(format),
            feed: None,
            started: false,
        };
        Ok(format)
    }

    fn set_feed(&self, mixer: Option<StreamHandle>) {
        self.lock().exclusive.feed = mixer.map(|m| m.0);
    }

    fn start(&self) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.exclusive.format.is_none() {
            return Err(EngineError::Init);
        }
        st.exclusive.started = true;
        Ok(())
    }

    fn stop(&self, _reset: bool) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.exclusive.format.is_none() {
            return Err(EngineError::Init);
        }
        st.exclusive.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.lock().exclusive.started
    }

    fn free(&self) {
        self.lock().exclusive = ExclusiveState::default();
    }
}

impl MultichannelDevice for MemoryEngine {
    fn init(&self, device: u32) -> Result<(), EngineError> {
        if self.init_fails(OutputDriver::Multichannel) {
            return Err(EngineError::Init);
        }
        let mut st = self.lock();
        if st
            .device_list(OutputDriver::Multichannel)
            .get(device as usize)
            .is_none()
        {
            return Err(EngineError::Init);
        }
        st.multichannel = MultichannelState {
            device: Some(device),
            ..MultichannelState::default()
        };
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.multichannel.device.is_none() {
            return Err(EngineError::Init);
        }
        st.multichannel.started = false;
        Ok(())
    }

    fn reset_channels(&self) {
        let mut st = self.lock();
        let device_rate = st.multichannel.layout.device_rate;
        st.multichannel.layout = MultichannelLayout {
            device_rate,
            ..MultichannelLayout::default()
        };
    }

    fn enable_channel(&self, channel: u32, feed: StreamHandle) -> Result<(), EngineError> {
        let mut st = self.lock();
        st.stream(feed)?;
        st.multichannel.layout.enabled = Some((channel, feed));
        Ok(())
    }

    fn mirror_channel(&self, channel: u32, source: u32) -> Result<(), EngineError> {
        self.lock().multichannel.layout.mirrored.push((channel, source));
        Ok(())
    }

    fn join_channel(&self, channel: u32, target: u32) -> Result<(), EngineError> {
        self.lock().multichannel.layout.joined.push((channel, target));
        Ok(())
    }

    fn set_channel_float(&self, channel: u32) -> Result<(), EngineError> {
        self.lock().multichannel.layout.float_channels.push(channel);
        Ok(())
    }

    fn set_channel_rate(&self, _channel: u32, rate: u32) -> Result<(), EngineError> {
        self.lock().multichannel.layout.channel_rate = Some(rate);
        Ok(())
    }

    fn set_rate(&self, rate: u32) -> Result<(), EngineError> {
        let mut st = self.lock();
        if !st.multichannel_rates.is_empty() && !st.multichannel_rates.contains(&rate) {
            return Err(EngineError::Format);
        }
        st.multichannel.layout.device_rate = Some(rate);
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        let mut st = self.lock();
        if st.multichannel.device.is_none() {
            return Err(EngineError::Init);
        }
        st.multichannel.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.lock().multichannel.started
    }

    fn free(&self) {
        self.lock().multichannel = MultichannelState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn decode() -> OpenFlags {
        OpenFlags {
            decode: true,
            float: true,
            software: false,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, SyncCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn open_unknown_file_fails_with_file_open() {
        let engine = MemoryEngine::new();
        let err = engine
            .open_file(Path::new("/nonexistent/a.flac"), decode())
            .unwrap_err();
        assert_eq!(err, EngineError::FileOpen);
    }

    #[test]
    fn seconds_and_bytes_convert_on_frame_boundaries() {
        let engine = MemoryEngine::new();
        engine.add_media("a.flac", MediaSpec::new(44_100, 2, 10.0));
        let s = engine.open_file(Path::new("a.flac"), decode()).unwrap();
        assert_eq!(engine.length_bytes(s).unwrap(), 44_100 * 8 * 10);
        assert_eq!(engine.seconds_to_bytes(s, 1.0), 352_800);
        assert!((engine.bytes_to_seconds(s, 352_800) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn playing_mixer_fires_end_syncs_when_source_drains() {
        let engine = MemoryEngine::new();
        engine.buffered().init(None, 44_100, None, 1000).unwrap();
        engine.add_media("a.flac", MediaSpec::new(44_100, 2, 0.05));
        let src = engine.open_file(Path::new("a.flac"), decode()).unwrap();
        let mixer = engine
            .create_mixer(44_100, 2, MixerFlags {
                decode: false,
                float: true,
                end_when_drained: true,
            })
            .unwrap();
        engine.mixer_attach(mixer, src, AttachFlags::default()).unwrap();
        let (mix_hits, mix_cb) = counter();
        let (end_hits, end_cb) = counter();
        engine
            .set_sync(mixer, SyncSpec::new(SyncKind::EndOfTrack).mix_time(), mix_cb)
            .unwrap();
        engine
            .set_sync(mixer, SyncSpec::new(SyncKind::EndOfTrack), end_cb)
            .unwrap();
        engine.play(mixer).unwrap();

        engine.advance(200);

        assert_eq!(mix_hits.load(Ordering::SeqCst), 1);
        assert_eq!(end_hits.load(Ordering::SeqCst), 1);
        assert!(!engine.is_playing(mixer));
    }

    #[test]
    fn fade_out_with_free_releases_mixer_and_sources_once() {
        let engine = MemoryEngine::new();
        engine.add_media("a.flac", MediaSpec::new(44_100, 2, 5.0));
        let src = engine.open_file(Path::new("a.flac"), decode()).unwrap();
        let mixer = engine
            .create_mixer(44_100, 2, MixerFlags::default())
            .unwrap();
        engine.mixer_attach(mixer, src, AttachFlags::default()).unwrap();
        engine.fade_out(mixer, 100, FadeEnd::Free).unwrap();

        engine.advance(50);
        assert!(engine.is_live(mixer));
        engine.advance(60);

        assert_eq!(engine.free_count(mixer), 1);
        assert_eq!(engine.free_count(src), 1);
        assert_eq!(engine.invalid_frees(), 0);
    }

    #[test]
    fn freeing_twice_is_reported() {
        let engine = MemoryEngine::new();
        let s = engine.create_push_stream(44_100, 2).unwrap();
        engine.free_stream(s).unwrap();
        assert_eq!(engine.free_stream(s), Err(EngineError::Handle));
        assert_eq!(engine.invalid_frees(), 1);
        assert_eq!(engine.push_queued(s), None);
    }

    #[test]
    fn position_sync_fires_once_when_crossed() {
        let engine = MemoryEngine::new();
        engine.add_media("a.flac", MediaSpec::new(48_000, 2, 5.0));
        let src = engine.open_file(Path::new("a.flac"), decode()).unwrap();
        let mixer = engine
            .create_mixer(48_000, 2, MixerFlags {
                decode: true,
                float: true,
                end_when_drained: true,
            })
            .unwrap();
        engine.mixer_attach(mixer, src, AttachFlags::default()).unwrap();
        engine.exclusive().init(1, 48_000, 2, true).unwrap();
        engine.exclusive().set_feed(Some(mixer));
        engine.exclusive().start().unwrap();
        let at = engine.seconds_to_bytes(mixer, 0.5);
        let (hits, cb) = counter();
        engine
            .set_sync(mixer, SyncSpec::new(SyncKind::PreRoll(at)).mix_time(), cb)
            .unwrap();

        engine.advance(400);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        engine.advance(600);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exclusive_init_grants_supported_rate() {
        let engine = MemoryEngine::new();
        engine.set_exclusive_rates(vec![48_000]);
        let granted = engine.exclusive().init(1, 44_100, 2, true).unwrap();
        assert_eq!(granted.rate, 48_000);
        assert_eq!(engine.exclusive().init(0, 44_100, 2, true), Err(EngineError::Init));
    }
}

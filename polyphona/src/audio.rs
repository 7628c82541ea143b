//! 音频引擎模块
//!
//! 调度器只计算“何时”与“触发什么”，发声交给实现了 [`AudioEngine`] 的后端。
//! 默认后端 [`SynthEngine`] 基于 rodio 输出设备，带有循环走带时钟与拨弦（Karplus-Strong）合成器。

use crate::error::{Error, Result};
use crate::music::{PitchName, TransportTime};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine-issued handle for one scheduled trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// What to sound when a scheduled event fires.
#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    pub pitch: PitchName,
    pub key: u8,
    pub duration: TransportTime,
    pub velocity: f32,
}

/// 宿主可替换的走带与发声后端。
///
/// 所有调用都是同步且不会失败的；后端不可用时 [`is_available`](Self::is_available) 返回 false。
pub trait AudioEngine {
    fn schedule(&mut self, trigger: Trigger, at: TransportTime) -> EventHandle;
    fn clear(&mut self, handle: EventHandle);
    fn start(&mut self, offset_seconds: f64);
    fn stop(&mut self);
    fn cancel_all(&mut self);
    fn set_loop(&mut self, loop_end: TransportTime, enabled: bool);
    fn set_bpm(&mut self, bpm: f64);
    fn bpm(&self) -> f64;
    /// Current transport position, in seconds from the loop start.
    fn position_seconds(&self) -> f64;
    fn is_available(&self) -> bool;
}

impl<E: AudioEngine + ?Sized> AudioEngine for Box<E> {
    fn schedule(&mut self, trigger: Trigger, at: TransportTime) -> EventHandle {
        (**self).schedule(trigger, at)
    }
    fn clear(&mut self, handle: EventHandle) {
        (**self).clear(handle)
    }
    fn start(&mut self, offset_seconds: f64) {
        (**self).start(offset_seconds)
    }
    fn stop(&mut self) {
        (**self).stop()
    }
    fn cancel_all(&mut self) {
        (**self).cancel_all()
    }
    fn set_loop(&mut self, loop_end: TransportTime, enabled: bool) {
        (**self).set_loop(loop_end, enabled)
    }
    fn set_bpm(&mut self, bpm: f64) {
        (**self).set_bpm(bpm)
    }
    fn bpm(&self) -> f64 {
        (**self).bpm()
    }
    fn position_seconds(&self) -> f64 {
        (**self).position_seconds()
    }
    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// 空实现，表示没有可用的输出设备。
#[derive(Debug)]
pub struct NullEngine {
    next_handle: u64,
    bpm: f64,
}

impl Default for NullEngine {
    fn default() -> Self {
        Self {
            next_handle: 0,
            bpm: 120.0,
        }
    }
}

impl AudioEngine for NullEngine {
    fn schedule(&mut self, _trigger: Trigger, _at: TransportTime) -> EventHandle {
        self.next_handle += 1;
        EventHandle(self.next_handle)
    }
    fn clear(&mut self, _handle: EventHandle) {}
    fn start(&mut self, _offset_seconds: f64) {}
    fn stop(&mut self) {}
    fn cancel_all(&mut self) {}
    fn set_loop(&mut self, _loop_end: TransportTime, _enabled: bool) {}
    fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }
    fn bpm(&self) -> f64 {
        self.bpm
    }
    fn position_seconds(&self) -> f64 {
        0.0
    }
    fn is_available(&self) -> bool {
        false
    }
}

/// Plucked-string voice settings.
#[derive(Clone, Copy, Debug)]
pub struct SynthConfig {
    pub sample_rate: u32,
    pub max_voices: usize,
    /// Amplitude of the noise burst that excites the string.
    pub attack_noise: f32,
    /// Cutoff of the loop filter, in Hz. Lower is duller.
    pub dampening_hz: f32,
    /// Share of the signal fed back on every pass through the string.
    pub resonance: f32,
    pub release_ms: f32,
    pub volume: f32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            max_voices: 32,
            attack_noise: 1.0,
            dampening_hz: 4000.0,
            resonance: 0.98,
            release_ms: 200.0,
            volume: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum TransportMessage {
    Schedule {
        handle: EventHandle,
        at: f64,
        duration: f64,
        key: u8,
        velocity: f32,
    },
    Clear(EventHandle),
    Start { offset: f64 },
    Stop,
    CancelAll,
    SetLoop { end: Option<f64> },
}

/// 默认的 rodio 播放后端：音频线程内维护走带时钟，到点触发正弦波音符。
pub struct SynthEngine {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sender: Sender<TransportMessage>,
    position: Arc<AtomicU64>,
    next_handle: u64,
    bpm: f64,
}

impl SynthEngine {
    pub fn new() -> Result<Self> {
        Self::with_config(SynthConfig::default())
    }

    pub fn with_config(config: SynthConfig) -> Result<Self> {
        let (_stream, handle) = OutputStream::try_default()
            .map_err(|e| Error::PlaybackUnavailable(e.to_string()))?;
        let (sender, receiver) = unbounded();
        let position = Arc::new(AtomicU64::new(0f64.to_bits()));
        let synth = TransportSynth::new(receiver, Arc::clone(&position), config);
        handle
            .play_raw(synth.convert_samples())
            .map_err(|e| Error::PlaybackUnavailable(e.to_string()))?;
        log::info!(
            "Synth engine started ({} Hz, {} voices)",
            config.sample_rate,
            config.max_voices
        );

        Ok(Self {
            _stream,
            _handle: handle,
            sender,
            position,
            next_handle: 0,
            bpm: 120.0,
        })
    }

    fn dispatch(&self, msg: TransportMessage) {
        let _ = self.sender.send(msg);
    }
}

impl AudioEngine for SynthEngine {
    fn schedule(&mut self, trigger: Trigger, at: TransportTime) -> EventHandle {
        self.next_handle += 1;
        let handle = EventHandle(self.next_handle);
        self.dispatch(TransportMessage::Schedule {
            handle,
            at: at.to_seconds(self.bpm),
            duration: trigger.duration.to_seconds(self.bpm),
            key: trigger.key,
            velocity: trigger.velocity,
        });
        handle
    }

    fn clear(&mut self, handle: EventHandle) {
        self.dispatch(TransportMessage::Clear(handle));
    }

    fn start(&mut self, offset_seconds: f64) {
        self.dispatch(TransportMessage::Start {
            offset: offset_seconds.max(0.0),
        });
    }

    fn stop(&mut self) {
        self.dispatch(TransportMessage::Stop);
    }

    fn cancel_all(&mut self) {
        self.dispatch(TransportMessage::CancelAll);
    }

    fn set_loop(&mut self, loop_end: TransportTime, enabled: bool) {
        let end = enabled.then(|| loop_end.to_seconds(self.bpm));
        self.dispatch(TransportMessage::SetLoop { end });
    }

    fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm.max(1.0);
    }

    fn bpm(&self) -> f64 {
        self.bpm
    }

    fn position_seconds(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Relaxed))
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug)]
struct ScheduledVoice {
    handle: EventHandle,
    at: f64,
    duration: f64,
    key: u8,
    velocity: f32,
}

struct TransportSynth {
    receiver: Receiver<TransportMessage>,
    shared_position: Arc<AtomicU64>,
    events: Vec<ScheduledVoice>,
    voices: Vec<Voice>,
    // (key, sample at which the voice is released)
    releases: Vec<(u8, u64)>,
    running: bool,
    position: f64,
    loop_end: Option<f64>,
    sample_clock: u64,
    sample_rate: u32,
    config: SynthConfig,
    rng: fastrand::Rng,
}

impl TransportSynth {
    fn new(
        receiver: Receiver<TransportMessage>,
        shared_position: Arc<AtomicU64>,
        config: SynthConfig,
    ) -> Self {
        Self {
            receiver,
            shared_position,
            events: Vec::new(),
            voices: Vec::new(),
            releases: Vec::new(),
            running: false,
            position: 0.0,
            loop_end: None,
            sample_clock: 0,
            sample_rate: config.sample_rate.max(1),
            config,
            rng: fastrand::Rng::new(),
        }
    }

    fn process_messages(&mut self) {
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                TransportMessage::Schedule {
                    handle,
                    at,
                    duration,
                    key,
                    velocity,
                } => {
                    self.events.push(ScheduledVoice {
                        handle,
                        at,
                        duration,
                        key,
                        velocity,
                    });
                }
                TransportMessage::Clear(handle) => {
                    self.events.retain(|e| e.handle != handle);
                }
                TransportMessage::Start { offset } => {
                    self.position = match self.loop_end {
                        Some(end) if end > 0.0 => offset % end,
                        _ => offset,
                    };
                    self.running = true;
                }
                TransportMessage::Stop => {
                    self.running = false;
                    self.position = 0.0;
                    self.voices.clear();
                    self.releases.clear();
                }
                TransportMessage::CancelAll => {
                    self.events.clear();
                }
                TransportMessage::SetLoop { end } => {
                    self.loop_end = end.filter(|e| *e > 0.0);
                }
            }
        }
    }

    /// Fires every event in `[from, to)`.
    fn fire_between(&mut self, from: f64, to: f64) {
        let due: Vec<ScheduledVoice> = self
            .events
            .iter()
            .filter(|e| e.at >= from && e.at < to)
            .copied()
            .collect();
        for event in due {
            self.voices.retain(|v| v.key != event.key);
            if self.voices.len() >= self.config.max_voices {
                self.voices.remove(0);
            }
            let voice = Voice::new(
                event.key,
                event.velocity,
                self.sample_rate,
                &self.config,
                &mut self.rng,
            );
            self.voices.push(voice);
            let length = (event.duration * self.sample_rate as f64) as u64;
            self.releases.push((event.key, self.sample_clock + length.max(1)));
        }
    }

    fn advance_transport(&mut self) {
        let from = self.position;
        let to = from + 1.0 / self.sample_rate as f64;
        match self.loop_end {
            Some(end) if to >= end => {
                self.fire_between(from, end);
                let wrapped = to - end;
                self.fire_between(0.0, wrapped);
                self.position = wrapped;
            }
            _ => {
                self.fire_between(from, to);
                self.position = to;
            }
        }
        self.shared_position
            .store(self.position.to_bits(), Ordering::Relaxed);
    }

    fn process_releases(&mut self) {
        let now = self.sample_clock;
        let voices = &mut self.voices;
        self.releases.retain(|(key, at)| {
            if *at > now {
                return true;
            }
            for voice in voices.iter_mut() {
                if voice.key == *key {
                    voice.release();
                }
            }
            false
        });
    }
}

impl Iterator for TransportSynth {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        self.process_messages();
        if self.running {
            self.advance_transport();
        }
        self.process_releases();
        self.sample_clock += 1;

        if self.voices.is_empty() {
            return Some(0.0);
        }

        let mut mix = 0.0;
        self.voices.retain_mut(|voice| {
            mix += voice.next_sample();
            !voice.is_finished()
        });

        Some((mix * self.config.volume * 0.7).tanh())
    }
}

impl Source for TransportSynth {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Karplus-Strong string: a noise burst circulating through a delay line
/// whose length sets the pitch, low-passed and attenuated on every pass.
struct Voice {
    key: u8,
    delay: Vec<f32>,
    cursor: usize,
    feedback: f32,
    filter_coeff: f32,
    filter_state: f32,
    level: f32,
    release_gain: f32,
    released: bool,
}

impl Voice {
    fn new(
        key: u8,
        velocity: f32,
        sample_rate: u32,
        config: &SynthConfig,
        rng: &mut fastrand::Rng,
    ) -> Self {
        let period = (sample_rate as f32 / key_frequency(key)).round() as usize;
        let velocity = if velocity.is_finite() {
            velocity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let amplitude = config.attack_noise * velocity;
        let delay = (0..period.max(2))
            .map(|_| (rng.f32() * 2.0 - 1.0) * amplitude)
            .collect();
        let cutoff = config.dampening_hz.max(1.0) / sample_rate as f32;
        let release_samples = (config.release_ms.max(0.0) / 1000.0) * sample_rate as f32;

        Self {
            key,
            delay,
            cursor: 0,
            feedback: config.resonance.clamp(0.0, 0.999),
            filter_coeff: (1.0 - (-2.0 * std::f32::consts::PI * cutoff).exp()).clamp(0.0, 1.0),
            filter_state: 0.0,
            level: 1.0,
            // falls to SILENCE over the release time
            release_gain: if release_samples <= 1.0 {
                0.0
            } else {
                SILENCE.powf(1.0 / release_samples)
            },
            released: false,
        }
    }

    fn next_sample(&mut self) -> f32 {
        let out = self.delay[self.cursor];
        self.filter_state += self.filter_coeff * (out - self.filter_state);
        self.delay[self.cursor] = self.filter_state * self.feedback;
        self.cursor = (self.cursor + 1) % self.delay.len();

        if self.released {
            self.level *= self.release_gain;
        }
        out * self.level
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn is_finished(&self) -> bool {
        self.released && self.level < SILENCE
    }
}

const SILENCE: f32 = 1e-3;

fn key_frequency(key: u8) -> f32 {
    440.0 * 2.0f32.powf((key as f32 - 69.0) / 12.0)
}

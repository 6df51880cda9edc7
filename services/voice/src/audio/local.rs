//! Audio capture and playback on the local machine using cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread for
//! as long as its handle is held. Handles talk to that thread through a
//! stop channel and, for playback, a shared cursor.

use super::{
    AudioInput, AudioOutput, CaptureSpec, InputHandle, OutputSink, PlaybackSpec,
    resample::{BlockFramer, StreamResampler},
};
use crate::error::AudioError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Host, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};
use livechat_core::pcm::AudioBlock;
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// How often the capture thread drains the ring buffer.
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Ring buffer capacity in seconds of device audio.
const CAPTURE_RING_SECONDS: usize = 2;

/// Names of the audio devices visible to the default host.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

/// Lists input and output devices on the default host.
pub fn list_devices() -> Result<DeviceList, AudioError> {
    let host = cpal::default_host();
    let inputs = host.input_devices()?.filter_map(|d| d.name().ok()).collect();
    let outputs = host.output_devices()?.filter_map(|d| d.name().ok()).collect();
    Ok(DeviceList {
        inputs,
        outputs,
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

fn find_device(host: &Host, name: Option<&str>, direction: Direction) -> Result<Device, AudioError> {
    match name {
        Some(wanted) => {
            let mut devices: Box<dyn Iterator<Item = Device>> = match direction {
                Direction::Input => Box::new(host.input_devices()?),
                Direction::Output => Box::new(host.output_devices()?),
            };
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| AudioError::Device(format!("No audio device named '{}'", wanted)))
        }
        None => match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
        .ok_or_else(|| AudioError::Device(format!("No default {:?} device available", direction))),
    }
}

/// Prefers a device configuration that runs natively at `rate`, with the
/// fewest channels and f32 samples; falls back to the device default.
fn choose_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    default: SupportedStreamConfig,
    rate: u32,
) -> SupportedStreamConfig {
    let wanted = cpal::SampleRate(rate);
    ranges
        .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
        .filter(|r| {
            matches!(
                r.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
            )
        })
        .min_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32))
        .map(|r| r.with_sample_rate(wanted))
        .unwrap_or(default)
}

/// Owns the thread a device stream lives on.
struct DeviceThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceThread {
    fn spawn<F>(name: &str, body: F) -> Result<Self, AudioError>
    where
        F: FnOnce(std_mpsc::Receiver<()>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_rx))?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signals the thread and waits for its stream to be dropped.
    fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| AudioError::Stream("Audio device thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        // Dropping the sender disconnects the thread's receiver, which ends it.
        self.stop.take();
    }
}

// --- Capture ---

/// Microphone capture through cpal.
#[derive(Debug, Clone, Default)]
pub struct LocalAudioInput {
    device_name: Option<String>,
}

impl LocalAudioInput {
    /// Uses the named device, or the host default when `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

struct LocalInputHandle {
    thread: DeviceThread,
}

impl InputHandle for LocalInputHandle {
    fn release(mut self: Box<Self>) -> Result<(), AudioError> {
        self.thread.stop()?;
        info!("Microphone released.");
        Ok(())
    }
}

#[async_trait]
impl AudioInput for LocalAudioInput {
    async fn acquire(
        &self,
        spec: CaptureSpec,
        blocks: mpsc::Sender<AudioBlock>,
    ) -> Result<Box<dyn InputHandle>, AudioError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();
        let mut thread = DeviceThread::spawn("livechat-capture", move |stop_rx| {
            run_capture(device_name, spec, blocks, stop_rx, ready_tx)
        })?;

        match ready_rx.await {
            Ok(Ok(name)) => {
                info!(device = %name, sample_rate = spec.sample_rate, "Microphone acquired.");
                Ok(Box::new(LocalInputHandle { thread }))
            }
            Ok(Err(e)) => {
                let _ = thread.stop();
                Err(e)
            }
            Err(_) => Err(AudioError::Device(
                "Capture thread exited before opening the device".to_string(),
            )),
        }
    }
}

/// Body of the capture thread: open the stream, then frame samples until stopped.
fn run_capture(
    device_name: Option<String>,
    spec: CaptureSpec,
    blocks: mpsc::Sender<AudioBlock>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: oneshot::Sender<Result<String, AudioError>>,
) {
    let (stream, mut consumer, mut framer, name) = match open_input(device_name.as_deref(), spec)
    {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if ready_tx.send(Ok(name)).is_err() {
        debug!("Microphone acquisition was abandoned; closing stream.");
        return;
    }

    let mut scratch = vec![0f32; 4096];
    let mut dropped = 0u64;
    loop {
        match stop_rx.recv_timeout(CAPTURE_POLL_INTERVAL) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        loop {
            let n = consumer.pop_slice(&mut scratch);
            if n == 0 {
                break;
            }
            let ready = match framer.push(&scratch[..n]) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(error = %e, "Failed to frame captured audio.");
                    continue;
                }
            };
            for block in ready {
                if let Err(mpsc::error::TrySendError::Full(_)) = blocks.try_send(block) {
                    dropped += 1;
                    trace!(dropped, "Encoder busy; dropping capture block.");
                }
            }
        }
    }
    drop(stream);
    debug!(dropped, "Capture stream closed.");
}

type OpenedInput = (Stream, HeapCons<f32>, BlockFramer, String);

fn open_input(device_name: Option<&str>, spec: CaptureSpec) -> Result<OpenedInput, AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, Direction::Input)?;
    let name = device.name()?;
    let supported = choose_config(
        device.supported_input_configs()?,
        device.default_input_config()?,
        spec.sample_rate,
    );
    let channels = supported.channels().max(1) as usize;
    let device_rate = supported.sample_rate().0;
    debug!(device = %name, device_rate, channels, format = ?supported.sample_format(), "Opening input stream.");

    let ring = HeapRb::<f32>::new(device_rate as usize * CAPTURE_RING_SECONDS);
    let (producer, consumer) = ring.split();
    let config: StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, channels, producer)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, channels, producer)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, channels, producer)?,
        other => {
            return Err(AudioError::Stream(format!(
                "Unsupported input sample format {:?}",
                other
            )));
        }
    };
    stream.play()?;

    let framer = BlockFramer::new(device_rate, spec.sample_rate, spec.block_size)?;
    Ok((stream, consumer, framer, name))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: HeapProd<f32>,
) -> Result<Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                // A full ring means the capture thread fell behind; newest samples lose.
                let _ = producer.try_push(sum / frame.len() as f32);
            }
        },
        |err| warn!("Capture stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

// --- Playback ---

/// Speaker playback through cpal.
#[derive(Debug, Clone, Default)]
pub struct LocalAudioOutput {
    device_name: Option<String>,
}

impl LocalAudioOutput {
    /// Uses the named device, or the host default when `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

/// The block currently being written to the device.
#[derive(Default)]
struct PlaybackCursor {
    samples: Vec<f32>,
    position: usize,
    done: Option<oneshot::Sender<()>>,
}

impl PlaybackCursor {
    fn load(samples: Vec<f32>, done: oneshot::Sender<()>) -> Self {
        let mut cursor = Self {
            samples,
            position: 0,
            done: Some(done),
        };
        if cursor.samples.is_empty() {
            cursor.finish();
        }
        cursor
    }

    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    /// Next sample for the device, or silence once the block is exhausted.
    fn next_sample(&mut self) -> f32 {
        match self.samples.get(self.position) {
            Some(&sample) => {
                self.position += 1;
                if self.position == self.samples.len() {
                    self.finish();
                }
                sample
            }
            None => 0.0,
        }
    }
}

struct LocalOutputSink {
    cursor: Arc<Mutex<PlaybackCursor>>,
    resampler: StreamResampler,
    thread: DeviceThread,
}

impl LocalOutputSink {
    fn swap(&self, next: PlaybackCursor) -> Result<(), AudioError> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| AudioError::Stream("Playback cursor poisoned".to_string()))?;
        *cursor = next;
        Ok(())
    }
}

impl OutputSink for LocalOutputSink {
    fn play(&mut self, block: AudioBlock, done: oneshot::Sender<()>) -> Result<(), AudioError> {
        let samples = self.resampler.process(block.into_samples())?;
        self.swap(PlaybackCursor::load(samples, done))
    }

    fn halt(&mut self) -> Result<(), AudioError> {
        self.resampler.reset();
        self.swap(PlaybackCursor::default())
    }

    fn release(mut self: Box<Self>) -> Result<(), AudioError> {
        let _ = self.swap(PlaybackCursor::default());
        self.thread.stop()?;
        info!("Output sink released.");
        Ok(())
    }
}

#[async_trait]
impl AudioOutput for LocalAudioOutput {
    async fn acquire(&self, spec: PlaybackSpec) -> Result<Box<dyn OutputSink>, AudioError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let cursor = Arc::new(Mutex::new(PlaybackCursor::default()));
        let device_name = self.device_name.clone();
        let shared = cursor.clone();
        let mut thread = DeviceThread::spawn("livechat-playback", move |stop_rx| {
            run_playback(device_name, spec, shared, stop_rx, ready_tx)
        })?;

        match ready_rx.await {
            Ok(Ok((name, device_rate))) => {
                info!(device = %name, device_rate, "Output sink acquired.");
                let resampler = match StreamResampler::new(spec.sample_rate, device_rate) {
                    Ok(resampler) => resampler,
                    Err(e) => {
                        let _ = thread.stop();
                        return Err(e);
                    }
                };
                Ok(Box::new(LocalOutputSink {
                    cursor,
                    resampler,
                    thread,
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.stop();
                Err(e)
            }
            Err(_) => Err(AudioError::Device(
                "Playback thread exited before opening the device".to_string(),
            )),
        }
    }
}

fn run_playback(
    device_name: Option<String>,
    spec: PlaybackSpec,
    cursor: Arc<Mutex<PlaybackCursor>>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: oneshot::Sender<Result<(String, u32), AudioError>>,
) {
    let (stream, name, device_rate) = match open_output(device_name.as_deref(), spec, cursor) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if ready_tx.send(Ok((name, device_rate))).is_err() {
        debug!("Output acquisition was abandoned; closing stream.");
        return;
    }
    // Either an explicit stop or a dropped handle ends playback.
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Playback stream closed.");
}

fn open_output(
    device_name: Option<&str>,
    spec: PlaybackSpec,
    cursor: Arc<Mutex<PlaybackCursor>>,
) -> Result<(Stream, String, u32), AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name, Direction::Output)?;
    let name = device.name()?;
    let supported = choose_config(
        device.supported_output_configs()?,
        device.default_output_config()?,
        spec.sample_rate,
    );
    let channels = supported.channels().max(1) as usize;
    let device_rate = supported.sample_rate().0;
    debug!(device = %name, device_rate, channels, format = ?supported.sample_format(), "Opening output stream.");

    let config: StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, channels, cursor)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, channels, cursor)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, channels, cursor)?,
        other => {
            return Err(AudioError::Stream(format!(
                "Unsupported output sample format {:?}",
                other
            )));
        }
    };
    stream.play()?;
    Ok((stream, name, device_rate))
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    cursor: Arc<Mutex<PlaybackCursor>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Never block the device thread; a contended cursor plays silence.
            let Ok(mut cursor) = cursor.try_lock() else {
                data.fill(T::EQUILIBRIUM);
                return;
            };
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(cursor.next_sample());
                frame.fill(value);
            }
        },
        |err| warn!("Playback stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

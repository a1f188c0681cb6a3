//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (scratch buffers are grown once, then reused)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback therefore only converts samples, applies the optional
//! software gain, and writes interleaved f32 into an SPSC ring producer
//! whose `push_slice` is lock-free. Channel layout is preserved — the DoA
//! estimator needs the raw multi-channel stream, so downmixing happens
//! downstream, never here.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). `AudioCapture` must be created and dropped on the same
//! thread; the capture worker does both inside `spawn_blocking`.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::{
    buffering::SampleProducer,
    error::{BarkError, Result},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Requested capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Preferred device name (exact, then substring). `None` = default.
    pub device_name: Option<String>,
    /// Desired sample rate in Hz.
    pub sample_rate: u32,
    /// Desired channel count.
    pub channels: u16,
    /// Linear software gain applied in the callback (1.0 = unity).
    pub gain: f32,
}

/// Shared flags the callback communicates through.
#[derive(Clone)]
pub struct CaptureSignals {
    /// `false` → callback no-ops (stop requested).
    pub running: Arc<AtomicBool>,
    /// Set by the cpal error callback on device loss; the capture worker
    /// reopens with backoff when it sees this.
    pub stream_failed: Arc<AtomicBool>,
    /// Interleaved samples dropped because the SPSC ring was full.
    pub xrun_samples: Arc<AtomicU64>,
}

impl CaptureSignals {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            running,
            stream_failed: Arc::new(AtomicBool::new(false)),
            xrun_samples: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    signals: CaptureSignals,
    /// Actual capture sample rate (Hz).
    pub sample_rate: u32,
    /// Actual channel count of the interleaved data.
    pub channels: u16,
    /// Name of the opened device.
    pub device_name: String,
}

impl AudioCapture {
    /// Open an input device and start pushing interleaved f32 into
    /// `producer`.
    ///
    /// The configured sample rate and channel count are requested when the
    /// device advertises support for them; otherwise the device's default
    /// input config is used and the actual values are reported on the
    /// returned handle.
    ///
    /// # Errors
    /// `BarkError::NoDefaultInputDevice` when no microphone is available,
    /// `BarkError::AudioStream` when cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        producer: SampleProducer,
        signals: CaptureSignals,
        request: &CaptureRequest,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let devices: Vec<(String, cpal::Device)> = host
            .input_devices()
            .map_err(|e| BarkError::AudioDevice(e.to_string()))?
            .enumerate()
            .map(|(idx, dev)| {
                let name = dev
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                (name, dev)
            })
            .collect();
        if devices.is_empty() {
            return Err(BarkError::NoDefaultInputDevice);
        }

        let names: Vec<String> = devices.iter().map(|(n, _)| n.clone()).collect();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let selected = device::select_index(
            &names,
            request.device_name.as_deref(),
            default_name.as_deref(),
        )
        .ok_or(BarkError::NoDefaultInputDevice)?;

        let (selected_name, dev) = {
            let mut devices = devices;
            devices.swap_remove(selected)
        };

        info!(device = selected_name.as_str(), "opening input device");

        let supported = dev
            .default_input_config()
            .map_err(|e| BarkError::AudioDevice(e.to_string()))?;
        let format = supported.sample_format();

        let desired_supported = dev
            .supported_input_configs()
            .map(|mut ranges| {
                ranges.any(|r| {
                    r.channels() == request.channels
                        && r.sample_format() == format
                        && r.min_sample_rate().0 <= request.sample_rate
                        && request.sample_rate <= r.max_sample_rate().0
                })
            })
            .unwrap_or(false);

        let config = if desired_supported {
            StreamConfig {
                channels: request.channels,
                sample_rate: SampleRate(request.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            }
        } else {
            warn!(
                requested_rate = request.sample_rate,
                requested_channels = request.channels,
                "requested capture config unsupported; using device default"
            );
            StreamConfig {
                channels: supported.channels(),
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        };

        let stream = Self::build(&dev, &config, format, &signals, request.gain, producer)?;
        stream
            .play()
            .map_err(|e| BarkError::AudioStream(e.to_string()))?;

        info!(
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?format,
            "audio config selected"
        );

        Ok(Self {
            _stream: stream,
            signals,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            device_name: selected_name,
        })
    }

    /// Build one input stream for the device's native sample format.
    #[cfg(feature = "audio-cpal")]
    fn build(
        dev: &cpal::Device,
        config: &StreamConfig,
        format: SampleFormat,
        signals: &CaptureSignals,
        gain: f32,
        mut producer: SampleProducer,
    ) -> Result<Stream> {
        let running = Arc::clone(&signals.running);
        let xruns = Arc::clone(&signals.xrun_samples);
        let err_failed = Arc::clone(&signals.stream_failed);

        let err_fn = move |err| {
            error!("audio stream error: {err}");
            err_failed.store(true, Ordering::Release);
        };

        let unity = (gain - 1.0).abs() < 1e-6;

        let built = match format {
            SampleFormat::F32 => {
                let mut conv_buf: Vec<f32> = Vec::new();
                dev.build_input_stream(
                    config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let written = if unity {
                            producer.push_slice(data)
                        } else {
                            conv_buf.resize(data.len(), 0.0);
                            for (dst, src) in conv_buf.iter_mut().zip(data) {
                                *dst = (src * gain).clamp(-1.0, 1.0);
                            }
                            producer.push_slice(&conv_buf)
                        };
                        if written < data.len() {
                            xruns.fetch_add((data.len() - written) as u64, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut conv_buf: Vec<f32> = Vec::new();
                dev.build_input_stream(
                    config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        conv_buf.resize(data.len(), 0.0);
                        for (dst, src) in conv_buf.iter_mut().zip(data) {
                            *dst = (f32::from(*src) / 32768.0 * gain).clamp(-1.0, 1.0);
                        }
                        let written = producer.push_slice(&conv_buf);
                        if written < conv_buf.len() {
                            xruns.fetch_add((conv_buf.len() - written) as u64, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U8 => {
                let mut conv_buf: Vec<f32> = Vec::new();
                dev.build_input_stream(
                    config,
                    move |data: &[u8], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        conv_buf.resize(data.len(), 0.0);
                        for (dst, src) in conv_buf.iter_mut().zip(data) {
                            *dst = ((f32::from(*src) - 128.0) / 128.0 * gain).clamp(-1.0, 1.0);
                        }
                        let written = producer.push_slice(&conv_buf);
                        if written < conv_buf.len() {
                            xruns.fetch_add((conv_buf.len() - written) as u64, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            fmt => {
                return Err(BarkError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        };

        built.map_err(|e| BarkError::AudioStream(e.to_string()))
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.signals.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: SampleProducer,
        signals: CaptureSignals,
        _request: &CaptureRequest,
    ) -> Result<Self> {
        let _ = signals;
        Err(BarkError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.signals.running.store(false, Ordering::Release);
    }
}

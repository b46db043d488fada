use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{info, warn};

use crate::config::Pacing;
use crate::nes::Nes;

/// Where the output callback gets its samples.
#[derive(Clone)]
enum SampleSource {
    /// Frame pacing: the UI thread pushes whole frames of samples.
    Queue(Arc<Mutex<VecDeque<f32>>>),
    /// Audio pacing: the callback steps the core itself.
    Emulator(Arc<Mutex<Nes>>),
}

impl SampleSource {
    fn fill(&self, out: &mut Vec<f32>, count: usize) {
        out.clear();
        match self {
            SampleSource::Queue(queue) => {
                if let Ok(mut queue) = queue.lock() {
                    out.extend((0..count).map(|_| queue.pop_front().unwrap_or(0.0)));
                }
            }
            SampleSource::Emulator(nes) => {
                if let Ok(mut nes) = nes.lock() {
                    out.extend((0..count).map(|_| nes.run_until_sample()));
                }
            }
        }
        out.resize(count, 0.0);
    }
}

pub struct AudioOutput {
    queue: Option<Arc<Mutex<VecDeque<f32>>>>,
    _stream: cpal::Stream,
    sample_rate: u32,
    max_queue_samples: usize,
}

impl AudioOutput {
    /// Opens the default device. In audio pacing the returned stream drives
    /// `nes`; in frame pacing samples go through [`AudioOutput::push_samples`].
    pub fn new(pacing: Pacing, nes: &Arc<Mutex<Nes>>, requested_rate: Option<u32>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = pick_config(&device, requested_rate)?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let max_queue_samples = ((sample_rate as usize) * 96) / 1000;

        if let Ok(mut nes) = nes.lock() {
            nes.set_audio_sample_rate(sample_rate);
        }

        let (source, queue) = match pacing {
            Pacing::Audio => (SampleSource::Emulator(Arc::clone(nes)), None),
            Pacing::Frame => {
                let queue = Arc::new(Mutex::new(VecDeque::<f32>::with_capacity(
                    max_queue_samples,
                )));
                (SampleSource::Queue(Arc::clone(&queue)), Some(queue))
            }
        };

        let err_fn = |err| {
            warn!(target: "audio", "audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| {
                        fill_output(data, channels, &source, &mut scratch, |s| s)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| {
                        fill_output(data, channels, &source, &mut scratch, |s| {
                            (s * i16::MAX as f32) as i16
                        })
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_output(data, channels, &source, &mut scratch, |s| {
                            ((s * 0.5 + 0.5) * u16::MAX as f32) as u16
                        })
                    },
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;
        info!(target: "audio", sample_rate, channels, ?pacing, "audio output started");

        Ok(Self {
            queue,
            _stream: stream,
            sample_rate,
            max_queue_samples,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queues samples in frame pacing, dropping the oldest past ~96 ms.
    /// Does nothing when the callback drives the core.
    pub fn push_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let Some(queue) = self.queue.as_ref() else {
            return;
        };
        let Ok(mut queue) = queue.lock() else {
            return;
        };

        let future_len = queue.len().saturating_add(samples.len());
        if future_len > self.max_queue_samples {
            let drop_count = future_len - self.max_queue_samples;
            for _ in 0..drop_count.min(queue.len()) {
                queue.pop_front();
            }
        }

        queue.extend(samples.iter().map(|s| s.clamp(-1.0, 1.0)));
    }

    pub fn queued_samples(&self) -> usize {
        self.queue
            .as_ref()
            .and_then(|queue| queue.lock().ok().map(|queue| queue.len()))
            .unwrap_or(0)
    }
}

fn pick_config(device: &cpal::Device, requested_rate: Option<u32>) -> Result<cpal::SupportedStreamConfig> {
    if let Some(rate) = requested_rate {
        let matching = device
            .supported_output_configs()
            .context("failed to query audio configs")?
            .find(|range| {
                range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0
            });
        match matching {
            Some(range) => return Ok(range.with_sample_rate(cpal::SampleRate(rate))),
            None => warn!(target: "audio", rate, "requested sample rate unsupported, using device default"),
        }
    }

    device
        .default_output_config()
        .context("failed to query default audio config")
}

/// Writes one mono sample into every channel of each output frame.
fn fill_output<T: Copy>(
    data: &mut [T],
    channels: usize,
    source: &SampleSource,
    scratch: &mut Vec<f32>,
    convert: impl Fn(f32) -> T,
) {
    let channels = channels.max(1);
    source.fill(scratch, data.len() / channels);
    for (frame, sample) in data.chunks_mut(channels).zip(scratch.iter()) {
        let value = convert(sample.clamp(-1.0, 1.0));
        for out in frame {
            *out = value;
        }
    }
}

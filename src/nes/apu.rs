use std::f64::consts::PI;

use tracing::trace;

/// CPU clock used by the pulse oscillators.
const CPU_CLOCK_HZ: f64 = 1_789_773.0;
const HARMONICS: u32 = 20;

/// Frame-sequencer steps, counted every 6 master ticks.
const QUARTER_FRAME_1: u32 = 3_729;
const HALF_FRAME_1: u32 = 7_457;
const QUARTER_FRAME_3: u32 = 11_186;
const HALF_FRAME_2: u32 = 14_916;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Duty settings: (sequencer pattern, oscillator phase).
const DUTY_TABLE: [(u16, f64); 4] = [
    (0b0000_0001, 0.125),
    (0b0000_0011, 0.25),
    (0b0000_1111, 0.5),
    (0b1111_1100, 0.75),
];

const NOISE_SEED: u16 = 0xDBDB;

/// How a sequencer advances its shift pattern when its timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    /// Rotate right within 8 bits.
    Pulse,
    /// 15-bit LFSR, feedback from bit 1.
    NoiseLong,
    /// 15-bit LFSR, feedback from bit 6.
    NoiseShort,
}

impl Shuffle {
    pub fn apply(self, sequence: u16) -> u16 {
        match self {
            Shuffle::Pulse => ((sequence & 0x0001) << 7) | ((sequence & 0x00FE) >> 1),
            Shuffle::NoiseLong => lfsr_step(sequence, 1),
            Shuffle::NoiseShort => lfsr_step(sequence, 6),
        }
    }
}

fn lfsr_step(sequence: u16, tap: u16) -> u16 {
    let feedback = (sequence & 0x0001) ^ ((sequence >> tap) & 0x0001);
    (feedback << 14) | ((sequence & 0x7FFF) >> 1)
}

#[derive(Debug, Clone, Copy, Default)]
struct Sequencer {
    sequence: u16,
    new_sequence: u16,
    timer: u16,
    reload: u16,
    output: u8,
}

impl Sequencer {
    fn clock(&mut self, enabled: bool, shuffle: Shuffle) -> u8 {
        if enabled {
            self.timer = self.timer.wrapping_sub(1);
            if self.timer == 0xFFFF {
                self.timer = self.reload.wrapping_add(1);
                self.sequence = shuffle.apply(self.sequence);
                self.output = (self.sequence & 0x0001) as u8;
            }
        }
        self.output
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LengthCounter {
    counter: u8,
}

impl LengthCounter {
    fn clock(&mut self, enabled: bool, halt: bool) {
        if !enabled {
            self.counter = 0;
        } else if self.counter > 0 && !halt {
            self.counter -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Envelope {
    start: bool,
    constant_volume: bool,
    divider: u16,
    volume: u16,
    decay: u16,
    output: u16,
}

impl Envelope {
    fn clock(&mut self, looping: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.volume;
        } else if self.divider == 0 {
            self.divider = self.volume;
            if self.decay == 0 {
                if looping {
                    self.decay = 15;
                }
            } else {
                self.decay -= 1;
            }
        } else {
            self.divider -= 1;
        }

        self.output = if self.constant_volume { self.volume } else { self.decay };
    }

    fn amplitude(&self) -> f64 {
        (self.output as f64 - 1.0) / 16.0
    }
}

/// Band-limited square wave built from a sum of sawtooth harmonics.
#[derive(Debug, Clone, Copy)]
struct PulseOscillator {
    frequency: f64,
    duty_cycle: f64,
    amplitude: f64,
}

impl Default for PulseOscillator {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            duty_cycle: 0.0,
            amplitude: 1.0,
        }
    }
}

impl PulseOscillator {
    fn sample(&self, t: f64) -> f64 {
        let mut a = 0.0;
        let mut b = 0.0;
        let p = self.duty_cycle * 2.0 * PI;

        for n in 1..HARMONICS {
            let n = n as f64;
            let c = n * self.frequency * 2.0 * PI * t;
            a += -approx_sin(c) / n;
            b += -approx_sin(c - p * n) / n;
        }

        (a - b) * (2.0 * self.amplitude / PI)
    }
}

fn approx_sin(x: f64) -> f64 {
    let mut j = x * 0.15915;
    j -= j.trunc();
    20.785 * j * (j - 0.5) * (j - 1.0)
}

#[derive(Debug, Clone, Copy, Default)]
struct Sweeper {
    enabled: bool,
    negate: bool,
    reload: bool,
    shift: u8,
    timer: u8,
    period: u8,
    change: u16,
    mute: bool,
}

impl Sweeper {
    fn write(&mut self, value: u8) {
        self.enabled = value & 0x80 != 0;
        self.period = (value & 0x70) >> 4;
        self.negate = value & 0x08 != 0;
        self.shift = value & 0x07;
        self.reload = true;
    }

    fn track(&mut self, target: u16) {
        if self.enabled {
            self.change = target >> self.shift;
            self.mute = !(8..=0x7FF).contains(&target);
        }
    }

    /// Half-frame clock. Pulse 1 negates with ones' complement, so it
    /// subtracts one extra.
    fn clock(&mut self, target: &mut u16, ones_complement: bool) -> bool {
        let mut changed = false;
        if self.timer == 0 && self.enabled && self.shift > 0 && !self.mute {
            if *target >= 8 && self.change < 0x7FF {
                if self.negate {
                    let extra = ones_complement as u16;
                    *target = target.wrapping_sub(self.change + extra);
                } else {
                    *target = target.wrapping_add(self.change);
                }
                changed = true;
            }
        }

        if self.reload || self.timer == 0 {
            self.timer = self.period;
            self.reload = false;
        } else {
            self.timer -= 1;
        }

        self.mute = !(8..=0x7FF).contains(target);
        changed
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PulseChannel {
    enabled: bool,
    halt: bool,
    sequencer: Sequencer,
    oscillator: PulseOscillator,
    envelope: Envelope,
    length: LengthCounter,
    sweep: Sweeper,
    ones_complement: bool,
    sample: f64,
    output: f64,
}

impl PulseChannel {
    fn new(ones_complement: bool) -> Self {
        Self {
            ones_complement,
            ..Self::default()
        }
    }

    fn write_control(&mut self, value: u8) {
        let (pattern, duty) = DUTY_TABLE[(value >> 6) as usize];
        self.sequencer.new_sequence = pattern;
        self.sequencer.sequence = pattern;
        self.oscillator.duty_cycle = duty;
        self.halt = value & 0x20 != 0;
        self.envelope.volume = (value & 0x0F) as u16;
        self.envelope.constant_volume = value & 0x10 != 0;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.sequencer.reload = (self.sequencer.reload & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.sequencer.reload = (self.sequencer.reload & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.sequencer.timer = self.sequencer.reload;
        self.sequencer.sequence = self.sequencer.new_sequence;
        if self.enabled {
            self.length.counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope.start = true;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length.counter = 0;
        }
    }

    fn clock_half_frame(&mut self) {
        self.length.clock(self.enabled, self.halt);
        let ones_complement = self.ones_complement;
        self.sweep.clock(&mut self.sequencer.reload, ones_complement);
    }

    fn clock(&mut self, global_time: f64) {
        self.sequencer.clock(self.enabled, Shuffle::Pulse);

        self.oscillator.frequency = CPU_CLOCK_HZ / (16.0 * (self.sequencer.reload as f64 + 1.0));
        self.oscillator.amplitude = self.envelope.amplitude();
        self.sample = self.oscillator.sample(global_time);

        if self.enabled
            && self.length.counter > 0
            && self.sequencer.timer >= 8
            && !self.sweep.mute
            && self.envelope.output > 2
        {
            self.output += (self.sample - self.output) * 0.5;
        } else {
            self.output = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NoiseChannel {
    enabled: bool,
    halt: bool,
    short_mode: bool,
    sequencer: Sequencer,
    envelope: Envelope,
    length: LengthCounter,
    output: f64,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            halt: false,
            short_mode: false,
            sequencer: Sequencer {
                sequence: NOISE_SEED,
                ..Sequencer::default()
            },
            envelope: Envelope::default(),
            length: LengthCounter::default(),
            output: 0.0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.envelope.volume = (value & 0x0F) as u16;
        self.envelope.constant_volume = value & 0x10 != 0;
        self.halt = value & 0x20 != 0;
    }

    fn write_period(&mut self, value: u8) {
        self.short_mode = value & 0x80 != 0;
        self.sequencer.reload = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        if self.enabled {
            self.length.counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.envelope.start = true;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length.counter = 0;
        }
    }

    fn shuffle(&self) -> Shuffle {
        if self.short_mode { Shuffle::NoiseShort } else { Shuffle::NoiseLong }
    }

    fn clock(&mut self) {
        let bit = self.sequencer.clock(self.enabled, self.shuffle());
        self.output = if self.enabled && self.length.counter > 0 && self.sequencer.timer >= 8 {
            bit as f64 * self.envelope.amplitude()
        } else {
            0.0
        };
    }
}

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    noise: NoiseChannel,

    clock_counter: u64,
    frame_clock_counter: u32,
    global_time: f64,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            noise: NoiseChannel::new(),
            clock_counter: 0,
            frame_clock_counter: 0,
            global_time: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.sweep.write(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),
            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.sweep.write(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),
            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),
            0x4015 => {
                self.pulse1.set_enabled(value & 0x01 != 0);
                self.pulse2.set_enabled(value & 0x02 != 0);
                self.noise.set_enabled(value & 0x04 != 0);
                trace!(target: "apu", enables = value & 0x07, "channel enables");
            }
            // Triangle, DMC and frame-counter mode are not synthesized.
            _ => {}
        }
    }

    /// $4015 read: length-counter status for pulse 1, pulse 2 and noise.
    pub fn read_status(&self) -> u8 {
        let mut status = 0;
        if self.pulse1.length.counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length.counter > 0 {
            status |= 0x02;
        }
        if self.noise.length.counter > 0 {
            status |= 0x08;
        }
        status
    }

    /// One master-clock tick.
    pub fn clock(&mut self) {
        self.global_time += 0.333_333_333_3 / CPU_CLOCK_HZ;

        if self.clock_counter % 6 == 0 {
            self.frame_clock_counter += 1;

            let (quarter, half) = match self.frame_clock_counter {
                QUARTER_FRAME_1 | QUARTER_FRAME_3 => (true, false),
                HALF_FRAME_1 => (true, true),
                HALF_FRAME_2 => {
                    self.frame_clock_counter = 0;
                    (true, true)
                }
                _ => (false, false),
            };

            if quarter {
                self.pulse1.envelope.clock(self.pulse1.halt);
                self.pulse2.envelope.clock(self.pulse2.halt);
                self.noise.envelope.clock(self.noise.halt);
            }

            if half {
                self.pulse1.clock_half_frame();
                self.pulse2.clock_half_frame();
                self.noise.length.clock(self.noise.enabled, self.noise.halt);
            }

            self.pulse1.clock(self.global_time);
            self.pulse2.clock(self.global_time);
            self.noise.clock();
        }

        self.pulse1.sweep.track(self.pulse1.sequencer.reload);
        self.pulse2.sweep.track(self.pulse2.sequencer.reload);

        self.clock_counter += 1;
    }

    /// Mixed output of the synthesized channels.
    pub fn sample(&self) -> f32 {
        let mixed = (self.pulse1.output - 0.8) * 0.1
            + (self.pulse2.output - 0.8) * 0.1
            + (2.0 * (self.noise.output - 0.5)) * 0.1;
        mixed as f32
    }
}

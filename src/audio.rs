// Audio plumbing shared by every sound-producing device: bounded FIFOs,
// the lock-free SPSC ring that crosses into the host audio callback, the
// three-stage double buffer built from both, first-order filters and the
// optional WAV capture sinks.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bounded FIFO used on one side of a double buffer. Single-threaded, the
/// owning device drives both ends.
pub struct Fifo<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Self {
        Fifo { data: VecDeque::with_capacity(capacity), capacity }
    }
    /// Push a sample. A full FIFO drops the sample and reports it.
    pub fn write(&mut self, value: T) -> bool {
        if self.data.len() >= self.capacity {
            return false;
        }
        self.data.push_back(value);
        true
    }
    pub fn read(&mut self) -> Option<T> {
        self.data.pop_front()
    }
    pub fn peek(&self) -> Option<&T> {
        self.data.front()
    }
    pub fn clear(&mut self) {
        self.data.clear();
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct RingInner<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    // Write position, only advanced by the producer.
    head: AtomicUsize,
    // Read position, only advanced by the consumer.
    tail: AtomicUsize,
}

// The SPSC contract keeps head producer-owned and tail consumer-owned;
// acquire/release pairs on them publish the buffer writes.
unsafe impl<T: Send> Sync for RingInner<T> {}
unsafe impl<T: Send> Send for RingInner<T> {}

impl<T> RingInner<T> {
    fn slots(&self) -> usize {
        self.buffer.len()
    }
}

/// Producer half of a lock-free single-producer single-consumer ring.
/// Usable capacity is one less than the allocated slot count (Lamport
/// full/empty disambiguation).
pub struct RingProducer<T> {
    inner: Arc<RingInner<T>>,
}

/// Consumer half, handed to the host audio callback.
pub struct RingConsumer<T> {
    inner: Arc<RingInner<T>>,
}

/// Allocate a shared ring with `capacity` usable slots.
pub fn spsc_ring<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let slots = capacity.max(1) + 1;
    let mut buffer = Vec::with_capacity(slots);
    for _ in 0..slots {
        buffer.push(UnsafeCell::new(MaybeUninit::uninit()));
    }
    let inner = Arc::new(RingInner {
        buffer: buffer.into_boxed_slice(),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (RingProducer { inner: Arc::clone(&inner) }, RingConsumer { inner })
}

impl<T> RingProducer<T> {
    /// Push a value. Returns it back when the ring is full; the writer
    /// never blocks (trailing samples are lost on overrun).
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let next_head = (head + 1) % inner.slots();
        if next_head == inner.tail.load(Ordering::Acquire) {
            return Err(value);
        }
        // Sole producer: next_head != tail guarantees the slot is free.
        unsafe {
            (*inner.buffer[head].get()).write(value);
        }
        inner.head.store(next_head, Ordering::Release);
        Ok(())
    }
    pub fn free(&self) -> usize {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        inner.slots() - 1 - (head + inner.slots() - tail) % inner.slots()
    }
}

impl<T> RingConsumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        if tail == inner.head.load(Ordering::Acquire) {
            return None;
        }
        // Sole consumer: tail != head guarantees the slot holds a value.
        let value = unsafe { (*inner.buffer[tail].get()).assume_init_read() };
        inner.tail.store((tail + 1) % inner.slots(), Ordering::Release);
        Some(value)
    }
    pub fn len(&self) -> usize {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Acquire);
        let tail = inner.tail.load(Ordering::Acquire);
        (head + inner.slots() - tail) % inner.slots()
    }
}

impl<T> Drop for RingInner<T> {
    fn drop(&mut self) {
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            unsafe {
                (*self.buffer[tail].get()).assume_init_drop();
            }
            tail = (tail + 1) % self.buffer.len();
        }
    }
}

/// Core-side half of a double-buffered sound channel: a private output
/// FIFO that spills into the shared ring once it reaches the migration
/// threshold.
pub struct DoubleBufferWriter<T> {
    out: Fifo<T>,
    shared: RingProducer<T>,
    threshold: usize,
}

/// Callback-side half: a private input FIFO refilled from the shared ring
/// only when it runs empty.
pub struct DoubleBufferReader<T: Copy> {
    input: Fifo<T>,
    shared: RingConsumer<T>,
    last: T,
}

/// Build a double-buffered channel. `buffer_samples` sizes the private
/// FIFOs and the migration threshold; the shared ring gets a second of
/// headroom at `sample_rate` so the writer rarely overruns.
pub fn double_buffer<T: Copy>(
    buffer_samples: usize,
    sample_rate: u32,
    silence: T,
) -> (DoubleBufferWriter<T>, DoubleBufferReader<T>) {
    let shared_capacity = buffer_samples.max(sample_rate as usize + 1) + 1;
    let (producer, consumer) = spsc_ring(shared_capacity);
    (
        DoubleBufferWriter { out: Fifo::new(buffer_samples), shared: producer, threshold: buffer_samples },
        DoubleBufferReader { input: Fifo::new(buffer_samples), shared: consumer, last: silence },
    )
}

impl<T: Copy> DoubleBufferWriter<T> {
    pub fn write(&mut self, sample: T) {
        if !self.out.write(sample) {
            // Private buffer saturated: spill it now and retry once.
            self.spill();
            let _ = self.out.write(sample);
        }
        if self.out.len() >= self.threshold {
            self.spill();
        }
    }
    fn spill(&mut self) {
        while let Some(&sample) = self.out.peek() {
            if self.shared.push(sample).is_err() {
                // Shared ring full: the reader is behind, drop the tail.
                self.out.read();
                continue;
            }
            self.out.read();
        }
    }
}

impl<T: Copy> DoubleBufferReader<T> {
    /// Pull the next sample, repeating the previous one on underrun.
    pub fn read(&mut self) -> T {
        if let Some(sample) = self.input.read() {
            self.last = sample;
            return sample;
        }
        let free = self.input.free();
        for _ in 0..free {
            match self.shared.pop() {
                Some(sample) => {
                    self.input.write(sample);
                }
                None => break,
            }
        }
        if let Some(sample) = self.input.read() {
            self.last = sample;
        }
        self.last
    }
}

/// First-order high/low-pass filter. Alpha is recomputed only on
/// configuration changes, never per-sample.
pub struct SoundFilter {
    highpass: bool,
    cutoff: f32,
    sample_rate: f32,
    alpha: f32,
    last_result: f32,
    last_sample: f32,
}

impl SoundFilter {
    pub fn new(highpass: bool, cutoff: f32, sample_rate: f32) -> Self {
        let mut filter = SoundFilter {
            highpass,
            cutoff: 0.0,
            sample_rate: 0.0,
            alpha: 0.0,
            last_result: 0.0,
            last_sample: 0.0,
        };
        filter.update(cutoff, sample_rate);
        filter
    }
    /// Recompute alpha for a new cutoff/rate pair. The filter type of a
    /// running channel never changes.
    pub fn update(&mut self, cutoff: f32, sample_rate: f32) {
        if self.cutoff == cutoff && self.sample_rate == sample_rate && self.alpha != 0.0 {
            return;
        }
        if self.highpass {
            let rc = 1.0 / (cutoff * 2.0 * std::f32::consts::PI);
            self.alpha = rc / (rc + 1.0 / sample_rate);
        } else {
            let dt = 1.0 / sample_rate;
            self.alpha = dt / ((1.0 / (cutoff * 2.0 * std::f32::consts::PI)) + dt);
        }
        self.cutoff = cutoff;
        self.sample_rate = sample_rate;
    }
    pub fn apply(&mut self, sample: &mut f32) {
        let result = if self.highpass {
            let result = self.alpha * (self.last_result + *sample - self.last_sample);
            self.last_sample = *sample;
            result
        } else {
            self.last_result + self.alpha * (*sample - self.last_result)
        };
        self.last_result = result;
        *sample = result;
    }
    pub fn reset(&mut self) {
        self.last_result = 0.0;
        self.last_sample = 0.0;
    }
}

/// 16-bit PCM capture sink for debugging a channel's raw output.
pub struct WavSink {
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    channels: u16,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, channels: u16, sample_rate: u32) -> Result<Self, hound::Error> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(WavSink { writer: Some(hound::WavWriter::create(path, spec)?), channels })
    }
    pub fn write_mono(&mut self, sample: i16) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_sample(sample);
        }
    }
    pub fn write_stereo(&mut self, left: i16, right: i16) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.write_sample(left);
            if self.channels > 1 {
                let _ = writer.write_sample(right);
            }
        }
    }
    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        self.finish();
    }
}

/// rodio source over a mono double-buffer reader. Underruns repeat the
/// last sample, so playback never stalls.
pub struct MonoRingSource {
    reader: DoubleBufferReader<i16>,
    sample_rate: u32,
}

impl MonoRingSource {
    pub fn new(reader: DoubleBufferReader<i16>, sample_rate: u32) -> Self {
        MonoRingSource { reader, sample_rate }
    }
}

impl Iterator for MonoRingSource {
    type Item = i16;
    fn next(&mut self) -> Option<i16> {
        Some(self.reader.read())
    }
}

impl rodio::Source for MonoRingSource {
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

/// rodio source over a stereo double-buffer reader of interleaved i16
/// frames. Underruns repeat the last frame, so playback never stalls.
pub struct StereoRingSource {
    reader: DoubleBufferReader<(i16, i16)>,
    sample_rate: u32,
    pending_right: Option<i16>,
}

impl StereoRingSource {
    pub fn new(reader: DoubleBufferReader<(i16, i16)>, sample_rate: u32) -> Self {
        StereoRingSource { reader, sample_rate, pending_right: None }
    }
}

impl Iterator for StereoRingSource {
    type Item = i16;
    fn next(&mut self) -> Option<i16> {
        if let Some(right) = self.pending_right.take() {
            return Some(right);
        }
        let (left, right) = self.reader.read();
        self.pending_right = Some(right);
        Some(left)
    }
}

impl rodio::Source for StereoRingSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        2
    }
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_push_and_pop() {
        let (mut producer, mut consumer) = spsc_ring::<i32>(3);
        assert_eq!(consumer.len(), 0);
        producer.push(10).unwrap();
        producer.push(20).unwrap();
        producer.push(30).unwrap();
        assert_eq!(producer.push(40), Err(40));
        assert_eq!(consumer.pop(), Some(10));
        assert_eq!(consumer.pop(), Some(20));
        assert_eq!(consumer.pop(), Some(30));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn ring_wraparound() {
        let (mut producer, mut consumer) = spsc_ring::<i32>(2);
        for round in 0..10 {
            let base = round * 100;
            producer.push(base + 1).unwrap();
            producer.push(base + 2).unwrap();
            assert_eq!(consumer.pop(), Some(base + 1));
            assert_eq!(consumer.pop(), Some(base + 2));
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn double_buffer_migrates_at_threshold() {
        let (mut writer, mut reader) = double_buffer::<i16>(4, 8, 0);
        writer.write(1);
        writer.write(2);
        writer.write(3);
        writer.write(4);
        assert_eq!(reader.read(), 1);
        assert_eq!(reader.read(), 2);
        assert_eq!(reader.read(), 3);
        assert_eq!(reader.read(), 4);
        // Underrun repeats the last sample.
        assert_eq!(reader.read(), 4);
    }

    #[test]
    fn lowpass_converges_to_dc() {
        let mut filter = SoundFilter::new(false, 1000.0, 44100.0);
        let mut sample = 0.0;
        for _ in 0..10_000 {
            sample = 1.0;
            filter.apply(&mut sample);
        }
        assert!((sample - 1.0).abs() < 1e-3);
    }

    #[test]
    fn highpass_blocks_dc() {
        let mut filter = SoundFilter::new(true, 10.0, 44100.0);
        let mut sample = 0.0;
        for _ in 0..100_000 {
            sample = 1.0;
            filter.apply(&mut sample);
        }
        assert!(sample.abs() < 1e-2);
    }

    #[test]
    fn fifo_bounds() {
        let mut fifo = Fifo::new(2);
        assert!(fifo.write(1u8));
        assert!(fifo.write(2u8));
        assert!(!fifo.write(3u8));
        assert_eq!(fifo.free(), 0);
        assert_eq!(fifo.read(), Some(1));
        assert_eq!(fifo.free(), 1);
    }
}

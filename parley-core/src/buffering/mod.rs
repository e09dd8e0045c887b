//! Lock-free SPSC ring buffer for captured audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time input callback. The capture thread owns
//! the consumer half.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half: held by the device input callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half: held by the capture thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^20 = 1 048 576 f32 samples ≈ 21.8 s at 48 kHz.
/// The capture thread drains every few milliseconds, so this only fills if
/// that thread stalls.
pub const RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_come_out_in_push_order() {
        let (mut producer, mut consumer) = create_audio_ring();
        assert_eq!(producer.push_slice(&[0.1, 0.2, 0.3]), 3);

        let mut out = [0f32; 4];
        let n = consumer.pop_slice(&mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..n], &[0.1, 0.2, 0.3]);
    }
}

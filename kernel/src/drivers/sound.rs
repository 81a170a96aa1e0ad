//! Audio device contract
//!
//! The virtio-snd driver (collaborator) registers a [`SoundDevice`];
//! the kapi sound family fronts whatever is registered and reports
//! `Unsupported` otherwise.

use alloc::boxed::Box;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// PCM sink: signed 16-bit interleaved stereo samples.
pub trait SoundDevice: Send {
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> KernelResult<()>;
    fn stop(&mut self);
}

static DEVICE: Mutex<Option<Box<dyn SoundDevice>>> = Mutex::new(None);

/// Driver glue hands the probed audio device to the kernel.
pub fn register(dev: Box<dyn SoundDevice>) {
    *DEVICE.lock() = Some(dev);
    println!("[SND] Audio device registered");
}

pub fn play(samples: &[i16], sample_rate: u32) -> KernelResult<()> {
    match DEVICE.lock().as_mut() {
        Some(dev) => dev.play(samples, sample_rate),
        None => Err(KernelError::Unsupported { what: "audio" }),
    }
}

pub fn stop() {
    if let Some(dev) = DEVICE.lock().as_mut() {
        dev.stop();
    }
}

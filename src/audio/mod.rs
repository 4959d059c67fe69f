//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame;
pub mod output;
pub mod scheduler;

pub use buffer::{create_frame_queue, FrameQueue, FrameRing, SharedFrameQueue};
pub use capture::AudioCapture;
pub use device::{find_device, list_devices, AudioDeviceInfo, Direction};
pub use frame::{DecodedFrame, EncodedFrame};
pub use output::{AudioOutput, CpalOutput, OutputMonitor, OutputStats};
pub use scheduler::{PlaybackScheduler, Scheduled};

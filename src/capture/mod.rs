//! Capture sources
//!
//! Device enumeration, stream acquisition and the adapters the engine
//! records from.

pub mod acquisition;
pub mod devices;
pub mod traits;
pub mod virtual_source;

#[cfg(feature = "microphone")]
pub mod microphone;

#[cfg(any(feature = "microphone", test))]
mod pcm;

pub use acquisition::{BindingTable, BoundStream, StreamAcquisition};
pub use devices::DeviceRegistry;
pub use traits::{
    Analyser, CaptureBackend, Constraints, DeviceDescriptor, DeviceKind, EventSink, MediaStream,
    NativeEvent, PermissionStatus, RawDevice, RecorderHandle, RecorderOptions, SignalSnapshot,
};
pub use virtual_source::{VirtualBackend, VirtualDevice};

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneBackend;

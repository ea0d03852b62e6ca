//! Passive Modbus RTU Bus Sniffer Core
//!
//! Turns the raw byte stream of a tapped RS485 bus into typed per-device
//! sensor readings. No network I/O happens here: bytes are pushed in with
//! [`Pipeline::feed`] and events leave through an [`EventSink`].
//!
//! # Key Components
//!
//! - **ByteRingBuffer**: bounded byte FIFO with arrival timestamps
//! - **FrameSynchronizer**: silence/structure/CRC driven frame recovery
//! - **RegisterDecoder**: lazy projection of frames onto the register table
//! - **DeviceRegistry**: per-address device records and online/offline state
//! - **SensorStateCache**: change detection with minimum delta and staleness
//! - **SnifferHub**: the shared, serialized registry + cache
//! - **Pipeline**: one per byte stream, owns its synchronizer

pub mod cache;
pub mod constants;
pub mod crc;
pub mod decoder;
pub mod device;
pub mod error;
pub mod frame;
pub mod hub;
pub mod pipeline;
pub mod register;
pub mod ring_buffer;
pub mod sink;
pub mod stats;
pub mod sync;
pub mod types;

pub use cache::{CacheConfig, SensorStateCache};
pub use decoder::{Decoded, DecodedValues, RegisterDecoder};
pub use device::{DeviceRecord, DeviceRegistry, DeviceState};
pub use error::{Result, SnifferCoreError};
pub use frame::{CandidateFrame, FrameKind, ReadRequest, ValidatedFrame};
pub use hub::{FrameActivity, HubConfig, SnifferHub};
pub use pipeline::{Pipeline, PipelineConfig};
pub use register::{BitDefinition, DataWidth, DeviceClass, RegisterDefinition, RegisterKind, RegisterTable};
pub use ring_buffer::ByteRingBuffer;
pub use sink::EventSink;
pub use stats::{SnifferStats, StatsSnapshot};
pub use sync::{FrameSynchronizer, SyncConfig, SyncStats};
pub use types::{
    ChangeEvent, ChangeReason, CoreEvent, FlagState, LifecycleEvent, PhysicalValue, RegisterId,
    RegisterValue,
};

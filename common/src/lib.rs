pub mod address;
pub mod config;
pub mod error;
pub mod gpio;
pub mod onewire;
pub mod ports;
pub mod push;
pub mod readings;
pub mod render;
pub mod routes;
pub mod scheduler;
pub mod sensors;
pub mod sim;
pub mod types;

pub use address::DeviceAddress;
pub use config::{ApiConfig, HttpConfig, NetworkConfig, PollConfig, PowerOnPolicy, RuntimeConfig};
pub use error::{Error, Result};
pub use ports::{ClockSync, NetworkJoin, Pusher};
pub use push::PushRequest;
pub use readings::{Reading, ReadingsTable, ReadingsView, Snapshot};
pub use routes::*;
pub use scheduler::{Clock, MonotonicClock, PollPhase, PollScheduler, TickReport};
pub use sensors::{DeviceFamily, SensorSet};
pub use types::{sensors_payload, ReadingsPayload};

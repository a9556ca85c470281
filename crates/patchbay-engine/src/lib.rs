pub mod demo;
pub mod devices;
pub mod engine;
pub mod graph;
pub mod mock;
pub mod session;

pub use demo::DemoError;
pub use devices::{DeviceConfig, DeviceServices};
pub use engine::{Engine, EngineFactory, EventSender};
pub use graph::{GraphEngine, GraphEngineFactory};
pub use session::{Events, Session, SessionConfig};

//! # nocturn
//!
//! Device orchestration core for astronomical instrument automation.
//!
//! Tracks remote hardware (mounts, cameras, focusers, filter wheels and
//! friends) exposed through an INDI-style push protocol, and sequences
//! multi-step operations — slew and settle, tracked capture runs,
//! focuser moves — while device state changes arrive on an independent
//! event stream. The wire codec, HTTP surface and image processing live
//! in sibling crates; this one owns the device registry, the protocol
//! router, the task framework and the single-flight scheduler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nocturn::{ControlConfig, DeviceRegistry, HandlerRegistry, ProtocolRouter, Scheduler};
//! use nocturn::protocol::{OutboundCommand, ProtocolMessage};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControlConfig::default();
//!
//!     // commands_rx feeds the wire encoder; messages_tx is fed by the decoder
//!     let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<OutboundCommand>();
//!     let (messages_tx, messages_rx) = mpsc::unbounded_channel::<ProtocolMessage>();
//!
//!     let handlers = Arc::new(HandlerRegistry::new());
//!     let registry = Arc::new(DeviceRegistry::new(handlers));
//!     let router = Arc::new(ProtocolRouter::new(&config, registry, Arc::new(commands_tx)));
//!     router.spawn(messages_rx);
//!
//!     let scheduler = Scheduler::start(&config);
//!     let mut events = scheduler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let _ = (messages_tx, commands_rx.recv().await);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod event;
pub mod property;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod task;

// Re-exports for convenience
pub use config::{ControlConfig, ControlConfigBuilder};
pub use device::Device;
pub use devices::{Camera, EquatorialCoordinates, FilterWheel, Focuser, GuideDirection, Mount};
pub use drivers::{DeviceKind, DriverTable};
pub use error::{Error, Result};
pub use event::{DeviceEvent, DeviceEventHandler, HandlerId, HandlerRegistry};
pub use property::{Property, PropertyPerm, PropertyState, PropertyValue, PropertyVector};
pub use protocol::{CommandSender, OutboundCommand, ProtocolMessage};
pub use registry::DeviceRegistry;
pub use router::ProtocolRouter;
pub use scheduler::{ScheduledTask, Scheduler, SchedulerEvent, TaskSnapshot};
pub use task::{Task, TaskOutcome, TaskRef};

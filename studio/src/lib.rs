//! Studio - actor runtime for dashboard editing sessions
//!
//! Each open dashboard, query and visualization is an actor that owns its
//! record and saves it through a debounced persistence child. Actors find
//! each other through the [`directory::Directory`] and stay consistent
//! through correlated broadcasts on the session event bus.

pub mod actors;
pub mod backend;
pub mod config;
pub mod directory;
pub mod machine;
pub mod services;
pub mod supervisor;

pub use config::StudioConfig;
pub use directory::Directory;
pub use services::SessionServices;
pub use supervisor::{SessionSupervisor, SessionSupervisorArgs, SessionSupervisorMsg};

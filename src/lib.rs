// ABOUTME: Root library module exposing the relay application modules
// ABOUTME: Completion client, sidecar transport, relay, supervisor, and bootstrap wiring

pub mod bootstrap;
pub mod completion;
pub mod console;
pub mod relay;
pub mod sidecar;
pub mod supervisor;

// Re-export platform-agnostic modules from warelay-core
pub use warelay_core::config;
pub use warelay_core::paths;
pub use warelay_core::session;
pub use warelay_core::traits;

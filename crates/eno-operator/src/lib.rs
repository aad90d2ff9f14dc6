//! eno controller
//!
//! Runs the synthesizer pod lifecycle controller and the reconstitution
//! cache against a cluster.

pub mod config;
pub mod controller_runner;

pub use config::ControllerArgs;
pub use controller_runner::{
    build_reconstitution_controllers, build_synthesis_controllers, ControllerFuture,
};

//! InstructLab sessions: dataset generation then fine tuning, each step run
//! in a container on the local engine.

pub mod manager;
pub mod registry;

pub use manager::{InstructLabManager, ILAB_IMAGE, ILAB_LABEL};
pub use registry::InstructLabRegistry;

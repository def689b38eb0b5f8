pub mod alloc;
pub mod coherence;
pub mod config;
pub mod context;
pub mod data;
pub mod device;
pub mod error;
pub mod graph;
pub mod node;
pub mod output;
pub mod pipeline;
pub mod supernode;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::alloc::{allocate, release};
    pub use crate::coherence::{commit, sync_input, writeback};
    pub use crate::config::*;
    pub use crate::context::*;
    pub use crate::data::*;
    pub use crate::device::*;
    pub use crate::error::*;
    pub use crate::graph::*;
    pub use crate::node::*;
    pub use crate::output::{mark_output_dirty, readback};
    pub use crate::pipeline::*;
    pub use crate::supernode::*;
}

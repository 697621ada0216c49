//! A minimal computational-graph engine: named data nodes, function modules wired between them,
//! and a net that runs forward, backward and optimizer updates in a fixed topological order.

pub mod dataloader;
pub mod datasets;
pub mod graph;
pub mod net;
pub mod operation;
pub mod optim;
pub mod tensor;
pub mod trainer;

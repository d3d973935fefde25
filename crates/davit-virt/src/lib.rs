// davit-virt: everything that touches the host on behalf of an instance.
// Virtualizer back-ends, block storage, vnic plumbing, node telemetry.

pub mod blockstore;
pub mod network;
pub mod proc;
pub mod telemetry;
pub mod virtualizer;

// davit: root facade crate.
//
// Re-exports the workspace libraries so downstream tooling can depend on
// a single crate; the `davitd` binary lives next door in main.rs.

pub use davit_agent as agent;
pub use davit_core as core;
pub use davit_virt as virt;

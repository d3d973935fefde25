// davit-agent: the concurrent lifecycle engine.
//
// One overseer task owns node state; one instance task per instance owns
// its driver and directory; the dispatcher couples inbound control frames
// to instance mailboxes. Everything communicates over channels — there is
// no lock around the instance registry.

pub mod agent;
pub mod bounds;
pub mod dispatcher;
pub mod instance;
pub mod overseer;
pub mod recovery;

pub use agent::Agent;

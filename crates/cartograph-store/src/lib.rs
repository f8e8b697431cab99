pub mod schema;
pub mod store;

pub use store::{AgentRecord, CardFilter, CardPatch, Store};

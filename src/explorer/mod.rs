pub mod blacklist;
pub mod forward;

pub use blacklist::Blacklist;
pub use forward::{external_data, AvoidSet, ForwardExplorer, Path};

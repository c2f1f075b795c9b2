// One module per CLI action.

pub mod deps;
pub mod events;
pub mod invoke;
pub mod list;
pub mod load;
pub mod manifest;
pub mod probe;
pub mod resolve;

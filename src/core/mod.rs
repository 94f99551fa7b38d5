pub mod domain;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod traits;
pub mod verdict;

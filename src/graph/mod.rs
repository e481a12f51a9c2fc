//! Entity graph resolution: composite keys and the record joins that turn
//! a team's raw many-to-many references into bindable mappings.

pub mod key;
pub mod resolver;

pub use key::CompositeKey;
pub use resolver::{EntityGraphResolver, ResolvedGraph};

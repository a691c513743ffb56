//! Domain layer: aggregates, value objects, events and the pure domain
//! services built on them.
pub mod aggregates;
pub mod events;
pub mod services;
pub mod value_objects;

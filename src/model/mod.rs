//! Data model for objects exchanged on the wire
//!
//! Defines the base object entity with its closed core-type set, factory
//! helpers for the common specializations, and the context filter used to
//! gate remote operation calls.

pub mod filter;
pub mod object;

pub use filter::{
    matches_filter, ContextFilter, FilterCondition, FilterConditions, FilterOperator,
};
pub use object::{CoatyObject, CoreType, OBJECT_TYPE_PREFIX};

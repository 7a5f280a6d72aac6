//! Filter role contracts and the per-node property bag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::buffer::Buffer;
use crate::error::{PropertyWarning, Result};
use crate::requisition::Requisition;
use crate::resources::CommandQueue;

/// A typed property value, as stored in a [`PropertyBag`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Long(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::ULong(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// A filter's configuration, keyed by property name.
///
/// Values are set either programmatically (already typed, so they can
/// never mismatch) or coerced from the string form a pipeline description
/// carries; coercion failures and unknown names produce a [`PropertyWarning`]
/// that is logged and otherwise ignored — malformed configuration narrows a
/// pipeline's behavior, it does not abort setup.
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    values: HashMap<String, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> PropertyBag {
        PropertyBag::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.values.get(name) {
            Some(PropertyValue::Bool(v)) => *v,
            Some(_) | None => default,
        }
    }

    pub fn get_int(&self, name: &str, default: i32) -> i32 {
        match self.values.get(name) {
            Some(PropertyValue::Int(v)) => *v,
            Some(_) | None => default,
        }
    }

    pub fn get_float(&self, name: &str, default: f32) -> f32 {
        match self.values.get(name) {
            Some(PropertyValue::Float(v)) => *v,
            Some(_) | None => default,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(PropertyValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Sets `name` from a pipeline-description string, coercing into
    /// whichever variant `expected` names. On failure, emits a
    /// [`PropertyWarning`], logs it, and leaves any prior value in place.
    pub fn set_from_str(&mut self, name: &str, value: &str, expected: PropertyKind) {
        let parsed = match expected {
            PropertyKind::Bool => value.parse::<bool>().map(PropertyValue::Bool).ok(),
            PropertyKind::Int => value.parse::<i32>().map(PropertyValue::Int).ok(),
            PropertyKind::Long => value.parse::<i64>().map(PropertyValue::Long).ok(),
            PropertyKind::UInt => value.parse::<u32>().map(PropertyValue::UInt).ok(),
            PropertyKind::ULong => value.parse::<u64>().map(PropertyValue::ULong).ok(),
            PropertyKind::Float => value.parse::<f32>().map(PropertyValue::Float).ok(),
            PropertyKind::Double => value.parse::<f64>().map(PropertyValue::Double).ok(),
            PropertyKind::Str => Some(PropertyValue::Str(value.to_string())),
        };

        match parsed {
            Some(v) => {
                self.values.insert(name.to_string(), v);
            }
            None => {
                let warning = PropertyWarning::TypeMismatch {
                    name: name.to_string(),
                    expected: expected.as_str(),
                    value: value.to_string(),
                };
                warn!("{}", warning);
            }
        }
    }

    /// Logs and drops a reference to a name no registered property declares.
    pub fn warn_unknown(&self, name: &str) {
        warn!("{}", PropertyWarning::Unknown(name.to_string()));
    }
}

/// The scalar kind a property coerces into, used by [`PropertyBag::set_from_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Bool,
    Int,
    Long,
    UInt,
    ULong,
    Float,
    Double,
    Str,
}

impl PropertyKind {
    fn as_str(self) -> &'static str {
        match self {
            PropertyKind::Bool => "bool",
            PropertyKind::Int => "int",
            PropertyKind::Long => "long",
            PropertyKind::UInt => "uint",
            PropertyKind::ULong => "ulong",
            PropertyKind::Float => "float",
            PropertyKind::Double => "double",
            PropertyKind::Str => "string",
        }
    }
}

/// Common lifecycle every filter role shares: a one-time setup call before
/// the scheduler starts pulling a graph through its workers.
pub trait Filter: Send + Sync + fmt::Debug {
    fn initialize(&self, _props: &PropertyBag) -> Result<()> {
        Ok(())
    }

    /// Called before the scheduler duplicates this filter's node onto an
    /// extra device during partitioning. Most filters have no state that
    /// would make a second concurrent instance unsafe and accept; a filter
    /// wrapping something that cannot be shared this way (a singleton
    /// device resource, a non-reentrant external library) should return an
    /// error instead of letting the duplicate node start up.
    fn confirm_copy(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the scheduler may consider this filter's node a candidate
    /// for path-based replication when partitioning across devices.
    /// Defaults to `true`; a filter with side effects tied to running
    /// exactly once (a sink writing to a single file, a source reading a
    /// single device) should override this to `false`.
    fn is_expandable(&self) -> bool {
        true
    }
}

/// A filter with no inputs: it manufactures buffers until it has nothing
/// left to produce.
pub trait Source: Filter {
    /// The shape of the next buffer this source will generate.
    fn output_requisition(&self, props: &PropertyBag) -> Requisition;

    /// Fills `output` with the next unit of data. `queue` is this worker's
    /// assigned command queue, for filters that need to populate the
    /// device side directly rather than going through the host.
    ///
    /// Returns `Ok(false)` once the source is exhausted, at which point the
    /// scheduler stops calling it and begins shutting the pipeline down.
    fn generate(&self, output: &mut Buffer, queue: &Arc<dyn CommandQueue>, props: &PropertyBag) -> Result<bool>;
}

/// A filter with exactly one input and one output.
pub trait Transform: Filter {
    /// The output shape this transform produces for a given input shape.
    /// Defaults to passing the input shape through unchanged.
    fn output_requisition(&self, input: Requisition, _props: &PropertyBag) -> Requisition {
        input
    }

    /// Consumes `input`, producing `output`, using `queue` for any
    /// device-side work. `input` is `&mut` because reading it may need to
    /// synchronize it from the device first.
    fn process(&self, input: &mut Buffer, output: &mut Buffer, queue: &Arc<dyn CommandQueue>, props: &PropertyBag) -> Result<()>;
}

/// A filter with no outputs: it consumes buffers and has side effects only.
pub trait Sink: Filter {
    fn consume(&self, input: &mut Buffer, queue: &Arc<dyn CommandQueue>, props: &PropertyBag) -> Result<()>;
}

/// The role a [`crate::node::Node`] plays in a graph, wrapping whichever
/// filter trait object it runs.
///
/// Filters are shared by reference count, not cloned, so duplicating a
/// node's role (as `expand` does when it widens a path) never duplicates
/// filter state.
#[derive(Clone)]
pub enum Role {
    Source(Arc<dyn Source>),
    Transform(Arc<dyn Transform>),
    Sink(Arc<dyn Sink>),
}

impl Role {
    pub fn is_source(&self) -> bool {
        matches!(self, Role::Source(_))
    }

    pub fn is_transform(&self) -> bool {
        matches!(self, Role::Transform(_))
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, Role::Sink(_))
    }

    pub fn initialize(&self, props: &PropertyBag) -> Result<()> {
        match self {
            Role::Source(f) => f.initialize(props),
            Role::Transform(f) => f.initialize(props),
            Role::Sink(f) => f.initialize(props),
        }
    }

    pub fn confirm_copy(&self) -> Result<()> {
        match self {
            Role::Source(f) => f.confirm_copy(),
            Role::Transform(f) => f.confirm_copy(),
            Role::Sink(f) => f.confirm_copy(),
        }
    }

    pub fn is_expandable(&self) -> bool {
        match self {
            Role::Source(f) => f.is_expandable(),
            Role::Transform(f) => f.is_expandable(),
            Role::Sink(f) => f.is_expandable(),
        }
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Source(filter) => f.debug_tuple("Source").field(filter).finish(),
            Role::Transform(filter) => f.debug_tuple("Transform").field(filter).finish(),
            Role::Sink(filter) => f.debug_tuple("Sink").field(filter).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_property_falls_back_to_default() {
        let bag = PropertyBag::new();
        assert_eq!(bag.get_int("iterations", 3), 3);
    }

    #[test]
    fn set_from_str_coerces_into_the_expected_kind() {
        let mut bag = PropertyBag::new();
        bag.set_from_str("threshold", "0.5", PropertyKind::Float);
        assert_eq!(bag.get_float("threshold", 0.0), 0.5);
    }

    #[test]
    fn set_from_str_on_bad_input_leaves_prior_value_untouched() {
        let mut bag = PropertyBag::new();
        bag.set("iterations", PropertyValue::Int(7));
        bag.set_from_str("iterations", "not-a-number", PropertyKind::Int);
        assert_eq!(bag.get_int("iterations", 0), 7);
    }

    #[test]
    fn type_mismatch_falls_back_to_default_without_panicking() {
        let mut bag = PropertyBag::new();
        bag.set("iterations", PropertyValue::Str("five".into()));
        assert_eq!(bag.get_int("iterations", 9), 9);
    }
}

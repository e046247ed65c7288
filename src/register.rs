//! `Register`: an immutable wrapper around one scalar JSON value (§4.6).
//!
//! A register exists purely so that scalars set into a `Map` or pushed into
//! a `List` participate in the node graph like any other child — with an
//! identity and a parent link — instead of living inline the way an
//! `Object`'s scalar properties do. Registers are never mutated in place;
//! changing a value means replacing the register.
use crate::op::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RegisterData {
    pub value: Value,
}

impl RegisterData {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_one_scalar() {
        let r = RegisterData::new(Value::from(42));
        assert_eq!(r.value, Value::from(42));
    }
}

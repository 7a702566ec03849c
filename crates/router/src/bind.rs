//! Per-request value binding.
//!
//! A context carries a small keyed map of values for the lifetime of one
//! request. The well-known keys are produced by the router itself (route
//! parameters, the pre-read body, the cached query parameters and the
//! registered URL); anything else is a user key.

use std::any::Any;
use std::collections::HashMap;

/// Key for a value bound to a request context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindKey {
    /// The path parameters extracted by the route lookup
    RouteParams,
    /// The request body collected by the body-reader middleware
    IncomingBody,
    /// The lazily parsed query parameters
    QueryParams,
    /// The pattern URL the matched route was registered under
    RegisteredUrl,
    /// A user-defined key
    User(String),
}

impl From<&str> for BindKey {
    fn from(key: &str) -> Self {
        BindKey::User(key.to_string())
    }
}

impl From<String> for BindKey {
    fn from(key: String) -> Self {
        BindKey::User(key)
    }
}

pub(crate) type BoundValue = Box<dyn Any + Send + Sync>;

/// The bound-value map of one request.
#[derive(Default)]
pub(crate) struct BoundValues {
    inner: HashMap<BindKey, BoundValue>,
}

impl BoundValues {
    pub(crate) fn insert(&mut self, key: BindKey, value: BoundValue) {
        self.inner.insert(key, value);
    }

    pub(crate) fn get(&self, key: &BindKey) -> Option<&(dyn Any + Send + Sync)> {
        self.inner.get(key).map(|boxed| boxed.as_ref())
    }

    pub(crate) fn get_as<T: Any>(&self, key: &BindKey) -> Option<&T> {
        self.inner.get(key).and_then(|boxed| boxed.downcast_ref())
    }

    pub(crate) fn get_as_mut<T: Any>(&mut self, key: &BindKey) -> Option<&mut T> {
        self.inner.get_mut(key).and_then(|boxed| boxed.downcast_mut())
    }

    pub(crate) fn contains(&self, key: &BindKey) -> bool {
        self.inner.contains_key(key)
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_keys_convert_from_strings() {
        assert_eq!(BindKey::from("token"), BindKey::User("token".to_string()));
        assert_eq!(BindKey::from("token".to_string()), BindKey::User("token".to_string()));
        assert_ne!(BindKey::from("RouteParams"), BindKey::RouteParams);
    }

    #[test]
    fn downcasts_only_to_the_stored_type() {
        let mut values = BoundValues::default();
        values.insert(BindKey::from("n"), Box::new(7u32));

        assert_eq!(values.get_as::<u32>(&BindKey::from("n")), Some(&7));
        assert!(values.get_as::<String>(&BindKey::from("n")).is_none());
        assert!(values.get(&BindKey::from("n")).is_some());
        assert!(values.get(&BindKey::from("missing")).is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let mut values = BoundValues::default();
        values.insert(BindKey::RouteParams, Box::new(1u8));
        values.insert(BindKey::from("x"), Box::new(2u8));

        values.clear();

        assert!(!values.contains(&BindKey::RouteParams));
        assert!(!values.contains(&BindKey::from("x")));
    }

    #[test]
    fn mutable_access_updates_in_place() {
        let mut values = BoundValues::default();
        values.insert(BindKey::from("list"), Box::new(Vec::<u8>::new()));

        values.get_as_mut::<Vec<u8>>(&BindKey::from("list")).unwrap().push(1);
        values.get_as_mut::<Vec<u8>>(&BindKey::from("list")).unwrap().push(2);

        assert_eq!(values.get_as::<Vec<u8>>(&BindKey::from("list")), Some(&vec![1, 2]));
    }
}

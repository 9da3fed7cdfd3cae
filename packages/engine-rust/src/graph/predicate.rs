//! Exchange predicates for choice branches and `retry_while`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use switchyard_core::{Exchange, Value};

type PredicateFn = Arc<dyn Fn(&Exchange) -> bool + Send + Sync>;

/// A clonable boolean test over an exchange.
///
/// Predicates built with [`Predicate::always`] (or combinations that are
/// trivially true) report [`Predicate::is_always`], which route validation
/// uses to detect choice branches that can never be selected.
#[derive(Clone)]
pub struct Predicate {
    test: PredicateFn,
    always: bool,
    label: Arc<str>,
}

impl Predicate {
    /// Predicate from an arbitrary closure.
    pub fn new(label: impl Into<String>, test: impl Fn(&Exchange) -> bool + Send + Sync + 'static) -> Self {
        Self {
            test: Arc::new(test),
            always: false,
            label: Arc::from(label.into()),
        }
    }

    #[must_use]
    pub fn always() -> Self {
        Self {
            test: Arc::new(|_| true),
            always: true,
            label: Arc::from("always"),
        }
    }

    /// Header `name` is present and its textual form equals `expected`.
    pub fn header_equals(name: impl Into<String>, expected: impl Into<String>) -> Self {
        let name = name.into();
        let expected = expected.into();
        let label = format!("header({name}) == {expected:?}");
        Self::new(label, move |ex| {
            ex.message()
                .header(&name)
                .and_then(value_text)
                .is_some_and(|text| text == expected)
        })
    }

    pub fn header_exists(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = format!("header({name}) exists");
        Self::new(label, move |ex| ex.message().has_header(&name))
    }

    /// Header `name` is present and its textual form matches `pattern`.
    pub fn header_matches(name: impl Into<String>, pattern: Regex) -> Self {
        let name = name.into();
        let label = format!("header({name}) =~ /{pattern}/");
        Self::new(label, move |ex| {
            ex.message()
                .header(&name)
                .and_then(value_text)
                .is_some_and(|text| pattern.is_match(&text))
        })
    }

    pub fn property_exists(key: impl Into<String>) -> Self {
        let key = key.into();
        let label = format!("property({key}) exists");
        Self::new(label, move |ex| ex.property(&key).is_some())
    }

    /// The body is present and holds a `T`.
    #[must_use]
    pub fn body_is<T: Any>() -> Self {
        let label = format!("body is {}", std::any::type_name::<T>());
        Self::new(label, |ex| ex.message().body().is_some_and(Value::is::<T>))
    }

    #[must_use]
    pub fn not(self) -> Self {
        let label = format!("!({})", self.label);
        let inner = self.test;
        Self::new(label, move |ex| !inner(ex))
    }

    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let always = self.always && other.always;
        let label = format!("({}) && ({})", self.label, other.label);
        let (a, b) = (self.test, other.test);
        Self {
            always,
            ..Self::new(label, move |ex| a(ex) && b(ex))
        }
    }

    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        let always = self.always || other.always;
        let label = format!("({}) || ({})", self.label, other.label);
        let (a, b) = (self.test, other.test);
        Self {
            always,
            ..Self::new(label, move |ex| a(ex) || b(ex))
        }
    }

    #[must_use]
    pub fn evaluate(&self, exchange: &Exchange) -> bool {
        (self.test)(exchange)
    }

    /// `true` if this predicate holds for every exchange by construction.
    #[must_use]
    pub fn is_always(&self) -> bool {
        self.always
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.label).finish()
    }
}

fn value_text(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    if let Some(n) = value.downcast_ref::<i64>() {
        return Some(n.to_string());
    }
    if let Some(n) = value.downcast_ref::<u32>() {
        return Some(n.to_string());
    }
    if let Some(b) = value.downcast_ref::<bool>() {
        return Some(b.to_string());
    }
    value.downcast_ref::<f64>().map(f64::to_string)
}

#[cfg(test)]
mod tests {
    use switchyard_core::Message;

    use super::*;

    fn exchange_with_header(name: &str, value: impl Into<Value>) -> Exchange {
        let mut message = Message::new();
        message.set_header(name, value);
        Exchange::with_message(message)
    }

    #[test]
    fn header_equals_compares_text_forms() {
        let p = Predicate::header_equals("priority", "7");
        assert!(p.evaluate(&exchange_with_header("priority", 7_i64)));
        assert!(p.evaluate(&exchange_with_header("priority", "7")));
        assert!(!p.evaluate(&exchange_with_header("priority", "8")));
        assert!(!p.evaluate(&Exchange::new()));
    }

    #[test]
    fn header_matches_uses_regex() {
        let p = Predicate::header_matches("path", Regex::new(r"^/orders/\d+$").unwrap());
        assert!(p.evaluate(&exchange_with_header("path", "/orders/17")));
        assert!(!p.evaluate(&exchange_with_header("path", "/orders/x")));
    }

    #[test]
    fn combinators_track_always() {
        let never = Predicate::new("never", |_| false);
        assert!(Predicate::always().or(never.clone()).is_always());
        assert!(!Predicate::always().and(never.clone()).is_always());
        assert!(!never.clone().not().is_always());
        assert!(never.not().evaluate(&Exchange::new()));
    }

    #[test]
    fn body_is_checks_type() {
        let ex = Exchange::with_message(Message::with_body(5_i64));
        assert!(Predicate::body_is::<i64>().evaluate(&ex));
        assert!(!Predicate::body_is::<String>().evaluate(&ex));
    }

    #[test]
    fn labels_describe_the_test() {
        let p = Predicate::header_exists("a").and(Predicate::property_exists("b"));
        assert_eq!(p.label(), "(header(a) exists) && (property(b) exists)");
    }
}

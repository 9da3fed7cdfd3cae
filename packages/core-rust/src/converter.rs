//! Type conversion registry.
//!
//! Converters are edges in a type graph. The registry is assembled once with
//! [`TypeConverterRegistryBuilder`] and frozen by `build()`, which resolves
//! the shortest converter path (up to `max_depth` hops) for every reachable
//! `(source, target)` pair. Lookups afterwards are plain hash-map reads with
//! no locking, so a single registry can be shared by every route.
//!
//! A missing path is reported as not-ok (`None` / `ConversionUnavailable`),
//! never as a route failure; callers decide whether it is fatal.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::error::ConversionUnavailable;
use crate::exchange::Exchange;
use crate::value::{TypeKey, Value};

/// Default number of hops the fallback search may take.
pub const DEFAULT_SEARCH_DEPTH: usize = 3;

type ConvertFn = Arc<dyn Fn(&Value, Option<&Exchange>) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
struct Edge {
    from: TypeKey,
    to: TypeKey,
    convert: ConvertFn,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Append-only registration of converters, frozen by [`build`](Self::build).
///
/// Registering a second converter for the same type pair replaces the first
/// and logs a warning; the edge keeps its original registration slot so that
/// path resolution stays deterministic.
pub struct TypeConverterRegistryBuilder {
    edges: Vec<Edge>,
    index: HashMap<(TypeId, TypeId), usize>,
    max_depth: usize,
}

impl TypeConverterRegistryBuilder {
    fn new() -> Self {
        Self {
            edges: Vec::new(),
            index: HashMap::new(),
            max_depth: DEFAULT_SEARCH_DEPTH,
        }
    }

    /// Registers a context-free converter from `A` to `B`.
    ///
    /// The converter may decline a particular value by returning `None`.
    #[must_use]
    pub fn register<A, B, F>(mut self, convert: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(&A) -> Option<B> + Send + Sync + 'static,
    {
        let erased: ConvertFn = Arc::new(move |value: &Value, _exchange: Option<&Exchange>| {
            value.downcast_ref::<A>().and_then(&convert).map(Value::new)
        });
        self.insert(TypeKey::of::<A>(), TypeKey::of::<B>(), erased);
        self
    }

    /// Registers a converter that needs the exchange (e.g. for a charset
    /// property). It declines when called without an exchange.
    #[must_use]
    pub fn register_with_exchange<A, B, F>(mut self, convert: F) -> Self
    where
        A: Any + Send + Sync,
        B: Any + Send + Sync,
        F: Fn(&A, &Exchange) -> Option<B> + Send + Sync + 'static,
    {
        let erased: ConvertFn = Arc::new(move |value: &Value, exchange: Option<&Exchange>| {
            let exchange = exchange?;
            value
                .downcast_ref::<A>()
                .and_then(|a| convert(a, exchange))
                .map(Value::new)
        });
        self.insert(TypeKey::of::<A>(), TypeKey::of::<B>(), erased);
        self
    }

    /// Caps the number of converter hops. Depth 1 disables the fallback search.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Adds the built-in scalar, text, byte, and JSON converters.
    #[must_use]
    pub fn with_defaults(self) -> Self {
        self.register::<String, i64, _>(|s| s.trim().parse().ok())
            .register::<i64, String, _>(|n| Some(n.to_string()))
            .register::<String, f64, _>(|s| s.trim().parse().ok())
            .register::<f64, String, _>(|x| Some(x.to_string()))
            .register::<String, bool, _>(|s| s.trim().parse().ok())
            .register::<bool, String, _>(|b| Some(b.to_string()))
            .register::<u32, i64, _>(|n| Some(i64::from(*n)))
            .register::<i64, u32, _>(|n| u32::try_from(*n).ok())
            .register::<String, Bytes, _>(|s| Some(Bytes::from(s.clone())))
            .register::<Bytes, String, _>(|b| String::from_utf8(b.to_vec()).ok())
            .register::<Vec<u8>, Bytes, _>(|v| Some(Bytes::from(v.clone())))
            .register::<Bytes, Vec<u8>, _>(|b| Some(b.to_vec()))
            .register::<String, serde_json::Value, _>(|s| serde_json::from_str(s).ok())
            .register::<serde_json::Value, String, _>(|j| match j {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    }

    fn insert(&mut self, from: TypeKey, to: TypeKey, convert: ConvertFn) {
        let edge = Edge { from, to, convert };
        match self.index.get(&(from.id(), to.id())) {
            Some(&slot) => {
                warn!(
                    from = from.name(),
                    to = to.name(),
                    "duplicate type converter registration; last registration wins"
                );
                self.edges[slot] = edge;
            }
            None => {
                self.index.insert((from.id(), to.id()), self.edges.len());
                self.edges.push(edge);
            }
        }
    }

    /// Freezes the registry, resolving converter paths breadth-first.
    #[must_use]
    pub fn build(self) -> TypeConverterRegistry {
        let mut adjacency: HashMap<TypeId, Vec<usize>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            adjacency.entry(edge.from.id()).or_default().push(i);
        }

        let mut paths: HashMap<(TypeId, TypeId), Arc<[ConvertFn]>> = HashMap::new();
        for &source in adjacency.keys() {
            // BFS over edge indices; the first time a type is reached is the
            // shortest path, ties broken by registration order.
            let mut reached: HashMap<TypeId, Vec<usize>> = HashMap::new();
            reached.insert(source, Vec::new());
            let mut queue = VecDeque::from([source]);
            while let Some(current) = queue.pop_front() {
                let depth = reached[&current].len();
                if depth >= self.max_depth {
                    continue;
                }
                for &edge_idx in adjacency.get(&current).into_iter().flatten() {
                    let next = self.edges[edge_idx].to.id();
                    if reached.contains_key(&next) {
                        continue;
                    }
                    let mut path = reached[&current].clone();
                    path.push(edge_idx);
                    reached.insert(next, path);
                    queue.push_back(next);
                }
            }
            for (target, path) in reached {
                if target == source {
                    continue;
                }
                let hops: Vec<ConvertFn> = path
                    .iter()
                    .map(|&i| Arc::clone(&self.edges[i].convert))
                    .collect();
                paths.insert((source, target), hops.into());
            }
        }

        TypeConverterRegistry {
            paths,
            edge_count: self.edges.len(),
            max_depth: self.max_depth,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable converter registry shared by all routes.
pub struct TypeConverterRegistry {
    paths: HashMap<(TypeId, TypeId), Arc<[ConvertFn]>>,
    edge_count: usize,
    max_depth: usize,
}

impl TypeConverterRegistry {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> TypeConverterRegistryBuilder {
        TypeConverterRegistryBuilder::new()
    }

    /// A registry holding only the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::builder().with_defaults().build()
    }

    /// Converts `value` to `target`. A value already of the target type is
    /// returned as-is. `None` means no path exists or a hop declined.
    #[must_use]
    pub fn convert(&self, value: &Value, target: TypeKey, exchange: Option<&Exchange>) -> Option<Value> {
        if value.type_key() == target {
            return Some(value.clone());
        }
        let path = self.paths.get(&(value.type_key().id(), target.id()))?;
        let mut current = value.clone();
        for hop in path.iter() {
            current = hop(&current, exchange)?;
        }
        Some(current)
    }

    /// Typed form of [`convert`](Self::convert).
    ///
    /// # Errors
    ///
    /// Returns `ConversionUnavailable` when no conversion succeeds.
    pub fn convert_to<T>(&self, value: &Value, exchange: Option<&Exchange>) -> Result<T, ConversionUnavailable>
    where
        T: Any + Clone + Send + Sync,
    {
        let unavailable = || ConversionUnavailable {
            from: value.type_key().name(),
            to: std::any::type_name::<T>(),
        };
        self.convert(value, TypeKey::of::<T>(), exchange)
            .and_then(|v| v.downcast_ref::<T>().cloned())
            .ok_or_else(unavailable)
    }

    /// Returns `true` if a path from `from` to `to` was resolved.
    #[must_use]
    pub fn has_path(&self, from: TypeKey, to: TypeKey) -> bool {
        from == to || self.paths.contains_key(&(from.id(), to.id()))
    }

    /// Number of registered converters (distinct type pairs).
    #[must_use]
    pub fn converter_count(&self) -> usize {
        self.edge_count
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for TypeConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeConverterRegistry")
            .field("converters", &self.edge_count)
            .field("paths", &self.paths.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[derive(Debug, Clone, PartialEq)]
    struct Celsius(f64);
    #[derive(Debug, Clone, PartialEq)]
    struct Kelvin(f64);
    #[derive(Debug, Clone, PartialEq)]
    struct Label(String);
    #[derive(Debug, Clone, PartialEq)]
    struct Badge(String);

    fn a_to_b() -> TypeConverterRegistryBuilder {
        TypeConverterRegistry::builder().register::<Celsius, Kelvin, _>(|c| Some(Kelvin(c.0 + 273.15)))
    }

    #[test]
    fn direct_conversion() {
        let registry = a_to_b().build();
        let k: Kelvin = registry.convert_to(&Value::new(Celsius(0.0)), None).unwrap();
        assert!((k.0 - 273.15).abs() < f64::EPSILON);
    }

    #[test]
    fn two_hop_fallback_succeeds() {
        let registry = a_to_b()
            .register::<Kelvin, Label, _>(|k| Some(Label(format!("{:.2}K", k.0))))
            .build();
        let label: Label = registry.convert_to(&Value::new(Celsius(1.0)), None).unwrap();
        assert_eq!(label, Label("274.15K".to_string()));
    }

    #[test]
    fn missing_link_fails_gracefully() {
        let only_second = TypeConverterRegistry::builder()
            .register::<Kelvin, Label, _>(|k| Some(Label(k.0.to_string())))
            .build();
        let value = Value::new(Celsius(1.0));
        assert!(only_second.convert(&value, TypeKey::of::<Label>(), None).is_none());

        let only_first = a_to_b().build();
        let err = only_first.convert_to::<Label>(&value, None).unwrap_err();
        assert!(err.from.ends_with("Celsius"));
        assert!(err.to.ends_with("Label"));
    }

    #[test]
    fn search_depth_is_bounded() {
        let chain = a_to_b()
            .register::<Kelvin, Label, _>(|k| Some(Label(k.0.to_string())))
            .register::<Label, Badge, _>(|l| Some(Badge(l.0.clone())))
            .register::<Badge, String, _>(|b| Some(b.0.clone()));
        let value = Value::new(Celsius(0.0));

        let shallow = chain.build();
        assert!(shallow.has_path(TypeKey::of::<Celsius>(), TypeKey::of::<Badge>()));
        assert!(!shallow.has_path(TypeKey::of::<Celsius>(), TypeKey::of::<String>()));
        assert!(shallow.convert_to::<String>(&value, None).is_err());
    }

    #[test]
    fn deeper_search_when_configured() {
        let registry = a_to_b()
            .register::<Kelvin, Label, _>(|k| Some(Label(k.0.to_string())))
            .register::<Label, Badge, _>(|l| Some(Badge(l.0.clone())))
            .register::<Badge, String, _>(|b| Some(b.0.clone()))
            .with_max_depth(4)
            .build();
        assert_eq!(
            registry.convert_to::<String>(&Value::new(Celsius(0.0)), None).unwrap(),
            "273.15"
        );
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let registry = TypeConverterRegistry::builder()
            .register::<Celsius, Kelvin, _>(|_| Some(Kelvin(1.0)))
            .register::<Celsius, Kelvin, _>(|_| Some(Kelvin(2.0)))
            .build();
        assert_eq!(registry.converter_count(), 1);
        let k: Kelvin = registry.convert_to(&Value::new(Celsius(0.0)), None).unwrap();
        assert_eq!(k, Kelvin(2.0));
    }

    #[test]
    fn declining_converter_is_not_ok() {
        let registry = TypeConverterRegistry::with_defaults();
        assert!(registry.convert_to::<i64>(&Value::from("not a number"), None).is_err());
        assert_eq!(registry.convert_to::<i64>(&Value::from(" 17 "), None), Ok(17));
    }

    #[test]
    fn identity_conversion_shares_value() {
        let registry = TypeConverterRegistry::builder().build();
        let value = Value::from("same");
        let out = registry.convert(&value, TypeKey::of::<String>(), None).unwrap();
        assert!(out.ptr_eq(&value));
    }

    #[test]
    fn defaults_reach_json_through_bytes() {
        let registry = TypeConverterRegistry::with_defaults();
        let json: serde_json::Value = registry
            .convert_to(&Value::new(Bytes::from_static(br#"{"a":1}"#)), None)
            .unwrap();
        assert_eq!(json["a"], 1);
    }

    #[test]
    fn exchange_aware_converter_needs_exchange() {
        let registry = TypeConverterRegistry::builder()
            .register_with_exchange::<Label, String, _>(|label, exchange| {
                let prefix = exchange.property("prefix")?.as_str()?.to_string();
                Some(format!("{prefix}{}", label.0))
            })
            .build();
        let value = Value::new(Label("x".into()));
        assert!(registry.convert_to::<String>(&value, None).is_err());

        let mut ex = Exchange::with_message(Message::new());
        ex.set_property("prefix", "id-");
        assert_eq!(registry.convert_to::<String>(&value, Some(&ex)).unwrap(), "id-x");
    }

    proptest::proptest! {
        #[test]
        fn registration_order_does_not_change_two_hop_result(celsius in -500.0f64..500.0, reversed: bool) {
            let to_kelvin = |c: &Celsius| Some(Kelvin(c.0 + 273.15));
            let to_label = |k: &Kelvin| Some(Label(format!("{:.2}K", k.0)));
            let builder = TypeConverterRegistry::builder();
            let registry = if reversed {
                builder.register::<Kelvin, Label, _>(to_label).register::<Celsius, Kelvin, _>(to_kelvin)
            } else {
                builder.register::<Celsius, Kelvin, _>(to_kelvin).register::<Kelvin, Label, _>(to_label)
            }
            .build();

            let label: Label = registry.convert_to(&Value::new(Celsius(celsius)), None).unwrap();
            proptest::prop_assert_eq!(label, Label(format!("{:.2}K", celsius + 273.15)));
        }
    }
}

//! Process-wide serializer registry.
//!
//! Maps a class alias string to the strategy used to read/write objects
//! of that class: a custom [`Externalizer`], a reflection-default
//! [`FieldLayout`], or the fully dynamic fallback. Registration swaps in
//! a new immutable snapshot under a write lock; resolution clones the
//! current snapshot under a read lock and searches without further
//! locking, so readers never observe a half-applied registration.
//!
//! Resolution order for an alias: custom serializer, then registered
//! default layout, then a default layout synthesized through the
//! pluggable [`FieldSource`] capability, then [`Serializer::Dynamic`].
//! Duplicate-alias conflicts are reported at registration time, not
//! deferred to first use.

use crate::error::{CodecError, Result};
use crate::remap::FieldLayout;
use crate::value::ObjectValue;
use crate::{Reader, Writer};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Custom per-class serializer SPI. An externalizable class owns its
/// entire wire payload; the codec only frames it with the trait.
pub trait Externalizer: Send + Sync {
    /// Write the payload of `obj` through the writer's primitives.
    fn write_object(&self, writer: &mut Writer, obj: &ObjectValue) -> Result<()>;

    /// Read the payload back into `obj` through the reader's primitives.
    fn read_object(&self, reader: &mut Reader<'_>, obj: &mut ObjectValue) -> Result<()>;
}

/// Member-enumeration capability for the reflection-default path:
/// answers "the ordered public field list of the native type bound to
/// alias A", or `None` when no native type is associated with the alias.
pub trait FieldSource: Send + Sync {
    fn describe_fields(&self, alias: &str) -> Option<Vec<String>>;
}

/// Per-class serialization strategy.
#[derive(Clone)]
pub enum Serializer {
    /// Positional declared-field list.
    Default(Arc<FieldLayout>),
    /// The class supplies its own read/write.
    Custom(Arc<dyn Externalizer>),
    /// Unknown alias: generic property bag built from whatever the wire
    /// carries.
    Dynamic,
}

impl Serializer {
    /// Whether two bindings for one alias are interchangeable. Default
    /// layouts compare by field list, custom serializers by identity.
    fn same_binding(&self, other: &Serializer) -> bool {
        match (self, other) {
            (Serializer::Default(a), Serializer::Default(b)) => {
                a.fields() == b.fields() && a.is_strict() == b.is_strict()
            }
            (Serializer::Custom(a), Serializer::Custom(b)) => Arc::ptr_eq(a, b),
            (Serializer::Dynamic, Serializer::Dynamic) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serializer::Default(layout) => f.debug_tuple("Default").field(layout).finish(),
            Serializer::Custom(_) => f.write_str("Custom(..)"),
            Serializer::Dynamic => f.write_str("Dynamic"),
        }
    }
}

/// One declarative alias binding, as produced by a startup scan of type
/// metadata or written out by hand.
pub struct ClassDescriptor {
    pub alias: String,
    pub serializer: Serializer,
    /// Native type the alias is bound to, when there is one.
    pub native_type: Option<TypeId>,
}

impl ClassDescriptor {
    pub fn new(alias: impl Into<String>, serializer: Serializer) -> Self {
        ClassDescriptor {
            alias: alias.into(),
            serializer,
            native_type: None,
        }
    }

    /// Bind the alias to native type `T` as well, so
    /// [`SerializerRegistry::alias_for`] can answer for it.
    pub fn for_type<T: 'static>(alias: impl Into<String>, serializer: Serializer) -> Self {
        ClassDescriptor {
            alias: alias.into(),
            serializer,
            native_type: Some(TypeId::of::<T>()),
        }
    }
}

#[derive(Default)]
struct Snapshot {
    by_alias: FxHashMap<Arc<str>, Serializer>,
    by_type: FxHashMap<TypeId, Arc<str>>,
    field_source: Option<Arc<dyn FieldSource>>,
}

impl Snapshot {
    fn duplicate(&self) -> Snapshot {
        Snapshot {
            by_alias: self.by_alias.clone(),
            by_type: self.by_type.clone(),
            field_source: self.field_source.clone(),
        }
    }
}

/// Alias → serializer registry. One process-wide instance is available
/// through [`SerializerRegistry::global`]; Writers and Readers can also
/// be constructed against a private instance.
pub struct SerializerRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        SerializerRegistry {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<SerializerRegistry> {
        static GLOBAL: OnceLock<Arc<SerializerRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(SerializerRegistry::new()))
            .clone()
    }

    /// Register a serializer for an alias. Re-registering an equal
    /// binding is a no-op; a conflicting binding is an error.
    pub fn register(&self, alias: impl Into<String>, serializer: Serializer) -> Result<()> {
        self.install([ClassDescriptor::new(alias, serializer)])
    }

    /// Register a serializer for an alias bound to native type `T`.
    pub fn register_type<T: 'static>(
        &self,
        alias: impl Into<String>,
        serializer: Serializer,
    ) -> Result<()> {
        self.install([ClassDescriptor::for_type::<T>(alias, serializer)])
    }

    /// Apply a batch of descriptors under one registration lock, swapping
    /// in a single new snapshot. Fails on the first conflict without
    /// publishing anything.
    pub fn install(&self, descriptors: impl IntoIterator<Item = ClassDescriptor>) -> Result<()> {
        let mut guard = self.snapshot.write();
        let mut next = guard.duplicate();
        for desc in descriptors {
            let alias: Arc<str> = Arc::from(desc.alias.as_str());
            match next.by_alias.entry(alias.clone()) {
                Entry::Occupied(entry) => {
                    if !entry.get().same_binding(&desc.serializer) {
                        return Err(CodecError::DuplicateAlias(desc.alias));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(desc.serializer);
                }
            }
            if let Some(type_id) = desc.native_type {
                match next.by_type.entry(type_id) {
                    Entry::Occupied(entry) => {
                        if entry.get() != &alias {
                            return Err(CodecError::DuplicateAlias(desc.alias));
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(alias);
                    }
                }
            }
        }
        *guard = Arc::new(next);
        Ok(())
    }

    /// Install the member-enumeration capability used to synthesize
    /// default layouts for aliases with no explicit registration.
    pub fn set_field_source(&self, source: Arc<dyn FieldSource>) {
        let mut guard = self.snapshot.write();
        let mut next = guard.duplicate();
        next.field_source = Some(source);
        *guard = Arc::new(next);
    }

    /// Resolve the serializer for an alias. Never fails: an unknown alias
    /// resolves to the dynamic fallback.
    pub fn resolve(&self, alias: &str) -> Serializer {
        let snap = self.snapshot.read().clone();
        if let Some(serializer) = snap.by_alias.get(alias) {
            return serializer.clone();
        }
        if let Some(source) = &snap.field_source {
            if let Some(fields) = source.describe_fields(alias) {
                let layout =
                    FieldLayout::new(fields.iter().map(|f| Arc::from(f.as_str())).collect());
                let serializer = Serializer::Default(layout);
                // Cache the synthesized layout so later resolves skip the
                // field source. A concurrent equal insert keeps the first.
                let mut guard = self.snapshot.write();
                if !guard.by_alias.contains_key(alias) {
                    let mut next = guard.duplicate();
                    next.by_alias.insert(Arc::from(alias), serializer.clone());
                    *guard = Arc::new(next);
                }
                return serializer;
            }
        }
        Serializer::Dynamic
    }

    /// Alias bound to native type `T`, if registered.
    pub fn alias_for<T: 'static>(&self) -> Option<Arc<str>> {
        self.snapshot.read().by_type.get(&TypeId::of::<T>()).cloned()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFields(Vec<(&'static str, Vec<&'static str>)>);

    impl FieldSource for FixedFields {
        fn describe_fields(&self, alias: &str) -> Option<Vec<String>> {
            self.0
                .iter()
                .find(|(a, _)| *a == alias)
                .map(|(_, fields)| fields.iter().map(|f| f.to_string()).collect())
        }
    }

    fn layout(fields: &[&str]) -> Arc<FieldLayout> {
        FieldLayout::new(fields.iter().map(|f| Arc::from(*f)).collect())
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = SerializerRegistry::new();
        registry
            .register("app.Point", Serializer::Default(layout(&["x", "y"])))
            .unwrap();

        match registry.resolve("app.Point") {
            Serializer::Default(l) => {
                assert_eq!(l.fields().len(), 2);
                assert_eq!(l.fields()[0].as_ref(), "x");
            }
            other => panic!("expected Default, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_alias_is_dynamic() {
        let registry = SerializerRegistry::new();
        assert!(matches!(registry.resolve("nope"), Serializer::Dynamic));
    }

    #[test]
    fn test_duplicate_alias_conflict() {
        let registry = SerializerRegistry::new();
        registry
            .register("app.Point", Serializer::Default(layout(&["x", "y"])))
            .unwrap();

        // Equal binding: idempotent
        registry
            .register("app.Point", Serializer::Default(layout(&["x", "y"])))
            .unwrap();

        // Conflicting binding: registration-time error
        assert!(matches!(
            registry.register("app.Point", Serializer::Default(layout(&["x"]))),
            Err(CodecError::DuplicateAlias(_))
        ));
    }

    #[test]
    fn test_field_source_synthesis_and_caching() {
        let registry = SerializerRegistry::new();
        registry.set_field_source(Arc::new(FixedFields(vec![(
            "app.Size",
            vec!["w", "h"],
        )])));

        let first = match registry.resolve("app.Size") {
            Serializer::Default(l) => l,
            other => panic!("expected Default, got {:?}", other),
        };
        assert_eq!(first.fields()[1].as_ref(), "h");

        // Second resolve hits the cached registration
        let second = match registry.resolve("app.Size") {
            Serializer::Default(l) => l,
            other => panic!("expected Default, got {:?}", other),
        };
        assert!(Arc::ptr_eq(&first, &second));

        // Aliases the source does not know stay dynamic
        assert!(matches!(registry.resolve("app.Other"), Serializer::Dynamic));
    }

    #[test]
    fn test_type_alias_binding() {
        struct NativePoint;

        let registry = SerializerRegistry::new();
        registry
            .register_type::<NativePoint>("app.Point", Serializer::Default(layout(&["x", "y"])))
            .unwrap();

        assert_eq!(
            registry.alias_for::<NativePoint>().as_deref(),
            Some("app.Point")
        );
        assert_eq!(registry.alias_for::<String>(), None);
    }

    #[test]
    fn test_install_batch_is_atomic() {
        let registry = SerializerRegistry::new();
        registry
            .register("app.Keep", Serializer::Default(layout(&["a"])))
            .unwrap();

        let result = registry.install([
            ClassDescriptor::new("app.New", Serializer::Dynamic),
            // Conflicts with the existing binding
            ClassDescriptor::new("app.Keep", Serializer::Default(layout(&["b"]))),
        ]);
        assert!(matches!(result, Err(CodecError::DuplicateAlias(_))));

        // Nothing from the failed batch was published
        assert!(matches!(registry.resolve("app.New"), Serializer::Dynamic));
        match registry.resolve("app.Keep") {
            Serializer::Default(l) => assert_eq!(l.fields()[0].as_ref(), "a"),
            other => panic!("expected Default, got {:?}", other),
        }
    }
}

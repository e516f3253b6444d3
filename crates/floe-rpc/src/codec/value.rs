use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

use super::{InputStream, OutputStream};
use crate::error::{Error, Result};

/// A class instance that can travel by value.
///
/// Implementations write their slices most-derived first:
///
/// ```ignore
/// out.start_slice("::Demo::Derived", None, false);
/// out.write_string(&self.extra);
/// out.end_slice();
/// out.start_slice("::Demo::Base", None, true);
/// out.write_int(self.id);
/// out.end_slice();
/// ```
pub trait Value: Any + Send + Sync + fmt::Debug {
    /// Most-derived type id, e.g. `::Demo::Derived`.
    fn ice_id(&self) -> &str;

    /// Writes every slice of the instance.
    fn write_slices(&self, out: &mut OutputStream);

    /// For downcasting to the concrete class.
    fn as_any(&self) -> &dyn Any;

    /// Slices preserved from a newer peer, if any.
    fn sliced_data(&self) -> Option<&[SliceInfo]> {
        None
    }
}

/// Shared, immutable handle to a decoded or to-be-encoded instance.
pub type ValueRef = Arc<dyn Value>;

/// Downcasts a value, looking through a [`SlicedValue`] wrapper.
pub fn value_downcast<T: Value>(v: &ValueRef) -> Option<&T> {
    let any = v.as_any();
    if let Some(t) = any.downcast_ref::<T>() {
        return Some(t);
    }
    any.downcast_ref::<SlicedValue>()
        .and_then(|s| s.inner().as_any().downcast_ref::<T>())
}

/// One slice of an instance whose type was not known to the decoder.
#[derive(Debug, Clone)]
pub struct SliceInfo {
    /// Type id of the slice; empty when only a compact id was sent.
    pub type_id: String,
    /// Compact type id, when the sender used one.
    pub compact_id: Option<i32>,
    /// Slice data, without the optional end marker.
    pub bytes: Bytes,
    /// Instances referenced from the slice's indirection table, in order.
    pub instances: Vec<ValueRef>,
    /// Whether optional members follow the required ones.
    pub has_optional_members: bool,
    /// Whether this is the base-most slice.
    pub is_last_slice: bool,
}

/// An instance none of whose slices had a registered factory. Re-encoding
/// it reproduces the original slices.
#[derive(Debug, Clone)]
pub struct UnknownSlicedValue {
    type_id: String,
    slices: Vec<SliceInfo>,
}

impl UnknownSlicedValue {
    /// Keeps the slices for re-encoding.
    pub fn new(type_id: String, slices: Vec<SliceInfo>) -> Self {
        UnknownSlicedValue { type_id, slices }
    }

    /// The preserved slices, most-derived first.
    pub fn slices(&self) -> &[SliceInfo] {
        &self.slices
    }
}

impl Value for UnknownSlicedValue {
    fn ice_id(&self) -> &str {
        &self.type_id
    }

    fn write_slices(&self, out: &mut OutputStream) {
        out.write_preserved_slices(&self.slices);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn sliced_data(&self) -> Option<&[SliceInfo]> {
        Some(&self.slices)
    }
}

/// A known instance decoded from a more-derived unknown type. The unknown
/// derived slices are kept and written back in front of the known ones.
#[derive(Debug, Clone)]
pub struct SlicedValue {
    inner: ValueRef,
    slices: Vec<SliceInfo>,
}

impl SlicedValue {
    /// Wraps `inner` with the slices no factory knew.
    pub fn new(inner: ValueRef, slices: Vec<SliceInfo>) -> Self {
        SlicedValue { inner, slices }
    }

    /// The instance built by the most-derived known factory.
    pub fn inner(&self) -> &ValueRef {
        &self.inner
    }
}

impl Value for SlicedValue {
    fn ice_id(&self) -> &str {
        self.slices
            .first()
            .map(|s| s.type_id.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.inner.ice_id())
    }

    fn write_slices(&self, out: &mut OutputStream) {
        out.write_preserved_slices(&self.slices);
        self.inner.write_slices(out);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn sliced_data(&self) -> Option<&[SliceInfo]> {
        Some(&self.slices)
    }
}

/// Builds an instance from a stream positioned on its first known slice.
/// The factory calls `start_slice`/`end_slice` once per slice it reads.
pub type ValueFactory = Arc<dyn Fn(&mut InputStream) -> Result<ValueRef> + Send + Sync>;

/// Value factories by type id, plus compact id aliases.
#[derive(Default)]
pub struct ValueFactoryRegistry {
    factories: RwLock<HashMap<String, ValueFactory>>,
    compact_ids: RwLock<HashMap<i32, String>>,
}

impl ValueFactoryRegistry {
    /// Registers a factory; a type id can only be registered once.
    pub fn add<F>(&self, type_id: &str, factory: F) -> Result<()>
    where
        F: Fn(&mut InputStream) -> Result<ValueRef> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(type_id) {
            return Err(Error::AlreadyRegistered {
                kind: "value factory",
                id: type_id.to_string(),
            });
        }
        factories.insert(type_id.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Removes the factory for `type_id`.
    pub fn remove(&self, type_id: &str) -> Result<()> {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        factories
            .remove(type_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotRegistered {
                kind: "value factory",
                id: type_id.to_string(),
            })
    }

    /// The factory for `type_id`.
    pub fn find(&self, type_id: &str) -> Option<ValueFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_id)
            .cloned()
    }

    /// Maps a compact id to its full type id.
    pub fn add_compact_id(&self, compact_id: i32, type_id: &str) {
        self.compact_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(compact_id, type_id.to_string());
    }

    /// The type id registered for `compact_id`.
    pub fn resolve_compact_id(&self, compact_id: i32) -> Option<String> {
        self.compact_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&compact_id)
            .cloned()
    }
}

impl fmt::Debug for ValueFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ValueFactoryRegistry")
            .field("type_ids", &factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodeContext, FormatType};
    use crate::version::{ENCODING_1_0, ENCODING_1_1};

    #[derive(Debug)]
    struct Base {
        id: i32,
        child: Option<ValueRef>,
    }

    impl Value for Base {
        fn ice_id(&self) -> &str {
            "::Test::Base"
        }

        fn write_slices(&self, out: &mut OutputStream) {
            out.start_slice("::Test::Base", None, true);
            out.write_int(self.id);
            out.write_value(self.child.as_ref());
            out.end_slice();
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn read_base(input: &mut InputStream) -> Result<ValueRef> {
        input.start_slice()?;
        let id = input.read_int()?;
        let child = input.read_value()?;
        input.end_slice()?;
        Ok(Arc::new(Base { id, child }))
    }

    #[derive(Debug)]
    struct Derived {
        base_id: i32,
        label: String,
        note: Option<String>,
    }

    impl Value for Derived {
        fn ice_id(&self) -> &str {
            "::Test::Derived"
        }

        fn write_slices(&self, out: &mut OutputStream) {
            out.start_slice("::Test::Derived", None, false);
            out.write_string(&self.label);
            out.write_optional_value(1, self.note.as_ref());
            out.end_slice();
            out.start_slice("::Test::Base", None, true);
            out.write_int(self.base_id);
            out.write_value(None);
            out.end_slice();
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn context_with_base() -> DecodeContext {
        let context = DecodeContext::default();
        context.values.add("::Test::Base", read_base).unwrap();
        context
    }

    fn encode(v: &ValueRef, format: FormatType) -> Bytes {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.set_format(format);
        out.write_value(Some(v));
        out.finished().unwrap()
    }

    #[test]
    fn test_known_value_roundtrip() {
        let leaf: ValueRef = Arc::new(Base { id: 2, child: None });
        let root: ValueRef = Arc::new(Base {
            id: 1,
            child: Some(leaf),
        });
        let bytes = encode(&root, FormatType::Sliced);
        let mut input = InputStream::with_context(bytes, ENCODING_1_1, context_with_base());
        let decoded = input.read_value().unwrap().unwrap();
        let base = value_downcast::<Base>(&decoded).unwrap();
        assert_eq!(base.id, 1);
        let child = base.child.as_ref().unwrap();
        assert_eq!(value_downcast::<Base>(child).unwrap().id, 2);
        assert!(input.is_at_end());
    }

    #[test]
    fn test_sliced_layout_bytes() {
        let v: ValueRef = Arc::new(Base { id: 7, child: None });
        let bytes = encode(&v, FormatType::Sliced);
        let mut expected = vec![1u8, 1 | 16 | 32, 12];
        expected.extend_from_slice(b"::Test::Base");
        expected.extend_from_slice(&[9, 0, 0, 0, 7, 0, 0, 0, 0]);
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_shared_instance_decodes_to_same_arc() {
        let shared: ValueRef = Arc::new(Base { id: 9, child: None });
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_value(Some(&shared));
        out.write_value(Some(&shared));
        let mut input =
            InputStream::with_context(out.finished().unwrap(), ENCODING_1_1, context_with_base());
        let a = input.read_value().unwrap().unwrap();
        let b = input.read_value().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_value_reencodes_identically() {
        let leaf: ValueRef = Arc::new(Base { id: 3, child: None });
        let root: ValueRef = Arc::new(Base {
            id: 4,
            child: Some(leaf),
        });
        let bytes = encode(&root, FormatType::Sliced);
        let mut input = InputStream::new(bytes.clone(), ENCODING_1_1);
        let decoded = input.read_value().unwrap().unwrap();
        let unknown = decoded.as_any().downcast_ref::<UnknownSlicedValue>().unwrap();
        assert_eq!(unknown.ice_id(), "::Test::Base");
        assert_eq!(unknown.slices().len(), 1);
        assert_eq!(unknown.slices()[0].instances.len(), 1);
        assert_eq!(encode(&decoded, FormatType::Sliced), bytes);
    }

    #[test]
    fn test_unknown_derived_keeps_known_base() {
        let v: ValueRef = Arc::new(Derived {
            base_id: 11,
            label: "extra".into(),
            note: Some("n".into()),
        });
        let bytes = encode(&v, FormatType::Sliced);
        let mut input =
            InputStream::with_context(bytes.clone(), ENCODING_1_1, context_with_base());
        let decoded = input.read_value().unwrap().unwrap();
        assert_eq!(decoded.ice_id(), "::Test::Derived");
        assert_eq!(value_downcast::<Base>(&decoded).unwrap().id, 11);
        let slices = decoded.sliced_data().unwrap();
        assert_eq!(slices.len(), 1);
        assert!(slices[0].has_optional_members);
        assert_eq!(encode(&decoded, FormatType::Sliced), bytes);
    }

    #[test]
    fn test_compact_unknown_type_needs_factory() {
        let v: ValueRef = Arc::new(Base { id: 1, child: None });
        let bytes = encode(&v, FormatType::Compact);
        let mut input = InputStream::new(bytes, ENCODING_1_1);
        assert!(matches!(
            input.read_value(),
            Err(Error::NoValueFactory { .. })
        ));
    }

    #[test]
    fn test_compact_known_type_decodes() {
        let leaf: ValueRef = Arc::new(Base { id: 5, child: None });
        let root: ValueRef = Arc::new(Base {
            id: 6,
            child: Some(leaf),
        });
        let bytes = encode(&root, FormatType::Compact);
        let mut input = InputStream::with_context(bytes, ENCODING_1_1, context_with_base());
        let decoded = input.read_value().unwrap().unwrap();
        let base = value_downcast::<Base>(&decoded).unwrap();
        assert_eq!(base.id, 6);
        assert_eq!(
            value_downcast::<Base>(base.child.as_ref().unwrap()).unwrap().id,
            5
        );
    }

    #[test]
    fn test_null_value() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_value(None);
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        assert!(input.read_value().unwrap().is_none());
    }

    #[test]
    fn test_classes_rejected_under_1_0() {
        let v: ValueRef = Arc::new(Base { id: 1, child: None });
        let mut out = OutputStream::new(ENCODING_1_0);
        out.write_value(Some(&v));
        assert!(matches!(
            out.finished(),
            Err(Error::FeatureNotSupported { .. })
        ));
    }

    #[test]
    fn test_back_reference_to_unfinished_instance_rejected() {
        // Compact layout: instance 2 whose child member refers back to itself.
        let mut raw = vec![1u8, 1 | 32, 12];
        raw.extend_from_slice(b"::Test::Base");
        raw.extend_from_slice(&[1, 0, 0, 0]);
        raw.push(2);
        let mut input =
            InputStream::with_context(Bytes::from(raw), ENCODING_1_1, context_with_base());
        let err = input.read_value().unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_registry_duplicates() {
        let registry = ValueFactoryRegistry::default();
        registry.add("::Test::Base", read_base).unwrap();
        assert!(matches!(
            registry.add("::Test::Base", read_base),
            Err(Error::AlreadyRegistered { .. })
        ));
        registry.remove("::Test::Base").unwrap();
        assert!(registry.find("::Test::Base").is_none());
        registry.add_compact_id(7, "::Test::Base");
        assert_eq!(registry.resolve_compact_id(7).as_deref(), Some("::Test::Base"));
    }
}

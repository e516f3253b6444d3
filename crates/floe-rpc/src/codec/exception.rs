use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use super::{InputStream, OutputStream, SliceInfo};
use crate::error::{Error, Result};

/// A typed application fault raised by a servant and sent back to the caller.
pub trait UserException: Any + Send + Sync + fmt::Debug {
    /// Most-derived type id, e.g. `::Demo::NotFound`.
    fn ice_id(&self) -> &str;

    /// Writes every slice, most-derived first, with `start_slice` and
    /// `end_slice`.
    fn write_slices(&self, out: &mut OutputStream);

    /// For downcasting to the concrete exception.
    fn as_any(&self) -> &dyn Any;
}

/// A user exception whose type id has no registered factory.
#[derive(Debug, Clone)]
pub struct UnknownUserException {
    type_id: String,
    slices: Vec<SliceInfo>,
}

impl UnknownUserException {
    /// Keeps the slices for re-encoding.
    pub fn new(type_id: String, slices: Vec<SliceInfo>) -> Self {
        UnknownUserException { type_id, slices }
    }

    /// The preserved slices, most derived first.
    pub fn slices(&self) -> &[SliceInfo] {
        &self.slices
    }
}

impl UserException for UnknownUserException {
    fn ice_id(&self) -> &str {
        &self.type_id
    }

    fn write_slices(&self, out: &mut OutputStream) {
        out.write_preserved_slices(&self.slices);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a user exception from a stream positioned on its first known slice.
pub type ExceptionFactory =
    Arc<dyn Fn(&mut InputStream) -> Result<Arc<dyn UserException>> + Send + Sync>;

/// User exception factories by type id.
#[derive(Default)]
pub struct ExceptionFactoryRegistry {
    factories: RwLock<HashMap<String, ExceptionFactory>>,
}

impl ExceptionFactoryRegistry {
    /// Registers the factory for `type_id`; a second one is refused.
    pub fn add<F>(&self, type_id: &str, factory: F) -> Result<()>
    where
        F: Fn(&mut InputStream) -> Result<Arc<dyn UserException>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(type_id) {
            return Err(Error::AlreadyRegistered {
                kind: "exception factory",
                id: type_id.to_string(),
            });
        }
        factories.insert(type_id.to_string(), Arc::new(factory));
        Ok(())
    }

    /// The factory for `type_id`.
    pub fn find(&self, type_id: &str) -> Option<ExceptionFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_id)
            .cloned()
    }
}

impl fmt::Debug for ExceptionFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ExceptionFactoryRegistry")
            .field("type_ids", &factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

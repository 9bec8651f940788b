//! Typed document codecs and the per-collection registry.
//!
//! A codec turns server documents into strongly-typed values and back. The
//! store holds decoded values type-erased behind `TypedDocument`; callers
//! downcast with the concrete type they registered.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::document::{Document, DocumentError};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec json failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encoded value is not a document: {0}")]
    Document(#[from] DocumentError),
    #[error("value is not the registered type for this collection")]
    TypeMismatch,
}

/// Object-safe view of a decoded document value.
pub trait TypedDocument: Any + Send + fmt::Debug {
    fn clone_boxed(&self) -> Box<dyn TypedDocument>;
    fn as_any(&self) -> &dyn Any;
}

impl<T> TypedDocument for T
where
    T: Any + Send + Clone + fmt::Debug,
{
    fn clone_boxed(&self) -> Box<dyn TypedDocument> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub trait Codec: Send {
    fn decode(&self, doc: &Document) -> Result<Box<dyn TypedDocument>, CodecError>;
    fn encode(&self, value: &dyn TypedDocument) -> Result<Document, CodecError>;
}

/// `serde_json`-backed codec for a concrete document type.
pub struct JsonCodec<T> {
    _type: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Any + Send + Clone + fmt::Debug,
{
    fn decode(&self, doc: &Document) -> Result<Box<dyn TypedDocument>, CodecError> {
        let value: T = serde_json::from_value(doc.to_value())?;
        Ok(Box::new(value))
    }

    fn encode(&self, value: &dyn TypedDocument) -> Result<Document, CodecError> {
        let concrete = value
            .as_any()
            .downcast_ref::<T>()
            .ok_or(CodecError::TypeMismatch)?;
        Ok(Document::from_value(serde_json::to_value(concrete)?)?)
    }
}

/// Collection name → codec. At most one codec per collection; registering a
/// second replaces the first and is reported to the caller.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Box<dyn Codec>>,
}

impl CodecRegistry {
    /// Returns true when an earlier codec was replaced.
    pub fn register(&mut self, collection: impl Into<String>, codec: Box<dyn Codec>) -> bool {
        self.codecs.insert(collection.into(), codec).is_some()
    }

    pub fn register_type<T>(&mut self, collection: impl Into<String>) -> bool
    where
        T: Serialize + DeserializeOwned + Any + Send + Clone + fmt::Debug,
    {
        self.register(collection, Box::new(JsonCodec::<T>::new()))
    }

    pub fn get(&self, collection: &str) -> Option<&dyn Codec> {
        self.codecs.get(collection).map(Box::as_ref)
    }

    pub fn is_registered(&self, collection: &str) -> bool {
        self.codecs.contains_key(collection)
    }
}

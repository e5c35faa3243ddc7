use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// Validates a raw value, returning the (possibly normalized) value or a
/// human-readable failure.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: Value) -> Result<Value, String>;
}

impl<F> SchemaValidator for F
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    fn validate(&self, value: Value) -> Result<Value, String> {
        self(value)
    }
}

/// Optional validators for message metadata and per-namespace data parts.
/// A missing validator means the value is accepted as-is.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    metadata: Option<Arc<dyn SchemaValidator>>,
    data: HashMap<String, Arc<dyn SchemaValidator>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata_schema(mut self, validator: impl SchemaValidator + 'static) -> Self {
        self.metadata = Some(Arc::new(validator));
        self
    }

    pub fn with_data_schema(
        mut self,
        name: impl Into<String>,
        validator: impl SchemaValidator + 'static,
    ) -> Self {
        self.data.insert(name.into(), Arc::new(validator));
        self
    }

    pub fn validate_metadata(&self, value: Value) -> ChatResult<Value> {
        match self.metadata.as_ref() {
            Some(validator) => validator
                .validate(value)
                .map_err(|reason| {
                    ChatError::protocol(format!("invalid message metadata: {reason}"))
                }),
            None => Ok(value),
        }
    }

    pub fn validate_data(&self, name: &str, value: Value) -> ChatResult<Value> {
        match self.data.get(name) {
            Some(validator) => validator.validate(value).map_err(|reason| {
                ChatError::protocol(format!("invalid data-{name} payload: {reason}"))
            }),
            None => Ok(value),
        }
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.data.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("SchemaRegistry")
            .field("metadata", &self.metadata.is_some())
            .field("data", &names)
            .finish()
    }
}

//! Capability-checked access to one exposed object.

use std::sync::Arc;

use protocol::{Capability, Definition, PeerId, ProtocolError, Result, Value};
use tracing::debug;

use crate::context::{Context, Output};

/// Binds a [`Definition`] to the local object it describes.
///
/// Every access goes through the definition's capability map; the object is
/// never reached for a member the map does not list.
pub struct Dispatcher {
    definition: Definition,
    context: Arc<dyn Context>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(definition: Definition, context: Arc<dyn Context>) -> Self {
        Self {
            definition,
            context,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    fn capability(&self, member: &str) -> Result<Capability> {
        self.definition.capability(member).ok_or_else(|| {
            ProtocolError::NotExists(format!(
                "member '{}' on context '{}'",
                member, self.definition.name
            ))
        })
    }

    /// Invoke a method or read a property.
    ///
    /// Definitions found in `args` are stamped with `origin` before the
    /// object sees them.
    pub async fn get(&self, member: &str, mut args: Vec<Value>, origin: PeerId) -> Result<Output> {
        let cap = self.capability(member)?;
        let rewritten: usize = args.iter_mut().map(|a| a.stamp_origin(origin)).sum();
        if rewritten > 0 {
            debug!(member, rewritten, peer = %origin, "stamped definitions in arguments");
        }

        match cap {
            Capability::Method => self.context.invoke(member, args).await,
            Capability::Property { .. } => self.context.read(member, args).await,
        }
    }

    /// Write a property, or invoke a method and discard its result.
    ///
    /// For a method, an array `value` is spread into the argument list; any
    /// other value becomes the single argument.
    pub async fn set(&self, member: &str, mut value: Value, origin: PeerId) -> Result<()> {
        let cap = self.capability(member)?;
        value.stamp_origin(origin);

        match cap {
            Capability::Property { readonly: true } => Err(ProtocolError::InvalidAccess(format!(
                "member '{}' on context '{}' is read-only",
                member, self.definition.name
            ))),
            Capability::Property { readonly: false } => self.context.write(member, value).await,
            Capability::Method => {
                let args = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                self.context.invoke(member, args).await.map(|_| ())
            }
        }
    }
}

//! Client-side handles for contexts owned by peers.

use protocol::{Capability, DefId, Definition, PeerId, ProtocolError, Reference, Result, Value};

use crate::router::Router;

/// A peer's context, as seen from this node.
///
/// Capability checks run locally first, so calling a member the definition
/// does not publish fails without a round trip.
#[derive(Debug, Clone)]
pub struct RemoteContext {
    router: Router,
    peer: PeerId,
    definition: Definition,
}

impl RemoteContext {
    pub(crate) fn new(router: Router, peer: PeerId, definition: Definition) -> Self {
        Self {
            router,
            peer,
            definition,
        }
    }

    /// Peer that owns the context.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn id(&self) -> DefId {
        self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    fn require(&self, member: &str) -> Result<Capability> {
        self.definition.capability(member).ok_or_else(|| {
            ProtocolError::NotExists(format!(
                "member '{}' on context '{}'",
                member, self.definition.name
            ))
        })
    }

    /// Invoke a method and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if !self.require(method)?.is_method() {
            return Err(ProtocolError::InvalidAccess(format!("'{}' is a property", method)));
        }
        self.router
            .get(self.peer, self.definition.id, method, args)
            .await
    }

    /// Invoke a method, discarding its result.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        if !self.require(method)?.is_method() {
            return Err(ProtocolError::InvalidAccess(format!("'{}' is a property", method)));
        }
        self.router
            .set(self.peer, self.definition.id, method, Value::Array(args))
            .await
    }

    /// Read a property.
    pub async fn get(&self, property: &str) -> Result<Value> {
        if self.require(property)?.is_method() {
            return Err(ProtocolError::InvalidAccess(format!("'{}' is a method", property)));
        }
        self.router
            .get(self.peer, self.definition.id, property, Vec::new())
            .await
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        match self.require(property)? {
            Capability::Property { readonly: false } => {
                self.router
                    .set(self.peer, self.definition.id, property, value)
                    .await
            }
            Capability::Property { readonly: true } => Err(ProtocolError::InvalidAccess(format!(
                "'{}' is read-only",
                property
            ))),
            Capability::Method => Err(ProtocolError::InvalidAccess(format!(
                "'{}' is a method",
                property
            ))),
        }
    }

    /// Value to pass this handle as an argument in a call to `target`.
    ///
    /// The owner receives a [`Reference`] it can resolve to its own object;
    /// any other peer receives the definition stamped with its owner.
    pub fn to_value(&self, target: PeerId) -> Value {
        if target == self.peer {
            Value::Reference(Reference {
                def_id: self.definition.id,
                peer_id: self.peer,
            })
        } else {
            let mut def = self.definition.clone();
            def.peer_id = Some(self.peer);
            Value::Definition(def)
        }
    }
}

#[cfg(test)]
mod tests {
    use protocol::{Capabilities, DefinitionRegistry};

    use super::*;
    use crate::router::RouterConfig;

    fn handle() -> RemoteContext {
        let mut caps = Capabilities::new();
        caps.insert("run".to_string(), Capability::Method);
        caps.insert("size".to_string(), Capability::readonly());
        caps.insert("label".to_string(), Capability::property());
        let owner = PeerId::new();
        let def = DefinitionRegistry::new().create_definition("job", "", &caps);
        RemoteContext::new(Router::new(RouterConfig::default()), owner, def)
    }

    #[tokio::test]
    async fn test_capability_checks_are_local() {
        let ctx = handle();
        assert!(matches!(
            ctx.call("missing", vec![]).await,
            Err(ProtocolError::NotExists(_))
        ));
        assert!(matches!(
            ctx.call("size", vec![]).await,
            Err(ProtocolError::InvalidAccess(_))
        ));
        assert!(matches!(ctx.get("run").await, Err(ProtocolError::InvalidAccess(_))));
        assert!(matches!(
            ctx.set("size", Value::Int(1)).await,
            Err(ProtocolError::InvalidAccess(_))
        ));
        assert!(matches!(
            ctx.set("run", Value::Null).await,
            Err(ProtocolError::InvalidAccess(_))
        ));
    }

    #[tokio::test]
    async fn test_permitted_member_reaches_router() {
        // The owner is not connected, so the router refuses.
        let ctx = handle();
        assert!(matches!(
            ctx.call("run", vec![]).await,
            Err(ProtocolError::UnknownPeer(_))
        ));
        assert!(matches!(
            ctx.set("label", Value::from("x")).await,
            Err(ProtocolError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_to_value_depends_on_target() {
        let ctx = handle();
        match ctx.to_value(ctx.peer()) {
            Value::Reference(r) => {
                assert_eq!(r.def_id, ctx.id());
                assert_eq!(r.peer_id, ctx.peer());
            }
            other => panic!("unexpected {:?}", other),
        }

        let def = ctx.to_value(PeerId::new());
        assert_eq!(def.as_definition().unwrap().peer_id, Some(ctx.peer()));
        assert_eq!(def.as_definition().unwrap().name, "job");
    }
}

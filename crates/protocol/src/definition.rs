//! Definitions describe exposed contexts to remote peers.
//!
//! A [`Definition`] is the descriptor a peer receives for every context it
//! may use: a numeric id, a parent link, and an immutable capability map
//! listing which members are methods and which are properties.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Numeric definition identifier. Zero means "no parent".
pub type DefId = u64;

/// Parent id of a top-level definition.
pub const NO_PARENT: DefId = 0;

/// Identity of a peer for the lifetime of its router.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How a single member of a context may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCapability", into = "RawCapability")]
pub enum Capability {
    /// Invocable member.
    Method,
    /// Data member; read-only properties reject writes.
    Property {
        /// Whether writes are rejected.
        readonly: bool,
    },
}

impl Capability {
    /// Writable property.
    pub const fn property() -> Self {
        Capability::Property { readonly: false }
    }

    /// Read-only property.
    pub const fn readonly() -> Self {
        Capability::Property { readonly: true }
    }

    /// Whether this member is a method.
    pub fn is_method(&self) -> bool {
        matches!(self, Capability::Method)
    }

    /// Whether this member rejects writes.
    pub fn is_readonly(&self) -> bool {
        matches!(self, Capability::Property { readonly: true })
    }
}

/// Wire shape of a capability: `{method: true}` or `{readonly: bool}`.
#[derive(Serialize, Deserialize)]
struct RawCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    readonly: Option<bool>,
}

impl From<RawCapability> for Capability {
    fn from(raw: RawCapability) -> Self {
        if raw.method.unwrap_or(false) {
            Capability::Method
        } else {
            Capability::Property {
                readonly: raw.readonly.unwrap_or(false),
            }
        }
    }
}

impl From<Capability> for RawCapability {
    fn from(cap: Capability) -> Self {
        match cap {
            Capability::Method => RawCapability {
                method: Some(true),
                readonly: None,
            },
            Capability::Property { readonly } => RawCapability {
                method: None,
                readonly: Some(readonly),
            },
        }
    }
}

/// Member name to capability mapping.
pub type Capabilities = BTreeMap<String, Capability>;

/// Shared, immutable capability map.
///
/// Clones share the same allocation; there is no way to mutate the map
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilityMap(Arc<Capabilities>);

impl CapabilityMap {
    /// Deep-copy `caps` into a new shared map.
    pub fn new(caps: &Capabilities) -> Self {
        Self(Arc::new(caps.clone()))
    }

    /// Whether two maps share the same allocation.
    pub fn ptr_eq(&self, other: &CapabilityMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Capabilities> for CapabilityMap {
    fn from(caps: Capabilities) -> Self {
        Self(Arc::new(caps))
    }
}

impl Deref for CapabilityMap {
    type Target = Capabilities;

    fn deref(&self) -> &Capabilities {
        &self.0
    }
}

impl Serialize for CapabilityMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CapabilityMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Capabilities::deserialize(deserializer).map(CapabilityMap::from)
    }
}

/// Descriptor of an exposed context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Identifier, unique within the issuing router.
    pub id: DefId,
    /// Parent definition, or [`NO_PARENT`].
    pub parent_id: DefId,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Which members exist and how they may be used.
    pub capabilities: CapabilityMap,
    /// Peer that owns the described context, filled in by the receiver.
    #[serde(default)]
    pub peer_id: Option<PeerId>,
}

impl Definition {
    /// Capability of a member, if it exists.
    pub fn capability(&self, member: &str) -> Option<Capability> {
        self.capabilities.get(member).copied()
    }

    /// Names of all methods.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.capabilities
            .iter()
            .filter(|(_, cap)| cap.is_method())
            .map(|(name, _)| name.as_str())
    }

    /// Names of all properties.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.capabilities
            .iter()
            .filter(|(_, cap)| !cap.is_method())
            .map(|(name, _)| name.as_str())
    }

    /// Whether this definition hangs off another one.
    pub fn is_child(&self) -> bool {
        self.parent_id != NO_PARENT
    }
}

/// Issues definition ids for one router.
///
/// Ids start at 1 and increase monotonically; they are never reused while
/// the registry lives.
#[derive(Debug)]
pub struct DefinitionRegistry {
    next_id: AtomicU64,
}

impl DefinitionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> DefId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a top-level definition with a deep copy of `caps`.
    pub fn create_definition(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        caps: &Capabilities,
    ) -> Definition {
        self.create_child(NO_PARENT, name, description, caps)
    }

    /// Create a definition hanging off `parent_id`.
    pub fn create_child(
        &self,
        parent_id: DefId,
        name: impl Into<String>,
        description: impl Into<String>,
        caps: &Capabilities,
    ) -> Definition {
        Definition {
            id: self.allocate(),
            parent_id,
            name: name.into(),
            description: description.into(),
            capabilities: CapabilityMap::new(caps),
            peer_id: None,
        }
    }

    /// Rebuild a definition received from `owner`.
    ///
    /// Wire fields are kept verbatim; the owner is recorded so later calls
    /// can be routed back to it. The remote id is not re-issued locally.
    pub fn adopt_remote(&self, wire: &Definition, owner: PeerId) -> Definition {
        Definition {
            peer_id: Some(owner),
            ..wire.clone()
        }
    }

    /// Id the next created definition will receive.
    pub fn peek_next_id(&self) -> DefId {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_caps() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.insert("foo".to_string(), Capability::Method);
        caps.insert("bar".to_string(), Capability::readonly());
        caps.insert("baz".to_string(), Capability::property());
        caps
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let registry = DefinitionRegistry::new();
        let a = registry.create_definition("a", "", &Capabilities::new());
        let b = registry.create_definition("b", "", &Capabilities::new());
        let c = registry.create_definition("c", "", &Capabilities::new());
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(c.id, 3);
        assert_eq!(a.parent_id, NO_PARENT);
        assert_eq!(registry.peek_next_id(), 4);
    }

    #[test]
    fn test_registries_are_independent() {
        let first = DefinitionRegistry::new();
        let second = DefinitionRegistry::new();
        first.create_definition("x", "", &Capabilities::new());
        let y = second.create_definition("y", "", &Capabilities::new());
        assert_eq!(y.id, 1);
    }

    #[test]
    fn test_create_definition_deep_copies_capabilities() {
        let registry = DefinitionRegistry::new();
        let mut caps = sample_caps();
        let def = registry.create_definition("ctx", "a context", &caps);

        caps.insert("late".to_string(), Capability::Method);
        caps.remove("foo");

        assert!(def.capability("late").is_none());
        assert_eq!(def.capability("foo"), Some(Capability::Method));
    }

    #[test]
    fn test_cloned_definitions_share_capability_map() {
        let registry = DefinitionRegistry::new();
        let def = registry.create_definition("ctx", "", &sample_caps());
        let copy = def.clone();
        assert!(def.capabilities.ptr_eq(&copy.capabilities));
    }

    #[test]
    fn test_create_child_links_parent() {
        let registry = DefinitionRegistry::new();
        let parent = registry.create_definition("root", "", &sample_caps());
        let child = registry.create_child(parent.id, "leaf", "", &Capabilities::new());
        assert_eq!(child.parent_id, parent.id);
        assert!(child.is_child());
        assert!(!parent.is_child());
    }

    #[test]
    fn test_adopt_remote_keeps_wire_fields() {
        let remote_registry = DefinitionRegistry::new();
        remote_registry.create_definition("skip", "", &Capabilities::new());
        let wire = remote_registry.create_definition("ctx", "desc", &sample_caps());

        let local = DefinitionRegistry::new();
        let owner = PeerId::new();
        let adopted = local.adopt_remote(&wire, owner);

        assert_eq!(adopted.id, wire.id);
        assert_eq!(adopted.name, "ctx");
        assert_eq!(adopted.description, "desc");
        assert_eq!(adopted.capabilities, wire.capabilities);
        assert_eq!(adopted.peer_id, Some(owner));
        assert_eq!(local.peek_next_id(), 1);
    }

    #[test]
    fn test_capability_wire_shape() {
        let json = serde_json::to_string(&Capability::Method).unwrap();
        assert_eq!(json, r#"{"method":true}"#);

        let json = serde_json::to_string(&Capability::readonly()).unwrap();
        assert_eq!(json, r#"{"readonly":true}"#);

        let json = serde_json::to_string(&Capability::property()).unwrap();
        assert_eq!(json, r#"{"readonly":false}"#);
    }

    #[test]
    fn test_capability_parse_defaults() {
        let cap: Capability = serde_json::from_str("{}").unwrap();
        assert_eq!(cap, Capability::property());

        let cap: Capability = serde_json::from_str(r#"{"method":true,"readonly":true}"#).unwrap();
        assert_eq!(cap, Capability::Method);
    }

    #[test]
    fn test_methods_and_properties() {
        let registry = DefinitionRegistry::new();
        let def = registry.create_definition("ctx", "", &sample_caps());
        let methods: Vec<_> = def.methods().collect();
        let properties: Vec<_> = def.properties().collect();
        assert_eq!(methods, vec!["foo"]);
        assert_eq!(properties, vec!["bar", "baz"]);
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let registry = DefinitionRegistry::new();
        let mut def = registry.create_definition("ctx", "desc", &sample_caps());
        def.peer_id = Some(PeerId::new());
        let json = serde_json::to_string(&def).unwrap();
        let parsed: Definition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_peer_id_parse() {
        let id = PeerId::new();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<PeerId>().is_err());
    }
}

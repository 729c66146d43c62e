//! Event kind registry

use super::{
    kinds::builtin_kinds, normalize_field_name, normalize_kind_name, user_kind_name, Capabilities,
    EventKindDef, FieldType, ManagerEvent, USER_EVENT,
};
use crate::{action::split_action_id, headers::ManagerHeader, protocol::Packet};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

static SHARED: OnceLock<Arc<EventRegistry>> = OnceLock::new();

/// Maps kind names to field tables.
///
/// Populated by explicit registration. Read-mostly: lookups take a read lock,
/// only [`register`](Self::register) takes the write lock.
#[derive(Debug, Default)]
pub struct EventRegistry {
    kinds: RwLock<HashMap<String, Arc<EventKindDef>>>,
}

impl EventRegistry {
    /// Registry with no kinds; every event builds as unknown.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the builtin kinds.
    pub fn with_builtin_kinds() -> Self {
        let registry = Self::empty();
        for def in builtin_kinds() {
            registry.register(def);
        }
        registry
    }

    /// The process-wide registry, initialized with the builtin kinds on first use.
    pub fn shared() -> Arc<EventRegistry> {
        SHARED
            .get_or_init(|| Arc::new(Self::with_builtin_kinds()))
            .clone()
    }

    /// Register a kind. Returns `false` if the name was already taken; the
    /// first registration wins.
    pub fn register(&self, def: EventKindDef) -> bool {
        let mut kinds = match self
            .kinds
            .write()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if kinds.contains_key(def.name()) {
            debug!("Event kind {} already registered, keeping first", def.name());
            return false;
        }
        kinds.insert(
            def.name()
                .to_string(),
            Arc::new(def),
        );
        true
    }

    /// Register a user-defined event (`UserEvent: <name>`) with typed fields.
    pub fn register_user_event(&self, name: &str, fields: &[(&str, FieldType)]) -> bool {
        let mut def = EventKindDef::new(&user_kind_name(name))
            .capabilities(Capabilities::RESPONSE)
            .field(ManagerHeader::UserEvent.as_str(), FieldType::Text);
        for (field, ty) in fields {
            def = def.field(field, *ty);
        }
        // new() strips a trailing "event" a second time
        def.name = user_kind_name(name);
        self.register(def)
    }

    /// Look up a kind by any spelling of its name.
    pub fn lookup(&self, name: &str) -> Option<Arc<EventKindDef>> {
        let kinds = match self
            .kinds
            .read()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        kinds
            .get(&normalize_kind_name(name))
            .or_else(|| kinds.get(name))
            .cloned()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds
            .read()
            .map(|k| k.len())
            .unwrap_or(0)
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classify an event packet and project its fields.
    ///
    /// Unknown kinds produce a generic event with every field in the side-bag.
    pub fn build(&self, packet: Packet) -> ManagerEvent {
        let (mut fields, _) = packet.into_parts();
        let name = fields
            .remove(&ManagerHeader::Event.key())
            .unwrap_or_default();
        let mut kind = normalize_kind_name(&name);

        if kind == USER_EVENT {
            if let Some(user) = fields.get(&ManagerHeader::UserEvent.key()) {
                kind = user_kind_name(user);
            }
        }

        let mut known = true;
        let def = self
            .lookup_exact(&kind)
            .or_else(|| {
                let generic = kind
                    .starts_with(USER_EVENT)
                    .then(|| self.lookup_exact(USER_EVENT))
                    .flatten()?;
                // unregistered user events keep their refined kind
                warn!(
                    "[RECV] Unregistered user event kind '{}', using the generic user fields",
                    kind
                );
                known = false;
                Some(generic)
            });

        let (internal_action_id, action_id) = match fields.remove(&ManagerHeader::ActionId.key()) {
            Some(raw) => {
                let (internal, caller) = split_action_id(&raw);
                (
                    internal.map(str::to_string),
                    caller.map(str::to_string),
                )
            }
            None => (None, None),
        };

        let Some(def) = def else {
            warn!("[RECV] Unregistered event kind '{}', keeping fields untyped", name);
            return ManagerEvent {
                kind,
                name,
                known: false,
                capabilities: Capabilities::RESPONSE,
                action_id,
                internal_action_id,
                fields: HashMap::new(),
                extra: fields
                    .into_iter()
                    .collect(),
            };
        };

        let mut typed = HashMap::new();
        let mut extra = BTreeMap::new();
        for (key, raw) in fields {
            match def.field_type(&key) {
                Some(ty) => match ty.parse(&raw) {
                    Some(value) => {
                        typed.insert(normalize_field_name(&key), value);
                    }
                    None => {
                        debug!(
                            "[RECV] Field {} of {} does not parse as {:?}: {}",
                            key,
                            def.name(),
                            ty,
                            raw
                        );
                        extra.insert(key, raw);
                    }
                },
                None => {
                    extra.insert(key, raw);
                }
            }
        }

        ManagerEvent {
            kind,
            name,
            known,
            capabilities: def.capability_set(),
            action_id,
            internal_action_id,
            fields: typed,
            extra,
        }
    }

    fn lookup_exact(&self, kind: &str) -> Option<Arc<EventKindDef>> {
        let kinds = match self
            .kinds
            .read()
        {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        kinds
            .get(kind)
            .cloned()
    }
}

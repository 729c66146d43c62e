//! Manager event records, kind classification and dispatch

mod dispatch;
mod kinds;
mod registry;

pub use dispatch::{EventDispatcher, EventHandler, SubscriptionId};
pub use registry::EventRegistry;

use crate::headers::ManagerHeader;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kind name of the synthetic event raised when a session comes up.
pub const CONNECT_EVENT: &str = "connect";
/// Kind name of the synthetic event raised when a session is lost.
pub const DISCONNECT_EVENT: &str = "disconnect";
/// Kind name of the server's `Shutdown` event.
pub const SHUTDOWN_EVENT: &str = "shutdown";
/// Generic kind for user-defined events without a registered shape.
pub const USER_EVENT: &str = "user";

/// Normalize a wire event name into a kind name.
///
/// Lower-cases and strips one trailing `event`, so `Hangup`, `hangup` and
/// `HangupEvent` all map to `hangup`. The bare name `Event` is kept.
pub fn normalize_kind_name(name: &str) -> String {
    let lower = name
        .trim()
        .to_ascii_lowercase();
    match lower.strip_suffix("event") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => lower,
    }
}

/// Kind name for a user-defined event: `user` followed by the normalized name.
pub fn user_kind_name(name: &str) -> String {
    format!("{}{}", USER_EVENT, normalize_kind_name(name))
}

/// Normalize a field name for table lookup: lower-case ASCII alphanumerics
/// only (`Channel-State` and `channelstate` match).
pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Optional behaviours an event kind may carry.
///
/// Replaces a class hierarchy: the dispatcher and the correlator query these
/// flags instead of checking concrete types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Carries an `ActionID` and may belong to an in-flight action.
    pub response: bool,
    /// Ends the event list of an event-generating action.
    pub list_terminal: bool,
    /// Reports a session state change (connect, disconnect, shutdown).
    pub connection_state: bool,
}

impl Capabilities {
    /// Plain push event.
    pub const NONE: Self = Self {
        response: false,
        list_terminal: false,
        connection_state: false,
    };
    /// List entry of an event-generating action.
    pub const RESPONSE: Self = Self {
        response: true,
        list_terminal: false,
        connection_state: false,
    };
    /// Completion event of an event-generating action.
    pub const LIST_TERMINAL: Self = Self {
        response: true,
        list_terminal: true,
        connection_state: false,
    };
    /// Session state change.
    pub const CONNECTION_STATE: Self = Self {
        response: false,
        list_terminal: false,
        connection_state: true,
    };
}

/// Declared type of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Boolean,
    Float,
}

impl FieldType {
    /// Convert a raw wire value, `None` if it does not fit the type.
    pub fn parse(&self, raw: &str) -> Option<FieldValue> {
        let raw = raw.trim();
        match self {
            FieldType::Text => Some(FieldValue::Text(raw.to_string())),
            FieldType::Integer => raw
                .parse()
                .ok()
                .map(FieldValue::Integer),
            FieldType::Boolean => parse_bool(raw).map(FieldValue::Boolean),
            FieldType::Float => raw
                .parse()
                .ok()
                .map(FieldValue::Float),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw
        .to_ascii_lowercase()
        .as_str()
    {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Float(f64),
}

impl FieldValue {
    /// The text value, if this is a text field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Float(x) => write!(f, "{}", x),
        }
    }
}

/// Field table for one event kind.
///
/// Built once when the kind is registered; [`EventRegistry::build`] uses it to
/// project packet fields onto typed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKindDef {
    name: String,
    fields: HashMap<String, FieldType>,
    capabilities: Capabilities,
}

impl EventKindDef {
    /// New kind with the fields every manager event carries.
    pub fn new(name: &str) -> Self {
        let mut def = Self {
            name: normalize_kind_name(name),
            fields: HashMap::new(),
            capabilities: Capabilities::NONE,
        };
        def = def
            .field("Privilege", FieldType::Text)
            .field("Timestamp", FieldType::Float)
            .field("Server", FieldType::Text)
            .field("SequenceNumber", FieldType::Integer)
            .field("SystemName", FieldType::Text);
        def
    }

    /// Declare a field.
    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields
            .insert(normalize_field_name(name), ty);
        self
    }

    /// Declare several text fields at once.
    pub fn text_fields(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.field(name, FieldType::Text);
        }
        self
    }

    /// Set the capability flags.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Normalized kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type of a field, by any spelling of its name.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .get(&normalize_field_name(name))
            .copied()
    }

    /// Capability flags.
    pub fn capability_set(&self) -> Capabilities {
        self.capabilities
    }
}

/// A classified manager event.
///
/// Fields declared by the kind are typed; everything else lands in the
/// side-bag returned by [`extra_fields`](Self::extra_fields), keyed by the
/// lower-cased wire name.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerEvent {
    kind: String,
    name: String,
    known: bool,
    capabilities: Capabilities,
    action_id: Option<String>,
    internal_action_id: Option<String>,
    fields: HashMap<String, FieldValue>,
    extra: BTreeMap<String, String>,
}

impl ManagerEvent {
    /// Normalized kind (`hangup`, `peerstatus`, `userfoo`, ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// `Event:` value as received.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` for events synthesized from an unregistered kind.
    pub fn is_known(&self) -> bool {
        self.known
    }

    /// Capability flags of the kind.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Caller-supplied action id, internal prefix removed.
    pub fn action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }

    /// Connection-generated correlation id of the action this event belongs to.
    pub fn internal_action_id(&self) -> Option<&str> {
        self.internal_action_id
            .as_deref()
    }

    /// Typed field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .get(&normalize_field_name(name))
    }

    /// Text of a field, typed or from the side-bag.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.field(name) {
            Some(value) => value.as_str(),
            None => self.extra(name),
        }
    }

    /// Integer value of a field, typed or parsed from the side-bag.
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.field(name) {
            Some(FieldValue::Integer(n)) => Some(*n),
            Some(_) => None,
            None => self
                .extra(name)?
                .trim()
                .parse()
                .ok(),
        }
    }

    /// Boolean value of a field, typed or parsed from the side-bag.
    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.field(name) {
            Some(FieldValue::Boolean(b)) => Some(*b),
            Some(_) => None,
            None => parse_bool(self.extra(name)?.trim()),
        }
    }

    /// Side-bag lookup by wire name (case-insensitive).
    pub fn extra(&self, name: &str) -> Option<&str> {
        self.extra
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Fields with no declared slot on this kind.
    pub fn extra_fields(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    /// `Channel` field.
    pub fn channel(&self) -> Option<&str> {
        self.text(ManagerHeader::Channel.as_str())
    }

    /// `Uniqueid` field.
    pub fn unique_id(&self) -> Option<&str> {
        self.text(ManagerHeader::UniqueId.as_str())
    }

    /// `Privilege` field.
    pub fn privilege(&self) -> Option<&str> {
        self.text(ManagerHeader::Privilege.as_str())
    }

    /// `Timestamp` field, seconds since the epoch.
    pub fn timestamp(&self) -> Option<f64> {
        match self.field(ManagerHeader::Timestamp.as_str())? {
            FieldValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Belongs to an action's event list.
    pub fn is_response_event(&self) -> bool {
        self.capabilities
            .response
    }

    /// Ends an action's event list.
    pub fn is_list_terminal(&self) -> bool {
        self.capabilities
            .list_terminal
    }

    /// Reports a session state change.
    pub fn is_connection_state(&self) -> bool {
        self.capabilities
            .connection_state
    }
}

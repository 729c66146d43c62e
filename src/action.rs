//! Outbound manager actions and their wire format

use crate::{
    constants::{INTERNAL_ACTION_ID_DELIMITER, LINE_TERMINATOR},
    error::{AmiError, AmiResult},
    event::normalize_kind_name,
    headers::ManagerHeader,
};
use std::fmt;

/// Fields whose values never appear in logs or `Debug` output.
const REDACTED_FIELDS: &[&str] = &["secret", "key"];

/// Reject strings that would break line framing.
///
/// Actions are line-delimited; an embedded newline would let a value inject
/// arbitrary fields or a second action.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::InvalidField {
            field: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}

fn validate_field_name(name: &str) -> AmiResult<()> {
    validate_no_newlines(name, "field name")?;
    if name.is_empty() || name.contains(':') {
        return Err(AmiError::InvalidField {
            field: format!("invalid field name '{}'", name),
        });
    }
    Ok(())
}

/// Compose the wire `ActionID` from the internal id and the caller's id.
pub fn compose_action_id(internal: &str, caller: Option<&str>) -> String {
    format!(
        "{}{}{}",
        internal,
        INTERNAL_ACTION_ID_DELIMITER,
        caller.unwrap_or("")
    )
}

/// Split a wire `ActionID` into `(internal, caller)`.
///
/// Without the delimiter the whole value belongs to someone else and is
/// returned as the caller part. An empty caller part is `None`.
pub fn split_action_id(raw: &str) -> (Option<&str>, Option<&str>) {
    match raw.split_once(INTERNAL_ACTION_ID_DELIMITER) {
        Some((internal, caller)) => (
            (!internal.is_empty()).then_some(internal),
            (!caller.is_empty()).then_some(caller),
        ),
        None => (None, (!raw.is_empty()).then_some(raw)),
    }
}

/// A request sent to the manager.
///
/// ```
/// use asterisk_manager_tokio::ManagerAction;
///
/// let action = ManagerAction::new("Originate")
///     .field("Channel", "PJSIP/100").unwrap()
///     .field("Application", "Playback").unwrap()
///     .variable("FOO", "bar").unwrap()
///     .action_id("call-1");
/// let wire = action.to_wire(Some("7f3e_1"), ',').unwrap();
/// assert!(wire.starts_with("Action: Originate\n"));
/// assert!(wire.contains("ActionID: 7f3e_1#call-1\n"));
/// assert!(wire.ends_with("Variable: FOO=bar\n\n"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ManagerAction {
    name: String,
    fields: Vec<(String, String)>,
    variables: Vec<(String, String)>,
    action_id: Option<String>,
    completion_event: Option<String>,
}

impl fmt::Debug for ManagerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let shown = if REDACTED_FIELDS
                    .iter()
                    .any(|r| k.eq_ignore_ascii_case(r))
                {
                    "[REDACTED]"
                } else {
                    v.as_str()
                };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("ManagerAction")
            .field("name", &self.name)
            .field("fields", &fields)
            .field("variables", &self.variables)
            .field("action_id", &self.action_id)
            .field("completion_event", &self.completion_event)
            .finish()
    }
}

impl ManagerAction {
    /// Start an action with the given `Action:` name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            variables: Vec::new(),
            action_id: None,
            completion_event: None,
        }
    }

    /// Append a `Name: value` field.
    pub fn field(mut self, name: &str, value: impl Into<String>) -> AmiResult<Self> {
        let value = value.into();
        validate_field_name(name)?;
        validate_no_newlines(&value, "field value")?;
        self.fields
            .push((name.to_string(), value));
        Ok(self)
    }

    /// Add a channel variable, sent on the `Variable:` line.
    pub fn variable(mut self, name: &str, value: impl Into<String>) -> AmiResult<Self> {
        let value = value.into();
        validate_no_newlines(name, "variable name")?;
        validate_no_newlines(&value, "variable value")?;
        if name.contains('=') {
            return Err(AmiError::InvalidField {
                field: format!("variable name '{}' must not contain '='", name),
            });
        }
        self.variables
            .push((name.to_string(), value));
        Ok(self)
    }

    /// Caller-supplied action id, echoed back in the response.
    pub fn action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Declare the event kind that ends this action's event stream.
    pub fn completes_with(mut self, event: &str) -> Self {
        self.completion_event = Some(normalize_kind_name(event));
        self
    }

    /// `Action:` name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Caller-supplied action id.
    pub fn caller_action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }

    /// Normalized completion event kind, for event-generating actions.
    pub fn completion_event(&self) -> Option<&str> {
        self.completion_event
            .as_deref()
    }

    /// Value of a field set on this action (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize for the wire.
    ///
    /// `internal_id` is prefixed to the caller's id; `var_delimiter` joins
    /// variables on one `Variable:` line (`|` for old servers, `,` otherwise).
    pub fn to_wire(&self, internal_id: Option<&str>, var_delimiter: char) -> AmiResult<String> {
        use std::fmt::Write;

        validate_field_name(&self.name)?;
        validate_no_newlines(&self.name, "action name")?;
        if let Some(id) = &self.action_id {
            validate_no_newlines(id, "action id")?;
        }

        let mut out = String::new();
        let _ = write!(
            out,
            "{}: {}{}",
            ManagerHeader::Action,
            self.name,
            LINE_TERMINATOR
        );
        for (k, v) in &self.fields {
            let _ = write!(out, "{}: {}{}", k, v, LINE_TERMINATOR);
        }

        let action_id = match internal_id {
            Some(internal) => Some(compose_action_id(internal, self.action_id.as_deref())),
            None => self
                .action_id
                .clone(),
        };
        if let Some(id) = action_id {
            let _ = write!(
                out,
                "{}: {}{}",
                ManagerHeader::ActionId,
                id,
                LINE_TERMINATOR
            );
        }

        if !self
            .variables
            .is_empty()
        {
            let joined = self
                .variables
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(&var_delimiter.to_string());
            let _ = write!(
                out,
                "{}: {}{}",
                ManagerHeader::Variable,
                joined,
                LINE_TERMINATOR
            );
        }

        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }

    // Well-known actions. Values built here never contain newlines unless the
    // caller passed them in, so these go through `field()` validation too.

    /// Keepalive.
    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// Request a login challenge.
    pub fn challenge(auth_type: &str) -> AmiResult<Self> {
        Self::new("Challenge").field(ManagerHeader::AuthType.as_str(), auth_type)
    }

    /// Challenge-response login with an MD5 key.
    pub fn login(username: &str, key: &str, events: Option<&str>) -> AmiResult<Self> {
        let mut action = Self::new("Login")
            .field(ManagerHeader::Username.as_str(), username)?
            .field(ManagerHeader::AuthType.as_str(), "MD5")?
            .field(ManagerHeader::Key.as_str(), key)?;
        if let Some(mask) = events {
            action = action.field(ManagerHeader::Events.as_str(), mask)?;
        }
        Ok(action)
    }

    /// End the session.
    pub fn logoff() -> Self {
        Self::new("Logoff")
    }

    /// Run a CLI command; the output comes back as a command block.
    pub fn command(command: &str) -> AmiResult<Self> {
        Self::new("Command").field(ManagerHeader::Command.as_str(), command)
    }

    /// Channel status list, ends with `StatusComplete`.
    pub fn status() -> Self {
        Self::new("Status").completes_with("StatusComplete")
    }

    /// Active channel list, ends with `CoreShowChannelsComplete`.
    pub fn core_show_channels() -> Self {
        Self::new("CoreShowChannels").completes_with("CoreShowChannelsComplete")
    }

    /// SIP peer list, ends with `PeerlistComplete`.
    pub fn sip_peers() -> Self {
        Self::new("SIPpeers").completes_with("PeerlistComplete")
    }

    /// Queue status list, ends with `QueueStatusComplete`.
    pub fn queue_status() -> Self {
        Self::new("QueueStatus").completes_with("QueueStatusComplete")
    }

    /// Originate a call on `channel`. Add `Exten`/`Context`/`Application`
    /// with [`field`](Self::field).
    pub fn originate(channel: &str) -> AmiResult<Self> {
        Self::new("Originate").field(ManagerHeader::Channel.as_str(), channel)
    }

    /// Fire a user-defined event.
    pub fn user_event(name: &str) -> AmiResult<Self> {
        Self::new("UserEvent").field(ManagerHeader::UserEvent.as_str(), name)
    }

    /// Read a channel (or global, when `channel` is `None`) variable.
    pub fn get_var(channel: Option<&str>, variable: &str) -> AmiResult<Self> {
        let mut action = Self::new("Getvar");
        if let Some(ch) = channel {
            action = action.field(ManagerHeader::Channel.as_str(), ch)?;
        }
        action.field("Variable", variable)
    }

    /// Set a channel (or global) variable.
    pub fn set_var(channel: Option<&str>, variable: &str, value: &str) -> AmiResult<Self> {
        let mut action = Self::new("Setvar");
        if let Some(ch) = channel {
            action = action.field(ManagerHeader::Channel.as_str(), ch)?;
        }
        action
            .field("Variable", variable)?
            .field("Value", value)
    }

    /// Hang up a channel.
    pub fn hangup(channel: &str) -> AmiResult<Self> {
        Self::new("Hangup").field(ManagerHeader::Channel.as_str(), channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_wire_format() {
        assert_eq!(
            ManagerAction::ping()
                .to_wire(None, ',')
                .unwrap(),
            "Action: Ping\n\n"
        );
    }

    #[test]
    fn internal_id_is_prefixed() {
        let wire = ManagerAction::ping()
            .action_id("mine")
            .to_wire(Some("ab12_3"), ',')
            .unwrap();
        assert_eq!(wire, "Action: Ping\nActionID: ab12_3#mine\n\n");

        let wire = ManagerAction::ping()
            .to_wire(Some("ab12_4"), ',')
            .unwrap();
        assert_eq!(wire, "Action: Ping\nActionID: ab12_4#\n\n");
    }

    #[test]
    fn action_id_round_trip() {
        let wire_id = compose_action_id("ab12_5", Some("caller-7"));
        assert_eq!(split_action_id(&wire_id), (Some("ab12_5"), Some("caller-7")));
        assert_eq!(split_action_id("ab12_6#"), (Some("ab12_6"), None));
        assert_eq!(split_action_id("plain"), (None, Some("plain")));
        assert_eq!(split_action_id(""), (None, None));
    }

    #[test]
    fn caller_id_may_contain_delimiter() {
        let wire_id = compose_action_id("ab12_8", Some("a#b"));
        assert_eq!(split_action_id(&wire_id), (Some("ab12_8"), Some("a#b")));
    }

    #[test]
    fn variables_use_dialect_delimiter() {
        let action = ManagerAction::originate("SIP/100")
            .unwrap()
            .variable("A", "1")
            .unwrap()
            .variable("B", "2")
            .unwrap();
        let new = action
            .to_wire(None, ',')
            .unwrap();
        let old = action
            .to_wire(None, '|')
            .unwrap();
        assert!(new.contains("Variable: A=1,B=2\n"));
        assert!(old.contains("Variable: A=1|B=2\n"));
    }

    #[test]
    fn newline_injection_rejected() {
        assert!(ManagerAction::command("core show version\n\nAction: Logoff").is_err());
        assert!(ManagerAction::new("Ping")
            .field("Bad\nName", "x")
            .is_err());
        assert!(ManagerAction::new("Ping")
            .variable("A", "1\r\n")
            .is_err());
        assert!(ManagerAction::new("Ping")
            .field("Bad:Name", "x")
            .is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let action = ManagerAction::login("admin", "0123456789abcdef", Some("on")).unwrap();
        let debug = format!("{:?}", action);
        assert!(!debug.contains("0123456789abcdef"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("admin"));
    }

    #[test]
    fn completion_event_is_normalized() {
        assert_eq!(
            ManagerAction::status().completion_event(),
            Some("statuscomplete")
        );
        assert_eq!(
            ManagerAction::new("Custom")
                .completes_with("MyListCompleteEvent")
                .completion_event(),
            Some("mylistcomplete")
        );
        assert_eq!(ManagerAction::ping().completion_event(), None);
    }
}

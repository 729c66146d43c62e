//! Typed names for well-known manager fields.

/// Error returned when parsing an unrecognized field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseManagerHeaderError(pub String);

impl std::fmt::Display for ParseManagerHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown manager header: {}", self.0)
    }
}

impl std::error::Error for ParseManagerHeaderError {}

define_wire_enum! {
    error_type: ParseManagerHeaderError,
    /// Field names with protocol meaning.
    ///
    /// Packets store keys lower-cased, so lookups through
    /// [`Packet::get`](crate::protocol::Packet::get) accept these directly.
    pub enum ManagerHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        Message => "Message",
        Privilege => "Privilege",
        Timestamp => "Timestamp",
        Server => "Server",
        Channel => "Channel",
        UniqueId => "Uniqueid",
        UserEvent => "UserEvent",
        EventList => "EventList",
        Ping => "Ping",
        Output => "Output",
        Challenge => "Challenge",
        Username => "Username",
        Secret => "Secret",
        Key => "Key",
        AuthType => "AuthType",
        Events => "Events",
        Command => "Command",
        Variable => "Variable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_spelling() {
        assert_eq!(ManagerHeader::ActionId.to_string(), "ActionID");
        assert_eq!(ManagerHeader::UniqueId.to_string(), "Uniqueid");
        assert_eq!(ManagerHeader::ActionId.key(), "actionid");
    }

    #[test]
    fn from_str_case_insensitive() {
        assert_eq!(
            "actionid".parse::<ManagerHeader>(),
            Ok(ManagerHeader::ActionId)
        );
        assert_eq!(
            "USEREVENT".parse::<ManagerHeader>(),
            Ok(ManagerHeader::UserEvent)
        );
    }

    #[test]
    fn from_str_unknown() {
        let err = "X-Not-A-Header"
            .parse::<ManagerHeader>()
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown manager header: X-Not-A-Header");
    }
}

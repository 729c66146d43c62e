//! Manager responses and event-generating action results

use crate::{
    action::split_action_id,
    error::{AmiError, AmiResult},
    event::ManagerEvent,
    headers::ManagerHeader,
    protocol::Packet,
};
use std::collections::HashMap;

/// Error returned when parsing an unrecognized `Response:` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResponseStatusError(pub String);

impl std::fmt::Display for ParseResponseStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown response status: {}", self.0)
    }
}

impl std::error::Error for ParseResponseStatusError {}

define_wire_enum! {
    error_type: ParseResponseStatusError,
    /// Value of the `Response:` field.
    pub enum ResponseStatus {
        Success => "Success",
        Error => "Error",
        Follows => "Follows",
        Goodbye => "Goodbye",
        Pong => "Pong",
    }
}

/// Reply to a [`ManagerAction`](crate::action::ManagerAction).
///
/// The internal part of the `ActionID` is split off on arrival; [`action_id`]
/// returns only what the caller supplied.
///
/// [`action_id`]: Self::action_id
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerResponse {
    response: String,
    status: Option<ResponseStatus>,
    action_id: Option<String>,
    internal_action_id: Option<String>,
    fields: HashMap<String, String>,
    output: Option<Vec<String>>,
}

impl ManagerResponse {
    /// Build from an assembled response packet.
    pub fn from_packet(packet: Packet) -> Self {
        let (mut fields, output) = packet.into_parts();
        let response = fields
            .remove(&ManagerHeader::Response.key())
            .unwrap_or_default();
        let status = response
            .parse()
            .ok();
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

        Self {
            response,
            status,
            action_id,
            internal_action_id,
            fields,
            output,
        }
    }

    /// Raw `Response:` value.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Parsed `Response:` value, `None` if unrecognized.
    pub fn status(&self) -> Option<ResponseStatus> {
        self.status
    }

    /// `true` for every reply except `Response: Error`.
    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    /// `true` for `Response: Error`.
    pub fn is_error(&self) -> bool {
        self.status == Some(ResponseStatus::Error)
    }

    /// Keepalive reply: `Ping: Pong` (or the old `Response: Pong`).
    pub fn is_pong(&self) -> bool {
        self.status == Some(ResponseStatus::Pong)
            || self
                .get(ManagerHeader::Ping)
                .is_some_and(|v| v.eq_ignore_ascii_case("pong"))
    }

    /// Caller-supplied action id, internal prefix removed.
    pub fn action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }

    /// Connection-generated correlation id.
    pub fn internal_action_id(&self) -> Option<&str> {
        self.internal_action_id
            .as_deref()
    }

    /// `Message:` field.
    pub fn message(&self) -> Option<&str> {
        self.get(ManagerHeader::Message)
    }

    /// Look up a field (case-insensitive).
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(
                &name
                    .as_ref()
                    .to_ascii_lowercase(),
            )
            .map(|s| s.as_str())
    }

    /// All remaining fields, keyed by lower-cased name.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// Command output.
    ///
    /// Block-mode payload when present, otherwise repeated `Output:` fields
    /// split back into lines.
    pub fn output(&self) -> Option<Vec<&str>> {
        if let Some(lines) = &self.output {
            return Some(
                lines
                    .iter()
                    .map(|s| s.as_str())
                    .collect(),
            );
        }
        self.get(ManagerHeader::Output)
            .map(|joined| {
                joined
                    .split('\n')
                    .collect()
            })
    }

    /// Fail with [`AmiError::ActionFailed`] on `Response: Error`.
    pub fn into_result(self) -> AmiResult<Self> {
        if self.is_error() {
            let message = self
                .message()
                .unwrap_or("Response: Error")
                .to_string();
            return Err(AmiError::ActionFailed { message });
        }
        Ok(self)
    }
}

/// Result of an event-generating action: the initial response plus every
/// correlated event up to and including the completion event.
#[derive(Debug, Clone, Default)]
pub struct ResponseEvents {
    response: Option<ManagerResponse>,
    events: Vec<ManagerEvent>,
    complete: bool,
}

impl ResponseEvents {
    pub(crate) fn set_response(&mut self, response: ManagerResponse) {
        self.response = Some(response);
    }

    pub(crate) fn push_event(&mut self, event: ManagerEvent) {
        self.events
            .push(event);
    }

    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// The action's direct response, if it arrived.
    pub fn response(&self) -> Option<&ManagerResponse> {
        self.response
            .as_ref()
    }

    /// Collected events in arrival order.
    pub fn events(&self) -> &[ManagerEvent] {
        &self.events
    }

    /// Take ownership of the collected events.
    pub fn into_events(self) -> Vec<ManagerEvent> {
        self.events
    }

    /// Whether the completion event (or an error response) was seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Fail with [`AmiError::ActionFailed`] when the response was an error.
    pub fn into_result(self) -> AmiResult<Self> {
        if let Some(resp) = &self.response {
            if resp.is_error() {
                let message = resp
                    .message()
                    .unwrap_or("Response: Error")
                    .to_string();
                return Err(AmiError::ActionFailed { message });
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(lines: &[(&str, &str)]) -> Packet {
        let mut p = Packet::new();
        for (k, v) in lines {
            p.insert(k, *v);
        }
        p
    }

    #[test]
    fn internal_id_is_stripped() {
        let resp = ManagerResponse::from_packet(packet(&[
            ("Response", "Success"),
            ("ActionID", "4f2a_12#my-id"),
            ("Message", "Authentication accepted"),
        ]));
        assert!(resp.is_success());
        assert_eq!(resp.status(), Some(ResponseStatus::Success));
        assert_eq!(resp.internal_action_id(), Some("4f2a_12"));
        assert_eq!(resp.action_id(), Some("my-id"));
        assert_eq!(resp.message(), Some("Authentication accepted"));
    }

    #[test]
    fn empty_caller_id_is_none() {
        let resp = ManagerResponse::from_packet(packet(&[
            ("Response", "Success"),
            ("ActionID", "4f2a_13#"),
        ]));
        assert_eq!(resp.internal_action_id(), Some("4f2a_13"));
        assert_eq!(resp.action_id(), None);
    }

    #[test]
    fn foreign_action_id_is_kept_whole() {
        let resp = ManagerResponse::from_packet(packet(&[
            ("Response", "Success"),
            ("ActionID", "someone-else"),
        ]));
        assert_eq!(resp.internal_action_id(), None);
        assert_eq!(resp.action_id(), Some("someone-else"));
    }

    #[test]
    fn pong_detection() {
        let new_style = ManagerResponse::from_packet(packet(&[
            ("Response", "Success"),
            ("Ping", "Pong"),
        ]));
        let old_style = ManagerResponse::from_packet(packet(&[("Response", "Pong")]));
        let other = ManagerResponse::from_packet(packet(&[("Response", "Success")]));
        assert!(new_style.is_pong());
        assert!(old_style.is_pong());
        assert!(!other.is_pong());
    }

    #[test]
    fn error_into_result() {
        let resp = ManagerResponse::from_packet(packet(&[
            ("Response", "Error"),
            ("Message", "Permission denied"),
        ]));
        assert!(resp.is_error());
        match resp.into_result() {
            Err(AmiError::ActionFailed { message }) => assert_eq!(message, "Permission denied"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn output_from_block_lines() {
        let mut p = packet(&[("Response", "Follows")]);
        p.set_lines(vec!["Line1".into(), "Line2".into()]);
        let resp = ManagerResponse::from_packet(p);
        assert_eq!(resp.status(), Some(ResponseStatus::Follows));
        assert_eq!(resp.output(), Some(vec!["Line1", "Line2"]));
    }

    #[test]
    fn output_from_repeated_fields() {
        let resp = ManagerResponse::from_packet(packet(&[
            ("Response", "Success"),
            ("Output", "Asterisk 18.2.0 built by root"),
            ("Output", "second line"),
        ]));
        assert_eq!(
            resp.output(),
            Some(vec!["Asterisk 18.2.0 built by root", "second line"])
        );
    }

    #[test]
    fn unknown_status_keeps_raw_value() {
        let resp = ManagerResponse::from_packet(packet(&[("Response", "Whatever")]));
        assert_eq!(resp.status(), None);
        assert_eq!(resp.response(), "Whatever");
        assert!(resp.is_success());
    }
}

//! AGI command replies

use std::collections::HashMap;

use crate::{
    constants::{
        AGI_SC_DEAD_CHANNEL, AGI_SC_INVALID_COMMAND_SYNTAX, AGI_SC_INVALID_OR_UNKNOWN_COMMAND,
        AGI_SC_SUCCESS, AGI_SC_TRYING,
    },
    error::{AgiError, AgiResult},
    protocol::{parse_status_code, ReplyLines},
};

/// Parsed reply to one AGI command.
///
/// `200 result=1 (timeout) endpos=1234` gives status 200, result `1`,
/// data `timeout` and attribute `endpos=1234`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiReply {
    status: u16,
    result: Option<String>,
    data: Option<String>,
    attributes: HashMap<String, String>,
    usage: Option<String>,
    lines: Vec<String>,
}

impl AgiReply {
    /// Parse the lines collected by a [`ReplyAssembler`](crate::protocol::ReplyAssembler).
    ///
    /// A reply ended by `HANGUP` is [`AgiError::Hangup`].
    pub fn parse(reply: ReplyLines) -> AgiResult<Self> {
        if reply.hangup {
            return Err(AgiError::Hangup);
        }

        // The final status line decides; 100 lines before it are progress.
        let Some((index, status)) = reply
            .lines
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, line)| {
                parse_status_code(line)
                    .filter(|(code, sep)| *code != AGI_SC_TRYING && *sep == ' ')
                    .map(|(code, _)| (i, code))
            })
        else {
            return Err(AgiError::protocol_error(format!(
                "reply without status line: {:?}",
                reply.lines
            )));
        };

        let mut parsed = Self {
            status,
            result: None,
            data: None,
            attributes: HashMap::new(),
            usage: None,
            lines: Vec::new(),
        };

        if status == AGI_SC_INVALID_COMMAND_SYNTAX {
            let usage: Vec<&str> = reply.lines[..index]
                .iter()
                .filter(|l| parse_status_code(l).is_none())
                .map(String::as_str)
                .collect();
            parsed.usage = Some(usage.join("\n"));
        } else {
            parsed.parse_payload(&reply.lines[index][3..]);
        }
        parsed.lines = reply.lines;
        Ok(parsed)
    }

    fn parse_payload(&mut self, payload: &str) {
        let mut rest = payload.trim();
        if let Some(after) = rest.strip_prefix("result=") {
            let end = after
                .find(char::is_whitespace)
                .unwrap_or(after.len());
            self.result = Some(after[..end].to_string());
            rest = after[end..].trim_start();
        }
        if let Some(after) = rest.strip_prefix('(') {
            if let Some(close) = after.rfind(')') {
                self.data = Some(after[..close].to_string());
                rest = after[close + 1..].trim_start();
            }
        }
        for token in rest.split_whitespace() {
            if let Some((k, v)) = token.split_once('=') {
                self.attributes
                    .insert(k.to_string(), v.to_string());
            }
        }
    }

    /// Map failure status codes to errors.
    pub fn into_result(self) -> AgiResult<Self> {
        match self.status {
            AGI_SC_SUCCESS => Ok(self),
            AGI_SC_INVALID_OR_UNKNOWN_COMMAND => Err(AgiError::InvalidOrUnknownCommand),
            AGI_SC_DEAD_CHANNEL => Err(AgiError::DeadChannel),
            AGI_SC_INVALID_COMMAND_SYNTAX => Err(AgiError::InvalidCommandSyntax {
                usage: self
                    .usage
                    .unwrap_or_default(),
            }),
            other => Err(AgiError::protocol_error(format!(
                "unexpected status {}",
                other
            ))),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == AGI_SC_SUCCESS
    }

    /// Raw `result=` value.
    pub fn result(&self) -> Option<&str> {
        self.result
            .as_deref()
    }

    /// `result=` as a number (`-1` usually means failure or hangup).
    pub fn result_code(&self) -> Option<i64> {
        self.result()?
            .parse()
            .ok()
    }

    /// `result=` read as an ASCII code, as DTMF commands report digits.
    /// `None` for 0 (no digit) and negative values.
    pub fn result_digit(&self) -> Option<char> {
        let code = self.result_code()?;
        u8::try_from(code)
            .ok()
            .filter(|c| *c != 0)
            .map(char::from)
    }

    /// Text inside the parentheses.
    pub fn data(&self) -> Option<&str> {
        self.data
            .as_deref()
    }

    /// Trailing `key=value` attribute such as `endpos`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
    }

    /// Usage text sent with a 520 reply.
    pub fn usage(&self) -> Option<&str> {
        self.usage
            .as_deref()
    }

    /// Every line of the reply as received.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

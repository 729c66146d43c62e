//! AGI command lines

use std::fmt;

use crate::error::{AgiError, AgiResult};

/// AGI is line-delimited; an embedded newline would inject a second command.
fn validate_no_newlines(s: &str, context: &str) -> AgiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AgiError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// One AGI command, e.g. `STREAM FILE "welcome" "#"`.
///
/// Arguments that are empty or contain whitespace, quotes or backslashes are
/// double-quoted with backslash escapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiCommand {
    name: String,
    args: Vec<String>,
}

impl AgiCommand {
    pub fn new(name: &str) -> AgiResult<Self> {
        validate_no_newlines(name, "command name")?;
        Ok(Self {
            name: name.to_string(),
            args: Vec::new(),
        })
    }

    /// Append one argument.
    pub fn arg(mut self, value: impl Into<String>) -> AgiResult<Self> {
        let value = value.into();
        validate_no_newlines(&value, "argument")?;
        self.args
            .push(value);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Wire form, without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = self
            .name
            .clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        line
    }

    pub fn answer() -> Self {
        Self::fixed("ANSWER")
    }

    pub fn noop() -> Self {
        Self::fixed("NOOP")
    }

    /// Hang up this channel, or the named one.
    pub fn hangup(channel: Option<&str>) -> AgiResult<Self> {
        let cmd = Self::new("HANGUP")?;
        match channel {
            Some(channel) => cmd.arg(channel),
            None => Ok(cmd),
        }
    }

    /// Play `file`; any of `escape_digits` interrupts playback.
    pub fn stream_file(file: &str, escape_digits: &str) -> AgiResult<Self> {
        Self::new("STREAM FILE")?
            .arg(file)?
            .arg(escape_digits)
    }

    /// Play `file` and collect DTMF until timeout or `max_digits`.
    pub fn get_data(file: &str, timeout_ms: Option<u64>, max_digits: Option<u32>) -> AgiResult<Self> {
        let mut cmd = Self::new("GET DATA")?.arg(file)?;
        match (timeout_ms, max_digits) {
            (Some(t), Some(m)) => cmd = cmd.arg(t.to_string())?.arg(m.to_string())?,
            (Some(t), None) => cmd = cmd.arg(t.to_string())?,
            // max digits needs a timeout before it; 0 means the default
            (None, Some(m)) => cmd = cmd.arg("0")?.arg(m.to_string())?,
            (None, None) => {}
        }
        Ok(cmd)
    }

    pub fn get_variable(name: &str) -> AgiResult<Self> {
        Self::new("GET VARIABLE")?.arg(name)
    }

    pub fn set_variable(name: &str, value: &str) -> AgiResult<Self> {
        Self::new("SET VARIABLE")?
            .arg(name)?
            .arg(value)
    }

    /// Run a dialplan application.
    pub fn exec(application: &str, options: Option<&str>) -> AgiResult<Self> {
        let cmd = Self::new("EXEC")?.arg(application)?;
        match options {
            Some(options) => cmd.arg(options),
            None => Ok(cmd),
        }
    }

    pub fn say_digits(digits: &str, escape_digits: &str) -> AgiResult<Self> {
        Self::new("SAY DIGITS")?
            .arg(digits)?
            .arg(escape_digits)
    }

    /// Log to the Asterisk console at `level` (1-4).
    pub fn verbose(message: &str, level: u8) -> AgiResult<Self> {
        Self::new("VERBOSE")?
            .arg(message)?
            .arg(level.to_string())
    }

    /// `-1` waits forever.
    pub fn wait_for_digit(timeout_ms: i64) -> AgiResult<Self> {
        Self::new("WAIT FOR DIGIT")?.arg(timeout_ms.to_string())
    }

    fn fixed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
        }
    }
}

impl fmt::Display for AgiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn quote(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quotes {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(AgiCommand::answer().to_line(), "ANSWER");
        assert_eq!(
            AgiCommand::hangup(None)
                .unwrap()
                .to_line(),
            "HANGUP"
        );
        assert_eq!(
            AgiCommand::wait_for_digit(5000)
                .unwrap()
                .to_line(),
            "WAIT FOR DIGIT 5000"
        );
    }

    #[test]
    fn test_empty_argument_is_quoted() {
        assert_eq!(
            AgiCommand::stream_file("welcome", "")
                .unwrap()
                .to_line(),
            r#"STREAM FILE welcome """#
        );
    }

    #[test]
    fn test_quotes_and_backslashes_are_escaped() {
        let cmd = AgiCommand::set_variable("GREETING", r#"say "hi" \o/"#).unwrap();
        assert_eq!(
            cmd.to_line(),
            r#"SET VARIABLE GREETING "say \"hi\" \\o/""#
        );
    }

    #[test]
    fn test_get_data_argument_positions() {
        assert_eq!(
            AgiCommand::get_data("enter-pin", None, Some(4))
                .unwrap()
                .to_line(),
            "GET DATA enter-pin 0 4"
        );
        assert_eq!(
            AgiCommand::get_data("enter-pin", Some(3000), None)
                .unwrap()
                .to_line(),
            "GET DATA enter-pin 3000"
        );
    }

    #[test]
    fn test_newline_injection_rejected() {
        assert!(AgiCommand::verbose("hi\nHANGUP", 1).is_err());
        assert!(AgiCommand::new("NOOP\n").is_err());
    }

    #[test]
    fn test_exec_with_options() {
        assert_eq!(
            AgiCommand::exec("Dial", Some("SIP/100,30"))
                .unwrap()
                .to_string(),
            "EXEC Dial SIP/100,30"
        );
    }
}

//! One FastAGI session socket

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{AgiCommand, AgiReply, AgiRequest};
use crate::{
    constants::{LINE_TERMINATOR, SOCKET_BUF_SIZE},
    error::{AgiError, AgiResult},
    framer::LineFramer,
    protocol::ReplyAssembler,
};

/// Byte stream an [`AgiChannel`] can run over.
pub trait AgiStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgiStream for T {}

/// Command channel handed to an [`AgiScript`](super::AgiScript).
///
/// Commands run one at a time: each call writes a line and reads until the
/// reply's final status line. After a hangup every command fails with
/// [`AgiError::Hangup`].
pub struct AgiChannel {
    stream: Box<dyn AgiStream>,
    framer: LineFramer,
    read_buffer: Vec<u8>,
    hung_up: bool,
}

impl std::fmt::Debug for AgiChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgiChannel")
            .field("hung_up", &self.hung_up)
            .finish()
    }
}

impl AgiChannel {
    /// Wrap an accepted socket (or any duplex stream, for tests).
    pub fn new(stream: impl AgiStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            framer: LineFramer::new(),
            read_buffer: vec![0u8; SOCKET_BUF_SIZE],
            hung_up: false,
        }
    }

    /// `None` at EOF.
    async fn read_line(&mut self) -> AgiResult<Option<String>> {
        loop {
            if let Some(line) = self
                .framer
                .next_line()
            {
                return Ok(Some(line));
            }
            let n = self
                .stream
                .read(&mut self.read_buffer)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            self.framer
                .push(&self.read_buffer[..n]);
        }
    }

    /// Read the `agi_*` environment up to the blank line.
    pub async fn read_request(&mut self) -> AgiResult<AgiRequest> {
        let mut lines = Vec::new();
        loop {
            match self
                .read_line()
                .await?
            {
                Some(line) if line.is_empty() => break,
                Some(line) => lines.push(line),
                None => {
                    return Err(AgiError::protocol_error(
                        "connection closed before the request was complete",
                    ))
                }
            }
        }
        debug!("[AGI] Request with {} variables", lines.len());
        AgiRequest::parse(lines)
    }

    /// Send one command and wait for its reply.
    ///
    /// 510, 511 and 520 replies come back as errors.
    pub async fn send_command(&mut self, command: &AgiCommand) -> AgiResult<AgiReply> {
        if self.hung_up {
            return Err(AgiError::Hangup);
        }
        let line = command.to_line();
        trace!("[AGI] > {}", line);
        self.stream
            .write_all(format!("{}{}", line, LINE_TERMINATOR).as_bytes())
            .await?;

        let mut assembler = ReplyAssembler::new();
        let reply = loop {
            let Some(line) = self
                .read_line()
                .await?
            else {
                self.hung_up = true;
                return Err(AgiError::Hangup);
            };
            trace!("[AGI] < {}", line);
            if let Some(reply) = assembler.feed(&line) {
                break reply;
            }
        };

        if reply.hangup {
            debug!("[AGI] Channel hung up");
            self.hung_up = true;
        }
        AgiReply::parse(reply)?.into_result()
    }

    /// `true` once Asterisk reported a hangup or closed the socket.
    pub fn is_hung_up(&self) -> bool {
        self.hung_up
    }

    pub async fn answer(&mut self) -> AgiResult<()> {
        self.send_command(&AgiCommand::answer())
            .await
            .map(drop)
    }

    pub async fn hangup(&mut self) -> AgiResult<()> {
        self.send_command(&AgiCommand::hangup(None)?)
            .await
            .map(drop)
    }

    pub async fn noop(&mut self) -> AgiResult<()> {
        self.send_command(&AgiCommand::noop())
            .await
            .map(drop)
    }

    /// Play a file; returns the digit that interrupted it, if any.
    pub async fn stream_file(&mut self, file: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let reply = self
            .send_command(&AgiCommand::stream_file(file, escape_digits)?)
            .await?;
        Ok(reply.result_digit())
    }

    /// Play a prompt and collect digits.
    pub async fn get_data(
        &mut self,
        file: &str,
        timeout_ms: Option<u64>,
        max_digits: Option<u32>,
    ) -> AgiResult<String> {
        let reply = self
            .send_command(&AgiCommand::get_data(file, timeout_ms, max_digits)?)
            .await?;
        Ok(reply
            .result()
            .unwrap_or_default()
            .to_string())
    }

    /// `None` when the variable is not set.
    pub async fn get_variable(&mut self, name: &str) -> AgiResult<Option<String>> {
        let reply = self
            .send_command(&AgiCommand::get_variable(name)?)
            .await?;
        if reply.result_code() == Some(1) {
            Ok(Some(
                reply
                    .data()
                    .unwrap_or_default()
                    .to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    pub async fn set_variable(&mut self, name: &str, value: &str) -> AgiResult<()> {
        self.send_command(&AgiCommand::set_variable(name, value)?)
            .await
            .map(drop)
    }

    /// Run a dialplan application; returns its result code.
    pub async fn exec(&mut self, application: &str, options: Option<&str>) -> AgiResult<i64> {
        let reply = self
            .send_command(&AgiCommand::exec(application, options)?)
            .await?;
        Ok(reply
            .result_code()
            .unwrap_or(-1))
    }

    pub async fn say_digits(&mut self, digits: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let reply = self
            .send_command(&AgiCommand::say_digits(digits, escape_digits)?)
            .await?;
        Ok(reply.result_digit())
    }

    pub async fn verbose(&mut self, message: &str, level: u8) -> AgiResult<()> {
        self.send_command(&AgiCommand::verbose(message, level)?)
            .await
            .map(drop)
    }

    /// Wait for one DTMF digit; `None` on timeout.
    pub async fn wait_for_digit(&mut self, timeout_ms: i64) -> AgiResult<Option<char>> {
        let reply = self
            .send_command(&AgiCommand::wait_for_digit(timeout_ms)?)
            .await?;
        Ok(reply.result_digit())
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> AgiResult<()> {
        self.stream
            .shutdown()
            .await?;
        Ok(())
    }
}

//! Manager packet assembly and AGI reply framing

use crate::constants::{
    AGI_HANGUP, AGI_SC_INVALID_COMMAND_SYNTAX, AGI_SC_TRYING, BANNER_PREFIXES,
    BLOCK_HEADER_FIELDS, COMMAND_OUTPUT_FOLLOWS, DUPLICATE_FIELD_SEPARATOR, END_COMMAND_SENTINEL,
};
use crate::headers::ManagerHeader;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// One logical protocol unit.
///
/// Keys are lower-cased. A repeated key keeps every value, joined with `\n`.
/// Command output read in block mode is kept separately in [`lines`](Self::lines).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    fields: HashMap<String, String>,
    lines: Option<Vec<String>>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, lower-casing the key and concatenating duplicates.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        let key = key
            .as_ref()
            .to_ascii_lowercase();
        let value = value.into();
        match self
            .fields
            .get_mut(&key)
        {
            Some(existing) => {
                existing.push_str(DUPLICATE_FIELD_SEPARATOR);
                existing.push_str(&value);
            }
            None => {
                self.fields
                    .insert(key, value);
            }
        }
    }

    /// Look up a field by name (case-insensitive).
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        match self
            .fields
            .get(name)
        {
            Some(v) => Some(v.as_str()),
            None => self
                .fields
                .get(&name.to_ascii_lowercase())
                .map(|s| s.as_str()),
        }
    }

    /// Whether the packet has a field with this name.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.get(name)
            .is_some()
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<String> {
        self.fields
            .remove(
                &name
                    .as_ref()
                    .to_ascii_lowercase(),
            )
    }

    /// All fields, keyed by lower-cased name.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// Raw command output lines, for block-mode packets.
    pub fn lines(&self) -> Option<&[String]> {
        self.lines
            .as_deref()
    }

    /// Attach command output lines.
    pub fn set_lines(&mut self, lines: Vec<String>) {
        self.lines = Some(lines);
    }

    /// `true` when no field and no payload has been collected.
    pub fn is_empty(&self) -> bool {
        self.fields
            .is_empty()
            && self
                .lines
                .is_none()
    }

    /// Split into fields and optional payload.
    pub fn into_parts(self) -> (HashMap<String, String>, Option<Vec<String>>) {
        (self.fields, self.lines)
    }
}

/// What the assembler produced for a completed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledPacket {
    /// The protocol banner, verbatim. Becomes the synthetic connect event.
    Banner(String),
    /// A reply to an action.
    Response(Packet),
    /// An unsolicited push event.
    Event(Packet),
}

/// Assembler state, see [`PacketAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Fresh socket, waiting for the banner line.
    AwaitingPreamble,
    /// Accumulating `key: value` lines until a blank line.
    Collecting,
    /// Inside a `Response: Follows` command output block.
    InMultilineBlock,
}

/// Groups logical lines into packets.
///
/// Feed lines one at a time with [`feed`](Self::feed); at most one packet is
/// completed per line. One assembler serves one socket: create a new one
/// (or call [`reset`](Self::reset)) on reconnect.
#[derive(Debug)]
pub struct PacketAssembler {
    state: AssemblerState,
    current: Packet,
    block: Vec<String>,
}

impl PacketAssembler {
    /// Assembler for a freshly connected socket.
    pub fn new() -> Self {
        Self {
            state: AssemblerState::AwaitingPreamble,
            current: Packet::new(),
            block: Vec::new(),
        }
    }

    /// Assembler that does not expect a banner (e.g. a replayed stream).
    pub fn without_preamble() -> Self {
        Self {
            state: AssemblerState::Collecting,
            ..Self::new()
        }
    }

    /// Current state.
    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Return to the fresh-socket state, discarding partial data.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consume one line.
    pub fn feed(&mut self, line: &str) -> Option<AssembledPacket> {
        match self.state {
            AssemblerState::AwaitingPreamble => self.feed_preamble(line),
            AssemblerState::Collecting => self.feed_collecting(line),
            AssemblerState::InMultilineBlock => self.feed_block(line),
        }
    }

    fn feed_preamble(&mut self, line: &str) -> Option<AssembledPacket> {
        if line
            .trim()
            .is_empty()
        {
            return None;
        }
        self.state = AssemblerState::Collecting;
        if is_banner(line) {
            debug!("[RECV] Protocol banner: {}", line);
            return Some(AssembledPacket::Banner(line.to_string()));
        }
        warn!("[RECV] Expected protocol banner, got: {}", line);
        self.feed_collecting(line)
    }

    fn feed_collecting(&mut self, line: &str) -> Option<AssembledPacket> {
        if line
            .trim()
            .is_empty()
        {
            if self
                .current
                .is_empty()
            {
                return None;
            }
            let packet = std::mem::take(&mut self.current);
            return classify(packet);
        }

        let Some((key, value)) = split_field(line) else {
            warn!("[RECV] Ignoring malformed line: {}", line);
            return None;
        };
        self.current
            .insert(key, value);

        if value.eq_ignore_ascii_case("follows")
            || line
                .trim()
                .to_ascii_lowercase()
                .ends_with(COMMAND_OUTPUT_FOLLOWS)
        {
            trace!("[RECV] Entering command output block");
            self.state = AssemblerState::InMultilineBlock;
        }
        None
    }

    fn feed_block(&mut self, line: &str) -> Option<AssembledPacket> {
        if line
            .trim()
            .is_empty()
        {
            return Some(self.finish_block());
        }

        if let Some(prefix) = strip_sentinel(line) {
            if !prefix.is_empty() {
                self.block
                    .push(prefix.to_string());
            }
            return Some(self.finish_block());
        }

        if let Some((key, value)) = block_header(line) {
            self.current
                .insert(key, value);
            return None;
        }

        self.block
            .push(line.to_string());
        None
    }

    fn finish_block(&mut self) -> AssembledPacket {
        let mut packet = std::mem::take(&mut self.current);
        packet.set_lines(std::mem::take(&mut self.block));
        self.state = AssemblerState::Collecting;
        AssembledPacket::Response(packet)
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn is_banner(line: &str) -> bool {
    BANNER_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Split on the first `:` into a trimmed key and value.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// If the line ends with `--END COMMAND--`, return what precedes it.
///
/// Older servers append the sentinel to the last output line.
fn strip_sentinel(line: &str) -> Option<&str> {
    let trimmed = line.trim_end();
    let cut = trimmed
        .len()
        .checked_sub(END_COMMAND_SENTINEL.len())?;
    if !trimmed.is_char_boundary(cut) {
        return None;
    }
    let (prefix, tail) = trimmed.split_at(cut);
    tail.eq_ignore_ascii_case(END_COMMAND_SENTINEL)
        .then_some(prefix)
}

fn block_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = split_field(line)?;
    BLOCK_HEADER_FIELDS
        .iter()
        .any(|h| key.eq_ignore_ascii_case(h))
        .then_some((key, value))
}

fn classify(packet: Packet) -> Option<AssembledPacket> {
    if packet.contains(ManagerHeader::Event.key()) {
        Some(AssembledPacket::Event(packet))
    } else if packet.contains(ManagerHeader::Response.key()) {
        Some(AssembledPacket::Response(packet))
    } else {
        debug!(
            "[RECV] Dropping packet with neither Event nor Response: {:?}",
            packet.fields()
        );
        None
    }
}

/// Parse a leading `NNN ` / `NNN-` status code.
///
/// Returns the code and the separator (`' '` or `'-'`; `' '` when the line is
/// exactly three digits).
pub fn parse_status_code(line: &str) -> Option<(u16, char)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3
        || !bytes[..3]
            .iter()
            .all(u8::is_ascii_digit)
    {
        return None;
    }
    let sep = match bytes.get(3) {
        None => ' ',
        Some(b' ') => ' ',
        Some(b'-') => '-',
        Some(_) => return None,
    };
    line[..3]
        .parse()
        .ok()
        .map(|code| (code, sep))
}

/// A complete reply collected by [`ReplyAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLines {
    /// Every line of the reply, in arrival order.
    pub lines: Vec<String>,
    /// The reply ended with the literal `HANGUP` token.
    pub hangup: bool,
}

/// Frames status-code replies read over a request/reply exchange.
///
/// - `100` lines are progress notices and do not end the reply.
/// - `520-` opens a usage block whose text lines follow; the closing
///   `520 ` line ends it.
/// - Any other status line ends the reply.
/// - `HANGUP` ends the reply immediately, with or without a code.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    lines: Vec<String>,
    in_usage: bool,
}

impl ReplyAssembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line; returns the reply once it is complete.
    pub fn feed(&mut self, line: &str) -> Option<ReplyLines> {
        if line
            .trim_start()
            .starts_with(AGI_HANGUP)
        {
            self.lines
                .push(line.to_string());
            return Some(self.finish(true));
        }

        self.lines
            .push(line.to_string());

        match parse_status_code(line) {
            Some((AGI_SC_TRYING, _)) => None,
            Some((AGI_SC_INVALID_COMMAND_SYNTAX, '-')) => {
                self.in_usage = true;
                None
            }
            // a `520 ` line closes the usage block like any final code
            Some(_) => Some(self.finish(false)),
            None => None,
        }
    }

    fn finish(&mut self, hangup: bool) -> ReplyLines {
        self.in_usage = false;
        ReplyLines {
            lines: std::mem::take(&mut self.lines),
            hangup,
        }
    }

    /// Whether a `520-` usage block is open.
    pub fn in_usage_block(&self) -> bool {
        self.in_usage
    }
}

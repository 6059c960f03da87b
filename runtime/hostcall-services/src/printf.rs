//! `Printf` service: formatted output assembled over several calls
//!
//! # Protocol
//! A message never fits in one 8-word packet, so the device streams it:
//!
//! ```text
//! Begin                          -> [message_id, 0]
//! String (format, 56 bytes/call) -> [0, 0]      first string is the format
//! Args   (7 words/call)          -> [0, 0]      numeric arguments, in order
//! String (%s argument)           -> [0, 0]      later strings, in order
//! ... last chunk | END_OF_MESSAGE -> [bytes_written, 0]
//! Discard | END_OF_MESSAGE         -> [0, 0]      abandon the message
//! ```
//!
//! A device whose stream fails partway sends `Discard` so the host can drop
//! the half-built message. The host also bounds what a device can make it
//! hold (see [`PrintfLimits`]): the oldest open message is evicted when too
//! many are open, and a message outgrowing its byte budget is dropped.
//!
//! `args[0]` of every packet is the control word:
//!
//! ```text
//! bit  0       END_OF_MESSAGE
//! bit  1       END_OF_STRING
//! bits 2..=3   chunk kind (0 Begin, 1 Args, 2 String, 3 Discard)
//! bits 4..=11  payload length (words for Args, bytes for String)
//! bits 32..=63 message id
//! ```
//!
//! # Output
//! Rendered messages go to a [`PrintfWriter`], a background thread that
//! owns the sink, so a handler never blocks on I/O.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use crossbeam::channel::{self, Sender};
use kaal_hostcall::{CallPacket, Caller, HostcallError, ReplyPacket, ServiceError, ServiceHandler, ServiceId};
use thiserror::Error;

use crate::format::{self, FormatError};

/// Argument words carried by one `Args` chunk
pub const MAX_CHUNK_WORDS: usize = 7;
/// String bytes carried by one `String` chunk
pub const MAX_CHUNK_BYTES: usize = MAX_CHUNK_WORDS * 8;

const KIND_SHIFT: u32 = 2;
const KIND_MASK: u64 = 0b11;
const LEN_SHIFT: u32 = 4;
const LEN_MASK: u64 = 0xff;
const ID_SHIFT: u32 = 32;
const RESERVED_MASK: u64 = 0xffff_f000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u64 {
        const END_OF_MESSAGE = 1 << 0;
        const END_OF_STRING = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    Begin = 0,
    Args = 1,
    String = 2,
    Discard = 3,
}

/// Bounds on the host memory printf messages may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintfLimits {
    /// Messages begun and not yet ended; beginning one more evicts the oldest
    pub max_open_messages: usize,
    /// Argument and string bytes buffered for one message
    pub max_message_bytes: usize,
}

impl Default for PrintfLimits {
    fn default() -> Self {
        Self {
            max_open_messages: 256,
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrintfError {
    #[error("no open printf message with id {id}")]
    UnknownMessage { id: u32 },

    #[error("malformed printf control word {word:#x}")]
    MalformedControl { word: u64 },

    #[error("printf message {id} has no format string")]
    MissingFormat { id: u32 },

    #[error("printf format error: {0}")]
    Format(#[from] FormatError),

    #[error("printf output failed: {0}")]
    Output(String),

    #[error("printf message {id} exceeds {limit} bytes")]
    MessageTooLarge { id: u32, limit: usize },
}

impl PrintfError {
    /// Code reported in the handler-failure reply
    pub const fn code(&self) -> u32 {
        match self {
            PrintfError::UnknownMessage { .. } => 1,
            PrintfError::MalformedControl { .. } => 2,
            PrintfError::MissingFormat { .. } | PrintfError::Format(_) => 3,
            PrintfError::Output(_) => 4,
            PrintfError::MessageTooLarge { .. } => 5,
        }
    }
}

impl From<PrintfError> for ServiceError {
    fn from(err: PrintfError) -> Self {
        ServiceError::new(err.code())
    }
}

/// Decoded control word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub flags: ControlFlags,
    pub kind: ChunkKind,
    pub len: usize,
    pub message_id: u32,
}

impl Control {
    pub const fn begin() -> Self {
        Self {
            flags: ControlFlags::empty(),
            kind: ChunkKind::Begin,
            len: 0,
            message_id: 0,
        }
    }

    pub const fn args(message_id: u32, len: usize) -> Self {
        Self {
            flags: ControlFlags::empty(),
            kind: ChunkKind::Args,
            len,
            message_id,
        }
    }

    pub fn string(message_id: u32, len: usize, end_of_string: bool) -> Self {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::END_OF_STRING, end_of_string);
        Self {
            flags,
            kind: ChunkKind::String,
            len,
            message_id,
        }
    }

    /// Abandon message `message_id`
    pub const fn discard(message_id: u32) -> Self {
        Self {
            flags: ControlFlags::END_OF_MESSAGE,
            kind: ChunkKind::Discard,
            len: 0,
            message_id,
        }
    }

    pub fn end_of_message(mut self) -> Self {
        self.flags |= ControlFlags::END_OF_MESSAGE;
        self
    }

    pub fn encode(&self) -> u64 {
        self.flags.bits()
            | ((self.kind as u64) << KIND_SHIFT)
            | (((self.len as u64) & LEN_MASK) << LEN_SHIFT)
            | (u64::from(self.message_id) << ID_SHIFT)
    }

    /// # Errors
    /// Returns `PrintfError::MalformedControl` for reserved bits, an unknown
    /// chunk kind, an oversized payload or flags that do not fit the kind
    pub fn decode(word: u64) -> Result<Self, PrintfError> {
        let malformed = PrintfError::MalformedControl { word };
        if word & RESERVED_MASK != 0 {
            return Err(malformed);
        }

        let flags = ControlFlags::from_bits_truncate(word);
        let len = ((word >> LEN_SHIFT) & LEN_MASK) as usize;
        let message_id = (word >> ID_SHIFT) as u32;
        let kind = match (word >> KIND_SHIFT) & KIND_MASK {
            0 => ChunkKind::Begin,
            1 => ChunkKind::Args,
            2 => ChunkKind::String,
            _ => ChunkKind::Discard,
        };

        let valid = match kind {
            ChunkKind::Begin => flags.is_empty() && len == 0,
            ChunkKind::Args => len <= MAX_CHUNK_WORDS && !flags.contains(ControlFlags::END_OF_STRING),
            ChunkKind::String => len <= MAX_CHUNK_BYTES,
            ChunkKind::Discard => flags == ControlFlags::END_OF_MESSAGE && len == 0,
        };
        if !valid {
            return Err(malformed);
        }

        Ok(Self {
            flags,
            kind,
            len,
            message_id,
        })
    }
}

/// Message being assembled
#[derive(Debug, Default)]
struct Message {
    /// Open order, the lowest is evicted first
    seq: u64,
    /// Payload bytes buffered so far
    bytes: usize,
    format: Option<String>,
    partial: Vec<u8>,
    words: Vec<u64>,
    strings: Vec<String>,
}

impl Message {
    fn finish_string(&mut self) {
        let bytes = std::mem::take(&mut self.partial);
        let s = String::from_utf8_lossy(&bytes).into_owned();
        match self.format {
            None => self.format = Some(s),
            Some(_) => self.strings.push(s),
        }
    }

    fn render(mut self, id: u32) -> Result<String, PrintfError> {
        if !self.partial.is_empty() {
            self.finish_string();
        }
        let fmt = self.format.as_deref().ok_or(PrintfError::MissingFormat { id })?;
        Ok(format::format(fmt, &self.words, &self.strings)?)
    }
}

#[derive(Debug)]
struct PrintfState {
    next_id: u32,
    next_seq: u64,
    messages: BTreeMap<u32, Message>,
}

impl PrintfState {
    /// Open a message, evicting the oldest ones beyond `max_open`.
    /// Ids start at 1 and skip 0 when they wrap.
    fn open(&mut self, max_open: usize) -> u32 {
        while self.messages.len() >= max_open.max(1) {
            let oldest = self
                .messages
                .iter()
                .min_by_key(|(_, message)| message.seq)
                .map(|(&id, _)| id);
            let Some(oldest) = oldest else { break };
            self.messages.remove(&oldest);
            log::warn!("printf message {} evicted, too many open messages", oldest);
        }

        while self.next_id == 0 || self.messages.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(
            id,
            Message {
                seq,
                ..Message::default()
            },
        );
        id
    }
}

/// Host handler for [`ServiceId::Printf`]
pub struct PrintfService {
    state: Mutex<PrintfState>,
    limits: PrintfLimits,
    writer: PrintfWriter,
}

impl PrintfService {
    pub fn new(writer: PrintfWriter) -> Self {
        Self::with_limits(writer, PrintfLimits::default())
    }

    pub fn with_limits(writer: PrintfWriter, limits: PrintfLimits) -> Self {
        Self {
            state: Mutex::new(PrintfState {
                next_id: 1,
                next_seq: 0,
                messages: BTreeMap::new(),
            }),
            limits,
            writer,
        }
    }

    pub fn limits(&self) -> PrintfLimits {
        self.limits
    }

    /// Service writing to the process's standard output
    pub fn stdout() -> io::Result<Self> {
        Ok(Self::new(PrintfWriter::spawn(io::stdout())?))
    }

    pub fn writer(&self) -> &PrintfWriter {
        &self.writer
    }

    /// Messages begun but not yet ended
    pub fn open_messages(&self) -> usize {
        self.lock().messages.len()
    }

    fn lock(&self) -> MutexGuard<'_, PrintfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, packet: &CallPacket) -> Result<ReplyPacket, PrintfError> {
        let control = Control::decode(packet.arg(0))?;
        let payload = &packet.args()[1..];
        let id = control.message_id;

        let mut state = self.lock();
        let message = match control.kind {
            ChunkKind::Begin => {
                let id = state.open(self.limits.max_open_messages);
                log::trace!("printf message {} opened", id);
                return Ok(ReplyPacket::new(u64::from(id), 0));
            }
            ChunkKind::Discard => {
                if state.messages.remove(&id).is_some() {
                    log::debug!("printf message {} discarded", id);
                }
                return Ok(ReplyPacket::ZERO);
            }
            _ => state
                .messages
                .get_mut(&id)
                .ok_or(PrintfError::UnknownMessage { id })?,
        };

        let incoming = match control.kind {
            ChunkKind::Args => control.len * 8,
            _ => control.len,
        };
        if message.bytes + incoming > self.limits.max_message_bytes {
            state.messages.remove(&id);
            return Err(PrintfError::MessageTooLarge {
                id,
                limit: self.limits.max_message_bytes,
            });
        }
        message.bytes += incoming;

        match control.kind {
            ChunkKind::Args => message.words.extend_from_slice(&payload[..control.len]),
            ChunkKind::String => {
                message
                    .partial
                    .extend(payload.iter().flat_map(|w| w.to_le_bytes()).take(control.len));
                if control.flags.contains(ControlFlags::END_OF_STRING) {
                    message.finish_string();
                }
            }
            ChunkKind::Begin | ChunkKind::Discard => {}
        }

        if !control.flags.contains(ControlFlags::END_OF_MESSAGE) {
            return Ok(ReplyPacket::ZERO);
        }

        let message = state
            .messages
            .remove(&id)
            .ok_or(PrintfError::UnknownMessage { id })?;
        drop(state);

        let text = message.render(id)?;
        let written = text.len() as u64;
        self.writer.write(text)?;
        Ok(ReplyPacket::new(written, 0))
    }
}

impl ServiceHandler for PrintfService {
    fn handle(&self, packet: &CallPacket) -> Result<ReplyPacket, ServiceError> {
        self.process(packet).map_err(|err| {
            log::warn!("printf: {}", err);
            err.into()
        })
    }
}

enum WriterCommand {
    Text(String),
    Flush(Sender<()>),
}

/// Background thread that owns the output sink
pub struct PrintfWriter {
    sender: Option<Sender<WriterCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl PrintfWriter {
    /// Start a writer thread for `sink`
    pub fn spawn<W>(mut sink: W) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<WriterCommand>();
        let thread = thread::Builder::new()
            .name("hostcall-printf".into())
            .spawn(move || {
                for command in rx.iter() {
                    match command {
                        WriterCommand::Text(text) => {
                            if let Err(e) = sink.write_all(text.as_bytes()) {
                                log::error!("printf sink write failed: {}", e);
                            }
                        }
                        WriterCommand::Flush(ack) => {
                            if let Err(e) = sink.flush() {
                                log::error!("printf sink flush failed: {}", e);
                            }
                            let _ = ack.send(());
                        }
                    }
                }
                let _ = sink.flush();
            })?;

        Ok(Self {
            sender: Some(tx),
            thread: Some(thread),
        })
    }

    fn send(&self, command: WriterCommand) -> Result<(), PrintfError> {
        self.sender
            .as_ref()
            .ok_or_else(|| PrintfError::Output("writer closed".into()))?
            .send(command)
            .map_err(|_| PrintfError::Output("writer thread exited".into()))
    }

    /// Queue `text` for output
    pub fn write(&self, text: String) -> Result<(), PrintfError> {
        self.send(WriterCommand::Text(text))
    }

    /// Block until everything queued so far has reached the sink
    pub fn flush(&self) -> Result<(), PrintfError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(WriterCommand::Flush(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| PrintfError::Output("writer thread exited".into()))
    }
}

impl Drop for PrintfWriter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("printf writer thread panicked");
            }
        }
    }
}

/// In-memory sink that can be read back while the writer owns a clone
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One argument of a device-side printf
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrintfArg<'a> {
    /// Integer, pointer, character or float bits
    Word(u64),
    /// `%s` argument
    Str(&'a str),
}

impl From<u64> for PrintfArg<'_> {
    fn from(value: u64) -> Self {
        PrintfArg::Word(value)
    }
}

impl From<i64> for PrintfArg<'_> {
    fn from(value: i64) -> Self {
        PrintfArg::Word(value as u64)
    }
}

impl From<i32> for PrintfArg<'_> {
    fn from(value: i32) -> Self {
        PrintfArg::Word(i64::from(value) as u64)
    }
}

impl From<u32> for PrintfArg<'_> {
    fn from(value: u32) -> Self {
        PrintfArg::Word(u64::from(value))
    }
}

impl From<f64> for PrintfArg<'_> {
    fn from(value: f64) -> Self {
        PrintfArg::Word(value.to_bits())
    }
}

impl From<char> for PrintfArg<'_> {
    fn from(value: char) -> Self {
        PrintfArg::Word(u64::from(value))
    }
}

impl<'a> From<&'a str> for PrintfArg<'a> {
    fn from(value: &'a str) -> Self {
        PrintfArg::Str(value)
    }
}

fn string_chunks(id: u32, bytes: &[u8], chunks: &mut Vec<(Control, [u64; MAX_CHUNK_WORDS])>) {
    if bytes.is_empty() {
        chunks.push((Control::string(id, 0, true), [0; MAX_CHUNK_WORDS]));
        return;
    }
    let count = bytes.len().div_ceil(MAX_CHUNK_BYTES);
    for (n, piece) in bytes.chunks(MAX_CHUNK_BYTES).enumerate() {
        let mut words = [0u64; MAX_CHUNK_WORDS];
        for (i, &byte) in piece.iter().enumerate() {
            words[i / 8] |= u64::from(byte) << ((i % 8) * 8);
        }
        chunks.push((Control::string(id, piece.len(), n + 1 == count), words));
    }
}

/// Device side of the protocol: stream one message through `caller`.
///
/// Returns the number of bytes the host wrote.
///
/// # Errors
/// Any error of an individual call; the host reports protocol problems as
/// `HandlerFailure` with a [`PrintfError::code`]. A message that fails after
/// `Begin` is discarded on the host before the error is returned.
pub fn device_printf(caller: &Caller, fmt: &str, args: &[PrintfArg<'_>]) -> Result<u64, HostcallError> {
    let mut begin = [0u64; 8];
    begin[0] = Control::begin().encode();
    let [id, _] = caller.call(ServiceId::Printf, begin)?;
    let id = id as u32;

    let mut chunks = Vec::new();
    string_chunks(id, fmt.as_bytes(), &mut chunks);

    let words: Vec<u64> = args
        .iter()
        .filter_map(|arg| match arg {
            PrintfArg::Word(word) => Some(*word),
            PrintfArg::Str(_) => None,
        })
        .collect();
    for batch in words.chunks(MAX_CHUNK_WORDS) {
        let mut payload = [0u64; MAX_CHUNK_WORDS];
        payload[..batch.len()].copy_from_slice(batch);
        chunks.push((Control::args(id, batch.len()), payload));
    }

    for arg in args {
        if let PrintfArg::Str(s) = arg {
            string_chunks(id, s.as_bytes(), &mut chunks);
        }
    }

    send_chunks(caller, chunks).inspect_err(|_| {
        let mut discard = [0u64; 8];
        discard[0] = Control::discard(id).encode();
        if let Err(err) = caller.call(ServiceId::Printf, discard) {
            log::debug!("printf message {} not discarded: {}", id, err);
        }
    })
}

fn send_chunks(
    caller: &Caller,
    chunks: Vec<(Control, [u64; MAX_CHUNK_WORDS])>,
) -> Result<u64, HostcallError> {
    let last = chunks.len() - 1;
    let mut written = 0;
    for (n, (control, payload)) in chunks.into_iter().enumerate() {
        let control = if n == last { control.end_of_message() } else { control };
        let mut packet = [0u64; 8];
        packet[0] = control.encode();
        packet[1..].copy_from_slice(&payload);
        written = caller.call(ServiceId::Printf, packet)?[0];
    }
    Ok(written)
}

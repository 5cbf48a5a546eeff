use crate::error::{Result, SwarmError};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Sub-ID 0 of the extended envelope carries the handshake dictionary.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

const MAX_HANDSHAKE_SIZE: usize = 4096;
const MAX_EXTENSION_NAME_LEN: usize = 32;
const MAX_EXTENSIONS: usize = 16;

/// The extended handshake dictionary.
///
/// Recognized keys: `m` (extension name to assigned numeric sub-ID),
/// `reqq` (request-queue-depth hint) and `v` (client name). Unknown keys
/// are skipped on decode; the general metadata container format stays
/// outside this crate, only this one dictionary is encoded inline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub reqq: Option<u32>,
    pub client: Option<String>,
}

impl ExtendedHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    pub fn supports(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        out.push(b'd');

        out.extend_from_slice(b"1:md");
        for (name, &id) in &self.extensions {
            out.extend_from_slice(format!("{}:", name.len()).as_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(format!("i{}e", id).as_bytes());
        }
        out.push(b'e');

        if let Some(reqq) = self.reqq {
            out.extend_from_slice(format!("4:reqqi{}e", reqq).as_bytes());
        }
        if let Some(client) = &self.client {
            out.extend_from_slice(format!("1:v{}:", client.len()).as_bytes());
            out.extend_from_slice(client.as_bytes());
        }

        out.push(b'e');
        Bytes::from(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_HANDSHAKE_SIZE {
            return Err(SwarmError::ExtensionError(format!(
                "handshake dictionary of {} bytes is too large",
                data.len()
            )));
        }

        let mut reader = DictReader::new(data);
        reader.expect(b'd')?;

        let mut handshake = ExtendedHandshake::new();
        while !reader.at(b'e') {
            let key = reader.read_string()?;
            match key.as_slice() {
                b"m" => {
                    reader.expect(b'd')?;
                    while !reader.at(b'e') {
                        let name = reader.read_string()?;
                        let id = reader.read_integer()?;
                        if name.len() <= MAX_EXTENSION_NAME_LEN
                            && handshake.extensions.len() < MAX_EXTENSIONS
                            && (0..=255).contains(&id)
                        {
                            if let Ok(name) = String::from_utf8(name) {
                                handshake.extensions.insert(name, id as u8);
                            }
                        }
                    }
                    reader.expect(b'e')?;
                }
                b"reqq" => {
                    let reqq = reader.read_integer()?;
                    if reqq >= 0 {
                        handshake.reqq = Some(reqq as u32);
                    }
                }
                b"v" => {
                    let client = reader.read_string()?;
                    if let Ok(client) = String::from_utf8(client) {
                        handshake.client = Some(client);
                    }
                }
                _ => reader.skip_value()?,
            }
        }
        reader.expect(b'e')?;
        Ok(handshake)
    }
}

/// Minimal reader for the handshake dictionary format.
struct DictReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DictReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at(&self, byte: u8) -> bool {
        self.data.get(self.pos) == Some(&byte)
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if !self.at(byte) {
            return Err(SwarmError::ExtensionError(format!(
                "expected {:?} at offset {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn read_integer(&mut self) -> Result<i64> {
        self.expect(b'i')?;
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != b'e' {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| SwarmError::ExtensionError("non-ascii integer".into()))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| SwarmError::ExtensionError(format!("bad integer {:?}", text)))?;
        self.expect(b'e')?;
        Ok(value)
    }

    fn read_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let len = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| SwarmError::ExtensionError("bad string length".into()))?;
        self.expect(b':')?;
        if self.pos + len > self.data.len() {
            return Err(SwarmError::ExtensionError("string runs past end".into()));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn skip_value(&mut self) -> Result<()> {
        match self.data.get(self.pos) {
            Some(b'i') => {
                self.read_integer()?;
            }
            Some(b'd') => {
                self.pos += 1;
                while !self.at(b'e') {
                    self.read_string()?;
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            Some(b'l') => {
                self.pos += 1;
                while !self.at(b'e') {
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            Some(c) if c.is_ascii_digit() => {
                self.read_string()?;
            }
            _ => {
                return Err(SwarmError::ExtensionError(format!(
                    "unparseable value at offset {}",
                    self.pos
                )))
            }
        }
        Ok(())
    }
}

/// Handles payloads for one registered extension.
pub trait ExtensionHandler: Send {
    fn on_message(&mut self, payload: Bytes) -> Result<()>;
}

/// Assigns local sub-IDs to extension names and dispatches inbound frames.
///
/// Local IDs start at 1 (0 is the handshake) and are advertised to the
/// remote through [`ExtensionRegistry::local_handshake`]; the remote's own
/// assignments are captured from its handshake and used when sending.
pub struct ExtensionRegistry {
    local: BTreeMap<String, u8>,
    handlers: HashMap<u8, Box<dyn ExtensionHandler>>,
    remote: BTreeMap<String, u8>,
    remote_reqq: Option<u32>,
    next_id: u8,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            local: BTreeMap::new(),
            handlers: HashMap::new(),
            remote: BTreeMap::new(),
            remote_reqq: None,
            next_id: 1,
        }
    }

    /// Registers an extension and returns its assigned local sub-ID.
    ///
    /// Registering the same name twice is a caller bug and panics.
    pub fn register(&mut self, name: &str, handler: Box<dyn ExtensionHandler>) -> u8 {
        assert!(
            !self.local.contains_key(name),
            "extension {:?} registered twice",
            name
        );
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).expect("extension id space exhausted");
        self.local.insert(name.to_string(), id);
        self.handlers.insert(id, handler);
        id
    }

    /// The handshake advertising our assignments plus a queue-depth hint.
    pub fn local_handshake(&self, reqq: Option<u32>, client: Option<String>) -> ExtendedHandshake {
        ExtendedHandshake {
            extensions: self.local.clone(),
            reqq,
            client,
        }
    }

    /// Captures the remote's handshake dictionary.
    pub fn apply_remote(&mut self, handshake: &ExtendedHandshake) {
        debug!(
            extensions = handshake.extensions.len(),
            reqq = ?handshake.reqq,
            "extended handshake received"
        );
        self.remote = handshake.extensions.clone();
        self.remote_reqq = handshake.reqq;
    }

    /// The sub-ID to use when sending `name` to this remote, if supported.
    pub fn remote_id(&self, name: &str) -> Option<u8> {
        self.remote.get(name).copied()
    }

    /// The remote's request-queue-depth hint, if it offered one.
    pub fn remote_reqq(&self) -> Option<u32> {
        self.remote_reqq
    }

    /// Routes an inbound extended frame with sub-ID >= 1 to its handler.
    pub fn dispatch(&mut self, id: u8, payload: Bytes) -> Result<()> {
        let handler = self.handlers.get_mut(&id).ok_or_else(|| {
            SwarmError::ExtensionError(format!("no handler for extension sub-id {}", id))
        })?;
        handler.on_message(payload)
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Message-type identifiers, the [`Message`] trait, and the type registry.
//!
//! # Identifier format
//!
//! ```text
//! urn:message:<namespace>:<type-name>
//! urn:message:<namespace>:<type-name>[<ns>:<arg>,<ns>:<arg>[...]]
//! ```
//!
//! Generic arguments are written without the `urn:message:` prefix and may
//! nest. Identifiers drive routing: an envelope lists the identifiers of its
//! message type (most-derived first) and every consumer subscribes to one.

use std::any::{Any, TypeId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::serializer::MessageSerializer;

const URN_PREFIX: &str = "urn:message:";

// ---------------------------------------------------------------------------
// MessageTypeName
// ---------------------------------------------------------------------------

/// Structured message-type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeName {
    namespace: String,
    name: String,
    args: Vec<MessageTypeName>,
}

impl MessageTypeName {
    /// Non-generic type name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Generic type name with the given type arguments.
    pub fn generic(
        namespace: impl Into<String>,
        name: impl Into<String>,
        args: Vec<MessageTypeName>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            args,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn args(&self) -> &[MessageTypeName] {
        &self.args
    }

    /// The `urn:message:` identifier.
    #[must_use]
    pub fn urn(&self) -> String {
        self.to_string()
    }

    /// Parses a `urn:message:` identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMessageType` when the text is not a well-formed
    /// identifier.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let rest = text
            .strip_prefix(URN_PREFIX)
            .ok_or_else(|| Error::UnknownMessageType(text.to_string()))?;
        let mut parser = Parser {
            input: rest.as_bytes(),
            pos: 0,
        };
        let parsed = parser.qualified();
        match parsed {
            Some(name) if parser.pos == parser.input.len() => Ok(name),
            _ => Err(Error::UnknownMessageType(text.to_string())),
        }
    }

    fn write_qualified(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)?;
        if !self.args.is_empty() {
            f.write_str("[")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                arg.write_qualified(f)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl fmt::Display for MessageTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(URN_PREFIX)?;
        self.write_qualified(f)
    }
}

impl FromStr for MessageTypeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Recursive-descent parser over `<ns>:<name>[args]`.
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> Option<String> {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .map(str::to_string)
    }

    fn qualified(&mut self) -> Option<MessageTypeName> {
        let namespace = self.take_while(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')?;
        if self.peek() != Some(b':') {
            return None;
        }
        self.pos += 1;
        let name = self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_')?;

        let mut args = Vec::new();
        if self.peek() == Some(b'[') {
            self.pos += 1;
            loop {
                args.push(self.qualified()?);
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b']') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return None,
                }
            }
        }
        Some(MessageTypeName {
            namespace,
            name,
            args,
        })
    }
}

// ---------------------------------------------------------------------------
// Message trait
// ---------------------------------------------------------------------------

/// A message type that can travel on the bus.
///
/// `implemented_types` lists the identifiers of the contracts this message
/// also satisfies. A consumer subscribed to any of them receives the message
/// and decodes the body into its own type.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> MessageTypeName;

    fn implemented_types() -> Vec<MessageTypeName> {
        Vec::new()
    }

    /// Every identifier of this message, most-derived first.
    fn message_types() -> Vec<MessageTypeName> {
        let mut types = vec![Self::message_type()];
        for implemented in Self::implemented_types() {
            if !types.contains(&implemented) {
                types.push(implemented);
            }
        }
        types
    }
}

// ---------------------------------------------------------------------------
// MessageTypeRegistry
// ---------------------------------------------------------------------------

/// Decoded message, type-erased.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

type DecodeFn = fn(&MessageSerializer, &[u8]) -> Result<AnyMessage, Error>;

/// Registry entry describing one Rust message type.
#[derive(Debug, Clone)]
pub struct RegisteredType {
    name: MessageTypeName,
    urn: String,
    type_id: TypeId,
    rust_name: &'static str,
    implemented: Vec<MessageTypeName>,
    decode: DecodeFn,
}

impl RegisteredType {
    /// Describes `T`.
    #[must_use]
    pub fn of<T: Message>() -> Self {
        let name = T::message_type();
        Self {
            urn: name.urn(),
            name,
            type_id: TypeId::of::<T>(),
            rust_name: std::any::type_name::<T>(),
            implemented: T::implemented_types(),
            decode: decode_erased::<T>,
        }
    }

    #[must_use]
    pub fn name(&self) -> &MessageTypeName {
        &self.name
    }

    #[must_use]
    pub fn urn(&self) -> &str {
        &self.urn
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn rust_name(&self) -> &'static str {
        self.rust_name
    }

    #[must_use]
    pub fn implemented(&self) -> &[MessageTypeName] {
        &self.implemented
    }

    /// Decodes a body into this type, returned type-erased.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationFailed` when the body does not decode.
    pub fn decode(&self, serializer: &MessageSerializer, body: &[u8]) -> Result<AnyMessage, Error> {
        (self.decode)(serializer, body)
    }
}

fn decode_erased<T: Message>(serializer: &MessageSerializer, body: &[u8]) -> Result<AnyMessage, Error> {
    let message: T = serializer.deserialize(body)?;
    Ok(Box::new(message))
}

/// Maps message-type identifiers to registered Rust types.
///
/// Filled at configuration time, then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct MessageTypeRegistry {
    by_urn: HashMap<String, RegisteredType>,
    by_type: HashMap<TypeId, String>,
}

impl MessageTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`. Registering the same type twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateMessageType` when another type already owns
    /// `T`'s identifier.
    pub fn register<T: Message>(&mut self) -> Result<&RegisteredType, Error> {
        self.insert(RegisteredType::of::<T>())
    }

    /// Registers an already described type. Registering the same type again
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateMessageType` when a different type already
    /// owns the identifier.
    pub fn insert(&mut self, entry: RegisteredType) -> Result<&RegisteredType, Error> {
        match self.by_urn.entry(entry.urn.clone()) {
            Entry::Occupied(existing) if existing.get().type_id != entry.type_id => {
                Err(Error::DuplicateMessageType {
                    urn: entry.urn,
                    existing: existing.get().rust_name,
                    rejected: entry.rust_name,
                })
            }
            Entry::Occupied(existing) => Ok(existing.into_mut()),
            Entry::Vacant(slot) => {
                self.by_type.insert(entry.type_id, entry.urn.clone());
                Ok(slot.insert(entry))
            }
        }
    }

    /// Resolves an identifier to its registered type.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMessageType` if nothing is registered under `urn`.
    pub fn resolve(&self, urn: &str) -> Result<&RegisteredType, Error> {
        self.by_urn
            .get(urn)
            .ok_or_else(|| Error::UnknownMessageType(urn.to_string()))
    }

    /// Identifier registered for `T`, if any.
    #[must_use]
    pub fn identifier_of<T: Message>(&self) -> Option<&str> {
        self.by_type.get(&TypeId::of::<T>()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, urn: &str) -> bool {
        self.by_urn.contains_key(urn)
    }

    /// Decodes `body` into the runtime type registered under `urn`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMessageType` for unregistered identifiers and
    /// `Error::DeserializationFailed` when the body does not decode.
    pub fn decode(
        &self,
        urn: &str,
        serializer: &MessageSerializer,
        body: &[u8],
    ) -> Result<AnyMessage, Error> {
        self.resolve(urn)?.decode(serializer, body)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_urn.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_urn.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredType> {
        self.by_urn.values()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

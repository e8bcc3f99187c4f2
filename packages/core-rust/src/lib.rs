//! Courier Core: message identity, endpoint addresses, envelopes, message-type
//! identifiers, body serializers, and the shared error taxonomy.

pub mod address;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod message_type;
pub mod serializer;

pub use address::{EndpointAddress, AMQP_SCHEME, IN_MEMORY_SCHEME};
pub use envelope::{headers, EnvelopeBuilder, HostInfo, MessageEnvelope};
pub use error::{BusResult, Error, ErrorKind, Errors, FailureKind};
pub use ids::{ConversationId, CorrelationId, MessageId};
pub use message_type::{AnyMessage, Message, MessageTypeName, MessageTypeRegistry, RegisteredType};
pub use serializer::MessageSerializer;


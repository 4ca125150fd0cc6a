//! # Registries
//!
//! Content-based dispatch for messages and player fields.
//!
//! A [`MessageRegistry`] tries the built-in message kinds first, then every custom
//! [`MessageDecoder`] in registration order. Registries are plain values shared through
//! `Arc`; nothing here is global, so two servers in one process may recognise different
//! extension sets.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use source_query_protocol::core::registry::{MessageRegistry, OpaqueMessageDecoder};
//!
//! let registry = MessageRegistry::with_player_ex();
//! registry
//!     .register_custom(Arc::new(OpaqueMessageDecoder::command(0x42)))
//!     .unwrap();
//! assert!(registry.identify(&[0x42]));
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::core::field::{fields, FieldDescriptor, PlayerField};
use crate::core::message::{
    CustomMessage, Message, S2aPlayerEx, SimpleCommand, A2S_PLAYER_EX_HEADER,
    S2A_PLAYER_EX_HEADER,
};
use crate::core::wire::WireReader;
use crate::error::{constants, ProtocolError, Result};

/// A caller-provided message kind
pub trait MessageDecoder: Send + Sync {
    /// Non-destructive check of the leading bytes
    fn identify(&self, bytes: &[u8]) -> bool;

    /// Decode a buffer this decoder identified
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Named player fields: the base set followed by a mutable custom set
pub struct FieldRegistry {
    custom: RwLock<Vec<FieldDescriptor>>,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRegistry")
            .field("custom", &self.custom.read().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}

impl FieldRegistry {
    /// Base fields plus the default custom set
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(fields::DEFAULT_CUSTOM.to_vec()),
        }
    }

    pub fn register_custom(&self, descriptor: FieldDescriptor) -> Result<()> {
        let mut custom = self
            .custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?;
        custom.push(descriptor);
        Ok(())
    }

    /// Forget every custom field, base fields stay
    pub fn clear_custom(&self) -> Result<()> {
        self.custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?
            .clear();
        Ok(())
    }

    /// Base descriptors followed by custom ones, in lookup order
    pub fn descriptors(&self) -> Result<Vec<FieldDescriptor>> {
        let custom = self
            .custom
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?;
        Ok(fields::BASE.iter().chain(custom.iter()).copied().collect())
    }

    /// Decode one field from `bytes`, naming it if a registered descriptor matches
    pub fn decode_field(&self, bytes: &[u8]) -> Result<PlayerField> {
        let registered = self.descriptors()?;
        PlayerField::decode(&mut WireReader::new(bytes), &registered)
    }
}

/// Decoder for the `A2S_PLAYER_EX` / `S2A_PLAYER_EX` extension
#[derive(Debug, Default)]
pub struct PlayerExDecoder {
    fields: Arc<FieldRegistry>,
}

impl PlayerExDecoder {
    pub fn new(fields: Arc<FieldRegistry>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Arc<FieldRegistry> {
        &self.fields
    }
}

impl MessageDecoder for PlayerExDecoder {
    fn identify(&self, bytes: &[u8]) -> bool {
        matches!(
            bytes.first(),
            Some(&A2S_PLAYER_EX_HEADER | &S2A_PLAYER_EX_HEADER)
        )
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let (&header, body) = bytes.split_first().ok_or(ProtocolError::NotIdentified)?;
        let mut reader = WireReader::new(body);
        match header {
            A2S_PLAYER_EX_HEADER => Ok(Message::A2sPlayerEx(SimpleCommand::decode(&mut reader)?)),
            S2A_PLAYER_EX_HEADER => {
                let registered = self.fields.descriptors()?;
                Ok(Message::S2aPlayerEx(S2aPlayerEx::decode(
                    &mut reader,
                    &registered,
                )?))
            }
            _ => Err(ProtocolError::NotIdentified),
        }
    }
}

/// Decoder for a caller-defined kind identified by a single header byte
#[derive(Debug, Clone, Copy)]
pub struct OpaqueMessageDecoder {
    header: u8,
    command: bool,
}

impl OpaqueMessageDecoder {
    /// Request kind: header followed by an optional challenge
    pub fn command(header: u8) -> Self {
        Self {
            header,
            command: true,
        }
    }

    /// Reply kind: body kept as raw bytes
    pub fn reply(header: u8) -> Self {
        Self {
            header,
            command: false,
        }
    }
}

impl MessageDecoder for OpaqueMessageDecoder {
    fn identify(&self, bytes: &[u8]) -> bool {
        bytes.first() == Some(&self.header)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let body = bytes.get(1..).ok_or(ProtocolError::NotIdentified)?;
        let custom = if self.command {
            CustomMessage::Command {
                header: self.header,
                challenge: WireReader::new(body).read_optional_i32()?,
            }
        } else {
            CustomMessage::Reply {
                header: self.header,
                body: Bytes::copy_from_slice(body),
            }
        };
        Ok(Message::Custom(custom))
    }
}

/// Message dispatch by content: built-in kinds, then custom decoders in order
pub struct MessageRegistry {
    custom: RwLock<Vec<Arc<dyn MessageDecoder>>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("custom", &self.custom_len())
            .finish()
    }
}

impl MessageRegistry {
    /// Built-in kinds only
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(Vec::new()),
        }
    }

    /// Built-in kinds plus the player-ex extension with the default field set
    pub fn with_player_ex() -> Self {
        Self::with_player_ex_fields(Arc::new(FieldRegistry::new()))
    }

    /// Built-in kinds plus the player-ex extension naming fields from `fields`
    pub fn with_player_ex_fields(fields: Arc<FieldRegistry>) -> Self {
        let decoder: Arc<dyn MessageDecoder> = Arc::new(PlayerExDecoder::new(fields));
        Self {
            custom: RwLock::new(vec![decoder]),
        }
    }

    pub fn register_custom(&self, decoder: Arc<dyn MessageDecoder>) -> Result<()> {
        let mut custom = self
            .custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?;
        custom.push(decoder);
        Ok(())
    }

    /// Drop every custom decoder, extensions included
    pub fn clear_custom(&self) -> Result<()> {
        self.custom
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?
            .clear();
        Ok(())
    }

    pub fn custom_len(&self) -> usize {
        self.custom.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn identify(&self, bytes: &[u8]) -> bool {
        if Message::identify_builtin(bytes) {
            return true;
        }
        self.custom
            .read()
            .map(|custom| custom.iter().any(|d| d.identify(bytes)))
            .unwrap_or(false)
    }

    /// Decode `bytes` with the first matching kind
    ///
    /// # Errors
    /// `NotIdentified` when no kind recognises the header, otherwise the decoder's error.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        if Message::identify_builtin(bytes) {
            return Message::decode_builtin(bytes);
        }

        let decoder = {
            let custom = self
                .custom
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_DECODER_LOCK.to_string()))?;
            custom.iter().find(|d| d.identify(bytes)).cloned()
        };

        match decoder {
            Some(decoder) => decoder.decode(bytes),
            None => Err(ProtocolError::NotIdentified),
        }
    }
}

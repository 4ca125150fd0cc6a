//! # Messages
//!
//! Logical query protocol messages. Each kind is identified by its first byte.
//!
//! | Kind | Header | Role |
//! |------|--------|------|
//! | `A2S_INFO` | `0x54` | request |
//! | `S2A_INFO` | `0x49` | reply |
//! | `A2S_PLAYER` | `0x55` | request |
//! | `S2A_PLAYER` | `0x44` | reply |
//! | `A2S_RULES` | `0x56` | request |
//! | `S2A_RULES` | `0x45` | reply |
//! | `S2C_CHALLENGE` | `0x41` | reply |
//! | `A2S_PLAYER_EX` | `0x70` | request (extension) |
//! | `S2A_PLAYER_EX` | `0x71` | reply (extension) |
//!
//! Requests carry an optional trailing challenge. It is absent when fewer than four bytes
//! remain and it is omitted, not zero-filled, when encoding an absent value.
//!
//! The extension kinds are only recognised by a [`MessageRegistry`](crate::core::registry::MessageRegistry)
//! that registered their decoder.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::codec::Encodable;
use crate::core::field::{FieldDescriptor, PlayerField};
use crate::core::wire::{put_cstring, WireReader};
use crate::error::{ProtocolError, Result};

pub const A2S_INFO_HEADER: u8 = 0x54;
pub const S2A_INFO_HEADER: u8 = 0x49;
pub const A2S_PLAYER_HEADER: u8 = 0x55;
pub const S2A_PLAYER_HEADER: u8 = 0x44;
pub const A2S_RULES_HEADER: u8 = 0x56;
pub const S2A_RULES_HEADER: u8 = 0x45;
pub const S2C_CHALLENGE_HEADER: u8 = 0x41;
pub const A2S_PLAYER_EX_HEADER: u8 = 0x70;
pub const S2A_PLAYER_EX_HEADER: u8 = 0x71;

/// Payload every well-behaved A2S_INFO carries
pub const DEFAULT_INFO_PAYLOAD: &str = "Source Engine Query";

/// Challenge value meaning "send me a fresh challenge"
pub const CHALLENGE_REQUEST: i32 = -1;

/// Extra data flag bits of S2A_INFO
pub mod edf {
    pub const PORT: u8 = 0x80;
    pub const STEAM_ID: u8 = 0x10;
    pub const SPECTATOR: u8 = 0x40;
    pub const KEYWORDS: u8 = 0x20;
    pub const GAME_ID: u8 = 0x01;
}

const ERR_COUNT_OVERFLOW: &str = "Too many records for the count field";
const ERR_NEGATIVE_COUNT: &str = "Negative record count";

fn put_optional_challenge(buf: &mut BytesMut, challenge: Option<i32>) {
    if let Some(challenge) = challenge {
        buf.put_i32_le(challenge);
    }
}

/// `A2S_INFO` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A2sInfo {
    pub payload: String,
    pub challenge: Option<i32>,
}

impl Default for A2sInfo {
    fn default() -> Self {
        Self {
            payload: DEFAULT_INFO_PAYLOAD.to_string(),
            challenge: None,
        }
    }
}

impl A2sInfo {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            payload: reader.read_cstring()?,
            challenge: reader.read_optional_i32()?,
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_cstring(buf, &self.payload);
        put_optional_challenge(buf, self.challenge);
    }
}

/// Body shared by the requests that only carry a challenge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    pub challenge: Option<i32>,
}

impl SimpleCommand {
    pub fn with_challenge(challenge: i32) -> Self {
        Self {
            challenge: Some(challenge),
        }
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            challenge: reader.read_optional_i32()?,
        })
    }
}

/// `S2A_INFO` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S2aInfo {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub id: i16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub server_type: u8,
    pub environment: u8,
    pub visibility: u8,
    pub vac: u8,
    pub version: String,
    pub port: Option<i16>,
    pub steam_id: Option<u64>,
    pub spec_port: Option<i16>,
    pub spec_name: Option<String>,
    pub keywords: Option<String>,
    pub game_id: Option<u64>,
}

impl Default for S2aInfo {
    fn default() -> Self {
        Self {
            protocol: 48,
            name: String::new(),
            map: String::new(),
            folder: String::new(),
            game: String::new(),
            id: 0,
            players: 0,
            max_players: 0,
            bots: 0,
            server_type: b'd',
            environment: b'w',
            visibility: 0,
            vac: 0,
            version: String::new(),
            port: None,
            steam_id: None,
            spec_port: None,
            spec_name: None,
            keywords: None,
            game_id: None,
        }
    }
}

impl S2aInfo {
    /// Extra data flag derived from the optional groups that are present.
    ///
    /// The spectator group is only announced when both its port and name are set.
    pub fn extra_data_flag(&self) -> u8 {
        let mut flag = 0;
        if self.port.is_some() {
            flag |= edf::PORT;
        }
        if self.steam_id.is_some() {
            flag |= edf::STEAM_ID;
        }
        if self.spec_port.is_some() && self.spec_name.is_some() {
            flag |= edf::SPECTATOR;
        }
        if self.keywords.is_some() {
            flag |= edf::KEYWORDS;
        }
        if self.game_id.is_some() {
            flag |= edf::GAME_ID;
        }
        flag
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let mut info = Self {
            protocol: reader.read_u8()?,
            name: reader.read_cstring()?,
            map: reader.read_cstring()?,
            folder: reader.read_cstring()?,
            game: reader.read_cstring()?,
            id: reader.read_i16()?,
            players: reader.read_u8()?,
            max_players: reader.read_u8()?,
            bots: reader.read_u8()?,
            server_type: reader.read_u8()?,
            environment: reader.read_u8()?,
            visibility: reader.read_u8()?,
            vac: reader.read_u8()?,
            version: reader.read_cstring()?,
            ..Self::default()
        };

        let flag = reader.read_u8()?;
        if flag & edf::PORT != 0 {
            info.port = Some(reader.read_i16()?);
        }
        if flag & edf::STEAM_ID != 0 {
            info.steam_id = Some(reader.read_u64()?);
        }
        if flag & edf::SPECTATOR != 0 {
            info.spec_port = Some(reader.read_i16()?);
            info.spec_name = Some(reader.read_cstring()?);
        }
        if flag & edf::KEYWORDS != 0 {
            info.keywords = Some(reader.read_cstring()?);
        }
        if flag & edf::GAME_ID != 0 {
            info.game_id = Some(reader.read_u64()?);
        }
        Ok(info)
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol);
        put_cstring(buf, &self.name);
        put_cstring(buf, &self.map);
        put_cstring(buf, &self.folder);
        put_cstring(buf, &self.game);
        buf.put_i16_le(self.id);
        buf.put_u8(self.players);
        buf.put_u8(self.max_players);
        buf.put_u8(self.bots);
        buf.put_u8(self.server_type);
        buf.put_u8(self.environment);
        buf.put_u8(self.visibility);
        buf.put_u8(self.vac);
        put_cstring(buf, &self.version);

        buf.put_u8(self.extra_data_flag());
        if let Some(port) = self.port {
            buf.put_i16_le(port);
        }
        if let Some(steam_id) = self.steam_id {
            buf.put_u64_le(steam_id);
        }
        if let (Some(spec_port), Some(spec_name)) = (self.spec_port, &self.spec_name) {
            buf.put_i16_le(spec_port);
            put_cstring(buf, spec_name);
        }
        if let Some(keywords) = &self.keywords {
            put_cstring(buf, keywords);
        }
        if let Some(game_id) = self.game_id {
            buf.put_u64_le(game_id);
        }
    }
}

/// One entry of `S2A_PLAYER`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerRecord {
    pub index: u8,
    pub name: String,
    pub score: i32,
    /// Seconds connected
    pub duration: f32,
}

/// `S2A_PLAYER` reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct S2aPlayer {
    pub players: Vec<PlayerRecord>,
}

impl S2aPlayer {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let count = reader.read_u8()?;
        let mut players = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            players.push(PlayerRecord {
                index: reader.read_u8()?,
                name: reader.read_cstring()?,
                score: reader.read_i32()?,
                duration: reader.read_f32()?,
            });
        }
        Ok(Self { players })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        let count = u8::try_from(self.players.len())
            .map_err(|_| ProtocolError::wrong_header(ERR_COUNT_OVERFLOW))?;
        buf.put_u8(count);
        for player in &self.players {
            buf.put_u8(player.index);
            put_cstring(buf, &player.name);
            buf.put_i32_le(player.score);
            buf.put_f32_le(player.duration);
        }
        Ok(())
    }
}

/// One key/value pair of `S2A_RULES`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub value: String,
}

impl Rule {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `S2A_RULES` reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S2aRules {
    pub rules: Vec<Rule>,
}

impl S2aRules {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let count = reader.read_i16()?;
        let count =
            usize::try_from(count).map_err(|_| ProtocolError::wrong_header(ERR_NEGATIVE_COUNT))?;
        let mut rules = Vec::with_capacity(count.min(reader.remaining() / 2));
        for _ in 0..count {
            rules.push(Rule {
                name: reader.read_cstring()?,
                value: reader.read_cstring()?,
            });
        }
        Ok(Self { rules })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        let count = i16::try_from(self.rules.len())
            .map_err(|_| ProtocolError::wrong_header(ERR_COUNT_OVERFLOW))?;
        buf.put_i16_le(count);
        for rule in &self.rules {
            put_cstring(buf, &rule.name);
            put_cstring(buf, &rule.value);
        }
        Ok(())
    }
}

/// `S2C_CHALLENGE` reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct S2cChallenge {
    pub challenge: i32,
}

/// One entry of `S2A_PLAYER_EX`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerExRecord {
    pub index: i32,
    pub fields: Vec<PlayerField>,
}

impl PlayerExRecord {
    pub fn new(index: i32) -> Self {
        Self {
            index,
            fields: Vec::new(),
        }
    }

    /// First field carrying the given attribute
    pub fn field(&self, descriptor: &FieldDescriptor) -> Option<&PlayerField> {
        self.fields.iter().find(|f| f.is(descriptor))
    }
}

/// `S2A_PLAYER_EX` reply: per-player self-describing attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct S2aPlayerEx {
    pub players: Vec<PlayerExRecord>,
}

impl S2aPlayerEx {
    /// Decode with `registered` naming the attributes it recognises
    pub(crate) fn decode(
        reader: &mut WireReader<'_>,
        registered: &[FieldDescriptor],
    ) -> Result<Self> {
        let count = reader.read_u8()?;
        let mut players = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let index = reader.read_i32()?;
            let field_count = reader.read_i16()?;
            let field_count = usize::try_from(field_count)
                .map_err(|_| ProtocolError::wrong_header(ERR_NEGATIVE_COUNT))?;
            let mut fields = Vec::with_capacity(field_count.min(reader.remaining() / 2));
            for _ in 0..field_count {
                fields.push(PlayerField::decode(reader, registered)?);
            }
            players.push(PlayerExRecord { index, fields });
        }
        Ok(Self { players })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        let count = u8::try_from(self.players.len())
            .map_err(|_| ProtocolError::wrong_header(ERR_COUNT_OVERFLOW))?;
        buf.put_u8(count);
        for player in &self.players {
            let field_count = i16::try_from(player.fields.len())
                .map_err(|_| ProtocolError::wrong_header(ERR_COUNT_OVERFLOW))?;
            buf.put_i32_le(player.index);
            buf.put_i16_le(field_count);
            for field in &player.fields {
                field.encode_into(buf)?;
            }
        }
        Ok(())
    }
}

/// Message kind added by a caller-registered decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomMessage {
    /// Request laid out as header + optional challenge
    Command { header: u8, challenge: Option<i32> },
    /// Any other message, body kept verbatim
    Reply { header: u8, body: Bytes },
}

impl CustomMessage {
    pub fn header(&self) -> u8 {
        match self {
            CustomMessage::Command { header, .. } | CustomMessage::Reply { header, .. } => *header,
        }
    }
}

/// A logical query protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    A2sInfo(A2sInfo),
    S2aInfo(S2aInfo),
    A2sPlayer(SimpleCommand),
    S2aPlayer(S2aPlayer),
    A2sRules(SimpleCommand),
    S2aRules(S2aRules),
    S2cChallenge(S2cChallenge),
    A2sPlayerEx(SimpleCommand),
    S2aPlayerEx(S2aPlayerEx),
    Custom(CustomMessage),
}

impl Message {
    /// Default info request
    pub fn info_request() -> Self {
        Message::A2sInfo(A2sInfo::default())
    }

    pub fn player_request() -> Self {
        Message::A2sPlayer(SimpleCommand::default())
    }

    pub fn rules_request() -> Self {
        Message::A2sRules(SimpleCommand::default())
    }

    pub fn player_ex_request() -> Self {
        Message::A2sPlayerEx(SimpleCommand::default())
    }

    pub fn challenge_reply(challenge: i32) -> Self {
        Message::S2cChallenge(S2cChallenge { challenge })
    }

    /// First byte on the wire
    pub fn header(&self) -> u8 {
        match self {
            Message::A2sInfo(_) => A2S_INFO_HEADER,
            Message::S2aInfo(_) => S2A_INFO_HEADER,
            Message::A2sPlayer(_) => A2S_PLAYER_HEADER,
            Message::S2aPlayer(_) => S2A_PLAYER_HEADER,
            Message::A2sRules(_) => A2S_RULES_HEADER,
            Message::S2aRules(_) => S2A_RULES_HEADER,
            Message::S2cChallenge(_) => S2C_CHALLENGE_HEADER,
            Message::A2sPlayerEx(_) => A2S_PLAYER_EX_HEADER,
            Message::S2aPlayerEx(_) => S2A_PLAYER_EX_HEADER,
            Message::Custom(custom) => custom.header(),
        }
    }

    /// Human readable kind, used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::A2sInfo(_) => "A2S_INFO",
            Message::S2aInfo(_) => "S2A_INFO",
            Message::A2sPlayer(_) => "A2S_PLAYER",
            Message::S2aPlayer(_) => "S2A_PLAYER",
            Message::A2sRules(_) => "A2S_RULES",
            Message::S2aRules(_) => "S2A_RULES",
            Message::S2cChallenge(_) => "S2C_CHALLENGE",
            Message::A2sPlayerEx(_) => "A2S_PLAYER_EX",
            Message::S2aPlayerEx(_) => "S2A_PLAYER_EX",
            Message::Custom(CustomMessage::Command { .. }) => "CUSTOM_COMMAND",
            Message::Custom(CustomMessage::Reply { .. }) => "CUSTOM_REPLY",
        }
    }

    /// Whether this is a request that carries a challenge
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Message::A2sInfo(_)
                | Message::A2sPlayer(_)
                | Message::A2sRules(_)
                | Message::A2sPlayerEx(_)
                | Message::Custom(CustomMessage::Command { .. })
        )
    }

    /// The challenge of a command, `None` when absent or not a command
    pub fn challenge(&self) -> Option<i32> {
        match self {
            Message::A2sInfo(info) => info.challenge,
            Message::A2sPlayer(cmd) | Message::A2sRules(cmd) | Message::A2sPlayerEx(cmd) => {
                cmd.challenge
            }
            Message::Custom(CustomMessage::Command { challenge, .. }) => *challenge,
            _ => None,
        }
    }

    /// Stamp a challenge onto a command. Returns `false` for non-commands.
    pub fn set_challenge(&mut self, value: Option<i32>) -> bool {
        let slot = match self {
            Message::A2sInfo(info) => &mut info.challenge,
            Message::A2sPlayer(cmd) | Message::A2sRules(cmd) | Message::A2sPlayerEx(cmd) => {
                &mut cmd.challenge
            }
            Message::Custom(CustomMessage::Command { challenge, .. }) => challenge,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Decode one of the built-in kinds (extensions excluded)
    ///
    /// # Errors
    /// `NotIdentified` when the header is not a built-in kind, `WrongHeader` when the body
    /// is truncated.
    pub fn decode_builtin(bytes: &[u8]) -> Result<Self> {
        let (&header, body) = bytes.split_first().ok_or(ProtocolError::NotIdentified)?;
        let mut reader = WireReader::new(body);
        Ok(match header {
            A2S_INFO_HEADER => Message::A2sInfo(A2sInfo::decode(&mut reader)?),
            S2A_INFO_HEADER => Message::S2aInfo(S2aInfo::decode(&mut reader)?),
            A2S_PLAYER_HEADER => Message::A2sPlayer(SimpleCommand::decode(&mut reader)?),
            S2A_PLAYER_HEADER => Message::S2aPlayer(S2aPlayer::decode(&mut reader)?),
            A2S_RULES_HEADER => Message::A2sRules(SimpleCommand::decode(&mut reader)?),
            S2A_RULES_HEADER => Message::S2aRules(S2aRules::decode(&mut reader)?),
            S2C_CHALLENGE_HEADER => Message::S2cChallenge(S2cChallenge {
                challenge: reader.read_i32()?,
            }),
            _ => return Err(ProtocolError::NotIdentified),
        })
    }

    /// Whether `bytes` starts with a built-in header
    pub fn identify_builtin(bytes: &[u8]) -> bool {
        matches!(
            bytes.first(),
            Some(
                &A2S_INFO_HEADER
                    | &S2A_INFO_HEADER
                    | &A2S_PLAYER_HEADER
                    | &S2A_PLAYER_HEADER
                    | &A2S_RULES_HEADER
                    | &S2A_RULES_HEADER
                    | &S2C_CHALLENGE_HEADER
            )
        )
    }
}

impl Encodable for Message {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.header());
        match self {
            Message::A2sInfo(info) => info.encode_body(buf),
            Message::S2aInfo(info) => info.encode_body(buf),
            Message::A2sPlayer(cmd) | Message::A2sRules(cmd) | Message::A2sPlayerEx(cmd) => {
                put_optional_challenge(buf, cmd.challenge)
            }
            Message::S2aPlayer(reply) => reply.encode_body(buf)?,
            Message::S2aRules(reply) => reply.encode_body(buf)?,
            Message::S2cChallenge(reply) => buf.put_i32_le(reply.challenge),
            Message::S2aPlayerEx(reply) => reply.encode_body(buf)?,
            Message::Custom(CustomMessage::Command { challenge, .. }) => {
                put_optional_challenge(buf, *challenge)
            }
            Message::Custom(CustomMessage::Reply { body, .. }) => buf.put_slice(body),
        }
        Ok(())
    }
}

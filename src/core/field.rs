//! # Extensible Player Fields
//!
//! Self-describing attribute encoding used by the extended player reply.
//!
//! ## Wire Format
//! ```text
//! [Type(1)] [AttrId(1)] ([ExtAttrId(1)] if extended) [Value]
//!
//! Type: bits 0-5 primitive (1 byte, 2 short, 3 int, 4 string, 5 float)
//!       bit 6    custom attribute namespace
//!       bit 7    extended (an ExtAttrId byte follows)
//! ```
//!
//! A field is either a [`PlayerField::Known`] attribute, matched against a registered
//! [`FieldDescriptor`], or an [`PlayerField::Unknown`] one that still keeps its tag and
//! value so it survives a round trip.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::core::codec::Encodable;
use crate::core::wire::{put_cstring, WireReader};
use crate::error::{constants, ProtocolError, Result};

/// Low 6 bits of the type byte
pub const TYPE_MASK: u8 = 0x3F;

/// Custom attribute namespace flag
pub const CUSTOM_FLAG: u8 = 0x40;

/// Extended attribute id flag
pub const EXTENDED_FLAG: u8 = 0x80;

/// Primitive value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    Byte = 1,
    Short = 2,
    Int = 3,
    Str = 4,
    Float = 5,
}

impl FieldKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FieldKind::Byte),
            2 => Some(FieldKind::Short),
            3 => Some(FieldKind::Int),
            4 => Some(FieldKind::Str),
            5 => Some(FieldKind::Float),
            _ => None,
        }
    }

    /// Display name used for attributes nobody registered
    pub fn unknown_name(self) -> &'static str {
        match self {
            FieldKind::Byte => "Unknown Byte Attribute",
            FieldKind::Short => "Unknown Short Attribute",
            FieldKind::Int => "Unknown Int Attribute",
            FieldKind::Str => "Unknown String Attribute",
            FieldKind::Float => "Unknown Float Attribute",
        }
    }
}

/// Everything that identifies an attribute on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldTag {
    /// Primitive type, low 6 bits of the type byte
    pub raw_type: u8,
    pub attr_id: u8,
    pub custom: bool,
    pub extended: bool,
    pub ext_attr_id: u8,
}

impl FieldTag {
    pub const fn new(kind: FieldKind, attr_id: u8) -> Self {
        Self {
            raw_type: kind as u8,
            attr_id,
            custom: false,
            extended: false,
            ext_attr_id: 0,
        }
    }

    /// Same tag in the custom namespace
    pub const fn custom(mut self) -> Self {
        self.custom = true;
        self
    }

    /// Same tag with an extended attribute id
    pub const fn extended(mut self, ext_attr_id: u8) -> Self {
        self.extended = true;
        self.ext_attr_id = ext_attr_id;
        self
    }

    pub fn kind(&self) -> Option<FieldKind> {
        FieldKind::from_raw(self.raw_type)
    }

    /// Compose the type byte
    ///
    /// # Errors
    /// `InvalidField` if the primitive is 0 or above the 6-bit range, or if an extended
    /// attribute id is set without the extended flag.
    pub fn type_byte(&self) -> Result<u8> {
        if self.raw_type == 0 || self.raw_type >= TYPE_MASK {
            return Err(ProtocolError::InvalidField(constants::ERR_FIELD_TYPE));
        }
        if !self.extended && self.ext_attr_id > 0 {
            return Err(ProtocolError::InvalidField(constants::ERR_FIELD_EXT_ID));
        }

        let mut byte = self.raw_type & TYPE_MASK;
        if self.custom {
            byte |= CUSTOM_FLAG;
        }
        if self.extended {
            byte |= EXTENDED_FLAG;
        }
        Ok(byte)
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.type_byte()?);
        buf.put_u8(self.attr_id);
        if self.extended {
            buf.put_u8(self.ext_attr_id);
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let type_byte = reader.read_u8()?;
        let attr_id = reader.read_u8()?;
        let extended = type_byte & EXTENDED_FLAG != 0;
        let ext_attr_id = if extended { reader.read_u8()? } else { 0 };

        Ok(Self {
            raw_type: type_byte & TYPE_MASK,
            attr_id,
            custom: type_byte & CUSTOM_FLAG != 0,
            extended,
            ext_attr_id,
        })
    }
}

/// Primitive field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Byte(u8),
    Short(i16),
    Int(i32),
    Str(String),
    Float(f32),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Byte(_) => FieldKind::Byte,
            FieldValue::Short(_) => FieldKind::Short,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Float(_) => FieldKind::Float,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            FieldValue::Byte(v) => buf.put_u8(*v),
            FieldValue::Short(v) => buf.put_i16_le(*v),
            FieldValue::Int(v) => buf.put_i32_le(*v),
            FieldValue::Str(v) => put_cstring(buf, v),
            FieldValue::Float(v) => buf.put_f32_le(*v),
        }
    }

    fn decode(kind: FieldKind, reader: &mut WireReader<'_>) -> Result<Self> {
        Ok(match kind {
            FieldKind::Byte => FieldValue::Byte(reader.read_u8()?),
            FieldKind::Short => FieldValue::Short(reader.read_i16()?),
            FieldKind::Int => FieldValue::Int(reader.read_i32()?),
            FieldKind::Str => FieldValue::Str(reader.read_cstring()?),
            FieldKind::Float => FieldValue::Float(reader.read_f32()?),
        })
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Byte(v) => write!(f, "{v}"),
            FieldValue::Short(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Str(v) => f.write_str(v),
            FieldValue::Float(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for FieldValue {
            fn from(value: $ty) -> Self {
                FieldValue::$variant(value.into())
            }
        })*
    };
}

impl_from_value!(u8 => Byte, i16 => Short, i32 => Int, String => Str, &str => Str, f32 => Float);

/// A named attribute that decoders recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub tag: FieldTag,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind, attr_id: u8) -> Self {
        Self {
            name,
            tag: FieldTag::new(kind, attr_id),
        }
    }

    /// Descriptor in the custom namespace
    pub const fn custom(name: &'static str, kind: FieldKind, attr_id: u8) -> Self {
        Self {
            name,
            tag: FieldTag::new(kind, attr_id).custom(),
        }
    }

    /// Attach a value to this attribute
    pub fn with(self, value: impl Into<FieldValue>) -> PlayerField {
        PlayerField::Known {
            descriptor: self,
            value: value.into(),
        }
    }
}

/// One attribute of an extended player record
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerField {
    Known {
        descriptor: FieldDescriptor,
        value: FieldValue,
    },
    Unknown {
        tag: FieldTag,
        value: FieldValue,
    },
}

impl PlayerField {
    pub fn tag(&self) -> &FieldTag {
        match self {
            PlayerField::Known { descriptor, .. } => &descriptor.tag,
            PlayerField::Unknown { tag, .. } => tag,
        }
    }

    pub fn value(&self) -> &FieldValue {
        match self {
            PlayerField::Known { value, .. } | PlayerField::Unknown { value, .. } => value,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlayerField::Known { descriptor, .. } => descriptor.name,
            PlayerField::Unknown { value, .. } => value.kind().unknown_name(),
        }
    }

    /// Whether this field carries the given attribute
    pub fn is(&self, descriptor: &FieldDescriptor) -> bool {
        self.tag() == &descriptor.tag
    }

    /// Decode a field, naming it from `registered` when a descriptor matches its tag
    ///
    /// # Errors
    /// `NotIdentified` for an unknown primitive type, `WrongHeader` on truncation.
    pub(crate) fn decode<'a, I>(reader: &mut WireReader<'_>, registered: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a FieldDescriptor>,
    {
        let tag = FieldTag::decode(reader)?;
        let kind = tag.kind().ok_or(ProtocolError::NotIdentified)?;
        let value = FieldValue::decode(kind, reader)?;

        Ok(match registered.into_iter().find(|d| d.tag == tag) {
            Some(descriptor) => PlayerField::Known {
                descriptor: *descriptor,
                value,
            },
            None => PlayerField::Unknown { tag, value },
        })
    }
}

impl Encodable for PlayerField {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let tag = self.tag();
        if tag.kind() != Some(self.value().kind()) {
            return Err(ProtocolError::InvalidField(constants::ERR_FIELD_VALUE));
        }
        tag.encode_into(buf)?;
        self.value().encode_into(buf);
        Ok(())
    }
}

impl fmt::Display for PlayerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        write!(f, "[{}] {} ", tag.attr_id, self.name())?;
        if tag.custom {
            f.write_str("[CUSTOM]")?;
        }
        if tag.extended {
            f.write_str("[EXT]")?;
        }
        if tag.custom || tag.extended {
            f.write_str(" ")?;
        }
        write!(f, ": {}", self.value())
    }
}

/// Well-known attributes
pub mod fields {
    use super::{FieldDescriptor, FieldKind};

    pub const IS_IN_TEAM: FieldDescriptor = FieldDescriptor::new("IsInTeam", FieldKind::Byte, 36);
    pub const TEAM_ID: FieldDescriptor = FieldDescriptor::new("TeamId", FieldKind::Byte, 37);
    pub const IS_BOT: FieldDescriptor = FieldDescriptor::new("IsBot", FieldKind::Byte, 41);
    pub const IS_ADMIN: FieldDescriptor = FieldDescriptor::new("IsAdmin", FieldKind::Byte, 42);
    pub const IS_SPECTATING: FieldDescriptor =
        FieldDescriptor::new("IsSpectating", FieldKind::Byte, 43);
    pub const IS_AUTHENTICATED: FieldDescriptor =
        FieldDescriptor::new("IsAuthenticated", FieldKind::Byte, 44);

    pub const PING: FieldDescriptor = FieldDescriptor::new("Ping (ms)", FieldKind::Short, 35);

    pub const SCORE: FieldDescriptor = FieldDescriptor::new("Score", FieldKind::Int, 38);
    pub const ARMY_VALUE: FieldDescriptor = FieldDescriptor::new("ArmyValue", FieldKind::Int, 97);
    pub const ASSETS_VALUE: FieldDescriptor =
        FieldDescriptor::new("AssetsValue", FieldKind::Int, 98);
    pub const BUILDINGS_DEAD: FieldDescriptor =
        FieldDescriptor::new("BuildingsDead", FieldKind::Int, 99);
    pub const BUILDINGS_KILLED: FieldDescriptor =
        FieldDescriptor::new("BuildingsKilled", FieldKind::Int, 100);
    pub const EARNED: FieldDescriptor = FieldDescriptor::new("Earned", FieldKind::Int, 101);
    pub const UNITS_DEAD: FieldDescriptor = FieldDescriptor::new("UnitsDead", FieldKind::Int, 102);
    pub const UNITS_KILLED: FieldDescriptor =
        FieldDescriptor::new("UnitsKilled", FieldKind::Int, 103);

    pub const UUID: FieldDescriptor = FieldDescriptor::new("UUID", FieldKind::Str, 32);
    pub const NAME: FieldDescriptor = FieldDescriptor::new("Name", FieldKind::Str, 33);
    pub const FULL_NAME: FieldDescriptor = FieldDescriptor::new("FullName", FieldKind::Str, 34);
    pub const IP: FieldDescriptor = FieldDescriptor::new("IP", FieldKind::Str, 40);
    pub const FACTION: FieldDescriptor = FieldDescriptor::new("Faction", FieldKind::Str, 45);

    pub const CONNECTION_TIME: FieldDescriptor =
        FieldDescriptor::new("ConnectionTime (s)", FieldKind::Float, 39);
    pub const APM: FieldDescriptor = FieldDescriptor::new("APM", FieldKind::Float, 96);
    pub const MAP_EXPLORED: FieldDescriptor =
        FieldDescriptor::new("MapExplored (%)", FieldKind::Float, 104);

    // Game-specific counters live in the custom namespace
    pub const NB_HARVESTER: FieldDescriptor =
        FieldDescriptor::custom("NbHarvester", FieldKind::Int, 32);
    pub const NB_CARRY_ALL: FieldDescriptor =
        FieldDescriptor::custom("NbCarryAll", FieldKind::Int, 33);
    pub const NB_FACTORY: FieldDescriptor = FieldDescriptor::custom("NbFactory", FieldKind::Int, 34);
    pub const NB_HEAVY_FACTORY: FieldDescriptor =
        FieldDescriptor::custom("NbHeavyFactory", FieldKind::Int, 35);
    pub const NB_BARRACK: FieldDescriptor = FieldDescriptor::custom("NbBarrack", FieldKind::Int, 36);
    pub const NB_STAR_PORT: FieldDescriptor =
        FieldDescriptor::custom("NbStarPort", FieldKind::Int, 37);
    pub const NB_COMMAND_CENTER: FieldDescriptor =
        FieldDescriptor::custom("NbCommandCenter", FieldKind::Int, 38);

    /// Attributes every field registry knows
    pub const BASE: &[FieldDescriptor] = &[
        IS_IN_TEAM,
        TEAM_ID,
        IS_BOT,
        IS_ADMIN,
        IS_SPECTATING,
        IS_AUTHENTICATED,
        PING,
        SCORE,
        ARMY_VALUE,
        ASSETS_VALUE,
        BUILDINGS_DEAD,
        BUILDINGS_KILLED,
        EARNED,
        UNITS_DEAD,
        UNITS_KILLED,
        UUID,
        NAME,
        FULL_NAME,
        IP,
        FACTION,
        CONNECTION_TIME,
        APM,
        MAP_EXPLORED,
    ];

    /// Custom attributes a fresh registry starts with
    pub const DEFAULT_CUSTOM: &[FieldDescriptor] = &[
        NB_HARVESTER,
        NB_CARRY_ALL,
        NB_FACTORY,
        NB_HEAVY_FACTORY,
        NB_BARRACK,
        NB_STAR_PORT,
        NB_COMMAND_CENTER,
    ];
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], registered: &[FieldDescriptor]) -> Result<PlayerField> {
        PlayerField::decode(&mut WireReader::new(bytes), registered)
    }

    #[test]
    fn test_known_field_layout() {
        let bytes = fields::SCORE.with(42i32).to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x03, 38, 42, 0x00, 0x00, 0x00]);

        let bytes = fields::NAME.with("P1").to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x04, 33, b'P', b'1', 0x00]);

        let bytes = fields::NB_BARRACK.with(3i32).to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0x43, 36, 0x03, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_known_field_decode() {
        let field = decode(&[0x02, 35, 0x10, 0x00], fields::BASE).unwrap();
        assert!(field.is(&fields::PING));
        assert_eq!(field.value(), &FieldValue::Short(16));
        assert_eq!(field.name(), "Ping (ms)");
    }

    #[test]
    fn test_custom_namespace_is_distinct() {
        // Int attribute 38 is Score in the base namespace and NbCommandCenter in the custom one
        let base = decode(&[0x03, 38, 1, 0, 0, 0], fields::DEFAULT_CUSTOM).unwrap();
        assert!(matches!(base, PlayerField::Unknown { .. }));

        let custom = decode(&[0x43, 38, 1, 0, 0, 0], fields::DEFAULT_CUSTOM).unwrap();
        assert!(custom.is(&fields::NB_COMMAND_CENTER));
    }

    #[test]
    fn test_unknown_extended_field_roundtrip() {
        let bytes = [0xC5, 200, 7, 0x00, 0x00, 0x80, 0x3F];
        let field = decode(&bytes, fields::BASE).unwrap();
        match &field {
            PlayerField::Unknown { tag, value } => {
                assert!(tag.custom);
                assert!(tag.extended);
                assert_eq!(tag.attr_id, 200);
                assert_eq!(tag.ext_attr_id, 7);
                assert_eq!(value, &FieldValue::Float(1.0));
            }
            other => panic!("expected unknown field, got {other:?}"),
        }
        assert_eq!(field.name(), "Unknown Float Attribute");
        assert_eq!(&field.to_bytes().unwrap()[..], &bytes[..]);
    }

    #[test]
    fn test_unknown_primitive_not_identified() {
        assert!(matches!(
            decode(&[0x06, 1, 0], fields::BASE),
            Err(ProtocolError::NotIdentified)
        ));
    }

    #[test]
    fn test_encode_rejects_invalid_tags() {
        let zero = PlayerField::Unknown {
            tag: FieldTag {
                raw_type: 0,
                attr_id: 1,
                custom: false,
                extended: false,
                ext_attr_id: 0,
            },
            value: FieldValue::Byte(1),
        };
        assert!(matches!(
            zero.to_bytes(),
            Err(ProtocolError::InvalidField(_))
        ));

        let mut tag = FieldTag::new(FieldKind::Byte, 1);
        tag.ext_attr_id = 4;
        let dangling_ext = PlayerField::Unknown {
            tag,
            value: FieldValue::Byte(1),
        };
        assert!(dangling_ext.to_bytes().is_err());

        let mismatched = fields::SCORE.with("not an int");
        assert!(mismatched.to_bytes().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(fields::SCORE.with(7i32).to_string(), "[38] Score : 7");
        assert_eq!(
            fields::NB_FACTORY.with(2i32).to_string(),
            "[34] NbFactory [CUSTOM] : 2"
        );
    }
}

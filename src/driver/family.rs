//! Protocol families and their type-code encodings.
//!
//! Each family encodes type information differently on the wire; this module
//! normalizes the operations the gateway needs (type names, structure and
//! array detection, element sizes, volatile-kind classification) without
//! leaking family specifics into the pipeline.
//!
//! Type-code layout follows the family conventions:
//!
//! - **Logix**: CIP elementary codes (`0xC1` BOOL .. `0xDA` STRING); bit 15
//!   marks a structured type, bit 13 an array.
//! - **S7**: transport sizes (`0x01` BIT .. `0x1C` COUNTER); `0xFF00` block
//!   marks a UDT.
//! - **Omron**: FINS-flavored codes mirroring the CIP set.
//! - **Beckhoff**: ADS base types; `0x8000` block marks a structure.
//! - **Sim**: the in-crate simulated family, using the Logix encoding.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Structured-type flag bit (Logix/Omron/Beckhoff encodings).
pub const TYPE_STRUCT_BIT: u16 = 0x8000;

/// Array flag bit (Logix/Omron encodings).
pub const TYPE_ARRAY_BIT: u16 = 0x2000;

/// Mask selecting the base type code.
pub const TYPE_BASE_MASK: u16 = 0x0FFF;

// Logix/CIP elementary type codes (low 12 bits).
pub const CIP_BOOL: u16 = 0x0C1;
pub const CIP_SINT: u16 = 0x0C2;
pub const CIP_INT: u16 = 0x0C3;
pub const CIP_DINT: u16 = 0x0C4;
pub const CIP_LINT: u16 = 0x0C5;
pub const CIP_REAL: u16 = 0x0CA;
pub const CIP_LREAL: u16 = 0x0CB;
pub const CIP_TIMER: u16 = 0x0C6;
pub const CIP_DATE_TIME: u16 = 0x0C7;
pub const CIP_STRING: u16 = 0x0DA;

/// Supported protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// Allen-Bradley Logix (EtherNet/IP + CIP).
    Logix,

    /// Siemens S7 (S7comm).
    S7,

    /// Omron (FINS / CIP).
    Omron,

    /// Beckhoff TwinCAT (ADS).
    Beckhoff,

    /// In-crate simulated controller, for tests and demos.
    Sim,
}

impl ProtocolFamily {
    /// Driver name used in health output and logs.
    pub const fn driver_name(&self) -> &'static str {
        match self {
            Self::Logix => "logix",
            Self::S7 => "s7",
            Self::Omron => "omron",
            Self::Beckhoff => "beckhoff",
            Self::Sim => "sim",
        }
    }

    /// All families, for CLI listings.
    pub const fn all() -> &'static [ProtocolFamily] {
        &[
            Self::Logix,
            Self::S7,
            Self::Omron,
            Self::Beckhoff,
            Self::Sim,
        ]
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.driver_name())
    }
}

impl std::str::FromStr for ProtocolFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        for family in Self::all() {
            if s.eq_ignore_ascii_case(family.driver_name()) {
                return Ok(*family);
            }
        }
        Err(format!("unknown protocol family: {}", s))
    }
}

/// Check if a type code denotes a structured (UDT) type.
pub fn is_structured(family: ProtocolFamily, type_code: u16) -> bool {
    match family {
        ProtocolFamily::S7 => type_code & 0xFF00 == 0xFF00,
        _ => type_code & TYPE_STRUCT_BIT != 0,
    }
}

/// Check if a type code carries the array bit.
pub fn is_array(family: ProtocolFamily, type_code: u16) -> bool {
    match family {
        ProtocolFamily::S7 | ProtocolFamily::Beckhoff => false,
        _ => type_code & TYPE_ARRAY_BIT != 0,
    }
}

/// Base type code with structure/array flags stripped.
pub fn base_type(family: ProtocolFamily, type_code: u16) -> u16 {
    match family {
        ProtocolFamily::S7 => type_code & 0x00FF,
        _ => type_code & TYPE_BASE_MASK,
    }
}

/// Human-readable type name for a type code.
pub fn type_name(family: ProtocolFamily, type_code: u16) -> &'static str {
    if is_structured(family, type_code) {
        return "STRUCT";
    }
    match family {
        ProtocolFamily::Logix | ProtocolFamily::Omron | ProtocolFamily::Sim => {
            match base_type(family, type_code) {
                CIP_BOOL => "BOOL",
                CIP_SINT => "SINT",
                CIP_INT => "INT",
                CIP_DINT => "DINT",
                CIP_LINT => "LINT",
                CIP_REAL => "REAL",
                CIP_LREAL => "LREAL",
                CIP_TIMER => "TIMER",
                CIP_DATE_TIME => "DATE_AND_TIME",
                CIP_STRING => "STRING",
                _ => "UNKNOWN",
            }
        }
        ProtocolFamily::S7 => match base_type(family, type_code) {
            0x01 => "BOOL",
            0x02 => "BYTE",
            0x04 => "WORD",
            0x06 => "DWORD",
            0x08 => "REAL",
            0x0B => "TIME",
            0x0F => "DATE_AND_TIME",
            0x13 => "STRING",
            _ => "UNKNOWN",
        },
        ProtocolFamily::Beckhoff => match base_type(family, type_code) {
            0x21 => "BOOL",
            0x10 => "SINT",
            0x02 => "INT",
            0x03 => "DINT",
            0x04 => "REAL",
            0x05 => "LREAL",
            0x1E => "STRING",
            0x29 => "TIME",
            _ => "UNKNOWN",
        },
    }
}

/// Size in bytes of one element of a type code.
pub fn element_size(family: ProtocolFamily, type_code: u16) -> u32 {
    match type_name(family, type_code) {
        "BOOL" | "SINT" | "BYTE" => 1,
        "INT" | "WORD" => 2,
        "DINT" | "DWORD" | "REAL" | "TIME" => 4,
        "LINT" | "LREAL" | "DATE_AND_TIME" => 8,
        "STRING" => 88,
        "TIMER" => 12,
        _ => 4,
    }
}

/// Type names whose values change on every scan regardless of process state.
static VOLATILE_TYPE_NAMES: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["TIMER", "TIME", "DATE_AND_TIME"]);

/// Check if a member type is a volatile kind (timer, timestamp).
///
/// Volatile members embedded in a structured tag would otherwise republish
/// the whole tag on every poll; the change detector auto-adds them to the
/// tag's ignore set at enable time.
pub fn is_volatile_type(family: ProtocolFamily, type_code: u16) -> bool {
    let name = type_name(family, type_code);
    VOLATILE_TYPE_NAMES.contains(&name)
}

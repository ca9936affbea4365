use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Number of bits an integer occupies on the wire.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(try_from = "u16", into = "u16")]
pub enum RegisterWidth {
    /// One register
    Bits16,
    /// Two consecutive registers, high word first
    Bits32,
}

impl RegisterWidth {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            16 => Some(RegisterWidth::Bits16),
            32 => Some(RegisterWidth::Bits32),
            _ => None,
        }
    }

    pub fn bits(&self) -> u16 {
        match self {
            RegisterWidth::Bits16 => 16,
            RegisterWidth::Bits32 => 32,
        }
    }

    /// Number of registers a value of this width spans
    pub fn words(&self) -> u16 {
        self.bits() / 16
    }
}

impl TryFrom<u16> for RegisterWidth {
    type Error = String;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        RegisterWidth::from_bits(bits).ok_or(format!("Unsupported register width {}!", bits))
    }
}

impl From<RegisterWidth> for u16 {
    fn from(w: RegisterWidth) -> Self {
        w.bits()
    }
}

/// Register words in wire order, most significant word first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub width: RegisterWidth,
    pub words: Vec<u16>,
}

/// Compose an integer from one or two register words.
pub fn decode(words: &[u16]) -> Option<u32> {
    match words {
        [w] => Some(*w as u32),
        [hi, lo] => {
            let v = (*hi as u32) << 16 | *lo as u32;
            debug!("transformed value={}", v);
            Some(v)
        }
        _ => {
            error!("Cannot handle response composed of {} words", words.len());
            None
        }
    }
}

/// Split an integer into the register words of the given width.
///
/// A 16 bit value carries the raw bits of `value` truncated to `i16`, a 32 bit
/// value the big-endian halves of `value` truncated to `i32`.
pub fn encode(value: i64, bits: u16) -> Option<RegisterValue> {
    let width = match RegisterWidth::from_bits(bits) {
        Some(w) => w,
        None => {
            error!("Cannot handle register width: {}", bits);
            return None;
        }
    };
    let words = match width {
        RegisterWidth::Bits16 => vec![value as i16 as u16],
        RegisterWidth::Bits32 => {
            let b = (value as i32).to_be_bytes();
            vec![
                u16::from_be_bytes([b[0], b[1]]),
                u16::from_be_bytes([b[2], b[3]]),
            ]
        }
    };
    Some(RegisterValue { width, words })
}

/// Regex which only matches when it spans the whole input.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct FullMatch(Regex);

impl FullMatch {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FullMatch(Regex::new(&format!("^(?:{})$", pattern))?))
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.0.is_match(s)
    }
}

impl TryFrom<String> for FullMatch {
    type Error = regex::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        FullMatch::new(&s)
    }
}

/// Last integer read from or written to a register.
#[derive(Debug, Clone)]
pub struct IntegerRegister {
    width: RegisterWidth,
    value: Option<i64>,
}

impl IntegerRegister {
    pub fn new(width: RegisterWidth) -> Self {
        Self { width, value: None }
    }

    /// Store the value carried by `words`. A word count not matching the
    /// register width leaves the register without a value.
    pub fn set_words(&mut self, words: &[u16]) {
        if words.len() != self.width.words() as usize {
            error!(
                "Expected {} words for a {}bit register, got {}",
                self.width.words(),
                self.width.bits(),
                words.len()
            );
            self.value = None;
            return;
        }
        self.value = decode(words).map(|v| v as i64);
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    pub fn value_matches(&self, pattern: &FullMatch) -> bool {
        match self.value {
            Some(v) => pattern.is_match(&v.to_string()),
            None => false,
        }
    }
}

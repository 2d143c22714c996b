pub use tokio_modbus::{Address, Quantity};

/// 16-bit value stored in Modbus register.
pub type Word = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} register words, got {got}")]
pub struct WordsCountError {
    pub expected: usize,
    pub got: usize,
}

/// Decode a value from big-endian `Word`s.
pub trait Decode: Sized {
    fn from_be_words(words: &[Word]) -> Result<Self, WordsCountError>;
}

macro_rules! impl_decode {
    ($num_type:ty) => {
        impl Decode for $num_type {
            fn from_be_words(words: &[Word]) -> Result<Self, WordsCountError> {
                let bytes = words
                    .iter()
                    .copied()
                    .flat_map(u16::to_be_bytes)
                    .collect::<Vec<u8>>();
                let got = words.len();
                let array = bytes.try_into().or(Err(WordsCountError {
                    expected: std::mem::size_of::<$num_type>() / 2,
                    got,
                }))?;
                Ok(<$num_type>::from_be_bytes(array))
            }
        }
    };
}

impl_decode!(i16);
impl_decode!(u16);

/// Encode a value into big-endian `Word`s.
pub trait Encode {
    fn to_be_words(self) -> Vec<Word>;
}

macro_rules! impl_encode {
    ($num_type:ty) => {
        impl Encode for $num_type {
            fn to_be_words(self) -> Vec<Word> {
                self.to_be_bytes()
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect()
            }
        }
    };
}

impl_encode!(i16);
impl_encode!(u16);

/// Decode two ASCII characters per word, high byte first.
///
/// Trailing NUL padding and surrounding whitespace are stripped; non-ASCII
/// bytes are dropped.
pub fn ascii_from_words(words: &[Word]) -> String {
    let text = words
        .iter()
        .copied()
        .flat_map(u16::to_be_bytes)
        .take_while(|byte| *byte != 0)
        .filter(u8::is_ascii)
        .map(char::from)
        .collect::<String>();
    text.trim().to_string()
}

/// Encode `text` into exactly `count` words, NUL padded and truncated to fit.
pub fn ascii_to_words(text: &str, count: Quantity) -> Vec<Word> {
    let mut bytes = text.bytes().filter(u8::is_ascii).collect::<Vec<u8>>();
    bytes.resize(usize::from(count) * 2, 0);
    bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

//! Byte character classes used by the tokenizer and the parser.
//!
//! A `CharacterSet` is a 256-bit membership table. Sets are built at compile
//! time with `const fn` so the parser's grammar classes cost nothing at runtime.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CharacterSet {
    name: &'static str,
    bits: [u64; 4],
}

impl CharacterSet {
    /// An empty set.
    pub const fn empty(name: &'static str) -> Self {
        Self { name, bits: [0; 4] }
    }

    /// A set containing every byte of `chars`.
    pub const fn from_bytes(name: &'static str, chars: &[u8]) -> Self {
        let mut set = Self::empty(name);
        let mut i = 0;
        while i < chars.len() {
            set = set.with(chars[i]);
            i += 1;
        }
        set
    }

    /// A set containing the inclusive byte range `lo..=hi`.
    pub const fn range(name: &'static str, lo: u8, hi: u8) -> Self {
        let mut set = Self::empty(name);
        let mut c = lo as usize;
        while c <= hi as usize {
            set = set.with(c as u8);
            c += 1;
        }
        set
    }

    pub const fn with(mut self, byte: u8) -> Self {
        self.bits[(byte >> 6) as usize] |= 1u64 << (byte & 63);
        self
    }

    pub const fn without(mut self, byte: u8) -> Self {
        self.bits[(byte >> 6) as usize] &= !(1u64 << (byte & 63));
        self
    }

    pub const fn union(mut self, other: CharacterSet) -> Self {
        let mut i = 0;
        while i < 4 {
            self.bits[i] |= other.bits[i];
            i += 1;
        }
        self
    }

    pub const fn complement(mut self, name: &'static str) -> Self {
        let mut i = 0;
        while i < 4 {
            self.bits[i] = !self.bits[i];
            i += 1;
        }
        self.name = name;
        self
    }

    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[inline]
    pub const fn contains(&self, byte: u8) -> bool {
        self.bits[(byte >> 6) as usize] & (1u64 << (byte & 63)) != 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub const ALPHA: CharacterSet =
        CharacterSet::range("ALPHA", b'a', b'z').union(CharacterSet::range("", b'A', b'Z'));
    pub const DIGIT: CharacterSet = CharacterSet::range("DIGIT", b'0', b'9');
    pub const SP: CharacterSet = CharacterSet::from_bytes("SP", b" ");
    pub const HTAB: CharacterSet = CharacterSet::from_bytes("HTAB", b"\t");
    pub const CR: CharacterSet = CharacterSet::from_bytes("CR", b"\r");
    pub const LF: CharacterSet = CharacterSet::from_bytes("LF", b"\n");
    pub const WSP: CharacterSet = CharacterSet::from_bytes("WSP", b" \t");
    /// Visible ASCII, RFC 5234 appendix B.1.
    pub const VCHAR: CharacterSet = CharacterSet::range("VCHAR", 0x21, 0x7e);
    /// RFC 7230 section 3.2.6.
    pub const OBS_TEXT: CharacterSet = CharacterSet::range("obs-text", 0x80, 0xff);
    /// RFC 7230 section 3.2.6 `tchar`.
    pub const TCHAR: CharacterSet = CharacterSet::ALPHA
        .union(CharacterSet::DIGIT)
        .union(CharacterSet::from_bytes("", b"!#$%&'*+-.^_`|~"))
        .named("tchar");
    /// RFC 3986 unreserved, gen-delims, sub-delims and the percent sign.
    pub const URI: CharacterSet = CharacterSet::ALPHA
        .union(CharacterSet::DIGIT)
        .union(CharacterSet::from_bytes("", b"-._~:/?#[]@!$&'()*+,;=%"))
        .named("URI");
    /// Everything a relaxed parser tolerates inside a request target.
    pub const RELAXED_URI: CharacterSet = CharacterSet::empty("")
        .complement("relaxed-URI")
        .without(0)
        .without(b'\r')
        .without(b'\n');
    pub const HEADER_VALUE: CharacterSet = CharacterSet::VCHAR
        .union(CharacterSet::OBS_TEXT)
        .union(CharacterSet::WSP)
        .named("field-value");
}

impl fmt::Debug for CharacterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacterSet").field("name", &self.name).finish()
    }
}

impl std::ops::Add for CharacterSet {
    type Output = CharacterSet;

    fn add(self, rhs: CharacterSet) -> CharacterSet {
        self.union(rhs)
    }
}

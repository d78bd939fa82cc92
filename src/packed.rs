// The packed program format.
//
// A `Packed` carrier is an ordered sequence whose last element is a
// string: the op stream, one opcode or parameter per character (code
// point minus 33). Everything before it is the program's constant
// pool: names, literal payloads, thunks resolving host classes or
// runtime values, and nested programs.
//
// Carriers are interchanged as plain JSON arrays. Thunks have no
// serial form and travel as null; a string shaped like "/pattern/"
// comes back as a regex payload.
//
// The decoded `(ops, stack)` pair is computed once per carrier and
// memoized on it, as is the resolved type of a cacheable non-generic
// root.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use regex::Regex;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::infer::Value;
use crate::ops::{decode_ops, encode_ops};
use crate::types::TypeId;
use crate::vm::{Error, Result};


lazy_static! {
    static ref REGEX_LITERAL: Regex = Regex::new("^/(.*)/([a-z]*)$").unwrap();
}


// A deferred constant-pool value: a host class reference, a runtime
// value for `typeof`, or a default value.
pub type Thunk = Rc<dyn Fn() -> Value>;

// Wrap a plain value as a pool thunk.
pub fn thunk(value: Value) -> PackedEntry {
    PackedEntry::Thunk(Rc::new(move || value.clone()))
}


// One constant-pool slot.
#[derive(Clone)]
pub enum PackedEntry {
    Str(Rc<String>),
    Num(f64),
    Bool(bool),
    Regex(Rc<Regex>),
    Pack(Rc<Packed>),
    Thunk(Thunk),
}

impl PackedEntry {
    pub fn str(s: &str) -> PackedEntry {
        PackedEntry::Str(Rc::new(String::from(s)))
    }
}

impl fmt::Debug for PackedEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PackedEntry::Str(s) => write!(f, "Str({:?})", s),
            PackedEntry::Num(n) => write!(f, "Num({:?})", n),
            PackedEntry::Bool(b) => write!(f, "Bool({:?})", b),
            PackedEntry::Regex(r) => write!(f, "Regex({:?})", r.as_str()),
            PackedEntry::Pack(p) => write!(f, "Pack({:?})", p),
            PackedEntry::Thunk(_) => write!(f, "<thunk>"),
        }
    }
}

impl PartialEq for PackedEntry {
    fn eq(&self, other: &PackedEntry) -> bool {
        match (self, other) {
            (PackedEntry::Str(a), PackedEntry::Str(b)) => a == b,
            (PackedEntry::Num(a), PackedEntry::Num(b)) => a == b,
            (PackedEntry::Bool(a), PackedEntry::Bool(b)) => a == b,
            (PackedEntry::Regex(a), PackedEntry::Regex(b)) => a.as_str() == b.as_str(),
            (PackedEntry::Pack(a), PackedEntry::Pack(b)) => a.entries() == b.entries(),
            // Thunks are opaque.
            (_, _) => false
        }
    }
}


// The decoded form of a carrier.
#[derive(Clone, Debug, PartialEq)]
pub struct Unpacked {
    pub ops: Vec<u8>,
    pub stack: Vec<PackedEntry>,
}


#[derive(Default)]
struct PackedCache {
    unpacked: Option<Rc<Unpacked>>,
    resolved: Option<TypeId>,
}

// A program carrier. Identity of the `Rc` around it is what the
// interpreter uses to recognize a program already being reflected.
pub struct Packed {
    entries: Vec<PackedEntry>,
    cache: RefCell<PackedCache>,
}

impl Packed {
    pub fn new(entries: Vec<PackedEntry>) -> Packed {
        Packed {
            entries,
            cache: RefCell::new(PackedCache::default()),
        }
    }

    pub fn entries(&self) -> &[PackedEntry] {
        &self.entries
    }

    // Decode the trailing op string, memoizing the result.
    pub fn unpack(&self) -> Result<Rc<Unpacked>> {
        if let Some(unpacked) = self.cache.borrow().unpacked.clone() {
            return Ok(unpacked);
        }
        let (last, stack) = self.entries.split_last().ok_or(Error::MissingTypeProgram)?;
        let encoded = match last {
            PackedEntry::Str(s) => s,
            _ => return Err(Error::MissingTypeProgram)
        };
        let ops = decode_ops(encoded)
            .map_err(|code| Error::InvalidOpcode(code as u8))?;
        let unpacked = Rc::new(Unpacked { ops, stack: stack.to_vec() });
        self.cache.borrow_mut().unpacked = Some(unpacked.clone());
        Ok(unpacked)
    }

    pub fn cached_type(&self) -> Option<TypeId> {
        self.cache.borrow().resolved
    }

    pub fn set_cached_type(&self, id: TypeId) {
        self.cache.borrow_mut().resolved = Some(id);
    }
}

impl fmt::Debug for Packed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Packed({:?})", self.entries)
    }
}


// Build a carrier from its decoded form.
pub fn pack(unpacked: &Unpacked) -> Packed {
    let mut entries = unpacked.stack.clone();
    entries.push(PackedEntry::Str(Rc::new(encode_ops(&unpacked.ops))));
    Packed::new(entries)
}


impl Serialize for PackedEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        match self {
            PackedEntry::Str(s) => serializer.serialize_str(s),
            PackedEntry::Num(n) => serializer.serialize_f64(*n),
            PackedEntry::Bool(b) => serializer.serialize_bool(*b),
            PackedEntry::Regex(r) => serializer.serialize_str(&format!("/{}/", r.as_str())),
            PackedEntry::Pack(p) => p.serialize(serializer),
            PackedEntry::Thunk(_) => serializer.serialize_unit(),
        }
    }
}

impl Serialize for Packed {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for entry in &self.entries {
            seq.serialize_element(entry)?;
        }
        seq.end()
    }
}

struct EntryVisitor;

impl<'de> Visitor<'de> for EntryVisitor {
    type Value = PackedEntry;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a string, number, bool, null, or nested program array")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> core::result::Result<PackedEntry, E> {
        if let Some(captures) = REGEX_LITERAL.captures(v) {
            let pattern = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            // Flags are not modeled; a pattern that fails to compile
            // falls back to a plain string.
            if let Ok(re) = Regex::new(pattern) {
                return Ok(PackedEntry::Regex(Rc::new(re)));
            }
        }
        Ok(PackedEntry::str(v))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> core::result::Result<PackedEntry, E> {
        Ok(PackedEntry::Num(v))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> core::result::Result<PackedEntry, E> {
        Ok(PackedEntry::Num(v as f64))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> core::result::Result<PackedEntry, E> {
        Ok(PackedEntry::Num(v as f64))
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> core::result::Result<PackedEntry, E> {
        Ok(PackedEntry::Bool(v))
    }

    // Nulls stand where thunks were; nothing can be recovered, so the
    // slot degrades to a thunk producing undefined.
    fn visit_unit<E: serde::de::Error>(self) -> core::result::Result<PackedEntry, E> {
        Ok(thunk(Value::Undefined))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> core::result::Result<PackedEntry, A::Error> {
        let mut entries = Vec::new();
        while let Some(entry) = seq.next_element::<PackedEntry>()? {
            entries.push(entry);
        }
        Ok(PackedEntry::Pack(Rc::new(Packed::new(entries))))
    }
}

impl<'de> Deserialize<'de> for PackedEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<PackedEntry, D::Error> {
        deserializer.deserialize_any(EntryVisitor)
    }
}

impl<'de> Deserialize<'de> for Packed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Packed, D::Error> {
        let entries = Vec::<PackedEntry>::deserialize(deserializer)?;
        Ok(Packed::new(entries))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;

    fn sample() -> Unpacked {
        Unpacked {
            ops: vec![Op::String as u8, Op::Literal as u8, 0, Op::Union as u8],
            stack: vec![PackedEntry::str("abc"), PackedEntry::Num(42.0)],
        }
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let original = sample();
        let packed = pack(&original);
        let unpacked = packed.unpack().unwrap();
        assert_eq!(*unpacked, original);
    }

    #[test]
    fn test_unpack_is_memoized() {
        let packed = pack(&sample());
        let a = packed.unpack().unwrap();
        let b = packed.unpack().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unpack_requires_trailing_string() {
        let packed = Packed::new(vec![PackedEntry::Num(1.0)]);
        assert_eq!(packed.unpack().unwrap_err(), Error::MissingTypeProgram);

        let empty = Packed::new(vec![]);
        assert_eq!(empty.unpack().unwrap_err(), Error::MissingTypeProgram);
    }

    #[test]
    fn test_serde_roundtrip() {
        let packed = pack(&sample());
        let json = serde_json::to_string(&packed).unwrap();
        let back: Packed = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries(), packed.entries());
    }

    #[test]
    fn test_serde_nested_pack() {
        let inner = pack(&Unpacked { ops: vec![Op::String as u8], stack: vec![] });
        let outer = Packed::new(vec![
            PackedEntry::Pack(Rc::new(inner)),
            PackedEntry::Str(Rc::new(encode_ops(&[Op::Inline as u8, 0]))),
        ]);
        let json = serde_json::to_string(&outer).unwrap();
        let back: Packed = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries(), outer.entries());
    }

    #[test]
    fn test_serde_regex_literal() {
        let json = "[\"/ab+c/\",\"\"]";
        let packed: Packed = serde_json::from_str(json).unwrap();
        match &packed.entries()[0] {
            PackedEntry::Regex(r) => assert_eq!(r.as_str(), "ab+c"),
            other => panic!("expected regex entry, got {:?}", other)
        }
    }

    #[test]
    fn test_serde_thunk_degrades_to_null() {
        let packed = Packed::new(vec![
            thunk(Value::Num(1.0)),
            PackedEntry::str(""),
        ]);
        let json = serde_json::to_string(&packed).unwrap();
        assert_eq!(json, "[null,\"\"]");
        let back: Packed = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.entries()[0], PackedEntry::Thunk(_)));
    }
}

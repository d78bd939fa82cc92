// The reflection instruction set.
//
// A type program is a flat stream of bytes. Most positions hold an
// opcode; opcodes that take parameters are followed by one byte per
// parameter, in line. Parameters are either indices into the program's
// constant pool (names, thunks, literal payloads, nested programs) or
// small immediates (argument counts, frame offsets, modifier bits,
// jump targets).
//
// Because parameters occupy their own slots, every jump target and
// return address is a plain index into the stream. The interpreter
// leans on that: a subroutine can return *onto* the opcode that called
// it (a negative jump-back offset), which is how the distributive and
// mapped-type loops replay themselves.
//
// The serialized form maps each byte to one character: code point
// minus 33. That keeps encoded programs inside the printable range
// and makes them cheap to embed as plain strings.

use std::convert::TryFrom;
use enumflags2::BitFlags;


// Offset applied when rendering an op stream as a string.
const CHAR_BASE: u8 = 33;


// Declares the opcode enum together with its byte-level decoder, so
// the two can never drift apart.
macro_rules! opcodes {
    ( $( $name:ident = $value:literal ),+ $(,)? ) => {
        // One variant per instruction. Parameter counts are documented
        // in the catalogue comments below; the stream itself is
        // untyped bytes.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op {
            $( $name = $value ),+
        }

        impl TryFrom<u8> for Op {
            type Error = u8;

            fn try_from(byte: u8) -> core::result::Result<Op, u8> {
                match byte {
                    $( $value => Ok(Op::$name), )+
                    other => Err(other)
                }
            }
        }
    }
}


opcodes! {
    // Nullary builders: push one fresh node.
    Never = 0,
    Any = 1,
    Unknown = 2,
    Void = 3,
    Object = 4,
    String = 5,
    Number = 6,
    Boolean = 7,
    BigInt = 8,
    Symbol = 9,
    Null = 10,
    Undefined = 11,
    Regexp = 12,
    Date = 13,
    Int8Array = 14,
    Uint8ClampedArray = 15,
    Uint8Array = 16,
    Int16Array = 17,
    Uint16Array = 18,
    Int32Array = 19,
    Uint32Array = 20,
    Float32Array = 21,
    Float64Array = 22,
    BigInt64Array = 23,
    ArrayBuffer = 24,

    // Literals and brands.
    Literal = 25,           // P: pool index of the payload
    NumberBrand = 26,       // B: brand ordinal
    TemplateLiteral = 27,   // frame: the parts

    // Containers.
    Array = 28,
    Tuple = 29,             // frame: the members
    TupleMember = 30,
    NamedTupleMember = 31,  // P: pool index of the name
    Rest = 32,
    Set = 33,
    Map = 34,
    Promise = 35,

    // Structural members and callables.
    Property = 36,          // P: name
    PropertySignature = 37, // P: name
    Method = 38,            // P: name; frame: params + return
    MethodSignature = 39,   // P: name; frame: params + return
    Parameter = 40,         // P: name
    Function = 41,          // P: name; frame: params + return

    // Member modifiers: mutate top of stack.
    Optional = 42,
    Readonly = 43,
    Public = 44,
    Protected = 45,
    Private = 46,
    Abstract = 47,
    DefaultValue = 48,      // P: thunk or literal payload
    Description = 49,       // P: text

    // Aggregates.
    IndexSignature = 50,
    ObjectLiteral = 51,     // frame: the members
    Class = 52,             // frame: the members
    ClassExtends = 53,      // N: number of super-class type arguments
    ClassReference = 54,    // P: thunk resolving the host class
    Enum = 55,              // frame: the members
    EnumMember = 56,        // P: name

    // Compounds.
    Union = 57,             // frame: the members
    Intersection = 58,      // frame: the members

    // Generics, variables and inference.
    TypeParameter = 59,         // P: name
    TypeParameterDefault = 60,  // P: name; pops the default
    Var = 61,
    Loads = 62,             // F, I: frame offset, slot
    Arg = 63,               // N: argument position below the frame
    Infer = 64,             // F, I: frame offset, slot

    // Conditional types and control flow.
    Extends = 65,
    Condition = 66,
    JumpCondition = 67,     // L, R: subroutine addresses
    Jump = 68,              // N: target
    Call = 69,              // N: target
    Frame = 70,
    MoveFrame = 71,
    Return = 72,
    Distribute = 73,        // P: body address
    MappedType = 74,        // F, M: body address, modifier bits

    // Type operators.
    IndexAccess = 75,
    Keyof = 76,
    Typeof = 77,            // P: thunk producing a runtime value
    Widen = 78,

    // Program references.
    Inline = 79,            // P: pack, thunk, or 0 for self
    InlineCall = 80,        // P, N: target and argument count
}


// Render a raw op stream as its string form.
//
// The caller is responsible for keeping bytes in the encodable range;
// anything a valid encoder emits fits well below it.
pub fn encode_ops(ops: &[u8]) -> String {
    ops.iter().map(|&op| char::from(op.wrapping_add(CHAR_BASE))).collect()
}

// Recover the raw op stream from its string form.
//
// Returns the offending code point if a character falls outside the
// encodable range.
pub fn decode_ops(encoded: &str) -> core::result::Result<Vec<u8>, u32> {
    encoded.chars()
        .map(|c| {
            let code = c as u32;
            if code < CHAR_BASE as u32 || code > CHAR_BASE as u32 + u8::max_value() as u32 {
                Err(code)
            } else {
                Ok((code - CHAR_BASE as u32) as u8)
            }
        })
        .collect()
}


// Modifier bits carried by the mapped-type opcode.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum MappedModifier {
    Optional       = 0b0001,
    RemoveOptional = 0b0010,
    Readonly       = 0b0100,
    RemoveReadonly = 0b1000,
}

pub type ModifierSet = BitFlags<MappedModifier>;

pub fn modifier_set(bits: u8) -> ModifierSet {
    BitFlags::from_bits_truncate(bits)
}


// Width restrictions a `number` node can carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NumberBrandKind {
    Integer,
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float32,
    Float64,
}

impl NumberBrandKind {
    pub fn from_param(param: u8) -> Option<NumberBrandKind> {
        use NumberBrandKind::*;
        match param {
            0 => Some(Integer),
            1 => Some(Int8),
            2 => Some(Int16),
            3 => Some(Int32),
            4 => Some(Uint8),
            5 => Some(Uint16),
            6 => Some(Uint32),
            7 => Some(Float32),
            8 => Some(Float64),
            _ => None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let ops: Vec<u8> = (0..=Op::InlineCall as u8).collect();
        let encoded = encode_ops(&ops);
        assert_eq!(decode_ops(&encoded), Ok(ops));
    }

    #[test]
    fn test_encode_is_printable() {
        let encoded = encode_ops(&[Op::Never as u8, Op::InlineCall as u8]);
        assert!(encoded.chars().all(|c| c as u32 >= 33));
    }

    #[test]
    fn test_decode_rejects_low_codepoints() {
        assert_eq!(decode_ops("\u{1}"), Err(1));
    }

    #[test]
    fn test_opcode_decode() {
        use std::convert::TryFrom;
        assert_eq!(Op::try_from(0), Ok(Op::Never));
        assert_eq!(Op::try_from(Op::MappedType as u8), Ok(Op::MappedType));
        assert_eq!(Op::try_from(200), Err(200));
    }

    #[test]
    fn test_modifier_set() {
        let m = modifier_set(0b0101);
        assert!(m.contains(MappedModifier::Optional));
        assert!(m.contains(MappedModifier::Readonly));
        assert!(!m.contains(MappedModifier::RemoveOptional));
    }
}

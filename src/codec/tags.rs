//! Wire tags.
//!
//! Every value and every RPC framing element starts with one ASCII byte.
//! Digits `0`-`9` stand for the integers 0 to 9 on their own.

/// `i` - 32-bit integer, terminated by `;`.
pub const TAG_INTEGER: u8 = b'i';
/// `l` - integer outside the 32-bit range, terminated by `;`.
pub const TAG_LONG: u8 = b'l';
/// `d` - double, terminated by `;`.
pub const TAG_DOUBLE: u8 = b'd';
/// `n` - null.
pub const TAG_NULL: u8 = b'n';
/// `e` - empty string.
pub const TAG_EMPTY: u8 = b'e';
/// `t` - true.
pub const TAG_TRUE: u8 = b't';
/// `f` - false.
pub const TAG_FALSE: u8 = b'f';
/// `N` - NaN.
pub const TAG_NAN: u8 = b'N';
/// `I` - infinity, followed by `+` or `-`.
pub const TAG_INFINITY: u8 = b'I';
/// `D` - date part of a date/time.
pub const TAG_DATE: u8 = b'D';
/// `T` - time part of a date/time.
pub const TAG_TIME: u8 = b'T';
/// `Z` - UTC marker ending a date/time.
pub const TAG_UTC: u8 = b'Z';
/// `b` - binary blob.
pub const TAG_BYTES: u8 = b'b';
/// `u` - string made of one UTF-16 unit.
pub const TAG_UTF8_CHAR: u8 = b'u';
/// `s` - string.
pub const TAG_STRING: u8 = b's';
/// `g` - GUID.
pub const TAG_GUID: u8 = b'g';
/// `a` - list.
pub const TAG_LIST: u8 = b'a';
/// `m` - map.
pub const TAG_MAP: u8 = b'm';
/// `c` - class declaration.
pub const TAG_CLASS: u8 = b'c';
/// `o` - object instance of a declared class.
pub const TAG_OBJECT: u8 = b'o';
/// `r` - back-reference.
pub const TAG_REF: u8 = b'r';

/// `+` - positive sign (infinity).
pub const TAG_POS: u8 = b'+';
/// `-` - negative sign (infinity).
pub const TAG_NEG: u8 = b'-';
/// `;` - terminator.
pub const TAG_SEMICOLON: u8 = b';';
/// `{` - opens a container body.
pub const TAG_OPENBRACE: u8 = b'{';
/// `}` - closes a container body.
pub const TAG_CLOSEBRACE: u8 = b'}';
/// `"` - string/bytes delimiter.
pub const TAG_QUOTE: u8 = b'"';
/// `.` - fractional second separator.
pub const TAG_POINT: u8 = b'.';

/// `F` - function list reply.
pub const TAG_FUNCTIONS: u8 = b'F';
/// `C` - call.
pub const TAG_CALL: u8 = b'C';
/// `R` - result.
pub const TAG_RESULT: u8 = b'R';
/// `A` - argument list echoed back for by-reference calls.
pub const TAG_ARGUMENT: u8 = b'A';
/// `E` - error.
pub const TAG_ERROR: u8 = b'E';
/// `z` - end of request or response.
pub const TAG_END: u8 = b'z';

/// Printable form of a tag for error messages.
pub(crate) fn tag_name(tag: u8) -> String {
    if tag.is_ascii_graphic() || tag == b' ' {
        (tag as char).to_string()
    } else {
        format!("\\x{tag:02x}")
    }
}

//! JVM type and method descriptors, and how they match human-readable names
//!
//! Two spellings exist side by side. The JVM-native form uses `/`-separated
//! internal names and single-letter primitive tags (`(JI)V`,
//! `[[Ljava/lang/String;`). The human form is what a library user writes:
//! dotted class names with `[]` suffixes (`java.lang.String[][]`, `int`,
//! `void`). Targets are expressed in the human form and matched against the
//! JVM form as class files stream by.

use std::str::Chars;

use crate::error::Error;

/// Splits a method descriptor into its type tokens.
///
/// The head of the returned list is the return descriptor, followed by the
/// parameter descriptors in order. Only strings matching the method
/// descriptor grammar are accepted; anything else is a
/// [`MalformedDescriptor`](Error::MalformedDescriptor).
pub fn decompose_full_desc(desc: &str) -> Result<Vec<String>, Error> {
    let malformed = || Error::MalformedDescriptor(desc.to_string());

    let mut chars = desc.chars();
    if chars.next() != Some('(') {
        return Err(malformed());
    }

    let mut params = Vec::new();
    loop {
        match chars.clone().next() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => params.push(parse_type(&mut chars).ok_or_else(malformed)?),
            None => return Err(malformed()),
        }
    }

    let ret = if chars.clone().next() == Some('V') {
        chars.next();
        String::from("V")
    } else {
        parse_type(&mut chars).ok_or_else(malformed)?
    };
    if chars.next().is_some() {
        return Err(malformed());
    }

    let mut out = Vec::with_capacity(params.len() + 1);
    out.push(ret);
    out.extend(params);
    Ok(out)
}

/// Reads one field descriptor off the cursor: `\[*([BCDFIJSZ]|L[^;]+;)`.
fn parse_type(chars: &mut Chars) -> Option<String> {
    let mut token = String::new();
    while chars.clone().next() == Some('[') {
        chars.next();
        token.push('[');
    }
    match chars.next()? {
        c @ ('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => {
            token.push(c);
            Some(token)
        }
        'L' => {
            token.push('L');
            let mut saw_name = false;
            loop {
                match chars.next()? {
                    ';' => {
                        if !saw_name {
                            return None;
                        }
                        token.push(';');
                        return Some(token);
                    }
                    c => {
                        saw_name = true;
                        token.push(c);
                    }
                }
            }
        }
        _ => None,
    }
}

/// Tests a JVM type descriptor against a human type name.
///
/// `V` matches only the literal `void`. Array dimensions are counted off the
/// descriptor and the same number of `[]` pairs consumed from the end of the
/// human form; then the base tokens must agree (`I` against `int`, `L…;`
/// against the dotted class name). No wildcards.
pub fn type_spec_match(type_desc: &str, pattern: &str) -> bool {
    if type_desc == "V" {
        return pattern == "void";
    }

    let dims = type_desc.chars().take_while(|&c| c == '[').count();
    let base = &type_desc[dims..];

    let brace_len = dims * 2;
    if pattern.len() < brace_len {
        return false;
    }
    let split = pattern.len() - brace_len;
    if !pattern.is_char_boundary(split) {
        return false;
    }
    let (pattern, braces) = pattern.split_at(split);
    if !braces.as_bytes().chunks(2).all(|pair| pair == b"[]") {
        return false;
    }

    match base.chars().next() {
        Some('B') => pattern == "byte",
        Some('C') => pattern == "char",
        Some('D') => pattern == "double",
        Some('F') => pattern == "float",
        Some('I') => pattern == "int",
        Some('J') => pattern == "long",
        Some('S') => pattern == "short",
        Some('Z') => pattern == "boolean",
        Some('L') if base.ends_with(';') => type_matches(&base[1..base.len() - 1], pattern),
        _ => false,
    }
}

/// Tests a class-file internal name against a dotted human class name.
///
/// Both `/` and `$` on the internal side become `.`, so
/// `java/util/Map$Entry` matches `java.util.Map.Entry`.
pub fn type_matches(internal: &str, pattern: &str) -> bool {
    internal
        .chars()
        .map(|c| if c == '/' || c == '$' { '.' } else { c })
        .eq(pattern.chars())
}

/// Converts a human type name to its descriptor: `int` to `I`,
/// `java.lang.String[]` to `[Ljava/lang/String;`.
pub fn to_spec(human: &str) -> String {
    let mut out = String::new();
    let mut base = human;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped;
        out.push('[');
    }
    match base {
        "byte" => out.push('B'),
        "char" => out.push('C'),
        "double" => out.push('D'),
        "float" => out.push('F'),
        "int" => out.push('I'),
        "long" => out.push('J'),
        "short" => out.push('S'),
        "boolean" => out.push('Z'),
        "void" => out.push('V'),
        _ => {
            out.push('L');
            out.push_str(&convert_type(base));
            out.push(';');
        }
    }
    out
}

/// Converts a dotted class name to internal form. Slashes already present
/// are left alone, so both spellings survive the trip.
pub fn convert_type(name: &str) -> String {
    name.replace('.', "/")
}

/// Operand slot size of a type descriptor: 2 for `J` and `D`, 0 for `V`,
/// 1 for everything else.
pub(crate) fn size_of(spec: &str) -> u8 {
    match spec.chars().next() {
        Some('D') | Some('J') => 2,
        Some('V') => 0,
        _ => 1,
    }
}

/// Total operand slots taken by the parameters of a method descriptor.
pub(crate) fn arg_slots(desc: &str) -> Result<u16, Error> {
    let specs = decompose_full_desc(desc)?;
    Ok(specs.iter().skip(1).map(|s| size_of(s) as u16).sum())
}

/// The `CONSTANT_Class_info` name a reference descriptor resolves to:
/// the bare internal name for `L…;`, the descriptor itself for arrays.
/// Primitives have none.
pub(crate) fn class_info_of(desc: &str) -> Option<String> {
    if desc.starts_with('[') {
        Some(desc.to_string())
    } else if desc.starts_with('L') && desc.ends_with(';') {
        Some(desc[1..desc.len() - 1].to_string())
    } else {
        None
    }
}

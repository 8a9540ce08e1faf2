//! Switch database value notation
//!
//! Column values use the RFC 7047 JSON notation: bare atoms, or tagged
//! two-element arrays (`["uuid", ..]`, `["named-uuid", ..]`, `["set", [..]]`,
//! `["map", [[k, v], ..]]`). An optional column is an empty set when unset and
//! a bare atom when set, so callers read columns through the flattening
//! helpers here instead of matching on the raw shape.

use super::OvsdbError;
use serde_json::Value;
use std::collections::BTreeMap;

/// A single scalar value
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Uuid(String),
    NamedUuid(String),
}

impl Atom {
    /// Decode an atom from its JSON notation
    pub fn from_json(value: &Value) -> Result<Self, OvsdbError> {
        match value {
            Value::String(s) => Ok(Atom::String(s.clone())),
            Value::Bool(b) => Ok(Atom::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Atom::Integer(i)),
                None => n
                    .as_f64()
                    .map(Atom::Real)
                    .ok_or_else(|| OvsdbError::InvalidNotation(format!("number {}", n))),
            },
            Value::Array(items) => match items.as_slice() {
                [Value::String(tag), Value::String(id)] if tag == "uuid" => {
                    Ok(Atom::Uuid(id.clone()))
                }
                [Value::String(tag), Value::String(id)] if tag == "named-uuid" => {
                    Ok(Atom::NamedUuid(id.clone()))
                }
                _ => Err(OvsdbError::InvalidNotation(format!("atom {}", value))),
            },
            _ => Err(OvsdbError::InvalidNotation(format!("atom {}", value))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    /// Row reference carried by this atom
    pub fn as_uuid(&self) -> Option<&str> {
        match self {
            Atom::Uuid(id) | Atom::NamedUuid(id) => Some(id),
            _ => None,
        }
    }

    /// Integer value. Reals are truncated, since JSON numbers may arrive in
    /// floating point form.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Atom::Integer(i) => Some(*i),
            Atom::Real(f) if f.is_finite() => Some(f.trunc() as i64),
            _ => None,
        }
    }
}

/// A column value: an atom, a set of atoms, or a map
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Atom(Atom),
    Set(Vec<Atom>),
    Map(Vec<(Atom, Atom)>),
}

/// Flattened view of a reference column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refs<'a> {
    Empty,
    Single(&'a str),
    Set(Vec<&'a str>),
}

impl<'a> Refs<'a> {
    pub fn flatten(self) -> Vec<&'a str> {
        match self {
            Refs::Empty => Vec::new(),
            Refs::Single(id) => vec![id],
            Refs::Set(ids) => ids,
        }
    }
}

impl Datum {
    /// Decode a datum from its JSON notation
    pub fn from_json(value: &Value) -> Result<Self, OvsdbError> {
        if let Value::Array(items) = value {
            match items.as_slice() {
                [Value::String(tag), Value::Array(elems)] if tag == "set" => {
                    let atoms = elems
                        .iter()
                        .map(Atom::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Datum::Set(atoms));
                }
                [Value::String(tag), Value::Array(pairs)] if tag == "map" => {
                    let mut entries = Vec::with_capacity(pairs.len());
                    for pair in pairs {
                        match pair.as_array().map(|p| p.as_slice()) {
                            Some([k, v]) => {
                                entries.push((Atom::from_json(k)?, Atom::from_json(v)?))
                            }
                            _ => {
                                return Err(OvsdbError::InvalidNotation(format!(
                                    "map entry {}",
                                    pair
                                )))
                            }
                        }
                    }
                    return Ok(Datum::Map(entries));
                }
                _ => {}
            }
        }
        Atom::from_json(value).map(Datum::Atom)
    }

    /// An empty set, the encoding of an unset optional column
    pub fn empty() -> Self {
        Datum::Set(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Datum::Atom(_) => false,
            Datum::Set(atoms) => atoms.is_empty(),
            Datum::Map(entries) => entries.is_empty(),
        }
    }

    /// The single atom of an optional column, if set
    pub fn atom(&self) -> Option<&Atom> {
        match self {
            Datum::Atom(atom) => Some(atom),
            Datum::Set(atoms) if atoms.len() == 1 => atoms.first(),
            _ => None,
        }
    }

    /// Every atom of a set column (a bare atom is a one-element set)
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Datum::Atom(atom) => vec![atom],
            Datum::Set(atoms) => atoms.iter().collect(),
            Datum::Map(_) => Vec::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.atom().and_then(Atom::as_str)
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.atom().and_then(Atom::as_integer)
    }

    /// Reference column as a tagged variant
    pub fn refs(&self) -> Refs<'_> {
        match self {
            Datum::Atom(atom) => match atom.as_uuid() {
                Some(id) => Refs::Single(id),
                None => Refs::Empty,
            },
            Datum::Set(atoms) => {
                let ids: Vec<&str> = atoms.iter().filter_map(Atom::as_uuid).collect();
                match ids.len() {
                    0 => Refs::Empty,
                    1 => Refs::Single(ids[0]),
                    _ => Refs::Set(ids),
                }
            }
            Datum::Map(_) => Refs::Empty,
        }
    }

    /// String-to-string entries of a map column. Entries of other types are
    /// skipped; a non-map datum yields `None`.
    pub fn to_string_map(&self) -> Option<BTreeMap<String, String>> {
        match self {
            Datum::Map(entries) => Some(
                entries
                    .iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect(),
            ),
            Datum::Set(atoms) if atoms.is_empty() => Some(BTreeMap::new()),
            _ => None,
        }
    }
}

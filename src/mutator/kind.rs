//! Literal value kinds and their candidate replacement values.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// How many alternative enum constants are tried per site.
const ENUM_ALTERNATIVES: usize = 3;

/// Kind of literal a site list refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralKind {
    /// Integer and floating point literals.
    #[default]
    Numeric,
    /// `true` / `false`.
    Boolean,
    /// Qualified constant references such as `Mode.FAST`.
    Enum,
}

impl fmt::Display for LiteralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Numeric => "numeric",
            Self::Boolean => "boolean",
            Self::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A parsed literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// Integer with its source suffix (`L`, `l` or empty).
    Int {
        /// Numeric value.
        value: i64,
        /// Type suffix kept verbatim.
        suffix: String,
    },
    /// Floating point number with its source suffix (`f`, `F`, `d`, `D` or empty).
    Float {
        /// Numeric value.
        value: f64,
        /// Type suffix kept verbatim.
        suffix: String,
    },
    /// Boolean literal.
    Bool(bool),
    /// `Qualifier.NAME` constant.
    EnumConst {
        /// Everything before the last `.`.
        qualifier: String,
        /// Constant name.
        name: String,
    },
}

/// Constants known per enum type, loaded from `Type,VAL1 VAL2 ...` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumTable {
    constants: HashMap<String, Vec<String>>,
}

impl EnumTable {
    /// Register the constants of one type.
    pub fn insert(&mut self, type_name: impl Into<String>, constants: Vec<String>) {
        self.constants.insert(type_name.into(), constants);
    }

    /// Load a table file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut table = Self::default();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some((ty, values)) = line.split_once(',') {
                table.insert(
                    ty.trim(),
                    values.split_whitespace().map(str::to_string).collect(),
                );
            }
        }
        Ok(table)
    }

    /// Constants of `qualifier`, matched exactly or by simple type name.
    pub fn lookup(&self, qualifier: &str) -> Option<&[String]> {
        if let Some(found) = self.constants.get(qualifier) {
            return Some(found);
        }
        let simple = qualifier.rsplit('.').next().unwrap_or(qualifier);
        self.constants
            .iter()
            .find(|(key, _)| key.rsplit('.').next() == Some(simple))
            .map(|(_, values)| values.as_slice())
    }
}

fn split_int_suffix(text: &str) -> (&str, &str) {
    match text.strip_suffix(['L', 'l']) {
        Some(body) => (body, &text[body.len()..]),
        None => (text, ""),
    }
}

fn split_float_suffix(text: &str) -> (&str, &str) {
    match text.strip_suffix(['f', 'F', 'd', 'D']) {
        Some(body) => (body, &text[body.len()..]),
        None => (text, ""),
    }
}

fn parse_int(body: &str) -> Option<i64> {
    let cleaned = body.replace('_', "");
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest.to_string()),
        None => (false, cleaned),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_numeric(text: &str) -> Option<LiteralValue> {
    let is_hex = text.starts_with("0x") || text.starts_with("0X");
    let (int_body, int_suffix) = split_int_suffix(text);
    if let Some(value) = parse_int(int_body) {
        return Some(LiteralValue::Int {
            value,
            suffix: int_suffix.to_string(),
        });
    }
    if is_hex {
        return None;
    }
    let (body, suffix) = split_float_suffix(text);
    let value: f64 = body.replace('_', "").parse().ok()?;
    Some(LiteralValue::Float {
        value,
        suffix: suffix.to_string(),
    })
}

fn render_float(value: f64) -> String {
    let text = format!("{value}");
    if text.contains(['.', 'e', 'E']) || !value.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

impl LiteralKind {
    /// Parse source text as a literal of this kind.
    pub fn from_text(self, text: &str) -> Option<LiteralValue> {
        let text = text.trim();
        match self {
            Self::Numeric => parse_numeric(text),
            Self::Boolean => match text {
                "true" => Some(LiteralValue::Bool(true)),
                "false" => Some(LiteralValue::Bool(false)),
                _ => None,
            },
            Self::Enum => {
                let (qualifier, name) = text.rsplit_once('.')?;
                if qualifier.is_empty() || name.is_empty() {
                    return None;
                }
                Some(LiteralValue::EnumConst {
                    qualifier: qualifier.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    /// Ordered candidate replacements for `original`.
    pub fn candidates(self, original: &LiteralValue, enums: &EnumTable) -> Vec<LiteralValue> {
        match original {
            LiteralValue::Int { value, suffix } => {
                let values: Vec<i64> = match *value {
                    0 => vec![0xff_ffff, 255, 8],
                    1 => vec![8, 0],
                    v => vec![v.saturating_mul(8), (v / 8).max(1)],
                };
                values
                    .into_iter()
                    .map(|value| LiteralValue::Int {
                        value,
                        suffix: suffix.clone(),
                    })
                    .collect()
            }
            LiteralValue::Float { value, suffix } => {
                let v = *value;
                let values = if v == 0.0 {
                    vec![0.5, 1.0]
                } else if v > 0.0 && v < 1.0 {
                    vec![1.0 - (1.0 - v) / 8.0, v / 8.0]
                } else {
                    vec![v * 8.0, v / 8.0]
                };
                values
                    .into_iter()
                    .map(|value| LiteralValue::Float {
                        value,
                        suffix: suffix.clone(),
                    })
                    .collect()
            }
            LiteralValue::Bool(b) => vec![LiteralValue::Bool(!b)],
            LiteralValue::EnumConst { qualifier, name } => match enums.lookup(qualifier) {
                Some(constants) => constants
                    .iter()
                    .filter(|c| *c != name)
                    .take(ENUM_ALTERNATIVES)
                    .map(|c| LiteralValue::EnumConst {
                        qualifier: qualifier.clone(),
                        name: c.clone(),
                    })
                    .collect(),
                None => {
                    tracing::warn!(qualifier = %qualifier, "no constants known for enum type");
                    Vec::new()
                }
            },
        }
    }
}

impl LiteralValue {
    /// Render as source text.
    pub fn to_text(&self) -> String {
        match self {
            Self::Int { value, suffix } => format!("{value}{suffix}"),
            Self::Float { value, suffix } => format!("{}{suffix}", render_float(*value)),
            Self::Bool(b) => b.to_string(),
            Self::EnumConst { qualifier, name } => format!("{qualifier}.{name}"),
        }
    }

    /// Interpret externally supplied text in the shape of `self`: same numeric class and
    /// suffix, same enum qualifier.
    pub fn reinterpret(&self, text: &str) -> Option<LiteralValue> {
        let text = text.trim();
        match self {
            Self::Int { suffix, .. } => {
                let value = match parse_numeric(text)? {
                    Self::Int { value, .. } => value,
                    Self::Float { value, .. } if value.fract() == 0.0 => value as i64,
                    _ => return None,
                };
                Some(Self::Int {
                    value,
                    suffix: suffix.clone(),
                })
            }
            Self::Float { suffix, .. } => {
                let value = match parse_numeric(text)? {
                    Self::Int { value, .. } => value as f64,
                    Self::Float { value, .. } => value,
                    _ => return None,
                };
                Some(Self::Float {
                    value,
                    suffix: suffix.clone(),
                })
            }
            Self::Bool(_) => LiteralKind::Boolean.from_text(text),
            Self::EnumConst { qualifier, .. } => {
                let name = text.rsplit('.').next().filter(|n| !n.is_empty())?;
                Some(Self::EnumConst {
                    qualifier: qualifier.clone(),
                    name: name.to_string(),
                })
            }
        }
    }
}

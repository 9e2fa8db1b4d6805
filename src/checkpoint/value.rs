//! Values of checkpoint attributes: scalars or parenthesized lists nested up
//! to three levels.

use crate::error::{Error, Result};

/// Continuation indent used by the simulator when it wraps a list.
const CONTINUATION: &str = "\n\t       ";
const WRAP_COLUMNS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Atom(String),
    List(Vec<Value>),
}

impl Value {
    /// Parses the text following `key:`. All whitespace is stripped first.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let stripped: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        if stripped.first() != Some(&'(') {
            return Ok(Value::Atom(stripped.into_iter().collect()));
        }
        let mut position = 0;
        let value = parse_list(&stripped, &mut position)?;
        if position != stripped.len() {
            return Err(format!(
                "trailing characters after list: {:?}",
                stripped[position..].iter().collect::<String>()
            ));
        }
        Ok(value)
    }

    /// Nesting depth, 0 for scalars.
    pub fn depth(&self) -> usize {
        match self {
            Value::Atom(_) => 0,
            Value::List(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Value::Atom(atom) => Some(atom),
            Value::List(_) => None,
        }
    }

    /// Element addressed by `index`, one entry per nesting level.
    pub fn element(&self, index: &[usize]) -> Option<&Value> {
        index.iter().try_fold(self, |value, i| match value {
            Value::List(items) => items.get(*i),
            Value::Atom(_) => None,
        })
    }

    pub fn element_mut(&mut self, index: &[usize]) -> Option<&mut Value> {
        index.iter().try_fold(self, |value, i| match value {
            Value::List(items) => items.get_mut(*i),
            Value::Atom(_) => None,
        })
    }

    /// All scalars with their index path, e.g. `(":1:0", "0x5")`.
    pub fn leaves(&self) -> Vec<(String, &str)> {
        let mut leaves = Vec::new();
        collect_leaves(self, String::new(), &mut leaves);
        leaves
    }
}

fn collect_leaves<'a>(value: &'a Value, path: String, leaves: &mut Vec<(String, &'a str)>) {
    match value {
        Value::Atom(atom) => leaves.push((path, atom)),
        Value::List(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_leaves(item, format!("{}:{}", path, i), leaves);
            }
        }
    }
}

fn parse_list(chars: &[char], position: &mut usize) -> std::result::Result<Value, String> {
    // Caller guarantees chars[*position] == '('.
    *position += 1;
    let mut items = Vec::new();
    if chars.get(*position) == Some(&')') {
        *position += 1;
        return Ok(Value::List(items));
    }
    loop {
        let item = match chars.get(*position) {
            Some('(') => parse_list(chars, position)?,
            Some(_) => {
                let start = *position;
                while let Some(c) = chars.get(*position) {
                    if *c == ',' || *c == ')' || *c == '(' {
                        break;
                    }
                    *position += 1;
                }
                Value::Atom(chars[start..*position].iter().collect())
            }
            None => return Err("unbalanced parentheses".to_string()),
        };
        items.push(item);
        match chars.get(*position) {
            Some(',') => *position += 1,
            Some(')') => {
                *position += 1;
                return Ok(Value::List(items));
            }
            Some(c) => return Err(format!("unexpected {:?}", c)),
            None => return Err("unbalanced parentheses".to_string()),
        }
    }
}

fn atoms<'a>(register: &str, items: &'a [Value]) -> Result<Vec<&'a str>> {
    items
        .iter()
        .map(|item| {
            item.as_atom().ok_or_else(|| Error::MalformedValue {
                register: register.to_string(),
                message: "inconsistent nesting".to_string(),
            })
        })
        .collect()
}

fn rows<'a>(register: &str, items: &'a [Value]) -> Result<Vec<&'a [Value]>> {
    items
        .iter()
        .map(|item| match item {
            Value::List(row) => Ok(row.as_slice()),
            Value::Atom(_) => Err(Error::MalformedValue {
                register: register.to_string(),
                message: "inconsistent nesting".to_string(),
            }),
        })
        .collect()
}

/// Renders the `\t<key>: <value>\n` line(s) of an attribute the way the
/// simulator writes them.
pub fn render(key: &str, value: &Value) -> Result<String> {
    let items = match value {
        Value::Atom(atom) => return Ok(format!("\t{}: {}\n", key, atom)),
        Value::List(items) => items,
    };
    match value.depth() {
        1 => Ok(format!("\t{}: ({})\n", key, wrap_items(&atoms(key, items)?))),
        2 => {
            let lines = rows(key, items)?
                .into_iter()
                .map(|row| Ok(atoms(key, row)?.join(", ")))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("\t{}: (({}))\n", key, lines.join("),\n\t       (")))
        }
        3 => {
            let planes = rows(key, items)?
                .into_iter()
                .map(|plane| {
                    let lines = rows(key, plane)?
                        .into_iter()
                        .map(|row| Ok(atoms(key, row)?.join(", ")))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(lines.join("),\n\t        ("))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("\t{}: ((({})))\n", key, planes.join(")),\n\t       ((")))
        }
        dimensions => Err(Error::TooManyDimensions {
            register: key.to_string(),
            dimensions,
        }),
    }
}

/// Joins list items with `", "`, starting a continuation line whenever the
/// pending line plus the next item would exceed the wrap width.
fn wrap_items(items: &[&str]) -> String {
    let mut out = String::new();
    let mut line = String::new();
    for (i, item) in items.iter().enumerate() {
        if i == items.len() - 1 {
            if !line.is_empty() {
                out.push_str(&line);
                out.push_str(", ");
            }
            out.push_str(item);
        } else if line.len() + item.len() + 2 > WRAP_COLUMNS {
            out.push_str(&line);
            out.push(',');
            out.push_str(CONTINUATION);
            line = item.to_string();
        } else if line.is_empty() {
            line.push_str(item);
        } else {
            line.push_str(", ");
            line.push_str(item);
        }
    }
    out
}

use crate::error::ExprError;

// ── Sections ──────────────────────────────────────────────────────────────────

/// One traversal step of a parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// Object field, from `.name` or `["name"]`.
    Field(String),
    /// Positional index into a sequence, from `[3]`.
    Index(usize),
    /// All elements of a sequence, from `[*]`.
    Wildcard,
    /// Sequence elements whose nested field `key` equals `value`,
    /// from `[key="value"]`.
    Match { key: String, value: String },
}

/// Projection of a [`Section`] chain into the form used by
/// server-side-apply `managedFields` field paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPathSegment {
    /// `f:<name>` — an object field.
    Field(String),
    /// `k:{"<key>":"<value>"}` — a keyed list member.
    Key { key: String, value: String },
    /// Any list member (`k:…` or `v:…`); produced by index and wildcard
    /// sections, which managed-fields paths cannot address precisely.
    AnyItem,
}

// ── PathExpr ──────────────────────────────────────────────────────────────────

/// A parsed path expression rooted at `self`.
///
/// Grammar (whitespace not allowed):
/// ```text
/// path    := "self" section*
/// section := "." ident
///          | "[" uint "]"
///          | "[" "*" "]"
///          | "[" string "]"
///          | "[" ident "=" string "]"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    sections: Vec<Section>,
}

impl PathExpr {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let mut p = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        p.expect_keyword("self")?;

        let mut sections = Vec::new();
        loop {
            match p.peek() {
                Some(b'.') => {
                    p.pos += 1;
                    let name = p.ident()?;
                    sections.push(Section::Field(name));
                }
                Some(b'[') => {
                    p.pos += 1;
                    sections.push(p.bracket_section()?);
                }
                Some(c) => {
                    return Err(ExprError::parse(
                        p.pos,
                        format!("unexpected character {:?}", c as char),
                    ));
                }
                None => break,
            }
        }
        Ok(PathExpr { sections })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// True for the bare path `self`, which traverses nothing.
    pub fn is_root(&self) -> bool {
        self.sections.is_empty()
    }

    /// Project to the managed-fields path form used for ownership queries.
    pub fn to_field_path(&self) -> Vec<FieldPathSegment> {
        self.sections
            .iter()
            .map(|s| match s {
                Section::Field(name) => FieldPathSegment::Field(name.clone()),
                Section::Match { key, value } => FieldPathSegment::Key {
                    key: key.clone(),
                    value: value.clone(),
                },
                Section::Index(_) | Section::Wildcard => FieldPathSegment::AnyItem,
            })
            .collect()
    }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "self")?;
        for s in &self.sections {
            match s {
                Section::Field(name) => write!(f, ".{}", name)?,
                Section::Index(i) => write!(f, "[{}]", i)?,
                Section::Wildcard => write!(f, "[*]")?,
                Section::Match { key, value } => {
                    write!(f, "[{}={:?}]", key, value)?
                }
            }
        }
        Ok(())
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ExprError> {
        if self.input[self.pos..].starts_with(kw.as_bytes()) {
            // The keyword must not continue as a longer identifier.
            let next = self.input.get(self.pos + kw.len()).copied();
            if !matches!(next, Some(c) if is_ident_char(c)) {
                self.pos += kw.len();
                return Ok(());
            }
        }
        Err(ExprError::parse(
            self.pos,
            format!("path expressions must start with {:?}", kw),
        ))
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ExprError::parse(start, "expected identifier"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    /// Parse the inside of a `[...]` section; the opening bracket is consumed.
    fn bracket_section(&mut self) -> Result<Section, ExprError> {
        let section = match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                Section::Wildcard
            }
            Some(b'"') | Some(b'\'') => {
                let s = self.quoted_string()?;
                Section::Field(s)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let text = String::from_utf8_lossy(&self.input[start..self.pos]);
                let index: usize = text
                    .parse()
                    .map_err(|_| ExprError::parse(start, "invalid index"))?;
                Section::Index(index)
            }
            _ => {
                let key = self.ident()?;
                if self.peek() != Some(b'=') {
                    return Err(ExprError::parse(self.pos, "expected '=' in matcher"));
                }
                self.pos += 1;
                let value = self.quoted_string()?;
                Section::Match { key, value }
            }
        };
        if self.peek() != Some(b']') {
            return Err(ExprError::parse(self.pos, "expected ']'"));
        }
        self.pos += 1;
        Ok(section)
    }

    /// A single- or double-quoted string with backslash escapes.
    fn quoted_string(&mut self) -> Result<String, ExprError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(ExprError::parse(self.pos, "expected quoted string")),
        };
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        None => {
                            return Err(ExprError::parse(self.pos, "unterminated escape"))
                        }
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c as char);
                    self.pos += 1;
                }
                None => return Err(ExprError::parse(self.pos, "unterminated string")),
            }
        }
    }
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

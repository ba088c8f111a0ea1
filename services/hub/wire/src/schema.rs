//! Declarative command/reply schema.
//!
//! Commands and replies are described by immutable tables of [`CommandDef`]
//! and [`ReplyDef`] entries. A command may carry a submenu, selected by one
//! more opcode byte; replies mirror that nesting. The reply to a command is
//! found at `opcode + 1` in the matching reply level, except for groups that
//! echo the request opcode (see [`ReplyCoding`]).

use std::collections::HashSet;
use thiserror::Error;

/// Wire encoding of a fixed-width field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Unsigned byte (`B`)
    U8,
    /// Unsigned 16-bit little-endian (`<H`)
    U16Le,
    /// Signed 16-bit little-endian (`<h`)
    I16Le,
    /// Unsigned 32-bit little-endian (`<I`)
    U32Le,
    /// Unsigned 32-bit big-endian (`>I`)
    U32Be,
    /// Raw bytes, passed through after a length check
    Raw,
}

impl Encoding {
    /// Width in bytes, `None` for raw fields
    pub const fn width(self) -> Option<usize> {
        match self {
            Encoding::U8 => Some(1),
            Encoding::U16Le | Encoding::I16Le => Some(2),
            Encoding::U32Le | Encoding::U32Be => Some(4),
            Encoding::Raw => None,
        }
    }

    /// Inclusive value range representable by this encoding
    pub const fn range(self) -> (i64, i64) {
        match self {
            Encoding::U8 => (0, u8::MAX as i64),
            Encoding::U16Le => (0, u16::MAX as i64),
            Encoding::I16Le => (i16::MIN as i64, i16::MAX as i64),
            Encoding::U32Le | Encoding::U32Be => (0, u32::MAX as i64),
            Encoding::Raw => (0, 0),
        }
    }

    /// Append `value` to `out`. The caller checks the range first.
    pub(crate) fn put(self, value: i64, out: &mut Vec<u8>) {
        match self {
            Encoding::U8 => out.push(value as u8),
            Encoding::U16Le => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Encoding::I16Le => out.extend_from_slice(&(value as i16).to_le_bytes()),
            Encoding::U32Le => out.extend_from_slice(&(value as u32).to_le_bytes()),
            Encoding::U32Be => out.extend_from_slice(&(value as u32).to_be_bytes()),
            Encoding::Raw => {}
        }
    }

    /// Decode an integer from exactly `width()` bytes
    pub(crate) fn get(self, bytes: &[u8]) -> Option<i64> {
        let value = match (self, bytes) {
            (Encoding::U8, [a]) => *a as i64,
            (Encoding::U16Le, [a, b]) => u16::from_le_bytes([*a, *b]) as i64,
            (Encoding::I16Le, [a, b]) => i16::from_le_bytes([*a, *b]) as i64,
            (Encoding::U32Le, [a, b, c, d]) => u32::from_le_bytes([*a, *b, *c, *d]) as i64,
            (Encoding::U32Be, [a, b, c, d]) => u32::from_be_bytes([*a, *b, *c, *d]) as i64,
            _ => return None,
        };
        Some(value)
    }
}

/// Length of a field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLen {
    /// Exactly this many bytes (per element for repeated fields)
    Fixed(usize),
    /// All remaining bytes; only valid as the last field
    Trailing,
}

/// Value used when a command argument is not supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefault {
    /// The argument is required
    Required,
    /// Integer default
    Int(i64),
    /// Empty bytes for trailing fields, empty list for repeated fields
    Empty,
}

/// One field of a command or reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Argument or reply key
    pub name: &'static str,
    /// Wire length
    pub len: FieldLen,
    /// Wire encoding
    pub encoding: Encoding,
    /// Default when the argument is missing
    pub default: FieldDefault,
    /// Array-valued: each element is encoded individually
    pub repeated: bool,
}

impl FieldDef {
    /// Fixed-width integer field
    pub const fn int(name: &'static str, encoding: Encoding) -> Self {
        let len = match encoding.width() {
            Some(width) => FieldLen::Fixed(width),
            None => FieldLen::Fixed(0),
        };
        Self {
            name,
            len,
            encoding,
            default: FieldDefault::Required,
            repeated: false,
        }
    }

    /// Fixed-length raw byte field
    pub const fn raw(name: &'static str, len: usize) -> Self {
        Self {
            name,
            len: FieldLen::Fixed(len),
            encoding: Encoding::Raw,
            default: FieldDefault::Required,
            repeated: false,
        }
    }

    /// Unbounded field taking the rest of the payload
    pub const fn trailing(name: &'static str) -> Self {
        Self {
            name,
            len: FieldLen::Trailing,
            encoding: Encoding::Raw,
            default: FieldDefault::Required,
            repeated: false,
        }
    }

    /// Default to `value` when missing
    pub const fn or(mut self, value: i64) -> Self {
        self.default = FieldDefault::Int(value);
        self
    }

    /// Default to empty when missing
    pub const fn or_empty(mut self) -> Self {
        self.default = FieldDefault::Empty;
        self
    }

    /// Mark as an array of elements, defaulting to an empty list
    pub const fn repeated(mut self) -> Self {
        self.repeated = true;
        self.default = FieldDefault::Empty;
        self
    }

    /// Fixed byte length, `None` for trailing fields
    pub const fn fixed_len(&self) -> Option<usize> {
        match self.len {
            FieldLen::Fixed(len) => Some(len),
            FieldLen::Trailing => None,
        }
    }
}

/// How the replies of a command group are numbered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCoding {
    /// Reply code is the request opcode plus one
    Next,
    /// Reply code echoes the request opcode
    Echo,
    /// The command gets no reply of its own
    None,
}

/// A command (or command group) at one level of the table
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    /// Command name, one path segment
    pub name: &'static str,
    /// Opcode byte at this level
    pub opcode: u8,
    /// Fields packed after the opcode prefix
    pub fields: &'static [FieldDef],
    /// Nested commands selected by the next opcode byte
    pub submenu: &'static [CommandDef],
    /// Numbering of this command's reply
    pub reply: ReplyCoding,
    /// Numbering of the submenu's replies
    pub submenu_reply: ReplyCoding,
}

impl CommandDef {
    /// Command answered at `opcode + 1`
    pub const fn new(name: &'static str, opcode: u8, fields: &'static [FieldDef]) -> Self {
        Self {
            name,
            opcode,
            fields,
            submenu: &[],
            reply: ReplyCoding::Next,
            submenu_reply: ReplyCoding::Next,
        }
    }

    /// Command group; its own reply entry is the submenu table
    pub const fn group(name: &'static str, opcode: u8, submenu: &'static [CommandDef]) -> Self {
        Self {
            name,
            opcode,
            fields: &[],
            submenu,
            reply: ReplyCoding::Next,
            submenu_reply: ReplyCoding::Next,
        }
    }

    /// Group-level fields used when the group is addressed without a sub-command
    pub const fn with_fields(mut self, fields: &'static [FieldDef]) -> Self {
        self.fields = fields;
        self
    }

    /// Submenu replies echo the request opcode
    pub const fn echoed_replies(mut self) -> Self {
        self.submenu_reply = ReplyCoding::Echo;
        self
    }

    /// No reply is defined for this command
    pub const fn no_reply(mut self) -> Self {
        self.reply = ReplyCoding::None;
        self
    }

    /// Whether the command has nested commands
    pub fn is_group(&self) -> bool {
        !self.submenu.is_empty()
    }
}

/// One candidate layout of a reply
#[derive(Debug, Clone, Copy)]
pub struct ShapeDef {
    /// Logical reply id, the name of the command it answers
    pub id: &'static str,
    /// Fields in wire order
    pub fields: &'static [FieldDef],
    /// Values reported for fields this layout does not carry
    pub implied: &'static [(&'static str, i64)],
}

impl ShapeDef {
    /// Reply layout
    pub const fn new(id: &'static str, fields: &'static [FieldDef]) -> Self {
        Self {
            id,
            fields,
            implied: &[],
        }
    }

    /// Report `implied` values alongside the decoded fields
    pub const fn implying(mut self, implied: &'static [(&'static str, i64)]) -> Self {
        self.implied = implied;
        self
    }

    /// Total fixed length, `None` if the shape ends in a trailing field
    pub fn fixed_len(&self) -> Option<usize> {
        self.fields.iter().map(FieldDef::fixed_len).sum()
    }
}

/// Body of a reply entry
#[derive(Debug, Clone, Copy)]
pub enum ReplyBody {
    /// Terminal reply with one or more candidate layouts, picked by length
    Shapes(&'static [ShapeDef]),
    /// Nested replies selected by the next byte
    Submenu(&'static [ReplyDef]),
}

/// A reply entry at one level of the table
#[derive(Debug, Clone, Copy)]
pub struct ReplyDef {
    /// Reply code byte at this level
    pub code: u8,
    /// Logical id of the entry
    pub id: &'static str,
    /// Layouts or nested table
    pub body: ReplyBody,
}

impl ReplyDef {
    /// Terminal reply; several shapes are told apart by payload length
    pub const fn new(code: u8, shapes: &'static [ShapeDef]) -> Self {
        Self {
            code,
            id: shapes[0].id,
            body: ReplyBody::Shapes(shapes),
        }
    }

    /// Reply group
    pub const fn group(code: u8, id: &'static str, submenu: &'static [ReplyDef]) -> Self {
        Self {
            code,
            id,
            body: ReplyBody::Submenu(submenu),
        }
    }
}

/// Schema table inconsistencies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Two commands share an opcode at the same level
    #[error("duplicate command opcode {opcode} at '{level}'")]
    DuplicateOpcode {
        /// Path of the level
        level: String,
        /// Repeated opcode
        opcode: u8,
    },

    /// Two commands share a name at the same level
    #[error("duplicate command name '{name}' at '{level}'")]
    DuplicateName {
        /// Path of the level
        level: String,
        /// Repeated name
        name: &'static str,
    },

    /// Two replies share a code at the same level
    #[error("duplicate reply code {code} at '{level}'")]
    DuplicateReply {
        /// Path of the level
        level: String,
        /// Repeated code
        code: u8,
    },

    /// A reply-bearing command has no reply at the expected code
    #[error("command '{command}' expects reply code {code}, none defined")]
    MissingReply {
        /// Command path
        command: String,
        /// Expected reply code
        code: u8,
    },

    /// The reply found for a command has the wrong kind or id
    #[error("command '{command}' reply code {code} does not match ('{found}')")]
    ReplyMismatch {
        /// Command path
        command: String,
        /// Reply code
        code: u8,
        /// Id found at that code
        found: &'static str,
    },

    /// A trailing field is not the last field
    #[error("trailing field '{field}' is not last in '{owner}'")]
    TrailingNotLast {
        /// Command or reply id
        owner: String,
        /// Offending field
        field: &'static str,
    },
}

/// Validated pair of command and reply tables
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    commands: &'static [CommandDef],
    replies: &'static [ReplyDef],
}

impl Catalog {
    /// Wrap tables without validation; call [`validate`](Self::validate) before use
    pub const fn new(commands: &'static [CommandDef], replies: &'static [ReplyDef]) -> Self {
        Self { commands, replies }
    }

    /// Top-level command table
    pub fn commands(&self) -> &'static [CommandDef] {
        self.commands
    }

    /// Top-level reply table
    pub fn replies(&self) -> &'static [ReplyDef] {
        self.replies
    }

    /// Resolve a `/`-separated command path into its definition and opcode prefix
    pub fn resolve(&self, path: &str) -> Option<(&'static CommandDef, smallvec::SmallVec<[u8; 4]>)> {
        let mut level = self.commands;
        let mut prefix = smallvec::SmallVec::new();
        let mut found = None;

        for segment in path.split('/') {
            let def = level.iter().find(|c| c.name == segment)?;
            prefix.push(def.opcode);
            level = def.submenu;
            found = Some(def);
        }

        found.map(|def| (def, prefix))
    }

    /// Check opcode uniqueness, field ordering, and request/reply code pairing
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_level("", self.commands, Some(self.replies), ReplyCoding::Next)?;
        validate_replies("", self.replies)
    }
}

fn validate_fields(owner: &str, fields: &[FieldDef]) -> Result<(), SchemaError> {
    if let Some(pos) = fields.iter().position(|f| f.len == FieldLen::Trailing) {
        if pos + 1 != fields.len() {
            return Err(SchemaError::TrailingNotLast {
                owner: owner.to_string(),
                field: fields[pos].name,
            });
        }
    }
    Ok(())
}

fn join(level: &str, name: &str) -> String {
    if level.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", level, name)
    }
}

fn validate_level(
    level: &str,
    commands: &'static [CommandDef],
    replies: Option<&'static [ReplyDef]>,
    coding: ReplyCoding,
) -> Result<(), SchemaError> {
    let mut opcodes = HashSet::new();
    let mut names = HashSet::new();

    for cmd in commands {
        let path = join(level, cmd.name);
        if !opcodes.insert(cmd.opcode) {
            return Err(SchemaError::DuplicateOpcode {
                level: level.to_string(),
                opcode: cmd.opcode,
            });
        }
        if !names.insert(cmd.name) {
            return Err(SchemaError::DuplicateName {
                level: level.to_string(),
                name: cmd.name,
            });
        }
        validate_fields(&path, cmd.fields)?;

        let code = match (cmd.reply, coding) {
            (ReplyCoding::None, _) | (_, ReplyCoding::None) => None,
            (_, ReplyCoding::Echo) => Some(cmd.opcode),
            (_, ReplyCoding::Next) => Some(cmd.opcode.wrapping_add(1)),
        };
        let reply = match (code, replies) {
            (Some(code), Some(table)) => {
                let reply = table
                    .iter()
                    .find(|r| r.code == code)
                    .ok_or(SchemaError::MissingReply {
                        command: path.clone(),
                        code,
                    })?;
                if reply.id != cmd.name {
                    return Err(SchemaError::ReplyMismatch {
                        command: path.clone(),
                        code,
                        found: reply.id,
                    });
                }
                Some(reply)
            }
            _ => None,
        };

        if cmd.is_group() {
            let sub_replies = match reply.map(|r| r.body) {
                Some(ReplyBody::Submenu(sub)) => Some(sub),
                Some(ReplyBody::Shapes(_)) => {
                    return Err(SchemaError::ReplyMismatch {
                        command: path,
                        code: code.unwrap_or_default(),
                        found: "terminal reply",
                    })
                }
                None => None,
            };
            validate_level(&path, cmd.submenu, sub_replies, cmd.submenu_reply)?;
        }
    }

    Ok(())
}

fn validate_replies(level: &str, replies: &'static [ReplyDef]) -> Result<(), SchemaError> {
    let mut codes = HashSet::new();
    for reply in replies {
        if !codes.insert(reply.code) {
            return Err(SchemaError::DuplicateReply {
                level: level.to_string(),
                code: reply.code,
            });
        }
        match reply.body {
            ReplyBody::Shapes(shapes) => {
                for shape in shapes {
                    validate_fields(&join(level, shape.id), shape.fields)?;
                }
            }
            ReplyBody::Submenu(sub) => validate_replies(&join(level, reply.id), sub)?,
        }
    }
    Ok(())
}

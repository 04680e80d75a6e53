//! Typed POSIX ACL values.
//!
//! `AceMode` is an `rwx` permission triple.  `FsAce` is one ACL entry as it
//! appears in `getfacl` output or `setfacl` input, including the optional
//! `default:` prefix.  `FileAcl` is the parsed ACL of one file.

use std::fmt;

use crate::error::{ModelError, ModelResult};

/// An `rwx` permission triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AceMode {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AceMode {
    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        AceMode {
            read,
            write,
            execute,
        }
    }

    pub fn rwx() -> Self {
        AceMode::new(true, true, true)
    }

    pub fn r_x() -> Self {
        AceMode::new(true, false, true)
    }

    pub fn none() -> Self {
        AceMode::new(false, false, false)
    }

    /// Traversal-only mode `--x`.
    pub fn x_only() -> Self {
        AceMode::new(false, false, true)
    }

    /// Parses exactly `[r-][w-][x-]`.
    pub fn parse(s: &str) -> ModelResult<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(ModelError::ConfigInvalid(format!("malformed mode `{s}`")));
        }
        let bit = |b: u8, on: u8| -> ModelResult<bool> {
            if b == on {
                Ok(true)
            } else if b == b'-' {
                Ok(false)
            } else {
                Err(ModelError::ConfigInvalid(format!("malformed mode `{s}`")))
            }
        };
        Ok(AceMode {
            read: bit(bytes[0], b'r')?,
            write: bit(bytes[1], b'w')?,
            execute: bit(bytes[2], b'x')?,
        })
    }

    /// Pointwise OR.  Commutative, associative, and idempotent.
    pub fn union(self, other: AceMode) -> AceMode {
        AceMode {
            read: self.read || other.read,
            write: self.write || other.write,
            execute: self.execute || other.execute,
        }
    }

    /// Clears the x-bit.  Used to derive file ACLs from directory ACLs.
    pub fn without_x(self) -> AceMode {
        AceMode {
            execute: false,
            ..self
        }
    }
}

impl fmt::Display for AceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

/// The subject of an ACL entry.  `User(None)` / `Group(None)` are the
/// anonymous owner and owning-group entries; `Some(name)` are named entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsTag {
    User(Option<String>),
    Group(Option<String>),
    Mask,
    Other,
}

/// One ACL entry in `setfacl`/`getfacl` text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsAce {
    pub default_entry: bool,
    pub tag: FsTag,
    pub mode: AceMode,
}

impl FsAce {
    pub fn named_group(name: &str, mode: AceMode) -> Self {
        FsAce {
            default_entry: false,
            tag: FsTag::Group(Some(name.to_string())),
            mode,
        }
    }

    /// Parses one ACE line: optional `default:`, then
    /// `user|group|mask|other`, an optional name (non-empty only for named
    /// user/group entries), and an `rwx` triple.
    pub fn parse(line: &str) -> ModelResult<Self> {
        let malformed = || ModelError::ConfigInvalid(format!("malformed ACL entry `{line}`"));

        let (default_entry, rest) = match line.strip_prefix("default:") {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (tag_str, name_mode) = rest.split_once(':').ok_or_else(malformed)?;
        let (name, mode_str) = name_mode.rsplit_once(':').ok_or_else(malformed)?;
        if name.contains(':') {
            return Err(malformed());
        }
        let mode = AceMode::parse(mode_str).map_err(|_| malformed())?;

        let name = if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
        let tag = match tag_str {
            "user" => FsTag::User(name),
            "group" => FsTag::Group(name),
            "mask" if name.is_none() => FsTag::Mask,
            "other" if name.is_none() => FsTag::Other,
            _ => return Err(malformed()),
        };

        Ok(FsAce {
            default_entry,
            tag,
            mode,
        })
    }

    pub fn is_named_group(&self) -> bool {
        matches!(self.tag, FsTag::Group(Some(_)))
    }

    pub fn is_named_group_normal(&self) -> bool {
        self.is_named_group() && !self.default_entry
    }

    pub fn is_named_group_default(&self) -> bool {
        self.is_named_group() && self.default_entry
    }

    /// The group name of a named group entry.
    pub fn group_name(&self) -> Option<&str> {
        match &self.tag {
            FsTag::Group(Some(name)) => Some(name),
            _ => None,
        }
    }

    pub fn without_x(&self) -> FsAce {
        FsAce {
            default_entry: self.default_entry,
            tag: self.tag.clone(),
            mode: self.mode.without_x(),
        }
    }
}

impl fmt::Display for FsAce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default_entry {
            write!(f, "default:")?;
        }
        let (tag, name) = match &self.tag {
            FsTag::User(name) => ("user", name.as_deref()),
            FsTag::Group(name) => ("group", name.as_deref()),
            FsTag::Mask => ("mask", None),
            FsTag::Other => ("other", None),
        };
        write!(f, "{tag}:{}:{}", name.unwrap_or(""), self.mode)
    }
}

/// The parsed ACL of one file, as read back from the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAcl {
    pub path: String,
    pub aces: Vec<FsAce>,
}

impl FileAcl {
    /// Named group entries, normal and default.
    pub fn named_group_entries(&self) -> Vec<&FsAce> {
        self.aces.iter().filter(|a| a.is_named_group()).collect()
    }

    /// Named group entries, normal only.
    pub fn named_group_normal_entries(&self) -> Vec<&FsAce> {
        self.aces
            .iter()
            .filter(|a| a.is_named_group_normal())
            .collect()
    }
}

/// Parses `getfacl` output that may describe multiple files.  File blocks
/// are separated by blank lines; each begins with a `# file:` header.
/// Other comment lines are skipped.
pub fn parse_getfacl_output(text: &str) -> ModelResult<Vec<FileAcl>> {
    let mut acls = Vec::new();
    for block in split_paragraphs(text.trim()) {
        acls.push(parse_getfacl_block(&block)?);
    }
    Ok(acls)
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

fn parse_getfacl_block(block: &str) -> ModelResult<FileAcl> {
    let mut lines = block.lines();
    let head = lines
        .next()
        .ok_or_else(|| ModelError::ConfigInvalid("getfacl text too short".to_string()))?;
    let path = head
        .strip_prefix("# file: ")
        .ok_or_else(|| ModelError::ConfigInvalid("missing ACL file header".to_string()))?
        .to_string();

    let mut aces = Vec::new();
    for line in lines {
        if line.starts_with('#') {
            continue;
        }
        aces.push(FsAce::parse(line)?);
    }

    Ok(FileAcl { path, aces })
}

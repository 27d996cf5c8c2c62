//! Textual manifest format.
//!
//! The manifest is the canonical intermediate artifact between the code
//! generator and the native backend: a line-oriented serialization of
//! MISA slots plus directives for labels, data, and padding. Comments
//! start with `;` or `#` and run to end of line.
//!
//! Label references inside `bytes` lines store the index of the label's
//! defining directive counted from the top of the file, so a parse
//! pre-scan over `label` and `shared` directives rebuilds the id space
//! without any side table.

use core::fmt;
use std::collections::HashMap;

use crate::{op, Instruction, InvalidOpcode, LabelId, Opcode, Word};

/// Value type of a `shared` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedType {
    /// 64-bit signed integer cell.
    Int,
    /// IEEE-754 binary64 cell.
    Float,
}

impl SharedType {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

impl fmt::Display for SharedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One manifest line with semantic content.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Defines a label at the current position.
    Label(LabelId),
    /// Emits a 16-byte instruction slot.
    Instr(Instruction),
    /// Emits a byte sequence (UTF-8 with escapes in the text form).
    Ascii(Vec<u8>),
    /// Pads with zero bytes up to the given alignment.
    Pad(Word),
    /// Declares an 8-byte shared variable slot with its initial value.
    Shared {
        /// Label bound to the slot's address.
        label: LabelId,
        /// Cell type.
        ty: SharedType,
        /// Initial value as raw bits.
        value: Word,
    },
}

/// Errors produced while serializing or parsing a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Two labels share a name.
    #[error("duplicate label `{0}`")]
    DuplicateLabel(String),
    /// A referenced label has no defining directive.
    #[error("label `{0}` is referenced but never defined")]
    UndefinedLabel(String),
    /// A `bytes` reference names a label id outside the table.
    #[error("line {line}: label id {id} out of range")]
    LabelOutOfRange {
        /// 1-based source line.
        line: usize,
        /// The out-of-range id.
        id: LabelId,
    },
    /// A wide-immediate instruction is missing its payload line.
    #[error("line {0}: expected a payload `bytes` line")]
    MissingPayload(usize),
    /// An unknown opcode byte in a `bytes` line.
    #[error("line {line}: {source}")]
    Opcode {
        /// 1-based source line.
        line: usize,
        /// Offending byte.
        source: InvalidOpcode,
    },
    /// A string directive holds non-UTF-8 bytes.
    #[error("ascii directive holds non-UTF-8 bytes")]
    NonUtf8,
    /// Any other malformed line.
    #[error("line {line}: {message}")]
    Syntax {
        /// 1-based source line.
        line: usize,
        /// Description of the problem.
        message: String,
    },
}

/// A compiled module in manifest form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    /// ISA profile identifier (the `header` directive).
    pub header: String,
    /// Informational base offset (the `org` directive).
    pub org: Word,
    labels: Vec<String>,
    /// Directives in file order.
    pub directives: Vec<Directive>,
}

impl Manifest {
    /// An empty manifest with the given profile identifier.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            org: 0,
            labels: Vec::new(),
            directives: Vec::new(),
        }
    }

    /// Registers a fresh label name and returns its id.
    pub fn fresh_label(&mut self, name: impl Into<String>) -> LabelId {
        let id = self.labels.len() as LabelId;
        self.labels.push(name.into());
        id
    }

    /// Name of a label id.
    pub fn label_name(&self, id: LabelId) -> Option<&str> {
        self.labels.get(id as usize).map(String::as_str)
    }

    /// The flat label table.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Looks up a label id by name.
    pub fn find_label(&self, name: &str) -> Option<LabelId> {
        self.labels
            .iter()
            .position(|l| l == name)
            .map(|i| i as LabelId)
    }

    /// Appends a directive.
    pub fn push(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    /// Shorthand for pushing an instruction slot.
    pub fn push_instr(&mut self, instr: Instruction) {
        self.directives.push(Directive::Instr(instr));
    }

    /// Shorthand for pushing a label definition.
    pub fn place_label(&mut self, label: LabelId) {
        self.directives.push(Directive::Label(label));
    }

    fn mapped(
        &self,
        order: &HashMap<LabelId, LabelId>,
        id: LabelId,
    ) -> Result<LabelId, ManifestError> {
        order.get(&id).copied().ok_or_else(|| {
            ManifestError::UndefinedLabel(
                self.label_name(id)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("#{id}")),
            )
        })
    }

    /// Maps in-memory label ids to definition order, erroring on
    /// duplicates.
    fn definition_order(&self) -> Result<HashMap<LabelId, LabelId>, ManifestError> {
        let mut seen = HashMap::new();
        let mut order = HashMap::new();
        for directive in &self.directives {
            let id = match directive {
                Directive::Label(id) => *id,
                Directive::Shared { label, .. } => *label,
                _ => continue,
            };
            let name = self
                .label_name(id)
                .ok_or_else(|| ManifestError::UndefinedLabel(format!("#{id}")))?;
            if seen.insert(name.to_owned(), ()).is_some() {
                return Err(ManifestError::DuplicateLabel(name.to_owned()));
            }
            order.insert(id, order.len() as LabelId);
        }
        Ok(order)
    }

    /// Serializes to the textual form.
    pub fn serialize(&self) -> Result<String, ManifestError> {
        let order = self.definition_order()?;
        let mut out = String::new();

        out.push_str(&format!("header {}\n", self.header));
        out.push_str(&format!("org 0x{:x}\n", self.org));

        for directive in &self.directives {
            match directive {
                Directive::Label(id) => {
                    let name = self
                        .label_name(*id)
                        .ok_or_else(|| ManifestError::UndefinedLabel(format!("#{id}")))?;
                    out.push_str(&format!("label {name}\n"));
                }
                Directive::Instr(instr) => {
                    let mut renumbered = *instr;
                    if let Some(target) = instr.label() {
                        renumbered.set_label(self.mapped(&order, target)?);
                    }
                    if renumbered.opcode() == Opcode::HALT {
                        out.push_str("halt\n");
                        continue;
                    }
                    let comment = match instr.label() {
                        Some(target) => format!(
                            "{renumbered} ({})",
                            self.label_name(target).unwrap_or("?")
                        ),
                        None => format!("{renumbered}"),
                    };
                    out.push_str(&format!(
                        "bytes 0x{:016X} ; {comment}\n",
                        renumbered.low_word()
                    ));
                    if renumbered.has_payload() {
                        out.push_str(&format!("bytes 0x{:016X} ; imm64\n", renumbered.payload()));
                    }
                }
                Directive::Ascii(bytes) => {
                    let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::NonUtf8)?;
                    out.push_str(&format!("ascii \"{}\"\n", escape(text)));
                }
                Directive::Pad(align) => out.push_str(&format!("pad 0x{align:x}\n")),
                Directive::Shared { label, ty, value } => {
                    let name = self
                        .label_name(*label)
                        .ok_or_else(|| ManifestError::UndefinedLabel(format!("#{label}")))?;
                    let rendered = match ty {
                        SharedType::Int => format!("{}", *value as i64),
                        SharedType::Float => format!("{}", f64::from_bits(*value)),
                    };
                    out.push_str(&format!("shared {name} {ty} {rendered}\n"));
                }
            }
        }

        Ok(out)
    }

    /// Renumbers label ids to definition order, the numbering a parse of
    /// the serialized form produces.
    pub fn normalize(&self) -> Result<Self, ManifestError> {
        let order = self.definition_order()?;
        let mut labels = vec![String::new(); order.len()];
        for (old, new) in &order {
            labels[*new as usize] = self
                .label_name(*old)
                .ok_or_else(|| ManifestError::UndefinedLabel(format!("#{old}")))?
                .to_owned();
        }
        let mut directives = Vec::with_capacity(self.directives.len());
        for directive in &self.directives {
            directives.push(match directive {
                Directive::Label(id) => Directive::Label(order[id]),
                Directive::Shared { label, ty, value } => Directive::Shared {
                    label: order[label],
                    ty: *ty,
                    value: *value,
                },
                Directive::Instr(instr) => {
                    let mut renumbered = *instr;
                    if let Some(target) = instr.label() {
                        renumbered.set_label(self.mapped(&order, target)?);
                    }
                    Directive::Instr(renumbered)
                }
                other => other.clone(),
            });
        }
        Ok(Self {
            header: self.header.clone(),
            org: self.org,
            labels,
            directives,
        })
    }

    /// Parses the textual form.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest = Manifest::default();
        let mut names = HashMap::new();

        // Pre-scan: the label table in definition order.
        for (idx, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            let mut words = line.split_whitespace();
            match words.next() {
                Some("label") | Some("shared") => {
                    let name = words.next().ok_or_else(|| ManifestError::Syntax {
                        line: idx + 1,
                        message: "missing label name".into(),
                    })?;
                    if names
                        .insert(name.to_owned(), manifest.labels.len() as LabelId)
                        .is_some()
                    {
                        return Err(ManifestError::DuplicateLabel(name.to_owned()));
                    }
                    manifest.labels.push(name.to_owned());
                }
                _ => {}
            }
        }

        let mut lines = text.lines().enumerate();
        while let Some((idx, raw)) = lines.next() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim().to_owned();
            if line.is_empty() {
                continue;
            }
            let (word, rest) = match line.split_once(char::is_whitespace) {
                Some((w, r)) => (w, r.trim()),
                None => (line.as_str(), ""),
            };
            match word {
                "header" => manifest.header = rest.to_owned(),
                "org" => manifest.org = parse_word(rest, line_no)?,
                "halt" => manifest.push_instr(op::halt()),
                "label" => {
                    let id = names[rest.split_whitespace().next().unwrap_or(rest)];
                    manifest.place_label(id);
                }
                "bytes" => {
                    let lo = parse_word(rest, line_no)?;
                    let mut instr = Instruction::from_words(lo, 0)
                        .map_err(|source| ManifestError::Opcode { line: line_no, source })?;
                    if instr.has_payload() {
                        let mut payload = None;
                        for (pidx, praw) in lines.by_ref() {
                            let pline = strip_comment(praw).trim();
                            if pline.is_empty() {
                                continue;
                            }
                            let rest = pline
                                .strip_prefix("bytes")
                                .map(str::trim)
                                .ok_or(ManifestError::MissingPayload(pidx + 1))?;
                            payload = Some(parse_word(rest, pidx + 1)?);
                            break;
                        }
                        let payload = payload.ok_or(ManifestError::MissingPayload(line_no))?;
                        instr = Instruction::from_words(lo, payload)
                            .map_err(|source| ManifestError::Opcode { line: line_no, source })?;
                    }
                    if let Some(target) = instr.label() {
                        if target as usize >= manifest.labels.len() {
                            return Err(ManifestError::LabelOutOfRange {
                                line: line_no,
                                id: target,
                            });
                        }
                    }
                    manifest.push_instr(instr);
                }
                "ascii" => {
                    let bytes = unescape(rest, line_no)?;
                    manifest.push(Directive::Ascii(bytes));
                }
                "pad" => {
                    let align = parse_word(rest, line_no)?;
                    manifest.push(Directive::Pad(align));
                }
                "shared" => {
                    let mut words = rest.split_whitespace();
                    let name = words.next().ok_or_else(|| ManifestError::Syntax {
                        line: line_no,
                        message: "missing shared name".into(),
                    })?;
                    let ty = match words.next() {
                        Some("int") => SharedType::Int,
                        Some("float") => SharedType::Float,
                        other => {
                            return Err(ManifestError::Syntax {
                                line: line_no,
                                message: format!("bad shared type {other:?}"),
                            })
                        }
                    };
                    let literal = words.next().ok_or_else(|| ManifestError::Syntax {
                        line: line_no,
                        message: "missing shared value".into(),
                    })?;
                    let value = match ty {
                        SharedType::Int => literal
                            .parse::<i64>()
                            .map(|v| v as Word)
                            .map_err(|e| ManifestError::Syntax {
                                line: line_no,
                                message: format!("bad int literal `{literal}`: {e}"),
                            })?,
                        SharedType::Float => literal
                            .parse::<f64>()
                            .map(f64::to_bits)
                            .map_err(|e| ManifestError::Syntax {
                                line: line_no,
                                message: format!("bad float literal `{literal}`: {e}"),
                            })?,
                    };
                    let label = names[name];
                    manifest.push(Directive::Shared { label, ty, value });
                }
                other => {
                    return Err(ManifestError::Syntax {
                        line: line_no,
                        message: format!("unknown directive `{other}`"),
                    })
                }
            }
        }

        Ok(manifest)
    }
}

fn parse_word(text: &str, line: usize) -> Result<Word, ManifestError> {
    let text = text.split_whitespace().next().unwrap_or(text);
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"));
    match digits {
        Some(d) => Word::from_str_radix(d, 16),
        None => text.parse(),
    }
    .map_err(|e| ManifestError::Syntax {
        line,
        message: format!("bad number `{text}`: {e}"),
    })
}

/// Strips a `;` or `#` comment, honoring double quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (pos, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' | '#' if !in_string => return &line[..pos],
            _ => {}
        }
    }
    line
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\0' => out.push_str("\\0"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(text: &str, line: usize) -> Result<Vec<u8>, ManifestError> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| ManifestError::Syntax {
            line,
            message: "ascii directive must be double-quoted".into(),
        })?;
    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('0') => out.push(0),
            other => {
                return Err(ManifestError::Syntax {
                    line,
                    message: format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                })
            }
        }
    }
    Ok(out)
}
